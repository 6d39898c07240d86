//! Workflow trait definition

use std::collections::BTreeMap;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use super::event::{DelayRequest, EventRecord, WorkflowId};
use super::state::Lifecycle;
use super::subscription::Subscription;

/// A business rejection produced by `decide`.
///
/// Rejections are answers, not failures: the engine returns them to the
/// caller and never retries them. Idempotent no-op rejections are also what
/// terminates subscription cycles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{reason}")]
pub struct Rejection {
    pub reason: String,
}

impl Rejection {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// An event body could not be migrated to the current schema version.
///
/// Fatal for the affected workflow; never auto-retried.
#[derive(Debug, Clone, thiserror::Error)]
#[error("cannot upcast {event_type} from schema version {from_version}: {message}")]
pub struct UpcastError {
    pub event_type: String,
    pub from_version: i32,
    pub message: String,
}

impl UpcastError {
    pub fn new(event_type: impl Into<String>, from_version: i32, message: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            from_version,
            message: message.into(),
        }
    }
}

/// Payloads the engine stores but does not interpret.
///
/// The tag becomes the `event_type` / `command_type` discriminator column;
/// the serialized value becomes the body. Tagged serde enums return their
/// variant tag here.
pub trait TypeTag {
    fn type_tag(&self) -> &str;
}

/// What `decide` returns on success: domain events plus typed requests for
/// the engine-owned side tables. The repository turns requests into system
/// events appended in the same transaction as the domain events.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision<E> {
    pub events: Vec<E>,
    pub subscribe: Vec<Subscription>,
    pub unsubscribe: Vec<Subscription>,
    pub delays: Vec<DelayRequest>,
    pub cancel_delays: Vec<String>,
}

impl<E> Decision<E> {
    /// Decision carrying only domain events.
    pub fn events(events: Vec<E>) -> Self {
        Self {
            events,
            subscribe: Vec::new(),
            unsubscribe: Vec::new(),
            delays: Vec::new(),
            cancel_delays: Vec::new(),
        }
    }

    /// Decision with nothing to append. `decide` returning this is a no-op,
    /// not a rejection.
    pub fn none() -> Self {
        Self::events(Vec::new())
    }

    pub fn with_subscribe(mut self, subscription: Subscription) -> Self {
        self.subscribe.push(subscription);
        self
    }

    pub fn with_unsubscribe(mut self, subscription: Subscription) -> Self {
        self.unsubscribe.push(subscription);
        self
    }

    pub fn with_delay(mut self, request: DelayRequest) -> Self {
        self.delays.push(request);
        self
    }

    pub fn with_cancel_delay(mut self, schedule_id: impl Into<String>) -> Self {
        self.cancel_delays.push(schedule_id.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
            && self.subscribe.is_empty()
            && self.unsubscribe.is_empty()
            && self.delays.is_empty()
            && self.cancel_delays.is_empty()
    }
}

/// Read-only facts about the instance handed to `decide` alongside the
/// user state.
#[derive(Debug, Clone)]
pub struct DecideContext<'a> {
    pub workflow_id: &'a WorkflowId,
    pub version: i64,
    pub lifecycle: Lifecycle,
}

/// A workflow type: pure functions over commands, events and state.
///
/// `decide` validates a command against current state and emits events;
/// `evolve` folds one event into state. Both must be pure; all side effects
/// live in [`Adapter`](crate::activity::Adapter) implementations.
///
/// # Example
///
/// ```ignore
/// struct OrderWorkflow;
///
/// impl Workflow for OrderWorkflow {
///     const TYPE: &'static str = "order";
///     type State = OrderState;
///     type Command = OrderCommand;
///     type Event = OrderEvent;
///
///     fn decide(
///         state: &OrderState,
///         _ctx: &DecideContext<'_>,
///         command: OrderCommand,
///     ) -> Result<Decision<OrderEvent>, Rejection> {
///         match command {
///             OrderCommand::Pay { .. } if state.paid => {
///                 Err(Rejection::new("already paid"))
///             }
///             OrderCommand::Pay { payment_id } => Ok(Decision::events(vec![
///                 OrderEvent::PaymentReceived { payment_id },
///             ])),
///             // ...
///         }
///     }
///
///     fn evolve(mut state: OrderState, event: &OrderEvent) -> OrderState {
///         // fold one event
///         state
///     }
/// }
/// ```
pub trait Workflow: Send + Sync + 'static {
    /// Unique name of this workflow type; part of every event row.
    const TYPE: &'static str;

    /// Current schema version of this type's event bodies. Bump together
    /// with a matching `upcast` arm when an event's shape changes.
    const SCHEMA_VERSION: i32 = 1;

    /// User-defined state. `Default` supplies the pre-first-event value.
    type State: Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static;

    /// Command payload; the tag becomes the envelope's `command_type`.
    type Command: TypeTag + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Event payload; the tag becomes the record's `event_type`.
    type Event: TypeTag + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Validate a command against current state. Pure.
    fn decide(
        state: &Self::State,
        ctx: &DecideContext<'_>,
        command: Self::Command,
    ) -> Result<Decision<Self::Event>, Rejection>;

    /// Fold one domain event into state. Pure, total.
    fn evolve(state: Self::State, event: &Self::Event) -> Self::State;

    /// Re-materialize a consumed event as a command for a subscribing
    /// instance of this type. The consumed event usually belongs to another
    /// workflow type; `None` means "not interested after all".
    fn event_to_command(consumed: &EventRecord) -> Option<Self::Command> {
        let _ = consumed;
        None
    }

    /// Whether this event ends the instance's business lifecycle. Purely
    /// informational: final instances simply stop producing commands.
    fn is_final_event(event: &Self::Event) -> bool {
        let _ = event;
        false
    }

    /// Migrate an event body from an older schema version to
    /// `SCHEMA_VERSION`. Runs during load for every stored event whose
    /// version is behind. The default accepts bodies unchanged.
    fn upcast(event_type: &str, from_version: i32, body: Value) -> Result<Value, UpcastError> {
        let _ = (event_type, from_version);
        Ok(body)
    }

    /// Tags injected into the metadata of every event appended for this
    /// instance, derived from post-decision state.
    fn tags(state: &Self::State) -> BTreeMap<String, String> {
        let _ = state;
        BTreeMap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_display() {
        let rejection = Rejection::new("already paid");
        assert_eq!(rejection.to_string(), "already paid");
    }

    #[test]
    fn test_upcast_error_display() {
        let err = UpcastError::new("order.placed", 1, "field renamed");
        assert!(err.to_string().contains("order.placed"));
        assert!(err.to_string().contains("schema version 1"));
    }

    #[test]
    fn test_decision_builders() {
        let decision: Decision<()> = Decision::none()
            .with_subscribe(Subscription::new("payment.completed", "B"))
            .with_cancel_delay("timer-1");

        assert!(decision.events.is_empty());
        assert_eq!(decision.subscribe.len(), 1);
        assert_eq!(decision.cancel_delays, vec!["timer-1".to_string()]);
        assert!(!decision.is_empty());
        assert!(Decision::<()>::none().is_empty());
    }
}
