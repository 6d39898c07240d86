//! Type-erased workflow handlers and their registry
//!
//! The engine's moving parts (repository, runner, executor) work with
//! workflows through [`WorkflowHandler`], which erases the typed
//! [`Workflow`] payloads to JSON. The registry maps workflow type names to
//! handlers so a single runtime can host many types.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde_json::Value;

use super::definition::{DecideContext, Decision, Rejection, TypeTag, UpcastError, Workflow};
use super::event::{CommandEnvelope, DelayRequest, EventRecord, NewEvent};
use super::state::InstanceState;
use super::subscription::Subscription;

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Workflow type not registered.
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    /// Two registrations under the same name.
    #[error("workflow type registered twice: {0}")]
    DuplicateWorkflowType(String),
}

/// Why `decide` did not produce events.
#[derive(Debug, thiserror::Error)]
pub enum DecideError {
    /// Business rejection, returned to the caller as-is.
    #[error(transparent)]
    Rejected(#[from] Rejection),

    /// State or command payload failed to decode.
    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// The erased result of a successful `decide`: encoded domain events plus
/// the side-table requests the repository folds into system events.
#[derive(Debug, Clone)]
pub struct DecidedBatch {
    pub events: Vec<NewEvent>,
    pub subscribe: Vec<Subscription>,
    pub unsubscribe: Vec<Subscription>,
    pub delays: Vec<DelayRequest>,
    pub cancel_delays: Vec<String>,
    /// Whether any decided event is final for the instance.
    pub is_final: bool,
}

impl DecidedBatch {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
            && self.subscribe.is_empty()
            && self.unsubscribe.is_empty()
            && self.delays.is_empty()
            && self.cancel_delays.is_empty()
    }
}

/// Type-erased workflow interface.
///
/// All payloads are JSON at this boundary; [`TypedHandler`] adapts a
/// [`Workflow`] implementation by encoding/decoding at the edges.
pub trait WorkflowHandler: Send + Sync + 'static {
    /// The workflow type name.
    fn workflow_type(&self) -> &'static str;

    /// Current event schema version.
    fn schema_version(&self) -> i32;

    /// Serialized default state for a not-yet-created instance.
    fn initial_state(&self) -> Value;

    /// Run the pure decision function against erased payloads.
    fn decide(
        &self,
        instance: &InstanceState,
        command: &CommandEnvelope,
    ) -> Result<DecidedBatch, DecideError>;

    /// Fold one domain event body into the user state.
    fn evolve(&self, state: Value, event_type: &str, body: &Value) -> Result<Value, String>;

    /// Convert a consumed event into a command for subscribers of this type.
    fn event_to_command(
        &self,
        consumed: &EventRecord,
    ) -> Result<Option<CommandEnvelope>, serde_json::Error>;

    /// Whether the event ends the instance's business lifecycle.
    fn is_final_event(&self, event: &EventRecord) -> bool;

    /// Migrate an event body to the current schema version.
    fn upcast(&self, event_type: &str, from_version: i32, body: Value)
        -> Result<Value, UpcastError>;

    /// Tags to stamp onto appended events, derived from post-decision state.
    fn tags(&self, state: &Value) -> BTreeMap<String, String>;
}

/// Adapter implementing [`WorkflowHandler`] for any [`Workflow`].
pub struct TypedHandler<W: Workflow> {
    _marker: PhantomData<fn() -> W>,
}

impl<W: Workflow> TypedHandler<W> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<W: Workflow> Default for TypedHandler<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Workflow> WorkflowHandler for TypedHandler<W> {
    fn workflow_type(&self) -> &'static str {
        W::TYPE
    }

    fn schema_version(&self) -> i32 {
        W::SCHEMA_VERSION
    }

    fn initial_state(&self) -> Value {
        serde_json::to_value(W::State::default()).unwrap_or(Value::Null)
    }

    fn decide(
        &self,
        instance: &InstanceState,
        command: &CommandEnvelope,
    ) -> Result<DecidedBatch, DecideError> {
        let state: W::State = serde_json::from_value(instance.state.clone())?;
        let typed: W::Command = serde_json::from_value(command.body.clone())?;
        let ctx = DecideContext {
            workflow_id: &instance.workflow_id,
            version: instance.version,
            lifecycle: instance.lifecycle,
        };

        let decision: Decision<W::Event> = W::decide(&state, &ctx, typed)?;
        let is_final = decision.events.iter().any(W::is_final_event);

        let mut events = Vec::with_capacity(decision.events.len());
        for event in &decision.events {
            events.push(NewEvent::new(
                event.type_tag().to_string(),
                W::SCHEMA_VERSION,
                serde_json::to_value(event)?,
            ));
        }

        Ok(DecidedBatch {
            events,
            subscribe: decision.subscribe,
            unsubscribe: decision.unsubscribe,
            delays: decision.delays,
            cancel_delays: decision.cancel_delays,
            is_final,
        })
    }

    fn evolve(&self, state: Value, event_type: &str, body: &Value) -> Result<Value, String> {
        let typed_state: W::State = serde_json::from_value(state)
            .map_err(|e| format!("state decode failed: {e}"))?;
        let event: W::Event = serde_json::from_value(body.clone())
            .map_err(|e| format!("event {event_type} decode failed: {e}"))?;
        let next = W::evolve(typed_state, &event);
        serde_json::to_value(next).map_err(|e| format!("state encode failed: {e}"))
    }

    fn event_to_command(
        &self,
        consumed: &EventRecord,
    ) -> Result<Option<CommandEnvelope>, serde_json::Error> {
        match W::event_to_command(consumed) {
            Some(command) => Ok(Some(CommandEnvelope::encode(&command)?)),
            None => Ok(None),
        }
    }

    fn is_final_event(&self, event: &EventRecord) -> bool {
        if event.is_system() {
            return false;
        }
        match serde_json::from_value::<W::Event>(event.body.clone()) {
            Ok(typed) => W::is_final_event(&typed),
            Err(_) => false,
        }
    }

    fn upcast(
        &self,
        event_type: &str,
        from_version: i32,
        body: Value,
    ) -> Result<Value, UpcastError> {
        W::upcast(event_type, from_version, body)
    }

    fn tags(&self, state: &Value) -> BTreeMap<String, String> {
        match serde_json::from_value::<W::State>(state.clone()) {
            Ok(typed) => W::tags(&typed),
            Err(_) => BTreeMap::new(),
        }
    }
}

impl CommandEnvelope {
    /// Encode a typed command into an envelope.
    pub fn encode<C: TypeTag + serde::Serialize>(
        command: &C,
    ) -> Result<CommandEnvelope, serde_json::Error> {
        Ok(CommandEnvelope {
            command_type: command.type_tag().to_string(),
            body: serde_json::to_value(command)?,
        })
    }
}

/// Registry of workflow handlers, keyed by type name.
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Arc<dyn WorkflowHandler>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a workflow type. Registering the same name twice is a
    /// configuration error.
    pub fn register<W: Workflow>(&mut self) -> Result<(), RegistryError> {
        let handler: Arc<dyn WorkflowHandler> = Arc::new(TypedHandler::<W>::new());
        self.insert(handler)
    }

    /// Register an already-erased handler (useful for dynamic setups).
    pub fn insert(&mut self, handler: Arc<dyn WorkflowHandler>) -> Result<(), RegistryError> {
        let name = handler.workflow_type();
        if self.handlers.contains_key(name) {
            return Err(RegistryError::DuplicateWorkflowType(name.to_string()));
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    pub fn get(&self, workflow_type: &str) -> Result<Arc<dyn WorkflowHandler>, RegistryError> {
        self.handlers
            .get(workflow_type)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownWorkflowType(workflow_type.to_string()))
    }

    pub fn contains(&self, workflow_type: &str) -> bool {
        self.handlers.contains_key(workflow_type)
    }

    pub fn workflow_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("workflow_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::workflow::event::WorkflowId;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub(crate) struct NoopState;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub(crate) enum NoopCommand {
        #[serde(rename = "noop")]
        Noop,
    }

    impl TypeTag for NoopCommand {
        fn type_tag(&self) -> &str {
            "noop"
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub(crate) enum NoopEvent {
        #[serde(rename = "nooped")]
        Nooped,
    }

    impl TypeTag for NoopEvent {
        fn type_tag(&self) -> &str {
            "nooped"
        }
    }

    pub(crate) struct NoopWorkflow;

    impl Workflow for NoopWorkflow {
        const TYPE: &'static str = "noop";
        type State = NoopState;
        type Command = NoopCommand;
        type Event = NoopEvent;

        fn decide(
            _state: &NoopState,
            _ctx: &DecideContext<'_>,
            _command: NoopCommand,
        ) -> Result<Decision<NoopEvent>, Rejection> {
            Ok(Decision::events(vec![NoopEvent::Nooped]))
        }

        fn evolve(state: NoopState, _event: &NoopEvent) -> NoopState {
            state
        }
    }

    /// A handler whose user state never changes; used by evolve-wrapper tests.
    pub(crate) fn noop_handler() -> Arc<dyn WorkflowHandler> {
        struct Passthrough;

        impl WorkflowHandler for Passthrough {
            fn workflow_type(&self) -> &'static str {
                "test"
            }

            fn schema_version(&self) -> i32 {
                1
            }

            fn initial_state(&self) -> Value {
                Value::Null
            }

            fn decide(
                &self,
                _instance: &InstanceState,
                _command: &CommandEnvelope,
            ) -> Result<DecidedBatch, DecideError> {
                Ok(DecidedBatch {
                    events: Vec::new(),
                    subscribe: Vec::new(),
                    unsubscribe: Vec::new(),
                    delays: Vec::new(),
                    cancel_delays: Vec::new(),
                    is_final: false,
                })
            }

            fn evolve(
                &self,
                state: Value,
                _event_type: &str,
                _body: &Value,
            ) -> Result<Value, String> {
                Ok(state)
            }

            fn event_to_command(
                &self,
                _consumed: &EventRecord,
            ) -> Result<Option<CommandEnvelope>, serde_json::Error> {
                Ok(None)
            }

            fn is_final_event(&self, _event: &EventRecord) -> bool {
                false
            }

            fn upcast(
                &self,
                _event_type: &str,
                _from_version: i32,
                body: Value,
            ) -> Result<Value, UpcastError> {
                Ok(body)
            }

            fn tags(&self, _state: &Value) -> BTreeMap<String, String> {
                BTreeMap::new()
            }
        }

        Arc::new(Passthrough)
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = HandlerRegistry::new();
        registry.register::<NoopWorkflow>().unwrap();

        assert!(registry.contains("noop"));
        assert!(!registry.contains("unknown"));
        assert_eq!(registry.len(), 1);

        let handler = registry.get("noop").unwrap();
        assert_eq!(handler.workflow_type(), "noop");
    }

    #[test]
    fn test_duplicate_registration() {
        let mut registry = HandlerRegistry::new();
        registry.register::<NoopWorkflow>().unwrap();
        let result = registry.register::<NoopWorkflow>();
        assert!(matches!(
            result,
            Err(RegistryError::DuplicateWorkflowType(_))
        ));
    }

    #[test]
    fn test_unknown_workflow_type() {
        let registry = HandlerRegistry::new();
        let result = registry.get("unknown");
        assert!(matches!(result, Err(RegistryError::UnknownWorkflowType(_))));
    }

    #[test]
    fn test_typed_decide_encodes_events() {
        let handler = TypedHandler::<NoopWorkflow>::new();
        let instance = InstanceState::new(WorkflowId::new("w-1"), handler.initial_state());
        let command = CommandEnvelope::new("noop", json!({"type": "noop"}));

        let batch = handler.decide(&instance, &command).unwrap();
        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.events[0].event_type, "nooped");
        assert_eq!(batch.events[0].schema_version, 1);
        assert_eq!(batch.events[0].body["type"], "nooped");
    }

    #[test]
    fn test_decide_bad_command_is_codec_error() {
        let handler = TypedHandler::<NoopWorkflow>::new();
        let instance = InstanceState::new(WorkflowId::new("w-1"), handler.initial_state());
        let command = CommandEnvelope::new("noop", json!({"type": "unheard-of"}));

        let result = handler.decide(&instance, &command);
        assert!(matches!(result, Err(DecideError::Codec(_))));
    }
}
