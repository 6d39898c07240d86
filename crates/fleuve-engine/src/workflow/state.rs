//! Materialized instance state and the framework evolve wrapper

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::event::{EventRecord, NewEvent, SystemEvent, WorkflowId};
use super::registry::WorkflowHandler;
use super::subscription::Subscription;
use super::UpcastError;

/// Lifecycle of a workflow instance.
///
/// `Paused` rejects all non-system commands, `Cancelled` rejects all
/// commands; both still accept `resume` and reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Active,
    Paused,
    Cancelled,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Errors from folding an event into instance state.
#[derive(Debug, thiserror::Error)]
pub enum EvolveError {
    /// A system event's body did not decode.
    #[error("malformed system event {event_type}: {source}")]
    MalformedSystemEvent {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    /// The user evolve function failed to decode its state or event.
    #[error("evolve failed for event {event_type}: {message}")]
    User { event_type: String, message: String },

    /// An event could not be migrated to the current schema version.
    #[error(transparent)]
    Upcast(#[from] UpcastError),
}

/// The engine's view of one workflow instance: the fold of its event log.
///
/// `version` counts every appended event, system events included. `state` is
/// the user-defined portion, kept as opaque JSON at this layer; typed
/// workflows decode it on the way into `decide`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceState {
    pub workflow_id: WorkflowId,
    pub version: i64,
    pub lifecycle: Lifecycle,
    pub subscriptions: BTreeSet<Subscription>,
    pub state: Value,
}

impl InstanceState {
    /// Fresh instance at version 0 with the workflow type's initial state.
    pub fn new(workflow_id: WorkflowId, initial_state: Value) -> Self {
        Self {
            workflow_id,
            version: 0,
            lifecycle: Lifecycle::Active,
            subscriptions: BTreeSet::new(),
            state: initial_state,
        }
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle == Lifecycle::Active
    }

    /// Fold one committed event into this state.
    ///
    /// System events mutate lifecycle and subscriptions here; domain events
    /// are upcast to the handler's current schema version and handed to user
    /// `evolve`. The version is taken from the record, which keeps replay
    /// honest about what the store committed.
    pub fn apply_record(
        &mut self,
        record: &EventRecord,
        handler: &dyn WorkflowHandler,
    ) -> Result<(), EvolveError> {
        self.apply_parts(
            &record.event_type,
            record.schema_version,
            &record.body,
            record.workflow_version,
            handler,
        )
    }

    /// Fold a not-yet-committed event, assigning the next local version.
    ///
    /// Used by the repository to compute the post-append state before the
    /// append commits.
    pub fn apply_new(
        &mut self,
        event: &NewEvent,
        handler: &dyn WorkflowHandler,
    ) -> Result<(), EvolveError> {
        let next_version = self.version + 1;
        self.apply_parts(
            &event.event_type,
            event.schema_version,
            &event.body,
            next_version,
            handler,
        )
    }

    fn apply_parts(
        &mut self,
        event_type: &str,
        schema_version: i32,
        body: &Value,
        version_after: i64,
        handler: &dyn WorkflowHandler,
    ) -> Result<(), EvolveError> {
        if super::event::system::is_system(event_type) {
            let system: SystemEvent = serde_json::from_value(body.clone()).map_err(|source| {
                EvolveError::MalformedSystemEvent {
                    event_type: event_type.to_string(),
                    source,
                }
            })?;
            self.apply_system(&system);
        } else {
            let body = if schema_version < handler.schema_version() {
                handler.upcast(event_type, schema_version, body.clone())?
            } else {
                body.clone()
            };
            let current = std::mem::take(&mut self.state);
            self.state = handler.evolve(current, event_type, &body).map_err(|message| {
                EvolveError::User {
                    event_type: event_type.to_string(),
                    message,
                }
            })?;
        }
        self.version = version_after;
        Ok(())
    }

    fn apply_system(&mut self, event: &SystemEvent) {
        match event {
            SystemEvent::Pause => self.lifecycle = Lifecycle::Paused,
            SystemEvent::Resume => self.lifecycle = Lifecycle::Active,
            SystemEvent::Cancel { .. } => self.lifecycle = Lifecycle::Cancelled,
            SystemEvent::SubscriptionAdded { subscription } => {
                self.subscriptions.insert(subscription.clone());
            }
            SystemEvent::SubscriptionRemoved { subscription } => {
                self.subscriptions.remove(subscription);
            }
            // Schedule bookkeeping lives in the schedule table, maintained
            // transactionally at append time; the fold carries no timer state.
            SystemEvent::ScheduleAdded { .. }
            | SystemEvent::ScheduleRemoved { .. }
            | SystemEvent::Delay { .. }
            | SystemEvent::DelayComplete { .. } => {}
        }
    }
}
