//! Event records and the system-event vocabulary

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::subscription::Subscription;

/// Identifier of a workflow instance within its workflow type.
///
/// Workflow ids are opaque strings chosen by the caller (`"ord-1"`,
/// `"user:42"`, a UUID, ...). The partition hash runs over the raw octets of
/// this string, so the exact byte representation matters for scaling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(String);

impl WorkflowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkflowId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for WorkflowId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Metadata attached to every event.
///
/// Tags are injected by the owning workflow's `tags` hook at append time and
/// travel with the event through readers and adapters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl EventMetadata {
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

/// An event prepared for appending, before the store assigns its
/// `global_id` and `workflow_version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    /// Discriminator string; system events use the reserved tags in
    /// [`system`].
    pub event_type: String,

    /// Schema version of the body, per the owning workflow type.
    pub schema_version: i32,

    /// Opaque payload. Domain events carry whatever the workflow's event
    /// enum serializes to; system events carry the [`SystemEvent`] fields.
    pub body: Value,

    #[serde(default)]
    pub metadata: EventMetadata,
}

impl NewEvent {
    pub fn new(event_type: impl Into<String>, schema_version: i32, body: Value) -> Self {
        Self {
            event_type: event_type.into(),
            schema_version,
            body,
            metadata: EventMetadata::default(),
        }
    }
}

/// A committed event as read back from the log.
///
/// Immutable once written. `global_id` comes from one sequence shared by
/// all workflow types, so it is strictly monotonic across all of them and
/// serves as the stream cursor; `workflow_version` is dense per workflow
/// instance and serves as the optimistic-concurrency fence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub global_id: i64,
    pub workflow_type: String,
    pub workflow_id: WorkflowId,
    pub workflow_version: i64,
    pub event_type: String,
    pub schema_version: i32,
    pub body: Value,
    #[serde(default)]
    pub metadata: EventMetadata,
    pub created_at: DateTime<Utc>,
}

impl EventRecord {
    /// Whether this record carries one of the reserved system tags.
    pub fn is_system(&self) -> bool {
        system::is_system(&self.event_type)
    }

    /// Decode the system payload, if this is a system event.
    pub fn system_event(&self) -> Option<Result<SystemEvent, serde_json::Error>> {
        if !self.is_system() {
            return None;
        }
        Some(serde_json::from_value(self.body.clone()))
    }
}

/// Reserved event-type tags owned by the engine.
pub mod system {
    pub const PAUSE: &str = "pause";
    pub const RESUME: &str = "resume";
    pub const CANCEL: &str = "cancel";
    pub const SUBSCRIPTION_ADDED: &str = "subscription-added";
    pub const SUBSCRIPTION_REMOVED: &str = "subscription-removed";
    pub const SCHEDULE_ADDED: &str = "schedule-added";
    pub const SCHEDULE_REMOVED: &str = "schedule-removed";
    pub const DELAY: &str = "delay";
    pub const DELAY_COMPLETE: &str = "delay-complete";

    pub const ALL: [&str; 9] = [
        PAUSE,
        RESUME,
        CANCEL,
        SUBSCRIPTION_ADDED,
        SUBSCRIPTION_REMOVED,
        SCHEDULE_ADDED,
        SCHEDULE_REMOVED,
        DELAY,
        DELAY_COMPLETE,
    ];

    pub fn is_system(event_type: &str) -> bool {
        ALL.contains(&event_type)
    }
}

/// A command envelope as the engine sees it: a discriminator plus an opaque
/// payload. Typed workflows encode/decode their command enums through this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub command_type: String,
    pub body: Value,
}

impl CommandEnvelope {
    pub fn new(command_type: impl Into<String>, body: Value) -> Self {
        Self {
            command_type: command_type.into(),
            body,
        }
    }
}

/// A delay as requested by `decide`: fire once at an instant, or on a cron
/// schedule resolved in a named timezone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "fire", rename_all = "snake_case")]
pub enum DelayFire {
    At { delay_until: DateTime<Utc> },
    Cron {
        expression: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
    },
}

/// A delay request emitted from `decide`, before it becomes a schedule row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayRequest {
    pub schedule_id: String,
    #[serde(flatten)]
    pub fire: DelayFire,
    pub next_command: CommandEnvelope,
}

impl DelayRequest {
    pub fn at(
        schedule_id: impl Into<String>,
        delay_until: DateTime<Utc>,
        next_command: CommandEnvelope,
    ) -> Self {
        Self {
            schedule_id: schedule_id.into(),
            fire: DelayFire::At { delay_until },
            next_command,
        }
    }

    pub fn cron(
        schedule_id: impl Into<String>,
        expression: impl Into<String>,
        timezone: Option<String>,
        next_command: CommandEnvelope,
    ) -> Self {
        Self {
            schedule_id: schedule_id.into(),
            fire: DelayFire::Cron {
                expression: expression.into(),
                timezone,
            },
            next_command,
        }
    }
}

/// Events whose semantics are owned by the engine rather than user code.
///
/// System events share the per-workflow log and version sequence with domain
/// events. The framework's evolve wrapper consumes them before user `evolve`
/// ever runs, so workflow code never sees them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SystemEvent {
    #[serde(rename = "pause")]
    Pause,

    #[serde(rename = "resume")]
    Resume,

    #[serde(rename = "cancel")]
    Cancel { reason: String },

    #[serde(rename = "subscription-added")]
    SubscriptionAdded { subscription: Subscription },

    #[serde(rename = "subscription-removed")]
    SubscriptionRemoved { subscription: Subscription },

    #[serde(rename = "schedule-added")]
    ScheduleAdded { request: DelayRequest },

    #[serde(rename = "schedule-removed")]
    ScheduleRemoved { schedule_id: String },

    #[serde(rename = "delay")]
    Delay { request: DelayRequest },

    #[serde(rename = "delay-complete")]
    DelayComplete { schedule_id: String },
}

impl SystemEvent {
    /// The reserved tag this variant serializes under.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Pause => system::PAUSE,
            Self::Resume => system::RESUME,
            Self::Cancel { .. } => system::CANCEL,
            Self::SubscriptionAdded { .. } => system::SUBSCRIPTION_ADDED,
            Self::SubscriptionRemoved { .. } => system::SUBSCRIPTION_REMOVED,
            Self::ScheduleAdded { .. } => system::SCHEDULE_ADDED,
            Self::ScheduleRemoved { .. } => system::SCHEDULE_REMOVED,
            Self::Delay { .. } => system::DELAY,
            Self::DelayComplete { .. } => system::DELAY_COMPLETE,
        }
    }

    /// Encode into an appendable event. System payloads are always at schema
    /// version 0; they never pass through user `upcast`.
    pub fn to_new_event(&self) -> Result<NewEvent, serde_json::Error> {
        Ok(NewEvent::new(
            self.event_type(),
            0,
            serde_json::to_value(self)?,
        ))
    }
}
