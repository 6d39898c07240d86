//! Standing interests of one workflow in another's events

use serde::{Deserialize, Serialize};

use super::event::{EventRecord, WorkflowId};

/// Wildcard accepted in either subscription field.
pub const WILDCARD: &str = "*";

/// A standing interest in events of a given type from a given source
/// workflow. Either field may be the `"*"` wildcard.
///
/// Subscriptions are created and removed through `subscription-added` /
/// `subscription-removed` system events and mirrored into their own table so
/// reader predicates can evaluate them without replaying logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Subscription {
    pub event_type: String,
    pub source_workflow_id: String,
}

impl Subscription {
    pub fn new(event_type: impl Into<String>, source_workflow_id: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            source_workflow_id: source_workflow_id.into(),
        }
    }

    /// Subscribe to every event of one source workflow.
    pub fn to_source(source_workflow_id: impl Into<String>) -> Self {
        Self::new(WILDCARD, source_workflow_id)
    }

    /// Subscribe to one event type from any source.
    pub fn to_event_type(event_type: impl Into<String>) -> Self {
        Self::new(event_type.into(), WILDCARD)
    }

    /// Whether this subscription covers the given committed event.
    pub fn matches(&self, event: &EventRecord) -> bool {
        self.matches_parts(&event.event_type, &event.workflow_id)
    }

    /// Whether this subscription covers `(event_type, source)`.
    pub fn matches_parts(&self, event_type: &str, source: &WorkflowId) -> bool {
        (self.event_type == WILDCARD || self.event_type == event_type)
            && (self.source_workflow_id == WILDCARD || self.source_workflow_id == source.as_str())
    }
}
