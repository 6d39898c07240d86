//! Durable bookkeeping for activity executions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::workflow::WorkflowId;

/// Status of an activity record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    /// Awaiting its next attempt (first enqueue, scheduled retry, or an
    /// operator reset from the dead-letter queue).
    Pending,

    /// An executor is (or was, before crashing) driving the adapter.
    Running,

    /// The adapter body ran to completion exactly once.
    Completed,

    /// Retries exhausted; waiting in the dead-letter queue.
    Failed,
}

impl std::fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One activity execution, keyed by `(workflow_id, event_number)`.
///
/// The record exists iff the executor has attempted the event at least once.
/// `checkpoint` accumulates adapter progress across attempts; retries see the
/// merge of everything persisted so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub workflow_type: String,
    pub workflow_id: WorkflowId,
    /// `workflow_version` of the event that triggered the activity.
    pub event_number: i64,
    pub status: ActivityStatus,
    /// Retries consumed so far (0 on the first attempt).
    pub retry_count: u32,
    pub checkpoint: Map<String, Value>,
    pub runner_id: String,
    pub started_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
    /// When the next attempt is due, for scheduled retries and takeover
    /// detection. `None` while an attempt is actively running.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ActivityRecord {
    /// Fresh record for a first attempt.
    pub fn begin(
        workflow_type: impl Into<String>,
        workflow_id: WorkflowId,
        event_number: i64,
        runner_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            workflow_type: workflow_type.into(),
            workflow_id,
            event_number,
            status: ActivityStatus::Running,
            retry_count: 0,
            checkpoint: Map::new(),
            runner_id: runner_id.into(),
            started_at: now,
            last_attempt_at: now,
            next_attempt_at: None,
            finished_at: None,
            last_error: None,
        }
    }

    /// Merge checkpoint data from an adapter yield. Later keys win.
    pub fn merge_checkpoint(&mut self, data: Map<String, Value>) {
        for (key, value) in data {
            self.checkpoint.insert(key, value);
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, ActivityStatus::Completed | ActivityStatus::Failed)
    }
}
