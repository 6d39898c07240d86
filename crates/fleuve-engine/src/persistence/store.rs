//! EventStore trait definition

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::activity::record::{ActivityRecord, ActivityStatus};
use crate::delay::DelaySchedule;
use crate::workflow::{EventRecord, NewEvent, Subscription, WorkflowId};

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No events exist for the workflow.
    #[error("workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),

    /// Optimistic concurrency fence failed: another writer committed first.
    #[error("version conflict on {workflow_id}: expected {expected}, actual {actual}")]
    VersionConflict {
        workflow_id: WorkflowId,
        expected: i64,
        actual: i64,
    },

    /// Offset CAS failed: the reader has another owner.
    #[error("offset conflict for reader {reader}: expected {expected:?}, actual {actual:?}")]
    OffsetConflict {
        reader: String,
        expected: Option<i64>,
        actual: Option<i64>,
    },

    /// Activity record missing for a targeted operation.
    #[error("activity record not found: {workflow_id}#{event_number}")]
    ActivityNotFound {
        workflow_id: WorkflowId,
        event_number: i64,
    },

    /// Schedule row missing or already claimed.
    #[error("schedule not found: {0}")]
    ScheduleNotFound(String),

    /// Database error; transient from the engine's point of view.
    #[error("database error: {0}")]
    Database(String),

    /// Payload failed to encode or decode.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether a caller-side retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

/// A materialized state at a specific version, for faster loads and safe
/// truncation. `state` holds the full serialized
/// [`InstanceState`](crate::workflow::InstanceState), lifecycle and
/// subscriptions included, so replaying from a snapshot is exact even after
/// the events below it are gone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub workflow_type: String,
    pub workflow_id: WorkflowId,
    pub at_version: i64,
    pub state: Value,
    pub created_at: DateTime<Utc>,
}

/// A transaction handle passed to [`SyncDbWork`] hooks.
///
/// Postgres hands the hook the open transaction so user tables commit
/// atomically with the events; the in-memory store has nothing to offer and
/// says so.
pub enum SyncTxn<'c> {
    Postgres(&'c mut sqlx::PgConnection),
    Memory,
}

/// User work executed inside the append transaction, the mechanism behind
/// strongly-consistent denormalized tables.
pub type SyncDbWork =
    Arc<dyn for<'c> Fn(SyncTxn<'c>) -> BoxFuture<'c, Result<(), StoreError>> + Send + Sync>;

/// Everything one `process_command` writes, committed atomically.
pub struct AppendRequest {
    pub workflow_type: String,
    pub workflow_id: WorkflowId,
    /// The committed version this append is fenced against. 0 creates.
    pub expected_version: i64,
    /// Events in order; the store assigns `workflow_version` starting at
    /// `expected_version + 1` and `global_id` from the shared sequence.
    pub events: Vec<NewEvent>,
    pub snapshot: Option<Snapshot>,
    pub subscribe: Vec<Subscription>,
    pub unsubscribe: Vec<Subscription>,
    pub schedules: Vec<DelaySchedule>,
    pub cancel_schedules: Vec<String>,
    pub sync: Option<SyncDbWork>,
}

impl std::fmt::Debug for AppendRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppendRequest")
            .field("workflow_type", &self.workflow_type)
            .field("workflow_id", &self.workflow_id)
            .field("expected_version", &self.expected_version)
            .field("events", &self.events.len())
            .field("snapshot", &self.snapshot.as_ref().map(|s| s.at_version))
            .field("sync", &self.sync.is_some())
            .finish()
    }
}

impl AppendRequest {
    /// Request carrying only events.
    pub fn events(
        workflow_type: impl Into<String>,
        workflow_id: WorkflowId,
        expected_version: i64,
        events: Vec<NewEvent>,
    ) -> Self {
        Self {
            workflow_type: workflow_type.into(),
            workflow_id,
            expected_version,
            events,
            snapshot: None,
            subscribe: Vec::new(),
            unsubscribe: Vec::new(),
            schedules: Vec::new(),
            cancel_schedules: Vec::new(),
            sync: None,
        }
    }
}

/// Result of a committed append.
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    /// The committed records, with assigned ids and versions.
    pub records: Vec<EventRecord>,
    pub new_version: i64,
}

/// Store for the event log and the engine-owned side tables.
///
/// Implementations must be thread-safe. The visibility contract for
/// `read_stream` is strict: once an event with `global_id = g` is readable,
/// every event of the same workflow type with a smaller id is readable too;
/// no gaps that could later be filled behind a reader's cursor.
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    // =========================================================================
    // Event log
    // =========================================================================

    /// Append a batch for one workflow with version fencing. All parts of
    /// the request (events, snapshot, subscription deltas, schedule rows
    /// and the sync hook) commit or fail together.
    async fn append(&self, request: AppendRequest) -> Result<AppendOutcome, StoreError>;

    /// Events with `global_id > after`, ascending, across workflow types.
    async fn read_stream(&self, after: i64, limit: usize) -> Result<Vec<EventRecord>, StoreError>;

    /// Highest committed `global_id`, for lag reporting.
    async fn max_global_id(&self) -> Result<i64, StoreError>;

    /// One workflow's events with `workflow_version > after`, optionally
    /// bounded above (inclusive).
    async fn read_workflow_events(
        &self,
        workflow_type: &str,
        workflow_id: &WorkflowId,
        after_version: i64,
        up_to_version: Option<i64>,
    ) -> Result<Vec<EventRecord>, StoreError>;

    /// Committed version of a workflow, `None` if it has no events.
    async fn current_version(
        &self,
        workflow_type: &str,
        workflow_id: &WorkflowId,
    ) -> Result<Option<i64>, StoreError>;

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Latest snapshot with `at_version <= bound` (unbounded if `None`).
    async fn latest_snapshot(
        &self,
        workflow_id: &WorkflowId,
        at_or_below: Option<i64>,
    ) -> Result<Option<Snapshot>, StoreError>;

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Ids of workflows of `subscriber_type` holding a subscription that
    /// covers `(event_type, source)`, wildcards included.
    async fn subscribers_of(
        &self,
        subscriber_type: &str,
        event_type: &str,
        source: &WorkflowId,
    ) -> Result<Vec<WorkflowId>, StoreError>;

    // =========================================================================
    // Reader offsets
    // =========================================================================

    async fn load_offset(&self, reader_name: &str) -> Result<Option<i64>, StoreError>;

    /// CAS the offset from `expected` to `new_offset`. `expected = None`
    /// claims a fresh reader. A mismatch means another process owns the
    /// reader and surfaces as [`StoreError::OffsetConflict`].
    async fn commit_offset(
        &self,
        reader_name: &str,
        expected: Option<i64>,
        new_offset: i64,
    ) -> Result<(), StoreError>;

    async fn delete_offset(&self, reader_name: &str) -> Result<(), StoreError>;

    /// All `(reader_name, offset)` pairs; the truncator's safety input.
    async fn list_offsets(&self) -> Result<Vec<(String, i64)>, StoreError>;

    // =========================================================================
    // Activity records
    // =========================================================================

    async fn load_activity(
        &self,
        workflow_id: &WorkflowId,
        event_number: i64,
    ) -> Result<Option<ActivityRecord>, StoreError>;

    /// Insert or replace the record keyed by `(workflow_id, event_number)`.
    async fn upsert_activity(&self, record: &ActivityRecord) -> Result<(), StoreError>;

    /// Conditionally move ownership of a record from `previous_runner` to
    /// `new_runner`. Returns false if someone else won the race.
    async fn take_over_activity(
        &self,
        workflow_id: &WorkflowId,
        event_number: i64,
        previous_runner: &str,
        new_runner: &str,
    ) -> Result<bool, StoreError>;

    /// Records due for recovery: `running` past their deadline (crashed
    /// owner) or `pending` whose `next_attempt_at` has passed.
    async fn due_activities(
        &self,
        now: DateTime<Utc>,
        stale_cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ActivityRecord>, StoreError>;

    /// Records filtered by status, newest first; the dead-letter listing.
    async fn list_activities(
        &self,
        status: Option<ActivityStatus>,
        limit: usize,
    ) -> Result<Vec<ActivityRecord>, StoreError>;

    // =========================================================================
    // Delay schedules
    // =========================================================================

    /// Schedules with `delay_until <= now`, soonest first.
    async fn due_schedules(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DelaySchedule>, StoreError>;

    /// Earliest `delay_until` of any schedule, for adaptive sleeping.
    async fn next_schedule_at(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Delete a one-shot row iff its fire time is still `expected_fire`.
    /// Returns false if another scheduler already claimed it.
    async fn delete_schedule_if(
        &self,
        schedule_id: &str,
        expected_fire: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Advance a cron row iff its fire time is still `expected_fire`.
    async fn reschedule(
        &self,
        schedule_id: &str,
        expected_fire: DateTime<Utc>,
        next_fire: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Unconditional removal, for `schedule-removed` cancellations.
    async fn delete_schedule(&self, schedule_id: &str) -> Result<(), StoreError>;

    // =========================================================================
    // Truncation
    // =========================================================================

    /// Latest snapshot per workflow, for workflows that still have events at
    /// or below their snapshot version. Candidates for the truncator.
    async fn truncation_candidates(&self, limit: usize) -> Result<Vec<Snapshot>, StoreError>;

    /// Delete up to `batch` events of one workflow satisfying all safety
    /// gates: `workflow_version <= up_to_version`, `global_id <=
    /// max_global_id`, `created_at < created_before`. Returns rows deleted.
    async fn delete_events_below(
        &self,
        workflow_type: &str,
        workflow_id: &WorkflowId,
        up_to_version: i64,
        max_global_id: i64,
        created_before: DateTime<Utc>,
        batch: usize,
    ) -> Result<u64, StoreError>;
}
