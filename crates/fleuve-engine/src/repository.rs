//! The repository: single entry point for commands against one workflow type
//!
//! Load, decide, evolve, persist, all under a per-workflow exclusive lock.
//! Everything a command produces (domain events, system events derived from
//! the decision's side-table requests, snapshot, sync-db rows) commits in
//! one store transaction.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::cache::{cache_key, StateCache};
use crate::config::EngineConfig;
use crate::delay::{CronError, DelaySchedule};
use crate::persistence::{AppendRequest, EventStore, Snapshot, StoreError, SyncDbWork};
use crate::workflow::{
    CommandEnvelope, DecideError, DecidedBatch, DelayFire, EventRecord, EvolveError,
    InstanceState, Lifecycle, NewEvent, Rejection, SystemEvent, TypeTag, WorkflowHandler,
    WorkflowId,
};

/// Bounded internal retries when a concurrent writer wins the version race.
const MAX_CONFLICT_RETRIES: u32 = 3;

/// Errors from repository operations.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// No events exist for the workflow.
    #[error("workflow not found: {0}")]
    NotFound(WorkflowId),

    /// `create_new` on a workflow that already has events.
    #[error("workflow already exists: {0}")]
    AlreadyExists(WorkflowId),

    /// Lifecycle gate: paused instances reject domain commands.
    #[error("workflow {0} is paused")]
    Paused(WorkflowId),

    /// Lifecycle gate: cancelled instances reject domain commands.
    #[error("workflow {0} is cancelled")]
    Cancelled(WorkflowId),

    /// Business rejection from `decide`; never retried.
    #[error("command rejected: {0}")]
    Rejected(#[from] Rejection),

    /// Concurrent writers kept winning; retryable from outside.
    #[error("version conflict on {workflow_id} after {attempts} attempts")]
    VersionConflict {
        workflow_id: WorkflowId,
        attempts: u32,
    },

    /// A payload failed to encode or decode.
    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Event folding failed (including schema upcasts).
    #[error(transparent)]
    Evolve(#[from] EvolveError),

    /// A delay request carried an invalid cron expression or timezone.
    #[error(transparent)]
    Cron(#[from] CronError),

    /// Store failure; transient ones are retryable from outside.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl From<DecideError> for CommandError {
    fn from(e: DecideError) -> Self {
        match e {
            DecideError::Rejected(rejection) => Self::Rejected(rejection),
            DecideError::Codec(e) => Self::Codec(e),
        }
    }
}

impl CommandError {
    /// Whether an external retry could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::VersionConflict { .. } => true,
            Self::Store(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Whether this is an expected business answer rather than a fault:
    /// rejections and lifecycle gates. Runners and executors log these and
    /// move on.
    pub fn is_expected_rejection(&self) -> bool {
        matches!(
            self,
            Self::Rejected(_) | Self::Paused(_) | Self::Cancelled(_) | Self::NotFound(_)
        )
    }
}

/// Result of a committed command.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    /// State after the append; `state.version` is the new version.
    pub state: InstanceState,
    /// The committed records, empty for no-op decisions.
    pub events: Vec<EventRecord>,
}

/// Single entry point for commands against one workflow type.
///
/// Cheap to share: all fields are handles. Multiple workflows proceed in
/// parallel; mutations of one workflow are serialized by its lock entry.
pub struct Repository {
    store: Arc<dyn EventStore>,
    cache: Arc<dyn StateCache>,
    handler: Arc<dyn WorkflowHandler>,
    config: EngineConfig,
    sync_db: Option<SyncDbWork>,
    locks: DashMap<WorkflowId, Arc<Mutex<()>>>,
}

impl Repository {
    pub fn new(
        store: Arc<dyn EventStore>,
        cache: Arc<dyn StateCache>,
        handler: Arc<dyn WorkflowHandler>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            cache,
            handler,
            config,
            sync_db: None,
            locks: DashMap::new(),
        }
    }

    /// Install a repository-level sync-db hook. It runs inside every append
    /// transaction and takes precedence over adapter hooks.
    pub fn with_sync_db(mut self, sync_db: SyncDbWork) -> Self {
        self.sync_db = Some(sync_db);
        self
    }

    pub fn workflow_type(&self) -> &'static str {
        self.handler.workflow_type()
    }

    pub fn handler(&self) -> &Arc<dyn WorkflowHandler> {
        &self.handler
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Create a new workflow with its first command.
    pub async fn create_new<C: TypeTag + Serialize>(
        &self,
        command: &C,
        workflow_id: &WorkflowId,
    ) -> Result<CommandOutcome, CommandError> {
        self.create_new_envelope(CommandEnvelope::encode(command)?, workflow_id)
            .await
    }

    /// Apply a command to an existing workflow.
    pub async fn process_command<C: TypeTag + Serialize>(
        &self,
        workflow_id: &WorkflowId,
        command: &C,
    ) -> Result<CommandOutcome, CommandError> {
        self.process_command_envelope(workflow_id, CommandEnvelope::encode(command)?)
            .await
    }

    #[instrument(skip(self, envelope), fields(workflow_type = self.workflow_type(), command_type = %envelope.command_type))]
    pub async fn create_new_envelope(
        &self,
        envelope: CommandEnvelope,
        workflow_id: &WorkflowId,
    ) -> Result<CommandOutcome, CommandError> {
        self.execute(workflow_id, envelope, None, true).await
    }

    #[instrument(skip(self, envelope), fields(workflow_type = self.workflow_type(), command_type = %envelope.command_type))]
    pub async fn process_command_envelope(
        &self,
        workflow_id: &WorkflowId,
        envelope: CommandEnvelope,
    ) -> Result<CommandOutcome, CommandError> {
        self.execute(workflow_id, envelope, None, false).await
    }

    /// Like [`process_command_envelope`](Self::process_command_envelope) with
    /// a fallback sync-db hook, used when the caller (typically the activity
    /// executor, on behalf of an adapter) maintains its own denormalized
    /// tables. The repository-level hook still wins if both are set.
    pub async fn process_command_with_sync(
        &self,
        workflow_id: &WorkflowId,
        envelope: CommandEnvelope,
        fallback_sync: Option<SyncDbWork>,
    ) -> Result<CommandOutcome, CommandError> {
        self.execute(workflow_id, envelope, fallback_sync, false)
            .await
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Pause the workflow: domain commands are rejected until resume.
    pub async fn pause_workflow(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<CommandOutcome, CommandError> {
        self.append_lifecycle(workflow_id, SystemEvent::Pause, |lifecycle| {
            lifecycle == Lifecycle::Active
        })
        .await
    }

    /// Resume a paused (or cancelled) workflow.
    pub async fn resume_workflow(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<CommandOutcome, CommandError> {
        self.append_lifecycle(workflow_id, SystemEvent::Resume, |lifecycle| {
            lifecycle != Lifecycle::Active
        })
        .await
    }

    /// Cancel the workflow. Terminal apart from resume.
    pub async fn cancel_workflow(
        &self,
        workflow_id: &WorkflowId,
        reason: impl Into<String>,
    ) -> Result<CommandOutcome, CommandError> {
        let reason = reason.into();
        self.append_lifecycle(
            workflow_id,
            SystemEvent::Cancel { reason },
            |lifecycle| lifecycle != Lifecycle::Cancelled,
        )
        .await
    }

    /// Record that a delay schedule fired. Called by the delay scheduler
    /// before dispatching the stored command; appended regardless of
    /// lifecycle since it is bookkeeping, not intent.
    pub async fn mark_delay_complete(
        &self,
        workflow_id: &WorkflowId,
        schedule_id: &str,
    ) -> Result<CommandOutcome, CommandError> {
        self.append_lifecycle(
            workflow_id,
            SystemEvent::DelayComplete {
                schedule_id: schedule_id.to_string(),
            },
            |_| true,
        )
        .await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Current state, cache-first. Calls after a completed
    /// `process_command` observe at least that command's version.
    pub async fn get_current_state(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<InstanceState, CommandError> {
        self.load_committed(workflow_id)
            .await?
            .ok_or_else(|| CommandError::NotFound(workflow_id.clone()))
    }

    /// Materialize state at a historical version (replay semantics), or the
    /// latest committed state when `at_version` is `None`. Always reads the
    /// store, never the cache.
    pub async fn load_state(
        &self,
        workflow_id: &WorkflowId,
        at_version: Option<i64>,
    ) -> Result<InstanceState, CommandError> {
        self.load_from_store(workflow_id, at_version)
            .await?
            .ok_or_else(|| CommandError::NotFound(workflow_id.clone()))
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn lock_for(&self, workflow_id: &WorkflowId) -> Arc<Mutex<()>> {
        self.locks
            .entry(workflow_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn execute(
        &self,
        workflow_id: &WorkflowId,
        envelope: CommandEnvelope,
        fallback_sync: Option<SyncDbWork>,
        create: bool,
    ) -> Result<CommandOutcome, CommandError> {
        let lock = self.lock_for(workflow_id);
        let _guard = lock.lock().await;

        let mut attempts = 0;
        loop {
            let result = self
                .try_execute(workflow_id, &envelope, fallback_sync.clone(), create)
                .await;

            match result {
                Err(CommandError::Store(StoreError::VersionConflict { .. })) => {
                    attempts += 1;
                    // Another process committed; drop our stale cache entry
                    // and re-run decide against the winner's state.
                    let key = cache_key(self.workflow_type(), workflow_id);
                    if let Err(e) = self.cache.delete(&key).await {
                        warn!(error = %e, "cache delete failed after version conflict");
                    }
                    if attempts > MAX_CONFLICT_RETRIES {
                        return Err(CommandError::VersionConflict {
                            workflow_id: workflow_id.clone(),
                            attempts,
                        });
                    }
                    debug!(%workflow_id, attempts, "retrying after version conflict");
                }
                other => return other,
            }
        }
    }

    async fn try_execute(
        &self,
        workflow_id: &WorkflowId,
        envelope: &CommandEnvelope,
        fallback_sync: Option<SyncDbWork>,
        create: bool,
    ) -> Result<CommandOutcome, CommandError> {
        let loaded = self.load_committed(workflow_id).await?;

        let instance = match (loaded, create) {
            (Some(_), true) => return Err(CommandError::AlreadyExists(workflow_id.clone())),
            (None, false) => return Err(CommandError::NotFound(workflow_id.clone())),
            (Some(instance), false) => instance,
            (None, true) => {
                InstanceState::new(workflow_id.clone(), self.handler.initial_state())
            }
        };

        match instance.lifecycle {
            Lifecycle::Active => {}
            Lifecycle::Paused => return Err(CommandError::Paused(workflow_id.clone())),
            Lifecycle::Cancelled => return Err(CommandError::Cancelled(workflow_id.clone())),
        }

        let batch = self.handler.decide(&instance, envelope)?;
        if batch.is_empty() {
            debug!(%workflow_id, command_type = %envelope.command_type, "decision was a no-op");
            return Ok(CommandOutcome {
                state: instance,
                events: Vec::new(),
            });
        }

        self.append_batch(workflow_id, instance, batch, fallback_sync)
            .await
    }

    async fn append_batch(
        &self,
        workflow_id: &WorkflowId,
        instance: InstanceState,
        batch: DecidedBatch,
        fallback_sync: Option<SyncDbWork>,
    ) -> Result<CommandOutcome, CommandError> {
        let now = Utc::now();
        let old_version = instance.version;

        // Domain events first, then the system events derived from the
        // decision's side-table requests, all in one versioned run.
        let mut events: Vec<NewEvent> = batch.events;
        for subscription in &batch.subscribe {
            events.push(
                SystemEvent::SubscriptionAdded {
                    subscription: subscription.clone(),
                }
                .to_new_event()?,
            );
        }
        for subscription in &batch.unsubscribe {
            events.push(
                SystemEvent::SubscriptionRemoved {
                    subscription: subscription.clone(),
                }
                .to_new_event()?,
            );
        }
        let mut schedules = Vec::with_capacity(batch.delays.len());
        for request in &batch.delays {
            let event_version = old_version + events.len() as i64 + 1;
            let system = match &request.fire {
                DelayFire::At { .. } => SystemEvent::Delay {
                    request: request.clone(),
                },
                DelayFire::Cron { .. } => SystemEvent::ScheduleAdded {
                    request: request.clone(),
                },
            };
            events.push(system.to_new_event()?);
            schedules.push(DelaySchedule::from_request(
                self.workflow_type(),
                workflow_id.clone(),
                event_version,
                request,
                now,
            )?);
        }
        for schedule_id in &batch.cancel_delays {
            events.push(
                SystemEvent::ScheduleRemoved {
                    schedule_id: schedule_id.clone(),
                }
                .to_new_event()?,
            );
        }

        let mut new_state = instance;
        for event in &events {
            new_state.apply_new(event, self.handler.as_ref())?;
        }
        let new_version = new_state.version;

        let tags = self.handler.tags(&new_state.state);
        if !tags.is_empty() {
            for event in &mut events {
                event.metadata.tags.extend(tags.clone());
            }
        }

        let snapshot = if self.config.snapshots_enabled() {
            let interval = self.config.snapshot_interval as i64;
            if new_version / interval > old_version / interval {
                Some(Snapshot {
                    workflow_type: self.workflow_type().to_string(),
                    workflow_id: workflow_id.clone(),
                    at_version: new_version,
                    state: serde_json::to_value(&new_state)?,
                    created_at: now,
                })
            } else {
                None
            }
        } else {
            None
        };

        let request = AppendRequest {
            workflow_type: self.workflow_type().to_string(),
            workflow_id: workflow_id.clone(),
            expected_version: old_version,
            events,
            snapshot,
            subscribe: batch.subscribe,
            unsubscribe: batch.unsubscribe,
            schedules,
            cancel_schedules: batch.cancel_delays,
            sync: self.sync_db.clone().or(fallback_sync),
        };

        let outcome = self.store.append(request).await?;

        if batch.is_final {
            info!(%workflow_id, version = new_version, "workflow reached a final event");
        }

        let key = cache_key(self.workflow_type(), workflow_id);
        match self
            .cache
            .put_if_version(&key, old_version, new_state.clone())
            .await
        {
            Ok(_) => {}
            Err(e) => {
                warn!(%workflow_id, error = %e, "cache update failed; dropping entry");
                if let Err(e) = self.cache.delete(&key).await {
                    warn!(%workflow_id, error = %e, "cache delete also failed");
                }
            }
        }

        Ok(CommandOutcome {
            state: new_state,
            events: outcome.records,
        })
    }

    /// Append one system event under the workflow lock. `should_append`
    /// decides idempotency: when it returns false the call is a no-op
    /// returning current state.
    async fn append_lifecycle(
        &self,
        workflow_id: &WorkflowId,
        event: SystemEvent,
        should_append: impl Fn(Lifecycle) -> bool,
    ) -> Result<CommandOutcome, CommandError> {
        let lock = self.lock_for(workflow_id);
        let _guard = lock.lock().await;

        let mut attempts = 0;
        loop {
            let instance = self
                .load_committed(workflow_id)
                .await?
                .ok_or_else(|| CommandError::NotFound(workflow_id.clone()))?;

            if !should_append(instance.lifecycle) {
                return Ok(CommandOutcome {
                    state: instance,
                    events: Vec::new(),
                });
            }

            let old_version = instance.version;
            let mut new_state = instance;
            let new_event = event.to_new_event()?;
            new_state.apply_new(&new_event, self.handler.as_ref())?;

            let request = AppendRequest::events(
                self.workflow_type(),
                workflow_id.clone(),
                old_version,
                vec![new_event],
            );

            match self.store.append(request).await {
                Ok(outcome) => {
                    let key = cache_key(self.workflow_type(), workflow_id);
                    if let Err(e) = self
                        .cache
                        .put_if_version(&key, old_version, new_state.clone())
                        .await
                    {
                        warn!(%workflow_id, error = %e, "cache update failed; dropping entry");
                        let _ = self.cache.delete(&key).await;
                    }
                    return Ok(CommandOutcome {
                        state: new_state,
                        events: outcome.records,
                    });
                }
                Err(StoreError::VersionConflict { .. }) => {
                    attempts += 1;
                    let key = cache_key(self.workflow_type(), workflow_id);
                    let _ = self.cache.delete(&key).await;
                    if attempts > MAX_CONFLICT_RETRIES {
                        return Err(CommandError::VersionConflict {
                            workflow_id: workflow_id.clone(),
                            attempts,
                        });
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn load_committed(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Option<InstanceState>, CommandError> {
        let key = cache_key(self.workflow_type(), workflow_id);
        match self.cache.get(&key).await {
            Ok(Some(state)) => return Ok(Some(state)),
            Ok(None) => {}
            Err(e) => warn!(%workflow_id, error = %e, "cache read failed; loading from store"),
        }
        self.load_from_store(workflow_id, None).await
    }

    async fn load_from_store(
        &self,
        workflow_id: &WorkflowId,
        at_version: Option<i64>,
    ) -> Result<Option<InstanceState>, CommandError> {
        let snapshot = self.store.latest_snapshot(workflow_id, at_version).await?;

        let mut instance = match snapshot {
            Some(snapshot) => serde_json::from_value::<InstanceState>(snapshot.state)?,
            None => InstanceState::new(workflow_id.clone(), self.handler.initial_state()),
        };

        let events = self
            .store
            .read_workflow_events(
                self.workflow_type(),
                workflow_id,
                instance.version,
                at_version,
            )
            .await?;

        if instance.version == 0 && events.is_empty() {
            return Ok(None);
        }

        for record in &events {
            instance.apply_record(record, self.handler.as_ref())?;
        }

        Ok(Some(instance))
    }
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("workflow_type", &self.workflow_type())
            .field("sync_db", &self.sync_db.is_some())
            .finish()
    }
}
