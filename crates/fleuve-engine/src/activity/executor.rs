//! Activity executor: drives adapter side effects for new events
//!
//! The executor owns a durable reader over the event stream (so truncation's
//! min-offset check covers side-effect consumers) and an activity record per
//! `(workflow_id, event_number)`. New matching events are claimed as
//! `running` and executed on a bounded set of tasks; a failed attempt backs
//! off on an in-process timer, with `next_attempt_at` persisted so the
//! recovery sweep can resume records stranded by a crashed executor (it also
//! takes over records owned by dead runner ids).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::adapter::{ActionContext, ActionItem, ActivityError, Adapter};
use super::record::{ActivityRecord, ActivityStatus};
use crate::partition::{reader_name, Partition};
use crate::persistence::{EventStore, StoreError};
use crate::reader::{FnPredicate, ReaderError, StreamReader};
use crate::repository::Repository;
use crate::retry::RetryPolicy;
use crate::workflow::{EventRecord, WorkflowId};

/// Reader group name for executor offsets.
const READER_GROUP: &str = "actions";

/// Errors that abort the executor task.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Reader(#[from] ReaderError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Configuration for the activity executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum concurrently running activities.
    pub max_concurrency: usize,

    /// Events pulled per reader batch.
    pub batch_size: usize,

    /// Sleep when there is nothing to do.
    pub poll_interval: Duration,

    /// A `running` record with no heartbeat for this long is considered
    /// stranded and taken over.
    pub stale_after: Duration,

    /// Default retry policy where an adapter supplies none.
    pub retry_policy: RetryPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            batch_size: 50,
            poll_interval: Duration::from_millis(250),
            stale_after: Duration::from_secs(60),
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Shared pieces of the executor that spawned attempts need.
struct Shared {
    store: Arc<dyn EventStore>,
    repositories: HashMap<String, Arc<Repository>>,
    runner_id: String,
}

impl Shared {
    /// Apply a yielded command via the owning repository. Rejections that
    /// mean the event was already handled count as success.
    async fn apply_command(
        &self,
        adapter: &Arc<dyn Adapter>,
        event: &EventRecord,
        envelope: crate::workflow::CommandEnvelope,
    ) -> Result<(), ActivityError> {
        let Some(repository) = self.repositories.get(&event.workflow_type) else {
            return Err(ActivityError::non_retryable(format!(
                "no repository for workflow type {}",
                event.workflow_type
            )));
        };

        match repository
            .process_command_with_sync(&event.workflow_id, envelope, adapter.sync_db())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_expected_rejection() => {
                debug!(
                    workflow_id = %event.workflow_id,
                    rejection = %e,
                    "command rejected as already handled"
                );
                Ok(())
            }
            Err(e) if e.is_retryable() => Err(ActivityError::new(e.to_string())),
            Err(e) => Err(ActivityError::non_retryable(e.to_string())),
        }
    }

    /// Drive one activity through attempts until completion, dead-letter, or
    /// shutdown. Backoff between attempts is an in-process timer sleep; the
    /// persisted `next_attempt_at` mirrors it so a crashed executor's record
    /// is picked up by the recovery sweep instead.
    async fn run_activity(
        &self,
        adapter: Arc<dyn Adapter>,
        event: EventRecord,
        mut record: ActivityRecord,
        policy: RetryPolicy,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            match self
                .run_attempt(&adapter, &event, &mut record, &policy)
                .await
            {
                AttemptOutcome::Completed
                | AttemptOutcome::DeadLettered
                | AttemptOutcome::Abandoned => return,
                AttemptOutcome::Retry(delay) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                // Pending record stays behind; recovery
                                // resumes it on the next start.
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Run one attempt of one activity. Never panics the executor: store
    /// failures are logged and the record is left for the recovery sweep.
    #[instrument(skip(self, adapter, event, record, policy), fields(
        adapter = adapter.name(),
        workflow_id = %record.workflow_id,
        event_number = record.event_number,
        retry_count = record.retry_count,
    ))]
    async fn run_attempt(
        &self,
        adapter: &Arc<dyn Adapter>,
        event: &EventRecord,
        record: &mut ActivityRecord,
        policy: &RetryPolicy,
    ) -> AttemptOutcome {
        let now = Utc::now();
        record.status = ActivityStatus::Running;
        record.runner_id = self.runner_id.clone();
        record.last_attempt_at = now;
        record.next_attempt_at = None;
        if let Err(e) = self.store.upsert_activity(record).await {
            error!(error = %e, "failed to persist running record; abandoning attempt");
            return AttemptOutcome::Abandoned;
        }

        let (tx, mut rx) = mpsc::channel::<ActionItem>(16);
        let ctx = ActionContext::new(
            record.workflow_id.clone(),
            record.event_number,
            record.retry_count,
            policy.clone(),
            record.checkpoint.clone(),
            tx,
        );

        let mut deadline: Option<(tokio::time::Instant, Duration)> = None;
        let mut act = adapter.act_on(event, &ctx);

        // Drive the yield channel while the body runs. Items are handled
        // here so the adapter never holds engine locks across its yields.
        let result = loop {
            // Copied per iteration: the timeout arm must not borrow the
            // variable the Timeout item handler reassigns.
            let armed = deadline;
            tokio::select! {
                biased;

                item = rx.recv() => match item {
                    Some(ActionItem::Command { envelope, ack }) => {
                        let applied = self.apply_command(adapter, event, envelope).await;
                        let _ = ack.send(applied);
                    }
                    Some(ActionItem::Checkpoint { data, save_now, ack }) => {
                        record.merge_checkpoint(data);
                        let saved = if save_now {
                            self.store
                                .upsert_activity(record)
                                .await
                                .map_err(|e| ActivityError::new(e.to_string()))
                        } else {
                            Ok(())
                        };
                        let _ = ack.send(saved);
                    }
                    Some(ActionItem::Timeout { limit }) => {
                        deadline = Some((tokio::time::Instant::now() + limit, limit));
                    }
                    // The context is still borrowed by the body; a closed
                    // channel without completion cannot happen, but guard
                    // against it rather than spin.
                    None => break Err(ActivityError::new("yield channel closed")),
                },

                result = &mut act => break result,

                _ = async move {
                    match armed {
                        Some((at, _)) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    let limit = armed.map(|(_, limit)| limit).unwrap_or_default();
                    break Err(ActivityError::timeout(limit));
                }
            }
        };
        drop(act);

        let now = Utc::now();
        match result {
            Ok(()) => {
                record.status = ActivityStatus::Completed;
                record.finished_at = Some(now);
                record.last_error = None;
                if let Err(e) = self.store.upsert_activity(record).await {
                    error!(error = %e, "failed to persist completed record");
                }
                debug!("activity completed");
                AttemptOutcome::Completed
            }
            Err(activity_error) => {
                record.last_error = Some(activity_error.message.clone());
                let consumed = record.retry_count;

                if activity_error.retryable && policy.allows_retry(consumed) {
                    let delay = policy.delay_for_retry(consumed);
                    record.retry_count = consumed + 1;
                    record.status = ActivityStatus::Pending;
                    record.next_attempt_at = Some(
                        now + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::zero()),
                    );
                    warn!(
                        error = %activity_error,
                        delay_ms = delay.as_millis() as u64,
                        "activity failed; retry scheduled"
                    );
                    if let Err(e) = self.store.upsert_activity(record).await {
                        error!(error = %e, "failed to persist retry schedule");
                    }
                    AttemptOutcome::Retry(delay)
                } else {
                    record.status = ActivityStatus::Failed;
                    record.finished_at = Some(now);
                    warn!(error = %activity_error, "activity dead-lettered");
                    if let Err(e) = self.store.upsert_activity(record).await {
                        error!(error = %e, "failed to persist dead-letter record");
                    }
                    adapter.on_action_failed(event, &activity_error).await;
                    AttemptOutcome::DeadLettered
                }
            }
        }
    }
}

/// How one activity attempt ended.
enum AttemptOutcome {
    Completed,
    /// Retry after the in-process backoff sleep.
    Retry(Duration),
    DeadLettered,
    /// A store failure interrupted bookkeeping; the recovery sweep owns the
    /// record now.
    Abandoned,
}

/// Observes newly inserted events and runs matching adapters.
pub struct ActivityExecutor {
    shared: Arc<Shared>,
    adapters: Vec<Arc<dyn Adapter>>,
    partition: Partition,
    config: ExecutorConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl ActivityExecutor {
    pub fn new(
        store: Arc<dyn EventStore>,
        repositories: HashMap<String, Arc<Repository>>,
        adapters: Vec<Arc<dyn Adapter>>,
        partition: Partition,
        config: ExecutorConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let runner_id = format!("executor-{}", Uuid::now_v7());
        Self {
            shared: Arc::new(Shared {
                store,
                repositories,
                runner_id,
            }),
            adapters,
            partition,
            config,
            shutdown_rx,
        }
    }

    pub fn runner_id(&self) -> &str {
        &self.shared.runner_id
    }

    fn find_adapter(&self, event: &EventRecord) -> Option<Arc<dyn Adapter>> {
        let mut matches = self.adapters.iter().filter(|a| a.applies_to(event));
        let first = matches.next()?;
        if matches.next().is_some() {
            warn!(
                event_type = %event.event_type,
                adapter = first.name(),
                "multiple adapters match event; using the first"
            );
        }
        Some(first.clone())
    }

    fn policy_for(&self, adapter: &Arc<dyn Adapter>) -> RetryPolicy {
        adapter
            .retry_policy()
            .unwrap_or_else(|| self.config.retry_policy.clone())
    }

    /// Run until the stop signal, draining in-flight attempts before exit.
    pub async fn run(mut self) -> Result<(), ExecutorError> {
        let predicate = {
            let adapters = self.adapters.clone();
            Arc::new(FnPredicate(move |event: &EventRecord| {
                adapters.iter().any(|a| a.applies_to(event))
            }))
        };

        let mut reader = StreamReader::open(
            self.shared.store.clone(),
            reader_name(READER_GROUP, self.partition.index, self.partition.total),
            predicate,
        )
        .await?;

        info!(
            runner_id = %self.shared.runner_id,
            reader = reader.name(),
            adapters = self.adapters.len(),
            "activity executor started"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut tasks: JoinSet<(WorkflowId, i64)> = JoinSet::new();
        let mut in_flight: HashSet<(WorkflowId, i64)> = HashSet::new();

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            while let Some(done) = tasks.try_join_next() {
                if let Ok(key) = done {
                    in_flight.remove(&key);
                }
            }

            let recovered = self
                .sweep_due(&mut tasks, &mut in_flight, &semaphore)
                .await?;

            let batch = reader.next_batch(self.config.batch_size).await?;
            let fresh = !batch.is_empty();
            for event in batch {
                if !self.partition.contains(&event.workflow_id) {
                    continue;
                }
                self.launch_for_event(event, &mut tasks, &mut in_flight, &semaphore)
                    .await?;
            }
            // Offsets advance once records exist; recovery owns the rest.
            reader.commit_scanned().await?;

            if !fresh && recovered == 0 {
                let mut shutdown_rx = self.shutdown_rx.clone();
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
        }

        info!(in_flight = in_flight.len(), "executor draining");
        while tasks.join_next().await.is_some() {}
        reader.commit_scanned().await?;
        info!("activity executor stopped");
        Ok(())
    }

    /// Claim and spawn an attempt for a freshly delivered event.
    async fn launch_for_event(
        &self,
        event: EventRecord,
        tasks: &mut JoinSet<(WorkflowId, i64)>,
        in_flight: &mut HashSet<(WorkflowId, i64)>,
        semaphore: &Arc<Semaphore>,
    ) -> Result<(), ExecutorError> {
        let key = (event.workflow_id.clone(), event.workflow_version);
        if in_flight.contains(&key) {
            return Ok(());
        }

        let Some(adapter) = self.find_adapter(&event) else {
            return Ok(());
        };

        // Redelivery after a crash: the record decides what happens next.
        if let Some(existing) = self
            .shared
            .store
            .load_activity(&event.workflow_id, event.workflow_version)
            .await?
        {
            if existing.is_terminal() {
                return Ok(());
            }
            // Pending or running: the recovery sweep owns it.
            return Ok(());
        }

        let record = ActivityRecord::begin(
            event.workflow_type.clone(),
            event.workflow_id.clone(),
            event.workflow_version,
            self.shared.runner_id.clone(),
            Utc::now(),
        );
        self.shared.store.upsert_activity(&record).await?;

        self.spawn_attempt(adapter, event, record, tasks, in_flight, semaphore);
        Ok(())
    }

    /// Pick up due retries and records stranded by dead executors.
    async fn sweep_due(
        &self,
        tasks: &mut JoinSet<(WorkflowId, i64)>,
        in_flight: &mut HashSet<(WorkflowId, i64)>,
        semaphore: &Arc<Semaphore>,
    ) -> Result<usize, ExecutorError> {
        let now = Utc::now();
        let stale_cutoff = now
            - chrono::Duration::from_std(self.config.stale_after)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));

        let due = self
            .shared
            .store
            .due_activities(now, stale_cutoff, self.config.batch_size)
            .await?;

        let mut launched = 0;
        for record in due {
            if !self.partition.contains(&record.workflow_id) {
                continue;
            }
            let key = (record.workflow_id.clone(), record.event_number);
            if in_flight.contains(&key) {
                continue;
            }

            // Stranded records belong to someone else until the conditional
            // takeover succeeds.
            if record.runner_id != self.shared.runner_id {
                let claimed = match self
                    .shared
                    .store
                    .take_over_activity(
                        &record.workflow_id,
                        record.event_number,
                        &record.runner_id,
                        &self.shared.runner_id,
                    )
                    .await
                {
                    Ok(claimed) => claimed,
                    Err(StoreError::ActivityNotFound { .. }) => false,
                    Err(e) => return Err(e.into()),
                };
                if !claimed {
                    continue;
                }
                info!(
                    workflow_id = %record.workflow_id,
                    event_number = record.event_number,
                    previous = %record.runner_id,
                    "took over stranded activity"
                );
            }

            let Some(event) = self.load_trigger_event(&record).await? else {
                let mut dead = record.clone();
                dead.status = ActivityStatus::Failed;
                dead.last_error = Some("triggering event no longer readable".to_string());
                dead.finished_at = Some(now);
                self.shared.store.upsert_activity(&dead).await?;
                continue;
            };

            let Some(adapter) = self.find_adapter(&event) else {
                warn!(
                    workflow_id = %record.workflow_id,
                    event_number = record.event_number,
                    "no adapter matches recovered record; dead-lettering"
                );
                let mut dead = record.clone();
                dead.status = ActivityStatus::Failed;
                dead.last_error = Some("no matching adapter".to_string());
                dead.finished_at = Some(now);
                self.shared.store.upsert_activity(&dead).await?;
                continue;
            };

            let mut next = record;
            next.runner_id = self.shared.runner_id.clone();
            self.spawn_attempt(adapter, event, next, tasks, in_flight, semaphore);
            launched += 1;
        }

        Ok(launched)
    }

    fn spawn_attempt(
        &self,
        adapter: Arc<dyn Adapter>,
        event: EventRecord,
        record: ActivityRecord,
        tasks: &mut JoinSet<(WorkflowId, i64)>,
        in_flight: &mut HashSet<(WorkflowId, i64)>,
        semaphore: &Arc<Semaphore>,
    ) {
        let key = (record.workflow_id.clone(), record.event_number);
        in_flight.insert(key.clone());

        let shared = self.shared.clone();
        let policy = self.policy_for(&adapter);
        let semaphore = semaphore.clone();
        let shutdown_rx = self.shutdown_rx.clone();

        tasks.spawn(async move {
            // Closed only at shutdown, after which no new work is spawned.
            if let Ok(_permit) = semaphore.acquire().await {
                shared
                    .run_activity(adapter, event, record, policy, shutdown_rx)
                    .await;
            }
            key
        });
    }

    async fn load_trigger_event(
        &self,
        record: &ActivityRecord,
    ) -> Result<Option<EventRecord>, ExecutorError> {
        let events = self
            .shared
            .store
            .read_workflow_events(
                &record.workflow_type,
                &record.workflow_id,
                record.event_number - 1,
                Some(record.event_number),
            )
            .await?;
        Ok(events.into_iter().next())
    }
}

/// Operator entry point: re-enqueue a dead-lettered activity with a fresh
/// retry budget. The checkpoint survives, so an idempotent adapter resumes
/// where it crashed.
pub async fn retry_failed_action(
    store: &Arc<dyn EventStore>,
    workflow_id: &WorkflowId,
    event_number: i64,
) -> Result<(), StoreError> {
    let Some(mut record) = store.load_activity(workflow_id, event_number).await? else {
        return Err(StoreError::ActivityNotFound {
            workflow_id: workflow_id.clone(),
            event_number,
        });
    };

    record.status = ActivityStatus::Pending;
    record.retry_count = 0;
    record.next_attempt_at = Some(Utc::now());
    record.finished_at = None;
    store.upsert_activity(&record).await
}
