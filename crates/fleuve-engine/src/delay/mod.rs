//! Delay schedules and the scheduler loop
//!
//! Workflows request delays from `decide`; the repository records them as
//! schedule rows in the append transaction. The scheduler scans due rows,
//! appends a `delay-complete` event, dispatches the stored command, and
//! either deletes the row (one-shot) or advances it to the next cron fire.

pub mod cron;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::persistence::{EventStore, StoreError};
use crate::repository::{CommandError, Repository};
use crate::workflow::{CommandEnvelope, DelayFire, DelayRequest, WorkflowId};

pub use cron::{next_fire, validate as validate_cron, CronError};

/// A timer row owned by the delay subsystem. One-shot rows are deleted when
/// they fire; cron rows are rewritten with the next fire time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelaySchedule {
    pub schedule_id: String,
    pub workflow_type: String,
    pub workflow_id: WorkflowId,
    /// Version of the event that created this schedule.
    pub event_version: i64,
    pub delay_until: DateTime<Utc>,
    pub next_command: CommandEnvelope,
    pub cron_expression: Option<String>,
    pub timezone: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl DelaySchedule {
    /// Build the row for a decide-emitted request. Cron requests resolve
    /// their first fire from `now`.
    pub fn from_request(
        workflow_type: impl Into<String>,
        workflow_id: WorkflowId,
        event_version: i64,
        request: &DelayRequest,
        now: DateTime<Utc>,
    ) -> Result<Self, CronError> {
        let (delay_until, cron_expression, timezone) = match &request.fire {
            DelayFire::At { delay_until } => (*delay_until, None, None),
            DelayFire::Cron {
                expression,
                timezone,
            } => {
                let first = cron::next_fire(expression, timezone.as_deref(), now)?;
                (first, Some(expression.clone()), timezone.clone())
            }
        };

        Ok(Self {
            schedule_id: request.schedule_id.clone(),
            workflow_type: workflow_type.into(),
            workflow_id,
            event_version,
            delay_until,
            next_command: request.next_command.clone(),
            cron_expression,
            timezone,
            created_at: now,
        })
    }

    pub fn is_cron(&self) -> bool {
        self.cron_expression.is_some()
    }
}

/// Errors that abort the scheduler task.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Scans due delay schedules and fires them.
///
/// Firing is at-least-once: the `delay-complete` event and command dispatch
/// happen before the row is claimed away, so a crash in between refires on
/// restart and `decide` idempotency absorbs the duplicate.
pub struct DelayScheduler {
    store: Arc<dyn EventStore>,
    repositories: HashMap<String, Arc<Repository>>,
    poll_interval: Duration,
    batch_size: usize,
    shutdown_rx: watch::Receiver<bool>,
}

impl DelayScheduler {
    pub fn new(
        store: Arc<dyn EventStore>,
        repositories: HashMap<String, Arc<Repository>>,
        poll_interval: Duration,
        batch_size: usize,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            repositories,
            poll_interval,
            batch_size: batch_size.max(1),
            shutdown_rx,
        }
    }

    /// Run until the stop signal. Drains the current scan before exiting.
    pub async fn run(mut self) -> Result<(), SchedulerError> {
        info!("delay scheduler started");

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            let fired = self.scan_once(Utc::now()).await?;

            if fired == 0 {
                let sleep_for = self.time_until_next().await?;
                let mut shutdown_rx = self.shutdown_rx.clone();
                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
        }

        info!("delay scheduler stopped");
        Ok(())
    }

    /// One scan pass. Returns how many schedules fired.
    #[instrument(skip(self))]
    pub async fn scan_once(&self, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        let due = self.store.due_schedules(now, self.batch_size).await?;
        let mut fired = 0;

        for schedule in due {
            if *self.shutdown_rx.borrow() {
                break;
            }
            match self.fire(&schedule, now).await {
                Ok(()) => fired += 1,
                Err(SchedulerError::Store(e)) if e.is_transient() => {
                    warn!(schedule_id = %schedule.schedule_id, error = %e, "transient error firing schedule");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(fired)
    }

    /// Fire one due schedule: delay-complete event, then the stored command,
    /// then re-enqueue (cron) or delete (one-shot). At most one fire per
    /// visit to the row.
    async fn fire(&self, schedule: &DelaySchedule, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        let Some(repository) = self.repositories.get(&schedule.workflow_type) else {
            error!(
                workflow_type = %schedule.workflow_type,
                schedule_id = %schedule.schedule_id,
                "no repository for schedule's workflow type; deleting orphan"
            );
            self.store.delete_schedule(&schedule.schedule_id).await?;
            return Ok(());
        };

        debug!(
            schedule_id = %schedule.schedule_id,
            workflow_id = %schedule.workflow_id,
            "firing delay schedule"
        );

        match repository
            .mark_delay_complete(&schedule.workflow_id, &schedule.schedule_id)
            .await
        {
            Ok(_) => {}
            Err(CommandError::NotFound(_)) => {
                warn!(schedule_id = %schedule.schedule_id, "workflow gone; dropping schedule");
                self.store.delete_schedule(&schedule.schedule_id).await?;
                return Ok(());
            }
            Err(e) if e.is_retryable() => {
                return Err(SchedulerError::Store(StoreError::Database(e.to_string())))
            }
            Err(e) => {
                debug!(schedule_id = %schedule.schedule_id, error = %e, "delay-complete skipped");
            }
        }

        match repository
            .process_command_envelope(&schedule.workflow_id, schedule.next_command.clone())
            .await
        {
            Ok(outcome) => {
                debug!(
                    schedule_id = %schedule.schedule_id,
                    new_version = outcome.state.version,
                    "delayed command applied"
                );
            }
            Err(e) if e.is_retryable() => {
                return Err(SchedulerError::Store(StoreError::Database(e.to_string())))
            }
            Err(e) => {
                // Lifecycle gates and business rejections are expected here.
                debug!(schedule_id = %schedule.schedule_id, error = %e, "delayed command skipped");
            }
        }

        if let Some(expression) = &schedule.cron_expression {
            match cron::next_fire(expression, schedule.timezone.as_deref(), now) {
                Ok(next) => {
                    let advanced = self
                        .store
                        .reschedule(&schedule.schedule_id, schedule.delay_until, next)
                        .await?;
                    if !advanced {
                        debug!(schedule_id = %schedule.schedule_id, "cron row claimed elsewhere");
                    }
                }
                Err(e) => {
                    error!(schedule_id = %schedule.schedule_id, error = %e, "cron stepping failed; deleting");
                    self.store.delete_schedule(&schedule.schedule_id).await?;
                }
            }
        } else {
            let claimed = self
                .store
                .delete_schedule_if(&schedule.schedule_id, schedule.delay_until)
                .await?;
            if !claimed {
                debug!(schedule_id = %schedule.schedule_id, "one-shot row claimed elsewhere");
            }
        }

        Ok(())
    }

    /// Sleep until the soonest schedule or the poll interval, whichever is
    /// closer.
    async fn time_until_next(&self) -> Result<Duration, SchedulerError> {
        let next = self.store.next_schedule_at().await?;
        let now = Utc::now();
        Ok(match next {
            Some(at) if at > now => {
                let until = (at - now).to_std().unwrap_or(self.poll_interval);
                until.min(self.poll_interval)
            }
            Some(_) => Duration::ZERO,
            None => self.poll_interval,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn request_at(ts: DateTime<Utc>) -> DelayRequest {
        DelayRequest::at(
            "s-1",
            ts,
            CommandEnvelope::new("wake", json!({"type": "wake"})),
        )
    }

    #[test]
    fn test_one_shot_row_from_request() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
        let fire_at = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();

        let row = DelaySchedule::from_request(
            "order",
            WorkflowId::new("ord-1"),
            4,
            &request_at(fire_at),
            now,
        )
        .unwrap();

        assert_eq!(row.delay_until, fire_at);
        assert!(!row.is_cron());
        assert_eq!(row.event_version, 4);
    }

    #[test]
    fn test_cron_row_resolves_first_fire() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 8, 30, 0).unwrap();
        let request = DelayRequest::cron(
            "daily",
            "0 9 * * *",
            Some("UTC".to_string()),
            CommandEnvelope::new("report", json!({"type": "report"})),
        );

        let row =
            DelaySchedule::from_request("order", WorkflowId::new("ord-1"), 1, &request, now)
                .unwrap();

        assert!(row.is_cron());
        assert_eq!(
            row.delay_until,
            Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_cron_row_rejects_bad_expression() {
        let request = DelayRequest::cron(
            "bad",
            "nonsense",
            None,
            CommandEnvelope::new("x", json!({})),
        );
        let result =
            DelaySchedule::from_request("order", WorkflowId::new("ord-1"), 1, &request, Utc::now());
        assert!(result.is_err());
    }
}
