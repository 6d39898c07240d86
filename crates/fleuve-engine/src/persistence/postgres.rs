//! PostgreSQL implementation of EventStore
//!
//! Production persistence with:
//! - Optimistic concurrency via the per-instance version row (`FOR UPDATE`)
//! - A single shared `global_id` sequence; an advisory transaction lock
//!   serializes id allocation with commit, so a reader never observes id
//!   `g` before `g - 1` is committed
//! - `SKIP LOCKED`-free claim semantics: schedule and activity claims are
//!   conditional updates keyed on the previous value

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};

use super::store::*;
use crate::activity::record::{ActivityRecord, ActivityStatus};
use crate::delay::DelaySchedule;
use crate::workflow::{EventMetadata, EventRecord, Subscription, WorkflowId};

/// Advisory lock key for append serialization. Part of the wire format in
/// the same way the partition hash is: all writers of a deployment must
/// agree on it.
const APPEND_LOCK_KEY: i64 = 0x666c_6576_7565_0001;

/// PostgreSQL implementation of [`EventStore`].
///
/// # Example
///
/// ```ignore
/// use fleuve_engine::persistence::PostgresEventStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/fleuve").await?;
/// let store = PostgresEventStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the engine schema.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn row_to_event(row: &sqlx::postgres::PgRow) -> Result<EventRecord, StoreError> {
    let metadata: serde_json::Value = row.get("metadata");
    let metadata: EventMetadata = serde_json::from_value(metadata)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    Ok(EventRecord {
        global_id: row.get("global_id"),
        workflow_type: row.get("workflow_type"),
        workflow_id: WorkflowId::new(row.get::<String, _>("workflow_id")),
        workflow_version: row.get("workflow_version"),
        event_type: row.get("event_type"),
        schema_version: row.get("schema_version"),
        body: row.get("body"),
        metadata,
        created_at: row.get("created_at"),
    })
}

fn row_to_snapshot(row: &sqlx::postgres::PgRow) -> Snapshot {
    Snapshot {
        workflow_type: row.get("workflow_type"),
        workflow_id: WorkflowId::new(row.get::<String, _>("workflow_id")),
        at_version: row.get("at_version"),
        state: row.get("state"),
        created_at: row.get("created_at"),
    }
}

fn row_to_activity(row: &sqlx::postgres::PgRow) -> Result<ActivityRecord, StoreError> {
    let status: String = row.get("status");
    let status: ActivityStatus = serde_json::from_value(serde_json::Value::String(status))
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    let checkpoint: serde_json::Value = row.get("checkpoint");
    let checkpoint = checkpoint
        .as_object()
        .cloned()
        .unwrap_or_default();

    Ok(ActivityRecord {
        workflow_type: row.get("workflow_type"),
        workflow_id: WorkflowId::new(row.get::<String, _>("workflow_id")),
        event_number: row.get("event_number"),
        status,
        retry_count: row.get::<i32, _>("retry_count") as u32,
        checkpoint,
        runner_id: row.get("runner_id"),
        started_at: row.get("started_at"),
        last_attempt_at: row.get("last_attempt_at"),
        next_attempt_at: row.get("next_attempt_at"),
        finished_at: row.get("finished_at"),
        last_error: row.get("last_error"),
    })
}

fn row_to_schedule(row: &sqlx::postgres::PgRow) -> Result<DelaySchedule, StoreError> {
    let next_command: serde_json::Value = row.get("next_command");
    let next_command = serde_json::from_value(next_command)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    Ok(DelaySchedule {
        schedule_id: row.get("schedule_id"),
        workflow_type: row.get("workflow_type"),
        workflow_id: WorkflowId::new(row.get::<String, _>("workflow_id")),
        event_version: row.get("event_version"),
        delay_until: row.get("delay_until"),
        next_command,
        cron_expression: row.get("cron_expression"),
        timezone: row.get("timezone"),
        created_at: row.get("created_at"),
    })
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[instrument(skip(self, request), fields(workflow_id = %request.workflow_id))]
    async fn append(&self, request: AppendRequest) -> Result<AppendOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Serialize id allocation with commit; released at COMMIT/ROLLBACK.
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(APPEND_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        sqlx::query(
            r#"
            INSERT INTO fleuve_instances (workflow_type, workflow_id, version)
            VALUES ($1, $2, 0)
            ON CONFLICT (workflow_type, workflow_id) DO NOTHING
            "#,
        )
        .bind(&request.workflow_type)
        .bind(request.workflow_id.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let row = sqlx::query(
            r#"
            SELECT version FROM fleuve_instances
            WHERE workflow_type = $1 AND workflow_id = $2
            FOR UPDATE
            "#,
        )
        .bind(&request.workflow_type)
        .bind(request.workflow_id.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        let current: i64 = row.get("version");
        if current != request.expected_version {
            return Err(StoreError::VersionConflict {
                workflow_id: request.workflow_id.clone(),
                expected: request.expected_version,
                actual: current,
            });
        }

        let mut records = Vec::with_capacity(request.events.len());
        let mut version = current;
        for event in &request.events {
            version += 1;
            let metadata = serde_json::to_value(&event.metadata)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;

            let row = sqlx::query(
                r#"
                INSERT INTO fleuve_events
                    (workflow_type, workflow_id, workflow_version, event_type,
                     schema_version, body, metadata)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                RETURNING global_id, created_at
                "#,
            )
            .bind(&request.workflow_type)
            .bind(request.workflow_id.as_str())
            .bind(version)
            .bind(&event.event_type)
            .bind(event.schema_version)
            .bind(&event.body)
            .bind(&metadata)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;

            records.push(EventRecord {
                global_id: row.get("global_id"),
                workflow_type: request.workflow_type.clone(),
                workflow_id: request.workflow_id.clone(),
                workflow_version: version,
                event_type: event.event_type.clone(),
                schema_version: event.schema_version,
                body: event.body.clone(),
                metadata: event.metadata.clone(),
                created_at: row.get("created_at"),
            });
        }

        sqlx::query(
            r#"
            UPDATE fleuve_instances SET version = $3, updated_at = now()
            WHERE workflow_type = $1 AND workflow_id = $2
            "#,
        )
        .bind(&request.workflow_type)
        .bind(request.workflow_id.as_str())
        .bind(version)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if let Some(snapshot) = &request.snapshot {
            sqlx::query(
                r#"
                INSERT INTO fleuve_snapshots (workflow_type, workflow_id, at_version, state, created_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (workflow_id, at_version) DO UPDATE SET state = EXCLUDED.state
                "#,
            )
            .bind(&snapshot.workflow_type)
            .bind(snapshot.workflow_id.as_str())
            .bind(snapshot.at_version)
            .bind(&snapshot.state)
            .bind(snapshot.created_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        for subscription in &request.subscribe {
            sqlx::query(
                r#"
                INSERT INTO fleuve_subscriptions
                    (subscriber_type, subscriber_id, event_type, source_workflow_id)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(&request.workflow_type)
            .bind(request.workflow_id.as_str())
            .bind(&subscription.event_type)
            .bind(&subscription.source_workflow_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        for subscription in &request.unsubscribe {
            sqlx::query(
                r#"
                DELETE FROM fleuve_subscriptions
                WHERE subscriber_type = $1 AND subscriber_id = $2
                  AND event_type = $3 AND source_workflow_id = $4
                "#,
            )
            .bind(&request.workflow_type)
            .bind(request.workflow_id.as_str())
            .bind(&subscription.event_type)
            .bind(&subscription.source_workflow_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        for schedule in &request.schedules {
            let next_command = serde_json::to_value(&schedule.next_command)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            sqlx::query(
                r#"
                INSERT INTO fleuve_schedules
                    (schedule_id, workflow_type, workflow_id, event_version,
                     delay_until, next_command, cron_expression, timezone, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (schedule_id) DO UPDATE SET
                    delay_until = EXCLUDED.delay_until,
                    next_command = EXCLUDED.next_command,
                    cron_expression = EXCLUDED.cron_expression,
                    timezone = EXCLUDED.timezone
                "#,
            )
            .bind(&schedule.schedule_id)
            .bind(&schedule.workflow_type)
            .bind(schedule.workflow_id.as_str())
            .bind(schedule.event_version)
            .bind(schedule.delay_until)
            .bind(&next_command)
            .bind(&schedule.cron_expression)
            .bind(&schedule.timezone)
            .bind(schedule.created_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        for schedule_id in &request.cancel_schedules {
            sqlx::query("DELETE FROM fleuve_schedules WHERE schedule_id = $1")
                .bind(schedule_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        if let Some(sync) = &request.sync {
            sync(SyncTxn::Postgres(&mut *tx)).await?;
        }

        tx.commit().await.map_err(db_err)?;

        debug!(
            workflow_id = %request.workflow_id,
            new_version = version,
            events = records.len(),
            "appended events"
        );

        Ok(AppendOutcome {
            records,
            new_version: version,
        })
    }

    #[instrument(skip(self))]
    async fn read_stream(&self, after: i64, limit: usize) -> Result<Vec<EventRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT global_id, workflow_type, workflow_id, workflow_version,
                   event_type, schema_version, body, metadata, created_at
            FROM fleuve_events
            WHERE global_id > $1
            ORDER BY global_id
            LIMIT $2
            "#,
        )
        .bind(after)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to read stream: {}", e);
            db_err(e)
        })?;

        rows.iter().map(row_to_event).collect()
    }

    async fn max_global_id(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COALESCE(MAX(global_id), 0) AS max_id FROM fleuve_events")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.get("max_id"))
    }

    #[instrument(skip(self))]
    async fn read_workflow_events(
        &self,
        workflow_type: &str,
        workflow_id: &WorkflowId,
        after_version: i64,
        up_to_version: Option<i64>,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT global_id, workflow_type, workflow_id, workflow_version,
                   event_type, schema_version, body, metadata, created_at
            FROM fleuve_events
            WHERE workflow_type = $1 AND workflow_id = $2
              AND workflow_version > $3
              AND ($4::bigint IS NULL OR workflow_version <= $4)
            ORDER BY workflow_version
            "#,
        )
        .bind(workflow_type)
        .bind(workflow_id.as_str())
        .bind(after_version)
        .bind(up_to_version)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_event).collect()
    }

    async fn current_version(
        &self,
        workflow_type: &str,
        workflow_id: &WorkflowId,
    ) -> Result<Option<i64>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT version FROM fleuve_instances
            WHERE workflow_type = $1 AND workflow_id = $2
            "#,
        )
        .bind(workflow_type)
        .bind(workflow_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        // A row at version 0 exists only from an aborted create; treat it
        // as absent.
        Ok(row
            .map(|r| r.get::<i64, _>("version"))
            .filter(|v| *v > 0))
    }

    async fn latest_snapshot(
        &self,
        workflow_id: &WorkflowId,
        at_or_below: Option<i64>,
    ) -> Result<Option<Snapshot>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT workflow_type, workflow_id, at_version, state, created_at
            FROM fleuve_snapshots
            WHERE workflow_id = $1
              AND ($2::bigint IS NULL OR at_version <= $2)
            ORDER BY at_version DESC
            LIMIT 1
            "#,
        )
        .bind(workflow_id.as_str())
        .bind(at_or_below)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.as_ref().map(row_to_snapshot))
    }

    async fn subscribers_of(
        &self,
        subscriber_type: &str,
        event_type: &str,
        source: &WorkflowId,
    ) -> Result<Vec<WorkflowId>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT subscriber_id
            FROM fleuve_subscriptions
            WHERE subscriber_type = $1
              AND event_type IN ($2, '*')
              AND source_workflow_id IN ($3, '*')
            ORDER BY subscriber_id
            "#,
        )
        .bind(subscriber_type)
        .bind(event_type)
        .bind(source.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .iter()
            .map(|row| WorkflowId::new(row.get::<String, _>("subscriber_id")))
            .collect())
    }

    async fn load_offset(&self, reader_name: &str) -> Result<Option<i64>, StoreError> {
        let row = sqlx::query("SELECT last_global_id FROM fleuve_offsets WHERE reader_name = $1")
            .bind(reader_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(row.map(|r| r.get("last_global_id")))
    }

    async fn commit_offset(
        &self,
        reader_name: &str,
        expected: Option<i64>,
        new_offset: i64,
    ) -> Result<(), StoreError> {
        let result = match expected {
            None => sqlx::query(
                r#"
                INSERT INTO fleuve_offsets (reader_name, last_global_id)
                VALUES ($1, $2)
                ON CONFLICT (reader_name) DO NOTHING
                "#,
            )
            .bind(reader_name)
            .bind(new_offset)
            .execute(&self.pool)
            .await
            .map_err(db_err)?,
            Some(expected) => sqlx::query(
                r#"
                UPDATE fleuve_offsets
                SET last_global_id = $3, updated_at = now()
                WHERE reader_name = $1 AND last_global_id = $2
                "#,
            )
            .bind(reader_name)
            .bind(expected)
            .bind(new_offset)
            .execute(&self.pool)
            .await
            .map_err(db_err)?,
        };

        if result.rows_affected() == 0 {
            let actual = self.load_offset(reader_name).await?;
            return Err(StoreError::OffsetConflict {
                reader: reader_name.to_string(),
                expected,
                actual,
            });
        }
        Ok(())
    }

    async fn delete_offset(&self, reader_name: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM fleuve_offsets WHERE reader_name = $1")
            .bind(reader_name)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn list_offsets(&self) -> Result<Vec<(String, i64)>, StoreError> {
        let rows =
            sqlx::query("SELECT reader_name, last_global_id FROM fleuve_offsets ORDER BY reader_name")
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;

        Ok(rows
            .iter()
            .map(|row| (row.get("reader_name"), row.get("last_global_id")))
            .collect())
    }

    async fn load_activity(
        &self,
        workflow_id: &WorkflowId,
        event_number: i64,
    ) -> Result<Option<ActivityRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT workflow_type, workflow_id, event_number, status, retry_count,
                   checkpoint, runner_id, started_at, last_attempt_at,
                   next_attempt_at, finished_at, last_error
            FROM fleuve_activities
            WHERE workflow_id = $1 AND event_number = $2
            "#,
        )
        .bind(workflow_id.as_str())
        .bind(event_number)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(row_to_activity).transpose()
    }

    async fn upsert_activity(&self, record: &ActivityRecord) -> Result<(), StoreError> {
        let checkpoint = serde_json::Value::Object(record.checkpoint.clone());
        sqlx::query(
            r#"
            INSERT INTO fleuve_activities
                (workflow_type, workflow_id, event_number, status, retry_count,
                 checkpoint, runner_id, started_at, last_attempt_at,
                 next_attempt_at, finished_at, last_error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (workflow_id, event_number) DO UPDATE SET
                status = EXCLUDED.status,
                retry_count = EXCLUDED.retry_count,
                checkpoint = EXCLUDED.checkpoint,
                runner_id = EXCLUDED.runner_id,
                last_attempt_at = EXCLUDED.last_attempt_at,
                next_attempt_at = EXCLUDED.next_attempt_at,
                finished_at = EXCLUDED.finished_at,
                last_error = EXCLUDED.last_error
            "#,
        )
        .bind(&record.workflow_type)
        .bind(record.workflow_id.as_str())
        .bind(record.event_number)
        .bind(record.status.to_string())
        .bind(record.retry_count as i32)
        .bind(&checkpoint)
        .bind(&record.runner_id)
        .bind(record.started_at)
        .bind(record.last_attempt_at)
        .bind(record.next_attempt_at)
        .bind(record.finished_at)
        .bind(&record.last_error)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn take_over_activity(
        &self,
        workflow_id: &WorkflowId,
        event_number: i64,
        previous_runner: &str,
        new_runner: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE fleuve_activities
            SET runner_id = $4
            WHERE workflow_id = $1 AND event_number = $2 AND runner_id = $3
            "#,
        )
        .bind(workflow_id.as_str())
        .bind(event_number)
        .bind(previous_runner)
        .bind(new_runner)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let exists = sqlx::query(
            "SELECT 1 FROM fleuve_activities WHERE workflow_id = $1 AND event_number = $2",
        )
        .bind(workflow_id.as_str())
        .bind(event_number)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match exists {
            Some(_) => Ok(false),
            None => Err(StoreError::ActivityNotFound {
                workflow_id: workflow_id.clone(),
                event_number,
            }),
        }
    }

    async fn due_activities(
        &self,
        now: DateTime<Utc>,
        stale_cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ActivityRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT workflow_type, workflow_id, event_number, status, retry_count,
                   checkpoint, runner_id, started_at, last_attempt_at,
                   next_attempt_at, finished_at, last_error
            FROM fleuve_activities
            WHERE (status = 'pending' AND (next_attempt_at IS NULL OR next_attempt_at <= $1))
               OR (status = 'running' AND (
                        (next_attempt_at IS NOT NULL AND next_attempt_at <= $1)
                     OR (next_attempt_at IS NULL AND last_attempt_at <= $2)))
            ORDER BY last_attempt_at
            LIMIT $3
            "#,
        )
        .bind(now)
        .bind(stale_cutoff)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_activity).collect()
    }

    async fn list_activities(
        &self,
        status: Option<ActivityStatus>,
        limit: usize,
    ) -> Result<Vec<ActivityRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT workflow_type, workflow_id, event_number, status, retry_count,
                   checkpoint, runner_id, started_at, last_attempt_at,
                   next_attempt_at, finished_at, last_error
            FROM fleuve_activities
            WHERE ($1::text IS NULL OR status = $1)
            ORDER BY last_attempt_at DESC
            LIMIT $2
            "#,
        )
        .bind(status.map(|s| s.to_string()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_activity).collect()
    }

    async fn due_schedules(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DelaySchedule>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT schedule_id, workflow_type, workflow_id, event_version,
                   delay_until, next_command, cron_expression, timezone, created_at
            FROM fleuve_schedules
            WHERE delay_until <= $1
            ORDER BY delay_until
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_schedule).collect()
    }

    async fn next_schedule_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = sqlx::query("SELECT MIN(delay_until) AS next FROM fleuve_schedules")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.get("next"))
    }

    async fn delete_schedule_if(
        &self,
        schedule_id: &str,
        expected_fire: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM fleuve_schedules WHERE schedule_id = $1 AND delay_until = $2",
        )
        .bind(schedule_id)
        .bind(expected_fire)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn reschedule(
        &self,
        schedule_id: &str,
        expected_fire: DateTime<Utc>,
        next_fire: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE fleuve_schedules SET delay_until = $3
            WHERE schedule_id = $1 AND delay_until = $2
            "#,
        )
        .bind(schedule_id)
        .bind(expected_fire)
        .bind(next_fire)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_schedule(&self, schedule_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM fleuve_schedules WHERE schedule_id = $1")
            .bind(schedule_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn truncation_candidates(&self, limit: usize) -> Result<Vec<Snapshot>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (s.workflow_id)
                   s.workflow_type, s.workflow_id, s.at_version, s.state, s.created_at
            FROM fleuve_snapshots s
            WHERE EXISTS (
                SELECT 1 FROM fleuve_events e
                WHERE e.workflow_type = s.workflow_type
                  AND e.workflow_id = s.workflow_id
                  AND e.workflow_version <= s.at_version
            )
            ORDER BY s.workflow_id, s.at_version DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.iter().map(row_to_snapshot).collect())
    }

    async fn delete_events_below(
        &self,
        workflow_type: &str,
        workflow_id: &WorkflowId,
        up_to_version: i64,
        max_global_id: i64,
        created_before: DateTime<Utc>,
        batch: usize,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM fleuve_events
            WHERE global_id IN (
                SELECT global_id FROM fleuve_events
                WHERE workflow_type = $1 AND workflow_id = $2
                  AND workflow_version <= $3
                  AND global_id <= $4
                  AND created_at < $5
                ORDER BY global_id
                LIMIT $6
            )
            "#,
        )
        .bind(workflow_type)
        .bind(workflow_id.as_str())
        .bind(up_to_version)
        .bind(max_global_id)
        .bind(created_before)
        .bind(batch as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }
}
