//! In-memory implementation of EventStore for testing
//!
//! Same semantics as the PostgreSQL implementation: version fencing, a
//! single global id sequence, CAS offsets and claim-style schedule updates.
//! All state lives behind one lock, which trivially satisfies the
//! no-gaps visibility contract.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::store::*;
use crate::activity::record::{ActivityRecord, ActivityStatus};
use crate::delay::DelaySchedule;
use crate::workflow::{EventRecord, Subscription, WorkflowId};

#[derive(Default)]
struct Inner {
    events: Vec<EventRecord>,
    /// (workflow_type, workflow_id) → committed version.
    versions: HashMap<(String, WorkflowId), i64>,
    /// workflow_id → snapshots ascending by version.
    snapshots: HashMap<WorkflowId, Vec<Snapshot>>,
    /// (subscriber_type, subscriber_id) → live subscriptions.
    subscriptions: HashMap<(String, WorkflowId), Vec<Subscription>>,
    offsets: HashMap<String, i64>,
    activities: HashMap<(WorkflowId, i64), ActivityRecord>,
    schedules: HashMap<String, DelaySchedule>,
    next_global_id: i64,
}

/// In-memory store, primarily for tests.
///
/// # Example
///
/// ```
/// use fleuve_engine::persistence::InMemoryEventStore;
///
/// let store = InMemoryEventStore::new();
/// ```
pub struct InMemoryEventStore {
    inner: Mutex<Inner>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_global_id: 1,
                ..Default::default()
            }),
        }
    }

    /// Total committed events, all workflows.
    pub fn event_count(&self) -> usize {
        self.inner.lock().events.len()
    }

    /// Number of live schedule rows.
    pub fn schedule_count(&self) -> usize {
        self.inner.lock().schedules.len()
    }

    /// Clear all data (for tests).
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        *inner = Inner {
            next_global_id: 1,
            ..Default::default()
        };
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, request: AppendRequest) -> Result<AppendOutcome, StoreError> {
        let key = (request.workflow_type.clone(), request.workflow_id.clone());

        let fence = |inner: &Inner| -> Result<i64, StoreError> {
            let current = inner.versions.get(&key).copied().unwrap_or(0);
            if current != request.expected_version {
                return Err(StoreError::VersionConflict {
                    workflow_id: request.workflow_id.clone(),
                    expected: request.expected_version,
                    actual: current,
                });
            }
            Ok(current)
        };

        // Pre-check the fence so a doomed append never runs the hook, then
        // run the hook without the lock held (it awaits), then re-check.
        fence(&self.inner.lock())?;
        if let Some(sync) = &request.sync {
            sync(SyncTxn::Memory).await?;
        }

        let mut inner = self.inner.lock();
        let current = fence(&inner)?;

        let now = Utc::now();
        let mut records = Vec::with_capacity(request.events.len());
        let mut version = current;
        for event in &request.events {
            version += 1;
            let global_id = inner.next_global_id;
            inner.next_global_id += 1;
            records.push(EventRecord {
                global_id,
                workflow_type: request.workflow_type.clone(),
                workflow_id: request.workflow_id.clone(),
                workflow_version: version,
                event_type: event.event_type.clone(),
                schema_version: event.schema_version,
                body: event.body.clone(),
                metadata: event.metadata.clone(),
                created_at: now,
            });
        }

        inner.events.extend(records.iter().cloned());
        inner.versions.insert(key, version);

        if let Some(snapshot) = request.snapshot {
            let entry = inner
                .snapshots
                .entry(snapshot.workflow_id.clone())
                .or_default();
            entry.retain(|s| s.at_version != snapshot.at_version);
            entry.push(snapshot);
            entry.sort_by_key(|s| s.at_version);
        }

        let sub_key = (request.workflow_type.clone(), request.workflow_id.clone());
        if !request.subscribe.is_empty() || !request.unsubscribe.is_empty() {
            let subs = inner.subscriptions.entry(sub_key).or_default();
            for sub in &request.unsubscribe {
                subs.retain(|existing| existing != sub);
            }
            for sub in &request.subscribe {
                if !subs.contains(sub) {
                    subs.push(sub.clone());
                }
            }
        }

        for schedule in request.schedules {
            inner
                .schedules
                .insert(schedule.schedule_id.clone(), schedule);
        }
        for schedule_id in &request.cancel_schedules {
            inner.schedules.remove(schedule_id);
        }

        Ok(AppendOutcome {
            records,
            new_version: version,
        })
    }

    async fn read_stream(&self, after: i64, limit: usize) -> Result<Vec<EventRecord>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .events
            .iter()
            .filter(|e| e.global_id > after)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn max_global_id(&self) -> Result<i64, StoreError> {
        let inner = self.inner.lock();
        Ok(inner.next_global_id - 1)
    }

    async fn read_workflow_events(
        &self,
        workflow_type: &str,
        workflow_id: &WorkflowId,
        after_version: i64,
        up_to_version: Option<i64>,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .events
            .iter()
            .filter(|e| {
                e.workflow_type == workflow_type
                    && &e.workflow_id == workflow_id
                    && e.workflow_version > after_version
                    && up_to_version.is_none_or(|bound| e.workflow_version <= bound)
            })
            .cloned()
            .collect())
    }

    async fn current_version(
        &self,
        workflow_type: &str,
        workflow_id: &WorkflowId,
    ) -> Result<Option<i64>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .versions
            .get(&(workflow_type.to_string(), workflow_id.clone()))
            .copied())
    }

    async fn latest_snapshot(
        &self,
        workflow_id: &WorkflowId,
        at_or_below: Option<i64>,
    ) -> Result<Option<Snapshot>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner.snapshots.get(workflow_id).and_then(|snapshots| {
            snapshots
                .iter()
                .filter(|s| at_or_below.is_none_or(|bound| s.at_version <= bound))
                .next_back()
                .cloned()
        }))
    }

    async fn subscribers_of(
        &self,
        subscriber_type: &str,
        event_type: &str,
        source: &WorkflowId,
    ) -> Result<Vec<WorkflowId>, StoreError> {
        let inner = self.inner.lock();
        let mut subscribers = Vec::new();
        for ((sub_type, sub_id), subs) in &inner.subscriptions {
            if sub_type != subscriber_type {
                continue;
            }
            if subs.iter().any(|s| s.matches_parts(event_type, source)) {
                subscribers.push(sub_id.clone());
            }
        }
        subscribers.sort();
        Ok(subscribers)
    }

    async fn load_offset(&self, reader_name: &str) -> Result<Option<i64>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner.offsets.get(reader_name).copied())
    }

    async fn commit_offset(
        &self,
        reader_name: &str,
        expected: Option<i64>,
        new_offset: i64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let actual = inner.offsets.get(reader_name).copied();
        if actual != expected {
            return Err(StoreError::OffsetConflict {
                reader: reader_name.to_string(),
                expected,
                actual,
            });
        }
        inner.offsets.insert(reader_name.to_string(), new_offset);
        Ok(())
    }

    async fn delete_offset(&self, reader_name: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.offsets.remove(reader_name);
        Ok(())
    }

    async fn list_offsets(&self) -> Result<Vec<(String, i64)>, StoreError> {
        let inner = self.inner.lock();
        let mut offsets: Vec<_> = inner
            .offsets
            .iter()
            .map(|(name, offset)| (name.clone(), *offset))
            .collect();
        offsets.sort();
        Ok(offsets)
    }

    async fn load_activity(
        &self,
        workflow_id: &WorkflowId,
        event_number: i64,
    ) -> Result<Option<ActivityRecord>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .activities
            .get(&(workflow_id.clone(), event_number))
            .cloned())
    }

    async fn upsert_activity(&self, record: &ActivityRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.activities.insert(
            (record.workflow_id.clone(), record.event_number),
            record.clone(),
        );
        Ok(())
    }

    async fn take_over_activity(
        &self,
        workflow_id: &WorkflowId,
        event_number: i64,
        previous_runner: &str,
        new_runner: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        match inner.activities.get_mut(&(workflow_id.clone(), event_number)) {
            Some(record) if record.runner_id == previous_runner => {
                record.runner_id = new_runner.to_string();
                Ok(true)
            }
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
        let inner = self.inner.lock();
        let mut due: Vec<_> = inner
            .activities
            .values()
            .filter(|r| match r.status {
                ActivityStatus::Pending => {
                    r.next_attempt_at.is_none_or(|at| at <= now)
                }
                ActivityStatus::Running => match r.next_attempt_at {
                    Some(at) => at <= now,
                    None => r.last_attempt_at <= stale_cutoff,
                },
                _ => false,
            })
            .cloned()
            .collect();
        due.sort_by_key(|r| r.last_attempt_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn list_activities(
        &self,
        status: Option<ActivityStatus>,
        limit: usize,
    ) -> Result<Vec<ActivityRecord>, StoreError> {
        let inner = self.inner.lock();
        let mut records: Vec<_> = inner
            .activities
            .values()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.last_attempt_at.cmp(&a.last_attempt_at));
        records.truncate(limit);
        Ok(records)
    }

    async fn due_schedules(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DelaySchedule>, StoreError> {
        let inner = self.inner.lock();
        let mut due: Vec<_> = inner
            .schedules
            .values()
            .filter(|s| s.delay_until <= now)
            .cloned()
            .collect();
        due.sort_by_key(|s| s.delay_until);
        due.truncate(limit);
        Ok(due)
    }

    async fn next_schedule_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner.schedules.values().map(|s| s.delay_until).min())
    }

    async fn delete_schedule_if(
        &self,
        schedule_id: &str,
        expected_fire: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        match inner.schedules.get(schedule_id) {
            Some(schedule) if schedule.delay_until == expected_fire => {
                inner.schedules.remove(schedule_id);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }

    async fn reschedule(
        &self,
        schedule_id: &str,
        expected_fire: DateTime<Utc>,
        next_fire: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        match inner.schedules.get_mut(schedule_id) {
            Some(schedule) if schedule.delay_until == expected_fire => {
                schedule.delay_until = next_fire;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }

    async fn delete_schedule(&self, schedule_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.schedules.remove(schedule_id);
        Ok(())
    }

    async fn truncation_candidates(&self, limit: usize) -> Result<Vec<Snapshot>, StoreError> {
        let inner = self.inner.lock();
        let mut candidates = Vec::new();
        for snapshots in inner.snapshots.values() {
            let Some(latest) = snapshots.last() else {
                continue;
            };
            let has_events_below = inner.events.iter().any(|e| {
                e.workflow_type == latest.workflow_type
                    && e.workflow_id == latest.workflow_id
                    && e.workflow_version <= latest.at_version
            });
            if has_events_below {
                candidates.push(latest.clone());
            }
            if candidates.len() >= limit {
                break;
            }
        }
        Ok(candidates)
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
        let mut inner = self.inner.lock();
        let mut deleted = 0u64;
        inner.events.retain(|e| {
            let eligible = e.workflow_type == workflow_type
                && &e.workflow_id == workflow_id
                && e.workflow_version <= up_to_version
                && e.global_id <= max_global_id
                && e.created_at < created_before;
            if eligible && (deleted as usize) < batch {
                deleted += 1;
                false
            } else {
                true
            }
        });
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::NewEvent;
    use serde_json::json;

    fn event(event_type: &str) -> NewEvent {
        NewEvent::new(event_type, 1, json!({"type": event_type}))
    }

    #[tokio::test]
    async fn test_append_assigns_versions_and_global_ids() {
        let store = InMemoryEventStore::new();

        let outcome = store
            .append(AppendRequest::events(
                "order",
                WorkflowId::new("ord-1"),
                0,
                vec![event("order.placed"), event("order.tagged")],
            ))
            .await
            .unwrap();

        assert_eq!(outcome.new_version, 2);
        assert_eq!(outcome.records[0].workflow_version, 1);
        assert_eq!(outcome.records[1].workflow_version, 2);
        assert_eq!(outcome.records[0].global_id, 1);
        assert_eq!(outcome.records[1].global_id, 2);
    }

    #[tokio::test]
    async fn test_version_fence_rejects_stale_writer() {
        let store = InMemoryEventStore::new();
        let wid = WorkflowId::new("ord-2");

        store
            .append(AppendRequest::events(
                "order",
                wid.clone(),
                0,
                vec![event("order.placed")],
            ))
            .await
            .unwrap();

        let result = store
            .append(AppendRequest::events(
                "order",
                wid.clone(),
                0,
                vec![event("order.paid")],
            ))
            .await;

        assert!(matches!(
            result,
            Err(StoreError::VersionConflict {
                expected: 0,
                actual: 1,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_global_ids_interleave_across_workflows() {
        let store = InMemoryEventStore::new();

        store
            .append(AppendRequest::events(
                "order",
                WorkflowId::new("a"),
                0,
                vec![event("e1")],
            ))
            .await
            .unwrap();
        store
            .append(AppendRequest::events(
                "invoice",
                WorkflowId::new("b"),
                0,
                vec![event("e2")],
            ))
            .await
            .unwrap();

        let stream = store.read_stream(0, 10).await.unwrap();
        assert_eq!(stream.len(), 2);
        assert!(stream[0].global_id < stream[1].global_id);
        assert_eq!(store.max_global_id().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_offset_cas() {
        let store = InMemoryEventStore::new();

        store.commit_offset("r0", None, 10).await.unwrap();
        store.commit_offset("r0", Some(10), 20).await.unwrap();

        let stale = store.commit_offset("r0", Some(10), 30).await;
        assert!(matches!(stale, Err(StoreError::OffsetConflict { .. })));
        assert_eq!(store.load_offset("r0").await.unwrap(), Some(20));
    }

    #[tokio::test]
    async fn test_subscription_net_effect() {
        let store = InMemoryEventStore::new();
        let wid = WorkflowId::new("A");
        let sub = Subscription::new("payment.completed", "B");

        let mut request =
            AppendRequest::events("order", wid.clone(), 0, vec![event("subscribed")]);
        request.subscribe = vec![sub.clone()];
        store.append(request).await.unwrap();

        let subscribers = store
            .subscribers_of("order", "payment.completed", &WorkflowId::new("B"))
            .await
            .unwrap();
        assert_eq!(subscribers, vec![wid.clone()]);

        let mut request =
            AppendRequest::events("order", wid.clone(), 1, vec![event("unsubscribed")]);
        request.unsubscribe = vec![sub];
        store.append(request).await.unwrap();

        let subscribers = store
            .subscribers_of("order", "payment.completed", &WorkflowId::new("B"))
            .await
            .unwrap();
        assert!(subscribers.is_empty());
    }

    #[tokio::test]
    async fn test_schedule_claims() {
        let store = InMemoryEventStore::new();
        let fire_at = Utc::now();

        let mut request = AppendRequest::events(
            "order",
            WorkflowId::new("ord-1"),
            0,
            vec![event("delay")],
        );
        request.schedules = vec![DelaySchedule {
            schedule_id: "s-1".to_string(),
            workflow_type: "order".to_string(),
            workflow_id: WorkflowId::new("ord-1"),
            event_version: 1,
            delay_until: fire_at,
            next_command: crate::workflow::CommandEnvelope::new("wake", json!({})),
            cron_expression: None,
            timezone: None,
            created_at: fire_at,
        }];
        store.append(request).await.unwrap();

        // First claim wins, second loses.
        assert!(store.delete_schedule_if("s-1", fire_at).await.unwrap());
        assert!(!store.delete_schedule_if("s-1", fire_at).await.unwrap());
    }

    #[tokio::test]
    async fn test_truncation_respects_gates() {
        let store = InMemoryEventStore::new();
        let wid = WorkflowId::new("ord-1");

        store
            .append(AppendRequest::events(
                "order",
                wid.clone(),
                0,
                vec![event("e1"), event("e2"), event("e3")],
            ))
            .await
            .unwrap();

        let future = Utc::now() + chrono::Duration::hours(1);

        // max_global_id below the events: nothing deleted.
        let deleted = store
            .delete_events_below("order", &wid, 3, 0, future, 100)
            .await
            .unwrap();
        assert_eq!(deleted, 0);

        // Version bound below: only versions 1..=2 go.
        let deleted = store
            .delete_events_below("order", &wid, 2, 100, future, 100)
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.event_count(), 1);
    }
}
