//! Reader predicates: which events does this reader's consumer care about

use std::sync::Arc;

use async_trait::async_trait;

use crate::partition::Partition;
use crate::persistence::{EventStore, StoreError};
use crate::workflow::EventRecord;

/// Answers "does any consumer of this reader care about this event?".
///
/// Evaluation may consult the store (subscription lookups), so it is async.
/// Events failing the predicate are still scanned past; the reader's
/// committed frontier advances over them.
#[async_trait]
pub trait ReaderPredicate: Send + Sync + 'static {
    async fn matches(&self, event: &EventRecord) -> Result<bool, StoreError>;
}

/// Predicate for a workflow runner: the event's workflow belongs to this
/// partition and is of the runner's own type, or some workflow of the
/// runner's type in this partition subscribes to it.
pub struct RunnerPredicate {
    store: Arc<dyn EventStore>,
    workflow_type: String,
    partition: Partition,
}

impl RunnerPredicate {
    pub fn new(store: Arc<dyn EventStore>, workflow_type: impl Into<String>, partition: Partition) -> Self {
        Self {
            store,
            workflow_type: workflow_type.into(),
            partition,
        }
    }
}

#[async_trait]
impl ReaderPredicate for RunnerPredicate {
    async fn matches(&self, event: &EventRecord) -> Result<bool, StoreError> {
        if event.workflow_type == self.workflow_type && self.partition.contains(&event.workflow_id)
        {
            return Ok(true);
        }

        let subscribers = self
            .store
            .subscribers_of(&self.workflow_type, &event.event_type, &event.workflow_id)
            .await?;

        Ok(subscribers
            .iter()
            .any(|subscriber| self.partition.contains(subscriber)))
    }
}

/// Predicate from a plain closure, for executors and tests.
pub struct FnPredicate<F>(pub F);

#[async_trait]
impl<F> ReaderPredicate for FnPredicate<F>
where
    F: Fn(&EventRecord) -> bool + Send + Sync + 'static,
{
    async fn matches(&self, event: &EventRecord) -> Result<bool, StoreError> {
        Ok((self.0)(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{AppendRequest, InMemoryEventStore};
    use crate::workflow::{NewEvent, Subscription, WorkflowId};
    use serde_json::json;

    async fn seed_event(
        store: &InMemoryEventStore,
        workflow_type: &str,
        workflow_id: &str,
        event_type: &str,
    ) -> EventRecord {
        let version = store
            .current_version(workflow_type, &WorkflowId::new(workflow_id))
            .await
            .unwrap()
            .unwrap_or(0);
        store
            .append(AppendRequest::events(
                workflow_type,
                WorkflowId::new(workflow_id),
                version,
                vec![NewEvent::new(event_type, 1, json!({}))],
            ))
            .await
            .unwrap()
            .records
            .remove(0)
    }

    #[tokio::test]
    async fn test_own_type_in_partition_matches() {
        let store = Arc::new(InMemoryEventStore::new());
        let event = seed_event(&store, "order", "ord-1", "order.placed").await;

        let predicate = RunnerPredicate::new(store.clone(), "order", Partition::solo());
        assert!(predicate.matches(&event).await.unwrap());
    }

    #[tokio::test]
    async fn test_foreign_type_without_subscription_skipped() {
        let store = Arc::new(InMemoryEventStore::new());
        let event = seed_event(&store, "invoice", "inv-1", "invoice.sent").await;

        let predicate = RunnerPredicate::new(store.clone(), "order", Partition::solo());
        assert!(!predicate.matches(&event).await.unwrap());
    }

    #[tokio::test]
    async fn test_subscription_pulls_in_foreign_events() {
        let store = Arc::new(InMemoryEventStore::new());

        // Workflow A (type order) subscribes to B's payment events.
        let mut request = AppendRequest::events(
            "order",
            WorkflowId::new("A"),
            0,
            vec![NewEvent::new("created", 1, json!({}))],
        );
        request.subscribe = vec![Subscription::new("payment.completed", "B")];
        store.append(request).await.unwrap();

        let event = seed_event(&store, "payment", "B", "payment.completed").await;
        let other = seed_event(&store, "payment", "B", "payment.started").await;

        let predicate = RunnerPredicate::new(store.clone(), "order", Partition::solo());
        assert!(predicate.matches(&event).await.unwrap());
        assert!(!predicate.matches(&other).await.unwrap());
    }
}
