//! Durable pull-based cursor over the event log
//!
//! One reader, one owner: the committed offset is CAS-guarded, so a second
//! process claiming the same `reader_name` aborts on its first commit. The
//! delivery guarantee is at-least-once: crash between processing and commit
//! redelivers the batch.

mod predicate;

use std::sync::Arc;

use tracing::{debug, instrument, trace};

use crate::persistence::{EventStore, StoreError};
use crate::workflow::EventRecord;

pub use predicate::{FnPredicate, ReaderPredicate, RunnerPredicate};

/// Errors from reader operations.
#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    /// Another process owns this reader name. Fatal for this instance; the
    /// younger claimant must abort.
    #[error("reader {0} is owned by another process")]
    OwnershipLost(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// A long-lived cursor over events matching a predicate.
pub struct StreamReader {
    store: Arc<dyn EventStore>,
    name: String,
    predicate: Arc<dyn ReaderPredicate>,
    /// Durably committed offset.
    committed: i64,
    /// Whether an offset row exists yet; decides the CAS expectation on the
    /// first commit.
    has_row: bool,
    /// Frontier of scanned (not necessarily matching) events.
    scanned: i64,
    /// Highest global id seen in the store, for lag reporting.
    max_observed: i64,
}

impl StreamReader {
    /// Open a reader, claiming its name if fresh and resuming from the
    /// committed offset otherwise.
    pub async fn open(
        store: Arc<dyn EventStore>,
        name: impl Into<String>,
        predicate: Arc<dyn ReaderPredicate>,
    ) -> Result<Self, ReaderError> {
        let name = name.into();
        let loaded = store.load_offset(&name).await?;
        if loaded.is_none() {
            debug!(reader = %name, "fresh reader starting at offset 0");
        }
        let committed = loaded.unwrap_or(0);

        Ok(Self {
            store,
            name,
            predicate,
            committed,
            has_row: loaded.is_some(),
            scanned: committed,
            max_observed: committed,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Committed offset: every event at or below it has been fully handled.
    pub fn current_offset(&self) -> i64 {
        self.committed
    }

    /// Frontier of events scanned since the last commit.
    pub fn scanned_through(&self) -> i64 {
        self.scanned
    }

    /// Highest global id observed in the store; `max_observed() -
    /// current_offset()` is this reader's lag.
    pub fn max_observed(&self) -> i64 {
        self.max_observed
    }

    /// Next matching events in `global_id` order, at most `max`.
    ///
    /// Scans up to `max` raw events past the frontier and filters through
    /// the predicate; the frontier advances over non-matching events so a
    /// later commit skips them for good.
    #[instrument(skip(self), fields(reader = %self.name))]
    pub async fn next_batch(&mut self, max: usize) -> Result<Vec<EventRecord>, ReaderError> {
        let raw = self.store.read_stream(self.scanned, max).await?;
        self.max_observed = self.store.max_global_id().await?.max(self.max_observed);

        let mut matched = Vec::new();
        for event in raw {
            debug_assert!(event.global_id > self.scanned);
            self.scanned = event.global_id;
            if self.predicate.matches(&event).await? {
                matched.push(event);
            } else {
                trace!(global_id = event.global_id, "event outside predicate");
            }
        }

        Ok(matched)
    }

    /// Durably commit the offset through `last_global_id`. Monotonic: stale
    /// commits are ignored. An offset conflict means another process claimed
    /// this reader and is fatal.
    pub async fn commit(&mut self, last_global_id: i64) -> Result<(), ReaderError> {
        if last_global_id <= self.committed {
            return Ok(());
        }

        let expected = if self.has_row {
            Some(self.committed)
        } else {
            None
        };

        match self
            .store
            .commit_offset(&self.name, expected, last_global_id)
            .await
        {
            Ok(()) => {
                self.committed = last_global_id;
                self.has_row = true;
                Ok(())
            }
            Err(StoreError::OffsetConflict { .. }) => {
                Err(ReaderError::OwnershipLost(self.name.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Commit through the scanned frontier: everything returned by
    /// `next_batch` so far plus the filtered gaps.
    pub async fn commit_scanned(&mut self) -> Result<(), ReaderError> {
        self.commit(self.scanned).await
    }

    /// Drop uncommitted progress; the next batch re-reads from the
    /// committed offset. Used after a processing failure so redelivery
    /// happens.
    pub fn rewind(&mut self) {
        self.scanned = self.committed;
    }
}

impl std::fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReader")
            .field("name", &self.name)
            .field("committed", &self.committed)
            .field("scanned", &self.scanned)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{AppendRequest, InMemoryEventStore};
    use crate::workflow::{NewEvent, WorkflowId};
    use serde_json::json;

    async fn seed(store: &InMemoryEventStore, workflow_id: &str, event_types: &[&str]) {
        let wid = WorkflowId::new(workflow_id);
        let version = store
            .current_version("order", &wid)
            .await
            .unwrap()
            .unwrap_or(0);
        store
            .append(AppendRequest::events(
                "order",
                wid,
                version,
                event_types
                    .iter()
                    .map(|t| NewEvent::new(*t, 1, json!({})))
                    .collect(),
            ))
            .await
            .unwrap();
    }

    fn match_all() -> Arc<dyn ReaderPredicate> {
        Arc::new(FnPredicate(|_: &EventRecord| true))
    }

    #[tokio::test]
    async fn test_batches_in_order_and_commit() {
        let store = Arc::new(InMemoryEventStore::new());
        seed(&store, "a", &["e1", "e2", "e3"]).await;

        let mut reader = StreamReader::open(store.clone(), "order.0.of.1", match_all())
            .await
            .unwrap();

        let batch = reader.next_batch(2).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch[0].global_id < batch[1].global_id);

        reader.commit_scanned().await.unwrap();
        assert_eq!(reader.current_offset(), 2);

        let batch = reader.next_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].event_type, "e3");
    }

    #[tokio::test]
    async fn test_offset_survives_reopen() {
        let store = Arc::new(InMemoryEventStore::new());
        seed(&store, "a", &["e1", "e2"]).await;

        {
            let mut reader = StreamReader::open(store.clone(), "order.0.of.1", match_all())
                .await
                .unwrap();
            reader.next_batch(10).await.unwrap();
            reader.commit_scanned().await.unwrap();
        }

        let mut reader = StreamReader::open(store.clone(), "order.0.of.1", match_all())
            .await
            .unwrap();
        assert_eq!(reader.current_offset(), 2);
        assert!(reader.next_batch(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_filtered_events_are_committed_past() {
        let store = Arc::new(InMemoryEventStore::new());
        seed(&store, "a", &["keep", "drop", "keep"]).await;

        let predicate: Arc<dyn ReaderPredicate> =
            Arc::new(FnPredicate(|e: &EventRecord| e.event_type == "keep"));
        let mut reader = StreamReader::open(store.clone(), "order.0.of.1", predicate)
            .await
            .unwrap();

        let batch = reader.next_batch(10).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(reader.scanned_through(), 3);

        reader.commit_scanned().await.unwrap();
        assert_eq!(reader.current_offset(), 3);
    }

    #[tokio::test]
    async fn test_second_owner_aborts() {
        let store = Arc::new(InMemoryEventStore::new());
        seed(&store, "a", &["e1", "e2"]).await;

        let mut first = StreamReader::open(store.clone(), "order.0.of.1", match_all())
            .await
            .unwrap();
        first.next_batch(1).await.unwrap();
        first.commit_scanned().await.unwrap();

        // Second claimant opened before the first committed further.
        let mut second = StreamReader::open(store.clone(), "order.0.of.1", match_all())
            .await
            .unwrap();
        assert_eq!(second.current_offset(), 1);

        first.next_batch(1).await.unwrap();
        first.commit_scanned().await.unwrap();

        second.next_batch(1).await.unwrap();
        let result = second.commit_scanned().await;
        assert!(matches!(result, Err(ReaderError::OwnershipLost(_))));
    }

    #[tokio::test]
    async fn test_rewind_redelivers() {
        let store = Arc::new(InMemoryEventStore::new());
        seed(&store, "a", &["e1", "e2"]).await;

        let mut reader = StreamReader::open(store.clone(), "order.0.of.1", match_all())
            .await
            .unwrap();
        let batch = reader.next_batch(10).await.unwrap();
        assert_eq!(batch.len(), 2);

        reader.rewind();
        let again = reader.next_batch(10).await.unwrap();
        assert_eq!(again.len(), 2);
    }
}
