//! Background deletion of events superseded by snapshots
//!
//! An event may be deleted only once a snapshot at or above its version
//! exists, every reader has committed past its global id, and it is older
//! than the retention window. Load paths consult snapshots first, so the
//! deleted prefix is never needed again.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::persistence::{EventStore, StoreError};

/// Errors that abort the truncator task.
#[derive(Debug, thiserror::Error)]
pub enum TruncatorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Periodic truncation loop.
pub struct Truncator {
    store: Arc<dyn EventStore>,
    min_retention: Duration,
    batch_size: usize,
    check_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl Truncator {
    pub fn new(
        store: Arc<dyn EventStore>,
        min_retention: Duration,
        batch_size: usize,
        check_interval: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            min_retention,
            batch_size: batch_size.max(1),
            check_interval,
            shutdown_rx,
        }
    }

    /// Run until the stop signal, finishing the current pass first.
    pub async fn run(mut self) -> Result<(), TruncatorError> {
        info!("truncator started");

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            match self.truncate_once().await {
                Ok(deleted) if deleted > 0 => {
                    debug!(deleted, "truncation pass deleted events");
                }
                Ok(_) => {}
                Err(TruncatorError::Store(e)) if e.is_transient() => {
                    warn!(error = %e, "transient error during truncation pass");
                }
                Err(e) => return Err(e),
            }

            let mut shutdown_rx = self.shutdown_rx.clone();
            tokio::select! {
                _ = tokio::time::sleep(self.check_interval) => {}
                _ = shutdown_rx.changed() => {}
            }
        }

        info!("truncator stopped");
        Ok(())
    }

    /// One truncation pass over all candidate workflows. Returns total
    /// events deleted.
    #[instrument(skip(self))]
    pub async fn truncate_once(&self) -> Result<u64, TruncatorError> {
        let offsets = self.store.list_offsets().await?;
        // With no readers registered nothing is provably consumed yet.
        let Some(min_offset) = offsets.iter().map(|(_, offset)| *offset).min() else {
            return Ok(0);
        };

        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.min_retention)
                .unwrap_or_else(|_| chrono::Duration::days(1));

        let candidates = self.store.truncation_candidates(self.batch_size).await?;
        let mut total = 0u64;

        for snapshot in candidates {
            if *self.shutdown_rx.borrow() {
                break;
            }
            let deleted = self
                .store
                .delete_events_below(
                    &snapshot.workflow_type,
                    &snapshot.workflow_id,
                    snapshot.at_version,
                    min_offset,
                    cutoff,
                    self.batch_size,
                )
                .await?;
            if deleted > 0 {
                debug!(
                    workflow_id = %snapshot.workflow_id,
                    at_version = snapshot.at_version,
                    deleted,
                    "truncated events below snapshot"
                );
            }
            total += deleted;
        }

        Ok(total)
    }
}
