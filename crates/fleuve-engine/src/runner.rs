//! Workflow runner: re-materializes consumed events as commands
//!
//! One runner per (workflow type, partition). It pulls batches from its
//! reader, asks the workflow type to convert each event into a command, and
//! applies that command to every subscribing workflow homed on this
//! partition. Expected rejections (lifecycle gates, idempotent no-ops) are
//! logged and skipped; retryable failures rewind the reader so the batch
//! redelivers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::partition::Partition;
use crate::reader::{ReaderError, StreamReader};
use crate::repository::Repository;
use crate::workflow::{EventRecord, WorkflowHandler};

/// Errors that abort the runner task.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Reader(#[from] ReaderError),
}

/// Consumes one reader and drives one workflow type's subscriptions.
pub struct WorkflowRunner {
    reader: StreamReader,
    repository: Arc<Repository>,
    partition: Partition,
    batch_size: usize,
    poll_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl WorkflowRunner {
    pub fn new(
        reader: StreamReader,
        repository: Arc<Repository>,
        partition: Partition,
        batch_size: usize,
        poll_interval: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            reader,
            repository,
            partition,
            batch_size: batch_size.max(1),
            poll_interval,
            shutdown_rx,
        }
    }

    /// Run until the stop signal. The current batch is finished and
    /// committed before exiting.
    pub async fn run(mut self) -> Result<(), RunnerError> {
        info!(
            reader = self.reader.name(),
            partition = %self.partition,
            "workflow runner started"
        );

        let mut idle_backoff = self.poll_interval;

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            let batch = self.reader.next_batch(self.batch_size).await?;

            if batch.is_empty() {
                // Commit the scanned frontier so filtered events don't get
                // re-scanned forever, then back off.
                self.reader.commit_scanned().await?;

                let mut shutdown_rx = self.shutdown_rx.clone();
                tokio::select! {
                    _ = tokio::time::sleep(idle_backoff) => {}
                    _ = shutdown_rx.changed() => {}
                }
                idle_backoff = (idle_backoff * 2).min(self.poll_interval * 16);
                continue;
            }

            idle_backoff = self.poll_interval;

            match self.process_batch(&batch).await {
                Ok(()) => {
                    self.reader.commit_scanned().await?;
                }
                Err(retryable) => {
                    // Never commit past a retryable failure; rewind so the
                    // whole batch redelivers after a pause.
                    warn!(
                        reader = self.reader.name(),
                        error = %retryable,
                        "batch processing failed; will redeliver"
                    );
                    self.reader.rewind();
                    let mut shutdown_rx = self.shutdown_rx.clone();
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
            }
        }

        self.reader.commit_scanned().await?;
        info!(reader = self.reader.name(), "workflow runner stopped");
        Ok(())
    }

    /// Process one batch in order. Returns `Err` with the first retryable
    /// failure; expected rejections are absorbed.
    async fn process_batch(
        &self,
        batch: &[EventRecord],
    ) -> Result<(), crate::repository::CommandError> {
        for event in batch {
            self.process_event(event).await?;
        }
        Ok(())
    }

    #[instrument(skip(self, event), fields(global_id = event.global_id, event_type = %event.event_type))]
    async fn process_event(
        &self,
        event: &EventRecord,
    ) -> Result<(), crate::repository::CommandError> {
        let handler: &Arc<dyn WorkflowHandler> = self.repository.handler();

        if handler.is_final_event(event) {
            debug!(workflow_id = %event.workflow_id, "observed final event");
        }

        // Targets are the subscribing workflows of this runner's type that
        // live on this partition.
        let subscribers = self
            .repository
            .store()
            .subscribers_of(
                self.repository.workflow_type(),
                &event.event_type,
                &event.workflow_id,
            )
            .await?;

        let targets: Vec<_> = subscribers
            .into_iter()
            .filter(|subscriber| self.partition.contains(subscriber))
            .collect();

        if targets.is_empty() {
            return Ok(());
        }

        let command = match handler.event_to_command(event) {
            Ok(Some(command)) => command,
            Ok(None) => return Ok(()),
            Err(e) => {
                // A command the workflow itself constructed failed to
                // encode; skipping is the only option that terminates.
                warn!(error = %e, "event_to_command produced an unencodable command");
                return Ok(());
            }
        };

        for target in targets {
            match self
                .repository
                .process_command_envelope(&target, command.clone())
                .await
            {
                Ok(outcome) => {
                    debug!(
                        target = %target,
                        new_version = outcome.state.version,
                        "re-injected event as command"
                    );
                }
                Err(e) if e.is_expected_rejection() => {
                    debug!(target = %target, rejection = %e, "command skipped");
                }
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => {
                    // Non-retryable fault (codec, upcast): redelivery would
                    // loop forever, so log loudly and move on.
                    warn!(target = %target, error = %e, "command failed terminally; skipping");
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryStateCache;
    use crate::config::EngineConfig;
    use crate::partition::reader_name;
    use crate::persistence::InMemoryEventStore;
    use crate::reader::RunnerPredicate;
    use crate::workflow::registry::tests::NoopWorkflow;
    use crate::workflow::TypedHandler;

    #[tokio::test]
    async fn test_runner_stops_on_signal() {
        let store: Arc<dyn crate::persistence::EventStore> = Arc::new(InMemoryEventStore::new());
        let cache = Arc::new(InMemoryStateCache::new());
        let handler = Arc::new(TypedHandler::<NoopWorkflow>::new());
        let repository = Arc::new(Repository::new(
            store.clone(),
            cache,
            handler,
            EngineConfig::default(),
        ));

        let partition = Partition::solo();
        let predicate = Arc::new(RunnerPredicate::new(store.clone(), "noop", partition));
        let reader = StreamReader::open(
            store.clone(),
            reader_name("noop", partition.index, partition.total),
            predicate,
        )
        .await
        .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = WorkflowRunner::new(
            reader,
            repository,
            partition,
            10,
            Duration::from_millis(10),
            shutdown_rx,
        );

        let handle = tokio::spawn(runner.run());
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown_tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("runner should stop promptly")
            .unwrap();
        assert!(result.is_ok());
    }
}
