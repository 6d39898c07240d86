//! Engine assembly: wire workflows, adapters and background tasks together
//!
//! The builder registers workflow types and adapters, then `start` spawns
//! the long-running tasks: one runner per (type, partition), one activity
//! executor per partition, one delay scheduler, and the truncator when
//! enabled. Shutdown is cooperative: every task drains its in-flight unit
//! and commits progress before exiting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::activity::{ActivityExecutor, Adapter, ExecutorConfig};
use crate::cache::StateCache;
use crate::config::EngineConfig;
use crate::delay::DelayScheduler;
use crate::partition::{reader_name, Partition};
use crate::persistence::EventStore;
use crate::reader::{ReaderError, RunnerPredicate, StreamReader};
use crate::repository::Repository;
use crate::runner::WorkflowRunner;
use crate::truncation::Truncator;
use crate::workflow::{HandlerRegistry, RegistryError, Workflow};

/// How long `shutdown` waits for each task to drain.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Fatal startup problems.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("invalid partition count: {0}")]
    InvalidPartitionCount(u32),

    #[error("no workflow types registered")]
    NoWorkflowTypes,

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Errors from engine startup.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Reader(#[from] ReaderError),
}

/// Builder for an [`Engine`].
pub struct EngineBuilder {
    store: Arc<dyn EventStore>,
    cache: Arc<dyn StateCache>,
    config: EngineConfig,
    partitions: u32,
    registry: HandlerRegistry,
    adapters: Vec<Arc<dyn Adapter>>,
}

impl EngineBuilder {
    pub fn new(store: Arc<dyn EventStore>, cache: Arc<dyn StateCache>) -> Self {
        Self {
            store,
            cache,
            config: EngineConfig::default(),
            partitions: 1,
            registry: HandlerRegistry::new(),
            adapters: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Partition count for this process set. All processes of a deployment
    /// must agree; resizing goes through
    /// [`rebalance`](crate::partition::rebalance) with all runners stopped.
    pub fn with_partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn register_workflow<W: Workflow>(mut self) -> Result<Self, ConfigurationError> {
        self.registry.register::<W>()?;
        Ok(self)
    }

    pub fn register_adapter(mut self, adapter: impl Adapter) -> Self {
        self.adapters.push(Arc::new(adapter));
        self
    }

    /// Spawn all long-running tasks and return the running engine.
    pub async fn start(self) -> Result<Engine, EngineError> {
        if self.partitions == 0 {
            return Err(ConfigurationError::InvalidPartitionCount(0).into());
        }
        if self.registry.is_empty() {
            return Err(ConfigurationError::NoWorkflowTypes.into());
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut repositories: HashMap<String, Arc<Repository>> = HashMap::new();
        for workflow_type in self.registry.workflow_types() {
            let handler = self
                .registry
                .get(workflow_type)
                .map_err(ConfigurationError::from)?;
            repositories.insert(
                workflow_type.to_string(),
                Arc::new(Repository::new(
                    self.store.clone(),
                    self.cache.clone(),
                    handler,
                    self.config.clone(),
                )),
            );
        }

        let mut tasks: Vec<(String, JoinHandle<()>)> = Vec::new();

        for (workflow_type, repository) in &repositories {
            for partition in Partition::all(self.partitions) {
                let name = reader_name(workflow_type, partition.index, partition.total);
                let predicate = Arc::new(RunnerPredicate::new(
                    self.store.clone(),
                    workflow_type.clone(),
                    partition,
                ));
                let reader =
                    StreamReader::open(self.store.clone(), name.clone(), predicate).await?;

                let runner = WorkflowRunner::new(
                    reader,
                    repository.clone(),
                    partition,
                    self.config.reader_batch_size,
                    self.config.reader_poll_interval,
                    shutdown_rx.clone(),
                );

                tasks.push((
                    format!("runner:{name}"),
                    tokio::spawn(async move {
                        if let Err(e) = runner.run().await {
                            error!(error = %e, "workflow runner aborted");
                        }
                    }),
                ));
            }
        }

        if !self.adapters.is_empty() {
            for partition in Partition::all(self.partitions) {
                let executor = ActivityExecutor::new(
                    self.store.clone(),
                    repositories.clone(),
                    self.adapters.clone(),
                    partition,
                    ExecutorConfig {
                        batch_size: self.config.reader_batch_size,
                        poll_interval: self.config.reader_poll_interval,
                        retry_policy: self.config.retry_policy.clone(),
                        ..ExecutorConfig::default()
                    },
                    shutdown_rx.clone(),
                );
                tasks.push((
                    format!("executor:{partition}"),
                    tokio::spawn(async move {
                        if let Err(e) = executor.run().await {
                            error!(error = %e, "activity executor aborted");
                        }
                    }),
                ));
            }
        }

        let scheduler = DelayScheduler::new(
            self.store.clone(),
            repositories.clone(),
            self.config.delay_poll_interval,
            self.config.reader_batch_size,
            shutdown_rx.clone(),
        );
        tasks.push((
            "delay-scheduler".to_string(),
            tokio::spawn(async move {
                if let Err(e) = scheduler.run().await {
                    error!(error = %e, "delay scheduler aborted");
                }
            }),
        ));

        if self.config.enable_truncation {
            let truncator = Truncator::new(
                self.store.clone(),
                self.config.truncation_min_retention,
                self.config.truncation_batch_size,
                self.config.truncation_check_interval,
                shutdown_rx.clone(),
            );
            tasks.push((
                "truncator".to_string(),
                tokio::spawn(async move {
                    if let Err(e) = truncator.run().await {
                        error!(error = %e, "truncator aborted");
                    }
                }),
            ));
        }

        info!(
            workflow_types = self.registry.len(),
            partitions = self.partitions,
            adapters = self.adapters.len(),
            tasks = tasks.len(),
            "engine started"
        );

        Ok(Engine {
            repositories,
            shutdown_tx,
            tasks,
        })
    }
}

/// A running engine: repositories for in-process callers plus the spawned
/// background tasks.
pub struct Engine {
    repositories: HashMap<String, Arc<Repository>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl Engine {
    pub fn builder(store: Arc<dyn EventStore>, cache: Arc<dyn StateCache>) -> EngineBuilder {
        EngineBuilder::new(store, cache)
    }

    /// Repository for one workflow type, for in-process command submission.
    pub fn repository(&self, workflow_type: &str) -> Option<Arc<Repository>> {
        self.repositories.get(workflow_type).cloned()
    }

    /// Signal every task to stop and wait for them to drain.
    pub async fn shutdown(self) {
        info!("engine shutting down");
        let _ = self.shutdown_tx.send(true);

        for (name, handle) in self.tasks {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(task = %name, error = %e, "task panicked during shutdown"),
                Err(_) => warn!(task = %name, "task did not drain within the shutdown timeout"),
            }
        }

        info!("engine stopped");
    }
}
