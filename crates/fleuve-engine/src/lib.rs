//! # Fleuve Engine
//!
//! A durable, event-sourced workflow engine. Workflow instances accept
//! commands, emit events persisted to an append-only log, and derive state
//! by folding events. A background runtime re-injects events as follow-up
//! commands on subscribing workflows, runs side effects with retries and
//! checkpoints, fires delay and cron schedules, and scales horizontally by
//! hash-partitioning workflow ids across runner processes.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Repository                            │
//! │   (load → decide → evolve → append, per-workflow locking)    │
//! └──────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        EventStore                            │
//! │   (events, snapshots, subscriptions, offsets, activities,    │
//! │    delay schedules; PostgreSQL or in-memory)                 │
//! └──────────────────────────────────────────────────────────────┘
//!                               │
//!            ┌──────────────────┼───────────────────┐
//!            ▼                  ▼                   ▼
//! ┌────────────────┐ ┌──────────────────┐ ┌──────────────────┐
//! │ WorkflowRunner │ │ ActivityExecutor │ │  DelayScheduler  │
//! │ (events→cmds)  │ │ (side effects)   │ │ (timers + cron)  │
//! └────────────────┘ └──────────────────┘ └──────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use fleuve_engine::prelude::*;
//!
//! struct OrderWorkflow;
//!
//! impl Workflow for OrderWorkflow {
//!     const TYPE: &'static str = "order";
//!     type State = OrderState;
//!     type Command = OrderCommand;
//!     type Event = OrderEvent;
//!
//!     fn decide(
//!         state: &OrderState,
//!         _ctx: &DecideContext<'_>,
//!         command: OrderCommand,
//!     ) -> Result<Decision<OrderEvent>, Rejection> {
//!         // validate, emit events
//!         # unimplemented!()
//!     }
//!
//!     fn evolve(state: OrderState, event: &OrderEvent) -> OrderState {
//!         // fold one event
//!         # unimplemented!()
//!     }
//! }
//!
//! let engine = Engine::builder(store, cache)
//!     .with_partitions(3)
//!     .register_workflow::<OrderWorkflow>()?
//!     .start()
//!     .await?;
//!
//! let repo = engine.repository("order").unwrap();
//! repo.create_new(&OrderCommand::Place { .. }, &WorkflowId::new("ord-1")).await?;
//! ```

pub mod activity;
pub mod cache;
pub mod config;
pub mod delay;
pub mod partition;
pub mod persistence;
pub mod reader;
pub mod repository;
pub mod retry;
pub mod runner;
pub mod runtime;
pub mod truncation;
pub mod workflow;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::activity::{ActionContext, ActivityError, Adapter};
    pub use crate::cache::{InMemoryStateCache, NatsStateCache, StateCache};
    pub use crate::config::EngineConfig;
    pub use crate::partition::{partition, reader_name, rebalance, Partition};
    pub use crate::persistence::{EventStore, InMemoryEventStore, PostgresEventStore};
    pub use crate::repository::{CommandError, CommandOutcome, Repository};
    pub use crate::retry::{BackoffStrategy, RetryPolicy};
    pub use crate::runtime::{Engine, EngineBuilder};
    pub use crate::workflow::{
        DecideContext, Decision, DelayFire, DelayRequest, EventRecord, InstanceState, Lifecycle,
        Rejection, Subscription, TypeTag, Workflow, WorkflowId,
    };
}

// Re-export key types at crate root
pub use activity::{ActionContext, ActivityError, ActivityExecutor, Adapter};
pub use cache::{InMemoryStateCache, NatsStateCache, StateCache};
pub use config::EngineConfig;
pub use partition::{partition, reader_name, rebalance, Partition};
pub use persistence::{EventStore, InMemoryEventStore, PostgresEventStore, StoreError};
pub use reader::{ReaderPredicate, StreamReader};
pub use repository::{CommandError, CommandOutcome, Repository};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use runner::WorkflowRunner;
pub use runtime::{ConfigurationError, Engine, EngineBuilder, EngineError};
pub use truncation::Truncator;
pub use workflow::{
    Decision, EventRecord, InstanceState, Lifecycle, Rejection, Subscription, TypeTag, Workflow,
    WorkflowId,
};
