//! Activity execution: adapters, records, and the executor

pub mod adapter;
pub mod executor;
pub mod record;

pub use adapter::{ActionContext, ActionItem, ActivityError, Adapter};
pub use executor::{retry_failed_action, ActivityExecutor, ExecutorConfig, ExecutorError};
pub use record::{ActivityRecord, ActivityStatus};
