//! Adapter contract and the activity execution context
//!
//! An adapter names the events it acts on and produces side effects through
//! `act_on`. The body yields three kinds of items (commands, checkpoints
//! and timeouts) back to the executor over a per-run channel; the executor
//! drives the channel while the body runs, holding no engine locks across
//! yields.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};

use crate::persistence::SyncDbWork;
use crate::retry::RetryPolicy;
use crate::workflow::{CommandEnvelope, EventRecord, TypeTag, WorkflowId};

/// Failure of an activity attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct ActivityError {
    pub message: String,
    pub retryable: bool,
}

impl ActivityError {
    /// A retryable failure (the default for infrastructure hiccups).
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that retrying cannot fix; dead-letters immediately.
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn timeout(limit: Duration) -> Self {
        Self {
            message: format!("activity timed out after {:.1}s", limit.as_secs_f64()),
            retryable: true,
        }
    }
}

/// Items an adapter yields to the executor during a run.
#[derive(Debug)]
pub enum ActionItem {
    /// Apply a command to the activity's own workflow. The executor answers
    /// on `ack` once the repository call settles.
    Command {
        envelope: CommandEnvelope,
        ack: oneshot::Sender<Result<(), ActivityError>>,
    },

    /// Merge `data` into the activity's checkpoint. With `save_now` the
    /// merged checkpoint is persisted before the adapter continues;
    /// otherwise it is persisted when the run completes.
    Checkpoint {
        data: Map<String, Value>,
        save_now: bool,
        ack: oneshot::Sender<Result<(), ActivityError>>,
    },

    /// The remainder of the run must finish within `limit`.
    Timeout { limit: Duration },
}

/// Context handed to `act_on`.
///
/// Carries the attempt facts and the yield channel. The checkpoint view is
/// the merge of everything persisted by earlier attempts; an adapter
/// resuming after a crash reads its own progress from here.
///
/// # Example
///
/// ```ignore
/// async fn act_on(&self, event: &EventRecord, ctx: &ActionContext) -> Result<(), ActivityError> {
///     if ctx.checkpoint_value("charged").is_none() {
///         charge_card(event).await?;
///         ctx.save_checkpoint_entry("charged", json!(true)).await?;
///     }
///     ctx.set_timeout(Duration::from_secs(30)).await?;
///     ctx.apply_command(&OrderCommand::MarkShipped).await?;
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct ActionContext {
    pub workflow_id: WorkflowId,
    /// `workflow_version` of the triggering event.
    pub event_number: i64,
    /// Retries consumed before this attempt (0 on the first).
    pub retry_count: u32,
    pub retry_policy: RetryPolicy,
    checkpoint: Map<String, Value>,
    tx: mpsc::Sender<ActionItem>,
}

impl ActionContext {
    pub(crate) fn new(
        workflow_id: WorkflowId,
        event_number: i64,
        retry_count: u32,
        retry_policy: RetryPolicy,
        checkpoint: Map<String, Value>,
        tx: mpsc::Sender<ActionItem>,
    ) -> Self {
        Self {
            workflow_id,
            event_number,
            retry_count,
            retry_policy,
            checkpoint,
            tx,
        }
    }

    /// The checkpoint as persisted before this attempt started.
    pub fn checkpoint(&self) -> &Map<String, Value> {
        &self.checkpoint
    }

    pub fn checkpoint_value(&self, key: &str) -> Option<&Value> {
        self.checkpoint.get(key)
    }

    /// Whether this is the final attempt before dead-lettering.
    pub fn is_last_attempt(&self) -> bool {
        self.retry_count >= self.retry_policy.max_retries
    }

    /// Yield a command for the activity's own workflow and wait for the
    /// executor to apply it. Rejections that mean "already handled" are
    /// reported as success; that is the idempotency handshake.
    pub async fn apply(&self, envelope: CommandEnvelope) -> Result<(), ActivityError> {
        let (ack, done) = oneshot::channel();
        self.send(ActionItem::Command { envelope, ack }).await?;
        done.await
            .map_err(|_| ActivityError::new("executor dropped the run"))?
    }

    /// Typed variant of [`apply`](Self::apply).
    pub async fn apply_command<C: TypeTag + serde::Serialize>(
        &self,
        command: &C,
    ) -> Result<(), ActivityError> {
        let envelope = CommandEnvelope::encode(command)
            .map_err(|e| ActivityError::non_retryable(format!("command encode failed: {e}")))?;
        self.apply(envelope).await
    }

    /// Merge checkpoint data, persisted when the run completes.
    pub async fn stage_checkpoint(&self, data: Map<String, Value>) -> Result<(), ActivityError> {
        self.yield_checkpoint(data, false).await
    }

    /// Merge checkpoint data and persist immediately.
    pub async fn save_checkpoint(&self, data: Map<String, Value>) -> Result<(), ActivityError> {
        self.yield_checkpoint(data, true).await
    }

    /// Persist a single checkpoint entry immediately.
    pub async fn save_checkpoint_entry(
        &self,
        key: impl Into<String>,
        value: Value,
    ) -> Result<(), ActivityError> {
        let mut data = Map::new();
        data.insert(key.into(), value);
        self.save_checkpoint(data).await
    }

    /// Bound the remainder of this run to `limit` of wall clock.
    pub async fn set_timeout(&self, limit: Duration) -> Result<(), ActivityError> {
        self.send(ActionItem::Timeout { limit }).await
    }

    async fn yield_checkpoint(
        &self,
        data: Map<String, Value>,
        save_now: bool,
    ) -> Result<(), ActivityError> {
        let (ack, done) = oneshot::channel();
        self.send(ActionItem::Checkpoint {
            data,
            save_now,
            ack,
        })
        .await?;
        done.await
            .map_err(|_| ActivityError::new("executor dropped the run"))?
    }

    async fn send(&self, item: ActionItem) -> Result<(), ActivityError> {
        self.tx
            .send(item)
            .await
            .map_err(|_| ActivityError::new("executor dropped the run"))
    }
}

/// User code defining which events trigger side effects and what they do.
///
/// `act_on` runs at-least-once per matching event; exactly-once *successful
/// completion* is guaranteed by the activity record, and commands emitted on
/// a retry after partial success are expected to bounce off `decide` as
/// idempotent rejections.
#[async_trait]
pub trait Adapter: Send + Sync + 'static {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Whether this adapter acts on the given event.
    fn applies_to(&self, event: &EventRecord) -> bool;

    /// Run the side effect, yielding items through `ctx`.
    async fn act_on(&self, event: &EventRecord, ctx: &ActionContext)
        -> Result<(), ActivityError>;

    /// Per-adapter retry policy; `None` uses the engine default.
    fn retry_policy(&self) -> Option<RetryPolicy> {
        None
    }

    /// Sync-db hook attached to commands this adapter yields. A hook
    /// configured on the repository itself takes precedence.
    fn sync_db(&self) -> Option<SyncDbWork> {
        None
    }

    /// Called once when the activity dead-letters.
    async fn on_action_failed(&self, event: &EventRecord, error: &ActivityError) {
        let _ = (event, error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_activity_error_kinds() {
        assert!(ActivityError::new("boom").retryable);
        assert!(!ActivityError::non_retryable("bad input").retryable);
        let timeout = ActivityError::timeout(Duration::from_secs(30));
        assert!(timeout.retryable);
        assert!(timeout.message.contains("30.0s"));
    }

    #[tokio::test]
    async fn test_context_yields_command_and_awaits_ack() {
        let (tx, mut rx) = mpsc::channel(4);
        let ctx = ActionContext::new(
            WorkflowId::new("ord-1"),
            3,
            0,
            RetryPolicy::default(),
            Map::new(),
            tx,
        );

        let driver = tokio::spawn(async move {
            match rx.recv().await {
                Some(ActionItem::Command { envelope, ack }) => {
                    assert_eq!(envelope.command_type, "ship");
                    ack.send(Ok(())).unwrap();
                }
                other => panic!("unexpected item: {other:?}"),
            }
        });

        ctx.apply(CommandEnvelope::new("ship", json!({})))
            .await
            .unwrap();
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn test_context_checkpoint_view() {
        let (tx, _rx) = mpsc::channel(4);
        let mut checkpoint = Map::new();
        checkpoint.insert("cursor".to_string(), json!("page-3"));

        let ctx = ActionContext::new(
            WorkflowId::new("ord-1"),
            3,
            2,
            RetryPolicy::default().with_max_retries(2),
            checkpoint,
            tx,
        );

        assert_eq!(ctx.checkpoint_value("cursor"), Some(&json!("page-3")));
        assert!(ctx.is_last_attempt());
    }

    #[tokio::test]
    async fn test_dropped_executor_fails_sends() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let ctx = ActionContext::new(
            WorkflowId::new("ord-1"),
            1,
            0,
            RetryPolicy::default(),
            Map::new(),
            tx,
        );

        let result = ctx.set_timeout(Duration::from_secs(1)).await;
        assert!(result.is_err());
    }
}
