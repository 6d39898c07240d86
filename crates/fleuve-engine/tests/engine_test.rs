//! End-to-end engine tests on the in-memory store.
//!
//! The cast: an order workflow (commands, payments, reminders, a
//! subscription to payment events) and a payment workflow whose completed
//! events feed back into orders through the runner.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tokio_test::assert_ok;

use fleuve_engine::activity::{
    retry_failed_action, ActionContext, ActivityError, ActivityExecutor, ActivityStatus, Adapter,
    ExecutorConfig,
};
use fleuve_engine::cache::InMemoryStateCache;
use fleuve_engine::config::EngineConfig;
use fleuve_engine::delay::DelayScheduler;
use fleuve_engine::partition::{rebalance, reader_name};
use fleuve_engine::persistence::{EventStore, InMemoryEventStore};
use fleuve_engine::repository::{CommandError, Repository};
use fleuve_engine::retry::RetryPolicy;
use fleuve_engine::runtime::Engine;
use fleuve_engine::truncation::Truncator;
use fleuve_engine::workflow::{
    DecideContext, Decision, DelayRequest, EventRecord, Lifecycle, Rejection, Subscription,
    TypeTag, TypedHandler, Workflow, WorkflowId,
};

// =============================================================================
// Order workflow
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct OrderState {
    status: String,
    total: f64,
    paid: bool,
    payment_id: Option<String>,
    reminders: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum OrderCommand {
    #[serde(rename = "place")]
    Place { items: Vec<String>, total: f64 },
    #[serde(rename = "pay")]
    Pay { payment_id: String },
    #[serde(rename = "watch_payments")]
    WatchPayments { source: String },
    #[serde(rename = "remind")]
    Remind,
    #[serde(rename = "schedule_reminder")]
    ScheduleReminder { at: DateTime<Utc> },
    #[serde(rename = "schedule_daily_report")]
    ScheduleDailyReport { cron: String, timezone: String },
}

impl TypeTag for OrderCommand {
    fn type_tag(&self) -> &str {
        match self {
            Self::Place { .. } => "place",
            Self::Pay { .. } => "pay",
            Self::WatchPayments { .. } => "watch_payments",
            Self::Remind => "remind",
            Self::ScheduleReminder { .. } => "schedule_reminder",
            Self::ScheduleDailyReport { .. } => "schedule_daily_report",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum OrderEvent {
    #[serde(rename = "order.placed")]
    OrderPlaced { items: Vec<String>, total: f64 },
    #[serde(rename = "payment.received")]
    PaymentReceived { payment_id: String },
    #[serde(rename = "order.reminded")]
    Reminded,
}

impl TypeTag for OrderEvent {
    fn type_tag(&self) -> &str {
        match self {
            Self::OrderPlaced { .. } => "order.placed",
            Self::PaymentReceived { .. } => "payment.received",
            Self::Reminded => "order.reminded",
        }
    }
}

struct OrderWorkflow;

impl Workflow for OrderWorkflow {
    const TYPE: &'static str = "order";
    type State = OrderState;
    type Command = OrderCommand;
    type Event = OrderEvent;

    fn decide(
        state: &OrderState,
        _ctx: &DecideContext<'_>,
        command: OrderCommand,
    ) -> Result<Decision<OrderEvent>, Rejection> {
        match command {
            OrderCommand::Place { items, total } => {
                if !state.status.is_empty() {
                    return Err(Rejection::new("already placed"));
                }
                Ok(Decision::events(vec![OrderEvent::OrderPlaced {
                    items,
                    total,
                }]))
            }
            OrderCommand::Pay { payment_id } => {
                if state.status.is_empty() {
                    return Err(Rejection::new("not placed"));
                }
                if state.paid {
                    return Err(Rejection::new("already paid"));
                }
                Ok(Decision::events(vec![OrderEvent::PaymentReceived {
                    payment_id,
                }]))
            }
            OrderCommand::WatchPayments { source } => Ok(Decision::none()
                .with_subscribe(Subscription::new("payment.completed", source))),
            OrderCommand::Remind => Ok(Decision::events(vec![OrderEvent::Reminded])),
            OrderCommand::ScheduleReminder { at } => {
                let next = fleuve_engine::workflow::CommandEnvelope::encode(&OrderCommand::Remind)
                    .map_err(|e| Rejection::new(e.to_string()))?;
                Ok(Decision::none().with_delay(DelayRequest::at("remind-1", at, next)))
            }
            OrderCommand::ScheduleDailyReport { cron, timezone } => {
                let next = fleuve_engine::workflow::CommandEnvelope::encode(&OrderCommand::Remind)
                    .map_err(|e| Rejection::new(e.to_string()))?;
                Ok(Decision::none().with_delay(DelayRequest::cron(
                    "daily-report",
                    cron,
                    Some(timezone),
                    next,
                )))
            }
        }
    }

    fn evolve(mut state: OrderState, event: &OrderEvent) -> OrderState {
        match event {
            OrderEvent::OrderPlaced { total, .. } => {
                state.status = "new".to_string();
                state.total = *total;
            }
            OrderEvent::PaymentReceived { payment_id } => {
                state.status = "paid".to_string();
                state.paid = true;
                state.payment_id = Some(payment_id.clone());
            }
            OrderEvent::Reminded => {
                state.reminders += 1;
            }
        }
        state
    }

    fn event_to_command(consumed: &EventRecord) -> Option<OrderCommand> {
        if consumed.event_type != "payment.completed" {
            return None;
        }
        let payment_id = consumed.body["payment_id"].as_str()?.to_string();
        Some(OrderCommand::Pay { payment_id })
    }
}

// =============================================================================
// Payment workflow
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PaymentState {
    done: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum PaymentCommand {
    #[serde(rename = "complete")]
    Complete { payment_id: String },
}

impl TypeTag for PaymentCommand {
    fn type_tag(&self) -> &str {
        "complete"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum PaymentEvent {
    #[serde(rename = "payment.completed")]
    Completed { payment_id: String },
}

impl TypeTag for PaymentEvent {
    fn type_tag(&self) -> &str {
        "payment.completed"
    }
}

struct PaymentWorkflow;

impl Workflow for PaymentWorkflow {
    const TYPE: &'static str = "payment";
    type State = PaymentState;
    type Command = PaymentCommand;
    type Event = PaymentEvent;

    fn decide(
        state: &PaymentState,
        _ctx: &DecideContext<'_>,
        command: PaymentCommand,
    ) -> Result<Decision<PaymentEvent>, Rejection> {
        if state.done {
            return Err(Rejection::new("already completed"));
        }
        let PaymentCommand::Complete { payment_id } = command;
        Ok(Decision::events(vec![PaymentEvent::Completed {
            payment_id,
        }]))
    }

    fn evolve(mut state: PaymentState, _event: &PaymentEvent) -> PaymentState {
        state.done = true;
        state
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn order_repository(
    store: &Arc<InMemoryEventStore>,
    config: EngineConfig,
) -> Arc<Repository> {
    let store: Arc<dyn EventStore> = store.clone();
    Arc::new(Repository::new(
        store,
        Arc::new(InMemoryStateCache::new()),
        Arc::new(TypedHandler::<OrderWorkflow>::new()),
        config,
    ))
}

fn order_state(outcome: &fleuve_engine::repository::CommandOutcome) -> OrderState {
    serde_json::from_value(outcome.state.state.clone()).unwrap()
}

async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Step a paused test clock in 10ms increments until `check` holds. Every
/// step is an exact quantum, so timer-driven work lands on exact virtual
/// instants and backoff gaps can be asserted to the millisecond.
async fn run_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..1_000 {
        if check().await {
            return;
        }
        tokio::time::advance(Duration::from_millis(10)).await;
    }
    panic!("clock ran out waiting for {what}");
}

// =============================================================================
// Simple order lifecycle
// =============================================================================

#[tokio::test]
async fn place_pay_and_idempotent_rejection() {
    let store = Arc::new(InMemoryEventStore::new());
    let repo = order_repository(&store, EngineConfig::default());
    let wid = WorkflowId::new("ord-1");

    let placed = repo
        .create_new(
            &OrderCommand::Place {
                items: vec!["a".to_string(), "b".to_string()],
                total: 10.0,
            },
            &wid,
        )
        .await
        .unwrap();

    assert_eq!(placed.state.version, 1);
    assert_eq!(placed.events.len(), 1);
    assert_eq!(placed.events[0].event_type, "order.placed");
    assert_eq!(placed.events[0].workflow_version, 1);
    let state = order_state(&placed);
    assert_eq!(state.status, "new");
    assert_eq!(state.total, 10.0);

    let paid = repo
        .process_command(
            &wid,
            &OrderCommand::Pay {
                payment_id: "p".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(paid.state.version, 2);
    assert_eq!(paid.events[0].event_type, "payment.received");
    assert_eq!(order_state(&paid).status, "paid");

    let second_pay = repo
        .process_command(
            &wid,
            &OrderCommand::Pay {
                payment_id: "p2".to_string(),
            },
        )
        .await;
    match second_pay {
        Err(CommandError::Rejected(rejection)) => assert_eq!(rejection.reason, "already paid"),
        other => panic!("expected rejection, got {other:?}"),
    }

    let current = repo.get_current_state(&wid).await.unwrap();
    assert_eq!(current.version, 2);
}

#[tokio::test]
async fn create_twice_is_already_exists() {
    let store = Arc::new(InMemoryEventStore::new());
    let repo = order_repository(&store, EngineConfig::default());
    let wid = WorkflowId::new("ord-dup");

    let place = OrderCommand::Place {
        items: vec![],
        total: 1.0,
    };
    repo.create_new(&place, &wid).await.unwrap();
    assert!(matches!(
        repo.create_new(&place, &wid).await,
        Err(CommandError::AlreadyExists(_))
    ));
}

#[tokio::test]
async fn process_command_on_missing_workflow_is_not_found() {
    let store = Arc::new(InMemoryEventStore::new());
    let repo = order_repository(&store, EngineConfig::default());

    let result = repo
        .process_command(
            &WorkflowId::new("ghost"),
            &OrderCommand::Pay {
                payment_id: "p".to_string(),
            },
        )
        .await;
    assert!(matches!(result, Err(CommandError::NotFound(_))));
}

// =============================================================================
// Concurrent writers, exactly one wins
// =============================================================================

#[tokio::test]
async fn concurrent_pay_exactly_one_succeeds() {
    let store = Arc::new(InMemoryEventStore::new());
    // Two repository instances simulate two processes: separate locks and
    // caches, shared store. The version fence arbitrates.
    let repo_a = order_repository(&store, EngineConfig::default());
    let repo_b = order_repository(&store, EngineConfig::default());
    let wid = WorkflowId::new("ord-2");

    repo_a
        .create_new(
            &OrderCommand::Place {
                items: vec![],
                total: 5.0,
            },
            &wid,
        )
        .await
        .unwrap();

    let pay = |repo: Arc<Repository>, wid: WorkflowId, id: &'static str| async move {
        repo.process_command(
            &wid,
            &OrderCommand::Pay {
                payment_id: id.to_string(),
            },
        )
        .await
    };

    let (first, second) = tokio::join!(
        pay(repo_a.clone(), wid.clone(), "caller-1"),
        pay(repo_b.clone(), wid.clone(), "caller-2"),
    );

    let successes = [&first, &second].iter().filter(|r| r.is_ok()).count();
    let rejections = [&first, &second]
        .iter()
        .filter(|r| matches!(r, Err(CommandError::Rejected(rej)) if rej.reason == "already paid"))
        .count();

    assert_eq!(successes, 1, "exactly one concurrent payer must win");
    assert_eq!(rejections, 1, "the loser re-decides against v2 and rejects");

    let version = store.current_version("order", &wid).await.unwrap();
    assert_eq!(version, Some(2));
}

// =============================================================================
// Lifecycle gates
// =============================================================================

#[tokio::test]
async fn pause_rejects_commands_until_resume() {
    let store = Arc::new(InMemoryEventStore::new());
    let repo = order_repository(&store, EngineConfig::default());
    let wid = WorkflowId::new("ord-gate");

    repo.create_new(
        &OrderCommand::Place {
            items: vec![],
            total: 1.0,
        },
        &wid,
    )
    .await
    .unwrap();

    let paused = repo.pause_workflow(&wid).await.unwrap();
    assert_eq!(paused.state.lifecycle, Lifecycle::Paused);
    assert_eq!(paused.events[0].event_type, "pause");

    let gated = repo
        .process_command(
            &wid,
            &OrderCommand::Pay {
                payment_id: "p".to_string(),
            },
        )
        .await;
    assert!(matches!(gated, Err(CommandError::Paused(_))));

    // Pause is idempotent: no second event.
    let again = repo.pause_workflow(&wid).await.unwrap();
    assert!(again.events.is_empty());

    let resumed = repo.resume_workflow(&wid).await.unwrap();
    assert_eq!(resumed.state.lifecycle, Lifecycle::Active);

    repo.process_command(
        &wid,
        &OrderCommand::Pay {
            payment_id: "p".to_string(),
        },
    )
    .await
    .unwrap();

    let cancelled = repo.cancel_workflow(&wid, "operator request").await.unwrap();
    assert_eq!(cancelled.state.lifecycle, Lifecycle::Cancelled);
    assert!(matches!(
        repo.process_command(
            &wid,
            &OrderCommand::Pay {
                payment_id: "p3".to_string()
            }
        )
        .await,
        Err(CommandError::Cancelled(_))
    ));
}

// =============================================================================
// Snapshots, load_state, truncation
// =============================================================================

#[tokio::test]
async fn snapshot_round_trip_and_truncation_safety() {
    let store = Arc::new(InMemoryEventStore::new());
    let config = EngineConfig::default().with_snapshot_interval(2);
    let repo = order_repository(&store, config);
    let wid = WorkflowId::new("ord-snap");

    repo.create_new(
        &OrderCommand::Place {
            items: vec![],
            total: 3.0,
        },
        &wid,
    )
    .await
    .unwrap();
    for _ in 0..4 {
        repo.process_command(&wid, &OrderCommand::Remind).await.unwrap();
    }

    // Versions 1..=5 exist; snapshots at 2 and 4.
    let snapshot = store.latest_snapshot(&wid, None).await.unwrap().unwrap();
    assert_eq!(snapshot.at_version, 4);

    let full = repo.load_state(&wid, None).await.unwrap();
    assert_eq!(full.version, 5);
    let full_state: OrderState = serde_json::from_value(full.state.clone()).unwrap();
    assert_eq!(full_state.reminders, 4);

    // Historical versions replay exactly.
    for version in 1..=5 {
        let at = repo.load_state(&wid, Some(version)).await.unwrap();
        assert_eq!(at.version, version, "replay to version {version}");
        let state: OrderState = serde_json::from_value(at.state).unwrap();
        assert_eq!(state.reminders as i64, (version - 1).max(0));
    }

    // A reader past everything plus zero retention lets truncation bite.
    store
        .commit_offset("order.0.of.1", None, 1_000)
        .await
        .unwrap();
    let (_tx, shutdown_rx) = watch::channel(false);
    let truncator = Truncator::new(
        store.clone(),
        Duration::ZERO,
        100,
        Duration::from_secs(60),
        shutdown_rx,
    );
    let deleted = truncator.truncate_once().await.unwrap();
    assert_eq!(deleted, 4, "events at or below the snapshot version go");

    // Post-truncation loads still agree with history.
    let after = repo.load_state(&wid, None).await.unwrap();
    assert_eq!(after.version, 5);
    let after_state: OrderState = serde_json::from_value(after.state).unwrap();
    assert_eq!(after_state.reminders, 4);

    // The snapshot covers everything the delete removed.
    let remaining = store
        .read_workflow_events("order", &wid, 0, None)
        .await
        .unwrap();
    assert!(remaining
        .iter()
        .all(|e| e.workflow_version > snapshot.at_version));
}

// =============================================================================
// Subscription re-injection through the runner
// =============================================================================

#[tokio::test]
async fn subscription_feeds_payment_into_order() {
    let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
    let cache = Arc::new(InMemoryStateCache::new());

    let engine = Engine::builder(store.clone(), cache)
        .with_config(
            EngineConfig::default()
                .with_reader_poll_interval(Duration::from_millis(10))
                .with_reader_batch_size(20),
        )
        .register_workflow::<OrderWorkflow>()
        .unwrap()
        .register_workflow::<PaymentWorkflow>()
        .unwrap()
        .start()
        .await
        .unwrap();

    let orders = engine.repository("order").unwrap();
    let payments = engine.repository("payment").unwrap();

    let a = WorkflowId::new("A");
    let b = WorkflowId::new("B");

    orders
        .create_new(
            &OrderCommand::Place {
                items: vec!["x".to_string()],
                total: 7.0,
            },
            &a,
        )
        .await
        .unwrap();
    orders
        .process_command(
            &a,
            &OrderCommand::WatchPayments {
                source: "B".to_string(),
            },
        )
        .await
        .unwrap();

    payments
        .create_new(
            &PaymentCommand::Complete {
                payment_id: "p-77".to_string(),
            },
            &b,
        )
        .await
        .unwrap();

    // The order runner re-materializes B's event as a Pay command on A.
    wait_for("order A to observe the payment", || {
        let orders = orders.clone();
        let a = a.clone();
        async move {
            let state = orders.get_current_state(&a).await.unwrap();
            let order: OrderState = serde_json::from_value(state.state).unwrap();
            order.paid
        }
    })
    .await;

    let a_state = orders.get_current_state(&a).await.unwrap();
    let order: OrderState = serde_json::from_value(a_state.state.clone()).unwrap();
    assert_eq!(order.payment_id, Some("p-77".to_string()));

    // B is unchanged by being observed.
    let b_state = payments.get_current_state(&b).await.unwrap();
    assert_eq!(b_state.version, 1);

    engine.shutdown().await;
}

// =============================================================================
// Activity retry to success
// =============================================================================

struct FlakyShippingAdapter {
    attempts: Arc<AtomicU32>,
    successes: Arc<AtomicU32>,
    /// Virtual-clock instant of each attempt, for exact backoff asserts.
    attempt_instants: Arc<std::sync::Mutex<Vec<tokio::time::Instant>>>,
}

#[async_trait::async_trait]
impl Adapter for FlakyShippingAdapter {
    fn name(&self) -> &str {
        "flaky-shipping"
    }

    fn applies_to(&self, event: &EventRecord) -> bool {
        event.event_type == "order.placed"
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        Some(
            RetryPolicy::exponential()
                .with_max_retries(3)
                .with_factor(2.0)
                .with_min(Duration::from_millis(50))
                .with_max(Duration::from_millis(500))
                .with_jitter(0.0),
        )
    }

    async fn act_on(
        &self,
        _event: &EventRecord,
        ctx: &ActionContext,
    ) -> Result<(), ActivityError> {
        self.attempt_instants
            .lock()
            .unwrap()
            .push(tokio::time::Instant::now());
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < 2 {
            return Err(ActivityError::new("carrier unavailable"));
        }
        ctx.apply_command(&OrderCommand::Remind).await?;
        self.successes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test_log::test(tokio::test(start_paused = true))]
async fn activity_retries_then_completes_exactly_once() {
    let store_impl = Arc::new(InMemoryEventStore::new());
    let store: Arc<dyn EventStore> = store_impl.clone();
    let repo = order_repository(&store_impl, EngineConfig::default());
    let wid = WorkflowId::new("ord-retry");

    let attempts = Arc::new(AtomicU32::new(0));
    let successes = Arc::new(AtomicU32::new(0));
    let attempt_instants = Arc::new(std::sync::Mutex::new(Vec::new()));
    let adapter = FlakyShippingAdapter {
        attempts: attempts.clone(),
        successes: successes.clone(),
        attempt_instants: attempt_instants.clone(),
    };
    let policy = adapter.retry_policy().unwrap();

    let mut repositories = HashMap::new();
    repositories.insert("order".to_string(), repo.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let executor = ActivityExecutor::new(
        store.clone(),
        repositories,
        vec![Arc::new(adapter)],
        fleuve_engine::partition::Partition::solo(),
        ExecutorConfig {
            poll_interval: Duration::from_millis(10),
            ..ExecutorConfig::default()
        },
        shutdown_rx,
    );
    let executor_handle = tokio::spawn(executor.run());

    repo.create_new(
        &OrderCommand::Place {
            items: vec![],
            total: 2.0,
        },
        &wid,
    )
    .await
    .unwrap();

    run_until("activity to complete after retries", || {
        let store = store.clone();
        let wid = wid.clone();
        async move {
            matches!(
                store.load_activity(&wid, 1).await.unwrap(),
                Some(record) if record.status == ActivityStatus::Completed
            )
        }
    })
    .await;

    let record = store.load_activity(&wid, 1).await.unwrap().unwrap();
    assert_eq!(record.status, ActivityStatus::Completed);
    assert_eq!(record.retry_count, 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(successes.load(Ordering::SeqCst), 1, "exactly one success");

    // On the paused clock the gaps between attempts equal the computed
    // backoffs exactly: 50ms, then 100ms.
    assert_eq!(policy.delay_for_retry(0), Duration::from_millis(50));
    assert_eq!(policy.delay_for_retry(1), Duration::from_millis(100));
    let instants = attempt_instants.lock().unwrap().clone();
    assert_eq!(instants.len(), 3);
    assert_eq!(instants[1] - instants[0], policy.delay_for_retry(0));
    assert_eq!(instants[2] - instants[1], policy.delay_for_retry(1));

    shutdown_tx.send(true).unwrap();
    let joined = tokio::time::timeout(Duration::from_secs(5), executor_handle)
        .await
        .expect("executor drains")
        .unwrap();
    assert_ok!(joined);
}

// =============================================================================
// Dead-lettering and operator retry
// =============================================================================

struct AlwaysFailingAdapter {
    attempts: Arc<AtomicU32>,
}

#[async_trait::async_trait]
impl Adapter for AlwaysFailingAdapter {
    fn name(&self) -> &str {
        "always-failing"
    }

    fn applies_to(&self, event: &EventRecord) -> bool {
        event.event_type == "order.placed"
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        Some(
            RetryPolicy::exponential()
                .with_max_retries(2)
                .with_min(Duration::from_millis(20))
                .with_jitter(0.0),
        )
    }

    async fn act_on(
        &self,
        _event: &EventRecord,
        _ctx: &ActionContext,
    ) -> Result<(), ActivityError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(ActivityError::new("permanently broken"))
    }
}

#[test_log::test(tokio::test(start_paused = true))]
async fn retry_bound_dead_letters_after_max_retries() {
    let store_impl = Arc::new(InMemoryEventStore::new());
    let store: Arc<dyn EventStore> = store_impl.clone();
    let repo = order_repository(&store_impl, EngineConfig::default());
    let wid = WorkflowId::new("ord-dead");

    let attempts = Arc::new(AtomicU32::new(0));
    let mut repositories = HashMap::new();
    repositories.insert("order".to_string(), repo.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let executor = ActivityExecutor::new(
        store.clone(),
        repositories,
        vec![Arc::new(AlwaysFailingAdapter {
            attempts: attempts.clone(),
        })],
        fleuve_engine::partition::Partition::solo(),
        ExecutorConfig {
            poll_interval: Duration::from_millis(10),
            ..ExecutorConfig::default()
        },
        shutdown_rx,
    );
    let executor_handle = tokio::spawn(executor.run());

    repo.create_new(
        &OrderCommand::Place {
            items: vec![],
            total: 2.0,
        },
        &wid,
    )
    .await
    .unwrap();

    run_until("activity to dead-letter", || {
        let store = store.clone();
        let wid = wid.clone();
        async move {
            matches!(
                store.load_activity(&wid, 1).await.unwrap(),
                Some(record) if record.status == ActivityStatus::Failed
            )
        }
    })
    .await;

    // max_retries = 2 means exactly 3 attempts.
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let record = store.load_activity(&wid, 1).await.unwrap().unwrap();
    assert_eq!(record.retry_count, 2);
    assert_eq!(record.last_error.as_deref(), Some("permanently broken"));

    let dead = store
        .list_activities(Some(ActivityStatus::Failed), 10)
        .await
        .unwrap();
    assert_eq!(dead.len(), 1);

    // Operator re-enqueues: the executor picks it up with a fresh budget.
    retry_failed_action(&store, &wid, 1).await.unwrap();
    run_until("retried activity to dead-letter again", || {
        let store = store.clone();
        let wid = wid.clone();
        let attempts = attempts.clone();
        async move {
            attempts.load(Ordering::SeqCst) == 6
                && matches!(
                    store.load_activity(&wid, 1).await.unwrap(),
                    Some(record) if record.status == ActivityStatus::Failed
                )
        }
    })
    .await;

    shutdown_tx.send(true).unwrap();
    let joined = tokio::time::timeout(Duration::from_secs(5), executor_handle)
        .await
        .expect("executor drains")
        .unwrap();
    assert_ok!(joined);
}

// =============================================================================
// Checkpoint survival across attempts
// =============================================================================

struct CheckpointingAdapter {
    attempts: Arc<AtomicU32>,
    charges: Arc<AtomicU32>,
}

#[async_trait::async_trait]
impl Adapter for CheckpointingAdapter {
    fn name(&self) -> &str {
        "checkpointing"
    }

    fn applies_to(&self, event: &EventRecord) -> bool {
        event.event_type == "order.placed"
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        Some(
            RetryPolicy::exponential()
                .with_max_retries(2)
                .with_min(Duration::from_millis(20))
                .with_jitter(0.0),
        )
    }

    async fn act_on(
        &self,
        _event: &EventRecord,
        ctx: &ActionContext,
    ) -> Result<(), ActivityError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        // Idempotent on its own side effect: charge once, checkpoint, and
        // later attempts skip the charge.
        if ctx.checkpoint_value("charged").is_none() {
            self.charges.fetch_add(1, Ordering::SeqCst);
            ctx.save_checkpoint_entry("charged", json!(true)).await?;
            return Err(ActivityError::new("crashed right after charging"));
        }

        Ok(())
    }
}

#[test_log::test(tokio::test(start_paused = true))]
async fn checkpoints_survive_retries() {
    let store_impl = Arc::new(InMemoryEventStore::new());
    let store: Arc<dyn EventStore> = store_impl.clone();
    let repo = order_repository(&store_impl, EngineConfig::default());
    let wid = WorkflowId::new("ord-ckpt");

    let attempts = Arc::new(AtomicU32::new(0));
    let charges = Arc::new(AtomicU32::new(0));
    let mut repositories = HashMap::new();
    repositories.insert("order".to_string(), repo.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let executor = ActivityExecutor::new(
        store.clone(),
        repositories,
        vec![Arc::new(CheckpointingAdapter {
            attempts: attempts.clone(),
            charges: charges.clone(),
        })],
        fleuve_engine::partition::Partition::solo(),
        ExecutorConfig {
            poll_interval: Duration::from_millis(10),
            ..ExecutorConfig::default()
        },
        shutdown_rx,
    );
    let executor_handle = tokio::spawn(executor.run());

    repo.create_new(
        &OrderCommand::Place {
            items: vec![],
            total: 2.0,
        },
        &wid,
    )
    .await
    .unwrap();

    run_until("checkpointed activity to complete", || {
        let store = store.clone();
        let wid = wid.clone();
        async move {
            matches!(
                store.load_activity(&wid, 1).await.unwrap(),
                Some(record) if record.status == ActivityStatus::Completed
            )
        }
    })
    .await;

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(charges.load(Ordering::SeqCst), 1, "charged exactly once");

    let record = store.load_activity(&wid, 1).await.unwrap().unwrap();
    assert_eq!(record.checkpoint["charged"], json!(true));

    shutdown_tx.send(true).unwrap();
    let joined = tokio::time::timeout(Duration::from_secs(5), executor_handle)
        .await
        .expect("executor drains")
        .unwrap();
    assert_ok!(joined);
}

// =============================================================================
// Delay scheduler and cron catch-up
// =============================================================================

#[tokio::test]
async fn one_shot_delay_fires_and_deletes_row() {
    let store_impl = Arc::new(InMemoryEventStore::new());
    let store: Arc<dyn EventStore> = store_impl.clone();
    let repo = order_repository(&store_impl, EngineConfig::default());
    let wid = WorkflowId::new("ord-delay");

    repo.create_new(
        &OrderCommand::Place {
            items: vec![],
            total: 2.0,
        },
        &wid,
    )
    .await
    .unwrap();
    repo.process_command(
        &wid,
        &OrderCommand::ScheduleReminder {
            at: Utc::now() - chrono::Duration::seconds(1),
        },
    )
    .await
    .unwrap();
    assert_eq!(store_impl.schedule_count(), 1);

    let mut repositories = HashMap::new();
    repositories.insert("order".to_string(), repo.clone());
    let (_tx, shutdown_rx) = watch::channel(false);
    let scheduler = DelayScheduler::new(
        store.clone(),
        repositories,
        Duration::from_millis(50),
        10,
        shutdown_rx,
    );

    let fired = scheduler.scan_once(Utc::now()).await.unwrap();
    assert_eq!(fired, 1);
    assert_eq!(store_impl.schedule_count(), 0, "one-shot row deleted");

    let state = repo.get_current_state(&wid).await.unwrap();
    let order: OrderState = serde_json::from_value(state.state).unwrap();
    assert_eq!(order.reminders, 1);

    // delay-complete bookkeeping landed in the log.
    let events = store.read_workflow_events("order", &wid, 0, None).await.unwrap();
    assert!(events.iter().any(|e| e.event_type == "delay-complete"));

    // A second scan finds nothing: at most one fire per visit.
    assert_eq!(scheduler.scan_once(Utc::now()).await.unwrap(), 0);
}

#[tokio::test]
async fn cron_request_records_schedule_row_and_event() {
    let store_impl = Arc::new(InMemoryEventStore::new());
    let store: Arc<dyn EventStore> = store_impl.clone();
    let repo = order_repository(&store_impl, EngineConfig::default());
    let wid = WorkflowId::new("ord-cron-req");

    repo.create_new(
        &OrderCommand::Place {
            items: vec![],
            total: 2.0,
        },
        &wid,
    )
    .await
    .unwrap();
    repo.process_command(
        &wid,
        &OrderCommand::ScheduleDailyReport {
            cron: "0 9 * * *".to_string(),
            timezone: "UTC".to_string(),
        },
    )
    .await
    .unwrap();

    assert_eq!(store_impl.schedule_count(), 1);
    let rows = store
        .due_schedules(Utc::now() + chrono::Duration::days(2), 10)
        .await
        .unwrap();
    assert_eq!(rows[0].cron_expression.as_deref(), Some("0 9 * * *"));
    assert!(rows[0].delay_until > Utc::now());

    let events = store
        .read_workflow_events("order", &wid, 0, None)
        .await
        .unwrap();
    assert!(events.iter().any(|e| e.event_type == "schedule-added"));
}

#[tokio::test]
async fn cron_downtime_fires_once_and_reenqueues() {
    let store_impl = Arc::new(InMemoryEventStore::new());
    let store: Arc<dyn EventStore> = store_impl.clone();
    let repo = order_repository(&store_impl, EngineConfig::default());
    let wid = WorkflowId::new("ord-cron");

    repo.create_new(
        &OrderCommand::Place {
            items: vec![],
            total: 2.0,
        },
        &wid,
    )
    .await
    .unwrap();

    // Row as it would look after insertion at 2024-06-01T08:30Z: the first
    // fire resolved to 09:00 the same day.
    let mut seed = fleuve_engine::persistence::AppendRequest::events(
        "order",
        wid.clone(),
        1,
        vec![],
    );
    seed.schedules = vec![fleuve_engine::delay::DelaySchedule {
        schedule_id: "daily-report".to_string(),
        workflow_type: "order".to_string(),
        workflow_id: wid.clone(),
        event_version: 1,
        delay_until: Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap(),
        next_command: fleuve_engine::workflow::CommandEnvelope::encode(&OrderCommand::Remind)
            .unwrap(),
        cron_expression: Some("0 9 * * *".to_string()),
        timezone: Some("UTC".to_string()),
        created_at: Utc.with_ymd_and_hms(2024, 6, 1, 8, 30, 0).unwrap(),
    }];
    store.append(seed).await.unwrap();

    let mut repositories = HashMap::new();
    repositories.insert("order".to_string(), repo.clone());
    let (_tx, shutdown_rx) = watch::channel(false);
    let scheduler = DelayScheduler::new(
        store.clone(),
        repositories,
        Duration::from_millis(50),
        10,
        shutdown_rx,
    );

    // Scheduler resumes after two days of downtime: exactly one catch-up
    // fire, re-enqueued for the next boundary after `now`.
    let resume_at = Utc.with_ymd_and_hms(2024, 6, 3, 10, 0, 0).unwrap();
    let fired = scheduler.scan_once(resume_at).await.unwrap();
    assert_eq!(fired, 1);

    let state = repo.get_current_state(&wid).await.unwrap();
    let order: OrderState = serde_json::from_value(state.state).unwrap();
    assert_eq!(order.reminders, 1, "one fire for the whole missed window");

    let rows = store
        .due_schedules(Utc.with_ymd_and_hms(2124, 1, 1, 0, 0, 0).unwrap(), 10)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].delay_until,
        Utc.with_ymd_and_hms(2024, 6, 4, 9, 0, 0).unwrap()
    );

    // Nothing else is due at the resume instant.
    assert_eq!(scheduler.scan_once(resume_at).await.unwrap(), 0);
}

// =============================================================================
// Rebalance offset migration
// =============================================================================

#[tokio::test]
async fn scale_down_takes_max_of_removed_offsets() {
    let store_impl = Arc::new(InMemoryEventStore::new());
    let store: Arc<dyn EventStore> = store_impl.clone();

    store.commit_offset(&reader_name("order", 0, 3), None, 100).await.unwrap();
    store.commit_offset(&reader_name("order", 1, 3), None, 150).await.unwrap();
    store.commit_offset(&reader_name("order", 2, 3), None, 120).await.unwrap();

    let report = rebalance(&store, "order", 3, 2).await.unwrap();
    assert_eq!(report.deleted.len(), 3);

    assert_eq!(
        store.load_offset(&reader_name("order", 0, 2)).await.unwrap(),
        Some(120),
        "survivor raised to the removed reader's offset"
    );
    assert_eq!(
        store.load_offset(&reader_name("order", 1, 2)).await.unwrap(),
        Some(150)
    );
    assert_eq!(store.load_offset(&reader_name("order", 2, 3)).await.unwrap(), None);
}

#[tokio::test]
async fn scale_up_starts_new_readers_at_min_offset() {
    let store_impl = Arc::new(InMemoryEventStore::new());
    let store: Arc<dyn EventStore> = store_impl.clone();

    store.commit_offset(&reader_name("order", 0, 3), None, 100).await.unwrap();
    store.commit_offset(&reader_name("order", 1, 3), None, 150).await.unwrap();
    store.commit_offset(&reader_name("order", 2, 3), None, 120).await.unwrap();

    rebalance(&store, "order", 3, 5).await.unwrap();

    // Old indices carry their offsets; fresh indices start at min(100,150,120).
    assert_eq!(store.load_offset(&reader_name("order", 0, 5)).await.unwrap(), Some(100));
    assert_eq!(store.load_offset(&reader_name("order", 1, 5)).await.unwrap(), Some(150));
    assert_eq!(store.load_offset(&reader_name("order", 2, 5)).await.unwrap(), Some(120));
    assert_eq!(store.load_offset(&reader_name("order", 3, 5)).await.unwrap(), Some(100));
    assert_eq!(store.load_offset(&reader_name("order", 4, 5)).await.unwrap(), Some(100));

    // Old reader rows are gone.
    assert_eq!(store.load_offset(&reader_name("order", 0, 3)).await.unwrap(), None);
}

// =============================================================================
// Schema upcast during load
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct NoteState {
    text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum NoteCommand {
    #[serde(rename = "append_text")]
    AppendText { text: String },
}

impl TypeTag for NoteCommand {
    fn type_tag(&self) -> &str {
        "append_text"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum NoteEvent {
    // Version 2 shape; version 1 stored this as {"msg": ...}.
    #[serde(rename = "note.appended")]
    Appended { text: String },
}

impl TypeTag for NoteEvent {
    fn type_tag(&self) -> &str {
        "note.appended"
    }
}

struct NoteWorkflow;

impl Workflow for NoteWorkflow {
    const TYPE: &'static str = "note";
    const SCHEMA_VERSION: i32 = 2;
    type State = NoteState;
    type Command = NoteCommand;
    type Event = NoteEvent;

    fn decide(
        _state: &NoteState,
        _ctx: &DecideContext<'_>,
        command: NoteCommand,
    ) -> Result<Decision<NoteEvent>, Rejection> {
        let NoteCommand::AppendText { text } = command;
        Ok(Decision::events(vec![NoteEvent::Appended { text }]))
    }

    fn evolve(mut state: NoteState, event: &NoteEvent) -> NoteState {
        let NoteEvent::Appended { text } = event;
        state.text.push_str(text);
        state
    }

    fn upcast(
        event_type: &str,
        from_version: i32,
        mut body: serde_json::Value,
    ) -> Result<serde_json::Value, fleuve_engine::workflow::UpcastError> {
        if event_type == "note.appended" && from_version == 1 {
            let msg = body
                .get("msg")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    fleuve_engine::workflow::UpcastError::new(
                        event_type,
                        from_version,
                        "missing msg field",
                    )
                })?
                .to_string();
            body = json!({"type": "note.appended", "text": msg});
        }
        Ok(body)
    }
}

#[tokio::test]
async fn old_schema_events_are_upcast_on_load() {
    let store_impl = Arc::new(InMemoryEventStore::new());
    let store: Arc<dyn EventStore> = store_impl.clone();

    // A record written by the version-1 deployment.
    let request = fleuve_engine::persistence::AppendRequest::events(
        "note",
        WorkflowId::new("note-1"),
        0,
        vec![fleuve_engine::workflow::NewEvent::new(
            "note.appended",
            1,
            json!({"type": "note.appended", "msg": "hello"}),
        )],
    );
    store.append(request).await.unwrap();

    let repo = Arc::new(Repository::new(
        store,
        Arc::new(InMemoryStateCache::new()),
        Arc::new(TypedHandler::<NoteWorkflow>::new()),
        EngineConfig::default(),
    ));

    let wid = WorkflowId::new("note-1");
    let loaded = repo.get_current_state(&wid).await.unwrap();
    let note: NoteState = serde_json::from_value(loaded.state).unwrap();
    assert_eq!(note.text, "hello");

    // New appends continue at the current schema version.
    let outcome = repo
        .process_command(
            &wid,
            &NoteCommand::AppendText {
                text: " world".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.events[0].schema_version, 2);
    let note: NoteState = serde_json::from_value(outcome.state.state).unwrap();
    assert_eq!(note.text, "hello world");
}

#[tokio::test]
async fn malformed_old_event_surfaces_upcast_error() {
    let store_impl = Arc::new(InMemoryEventStore::new());
    let store: Arc<dyn EventStore> = store_impl.clone();

    let request = fleuve_engine::persistence::AppendRequest::events(
        "note",
        WorkflowId::new("note-bad"),
        0,
        vec![fleuve_engine::workflow::NewEvent::new(
            "note.appended",
            1,
            json!({"type": "note.appended"}),
        )],
    );
    store.append(request).await.unwrap();

    let repo = Arc::new(Repository::new(
        store,
        Arc::new(InMemoryStateCache::new()),
        Arc::new(TypedHandler::<NoteWorkflow>::new()),
        EngineConfig::default(),
    ));

    let result = repo.get_current_state(&WorkflowId::new("note-bad")).await;
    assert!(matches!(result, Err(CommandError::Evolve(_))));
}

// =============================================================================
// Append atomicity: a failing sync hook aborts everything
// =============================================================================

#[tokio::test]
async fn failing_sync_db_hook_aborts_the_append() {
    use fleuve_engine::persistence::{StoreError, SyncDbWork, SyncTxn};
    use futures::future::BoxFuture;

    let store_impl = Arc::new(InMemoryEventStore::new());
    let hook: SyncDbWork = Arc::new(
        |_txn: SyncTxn<'_>| -> BoxFuture<'_, Result<(), StoreError>> {
            Box::pin(async { Err(StoreError::Database("denormalized table rejected".into())) })
        },
    );

    let store: Arc<dyn EventStore> = store_impl.clone();
    let repo = Arc::new(
        Repository::new(
            store,
            Arc::new(InMemoryStateCache::new()),
            Arc::new(TypedHandler::<OrderWorkflow>::new()),
            EngineConfig::default(),
        )
        .with_sync_db(hook),
    );

    let wid = WorkflowId::new("ord-sync");
    let result = repo
        .create_new(
            &OrderCommand::Place {
                items: vec![],
                total: 9.0,
            },
            &wid,
        )
        .await;

    assert!(matches!(result, Err(CommandError::Store(_))));
    assert_eq!(store_impl.event_count(), 0, "no partial append");
    assert!(matches!(
        repo.get_current_state(&wid).await,
        Err(CommandError::NotFound(_))
    ));
}
