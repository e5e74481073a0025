//! End-to-end order lifecycle flows against the scripted mock broker.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use gantry_core::{Intent, OrderState, OrderType, RecordKind, Side};
use gantry_execution::{
    EngineError, EngineTimeouts, OrderEngine, Reconciler, RetryPolicy,
};
use gantry_journal::Journal;
use gantry_portfolio::{Portfolio, PortfolioConfig};
use gantry_state::StateCache;
use gantry_test_utils::{FillMode, MockExchangeState, ScriptedBroker};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tempfile::TempDir;
use uuid::Uuid;

struct Harness {
    state: MockExchangeState,
    broker: Arc<ScriptedBroker>,
    engine: Arc<OrderEngine>,
    journal: Journal,
    cache: StateCache,
    _journal_dir: TempDir,
    fed_seq: u64,
}

impl Harness {
    fn new(fill_mode: FillMode) -> Self {
        let state = MockExchangeState::default();
        state.set_fill_mode(fill_mode);
        let broker = ScriptedBroker::new(state.clone());
        let journal_dir = TempDir::new().unwrap();
        let journal = Journal::open(journal_dir.path()).unwrap();
        let cache = StateCache::in_memory();
        let portfolio = Arc::new(Mutex::new(Portfolio::new(&PortfolioConfig::default())));
        let engine = OrderEngine::new(
            broker.clone(),
            journal.clone(),
            cache.clone(),
            portfolio,
            EngineTimeouts::default(),
            fast_retry(),
        );
        Self {
            state,
            broker,
            engine,
            journal,
            cache,
            _journal_dir: journal_dir,
            fed_seq: 0,
        }
    }

    /// Feed every broker event the exchange has emitted since the last pump.
    async fn pump(&mut self) {
        for event in self.state.events_from(self.fed_seq + 1) {
            self.fed_seq = event.seq;
            self.engine.on_broker_event(event).await.unwrap();
        }
    }

    fn reconciler(&self, grace: Duration) -> Reconciler {
        Reconciler::new(self.engine.clone(), self.broker.clone(), grace)
    }

    fn journal_kind_count(&self, kind: RecordKind) -> usize {
        self.journal.flush().unwrap();
        self.journal
            .replay()
            .unwrap()
            .filter(|record| record.as_ref().is_ok_and(|r| r.kind == kind))
            .count()
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
        jitter_factor: 0.0,
    }
}

fn intent(symbol: &str, side: Side, qty: i64) -> Intent {
    Intent {
        strategy_id: "test".into(),
        signal_id: Uuid::new_v4(),
        symbol: symbol.into(),
        side,
        qty: qty.into(),
        order_type: OrderType::Market,
        limit_price: None,
        decision_ts: Utc::now(),
    }
}

#[tokio::test]
async fn happy_path_market_order_fills() {
    let mut h = Harness::new(FillMode::Immediate);
    h.state.set_mark("AAPL", 150.into());

    let handle = h.engine.submit(&intent("AAPL", Side::Buy, 10)).await.unwrap();
    h.pump().await;

    let order = h.engine.order(&handle.client_order_id).await.unwrap();
    assert_eq!(order.state, OrderState::Filled);
    assert_eq!(order.filled_qty, 10.into());
    assert_eq!(order.avg_fill_price, Some(150.into()));

    let position = h.cache.position("AAPL").unwrap().expect("position in cache");
    assert_eq!(position.net_qty, 10.into());
    assert_eq!(position.avg_cost, 150.into());
}

#[tokio::test]
async fn duplicate_submit_places_exactly_one_broker_order() {
    let mut h = Harness::new(FillMode::Immediate);
    h.state.set_mark("AAPL", 150.into());
    let intent = intent("AAPL", Side::Buy, 10);

    let first = h.engine.submit(&intent).await.unwrap();
    let second = h.engine.submit(&intent).await.unwrap();
    h.pump().await;

    assert_eq!(first.client_order_id, second.client_order_id);
    assert_eq!(first.order_id, second.order_id);
    assert_eq!(h.state.place_calls(), 1, "broker saw exactly one POST");
    assert_eq!(h.state.orders_created(), 1);
    assert_eq!(h.journal_kind_count(RecordKind::OrderCreated), 1);
}

#[tokio::test]
async fn lost_responses_resolve_through_reconciler() {
    let mut h = Harness::new(FillMode::Silent);
    // Every placement reaches the exchange, every response is lost.
    h.broker.drop_next_place_responses(4);

    let handle = h.engine.submit(&intent("AAPL", Side::Buy, 5)).await.unwrap();
    assert_eq!(handle.state, OrderState::Unknown);
    // Retries reused the idempotency key: one order exists server-side.
    assert_eq!(h.state.orders_created(), 1);

    // The broker filled it while we were blind.
    h.state
        .fill_order(&handle.client_order_id, 5.into(), Decimal::new(10110, 2));

    let reconciler = h.reconciler(Duration::from_secs(60));
    reconciler.reconcile_order(&handle.client_order_id).await.unwrap();

    let order = h.engine.order(&handle.client_order_id).await.unwrap();
    assert_eq!(order.state, OrderState::Filled);
    assert_eq!(order.filled_qty, 5.into());
    assert_eq!(order.avg_fill_price, Some(Decimal::new(10110, 2)));
    h.pump().await; // silent mode: nothing buffered
}

#[tokio::test]
async fn never_found_order_fails_after_grace() {
    let h = Harness::new(FillMode::Silent);
    // Placement never reaches the exchange at all.
    h.broker.refuse_next_places(4);

    let handle = h.engine.submit(&intent("MSFT", Side::Buy, 5)).await.unwrap();
    assert_eq!(handle.state, OrderState::Unknown);
    assert_eq!(h.state.orders_created(), 0);

    let reconciler = h.reconciler(Duration::ZERO);
    reconciler.reconcile_order(&handle.client_order_id).await.unwrap();

    let order = h.engine.order(&handle.client_order_id).await.unwrap();
    assert_eq!(order.state, OrderState::Failed);
}

#[tokio::test]
async fn partial_fill_then_cancel_keeps_filled_quantity() {
    let mut h = Harness::new(FillMode::Manual);

    let handle = h.engine.submit(&intent("NVDA", Side::Buy, 10)).await.unwrap();
    h.pump().await;
    assert_eq!(
        h.engine.order(&handle.client_order_id).await.unwrap().state,
        OrderState::Submitted
    );

    h.state.fill_order(&handle.client_order_id, 6.into(), 200.into());
    h.pump().await;
    let order = h.engine.order(&handle.client_order_id).await.unwrap();
    assert_eq!(order.state, OrderState::PartialFill);
    assert_eq!(order.filled_qty, 6.into());

    h.engine.cancel(&handle.client_order_id).await.unwrap();
    assert_eq!(
        h.engine.order(&handle.client_order_id).await.unwrap().state,
        OrderState::Cancelling
    );
    h.pump().await;

    let order = h.engine.order(&handle.client_order_id).await.unwrap();
    assert_eq!(order.state, OrderState::Cancelled);
    assert_eq!(order.filled_qty, 6.into());
    assert!(order.filled_qty <= order.qty);
}

#[tokio::test]
async fn limit_without_price_is_a_bad_request() {
    let h = Harness::new(FillMode::Manual);
    let mut bad = intent("AAPL", Side::Buy, 10);
    bad.order_type = OrderType::Limit;
    match h.engine.submit(&bad).await {
        Err(EngineError::BadRequest(_)) => {}
        other => panic!("expected BadRequest, got {other:?}"),
    }
}

#[tokio::test]
async fn cancel_of_terminal_order_is_refused() {
    let mut h = Harness::new(FillMode::Immediate);
    h.state.set_mark("AAPL", 150.into());
    let handle = h.engine.submit(&intent("AAPL", Side::Sell, 3)).await.unwrap();
    h.pump().await;

    match h.engine.cancel(&handle.client_order_id).await {
        Err(EngineError::NotCancellable { state, .. }) => {
            assert_eq!(state, OrderState::Filled);
        }
        other => panic!("expected NotCancellable, got {other:?}"),
    }
}

#[tokio::test]
async fn overfill_event_is_rejected_without_mutation() {
    let mut h = Harness::new(FillMode::Manual);
    let handle = h.engine.submit(&intent("AMD", Side::Buy, 10)).await.unwrap();
    h.pump().await;

    // A corrupt event claiming more than the order quantity.
    let bogus = gantry_core::BrokerEvent {
        seq: 9_999,
        kind: gantry_core::BrokerEventKind::Fill,
        order_id: None,
        client_order_id: handle.client_order_id.clone(),
        fill_id: Some("bogus".into()),
        qty: Some(11.into()),
        price: Some(100.into()),
        fees: None,
        reason: None,
        ts: Utc::now(),
    };
    h.engine.on_broker_event(bogus).await.unwrap();

    let order = h.engine.order(&handle.client_order_id).await.unwrap();
    assert_eq!(order.state, OrderState::Submitted);
    assert_eq!(order.filled_qty, 0.into());
}

#[tokio::test]
async fn duplicate_fill_events_apply_once() {
    let mut h = Harness::new(FillMode::Manual);
    let handle = h.engine.submit(&intent("TSLA", Side::Buy, 10)).await.unwrap();
    h.pump().await;

    h.state.fill_order(&handle.client_order_id, 4.into(), 250.into());
    let events = h.state.events_from(h.fed_seq + 1);
    for event in events.iter().chain(events.iter()) {
        h.engine.on_broker_event(event.clone()).await.unwrap();
    }

    let order = h.engine.order(&handle.client_order_id).await.unwrap();
    assert_eq!(order.filled_qty, 4.into());
    assert_eq!(h.journal_kind_count(RecordKind::Fill), 1);
}

#[tokio::test]
async fn position_divergence_is_overwritten_from_broker() {
    let h = Harness::new(FillMode::Manual);
    // Broker says we are long 25 GOOG; local cache knows nothing.
    h.state.set_mark("GOOG", 120.into());
    h.state.set_position("GOOG", 25.into(), 118.into());

    let reconciler = h.reconciler(Duration::from_secs(60));
    let report = reconciler.sweep().await.unwrap();
    assert_eq!(report.position_divergences, vec!["GOOG".to_string()]);

    let position = h.cache.position("GOOG").unwrap().unwrap();
    assert_eq!(position.net_qty, 25.into());
    assert_eq!(h.journal_kind_count(RecordKind::PositionReconciled), 1);

    // A second pass is a no-op: broker and cache agree.
    let report = reconciler.sweep().await.unwrap();
    assert!(report.position_divergences.is_empty());
}

#[tokio::test]
async fn every_transition_lands_in_the_journal() {
    let mut h = Harness::new(FillMode::Immediate);
    h.state.set_mark("AAPL", 150.into());
    h.engine.submit(&intent("AAPL", Side::Buy, 10)).await.unwrap();
    h.pump().await;

    // PENDING->SUBMITTED, SUBMITTED->PARTIAL? no: market fills whole, so
    // SUBMITTED->FILLED. Two transitions plus the creation record.
    assert_eq!(h.journal_kind_count(RecordKind::OrderCreated), 1);
    assert!(h.journal_kind_count(RecordKind::OrderTransition) >= 2);
}

#[tokio::test]
async fn silent_broker_ack_window_moves_order_to_unknown() {
    let h = Harness::new(FillMode::Silent);
    let engine = OrderEngine::new(
        h.broker.clone(),
        h.journal.clone(),
        h.cache.clone(),
        Arc::new(Mutex::new(Portfolio::new(&PortfolioConfig::default()))),
        EngineTimeouts {
            t_ack: Duration::from_millis(50),
            t_zombie: Duration::from_secs(300),
        },
        fast_retry(),
    );
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let monitor = gantry_execution::spawn_ack_monitor(engine.clone(), shutdown_rx);

    // REST accepts the order but the stream never confirms it.
    let handle = engine.submit(&intent("AAPL", Side::Buy, 2)).await.unwrap();
    assert_eq!(handle.state, OrderState::Submitted);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let order = engine.order(&handle.client_order_id).await.unwrap();
        if order.state == OrderState::Unknown {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "order never entered UNKNOWN, still {}",
            order.state
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    monitor.abort();
}

#[tokio::test]
async fn restart_with_in_flight_order_converges_through_reconciliation() {
    let state = MockExchangeState::default();
    state.set_fill_mode(FillMode::Silent);
    let broker = ScriptedBroker::new(state.clone());
    let journal_dir = TempDir::new().unwrap();
    let journal = Journal::open(journal_dir.path()).unwrap();
    let cache = StateCache::in_memory();

    // First run: place an order whose events never arrive, then "crash".
    let cid = {
        let engine = OrderEngine::new(
            broker.clone(),
            journal.clone(),
            cache.clone(),
            Arc::new(Mutex::new(Portfolio::new(&PortfolioConfig::default()))),
            EngineTimeouts::default(),
            fast_retry(),
        );
        let handle = engine.submit(&intent("AAPL", Side::Buy, 7)).await.unwrap();
        assert_eq!(handle.state, OrderState::Submitted);
        handle.client_order_id
    };

    // The broker filled it while the process was down.
    state.fill_order(&cid, 7.into(), 150.into());

    // Second run: adopt persisted open orders, reconcile, converge.
    let engine = OrderEngine::new(
        broker.clone(),
        journal.clone(),
        cache.clone(),
        Arc::new(Mutex::new(Portfolio::new(&PortfolioConfig::default()))),
        EngineTimeouts::default(),
        fast_retry(),
    );
    let persisted = cache.open_orders().unwrap();
    assert_eq!(persisted.len(), 1, "working order survived in the cache");
    engine.adopt_orders(persisted);

    let reconciler = Reconciler::new(engine.clone(), broker.clone(), Duration::from_secs(60));
    // Adoption queues the order for on-demand reconciliation; resolve it
    // the way the reconciler task would, then run a full sweep.
    reconciler.reconcile_order(&cid).await.unwrap();
    reconciler.sweep().await.unwrap();

    let order = engine.order(&cid).await.unwrap();
    assert_eq!(order.state, OrderState::Filled);
    assert_eq!(order.filled_qty, 7.into());
    // The cache agrees with the broker on the resulting position.
    assert_eq!(
        cache.position("AAPL").unwrap().unwrap().net_qty,
        7.into()
    );
}
