//! End-to-end flow over real transports: HTTP broker client, WebSocket
//! event stream, engine, and reconciler against the mock broker.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use gantry_broker::rest::{BrokerCredentials, HttpBrokerConfig};
use gantry_broker::{BrokerClient, EventStream, HttpBroker};
use gantry_core::{Intent, OrderState, OrderType, Side};
use gantry_execution::{EngineTimeouts, OrderEngine, RetryPolicy};
use gantry_journal::Journal;
use gantry_portfolio::{Portfolio, PortfolioConfig};
use gantry_state::StateCache;
use gantry_test_utils::MockBroker;
use parking_lot::Mutex;
use tempfile::TempDir;
use uuid::Uuid;

async fn http_broker(mock: &MockBroker) -> Arc<HttpBroker> {
    Arc::new(
        HttpBroker::new(HttpBrokerConfig {
            rest_url: mock.rest_url(),
            ws_url: mock.ws_url(),
            credentials: BrokerCredentials {
                key_id: "trading-key".into(),
                secret: "trading-secret".into(),
            },
            request_timeout: Duration::from_secs(2),
            requests_per_second: 100,
        })
        .unwrap(),
    )
}

fn engine_with(broker: Arc<HttpBroker>, journal_dir: &TempDir) -> Arc<OrderEngine> {
    let journal = Journal::open(journal_dir.path()).unwrap();
    let cache = StateCache::in_memory();
    let portfolio = Arc::new(Mutex::new(Portfolio::new(&PortfolioConfig::default())));
    OrderEngine::new(
        broker,
        journal,
        cache,
        portfolio,
        EngineTimeouts::default(),
        RetryPolicy {
            base_delay: Duration::from_millis(5),
            ..RetryPolicy::default()
        },
    )
}

fn market_intent(symbol: &str, qty: i64) -> Intent {
    Intent {
        strategy_id: "e2e".into(),
        signal_id: Uuid::new_v4(),
        symbol: symbol.into(),
        side: Side::Buy,
        qty: qty.into(),
        order_type: OrderType::Market,
        limit_price: None,
        decision_ts: Utc::now(),
    }
}

#[tokio::test]
async fn order_fills_over_http_and_websocket() {
    let mut mock = MockBroker::spawn().await.unwrap();
    mock.state.set_mark("AAPL", 150.into());
    let broker = http_broker(&mock).await;
    let journal_dir = TempDir::new().unwrap();
    let engine = engine_with(broker.clone(), &journal_dir);

    // Connect the stream reader before placing so no events are missed.
    let mut stream = EventStream::connect(&broker.stream_url(None)).await.unwrap();

    let handle = engine.submit(&market_intent("AAPL", 10)).await.unwrap();
    assert_eq!(handle.state, OrderState::Submitted);

    // Drain ack + fill from the live stream into the engine.
    let mut fills_seen = 0;
    while fills_seen < 1 {
        let event = tokio::time::timeout(Duration::from_secs(2), stream.next_event())
            .await
            .expect("stream delivered events")
            .unwrap()
            .expect("stream open");
        if event.kind == gantry_core::BrokerEventKind::Fill {
            fills_seen += 1;
        }
        engine.on_broker_event(event).await.unwrap();
    }

    let order = engine.order(&handle.client_order_id).await.unwrap();
    assert_eq!(order.state, OrderState::Filled);
    assert_eq!(order.filled_qty, 10.into());
    assert_eq!(order.avg_fill_price, Some(150.into()));

    mock.shutdown().await;
}

#[tokio::test]
async fn stream_resumes_from_last_sequence_after_reconnect() {
    let mut mock = MockBroker::spawn().await.unwrap();
    mock.state.set_mark("MSFT", 400.into());
    let broker = http_broker(&mock).await;

    // Generate two events (ack + fill) with no reader connected.
    broker
        .place(gantry_broker::PlaceOrderRequest {
            client_order_id: "ord-resume-test".into(),
            symbol: "MSFT".into(),
            side: Side::Buy,
            qty: 5.into(),
            order_type: OrderType::Market,
            limit_price: None,
        })
        .await
        .unwrap();

    // First connection replays the backlog from the start.
    let mut stream = EventStream::connect(&broker.stream_url(None)).await.unwrap();
    let first = tokio::time::timeout(Duration::from_secs(2), stream.next_event())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let resume_from = first.seq;
    drop(stream);

    // Reconnect with resume: the already-seen event is not replayed.
    let mut stream = EventStream::connect(&broker.stream_url(Some(resume_from)))
        .await
        .unwrap();
    let next = tokio::time::timeout(Duration::from_secs(2), stream.next_event())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(next.seq > resume_from, "resume skips acknowledged events");

    mock.shutdown().await;
}

#[tokio::test]
async fn rest_rejection_maps_to_rejected_state() {
    let mut mock = MockBroker::spawn().await.unwrap();
    mock.state.fail_next_place(422);
    let broker = http_broker(&mock).await;
    let journal_dir = TempDir::new().unwrap();
    let engine = engine_with(broker, &journal_dir);

    let handle = engine.submit(&market_intent("AAPL", 10)).await.unwrap();
    assert_eq!(handle.state, OrderState::Rejected);

    mock.shutdown().await;
}

#[tokio::test]
async fn transient_rest_failures_are_retried_to_success() {
    let mut mock = MockBroker::spawn().await.unwrap();
    mock.state.set_mark("NVDA", 120.into());
    mock.state.fail_next_place(503);
    let broker = http_broker(&mock).await;
    let journal_dir = TempDir::new().unwrap();
    let engine = engine_with(broker, &journal_dir);

    let handle = engine.submit(&market_intent("NVDA", 4)).await.unwrap();
    // One 503, then the retry lands under the same idempotency key.
    assert_eq!(handle.state, OrderState::Submitted);
    assert_eq!(mock.state.orders_created(), 1);
    assert_eq!(mock.state.place_calls(), 2);

    mock.shutdown().await;
}
