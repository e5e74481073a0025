//! Kill-rule to actuator flows against the mock broker.

use std::sync::Arc;
use std::time::Duration;

use gantry_broker::PlaceOrderRequest;
use gantry_core::{OrderType, Side};
use gantry_journal::Journal;
use gantry_state::StateCache;
use gantry_supervisor::{
    KillAction, NullAlerter, ShutdownActuator, Supervisor, SupervisorSettings,
};
use gantry_test_utils::{FillMode, MockExchangeState, ScriptedBroker};
use rust_decimal::Decimal;
use tempfile::tempdir;

fn place_open_order(state: &MockExchangeState, cid: &str, symbol: &str) {
    state
        .place_order(&PlaceOrderRequest {
            client_order_id: cid.into(),
            symbol: symbol.into(),
            side: Side::Buy,
            qty: 10.into(),
            order_type: OrderType::Limit,
            limit_price: Some(100.into()),
        })
        .unwrap();
}

struct Fixture {
    state: MockExchangeState,
    cache: StateCache,
    supervisor: Supervisor,
    _journal_dir: tempfile::TempDir,
    state_dir: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let state = MockExchangeState::default();
    state.set_fill_mode(FillMode::Manual);
    let broker = ScriptedBroker::new(state.clone());
    let journal_dir = tempdir().unwrap();
    let state_dir = tempdir().unwrap();
    let journal = Journal::open(journal_dir.path()).unwrap();
    let cache = StateCache::open(state_dir.path()).unwrap();
    let actuator = ShutdownActuator::new(
        broker.clone(),
        cache.clone(),
        journal.clone(),
        state_dir.path().join("trading.pid"),
        Duration::from_millis(100),
    );
    let supervisor = Supervisor::new(
        broker,
        cache.clone(),
        journal,
        actuator,
        Arc::new(NullAlerter),
        SupervisorSettings {
            check_interval: Duration::from_millis(50),
        },
    );
    Fixture {
        state,
        cache,
        supervisor,
        _journal_dir: journal_dir,
        state_dir,
    }
}

#[tokio::test]
async fn daily_loss_breach_halts_cancels_and_flattens() {
    let mut f = fixture();
    // Start-of-day equity 100k; stage a mark-to-market at 94.9k (-5.1%).
    f.state.set_mark("AAPL", 100.into());
    f.state.set_position("AAPL", 10.into(), 100.into());
    f.state.set_cash(Decimal::from(93_900));
    f.state.set_last_equity(Decimal::from(100_000));
    place_open_order(&f.state, "ord-open-1", "AAPL");

    let breach = f.supervisor.check_cycle().await.unwrap().expect("breach");
    assert_eq!(breach.rule, "daily_loss");
    assert_eq!(breach.action, KillAction::FlattenAndHalt);

    // Halt flag is set and attributed.
    let halt = f.cache.halt().unwrap();
    assert!(halt.active);
    assert_eq!(halt.set_by, "supervisor");

    // The staged buy was cancelled and a flattening sell was placed.
    let open = f.state.open_orders();
    assert!(open.iter().all(|o| o.side != Side::Buy));
    let flattens: Vec<_> = f
        .state
        .open_orders()
        .into_iter()
        .filter(|o| o.side == Side::Sell)
        .collect();
    assert_eq!(flattens.len(), 1);
    assert_eq!(flattens[0].qty, 10.into());

    // The halt flag survives a cache reopen (a restart of either process).
    // Every handle to the environment must go first.
    let Fixture {
        state,
        cache,
        supervisor,
        _journal_dir,
        state_dir,
    } = f;
    drop((state, cache, supervisor));
    let reopened = StateCache::open(state_dir.path()).unwrap();
    assert!(reopened.halt().unwrap().active);
}

#[tokio::test]
async fn drawdown_breach_is_a_hard_halt() {
    let mut f = fixture();
    f.state.set_last_equity(Decimal::from(100_000));
    f.state.set_cash(Decimal::from(100_000));

    // First cycle records the peak.
    assert!(f.supervisor.check_cycle().await.unwrap().is_none());

    // Collapse equity 16% below the recorded peak.
    f.state.set_cash(Decimal::from(84_000));
    // Keep daily PnL inside its own limit so drawdown is what trips.
    f.state.set_last_equity(Decimal::from(86_000));

    let breach = f.supervisor.check_cycle().await.unwrap().expect("breach");
    assert_eq!(breach.rule, "max_drawdown");
    assert_eq!(breach.action, KillAction::HardHalt);
    assert!(f.cache.halt().unwrap().active);
}

#[tokio::test]
async fn concentration_breach_flattens_only_that_symbol() {
    let mut f = fixture();
    f.state.set_last_equity(Decimal::from(100_000));
    f.state.set_cash(Decimal::from(70_000));
    f.state.set_mark("NVDA", 300.into());
    f.state.set_position("NVDA", 100.into(), 290.into()); // 30k of ~100k equity

    let breach = f.supervisor.check_cycle().await.unwrap().expect("breach");
    assert_eq!(breach.rule, "concentration");
    assert_eq!(breach.action, KillAction::FlattenSymbol("NVDA".into()));

    // No halt for concentration; one sell order for the offender.
    assert!(!f.cache.halt().unwrap().active);
    let sells: Vec<_> = f
        .state
        .open_orders()
        .into_iter()
        .filter(|o| o.side == Side::Sell && o.symbol == "NVDA")
        .collect();
    assert_eq!(sells.len(), 1);
    assert_eq!(sells[0].qty, 100.into());
}

#[tokio::test]
async fn stale_trading_heartbeat_triggers_flatten_and_halt() {
    let mut f = fixture();
    f.state.set_last_equity(Decimal::from(100_000));
    f.state.set_cash(Decimal::from(100_000));

    // A trading heartbeat 40 seconds in the past.
    let stale = gantry_core::Heartbeat {
        process_id: 1234,
        role: gantry_core::ProcessRole::Trading,
        ts: chrono::Utc::now() - chrono::Duration::seconds(40),
        seq: 9,
    };
    f.cache.set_heartbeat(&stale).unwrap();

    let breach = f.supervisor.check_cycle().await.unwrap().expect("breach");
    assert_eq!(breach.rule, "heartbeat");
    assert!(f.cache.halt().unwrap().active);
}

#[tokio::test]
async fn supervisor_heartbeat_is_published_each_cycle() {
    let mut f = fixture();
    f.state.set_last_equity(Decimal::from(100_000));
    f.state.set_cash(Decimal::from(100_000));

    f.supervisor.check_cycle().await.unwrap();
    let hb = f
        .cache
        .heartbeat(gantry_core::ProcessRole::Supervisor)
        .unwrap()
        .expect("supervisor heartbeat");
    assert_eq!(hb.seq, 1);

    f.supervisor.check_cycle().await.unwrap();
    let hb = f
        .cache
        .heartbeat(gantry_core::ProcessRole::Supervisor)
        .unwrap()
        .unwrap();
    assert_eq!(hb.seq, 2);
}
