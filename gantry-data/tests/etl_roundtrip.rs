//! ETL determinism and loader gating against a real journal.

use chrono::{TimeZone, Utc};
use gantry_core::{
    Bar, DataTier, Fill, Intent, Order, OrderState, OrderType, RecordKind, Side,
};
use gantry_data::{load_bars, load_performance, AnalyticsError, Pipeline};
use gantry_journal::Journal;
use rust_decimal::Decimal;
use serde_json::json;
use tempfile::tempdir;
use uuid::Uuid;

fn bar(symbol: &str, hour: u32, close: i64, tier: DataTier) -> Bar {
    let ts = Utc.with_ymd_and_hms(2025, 6, 2, hour, 30, 0).unwrap();
    Bar {
        symbol: symbol.into(),
        ts,
        open: close.into(),
        high: (close + 1).into(),
        low: (close - 1).into(),
        close: close.into(),
        volume: 10_000.into(),
        tier,
    }
}

fn seed_journal(journal: &Journal) {
    for (hour, close) in [(14, 100), (15, 102), (16, 101)] {
        journal
            .record(
                RecordKind::Bar,
                serde_json::to_value(bar("AAPL", hour, close, DataTier::Consolidated)).unwrap(),
            )
            .unwrap();
    }
    journal
        .record(
            RecordKind::Bar,
            serde_json::to_value(bar("SCRN", 14, 50, DataTier::Universe)).unwrap(),
        )
        .unwrap();

    let intent = Intent {
        strategy_id: "momo".into(),
        signal_id: Uuid::nil(),
        symbol: "AAPL".into(),
        side: Side::Buy,
        qty: 10.into(),
        order_type: OrderType::Market,
        limit_price: None,
        decision_ts: Utc.with_ymd_and_hms(2025, 6, 2, 14, 31, 0).unwrap(),
    };
    let order = Order {
        order_id: "0000000000001-0000".into(),
        client_order_id: intent.client_order_id(),
        symbol: "AAPL".into(),
        side: Side::Buy,
        qty: 10.into(),
        order_type: OrderType::Market,
        limit_price: None,
        state: OrderState::Pending,
        filled_qty: Decimal::ZERO,
        avg_fill_price: None,
        created_at: intent.decision_ts,
        updated_at: intent.decision_ts,
        strategy_id: "momo".into(),
        signal_id: Uuid::nil(),
        broker_ref: None,
    };
    journal
        .record(RecordKind::OrderCreated, serde_json::to_value(&order).unwrap())
        .unwrap();
    journal
        .record(
            RecordKind::OrderTransition,
            json!({
                "order_id": order.order_id,
                "client_order_id": order.client_order_id,
                "from": "PENDING",
                "to": "SUBMITTED",
                "reason": "broker ack",
                "filled_qty": "0",
            }),
        )
        .unwrap();
    journal
        .record(
            RecordKind::Fill,
            serde_json::to_value(Fill {
                fill_id: "fx-1".into(),
                order_id: order.order_id.clone(),
                qty: 10.into(),
                price: 100.into(),
                fees: Decimal::new(35, 2),
                ts: Utc.with_ymd_and_hms(2025, 6, 2, 14, 31, 5).unwrap(),
            })
            .unwrap(),
        )
        .unwrap();
    journal
        .record(
            RecordKind::OrderTransition,
            json!({
                "order_id": order.order_id,
                "client_order_id": order.client_order_id,
                "from": "SUBMITTED",
                "to": "FILLED",
                "reason": "fill applied",
                "filled_qty": "10",
            }),
        )
        .unwrap();
    journal
        .record(
            RecordKind::Metric,
            json!({
                "name": "equity",
                "equity": "100150.00",
                "cash": "99150.00",
                "positions_value": "1000.00",
            }),
        )
        .unwrap();
    journal.flush().unwrap();
}

#[test]
fn replaying_the_journal_twice_writes_identical_partitions() {
    let journal_dir = tempdir().unwrap();
    let lake_dir = tempdir().unwrap();
    let journal = Journal::open(journal_dir.path()).unwrap();
    seed_journal(&journal);

    let pipeline = Pipeline::new(journal_dir.path(), lake_dir.path());
    let first = pipeline.run_once().unwrap();
    assert_eq!(first.bars, 4);
    assert_eq!(first.orders, 1);
    assert_eq!(first.fills, 1);
    assert_eq!(first.performance, 1);

    let snapshot: Vec<(std::path::PathBuf, Vec<u8>)> = collect_files(lake_dir.path());
    assert!(!snapshot.is_empty());

    let second = pipeline.run_once().unwrap();
    assert_eq!(first, second);
    for (path, bytes) in &snapshot {
        assert_eq!(
            &std::fs::read(path).unwrap(),
            bytes,
            "partition {} changed across identical runs",
            path.display()
        );
    }
}

#[test]
fn bars_loader_round_trips_clean_symbols() {
    let journal_dir = tempdir().unwrap();
    let lake_dir = tempdir().unwrap();
    let journal = Journal::open(journal_dir.path()).unwrap();
    seed_journal(&journal);
    Pipeline::new(journal_dir.path(), lake_dir.path()).run_once().unwrap();

    let bars = load_bars(lake_dir.path(), "AAPL").unwrap();
    assert_eq!(bars.len(), 3);
    assert_eq!(bars[0].close, 100.into());
    assert!(bars.windows(2).all(|pair| pair[0].ts <= pair[1].ts));

    let curve = load_performance(lake_dir.path()).unwrap();
    assert_eq!(curve.len(), 1);
    assert_eq!(curve[0].equity, Decimal::new(100_150_00, 2));
}

#[test]
fn universe_tier_rows_invalidate_the_load() {
    let journal_dir = tempdir().unwrap();
    let lake_dir = tempdir().unwrap();
    let journal = Journal::open(journal_dir.path()).unwrap();
    seed_journal(&journal);
    Pipeline::new(journal_dir.path(), lake_dir.path()).run_once().unwrap();

    match load_bars(lake_dir.path(), "SCRN") {
        Err(AnalyticsError::UniverseTierInBacktest { count }) => assert_eq!(count, 1),
        other => panic!("expected universe-tier rejection, got {other:?}"),
    }
}

fn collect_files(root: &std::path::Path) -> Vec<(std::path::PathBuf, Vec<u8>)> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
            } else {
                let bytes = std::fs::read(&path).unwrap();
                files.push((path, bytes));
            }
        }
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    files
}
