//! Journal-to-Parquet ETL pipeline.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{ArrayRef, Decimal128Builder, Int64Builder, StringBuilder};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, NaiveDate, Utc};
use gantry_core::{Bar, Fill, Order, OrderState, RecordKind, Side};
use gantry_journal::JournalReader;
use parquet::arrow::ArrowWriter;
use rust_decimal::Decimal;
use tracing::info;

use crate::schema::{
    bars_schema, decimal_to_i128, decimal_type, fills_schema, orders_schema, performance_schema,
    positions_schema,
};
use crate::{AnalyticsError, AnalyticsResult};

/// Row counts written by one ETL pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct EtlSummary {
    pub bars: usize,
    pub orders: usize,
    pub fills: usize,
    pub positions: usize,
    pub performance: usize,
}

#[derive(Clone)]
struct OrderRow {
    order: Order,
    final_state: OrderState,
    terminal_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
struct PositionRow {
    ts: DateTime<Utc>,
    symbol: String,
    net_qty: Decimal,
    avg_cost: Decimal,
    unrealized_pnl: Decimal,
}

#[derive(Clone)]
struct PerformanceRow {
    ts: DateTime<Utc>,
    equity: Decimal,
    cash: Decimal,
    positions_value: Decimal,
}

/// Replays the journal into the analytical tables.
pub struct Pipeline {
    journal_root: PathBuf,
    output_root: PathBuf,
}

impl Pipeline {
    pub fn new(journal_root: impl AsRef<Path>, output_root: impl AsRef<Path>) -> Self {
        Self {
            journal_root: journal_root.as_ref().to_path_buf(),
            output_root: output_root.as_ref().to_path_buf(),
        }
    }

    /// One full pass over the journal. Idempotent: identical journal
    /// contents produce identical partition files.
    pub fn run_once(&self) -> AnalyticsResult<EtlSummary> {
        // Keyed maps give both deduplication and deterministic ordering.
        let mut bars: BTreeMap<(String, i64), Bar> = BTreeMap::new();
        let mut orders: BTreeMap<String, OrderRow> = BTreeMap::new();
        let mut fills: BTreeMap<String, Fill> = BTreeMap::new();
        let mut positions: BTreeMap<(i64, String), PositionRow> = BTreeMap::new();
        let mut performance: BTreeMap<i64, PerformanceRow> = BTreeMap::new();

        for record in JournalReader::open(&self.journal_root)? {
            let record = record?;
            match record.kind {
                RecordKind::Bar => {
                    if let Ok(bar) = serde_json::from_value::<Bar>(record.data) {
                        bars.insert((bar.symbol.clone(), nanos(bar.ts)), bar);
                    }
                }
                RecordKind::OrderCreated => {
                    if let Ok(order) = serde_json::from_value::<Order>(record.data) {
                        let state = order.state;
                        orders
                            .entry(order.order_id.clone())
                            .or_insert_with(|| OrderRow {
                                order,
                                final_state: state,
                                terminal_at: None,
                            });
                    }
                }
                RecordKind::OrderTransition => {
                    let order_id = record.data["order_id"].as_str().unwrap_or_default();
                    let Some(row) = orders.get_mut(order_id) else {
                        continue;
                    };
                    if let Ok(state) =
                        serde_json::from_value::<OrderState>(record.data["to"].clone())
                    {
                        row.final_state = state;
                        if state.is_terminal() {
                            row.terminal_at = Some(record.ts);
                        }
                        if let Some(filled) = record.data["filled_qty"]
                            .as_str()
                            .and_then(|raw| raw.parse::<Decimal>().ok())
                        {
                            row.order.filled_qty = filled;
                        }
                    }
                }
                RecordKind::Fill => {
                    if let Ok(fill) = serde_json::from_value::<Fill>(record.data) {
                        fills.insert(fill.fill_id.clone(), fill);
                    }
                }
                RecordKind::PositionReconciled => {
                    let symbol = record.data["symbol"].as_str().unwrap_or_default().to_string();
                    if symbol.is_empty() {
                        continue;
                    }
                    positions.insert(
                        (nanos(record.ts), symbol.clone()),
                        PositionRow {
                            ts: record.ts,
                            symbol,
                            net_qty: decimal_field(&record.data, "remote_qty"),
                            avg_cost: decimal_field(&record.data, "avg_cost"),
                            unrealized_pnl: Decimal::ZERO,
                        },
                    );
                }
                RecordKind::Metric => match record.data["name"].as_str() {
                    Some("equity") => {
                        performance.insert(
                            nanos(record.ts),
                            PerformanceRow {
                                ts: record.ts,
                                equity: decimal_field(&record.data, "equity"),
                                cash: decimal_field(&record.data, "cash"),
                                positions_value: decimal_field(&record.data, "positions_value"),
                            },
                        );
                    }
                    Some("position") => {
                        let symbol =
                            record.data["symbol"].as_str().unwrap_or_default().to_string();
                        if symbol.is_empty() {
                            continue;
                        }
                        positions.insert(
                            (nanos(record.ts), symbol.clone()),
                            PositionRow {
                                ts: record.ts,
                                symbol,
                                net_qty: decimal_field(&record.data, "net_qty"),
                                avg_cost: decimal_field(&record.data, "avg_cost"),
                                unrealized_pnl: decimal_field(&record.data, "unrealized_pnl"),
                            },
                        );
                    }
                    _ => {}
                },
                _ => {}
            }
        }

        let summary = EtlSummary {
            bars: bars.len(),
            orders: orders.len(),
            fills: fills.len(),
            positions: positions.len(),
            performance: performance.len(),
        };

        self.write_partitioned("bars", bars.into_values(), |bar| bar.ts.date_naive(), bars_batch)?;
        self.write_partitioned(
            "orders",
            orders.into_values(),
            |row| row.order.created_at.date_naive(),
            orders_batch,
        )?;
        self.write_partitioned("fills", fills.into_values(), |fill| fill.ts.date_naive(), fills_batch)?;
        self.write_partitioned(
            "positions",
            positions.into_values(),
            |row| row.ts.date_naive(),
            positions_batch,
        )?;
        self.write_partitioned(
            "performance",
            performance.into_values(),
            |row| row.ts.date_naive(),
            performance_batch,
        )?;

        info!(
            bars = summary.bars,
            orders = summary.orders,
            fills = summary.fills,
            positions = summary.positions,
            performance = summary.performance,
            "etl pass complete"
        );
        Ok(summary)
    }

    fn write_partitioned<R>(
        &self,
        table: &str,
        rows: impl Iterator<Item = R>,
        date_of: impl Fn(&R) -> NaiveDate,
        to_batch: impl Fn(&[R]) -> AnalyticsResult<RecordBatch>,
    ) -> AnalyticsResult<()> {
        let mut partitions: BTreeMap<NaiveDate, Vec<R>> = BTreeMap::new();
        for row in rows {
            partitions.entry(date_of(&row)).or_default().push(row);
        }
        for (date, rows) in partitions {
            let dir = self.output_root.join(table).join(format!("date={date}"));
            fs::create_dir_all(&dir)?;
            let path = dir.join("part-00000.parquet");
            let batch = to_batch(&rows)?;
            let file = File::create(&path)?;
            let mut writer = ArrowWriter::try_new(file, batch.schema(), None)?;
            writer.write(&batch)?;
            writer.close()?;
        }
        Ok(())
    }
}

fn nanos(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

fn decimal_field(data: &serde_json::Value, field: &str) -> Decimal {
    match &data[field] {
        serde_json::Value::String(raw) => raw.parse().unwrap_or(Decimal::ZERO),
        serde_json::Value::Number(num) => num
            .to_string()
            .parse()
            .unwrap_or(Decimal::ZERO),
        _ => Decimal::ZERO,
    }
}

fn side_label(side: Side) -> &'static str {
    match side {
        Side::Buy => "buy",
        Side::Sell => "sell",
    }
}

fn bars_batch(rows: &[Bar]) -> AnalyticsResult<RecordBatch> {
    let mut symbol = StringBuilder::new();
    let mut ts = Int64Builder::new();
    let mut open = Decimal128Builder::new().with_data_type(decimal_type());
    let mut high = Decimal128Builder::new().with_data_type(decimal_type());
    let mut low = Decimal128Builder::new().with_data_type(decimal_type());
    let mut close = Decimal128Builder::new().with_data_type(decimal_type());
    let mut volume = Decimal128Builder::new().with_data_type(decimal_type());
    let mut tier = StringBuilder::new();
    for bar in rows {
        symbol.append_value(&bar.symbol);
        ts.append_value(nanos(bar.ts));
        open.append_value(decimal_to_i128(bar.open)?);
        high.append_value(decimal_to_i128(bar.high)?);
        low.append_value(decimal_to_i128(bar.low)?);
        close.append_value(decimal_to_i128(bar.close)?);
        volume.append_value(decimal_to_i128(bar.volume)?);
        tier.append_value(bar.tier.as_str());
    }
    let columns: Vec<ArrayRef> = vec![
        Arc::new(symbol.finish()),
        Arc::new(ts.finish()),
        Arc::new(open.finish()),
        Arc::new(high.finish()),
        Arc::new(low.finish()),
        Arc::new(close.finish()),
        Arc::new(volume.finish()),
        Arc::new(tier.finish()),
    ];
    RecordBatch::try_new(bars_schema(), columns).map_err(AnalyticsError::from)
}

fn orders_batch(rows: &[OrderRow]) -> AnalyticsResult<RecordBatch> {
    let mut order_id = StringBuilder::new();
    let mut client_order_id = StringBuilder::new();
    let mut symbol = StringBuilder::new();
    let mut side = StringBuilder::new();
    let mut qty = Decimal128Builder::new().with_data_type(decimal_type());
    let mut order_type = StringBuilder::new();
    let mut limit_price = Decimal128Builder::new().with_data_type(decimal_type());
    let mut final_state = StringBuilder::new();
    let mut created_at = Int64Builder::new();
    let mut terminal_at = Int64Builder::new();
    for row in rows {
        order_id.append_value(&row.order.order_id);
        client_order_id.append_value(&row.order.client_order_id);
        symbol.append_value(&row.order.symbol);
        side.append_value(side_label(row.order.side));
        qty.append_value(decimal_to_i128(row.order.qty)?);
        order_type.append_value(match row.order.order_type {
            gantry_core::OrderType::Market => "market",
            gantry_core::OrderType::Limit => "limit",
        });
        match row.order.limit_price {
            Some(price) => limit_price.append_value(decimal_to_i128(price)?),
            None => limit_price.append_null(),
        }
        final_state.append_value(row.final_state.to_string());
        created_at.append_value(nanos(row.order.created_at));
        match row.terminal_at {
            Some(ts) => terminal_at.append_value(nanos(ts)),
            None => terminal_at.append_null(),
        }
    }
    let columns: Vec<ArrayRef> = vec![
        Arc::new(order_id.finish()),
        Arc::new(client_order_id.finish()),
        Arc::new(symbol.finish()),
        Arc::new(side.finish()),
        Arc::new(qty.finish()),
        Arc::new(order_type.finish()),
        Arc::new(limit_price.finish()),
        Arc::new(final_state.finish()),
        Arc::new(created_at.finish()),
        Arc::new(terminal_at.finish()),
    ];
    RecordBatch::try_new(orders_schema(), columns).map_err(AnalyticsError::from)
}

fn fills_batch(rows: &[Fill]) -> AnalyticsResult<RecordBatch> {
    let mut fill_id = StringBuilder::new();
    let mut order_id = StringBuilder::new();
    let mut qty = Decimal128Builder::new().with_data_type(decimal_type());
    let mut price = Decimal128Builder::new().with_data_type(decimal_type());
    let mut fees = Decimal128Builder::new().with_data_type(decimal_type());
    let mut ts = Int64Builder::new();
    for fill in rows {
        fill_id.append_value(&fill.fill_id);
        order_id.append_value(&fill.order_id);
        qty.append_value(decimal_to_i128(fill.qty)?);
        price.append_value(decimal_to_i128(fill.price)?);
        fees.append_value(decimal_to_i128(fill.fees)?);
        ts.append_value(nanos(fill.ts));
    }
    let columns: Vec<ArrayRef> = vec![
        Arc::new(fill_id.finish()),
        Arc::new(order_id.finish()),
        Arc::new(qty.finish()),
        Arc::new(price.finish()),
        Arc::new(fees.finish()),
        Arc::new(ts.finish()),
    ];
    RecordBatch::try_new(fills_schema(), columns).map_err(AnalyticsError::from)
}

fn positions_batch(rows: &[PositionRow]) -> AnalyticsResult<RecordBatch> {
    let mut ts = Int64Builder::new();
    let mut symbol = StringBuilder::new();
    let mut net_qty = Decimal128Builder::new().with_data_type(decimal_type());
    let mut avg_cost = Decimal128Builder::new().with_data_type(decimal_type());
    let mut unrealized = Decimal128Builder::new().with_data_type(decimal_type());
    for row in rows {
        ts.append_value(nanos(row.ts));
        symbol.append_value(&row.symbol);
        net_qty.append_value(decimal_to_i128(row.net_qty)?);
        avg_cost.append_value(decimal_to_i128(row.avg_cost)?);
        unrealized.append_value(decimal_to_i128(row.unrealized_pnl)?);
    }
    let columns: Vec<ArrayRef> = vec![
        Arc::new(ts.finish()),
        Arc::new(symbol.finish()),
        Arc::new(net_qty.finish()),
        Arc::new(avg_cost.finish()),
        Arc::new(unrealized.finish()),
    ];
    RecordBatch::try_new(positions_schema(), columns).map_err(AnalyticsError::from)
}

fn performance_batch(rows: &[PerformanceRow]) -> AnalyticsResult<RecordBatch> {
    let mut ts = Int64Builder::new();
    let mut equity = Decimal128Builder::new().with_data_type(decimal_type());
    let mut cash = Decimal128Builder::new().with_data_type(decimal_type());
    let mut positions_value = Decimal128Builder::new().with_data_type(decimal_type());
    for row in rows {
        ts.append_value(nanos(row.ts));
        equity.append_value(decimal_to_i128(row.equity)?);
        cash.append_value(decimal_to_i128(row.cash)?);
        positions_value.append_value(decimal_to_i128(row.positions_value)?);
    }
    let columns: Vec<ArrayRef> = vec![
        Arc::new(ts.finish()),
        Arc::new(equity.finish()),
        Arc::new(cash.finish()),
        Arc::new(positions_value.finish()),
    ];
    RecordBatch::try_new(performance_schema(), columns).map_err(AnalyticsError::from)
}
