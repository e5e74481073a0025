//! Read paths over the analytical tables.

use std::fs::File;
use std::path::{Path, PathBuf};

use arrow::array::{Decimal128Array, Int64Array, StringArray};
use chrono::{DateTime, Utc};
use gantry_core::{Bar, DataTier, EquityPoint};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

use crate::schema::decimal_from_i128;
use crate::{AnalyticsError, AnalyticsResult};

fn partition_files(root: &Path, table: &str) -> AnalyticsResult<Vec<PathBuf>> {
    let pattern = root.join(table).join("date=*").join("*.parquet");
    let mut files: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
        .ok()
        .into_iter()
        .flatten()
        .flatten()
        .collect();
    files.sort();
    if files.is_empty() {
        return Err(AnalyticsError::MissingTable(root.join(table)));
    }
    Ok(files)
}

fn ts_from_nanos(nanos: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(nanos)
}

/// Load bars for a symbol across all partitions, in timestamp order.
///
/// Universe-tier rows anywhere in the requested symbol's range invalidate
/// the whole load: backtests must never run on screening-quality data.
pub fn load_bars(root: impl AsRef<Path>, symbol: &str) -> AnalyticsResult<Vec<Bar>> {
    let mut bars = Vec::new();
    let mut universe_rows = 0usize;

    for path in partition_files(root.as_ref(), "bars")? {
        let file = File::open(&path)?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
        for batch in reader {
            let batch = batch?;
            let symbols = column::<StringArray>(&batch, 0)?;
            let ts = column::<Int64Array>(&batch, 1)?;
            let open = column::<Decimal128Array>(&batch, 2)?;
            let high = column::<Decimal128Array>(&batch, 3)?;
            let low = column::<Decimal128Array>(&batch, 4)?;
            let close = column::<Decimal128Array>(&batch, 5)?;
            let volume = column::<Decimal128Array>(&batch, 6)?;
            let tier = column::<StringArray>(&batch, 7)?;

            for row in 0..batch.num_rows() {
                if symbols.value(row) != symbol {
                    continue;
                }
                let row_tier = match tier.value(row) {
                    "consolidated" => DataTier::Consolidated,
                    "delayed" => DataTier::Delayed,
                    _ => DataTier::Universe,
                };
                if row_tier == DataTier::Universe {
                    universe_rows += 1;
                    continue;
                }
                bars.push(Bar {
                    symbol: symbol.to_string(),
                    ts: ts_from_nanos(ts.value(row)),
                    open: decimal_from_i128(open.value(row)),
                    high: decimal_from_i128(high.value(row)),
                    low: decimal_from_i128(low.value(row)),
                    close: decimal_from_i128(close.value(row)),
                    volume: decimal_from_i128(volume.value(row)),
                    tier: row_tier,
                });
            }
        }
    }

    if universe_rows > 0 {
        return Err(AnalyticsError::UniverseTierInBacktest {
            count: universe_rows,
        });
    }
    bars.sort_by_key(|bar| bar.ts);
    Ok(bars)
}

/// Load the equity curve across all partitions, in timestamp order.
pub fn load_performance(root: impl AsRef<Path>) -> AnalyticsResult<Vec<EquityPoint>> {
    let mut points = Vec::new();
    for path in partition_files(root.as_ref(), "performance")? {
        let file = File::open(&path)?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
        for batch in reader {
            let batch = batch?;
            let ts = column::<Int64Array>(&batch, 0)?;
            let equity = column::<Decimal128Array>(&batch, 1)?;
            let cash = column::<Decimal128Array>(&batch, 2)?;
            let positions_value = column::<Decimal128Array>(&batch, 3)?;
            for row in 0..batch.num_rows() {
                points.push(EquityPoint {
                    ts: ts_from_nanos(ts.value(row)),
                    equity: decimal_from_i128(equity.value(row)),
                    cash: decimal_from_i128(cash.value(row)),
                    positions_value: decimal_from_i128(positions_value.value(row)),
                });
            }
        }
    }
    points.sort_by_key(|point| point.ts);
    Ok(points)
}

fn column<'a, T: 'static>(
    batch: &'a arrow::record_batch::RecordBatch,
    index: usize,
) -> AnalyticsResult<&'a T> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| {
            AnalyticsError::Decode(format!("column {index} has an unexpected arrow type"))
        })
}
