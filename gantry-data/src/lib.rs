//! Analytical store derived from the event journal.
//!
//! An ETL pass replays the journal into columnar Parquet tables (`bars`,
//! `orders`, `fills`, `positions`, `performance`), partitioned by UTC date.
//! Partition files are deterministic functions of the journal contents, so
//! re-running the ETL over the same range rewrites identical bytes and is
//! effectively a no-op. Backtest loaders reject universe-tier bars
//! outright.

use std::path::PathBuf;

use thiserror::Error;

pub mod etl;
pub mod load;
pub mod schema;

pub use etl::{EtlSummary, Pipeline};
pub use load::{load_bars, load_performance};

pub type AnalyticsResult<T> = Result<T, AnalyticsError>;

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("analytics I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("journal replay failed: {0}")]
    Journal(#[from] gantry_journal::JournalError),
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("row could not be encoded: {0}")]
    Encode(String),
    #[error("row could not be decoded: {0}")]
    Decode(String),
    #[error("no analytical data under {0}")]
    MissingTable(PathBuf),
    /// Universe-tier rows are never valid backtest input; the load path
    /// rejects them instead of silently filtering.
    #[error("{count} universe-tier bars in requested range; backtest input is invalid")]
    UniverseTierInBacktest { count: usize },
}
