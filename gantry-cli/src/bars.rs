//! Bar sources driving the decision loop.
//!
//! Real ingestion adapters live outside this repository; the trading
//! process only needs something that yields [`Bar`]s. The replay source
//! feeds a recorded JSONL file (one bar per line) at a configurable pace,
//! which is also how the demo and the end-to-end tests drive the loop.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use gantry_core::Bar;
use tracing::info;

#[async_trait]
pub trait BarSource: Send {
    /// The next bar, or `None` when the source is exhausted.
    async fn next_bar(&mut self) -> Option<Bar>;
}

/// Replays bars from a JSONL file.
pub struct ReplayBarSource {
    bars: std::vec::IntoIter<Bar>,
    pace: Option<Duration>,
}

impl ReplayBarSource {
    pub fn open(path: &Path, pace: Option<Duration>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read bar file {}", path.display()))?;
        let mut bars = Vec::new();
        for (idx, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let bar: Bar = serde_json::from_str(line)
                .with_context(|| format!("invalid bar on line {}", idx + 1))?;
            bars.push(bar);
        }
        info!(path = %path.display(), count = bars.len(), "bar replay loaded");
        Ok(Self {
            bars: bars.into_iter(),
            pace,
        })
    }
}

#[async_trait]
impl BarSource for ReplayBarSource {
    async fn next_bar(&mut self) -> Option<Bar> {
        let bar = self.bars.next()?;
        if let Some(pace) = self.pace {
            tokio::time::sleep(pace).await;
        }
        Some(bar)
    }
}

/// A source that never yields; the process idles on timers and broker
/// events only (useful when an external feeder owns ingestion).
pub struct IdleBarSource;

#[async_trait]
impl BarSource for IdleBarSource {
    async fn next_bar(&mut self) -> Option<Bar> {
        futures::future::pending::<()>().await;
        None
    }
}
