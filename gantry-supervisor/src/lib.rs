//! The independent supervisor.
//!
//! Runs as its own process with its own broker credentials. Reads live
//! state and broker truth, evaluates the kill rules every cycle, and holds
//! unilateral authority to cancel orders, flatten the book, and terminate
//! the trading process. It never shares in-process state with the trader
//! and never reads strategy logic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use gantry_broker::{BrokerClient, BrokerError};
use gantry_core::{Heartbeat, ProcessRole, RecordKind};
use gantry_journal::{Journal, JournalError};
use gantry_state::{StateCache, StateError};
use rust_decimal::Decimal;
use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

mod actuator;
mod rules;

pub use actuator::{ShutdownActuator, ShutdownOutcome};
pub use rules::{Breach, KillAction, KillRules, RuleInputs, WarningThresholds};

pub type SupervisorResult<T> = Result<T, SupervisorError>;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Journal(#[from] JournalError),
}

/// Where supervisor alerts go; the binary wires a webhook dispatcher in.
#[async_trait]
pub trait Alerter: Send + Sync {
    async fn notify(&self, title: &str, message: &str);
}

/// No-op sink for tests.
pub struct NullAlerter;

#[async_trait]
impl Alerter for NullAlerter {
    async fn notify(&self, _title: &str, _message: &str) {}
}

/// Broker probes slower than this defer rule evaluation for the cycle.
const MAX_API_LATENCY: Duration = Duration::from_secs(5);

pub struct SupervisorSettings {
    pub check_interval: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
        }
    }
}

pub struct Supervisor {
    broker: Arc<dyn BrokerClient>,
    cache: StateCache,
    journal: Journal,
    actuator: ShutdownActuator,
    alerter: Arc<dyn Alerter>,
    settings: SupervisorSettings,
    peak_equity: Option<Decimal>,
    /// Broker order ids and when this process first observed them; feeds
    /// the order-rate rule.
    first_seen_orders: HashMap<String, Instant>,
    heartbeat_seq: u64,
    permanent_shutdown: bool,
}

impl Supervisor {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        cache: StateCache,
        journal: Journal,
        actuator: ShutdownActuator,
        alerter: Arc<dyn Alerter>,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            broker,
            cache,
            journal,
            actuator,
            alerter,
            settings,
            peak_equity: None,
            first_seen_orders: HashMap::new(),
            heartbeat_seq: 0,
            permanent_shutdown: false,
        }
    }

    /// Main loop. Runs until shutdown is signalled.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> SupervisorResult<()> {
        info!(
            interval_secs = self.settings.check_interval.as_secs(),
            "supervisor started"
        );
        let mut ticker = tokio::time::interval(self.settings.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.permanent_shutdown {
                        warn!("permanent shutdown active; refusing to monitor further");
                        continue;
                    }
                    if let Err(err) = self.check_cycle().await {
                        error!(error = %err, "supervisor cycle failed");
                        self.alerter
                            .notify("Supervisor cycle error", &err.to_string())
                            .await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("supervisor stopping");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// One evaluation cycle. Public for tests.
    pub async fn check_cycle(&mut self) -> SupervisorResult<Option<Breach>> {
        self.publish_heartbeat()?;

        // Health gate: never kill on stale or slow broker data.
        let probe_started = Instant::now();
        if let Err(err) = self.broker.clock().await {
            warn!(error = %err, "broker probe failed; deferring rule evaluation");
            return Ok(None);
        }
        if probe_started.elapsed() > MAX_API_LATENCY {
            warn!(
                latency_ms = probe_started.elapsed().as_millis() as u64,
                "broker latency above threshold; deferring rule evaluation"
            );
            return Ok(None);
        }

        let inputs = self.gather_inputs().await?;
        for warning in WarningThresholds::evaluate(&inputs) {
            warn!(%warning, "kill-rule warning");
            self.alerter.notify("Kill-rule warning", &warning).await;
        }

        let Some(breach) = KillRules::evaluate(&inputs) else {
            return Ok(None);
        };
        error!(rule = breach.rule, reason = %breach.reason, "kill rule breached");
        self.journal.record(
            RecordKind::Metric,
            json!({
                "name": "kill_rule_breach",
                "rule": breach.rule,
                "reason": breach.reason,
            }),
        )?;
        self.alerter.notify("Kill rule breached", &breach.reason).await;
        self.act(&breach).await?;
        Ok(Some(breach))
    }

    async fn act(&mut self, breach: &Breach) -> SupervisorResult<()> {
        match &breach.action {
            KillAction::FlattenAndHalt => {
                self.actuator.emergency_shutdown(&breach.reason).await?;
            }
            KillAction::HardHalt => {
                self.actuator.emergency_shutdown(&breach.reason).await?;
                self.permanent_shutdown = true;
                self.alerter
                    .notify(
                        "PERMANENT SHUTDOWN",
                        "Hard halt engaged. Human intervention required to resume trading.",
                    )
                    .await;
            }
            KillAction::FlattenSymbol(symbol) => {
                self.actuator.flatten_symbol(symbol).await?;
            }
            KillAction::CancelOrders(order_ids) => {
                let cancelled = self.actuator.cancel_orders(order_ids).await;
                info!(cancelled, "zombie orders cancelled");
            }
            KillAction::FlattenPositions => {
                let placed = self.actuator.flatten_all().await?;
                info!(placed, "end-of-week flatten complete");
            }
        }
        Ok(())
    }

    async fn gather_inputs(&mut self) -> SupervisorResult<RuleInputs> {
        let account = self.broker.account().await?;
        let positions = self.broker.positions().await?;
        let open_orders = self.broker.list_open_orders().await?;
        let now = Instant::now();

        let daily_pnl_pct = if account.last_equity > Decimal::ZERO {
            (account.equity - account.last_equity) / account.last_equity
        } else {
            Decimal::ZERO
        };

        let peak = self.peak_equity.get_or_insert(account.equity);
        if account.equity > *peak {
            *peak = account.equity;
        }
        let drawdown_pct = if *peak > Decimal::ZERO {
            ((*peak - account.equity) / *peak).max(Decimal::ZERO)
        } else {
            Decimal::ZERO
        };

        let mut largest_position_pct = Decimal::ZERO;
        let mut largest_position_symbol = None;
        if account.equity > Decimal::ZERO {
            for position in &positions {
                let pct = position.market_value.abs() / account.equity;
                if pct > largest_position_pct {
                    largest_position_pct = pct;
                    largest_position_symbol = Some(position.symbol.clone());
                }
            }
        }

        // Track first-seen times for the order-rate rule and zombie ages.
        let zombie_cutoff = chrono::Duration::seconds(300);
        let mut zombie_order_ids = Vec::new();
        for order in &open_orders {
            self.first_seen_orders
                .entry(order.order_id.clone())
                .or_insert(now);
            if Utc::now() - order.created_at > zombie_cutoff {
                zombie_order_ids.push(order.order_id.clone());
            }
        }
        let live: std::collections::HashSet<String> =
            open_orders.iter().map(|o| o.order_id.clone()).collect();
        let orders_last_minute = self
            .first_seen_orders
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) <= Duration::from_secs(60))
            .count();
        self.first_seen_orders.retain(|order_id, seen| {
            live.contains(order_id) || now.duration_since(*seen) <= Duration::from_secs(120)
        });

        let heartbeat_age_secs = self
            .cache
            .heartbeat(ProcessRole::Trading)?
            .map(|hb| (Utc::now() - hb.ts).num_seconds());

        Ok(RuleInputs {
            daily_pnl_pct,
            drawdown_pct,
            largest_position_pct,
            largest_position_symbol,
            open_orders_count: open_orders.len(),
            orders_last_minute,
            zombie_order_ids,
            heartbeat_age_secs,
            now: Some(Utc::now()),
        })
    }

    fn publish_heartbeat(&mut self) -> SupervisorResult<()> {
        self.heartbeat_seq += 1;
        self.cache.set_heartbeat(&Heartbeat {
            process_id: std::process::id(),
            role: ProcessRole::Supervisor,
            ts: Utc::now(),
            seq: self.heartbeat_seq,
        })?;
        Ok(())
    }
}
