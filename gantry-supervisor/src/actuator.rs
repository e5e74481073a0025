//! Shutdown actuator: the supervisor's only write path.
//!
//! Sequence: raise the halt flag, cancel all open orders, flatten
//! positions under supervisor-issued idempotency keys, then terminate the
//! trading process (cooperative first, forced after the grace window).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use gantry_broker::{BrokerClient, PlaceOrderRequest};
use gantry_core::{intent_client_order_id, HaltFlag, OrderType, RecordKind, Side};
use gantry_journal::Journal;
use gantry_state::StateCache;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{SupervisorError, SupervisorResult};

/// Namespace for supervisor-issued client order ids.
const FLATTEN_STRATEGY_ID: &str = "supervisor-flatten";

/// Termination bookkeeping: after this many forced kills, or inside the
/// cooldown, the actuator refuses to kill again and escalates to a human.
const MAX_TERMINATION_ATTEMPTS: u32 = 3;
const TERMINATION_COOLDOWN: Duration = Duration::from_secs(300);

pub struct ShutdownActuator {
    broker: Arc<dyn BrokerClient>,
    cache: StateCache,
    journal: Journal,
    pid_file: PathBuf,
    grace: Duration,
    attempts: parking_lot::Mutex<TerminationLog>,
}

#[derive(Default)]
struct TerminationLog {
    attempts: u32,
    last: Option<std::time::Instant>,
}

/// What the actuator accomplished; surfaced in alerts and tests.
#[derive(Clone, Debug, Default)]
pub struct ShutdownOutcome {
    pub halted: bool,
    pub cancelled_orders: usize,
    pub flatten_orders: usize,
    pub terminated: bool,
}

impl ShutdownActuator {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        cache: StateCache,
        journal: Journal,
        pid_file: PathBuf,
        grace: Duration,
    ) -> Self {
        Self {
            broker,
            cache,
            journal,
            pid_file,
            grace,
            attempts: parking_lot::Mutex::new(TerminationLog::default()),
        }
    }

    /// Raise the halt flag (idempotent) and journal it.
    pub fn raise_halt(&self, reason: &str) -> SupervisorResult<()> {
        let current = self.cache.halt()?;
        if current.active {
            return Ok(());
        }
        let halt = HaltFlag::raised(reason, "supervisor");
        self.journal.record(
            RecordKind::Halt,
            json!({ "reason": reason, "set_by": "supervisor" }),
        )?;
        self.cache.set_halt(&halt)?;
        info!(reason, "halt flag raised");
        Ok(())
    }

    /// Full emergency shutdown: halt, cancel all, flatten, terminate.
    pub async fn emergency_shutdown(&self, reason: &str) -> SupervisorResult<ShutdownOutcome> {
        error!(reason, "EMERGENCY SHUTDOWN");
        let mut outcome = ShutdownOutcome::default();

        self.raise_halt(reason)?;
        outcome.halted = true;

        match self.broker.cancel_all().await {
            Ok(cancelled) => {
                outcome.cancelled_orders = cancelled;
                info!(cancelled, "open orders cancelled");
            }
            Err(err) => error!(error = %err, "cancel_all failed; continuing to flatten"),
        }

        outcome.flatten_orders = self.flatten_all().await?;
        outcome.terminated = self.terminate_trading_process().await;
        Ok(outcome)
    }

    /// Flatten every open position with market orders.
    pub async fn flatten_all(&self) -> SupervisorResult<usize> {
        let positions = self.broker.positions().await?;
        let mut placed = 0;
        for position in positions {
            if position.net_qty.is_zero() {
                continue;
            }
            if self.flatten_symbol_qty(&position.symbol, position.net_qty).await? {
                placed += 1;
            }
        }
        Ok(placed)
    }

    /// Flatten one symbol's exposure.
    pub async fn flatten_symbol(&self, symbol: &str) -> SupervisorResult<bool> {
        let positions = self.broker.positions().await?;
        let Some(position) = positions.iter().find(|p| p.symbol == symbol) else {
            return Ok(false);
        };
        self.flatten_symbol_qty(symbol, position.net_qty).await
    }

    async fn flatten_symbol_qty(
        &self,
        symbol: &str,
        net_qty: Decimal,
    ) -> SupervisorResult<bool> {
        if net_qty.is_zero() {
            return Ok(false);
        }
        let side = if net_qty > Decimal::ZERO {
            Side::Sell
        } else {
            Side::Buy
        };
        let qty = net_qty.abs();
        // Deterministic per (symbol, qty, minute bucket): a retried flatten
        // lands on the same broker order.
        let client_order_id = intent_client_order_id(
            FLATTEN_STRATEGY_ID,
            &Uuid::nil(),
            symbol,
            side,
            qty,
            Utc::now(),
        );
        let request = PlaceOrderRequest {
            client_order_id,
            symbol: symbol.to_string(),
            side,
            qty,
            order_type: OrderType::Market,
            limit_price: None,
        };
        match self.broker.place(request).await {
            Ok(ack) => {
                info!(symbol, qty = %qty, order_id = %ack.order_id, "flatten order placed");
                Ok(true)
            }
            Err(err) => {
                error!(symbol, error = %err, "flatten order failed");
                Err(SupervisorError::Broker(err))
            }
        }
    }

    /// Cancel specific orders through direct broker access.
    pub async fn cancel_orders(&self, order_ids: &[String]) -> usize {
        let mut cancelled = 0;
        for order_id in order_ids {
            match self.broker.cancel(order_id).await {
                Ok(()) => cancelled += 1,
                Err(err) => warn!(order_id = %order_id, error = %err, "zombie cancel failed"),
            }
        }
        cancelled
    }

    /// SIGTERM the trading process; SIGKILL after the grace window. The
    /// halt flag is already set, so a cooperative trader drains and exits
    /// on its own.
    pub async fn terminate_trading_process(&self) -> bool {
        {
            let mut log = self.attempts.lock();
            if let Some(last) = log.last {
                if last.elapsed() < TERMINATION_COOLDOWN {
                    warn!("termination cooldown active; refusing to kill again");
                    return false;
                }
            }
            if log.attempts >= MAX_TERMINATION_ATTEMPTS {
                error!(
                    attempts = log.attempts,
                    "max termination attempts exceeded; human intervention required"
                );
                return false;
            }
            log.attempts += 1;
            log.last = Some(std::time::Instant::now());
        }

        let Some(pid) = self.read_trading_pid() else {
            warn!(pid_file = %self.pid_file.display(), "no trading pid file; nothing to terminate");
            return false;
        };
        let pid = Pid::from_raw(pid);

        info!(%pid, "sending SIGTERM to trading process");
        if let Err(err) = kill(pid, Signal::SIGTERM) {
            // ESRCH means it is already gone.
            info!(%pid, error = %err, "SIGTERM not delivered");
            return false;
        }

        let deadline = std::time::Instant::now() + self.grace;
        while std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(250)).await;
            if kill(pid, None::<Signal>).is_err() {
                info!(%pid, "trading process exited within grace window");
                return true;
            }
        }

        warn!(%pid, "grace window elapsed; sending SIGKILL");
        if let Err(err) = kill(pid, Signal::SIGKILL) {
            info!(%pid, error = %err, "SIGKILL not delivered");
        }
        true
    }

    fn read_trading_pid(&self) -> Option<i32> {
        let raw = std::fs::read_to_string(&self.pid_file).ok()?;
        raw.trim().parse().ok()
    }
}
