//! Broker reconciliation.
//!
//! Resolves `UNKNOWN` orders and divergent positions by treating the broker
//! as the source of truth. Reconciliation only reads from the broker and
//! writes to local substrates: any number of passes leaves the broker's
//! side-effect count unchanged.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use gantry_broker::BrokerClient;
use gantry_core::{OrderState, Position, RecordKind};
use gantry_state::StateCache;
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::{EngineError, EngineResult, EngineUpdate, OrderEngine};

/// Outcome of one reconciliation pass.
#[derive(Clone, Debug, Default)]
pub struct ReconcileReport {
    pub orders_checked: usize,
    pub orders_resolved: usize,
    pub orders_failed: usize,
    pub position_divergences: Vec<String>,
}

pub struct Reconciler {
    engine: Arc<OrderEngine>,
    broker: Arc<dyn BrokerClient>,
    /// How long an `UNKNOWN` order may stay "not found" at the broker
    /// before it is declared `FAILED`.
    not_found_grace: Duration,
}

impl Reconciler {
    pub fn new(
        engine: Arc<OrderEngine>,
        broker: Arc<dyn BrokerClient>,
        not_found_grace: Duration,
    ) -> Self {
        Self {
            engine,
            broker,
            not_found_grace,
        }
    }

    /// Resolve a single order against broker truth.
    pub async fn reconcile_order(&self, client_order_id: &str) -> EngineResult<bool> {
        match self.broker.get_order_by_client_id(client_order_id).await {
            Ok(Some(broker_order)) => {
                info!(
                    client_order_id,
                    status = ?broker_order.status,
                    filled = %broker_order.filled_qty,
                    "order found at broker; syncing state"
                );
                self.engine
                    .apply_reconciled(client_order_id, &broker_order)
                    .await?;
                Ok(true)
            }
            Ok(None) => {
                let order = self.engine.order(client_order_id).await?;
                if order.state != OrderState::Unknown {
                    return Ok(false);
                }
                let grace = chrono::Duration::from_std(self.not_found_grace)
                    .unwrap_or_else(|_| chrono::Duration::seconds(60));
                if Utc::now() - order.updated_at > grace {
                    // Safe terminal: the broker has no record, so there is
                    // nothing to duplicate by declaring the order dead.
                    self.engine
                        .fail_unresolved(client_order_id, "broker has no record of order")
                        .await?;
                    Ok(true)
                } else {
                    info!(client_order_id, "order not at broker yet; within grace");
                    Ok(false)
                }
            }
            Err(err) if err.is_retriable() => {
                warn!(client_order_id, error = %err, "broker query failed; will retry next sweep");
                Ok(false)
            }
            Err(err) => Err(EngineError::Broker(err)),
        }
    }

    /// Diff local positions against broker positions; broker wins.
    pub async fn reconcile_positions(&self) -> EngineResult<Vec<String>> {
        let broker_positions = self.broker.positions().await?;
        let cache: &StateCache = self.engine.cache();
        let local_positions = cache.positions()?;

        let mut divergences = Vec::new();
        let mut symbols: Vec<String> = broker_positions
            .iter()
            .map(|p| p.symbol.clone())
            .chain(local_positions.iter().map(|p| p.symbol.clone()))
            .collect();
        symbols.sort();
        symbols.dedup();

        let now = Utc::now();
        for symbol in symbols {
            let remote = broker_positions.iter().find(|p| p.symbol == symbol);
            let local = local_positions.iter().find(|p| p.symbol == symbol);
            let remote_qty = remote.map(|p| p.net_qty).unwrap_or(Decimal::ZERO);
            let local_qty = local.map(|p| p.net_qty).unwrap_or(Decimal::ZERO);
            if remote_qty == local_qty {
                continue;
            }

            warn!(
                symbol = %symbol,
                local = %local_qty,
                remote = %remote_qty,
                "position divergence; broker is authoritative"
            );
            let reconciled = Position {
                symbol: symbol.clone(),
                net_qty: remote_qty,
                avg_cost: remote.map(|p| p.avg_entry_price).unwrap_or(Decimal::ZERO),
                realized_pnl: local.map(|p| p.realized_pnl).unwrap_or(Decimal::ZERO),
                unrealized_pnl: remote.map(|p| p.unrealized_pnl).unwrap_or(Decimal::ZERO),
                updated_at: now,
                version: local.map(|p| p.version + 1).unwrap_or(1),
            };
            self.engine.journal().record(
                RecordKind::PositionReconciled,
                json!({
                    "symbol": symbol,
                    "local_qty": local_qty,
                    "remote_qty": remote_qty,
                    "avg_cost": reconciled.avg_cost,
                }),
            )?;
            cache.set_position(&reconciled)?;
            self.engine.emit(EngineUpdate::Position(reconciled));
            self.engine.emit(EngineUpdate::Alarm {
                code: "position_divergence",
                message: format!("{symbol}: local {local_qty} vs broker {remote_qty}"),
            });
            divergences.push(symbol);
        }

        if !divergences.is_empty() {
            // The in-process ledger follows the cache so sizing and equity
            // work from broker truth too.
            let restored: Vec<Position> = cache.positions()?;
            self.engine.portfolio().lock().restore_positions(restored);
        }
        Ok(divergences)
    }

    /// Full pass: every `UNKNOWN` order, then positions.
    pub async fn sweep(&self) -> EngineResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        for (client_order_id, _) in self.engine.unknown_orders().await {
            report.orders_checked += 1;
            match self.reconcile_order(&client_order_id).await {
                Ok(true) => report.orders_resolved += 1,
                Ok(false) => {}
                Err(err) => {
                    report.orders_failed += 1;
                    error!(client_order_id = %client_order_id, error = %err, "order reconciliation failed");
                }
            }
        }
        report.position_divergences = self.reconcile_positions().await?;
        if report.orders_checked > 0 || !report.position_divergences.is_empty() {
            info!(
                checked = report.orders_checked,
                resolved = report.orders_resolved,
                divergences = report.position_divergences.len(),
                "reconciliation sweep complete"
            );
        }
        Ok(report)
    }
}

/// Periodic sweep plus on-demand requests from the engine's monitors.
pub fn spawn_reconciler(
    reconciler: Arc<Reconciler>,
    interval: Duration,
    mut on_demand: mpsc::UnboundedReceiver<String>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = reconciler.sweep().await {
                        error!(error = %err, "periodic reconciliation sweep failed");
                    }
                }
                requested = on_demand.recv() => {
                    match requested {
                        Some(client_order_id) => {
                            if let Err(err) = reconciler.reconcile_order(&client_order_id).await {
                                error!(
                                    client_order_id = %client_order_id,
                                    error = %err,
                                    "on-demand reconciliation failed"
                                );
                            }
                        }
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
