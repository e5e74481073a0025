//! Background monitors owned by the trading process.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use gantry_core::RecordKind;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::{EngineUpdate, OrderEngine};

/// Moves orders with no broker event inside the ack window to `UNKNOWN`.
pub fn spawn_ack_monitor(
    engine: Arc<OrderEngine>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(500));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for client_order_id in engine.overdue_acks() {
                        if let Err(err) = engine.mark_unconfirmed(&client_order_id).await {
                            error!(
                                client_order_id = %client_order_id,
                                error = %err,
                                "failed to mark order unconfirmed"
                            );
                        }
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

/// Escalates orders stuck in a broker-visible state past the zombie
/// threshold. Escalation is an event, not an action: the journal entry is
/// visible to the supervisor, which holds the cancel authority.
pub fn spawn_zombie_monitor(
    engine: Arc<OrderEngine>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        let mut escalated: HashSet<String> = HashSet::new();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for order in engine.zombies().await {
                        if !escalated.insert(order.order_id.clone()) {
                            continue;
                        }
                        warn!(
                            order_id = %order.order_id,
                            state = %order.state,
                            age_secs = (chrono::Utc::now() - order.updated_at).num_seconds(),
                            "zombie order escalated"
                        );
                        let record = engine.journal().record(
                            RecordKind::Metric,
                            json!({
                                "name": "zombie_order",
                                "order_id": order.order_id,
                                "client_order_id": order.client_order_id,
                                "state": order.state,
                                "updated_at": order.updated_at,
                            }),
                        );
                        if let Err(err) = record {
                            error!(error = %err, "failed to journal zombie escalation");
                        }
                        engine.emit(EngineUpdate::Alarm {
                            code: "zombie_order",
                            message: format!(
                                "order {} stuck in {} past zombie threshold",
                                order.order_id, order.state
                            ),
                        });
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
