//! The order lifecycle engine.
//!
//! Translates risk-approved intents into broker orders and tracks them to a
//! terminal state. Each order is serialized under its own lock keyed by
//! `client_order_id`; the journal is written before the live cache on every
//! transition, and broadcasts happen last.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use gantry_broker::{BrokerClient, BrokerError, PlaceOrderRequest};
use gantry_core::{
    BrokerEvent, BrokerEventKind, BrokerOrder, ClientOrderId, EquityPoint, Fill, Intent, Order,
    OrderId, OrderIdGenerator, OrderState, OrderType, Position, RecordKind,
};
use gantry_journal::Journal;
use gantry_portfolio::Portfolio;
use gantry_state::StateCache;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};

use crate::{EngineError, EngineResult, RetryPolicy};

/// Timeouts governing ack and zombie handling.
#[derive(Clone, Copy, Debug)]
pub struct EngineTimeouts {
    /// No broker event within this window after placement puts the order in
    /// `UNKNOWN` and hands it to the reconciler.
    pub t_ack: Duration,
    /// Orders working at the broker longer than this are escalated.
    pub t_zombie: Duration,
}

impl Default for EngineTimeouts {
    fn default() -> Self {
        Self {
            t_ack: Duration::from_secs(3),
            t_zombie: Duration::from_secs(300),
        }
    }
}

/// Reference to a tracked order returned by [`OrderEngine::submit`].
#[derive(Clone, Debug)]
pub struct OrderHandle {
    pub order_id: OrderId,
    pub client_order_id: ClientOrderId,
    pub state: OrderState,
}

/// Consistent read of engine state for the broadcast bus.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub ts: DateTime<Utc>,
    pub orders: Vec<Order>,
    pub positions: Vec<Position>,
    pub equity: EquityPoint,
}

/// Push notifications emitted after every committed change.
#[derive(Clone, Debug)]
pub enum EngineUpdate {
    Order(Order),
    Fill { order: Order, fill: Fill },
    Position(Position),
    Equity(EquityPoint),
    Alarm { code: &'static str, message: String },
}

type OrderSlot = Arc<AsyncMutex<Order>>;

pub struct OrderEngine {
    broker: Arc<dyn BrokerClient>,
    journal: Journal,
    cache: StateCache,
    portfolio: Arc<Mutex<Portfolio>>,
    ids: OrderIdGenerator,
    timeouts: EngineTimeouts,
    retry: RetryPolicy,
    orders: Mutex<HashMap<ClientOrderId, OrderSlot>>,
    order_index: Mutex<HashMap<OrderId, ClientOrderId>>,
    seen_fills: Mutex<HashSet<String>>,
    /// Orders placed but not yet confirmed by a stream event.
    awaiting_event: Mutex<HashMap<ClientOrderId, Instant>>,
    updates: broadcast::Sender<EngineUpdate>,
    reconcile_tx: mpsc::UnboundedSender<ClientOrderId>,
    reconcile_rx: Mutex<Option<mpsc::UnboundedReceiver<ClientOrderId>>>,
}

impl OrderEngine {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        journal: Journal,
        cache: StateCache,
        portfolio: Arc<Mutex<Portfolio>>,
        timeouts: EngineTimeouts,
        retry: RetryPolicy,
    ) -> Arc<Self> {
        let (updates, _) = broadcast::channel(2048);
        let (reconcile_tx, reconcile_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            broker,
            journal,
            cache,
            portfolio,
            ids: OrderIdGenerator::new(),
            timeouts,
            retry,
            orders: Mutex::new(HashMap::new()),
            order_index: Mutex::new(HashMap::new()),
            seen_fills: Mutex::new(HashSet::new()),
            awaiting_event: Mutex::new(HashMap::new()),
            updates,
            reconcile_tx,
            reconcile_rx: Mutex::new(Some(reconcile_rx)),
        })
    }

    /// Subscribe to committed state changes (used by the broadcast bus).
    pub fn subscribe(&self) -> broadcast::Receiver<EngineUpdate> {
        self.updates.subscribe()
    }

    /// Receiver of on-demand reconciliation requests. Taken once by the
    /// reconciler task.
    pub fn take_reconcile_requests(&self) -> Option<mpsc::UnboundedReceiver<ClientOrderId>> {
        self.reconcile_rx.lock().take()
    }

    #[must_use]
    pub fn timeouts(&self) -> EngineTimeouts {
        self.timeouts
    }

    /// Submit a trading intent.
    ///
    /// Idempotent: a second call deriving the same `client_order_id`
    /// returns the existing handle without touching the broker.
    pub async fn submit(&self, intent: &Intent) -> EngineResult<OrderHandle> {
        let halt = self.cache.halt()?;
        if halt.active {
            return Err(EngineError::HaltRequested(halt.reason));
        }
        if intent.qty <= Decimal::ZERO {
            return Err(EngineError::BadRequest(format!(
                "quantity must be positive, got {}",
                intent.qty
            )));
        }
        if intent.order_type == OrderType::Limit && intent.limit_price.is_none() {
            return Err(EngineError::BadRequest(
                "limit orders require limit_price".into(),
            ));
        }

        let client_order_id = intent.client_order_id();
        let (slot, created) = {
            let mut orders = self.orders.lock();
            match orders.get(&client_order_id) {
                Some(slot) => (slot.clone(), false),
                None => {
                    let now = Utc::now();
                    let order = Order {
                        order_id: self.ids.next_id(),
                        client_order_id: client_order_id.clone(),
                        symbol: intent.symbol.clone(),
                        side: intent.side,
                        qty: intent.qty,
                        order_type: intent.order_type,
                        limit_price: intent.limit_price,
                        state: OrderState::Pending,
                        filled_qty: Decimal::ZERO,
                        avg_fill_price: None,
                        created_at: now,
                        updated_at: now,
                        strategy_id: intent.strategy_id.clone(),
                        signal_id: intent.signal_id,
                        broker_ref: None,
                    };
                    let slot = Arc::new(AsyncMutex::new(order));
                    orders.insert(client_order_id.clone(), slot.clone());
                    (slot, true)
                }
            }
        };

        if !created {
            let order = slot.lock().await;
            debug!(
                client_order_id = %client_order_id,
                state = %order.state,
                "duplicate submit resolved to existing order"
            );
            return Ok(handle_of(&order));
        }

        {
            let order = slot.lock().await;
            self.order_index
                .lock()
                .insert(order.order_id.clone(), client_order_id.clone());
            self.journal.record(
                RecordKind::OrderCreated,
                serde_json::to_value(&*order).unwrap_or_default(),
            )?;
            self.cache.set_order(&order)?;
            let _ = self.updates.send(EngineUpdate::Order(order.clone()));
            info!(
                order_id = %order.order_id,
                client_order_id = %client_order_id,
                symbol = %order.symbol,
                qty = %order.qty,
                "order created"
            );
        }

        self.place_with_retry(&slot, intent).await
    }

    async fn place_with_retry(
        &self,
        slot: &OrderSlot,
        intent: &Intent,
    ) -> EngineResult<OrderHandle> {
        let client_order_id = intent.client_order_id();
        let request = PlaceOrderRequest {
            client_order_id: client_order_id.clone(),
            symbol: intent.symbol.clone(),
            side: intent.side,
            qty: intent.qty,
            order_type: intent.order_type,
            limit_price: intent.limit_price,
        };

        let mut attempt = 0u32;
        loop {
            match self.broker.place(request.clone()).await {
                Ok(ack) => {
                    let mut order = slot.lock().await;
                    if order.broker_ref.is_none() {
                        order.broker_ref = Some(ack.order_id.clone());
                    }
                    if order.state == OrderState::Pending {
                        self.transition_locked(&mut order, OrderState::Submitted, "broker ack")?;
                        self.awaiting_event
                            .lock()
                            .insert(client_order_id.clone(), Instant::now());
                    }
                    return Ok(handle_of(&order));
                }
                Err(err) if err.is_retriable() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    attempt += 1;
                    warn!(
                        client_order_id = %client_order_id,
                        attempt,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "placement failed; retrying under same idempotency key"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) if err.is_retriable() => {
                    // Retries exhausted on an ambiguous transport failure:
                    // the order may or may not exist at the broker. Never
                    // assume SUBMITTED without evidence; only the
                    // reconciler may decide.
                    let mut order = slot.lock().await;
                    if order.state == OrderState::Pending {
                        self.transition_locked(
                            &mut order,
                            OrderState::Unknown,
                            &format!("placement unresolved: {err}"),
                        )?;
                    }
                    let _ = self.reconcile_tx.send(client_order_id.clone());
                    warn!(
                        client_order_id = %client_order_id,
                        error = %err,
                        "placement unresolved after retries; order handed to reconciler"
                    );
                    return Ok(handle_of(&order));
                }
                Err(BrokerError::Rejected(reason)) => {
                    let mut order = slot.lock().await;
                    self.transition_locked(&mut order, OrderState::Rejected, &reason)?;
                    return Ok(handle_of(&order));
                }
                Err(err) => {
                    let mut order = slot.lock().await;
                    self.transition_locked(
                        &mut order,
                        OrderState::Failed,
                        &format!("placement failed: {err}"),
                    )?;
                    return Ok(handle_of(&order));
                }
            }
        }
    }

    /// Request cancellation. Accepts either the engine order id or the
    /// client order id.
    pub async fn cancel(&self, id: &str) -> EngineResult<()> {
        let slot = self.resolve(id)?;
        let broker_ref = {
            let mut order = slot.lock().await;
            match order.state {
                OrderState::Cancelling => return Ok(()),
                OrderState::Submitted | OrderState::PartialFill => {
                    self.transition_locked(&mut order, OrderState::Cancelling, "cancel requested")?;
                    order.broker_ref.clone()
                }
                state => {
                    return Err(EngineError::NotCancellable {
                        order_id: order.order_id.clone(),
                        state,
                    })
                }
            }
        };

        let Some(broker_ref) = broker_ref else {
            warn!(id, "cancelling order with no broker reference; reconciler will resolve");
            return Ok(());
        };
        let mut attempt = 0u32;
        loop {
            match self.broker.cancel(&broker_ref).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retriable() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    attempt += 1;
                    warn!(%broker_ref, error = %err, "cancel failed; retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    // Leave the order in CANCELLING; the stream or the
                    // reconciler delivers the definitive outcome.
                    warn!(%broker_ref, error = %err, "cancel not confirmed by broker");
                    return Ok(());
                }
            }
        }
    }

    /// Route one broker stream event to its order.
    pub async fn on_broker_event(&self, event: BrokerEvent) -> EngineResult<()> {
        let slot = {
            let orders = self.orders.lock();
            orders.get(&event.client_order_id).cloned()
        };
        let Some(slot) = slot else {
            warn!(
                client_order_id = %event.client_order_id,
                kind = ?event.kind,
                "broker event for untracked order"
            );
            self.journal.record(
                RecordKind::Metric,
                json!({
                    "name": "untracked_broker_event",
                    "client_order_id": event.client_order_id,
                    "kind": event.kind,
                }),
            )?;
            return Ok(());
        };
        self.awaiting_event.lock().remove(&event.client_order_id);

        let mut order = slot.lock().await;
        match event.kind {
            BrokerEventKind::Ack => {
                if order.broker_ref.is_none() {
                    order.broker_ref = event.order_id.clone();
                }
                match order.state {
                    OrderState::Pending | OrderState::Unknown => {
                        self.transition_locked(&mut order, OrderState::Submitted, "stream ack")?;
                    }
                    _ => debug!(order_id = %order.order_id, "duplicate ack ignored"),
                }
            }
            BrokerEventKind::Reject => {
                let reason = event.reason.clone().unwrap_or_else(|| "rejected".into());
                self.reject_invalid(&mut order, OrderState::Rejected, &reason)?;
            }
            BrokerEventKind::Cancel => {
                if order.state == OrderState::Submitted || order.state == OrderState::PartialFill {
                    // Broker-initiated cancel arrives without a local
                    // CANCELLING step; pass through it so the journal shows
                    // the full path.
                    self.transition_locked(&mut order, OrderState::Cancelling, "broker cancel")?;
                }
                self.reject_invalid(&mut order, OrderState::Cancelled, "cancel confirmed")?;
            }
            BrokerEventKind::Fill => {
                self.apply_fill_event(&mut order, &event)?;
            }
            BrokerEventKind::Unknown => {
                self.reject_invalid(&mut order, OrderState::Unknown, "broker reported unknown")?;
                let _ = self.reconcile_tx.send(order.client_order_id.clone());
            }
        }
        Ok(())
    }

    fn apply_fill_event(&self, order: &mut Order, event: &BrokerEvent) -> EngineResult<()> {
        let (Some(qty), Some(price)) = (event.qty, event.price) else {
            self.record_invariant_violation(
                order,
                "fill event missing qty or price",
            )?;
            return Ok(());
        };
        let fill_id = event
            .fill_id
            .clone()
            .unwrap_or_else(|| format!("{}-seq{}", order.client_order_id, event.seq));
        if !self.seen_fills.lock().insert(fill_id.clone()) {
            debug!(%fill_id, "duplicate fill dropped");
            return Ok(());
        }
        if order.filled_qty + qty > order.qty {
            self.record_invariant_violation(
                order,
                &format!(
                    "overfill: {} + {} exceeds {}",
                    order.filled_qty, qty, order.qty
                ),
            )?;
            return Ok(());
        }

        let fill = Fill {
            fill_id,
            order_id: order.order_id.clone(),
            qty,
            price,
            fees: event.fees.unwrap_or(Decimal::ZERO),
            ts: event.ts,
        };
        self.commit_fill(order, fill)
    }

    /// Record a fill and advance the order, journal first.
    fn commit_fill(&self, order: &mut Order, fill: Fill) -> EngineResult<()> {
        self.journal.record(
            RecordKind::Fill,
            serde_json::to_value(&fill).unwrap_or_default(),
        )?;

        let prior_filled = order.filled_qty;
        let new_filled = prior_filled + fill.qty;
        let prior_avg = order.avg_fill_price.unwrap_or(Decimal::ZERO);
        order.avg_fill_price = Some(if new_filled.is_zero() {
            fill.price
        } else {
            (prior_avg * prior_filled + fill.price * fill.qty) / new_filled
        });
        order.filled_qty = new_filled;

        // A fill racing ahead of the REST ack implies acceptance.
        if order.state == OrderState::Pending {
            self.transition_locked(order, OrderState::Submitted, "implied by fill")?;
        }
        let target = if order.filled_qty == order.qty {
            OrderState::Filled
        } else {
            OrderState::PartialFill
        };
        self.transition_locked(order, target, "fill applied")?;

        let position = {
            let mut portfolio = self.portfolio.lock();
            portfolio.apply_execution(&order.symbol, order.side, &fill)?
        };
        self.cache.set_position(&position)?;
        let equity = self.portfolio.lock().equity_point(Utc::now());
        self.cache.set_equity(&equity)?;

        let _ = self.updates.send(EngineUpdate::Fill {
            order: order.clone(),
            fill,
        });
        let _ = self.updates.send(EngineUpdate::Position(position));
        let _ = self.updates.send(EngineUpdate::Equity(equity));
        Ok(())
    }

    /// Like `transition_locked`, but an illegal transition is recorded and
    /// swallowed instead of surfacing to the stream consumer: a stray
    /// broker event must not wedge the dispatcher.
    fn reject_invalid(
        &self,
        order: &mut Order,
        next: OrderState,
        reason: &str,
    ) -> EngineResult<()> {
        if order.state == next {
            return Ok(());
        }
        match self.transition_locked(order, next, reason) {
            Ok(()) => Ok(()),
            Err(EngineError::InvalidTransition { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn record_invariant_violation(&self, order: &Order, detail: &str) -> EngineResult<()> {
        error!(
            order_id = %order.order_id,
            state = %order.state,
            detail,
            "invariant violation; event rejected"
        );
        self.journal.record(
            RecordKind::Metric,
            json!({
                "name": "invariant_violation",
                "order_id": order.order_id,
                "state": order.state,
                "detail": detail,
            }),
        )?;
        let _ = self.updates.send(EngineUpdate::Alarm {
            code: "invariant_violation",
            message: format!("order {}: {detail}", order.order_id),
        });
        Ok(())
    }

    /// Validated state transition. Journal first, cache second, broadcast
    /// last.
    fn transition_locked(
        &self,
        order: &mut Order,
        next: OrderState,
        reason: &str,
    ) -> EngineResult<()> {
        if !order.state.can_transition_to(next) {
            self.record_invariant_violation(
                order,
                &format!("illegal transition {} -> {next}", order.state),
            )?;
            return Err(EngineError::InvalidTransition {
                order_id: order.order_id.clone(),
                from: order.state,
                to: next,
            });
        }
        let from = order.state;
        order.state = next;
        order.updated_at = Utc::now();
        self.journal.record(
            RecordKind::OrderTransition,
            json!({
                "order_id": order.order_id,
                "client_order_id": order.client_order_id,
                "from": from,
                "to": next,
                "reason": reason,
                "filled_qty": order.filled_qty,
            }),
        )?;
        self.cache.set_order(order)?;
        let _ = self.updates.send(EngineUpdate::Order(order.clone()));
        info!(
            order_id = %order.order_id,
            from = %from,
            to = %next,
            reason,
            "order transition"
        );
        Ok(())
    }

    fn resolve(&self, id: &str) -> EngineResult<OrderSlot> {
        let orders = self.orders.lock();
        if let Some(slot) = orders.get(id) {
            return Ok(slot.clone());
        }
        let index = self.order_index.lock();
        index
            .get(id)
            .and_then(|cid| orders.get(cid))
            .cloned()
            .ok_or_else(|| EngineError::UnknownOrder(id.to_string()))
    }

    /// Fetch a point-in-time copy of one order.
    pub async fn order(&self, id: &str) -> EngineResult<Order> {
        let slot = self.resolve(id)?;
        let order = slot.lock().await;
        Ok(order.clone())
    }

    /// All tracked orders, terminal ones included (retained for audit).
    pub async fn orders(&self) -> Vec<Order> {
        let slots: Vec<OrderSlot> = self.orders.lock().values().cloned().collect();
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            out.push(slot.lock().await.clone());
        }
        out.sort_by(|a, b| a.order_id.cmp(&b.order_id));
        out
    }

    /// Orders currently in `UNKNOWN`, with their last update time.
    pub async fn unknown_orders(&self) -> Vec<(ClientOrderId, DateTime<Utc>)> {
        let mut out = Vec::new();
        for order in self.orders().await {
            if order.state == OrderState::Unknown {
                out.push((order.client_order_id, order.updated_at));
            }
        }
        out
    }

    /// Orders working at the broker beyond the zombie threshold.
    pub async fn zombies(&self) -> Vec<Order> {
        let now = Utc::now();
        let threshold = chrono::Duration::from_std(self.timeouts.t_zombie).unwrap_or_else(|_| {
            chrono::Duration::seconds(300)
        });
        self.orders()
            .await
            .into_iter()
            .filter(|order| {
                matches!(
                    order.state,
                    OrderState::Submitted | OrderState::Cancelling
                ) && now - order.updated_at > threshold
            })
            .collect()
    }

    /// Orders whose placement has gone unconfirmed past `t_ack`.
    pub(crate) fn overdue_acks(&self) -> Vec<ClientOrderId> {
        let awaiting = self.awaiting_event.lock();
        awaiting
            .iter()
            .filter(|(_, since)| since.elapsed() >= self.timeouts.t_ack)
            .map(|(cid, _)| cid.clone())
            .collect()
    }

    /// Move an overdue order to `UNKNOWN` and queue it for reconciliation.
    pub(crate) async fn mark_unconfirmed(&self, client_order_id: &str) -> EngineResult<()> {
        let slot = self.resolve(client_order_id)?;
        let mut order = slot.lock().await;
        self.awaiting_event.lock().remove(client_order_id);
        if order.state == OrderState::Submitted {
            self.transition_locked(
                &mut order,
                OrderState::Unknown,
                "no broker event within ack window",
            )?;
            let _ = self.reconcile_tx.send(order.client_order_id.clone());
        }
        Ok(())
    }

    /// Apply the broker's authoritative view of an order (reconciler only).
    pub async fn apply_reconciled(
        &self,
        client_order_id: &str,
        broker_order: &BrokerOrder,
    ) -> EngineResult<()> {
        let slot = self.resolve(client_order_id)?;
        let mut order = slot.lock().await;
        if order.is_terminal() {
            return Ok(());
        }
        if order.broker_ref.is_none() {
            order.broker_ref = Some(broker_order.order_id.clone());
        }

        // Synthesize the missed fill delta so quantities and positions
        // converge; reconciliation reads the broker, it never re-trades.
        if broker_order.filled_qty > order.filled_qty {
            let delta = broker_order.filled_qty - order.filled_qty;
            let broker_avg = broker_order
                .avg_fill_price
                .unwrap_or_else(|| order.avg_fill_price.unwrap_or(Decimal::ZERO));
            let local_avg = order.avg_fill_price.unwrap_or(Decimal::ZERO);
            let delta_price = if delta.is_zero() {
                broker_avg
            } else {
                (broker_avg * broker_order.filled_qty - local_avg * order.filled_qty) / delta
            };
            let fill = Fill {
                fill_id: format!("reconciled-{}-{}", order.client_order_id, broker_order.filled_qty),
                order_id: order.order_id.clone(),
                qty: delta,
                price: delta_price,
                fees: Decimal::ZERO,
                ts: Utc::now(),
            };
            if self.seen_fills.lock().insert(fill.fill_id.clone()) {
                self.commit_fill(&mut order, fill)?;
            }
        }

        let target = broker_order.status.as_order_state();
        if order.state != target {
            self.reject_invalid(
                &mut order,
                target,
                "reconciled against broker status",
            )?;
        }
        Ok(())
    }

    /// Declare an `UNKNOWN` order failed after the not-found grace expired.
    pub async fn fail_unresolved(&self, client_order_id: &str, reason: &str) -> EngineResult<()> {
        let slot = self.resolve(client_order_id)?;
        let mut order = slot.lock().await;
        if order.state == OrderState::Unknown {
            self.transition_locked(&mut order, OrderState::Failed, reason)?;
        }
        Ok(())
    }

    /// Re-register orders persisted in the live cache after a restart so
    /// that broker events and reconciliation resolve against them. Every
    /// adopted working order is queued for an immediate reconcile pass.
    pub fn adopt_orders(&self, orders: Vec<Order>) {
        let mut map = self.orders.lock();
        let mut index = self.order_index.lock();
        for order in orders {
            if map.contains_key(&order.client_order_id) {
                continue;
            }
            info!(
                order_id = %order.order_id,
                client_order_id = %order.client_order_id,
                state = %order.state,
                "adopted persisted order"
            );
            index.insert(order.order_id.clone(), order.client_order_id.clone());
            if !order.is_terminal() {
                let _ = self.reconcile_tx.send(order.client_order_id.clone());
            }
            map.insert(
                order.client_order_id.clone(),
                Arc::new(AsyncMutex::new(order)),
            );
        }
    }

    /// Consistent view of orders, positions, and equity.
    pub async fn snapshot(&self) -> Snapshot {
        let orders = self.orders().await;
        let (positions, equity) = {
            let portfolio = self.portfolio.lock();
            (portfolio.positions(), portfolio.equity_point(Utc::now()))
        };
        Snapshot {
            ts: Utc::now(),
            orders,
            positions,
            equity,
        }
    }

    pub(crate) fn cache(&self) -> &StateCache {
        &self.cache
    }

    pub(crate) fn journal(&self) -> &Journal {
        &self.journal
    }

    pub(crate) fn portfolio(&self) -> &Arc<Mutex<Portfolio>> {
        &self.portfolio
    }

    pub(crate) fn emit(&self, update: EngineUpdate) {
        let _ = self.updates.send(update);
    }
}

fn handle_of(order: &Order) -> OrderHandle {
    OrderHandle {
        order_id: order.order_id.clone(),
        client_order_id: order.client_order_id.clone(),
        state: order.state,
    }
}
