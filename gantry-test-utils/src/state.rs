//! Shared in-memory exchange state behind the mock broker surfaces.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use gantry_broker::PlaceOrderRequest;
use gantry_core::{
    BrokerAccount, BrokerEvent, BrokerEventKind, BrokerOrder, BrokerOrderStatus, BrokerPosition,
    OrderType, Price, Qty,
};
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use tokio::sync::broadcast;

/// How the mock exchange handles a freshly placed order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FillMode {
    /// Market orders ack and fill immediately at the mark price; limit
    /// orders rest open.
    Immediate,
    /// Orders ack and rest; tests drive fills explicitly.
    Manual,
    /// Orders are accepted server-side but no events are emitted. Models a
    /// broker whose stream has gone quiet (the UNKNOWN path).
    Silent,
}

#[derive(Clone)]
pub struct MockExchangeState {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<BrokerEvent>,
}

struct Inner {
    orders: HashMap<String, BrokerOrder>,
    order_index: HashMap<String, String>,
    positions: HashMap<String, BrokerPosition>,
    marks: HashMap<String, Price>,
    cash: Price,
    last_equity: Price,
    next_seq: u64,
    next_order_id: u64,
    event_log: Vec<BrokerEvent>,
    place_calls: usize,
    fill_mode: FillMode,
    fail_next_place: Option<u16>,
}

impl Default for MockExchangeState {
    fn default() -> Self {
        Self::new(Decimal::from(100_000))
    }
}

impl MockExchangeState {
    #[must_use]
    pub fn new(cash: Price) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                orders: HashMap::new(),
                order_index: HashMap::new(),
                positions: HashMap::new(),
                marks: HashMap::new(),
                cash,
                last_equity: cash,
                next_seq: 0,
                next_order_id: 1,
                event_log: Vec::new(),
                place_calls: 0,
                fill_mode: FillMode::Immediate,
                fail_next_place: None,
            })),
            events,
        }
    }

    pub fn set_fill_mode(&self, mode: FillMode) {
        self.inner.lock().unwrap().fill_mode = mode;
    }

    /// Make the next `POST /orders` fail with the given HTTP status.
    pub fn fail_next_place(&self, status: u16) {
        self.inner.lock().unwrap().fail_next_place = Some(status);
    }

    pub fn set_mark(&self, symbol: &str, price: Price) {
        self.inner.lock().unwrap().marks.insert(symbol.into(), price);
    }

    /// Total `POST /orders` invocations, including idempotent replays.
    #[must_use]
    pub fn place_calls(&self) -> usize {
        self.inner.lock().unwrap().place_calls
    }

    /// Number of distinct orders the exchange has created.
    #[must_use]
    pub fn orders_created(&self) -> usize {
        self.inner.lock().unwrap().orders.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    /// Events with `seq >= from`, for stream resume.
    #[must_use]
    pub fn events_from(&self, from: u64) -> Vec<BrokerEvent> {
        self.inner
            .lock()
            .unwrap()
            .event_log
            .iter()
            .filter(|event| event.seq >= from)
            .cloned()
            .collect()
    }

    /// Place an order. Idempotent on `client_order_id`; returns the order
    /// plus whether it was newly created. `Err` carries a scripted HTTP
    /// status.
    pub fn place_order(&self, request: &PlaceOrderRequest) -> Result<(BrokerOrder, bool), u16> {
        let mut inner = self.inner.lock().unwrap();
        inner.place_calls += 1;
        if let Some(status) = inner.fail_next_place.take() {
            return Err(status);
        }
        if let Some(existing) = inner.orders.get(&request.client_order_id) {
            return Ok((existing.clone(), false));
        }

        let order_id = format!("bx-{:06}", inner.next_order_id);
        inner.next_order_id += 1;
        let order = BrokerOrder {
            order_id: order_id.clone(),
            client_order_id: request.client_order_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            qty: request.qty,
            status: BrokerOrderStatus::Accepted,
            filled_qty: Decimal::ZERO,
            avg_fill_price: None,
            created_at: Utc::now(),
        };
        inner
            .orders
            .insert(request.client_order_id.clone(), order.clone());
        inner
            .order_index
            .insert(order_id, request.client_order_id.clone());

        let mode = inner.fill_mode;
        if mode != FillMode::Silent {
            emit(&mut inner, &self.events, &request.client_order_id, BrokerEventKind::Ack, None, None);
        }
        if mode == FillMode::Immediate && request.order_type == OrderType::Market {
            let mark = inner
                .marks
                .get(&request.symbol)
                .copied()
                .unwrap_or_else(|| request.limit_price.unwrap_or(Decimal::from(100)));
            fill_locked(&mut inner, &self.events, &request.client_order_id, request.qty, mark);
        }
        let order = inner.orders[&request.client_order_id].clone();
        Ok((order, true))
    }

    /// Fill an open order (fully or partially) at `price`.
    pub fn fill_order(&self, client_order_id: &str, qty: Qty, price: Price) {
        let mut inner = self.inner.lock().unwrap();
        fill_locked(&mut inner, &self.events, client_order_id, qty, price);
    }

    /// Cancel by broker order id. Returns false when the id is unknown or
    /// the order is already done.
    pub fn cancel_order(&self, order_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(client_order_id) = inner.order_index.get(order_id).cloned() else {
            return false;
        };
        let Some(order) = inner.orders.get_mut(&client_order_id) else {
            return false;
        };
        match order.status {
            BrokerOrderStatus::Filled
            | BrokerOrderStatus::Canceled
            | BrokerOrderStatus::Rejected
            | BrokerOrderStatus::Expired => false,
            _ => {
                order.status = BrokerOrderStatus::Canceled;
                emit(
                    &mut inner,
                    &self.events,
                    &client_order_id,
                    BrokerEventKind::Cancel,
                    None,
                    None,
                );
                true
            }
        }
    }

    #[must_use]
    pub fn get_order_by_client_id(&self, client_order_id: &str) -> Option<BrokerOrder> {
        self.inner.lock().unwrap().orders.get(client_order_id).cloned()
    }

    #[must_use]
    pub fn open_orders(&self) -> Vec<BrokerOrder> {
        self.inner
            .lock()
            .unwrap()
            .orders
            .values()
            .filter(|order| {
                matches!(
                    order.status,
                    BrokerOrderStatus::New
                        | BrokerOrderStatus::Accepted
                        | BrokerOrderStatus::PartiallyFilled
                )
            })
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn positions(&self) -> Vec<BrokerPosition> {
        self.inner
            .lock()
            .unwrap()
            .positions
            .values()
            .filter(|position| !position.net_qty.is_zero())
            .cloned()
            .collect()
    }

    /// Overwrite a position directly (to stage divergence scenarios).
    pub fn set_position(&self, symbol: &str, net_qty: Qty, avg_entry_price: Price) {
        let mut inner = self.inner.lock().unwrap();
        let mark = inner.marks.get(symbol).copied().unwrap_or(avg_entry_price);
        inner.positions.insert(
            symbol.to_string(),
            BrokerPosition {
                symbol: symbol.to_string(),
                net_qty,
                avg_entry_price,
                market_value: net_qty * mark,
                unrealized_pnl: (mark - avg_entry_price) * net_qty,
            },
        );
    }

    #[must_use]
    pub fn account(&self) -> BrokerAccount {
        let inner = self.inner.lock().unwrap();
        let positions_value: Price = inner
            .positions
            .values()
            .map(|position| {
                let mark = inner
                    .marks
                    .get(&position.symbol)
                    .copied()
                    .unwrap_or(position.avg_entry_price);
                position.net_qty * mark
            })
            .sum();
        BrokerAccount {
            equity: inner.cash + positions_value,
            cash: inner.cash,
            last_equity: inner.last_equity,
        }
    }

    /// Pin the previous-close equity used for daily-PnL computations.
    pub fn set_last_equity(&self, last_equity: Price) {
        self.inner.lock().unwrap().last_equity = last_equity;
    }

    /// Drain cash directly (to stage loss scenarios).
    pub fn set_cash(&self, cash: Price) {
        self.inner.lock().unwrap().cash = cash;
    }
}

fn fill_locked(
    inner: &mut Inner,
    events: &broadcast::Sender<BrokerEvent>,
    client_order_id: &str,
    qty: Qty,
    price: Price,
) {
    let Some(order) = inner.orders.get_mut(client_order_id) else {
        return;
    };
    let fillable = (order.qty - order.filled_qty).min(qty);
    if fillable <= Decimal::ZERO {
        return;
    }
    let prior = order.filled_qty;
    order.filled_qty = prior + fillable;
    let prior_avg = order.avg_fill_price.unwrap_or(Decimal::ZERO);
    order.avg_fill_price = Some((prior_avg * prior + price * fillable) / order.filled_qty);
    order.status = if order.filled_qty == order.qty {
        BrokerOrderStatus::Filled
    } else {
        BrokerOrderStatus::PartiallyFilled
    };

    let symbol = order.symbol.clone();
    let signed = fillable * order.side.signum();
    let position = inner
        .positions
        .entry(symbol.clone())
        .or_insert_with(|| BrokerPosition {
            symbol: symbol.clone(),
            net_qty: Decimal::ZERO,
            avg_entry_price: price,
            market_value: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
        });
    if position.net_qty.is_zero() || position.net_qty.signum() == signed.signum() {
        let total = position.net_qty.abs() + fillable;
        position.avg_entry_price =
            (position.avg_entry_price * position.net_qty.abs() + price * fillable) / total;
    }
    position.net_qty += signed;
    position.market_value = position.net_qty * price;
    inner.cash -= signed * price;
    inner.marks.insert(symbol, price);

    let fill_mode = inner.fill_mode;
    if fill_mode != FillMode::Silent {
        emit(
            inner,
            events,
            client_order_id,
            BrokerEventKind::Fill,
            Some(fillable),
            Some(price),
        );
    }
}

fn emit(
    inner: &mut Inner,
    events: &broadcast::Sender<BrokerEvent>,
    client_order_id: &str,
    kind: BrokerEventKind,
    qty: Option<Qty>,
    price: Option<Price>,
) {
    inner.next_seq += 1;
    let order_id = inner
        .orders
        .get(client_order_id)
        .map(|order| order.order_id.clone());
    let event = BrokerEvent {
        seq: inner.next_seq,
        kind,
        order_id,
        client_order_id: client_order_id.to_string(),
        fill_id: matches!(kind, BrokerEventKind::Fill)
            .then(|| format!("mx-fill-{}", inner.next_seq)),
        qty,
        price,
        fees: None,
        reason: None,
        ts: Utc::now(),
    };
    inner.event_log.push(event.clone());
    let _ = events.send(event);
}
