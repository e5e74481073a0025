//! Fundamental data types shared across the entire workspace.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod ids;
pub mod record;

pub use ids::{intent_client_order_id, OrderIdGenerator};
pub use record::{EventRecord, RecordKind};

/// Alias for price precision.
pub type Price = Decimal;
/// Alias for quantity precision.
pub type Qty = Decimal;
/// Human-readable market symbol (e.g., `AAPL`).
pub type Symbol = String;
/// Engine-assigned order identifier (monotonic, sortable).
pub type OrderId = String;
/// Caller-derived idempotency key for broker placement.
pub type ClientOrderId = String;

/// The side of an order or position.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Returns the opposite side (buy <-> sell).
    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Sign applied to quantities when aggregating positions.
    #[must_use]
    pub fn signum(self) -> Decimal {
        match self {
            Self::Buy => Decimal::ONE,
            Self::Sell => -Decimal::ONE,
        }
    }
}

/// Order execution style.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    /// Execute immediately at the best available price.
    Market,
    /// Execute at the provided limit price or better.
    Limit,
}

/// Lifecycle state of an order tracked by the engine.
///
/// `Unknown` marks orders whose broker-side fate is unverified (ack
/// timeout, stream gap); only the reconciler moves orders out of it.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    Pending,
    Submitted,
    PartialFill,
    Filled,
    Cancelling,
    Cancelled,
    Rejected,
    Unknown,
    Failed,
}

impl OrderState {
    /// Terminal states admit no further transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Cancelled | Self::Rejected | Self::Failed
        )
    }

    /// Whether the transition `self -> next` is legal.
    ///
    /// `Failed` is reachable from any non-terminal state (unrecoverable
    /// local error). Transitions out of `Unknown` are reserved for the
    /// reconciler, which is the only component allowed to assert broker
    /// truth.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == Self::Failed {
            return true;
        }
        match self {
            // `Pending -> Unknown` covers placement attempts that exhaust
            // their retries on ambiguous transport errors: the order may or
            // may not exist at the broker, and only the reconciler decides.
            Self::Pending => matches!(next, Self::Submitted | Self::Rejected | Self::Unknown),
            Self::Submitted => matches!(
                next,
                Self::PartialFill
                    | Self::Filled
                    | Self::Cancelling
                    | Self::Rejected
                    | Self::Unknown
            ),
            Self::PartialFill => matches!(
                next,
                Self::PartialFill | Self::Filled | Self::Cancelling | Self::Unknown
            ),
            Self::Cancelling => matches!(
                next,
                Self::Cancelled | Self::Filled | Self::PartialFill | Self::Unknown
            ),
            Self::Unknown => matches!(
                next,
                Self::Submitted
                    | Self::PartialFill
                    | Self::Filled
                    | Self::Cancelled
                    | Self::Rejected
            ),
            _ => false,
        }
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Pending => "PENDING",
            Self::Submitted => "SUBMITTED",
            Self::PartialFill => "PARTIAL_FILL",
            Self::Filled => "FILLED",
            Self::Cancelling => "CANCELLING",
            Self::Cancelled => "CANCELLED",
            Self::Rejected => "REJECTED",
            Self::Unknown => "UNKNOWN",
            Self::Failed => "FAILED",
        };
        f.write_str(label)
    }
}

/// Risk-approved trading intent handed to the order lifecycle engine.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Intent {
    pub strategy_id: String,
    pub signal_id: Uuid,
    pub symbol: Symbol,
    pub side: Side,
    pub qty: Qty,
    pub order_type: OrderType,
    #[serde(default)]
    pub limit_price: Option<Price>,
    pub decision_ts: DateTime<Utc>,
}

impl Intent {
    /// Derive the deterministic idempotency key for this intent.
    ///
    /// The same logical intent always hashes to the same id, so a
    /// crashed-and-restarted process resolves to the same broker order.
    #[must_use]
    pub fn client_order_id(&self) -> ClientOrderId {
        intent_client_order_id(
            &self.strategy_id,
            &self.signal_id,
            &self.symbol,
            self.side,
            self.qty,
            self.decision_ts,
        )
    }
}

/// Order representation aggregating engine and broker state.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Order {
    pub order_id: OrderId,
    pub client_order_id: ClientOrderId,
    pub symbol: Symbol,
    pub side: Side,
    pub qty: Qty,
    pub order_type: OrderType,
    #[serde(default)]
    pub limit_price: Option<Price>,
    pub state: OrderState,
    pub filled_qty: Qty,
    #[serde(default)]
    pub avg_fill_price: Option<Price>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub strategy_id: String,
    pub signal_id: Uuid,
    /// Broker-assigned id, absent until the broker acknowledges the order.
    #[serde(default)]
    pub broker_ref: Option<String>,
}

impl Order {
    /// Quantity still working at the broker.
    #[must_use]
    pub fn remaining_qty(&self) -> Qty {
        self.qty - self.filled_qty
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether the order is visible at the broker and still working.
    #[must_use]
    pub fn is_open_at_broker(&self) -> bool {
        matches!(
            self.state,
            OrderState::Submitted | OrderState::PartialFill | OrderState::Cancelling
        )
    }
}

/// Immutable broker confirmation of an executed quantity.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Fill {
    pub fill_id: String,
    pub order_id: OrderId,
    pub qty: Qty,
    pub price: Price,
    pub fees: Price,
    pub ts: DateTime<Utc>,
}

/// Net position in a single symbol. `net_qty` is signed (long > 0).
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Position {
    pub symbol: Symbol,
    pub net_qty: Qty,
    pub avg_cost: Price,
    pub realized_pnl: Price,
    pub unrealized_pnl: Price,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl Position {
    /// Flat position placeholder for a symbol.
    #[must_use]
    pub fn flat(symbol: impl Into<Symbol>, ts: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            net_qty: Decimal::ZERO,
            avg_cost: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            updated_at: ts,
            version: 0,
        }
    }

    #[must_use]
    pub fn is_flat(&self) -> bool {
        self.net_qty.is_zero()
    }

    /// Market value at the provided mark price.
    #[must_use]
    pub fn market_value(&self, mark: Price) -> Price {
        self.net_qty * mark
    }
}

/// Point on the equity curve, recomputed each decision tick.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct EquityPoint {
    pub ts: DateTime<Utc>,
    pub equity: Price,
    pub cash: Price,
    pub positions_value: Price,
}

/// Role of a heartbeat-publishing process.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessRole {
    Trading,
    Supervisor,
}

impl ProcessRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trading => "trading",
            Self::Supervisor => "supervisor",
        }
    }
}

/// Liveness beacon written to the state cache each beat.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Heartbeat {
    pub process_id: u32,
    pub role: ProcessRole,
    pub ts: DateTime<Utc>,
    pub seq: u64,
}

/// Persistent signal that trading must not resume without operator action.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct HaltFlag {
    pub active: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub set_by: String,
    #[serde(default)]
    pub set_at: Option<DateTime<Utc>>,
}

impl HaltFlag {
    /// Build an active halt flag attributed to `set_by`.
    #[must_use]
    pub fn raised(reason: impl Into<String>, set_by: impl Into<String>) -> Self {
        Self {
            active: true,
            reason: reason.into(),
            set_by: set_by.into(),
            set_at: Some(Utc::now()),
        }
    }
}

/// Quality tier attached to every stored bar.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataTier {
    /// Consolidated-feed data suitable for research and backtests.
    Consolidated,
    /// Delayed data; usable with care.
    Delayed,
    /// Coarse universe-screening data. Never valid for backtests.
    Universe,
}

impl DataTier {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Consolidated => "consolidated",
            Self::Delayed => "delayed",
            Self::Universe => "universe",
        }
    }
}

/// Aggregated OHLCV bar.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Bar {
    pub symbol: Symbol,
    pub ts: DateTime<Utc>,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    pub volume: Qty,
    pub tier: DataTier,
}

/// Trend component of the detected market regime.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendRegime {
    Trending,
    Choppy,
}

/// Volatility component of the detected market regime.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VolRegime {
    Normal,
    Elevated,
    Crisis,
}

/// Combined market regime published to the state cache and broadcast bus.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Regime {
    pub trend: TrendRegime,
    pub vol: VolRegime,
    pub detected_at: DateTime<Utc>,
}

impl Regime {
    /// Label used in logs and the `regime` broadcast channel.
    #[must_use]
    pub fn label(&self) -> String {
        let trend = match self.trend {
            TrendRegime::Trending => "trending",
            TrendRegime::Choppy => "choppy",
        };
        let vol = match self.vol {
            VolRegime::Normal => "normal",
            VolRegime::Elevated => "elevated",
            VolRegime::Crisis => "crisis",
        };
        format!("{trend}_{vol}")
    }
}

impl Default for Regime {
    fn default() -> Self {
        Self {
            trend: TrendRegime::Choppy,
            vol: VolRegime::Normal,
            detected_at: Utc::now(),
        }
    }
}

/// Kind of an event arriving on the broker stream.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerEventKind {
    Ack,
    Fill,
    Cancel,
    Reject,
    Unknown,
}

/// JSON frame delivered over the broker's persistent event stream.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BrokerEvent {
    pub seq: u64,
    pub kind: BrokerEventKind,
    #[serde(default)]
    pub order_id: Option<String>,
    pub client_order_id: ClientOrderId,
    #[serde(default)]
    pub fill_id: Option<String>,
    #[serde(default)]
    pub qty: Option<Qty>,
    #[serde(default)]
    pub price: Option<Price>,
    #[serde(default)]
    pub fees: Option<Price>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default = "Utc::now")]
    pub ts: DateTime<Utc>,
}

/// Order status as reported by the broker's REST surface.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerOrderStatus {
    New,
    Accepted,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl BrokerOrderStatus {
    /// Map the broker's vocabulary onto the engine state machine.
    #[must_use]
    pub fn as_order_state(self) -> OrderState {
        match self {
            Self::New | Self::Accepted => OrderState::Submitted,
            Self::PartiallyFilled => OrderState::PartialFill,
            Self::Filled => OrderState::Filled,
            Self::Canceled => OrderState::Cancelled,
            Self::Rejected | Self::Expired => OrderState::Rejected,
        }
    }
}

/// Broker-side view of an order returned by status queries.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BrokerOrder {
    pub order_id: String,
    pub client_order_id: ClientOrderId,
    pub symbol: Symbol,
    pub side: Side,
    pub qty: Qty,
    pub status: BrokerOrderStatus,
    pub filled_qty: Qty,
    #[serde(default)]
    pub avg_fill_price: Option<Price>,
    pub created_at: DateTime<Utc>,
}

/// Broker-side view of a position.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BrokerPosition {
    pub symbol: Symbol,
    pub net_qty: Qty,
    pub avg_entry_price: Price,
    pub market_value: Price,
    pub unrealized_pnl: Price,
}

/// Broker account summary used by equity and kill-rule computations.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BrokerAccount {
    pub equity: Price,
    pub cash: Price,
    /// Equity at the previous session close; baseline for daily PnL.
    pub last_equity: Price,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_admit_no_transitions() {
        for state in [
            OrderState::Filled,
            OrderState::Cancelled,
            OrderState::Rejected,
            OrderState::Failed,
        ] {
            assert!(state.is_terminal());
            assert!(!state.can_transition_to(OrderState::Failed));
            assert!(!state.can_transition_to(OrderState::Submitted));
        }
    }

    #[test]
    fn failed_reachable_from_any_non_terminal() {
        for state in [
            OrderState::Pending,
            OrderState::Submitted,
            OrderState::PartialFill,
            OrderState::Cancelling,
            OrderState::Unknown,
        ] {
            assert!(state.can_transition_to(OrderState::Failed));
        }
    }

    #[test]
    fn cancel_path_follows_the_graph() {
        assert!(OrderState::Submitted.can_transition_to(OrderState::Cancelling));
        assert!(OrderState::PartialFill.can_transition_to(OrderState::Cancelling));
        assert!(OrderState::Cancelling.can_transition_to(OrderState::Cancelled));
        // A cancel can race a fill; the fill wins.
        assert!(OrderState::Cancelling.can_transition_to(OrderState::Filled));
        assert!(!OrderState::Pending.can_transition_to(OrderState::Cancelling));
    }

    #[test]
    fn unknown_resolves_only_to_definitive_states() {
        assert!(OrderState::Unknown.can_transition_to(OrderState::Filled));
        assert!(OrderState::Unknown.can_transition_to(OrderState::Cancelled));
        assert!(!OrderState::Unknown.can_transition_to(OrderState::Cancelling));
        assert!(!OrderState::Unknown.can_transition_to(OrderState::Unknown));
    }

    #[test]
    fn intent_hash_is_deterministic() {
        let intent = Intent {
            strategy_id: "momo".into(),
            signal_id: Uuid::nil(),
            symbol: "AAPL".into(),
            side: Side::Buy,
            qty: Decimal::from(10),
            order_type: OrderType::Market,
            limit_price: None,
            decision_ts: DateTime::parse_from_rfc3339("2025-06-02T14:30:00Z")
                .unwrap()
                .with_timezone(&Utc),
        };
        let a = intent.client_order_id();
        let b = intent.client_order_id();
        assert_eq!(a, b);
        assert!(a.starts_with("ord-"));

        let mut other = intent.clone();
        other.signal_id = Uuid::new_v4();
        assert_ne!(a, other.client_order_id());
    }

    #[test]
    fn broker_status_maps_onto_engine_states() {
        assert_eq!(
            BrokerOrderStatus::Accepted.as_order_state(),
            OrderState::Submitted
        );
        assert_eq!(
            BrokerOrderStatus::PartiallyFilled.as_order_state(),
            OrderState::PartialFill
        );
        assert_eq!(
            BrokerOrderStatus::Expired.as_order_state(),
            OrderState::Rejected
        );
    }
}
