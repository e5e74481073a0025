//! Order lifecycle management and broker reconciliation.

use gantry_broker::BrokerError;
use gantry_core::OrderState;
use gantry_journal::JournalError;
use gantry_portfolio::PortfolioError;
use gantry_state::StateError;
use thiserror::Error;

mod engine;
mod monitors;
mod reconciler;
mod retry;

pub use engine::{EngineTimeouts, EngineUpdate, OrderEngine, OrderHandle, Snapshot};
pub use monitors::{spawn_ack_monitor, spawn_zombie_monitor};
pub use reconciler::{spawn_reconciler, ReconcileReport, Reconciler};
pub use retry::RetryPolicy;

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Failure taxonomy of the order lifecycle engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Validation failure; never retried.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// The requested transition is not in the lifecycle graph.
    #[error("invalid transition {from} -> {to} for order {order_id}")]
    InvalidTransition {
        order_id: String,
        from: OrderState,
        to: OrderState,
    },
    /// Cancel was requested from a state that admits no cancel.
    #[error("order {order_id} is not cancellable from {state}")]
    NotCancellable {
        order_id: String,
        state: OrderState,
    },
    /// The engine has no order under the given identifier.
    #[error("unknown order: {0}")]
    UnknownOrder(String),
    /// Trading is halted; no new intents are accepted.
    #[error("halt flag is active: {0}")]
    HaltRequested(String),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Portfolio(#[from] PortfolioError),
}
