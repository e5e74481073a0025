//! Broker-facing traits and error taxonomy used by the rest of the workspace.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::{
    BrokerAccount, BrokerOrder, BrokerPosition, ClientOrderId, OrderType, Price, Qty, Side,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod limiter;
pub mod rest;
pub mod stream;

pub use limiter::RequestLimiter;
pub use rest::HttpBroker;
pub use stream::EventStream;

/// Convenience alias for broker results.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Common error type returned by broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Transport-level failures: connect errors, timeouts, resets.
    #[error("transport error: {0}")]
    Transport(String),
    /// Authentication failed or credentials are missing.
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// The request itself is invalid for this broker.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The broker rejected the request for a business reason.
    #[error("broker rejected request: {0}")]
    Rejected(String),
    /// The broker is shedding load or temporarily unavailable.
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    /// Payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// How a failed operation should be treated by callers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    /// Safe to retry under the same idempotency key.
    Retriable,
    /// Retrying cannot succeed; surface the failure.
    Fatal,
}

impl BrokerError {
    /// Classify per the workspace retry policy: transport problems and
    /// broker-side overload are retriable, semantic rejections are not.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transport(_) | Self::Unavailable(_) => ErrorClass::Retriable,
            Self::Authentication(_)
            | Self::InvalidRequest(_)
            | Self::Rejected(_)
            | Self::Serialization(_) => ErrorClass::Fatal,
        }
    }

    #[must_use]
    pub fn is_retriable(&self) -> bool {
        self.class() == ErrorClass::Retriable
    }

    /// Map an HTTP status to the taxonomy. `429` counts as overload, other
    /// 4xx are semantic failures.
    #[must_use]
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::Authentication(body),
            408 | 429 => Self::Unavailable(format!("status {status}: {body}")),
            400..=499 => Self::Rejected(format!("status {status}: {body}")),
            _ => Self::Unavailable(format!("status {status}: {body}")),
        }
    }
}

/// Parameters for `POST /orders`. Idempotent on `client_order_id`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PlaceOrderRequest {
    pub client_order_id: ClientOrderId,
    pub symbol: String,
    pub side: Side,
    pub qty: Qty,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<Price>,
}

/// Response to a successful placement.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PlaceOrderAck {
    pub order_id: String,
    pub status: gantry_core::BrokerOrderStatus,
}

/// Broker server clock, used as a liveness/latency probe.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BrokerClock {
    pub ts: DateTime<Utc>,
    pub is_open: bool,
}

/// Execution interface against the upstream broker.
///
/// Implementations must make `place` idempotent on `client_order_id` and
/// must never invent state: queries report exactly what the broker knows.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Place a new order. Re-placing an existing `client_order_id` returns
    /// the original order's ack without creating a second order.
    async fn place(&self, request: PlaceOrderRequest) -> BrokerResult<PlaceOrderAck>;

    /// Cancel an order by broker id.
    async fn cancel(&self, order_id: &str) -> BrokerResult<()>;

    /// Look up an order by idempotency key. `Ok(None)` means the broker has
    /// never seen the key.
    async fn get_order_by_client_id(
        &self,
        client_order_id: &str,
    ) -> BrokerResult<Option<BrokerOrder>>;

    /// All orders currently working at the broker.
    async fn list_open_orders(&self) -> BrokerResult<Vec<BrokerOrder>>;

    /// Current positions. The broker is authoritative.
    async fn positions(&self) -> BrokerResult<Vec<BrokerPosition>>;

    /// Account equity and cash.
    async fn account(&self) -> BrokerResult<BrokerAccount>;

    /// Server clock; doubles as the API health probe.
    async fn clock(&self) -> BrokerResult<BrokerClock>;

    /// Cancel every open order. Returns how many cancels were issued.
    /// Default implementation composes the REST surface.
    async fn cancel_all(&self) -> BrokerResult<usize> {
        let open = self.list_open_orders().await?;
        let mut cancelled = 0;
        for order in open {
            match self.cancel(&order.order_id).await {
                Ok(()) => cancelled += 1,
                Err(err) => {
                    tracing::warn!(
                        order_id = %order.order_id,
                        error = %err,
                        "cancel_all: failed to cancel order"
                    );
                }
            }
        }
        Ok(cancelled)
    }
}
