//! Mock broker infrastructure shared by integration tests.
//!
//! [`MockBroker`] runs the full HTTP + WebSocket surface on ephemeral
//! ports; [`ScriptedBroker`] implements the client trait directly over the
//! same exchange state for in-process engine tests, with scriptable
//! transport faults.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use gantry_broker::{
    BrokerClient, BrokerClock, BrokerError, BrokerResult, PlaceOrderAck, PlaceOrderRequest,
};
use gantry_core::{BrokerAccount, BrokerOrder, BrokerPosition};

mod rest;
mod state;
mod ws;

pub use rest::MockRestApi;
pub use state::{FillMode, MockExchangeState};
pub use ws::MockEventStream;

/// Complete mock broker: REST API plus event stream over shared state.
pub struct MockBroker {
    pub state: MockExchangeState,
    rest: MockRestApi,
    stream: MockEventStream,
}

impl MockBroker {
    pub async fn spawn() -> Result<Self> {
        let state = MockExchangeState::default();
        let rest = MockRestApi::spawn(state.clone()).await?;
        let stream = MockEventStream::spawn(state.clone()).await?;
        Ok(Self {
            state,
            rest,
            stream,
        })
    }

    #[must_use]
    pub fn rest_url(&self) -> String {
        self.rest.base_url()
    }

    #[must_use]
    pub fn ws_url(&self) -> String {
        self.stream.base_url()
    }

    pub async fn shutdown(&mut self) {
        self.rest.shutdown().await;
        self.stream.shutdown().await;
    }
}

/// In-process [`BrokerClient`] over [`MockExchangeState`], with scriptable
/// transport faults for exercising retry and UNKNOWN paths.
pub struct ScriptedBroker {
    pub state: MockExchangeState,
    /// Upcoming `place` calls that fail with a transport error before
    /// reaching the exchange.
    refuse_places: AtomicUsize,
    /// Upcoming `place` calls that reach the exchange but whose response is
    /// lost (the ambiguous-success case).
    drop_place_responses: AtomicUsize,
    /// Upcoming `get_order_by_client_id` calls that fail with a transport
    /// error.
    refuse_lookups: AtomicUsize,
}

impl ScriptedBroker {
    #[must_use]
    pub fn new(state: MockExchangeState) -> Arc<Self> {
        Arc::new(Self {
            state,
            refuse_places: AtomicUsize::new(0),
            drop_place_responses: AtomicUsize::new(0),
            refuse_lookups: AtomicUsize::new(0),
        })
    }

    /// Fail the next `n` placements before they reach the exchange.
    pub fn refuse_next_places(&self, n: usize) {
        self.refuse_places.store(n, Ordering::SeqCst);
    }

    /// The next `n` placements succeed server-side but the response is lost.
    pub fn drop_next_place_responses(&self, n: usize) {
        self.drop_place_responses.store(n, Ordering::SeqCst);
    }

    pub fn refuse_next_lookups(&self, n: usize) {
        self.refuse_lookups.store(n, Ordering::SeqCst);
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl BrokerClient for ScriptedBroker {
    async fn place(&self, request: PlaceOrderRequest) -> BrokerResult<PlaceOrderAck> {
        if Self::take(&self.refuse_places) {
            return Err(BrokerError::Transport("connection refused".into()));
        }
        let lost = Self::take(&self.drop_place_responses);
        match self.state.place_order(&request) {
            Ok((order, _created)) => {
                if lost {
                    return Err(BrokerError::Transport("response timed out".into()));
                }
                Ok(PlaceOrderAck {
                    order_id: order.order_id,
                    status: order.status,
                })
            }
            Err(status) => Err(BrokerError::from_status(status, "scripted failure".into())),
        }
    }

    async fn cancel(&self, order_id: &str) -> BrokerResult<()> {
        if self.state.cancel_order(order_id) {
            Ok(())
        } else {
            Err(BrokerError::Rejected(format!("order {order_id} not open")))
        }
    }

    async fn get_order_by_client_id(
        &self,
        client_order_id: &str,
    ) -> BrokerResult<Option<BrokerOrder>> {
        if Self::take(&self.refuse_lookups) {
            return Err(BrokerError::Transport("connection refused".into()));
        }
        Ok(self.state.get_order_by_client_id(client_order_id))
    }

    async fn list_open_orders(&self) -> BrokerResult<Vec<BrokerOrder>> {
        Ok(self.state.open_orders())
    }

    async fn positions(&self) -> BrokerResult<Vec<BrokerPosition>> {
        Ok(self.state.positions())
    }

    async fn account(&self) -> BrokerResult<BrokerAccount> {
        Ok(self.state.account())
    }

    async fn clock(&self) -> BrokerResult<BrokerClock> {
        Ok(BrokerClock {
            ts: Utc::now(),
            is_open: true,
        })
    }
}
