//! REST implementation of [`BrokerClient`] over the paper broker's HTTP API.

use std::time::Duration;

use async_trait::async_trait;
use gantry_core::{BrokerAccount, BrokerOrder, BrokerPosition};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::{
    BrokerClient, BrokerClock, BrokerError, BrokerResult, PlaceOrderAck, PlaceOrderRequest,
    RequestLimiter,
};

/// Credentials for one broker session. The trading process and the
/// supervisor each hold their own pair; they never share a session.
#[derive(Clone, Debug)]
pub struct BrokerCredentials {
    pub key_id: String,
    pub secret: String,
}

/// Configuration for [`HttpBroker`].
#[derive(Clone, Debug)]
pub struct HttpBrokerConfig {
    pub rest_url: String,
    pub ws_url: String,
    pub credentials: BrokerCredentials,
    /// Deadline applied to every REST call.
    pub request_timeout: Duration,
    /// Outbound request budget per second.
    pub requests_per_second: u32,
}

/// reqwest-backed broker client.
pub struct HttpBroker {
    http: Client,
    config: HttpBrokerConfig,
    limiter: RequestLimiter,
}

impl HttpBroker {
    pub fn new(config: HttpBrokerConfig) -> BrokerResult<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| BrokerError::Transport(err.to_string()))?;
        let limiter = RequestLimiter::per_second(config.requests_per_second);
        Ok(Self {
            http,
            config,
            limiter,
        })
    }

    /// Stream URL with resume position for the event pump.
    #[must_use]
    pub fn stream_url(&self, resume_from: Option<u64>) -> String {
        match resume_from {
            Some(seq) => format!("{}/stream?from_seq={}", self.config.ws_url, seq + 1),
            None => format!("{}/stream", self.config.ws_url),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.config.rest_url, path);
        self.http
            .request(method, url)
            .header("X-Api-Key-Id", &self.config.credentials.key_id)
            .bearer_auth(&self.config.credentials.secret)
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> BrokerResult<T> {
        self.limiter.acquire().await;
        let response = builder
            .send()
            .await
            .map_err(map_transport_error)?;
        decode_response(response).await
    }
}

fn map_transport_error(err: reqwest::Error) -> BrokerError {
    BrokerError::Transport(err.to_string())
}

async fn decode_response<T: DeserializeOwned>(response: Response) -> BrokerResult<T> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|err| BrokerError::Serialization(err.to_string()));
    }
    let body = response.text().await.unwrap_or_default();
    Err(BrokerError::from_status(status.as_u16(), body))
}

#[async_trait]
impl BrokerClient for HttpBroker {
    async fn place(&self, request: PlaceOrderRequest) -> BrokerResult<PlaceOrderAck> {
        debug!(
            client_order_id = %request.client_order_id,
            symbol = %request.symbol,
            "placing order"
        );
        self.send(self.request(Method::POST, "/orders").json(&request))
            .await
    }

    async fn cancel(&self, order_id: &str) -> BrokerResult<()> {
        self.limiter.acquire().await;
        let response = self
            .request(Method::DELETE, &format!("/orders/{order_id}"))
            .send()
            .await
            .map_err(map_transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(BrokerError::from_status(status.as_u16(), body))
    }

    async fn get_order_by_client_id(
        &self,
        client_order_id: &str,
    ) -> BrokerResult<Option<BrokerOrder>> {
        self.limiter.acquire().await;
        let response = self
            .request(Method::GET, "/orders")
            .query(&[("client_order_id", client_order_id)])
            .send()
            .await
            .map_err(map_transport_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode_response(response).await.map(Some)
    }

    async fn list_open_orders(&self) -> BrokerResult<Vec<BrokerOrder>> {
        self.send(self.request(Method::GET, "/orders/open")).await
    }

    async fn positions(&self) -> BrokerResult<Vec<BrokerPosition>> {
        self.send(self.request(Method::GET, "/positions")).await
    }

    async fn account(&self) -> BrokerResult<BrokerAccount> {
        self.send(self.request(Method::GET, "/account")).await
    }

    async fn clock(&self) -> BrokerResult<BrokerClock> {
        self.send(self.request(Method::GET, "/clock")).await
    }
}
