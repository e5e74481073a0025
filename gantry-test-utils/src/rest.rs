//! Mock broker REST surface (hyper).

use std::convert::Infallible;
use std::net::SocketAddr;

use anyhow::Result;
use chrono::Utc;
use gantry_broker::{PlaceOrderAck, PlaceOrderRequest};
use hyper::body::to_bytes;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::state::MockExchangeState;

pub struct MockRestApi {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl MockRestApi {
    pub async fn spawn(state: MockExchangeState) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        let std_listener = listener.into_std()?;
        std_listener.set_nonblocking(true)?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let make_svc = make_service_fn(move |_| {
            let state = state.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let state = state.clone();
                    async move { Ok::<_, Infallible>(route(req, state).await) }
                }))
            }
        });
        let server = Server::from_tcp(std_listener)?.serve(make_svc);
        let handle = tokio::spawn(async move {
            if let Err(err) = server
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
            {
                tracing::error!(error = %err, "mock REST server exited with error");
            }
        });
        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
            handle,
        })
    }

    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.handle.abort();
    }
}

impl Drop for MockRestApi {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.handle.abort();
    }
}

async fn route(req: Request<Body>, state: MockExchangeState) -> Response<Body> {
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();
    let body_bytes = match to_bytes(body).await {
        Ok(bytes) => bytes,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, format!("bad body: {err}")),
    };

    match (parts.method.clone(), path.as_str()) {
        (Method::POST, "/orders") => {
            let request: PlaceOrderRequest = match serde_json::from_slice(&body_bytes) {
                Ok(request) => request,
                Err(err) => {
                    return error_response(
                        StatusCode::UNPROCESSABLE_ENTITY,
                        format!("invalid payload: {err}"),
                    )
                }
            };
            if request.qty <= rust_decimal::Decimal::ZERO {
                return error_response(StatusCode::UNPROCESSABLE_ENTITY, "qty must be positive");
            }
            match state.place_order(&request) {
                Ok((order, _created)) => json_response(&PlaceOrderAck {
                    order_id: order.order_id,
                    status: order.status,
                }),
                Err(status) => error_response(
                    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                    "scripted failure",
                ),
            }
        }
        (Method::DELETE, path) if path.starts_with("/orders/") => {
            let order_id = path.trim_start_matches("/orders/");
            if state.cancel_order(order_id) {
                json_response(&json!({ "status": "canceled" }))
            } else {
                error_response(StatusCode::NOT_FOUND, "order not open")
            }
        }
        (Method::GET, "/orders/open") => json_response(&state.open_orders()),
        (Method::GET, "/orders") => {
            let query = parts.uri.query().unwrap_or_default();
            let client_order_id = query
                .split('&')
                .find_map(|pair| pair.strip_prefix("client_order_id="));
            match client_order_id.and_then(|cid| state.get_order_by_client_id(cid)) {
                Some(order) => json_response(&order),
                None => error_response(StatusCode::NOT_FOUND, "no such order"),
            }
        }
        (Method::GET, "/positions") => json_response(&state.positions()),
        (Method::GET, "/account") => json_response(&state.account()),
        (Method::GET, "/clock") => {
            json_response(&json!({ "ts": Utc::now(), "is_open": true }))
        }
        _ => error_response(StatusCode::NOT_FOUND, "unknown route"),
    }
}

fn json_response<T: serde::Serialize>(value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json")
            .body(Body::from(body))
            .unwrap(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(message.into()))
        .unwrap()
}
