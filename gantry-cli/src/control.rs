//! Per-process control server: metrics, health, and the emergency halt
//! endpoint.

use std::convert::Infallible;
use std::net::SocketAddr;

use gantry_core::{HaltFlag, ProcessRole};
use gantry_state::StateCache;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use prometheus::{Encoder, Registry, TextEncoder};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Launch the control server. `POST /system/emergency-halt` is idempotent:
/// it sets the halt flag and reports the prior state.
pub fn spawn_control_server(
    addr: SocketAddr,
    registry: Registry,
    cache: StateCache,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let make_svc = make_service_fn(move |_| {
            let registry = registry.clone();
            let cache = cache.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let registry = registry.clone();
                    let cache = cache.clone();
                    async move { Ok::<_, Infallible>(route(req, &registry, &cache)) }
                }))
            }
        });
        info!(%addr, "control server listening");
        if let Err(err) = hyper::Server::bind(&addr).serve(make_svc).await {
            error!(error = %err, %addr, "control server terminated");
        }
    })
}

fn route(req: Request<Body>, registry: &Registry, cache: &StateCache) -> Response<Body> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => metrics_response(registry),
        (&Method::GET, "/health") => health_response(cache),
        (&Method::POST, "/system/emergency-halt") => halt_response(cache),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("not found"))
            .unwrap(),
    }
}

fn metrics_response(registry: &Registry) -> Response<Body> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %err, "failed to encode Prometheus metrics");
        return Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::from("failed to encode metrics"))
            .unwrap();
    }
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", encoder.format_type())
        .body(Body::from(buffer))
        .unwrap()
}

fn health_response(cache: &StateCache) -> Response<Body> {
    let halt = cache.halt().unwrap_or_default();
    let trading_hb = cache.heartbeat(ProcessRole::Trading).ok().flatten();
    let supervisor_hb = cache.heartbeat(ProcessRole::Supervisor).ok().flatten();
    let body = json!({
        "halt": halt,
        "heartbeats": {
            "trading": trading_hb,
            "supervisor": supervisor_hb,
        },
    });
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn halt_response(cache: &StateCache) -> Response<Body> {
    let already = match cache.halt() {
        Ok(halt) => halt.active,
        Err(err) => {
            error!(error = %err, "failed to read halt flag");
            return Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::from("halt flag unreadable"))
                .unwrap();
        }
    };
    if !already {
        let halt = HaltFlag::raised("operator emergency halt", "operator");
        if let Err(err) = cache.set_halt(&halt) {
            error!(error = %err, "failed to set halt flag");
            return Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::from("halt flag not persisted"))
                .unwrap();
        }
        warn!("emergency halt set via control endpoint");
    }
    let body = json!({ "status": "halted", "already_halted": already });
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}
