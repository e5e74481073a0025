//! Tracing installation and Prometheus metrics.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use prometheus::{Gauge, IntCounter, IntCounterVec, IntGauge, Registry};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global tracing subscriber with optional JSON file logging.
pub fn init_tracing(filter: &str, log_path: Option<&Path>) -> Result<()> {
    let stdout_layer = fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::new(filter));
    if let Some(path) = log_path {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {dir:?}"))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        let (writer, guard) = tracing_appender::non_blocking(file);
        let _ = FILE_GUARD.set(guard);
        let file_layer = fmt::layer()
            .json()
            .with_ansi(false)
            .with_target(true)
            .with_writer(writer)
            .with_filter(EnvFilter::new(filter));
        tracing_subscriber::registry()
            .with(stdout_layer)
            .with(file_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry().with(stdout_layer).try_init()?;
    }
    Ok(())
}

/// Prometheus metrics shared by both processes.
pub struct Metrics {
    registry: Registry,
    orders_total: IntCounter,
    order_failures: IntCounter,
    transitions: IntCounterVec,
    fills_total: IntCounter,
    equity_gauge: Gauge,
    heartbeat_age: Gauge,
    open_orders: IntGauge,
    reconcile_divergences: IntCounter,
    kill_rule_breaches: IntCounterVec,
    broadcast_events: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let orders_total =
            IntCounter::new("gantry_orders_total", "Orders submitted to the engine").unwrap();
        let order_failures = IntCounter::new(
            "gantry_order_failures_total",
            "Orders ending REJECTED or FAILED",
        )
        .unwrap();
        let transitions = IntCounterVec::new(
            prometheus::Opts::new(
                "gantry_order_transitions_total",
                "Order state transitions by target state",
            ),
            &["state"],
        )
        .unwrap();
        let fills_total =
            IntCounter::new("gantry_fills_total", "Fill events applied").unwrap();
        let equity_gauge =
            Gauge::new("gantry_equity", "Current portfolio equity").unwrap();
        let heartbeat_age = Gauge::new(
            "gantry_trading_heartbeat_age_seconds",
            "Age of the trading process heartbeat",
        )
        .unwrap();
        let open_orders =
            IntGauge::new("gantry_open_orders", "Orders currently working").unwrap();
        let reconcile_divergences = IntCounter::new(
            "gantry_reconcile_divergences_total",
            "Position divergences corrected from broker truth",
        )
        .unwrap();
        let kill_rule_breaches = IntCounterVec::new(
            prometheus::Opts::new("gantry_kill_rule_breaches_total", "Kill rules tripped"),
            &["rule"],
        )
        .unwrap();
        let broadcast_events = IntCounter::new(
            "gantry_broadcast_events_total",
            "Events published to the broadcast bus",
        )
        .unwrap();

        registry.register(Box::new(orders_total.clone())).unwrap();
        registry.register(Box::new(order_failures.clone())).unwrap();
        registry.register(Box::new(transitions.clone())).unwrap();
        registry.register(Box::new(fills_total.clone())).unwrap();
        registry.register(Box::new(equity_gauge.clone())).unwrap();
        registry.register(Box::new(heartbeat_age.clone())).unwrap();
        registry.register(Box::new(open_orders.clone())).unwrap();
        registry
            .register(Box::new(reconcile_divergences.clone()))
            .unwrap();
        registry
            .register(Box::new(kill_rule_breaches.clone()))
            .unwrap();
        registry
            .register(Box::new(broadcast_events.clone()))
            .unwrap();

        Self {
            registry,
            orders_total,
            order_failures,
            transitions,
            fills_total,
            equity_gauge,
            heartbeat_age,
            open_orders,
            reconcile_divergences,
            kill_rule_breaches,
            broadcast_events,
        }
    }

    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    pub fn inc_order(&self) {
        self.orders_total.inc();
    }

    pub fn inc_order_failure(&self) {
        self.order_failures.inc();
    }

    pub fn inc_transition(&self, state: &str) {
        self.transitions.with_label_values(&[state]).inc();
    }

    pub fn inc_fill(&self) {
        self.fills_total.inc();
    }

    pub fn update_equity(&self, equity: f64) {
        self.equity_gauge.set(equity);
    }

    pub fn update_heartbeat_age(&self, seconds: f64) {
        self.heartbeat_age.set(seconds);
    }

    pub fn update_open_orders(&self, count: i64) {
        self.open_orders.set(count);
    }

    pub fn inc_divergence(&self) {
        self.reconcile_divergences.inc();
    }

    pub fn inc_kill_rule(&self, rule: &str) {
        self.kill_rule_breaches.with_label_values(&[rule]).inc();
    }

    pub fn inc_broadcast(&self) {
        self.broadcast_events.inc();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
