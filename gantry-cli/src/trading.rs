//! The trading process runtime.
//!
//! Wires ingestion, the decision loop, the order lifecycle engine, the
//! reconciler, the broadcast bus, and the background workers together, and
//! drains everything on halt or signal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use gantry_broadcast::{BroadcastServer, BusPublisher, ChannelEvent, SnapshotSource};
use gantry_broker::rest::{BrokerCredentials, HttpBrokerConfig};
use gantry_broker::{BrokerClient, EventStream, HttpBroker};
use gantry_config::AppConfig;
use gantry_core::{
    Bar, Heartbeat, Intent, ProcessRole, RecordKind, Regime,
};
use gantry_execution::{
    spawn_ack_monitor, spawn_reconciler, spawn_zombie_monitor, EngineError, EngineTimeouts,
    EngineUpdate, OrderEngine, Reconciler, RetryPolicy,
};
use gantry_journal::Journal;
use gantry_portfolio::{Portfolio, PortfolioConfig, PositionSizer, SizeDecision};
use gantry_state::StateCache;
use gantry_strategy::{create_strategy, register_builtin_strategies, Strategy, StrategyContext};
use parking_lot::{Mutex, RwLock};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{error, info, warn};

use crate::alerts::AlertDispatcher;
use crate::bars::{BarSource, IdleBarSource, ReplayBarSource};
use crate::control::spawn_control_server;
use crate::shutdown::ShutdownSignal;
use crate::telemetry::Metrics;

/// How the trading process ended; main maps this to an exit code.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitOutcome {
    Normal,
    HaltSetOnStart,
    SupervisorTerminated,
}

pub async fn run_trading(config: AppConfig, shutdown: ShutdownSignal) -> Result<ExitOutcome> {
    let cache = StateCache::open(&config.storage.state_path)
        .context("failed to open live state cache")?;

    // A persistent halt flag blocks startup; only operator action clears it.
    let halt = cache.halt().context("failed to read halt flag")?;
    if halt.active {
        error!(reason = %halt.reason, set_by = %halt.set_by, "halt flag is set; refusing to trade");
        return Ok(ExitOutcome::HaltSetOnStart);
    }

    let journal =
        Journal::open(&config.storage.journal_path).context("failed to open journal")?;
    let portfolio_cfg = PortfolioConfig {
        initial_cash: config.portfolio.initial_cash,
        max_position_pct: config.portfolio.max_position_pct,
        target_position_pct: config.portfolio.target_position_pct,
    };
    let portfolio = Arc::new(Mutex::new(Portfolio::new(&portfolio_cfg)));
    let sizer = PositionSizer::new(&portfolio_cfg);

    let broker: Arc<HttpBroker> = Arc::new(
        HttpBroker::new(HttpBrokerConfig {
            rest_url: config.broker.rest_url.clone(),
            ws_url: config.broker.ws_url.clone(),
            credentials: BrokerCredentials {
                key_id: config.broker.trading.key_id.clone(),
                secret: config.broker.trading.secret.clone(),
            },
            request_timeout: Duration::from_secs(config.broker.request_timeout_secs),
            requests_per_second: config.broker.requests_per_second,
        })
        .context("failed to build broker client")?,
    );
    let broker_dyn: Arc<dyn BrokerClient> = broker.clone();

    let engine = OrderEngine::new(
        broker_dyn.clone(),
        journal.clone(),
        cache.clone(),
        portfolio.clone(),
        EngineTimeouts {
            t_ack: Duration::from_secs(config.engine.ack_timeout_secs),
            t_zombie: Duration::from_secs(config.engine.zombie_timeout_secs),
        },
        RetryPolicy {
            max_retries: config.engine.max_retries,
            ..RetryPolicy::default()
        },
    );

    // Adopt any orders that were working when the last run ended; the
    // reconciler resolves them against broker truth before trading resumes.
    let persisted = cache.open_orders().context("failed to read persisted orders")?;
    if !persisted.is_empty() {
        info!(count = persisted.len(), "adopting persisted open orders");
        engine.adopt_orders(persisted);
    }

    let reconciler = Arc::new(Reconciler::new(
        engine.clone(),
        broker_dyn.clone(),
        Duration::from_secs(config.engine.not_found_grace_secs),
    ));
    reconciler
        .sweep()
        .await
        .context("startup reconciliation failed")?;

    let metrics = Arc::new(Metrics::new());
    let alerts = AlertDispatcher::new(config.alerting.webhook_url.clone());
    write_pid_file(&config.trading.pid_file)?;

    let control_addr = config
        .trading
        .control_addr
        .parse()
        .context("invalid trading control_addr")?;
    let control_task = spawn_control_server(control_addr, metrics.registry(), cache.clone());

    // Broadcast bus.
    let marks: Arc<RwLock<HashMap<String, Bar>>> = Arc::new(RwLock::new(HashMap::new()));
    let broadcast_addr = config
        .trading
        .broadcast_addr
        .parse()
        .context("invalid broadcast_addr")?;
    let mut broadcast = BroadcastServer::spawn(
        broadcast_addr,
        Arc::new(EngineSnapshots {
            engine: engine.clone(),
            cache: cache.clone(),
            marks: marks.clone(),
        }),
    )
    .await
    .context("failed to start broadcast bus")?;
    let publisher = broadcast.publisher();

    // Background tasks.
    let reconcile_requests = engine
        .take_reconcile_requests()
        .expect("reconcile request channel already taken");
    let mut tasks = vec![
        spawn_reconciler(
            reconciler.clone(),
            Duration::from_secs(config.engine.reconcile_interval_secs),
            reconcile_requests,
            shutdown.watch(),
        ),
        spawn_ack_monitor(engine.clone(), shutdown.watch()),
        spawn_zombie_monitor(engine.clone(), shutdown.watch()),
        spawn_update_forwarder(
            engine.clone(),
            publisher.clone(),
            metrics.clone(),
            alerts.clone(),
        ),
        spawn_heartbeat_loop(
            cache.clone(),
            journal.clone(),
            Duration::from_secs(config.trading.heartbeat_interval_secs),
            shutdown.clone(),
        ),
        spawn_journal_flusher(journal.clone(), shutdown.clone()),
        spawn_etl_worker(
            config.storage.journal_path.clone(),
            config.storage.analytics_path.clone(),
            Duration::from_secs(config.trading.etl_interval_secs),
            shutdown.clone(),
        ),
        spawn_halt_watcher(cache.clone(), shutdown.clone()),
        spawn_stream_consumer(
            broker.clone(),
            engine.clone(),
            reconciler.clone(),
            shutdown.clone(),
        ),
    ];

    // Strategy.
    register_builtin_strategies();
    let params = json!({ "symbol": config.trading.symbols.first().cloned().unwrap_or_default() });
    let mut merged = params.as_object().cloned().unwrap_or_default();
    for (key, value) in &config.trading.strategy_params {
        merged.insert(key.clone(), value.clone());
    }
    let strategy = create_strategy(&config.trading.strategy, serde_json::Value::Object(merged))
        .map_err(|err| anyhow::anyhow!("failed to create strategy: {err}"))?;

    let mut bar_source: Box<dyn BarSource> = match &config.trading.bars_file {
        Some(path) => Box::new(ReplayBarSource::open(
            path,
            config.trading.replay_pace_ms.map(Duration::from_millis),
        )?),
        None => Box::new(IdleBarSource),
    };

    info!(
        symbols = ?config.trading.symbols,
        strategy = %config.trading.strategy,
        broadcast = %config.trading.broadcast_addr,
        "trading session started"
    );

    // Decision loop: serial regime -> strategy -> risk -> intent.
    let mut loop_state = DecisionLoop {
        engine: engine.clone(),
        journal: journal.clone(),
        cache: cache.clone(),
        portfolio,
        sizer,
        strategy,
        ctx: StrategyContext::new(config.trading.bar_history),
        publisher: publisher.clone(),
        metrics: metrics.clone(),
        marks,
    };
    loop {
        tokio::select! {
            bar = bar_source.next_bar() => {
                match bar {
                    Some(bar) => {
                        if let Err(err) = loop_state.on_bar(bar).await {
                            if matches!(err.downcast_ref::<EngineError>(), Some(EngineError::HaltRequested(_))) {
                                warn!("halt observed inside decision loop; draining");
                                break;
                            }
                            error!(error = %err, "decision tick failed");
                        }
                    }
                    None => {
                        info!("bar source exhausted; draining");
                        break;
                    }
                }
            }
            _ = shutdown.wait() => break,
        }
    }

    // Graceful drain: stop producing intents, flush, stop workers.
    shutdown.trigger();
    journal.flush().ok();
    for task in &mut tasks {
        task.abort();
    }
    control_task.abort();
    broadcast.shutdown().await;
    remove_pid_file(&config.trading.pid_file);

    let halt = cache.halt().unwrap_or_default();
    if halt.active && halt.set_by == "supervisor" {
        info!("exiting under supervisor-initiated halt");
        return Ok(ExitOutcome::SupervisorTerminated);
    }
    info!("trading session ended");
    Ok(ExitOutcome::Normal)
}

struct DecisionLoop {
    engine: Arc<OrderEngine>,
    journal: Journal,
    cache: StateCache,
    portfolio: Arc<Mutex<Portfolio>>,
    sizer: PositionSizer,
    strategy: Box<dyn Strategy>,
    ctx: StrategyContext,
    publisher: BusPublisher,
    metrics: Arc<Metrics>,
    marks: Arc<RwLock<HashMap<String, Bar>>>,
}

impl DecisionLoop {
    async fn on_bar(&mut self, bar: Bar) -> Result<()> {
        self.journal
            .record(RecordKind::Bar, serde_json::to_value(&bar)?)?;
        self.publisher.publish_market(
            &bar.symbol,
            json!({ "close": bar.close, "ts": bar.ts, "volume": bar.volume }),
        );
        self.marks.write().insert(bar.symbol.clone(), bar.clone());
        {
            let mut portfolio = self.portfolio.lock();
            portfolio.mark_price(&bar.symbol, bar.close, bar.ts);
        }
        self.ctx.push_bar(bar.clone());
        self.refresh_context();

        let regime = self.cache.regime()?.unwrap_or_else(Regime::default);
        if self.strategy.should_run(&regime) {
            let signals = self.strategy.produce_signals(&self.ctx);
            for signal in signals {
                self.journal
                    .record(RecordKind::Signal, serde_json::to_value(&signal)?)?;
                if let Some(intent) = self.size_signal(&signal)? {
                    self.journal
                        .record(RecordKind::Intent, serde_json::to_value(&intent)?)?;
                    self.metrics.inc_order();
                    match self.engine.submit(&intent).await {
                        Ok(handle) => {
                            info!(
                                order_id = %handle.order_id,
                                state = %handle.state,
                                "intent submitted"
                            );
                        }
                        Err(EngineError::HaltRequested(reason)) => {
                            return Err(EngineError::HaltRequested(reason).into());
                        }
                        Err(EngineError::BadRequest(reason)) => {
                            warn!(%reason, "intent rejected before placement");
                            self.metrics.inc_order_failure();
                        }
                        Err(err) => {
                            error!(error = %err, "submit failed");
                            self.metrics.inc_order_failure();
                        }
                    }
                }
            }
        }

        self.publish_equity().await?;
        Ok(())
    }

    fn refresh_context(&mut self) {
        let portfolio = self.portfolio.lock();
        self.ctx.update_positions(portfolio.positions());
        self.ctx.update_equity(portfolio.equity());
    }

    /// Risk bridge: signals become sized intents or are dropped.
    fn size_signal(&self, signal: &gantry_strategy::Signal) -> Result<Option<Intent>> {
        let portfolio = self.portfolio.lock();
        let side = signal.action.side();
        let qty = if signal.action.is_entry() {
            let Some(price) = portfolio.mark(&signal.symbol) else {
                warn!(symbol = %signal.symbol, "no mark price; dropping entry signal");
                return Ok(None);
            };
            match self.sizer.size_entry(&portfolio, &signal.symbol, side, price) {
                SizeDecision::Approved(qty) => qty,
                SizeDecision::Rejected(reason) => {
                    warn!(symbol = %signal.symbol, %reason, "entry signal rejected by sizer");
                    return Ok(None);
                }
            }
        } else {
            match portfolio.position(&signal.symbol) {
                Some(position) if !position.is_flat() => position.net_qty.abs(),
                _ => {
                    warn!(symbol = %signal.symbol, "exit signal with no position; dropping");
                    return Ok(None);
                }
            }
        };
        if qty <= Decimal::ZERO {
            return Ok(None);
        }
        Ok(Some(Intent {
            strategy_id: signal.strategy_id.clone(),
            signal_id: signal.id,
            symbol: signal.symbol.clone(),
            side,
            qty,
            order_type: gantry_core::OrderType::Market,
            limit_price: None,
            decision_ts: Utc::now(),
        }))
    }

    /// Journal the equity point and per-symbol position snapshots; mirror
    /// them into the cache for the supervisor and the bus.
    async fn publish_equity(&self) -> Result<()> {
        let (point, positions) = {
            let portfolio = self.portfolio.lock();
            (portfolio.equity_point(Utc::now()), portfolio.positions())
        };
        self.journal.record(
            RecordKind::Metric,
            json!({
                "name": "equity",
                "equity": point.equity,
                "cash": point.cash,
                "positions_value": point.positions_value,
            }),
        )?;
        for position in &positions {
            self.journal.record(
                RecordKind::Metric,
                json!({
                    "name": "position",
                    "symbol": position.symbol,
                    "net_qty": position.net_qty,
                    "avg_cost": position.avg_cost,
                    "unrealized_pnl": position.unrealized_pnl,
                }),
            )?;
            self.cache.set_position(position)?;
        }
        self.cache.set_equity(&point)?;
        self.metrics
            .update_equity(point.equity.to_f64().unwrap_or(0.0));
        self.publisher.publish(ChannelEvent::new(
            "equity",
            serde_json::to_value(&point)?,
        ));
        Ok(())
    }
}

struct EngineSnapshots {
    engine: Arc<OrderEngine>,
    cache: StateCache,
    marks: Arc<RwLock<HashMap<String, Bar>>>,
}

#[async_trait]
impl SnapshotSource for EngineSnapshots {
    async fn current(&self, channels: &[String]) -> HashMap<String, serde_json::Value> {
        let mut out = HashMap::new();
        for channel in channels {
            let value = match channel.as_str() {
                "positions" => serde_json::to_value(self.cache.positions().unwrap_or_default())
                    .unwrap_or_default(),
                "orders" => {
                    let snapshot = self.engine.snapshot().await;
                    let open: Vec<_> = snapshot
                        .orders
                        .into_iter()
                        .filter(|order| !order.is_terminal())
                        .collect();
                    serde_json::to_value(open).unwrap_or_default()
                }
                "equity" => serde_json::to_value(self.cache.equity().ok().flatten())
                    .unwrap_or_default(),
                "regime" => serde_json::to_value(self.cache.regime().ok().flatten())
                    .unwrap_or_default(),
                "health" => json!({
                    "halt": self.cache.halt().unwrap_or_default(),
                    "trading_heartbeat": self.cache.heartbeat(ProcessRole::Trading).ok().flatten(),
                    "supervisor_heartbeat": self.cache.heartbeat(ProcessRole::Supervisor).ok().flatten(),
                }),
                market if market.starts_with("market:") => {
                    let symbol = market.trim_start_matches("market:");
                    serde_json::to_value(self.marks.read().get(symbol)).unwrap_or_default()
                }
                _ => serde_json::Value::Null,
            };
            out.insert(channel.clone(), value);
        }
        out
    }
}

/// Forward committed engine updates onto the bus and into metrics. Runs
/// after journal and cache writes by construction: the engine only emits
/// once a change is committed.
fn spawn_update_forwarder(
    engine: Arc<OrderEngine>,
    publisher: BusPublisher,
    metrics: Arc<Metrics>,
    alerts: AlertDispatcher,
) -> tokio::task::JoinHandle<()> {
    let mut updates = engine.subscribe();
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(EngineUpdate::Order(order)) => {
                    metrics.inc_transition(&order.state.to_string());
                    if matches!(
                        order.state,
                        gantry_core::OrderState::Rejected | gantry_core::OrderState::Failed
                    ) {
                        metrics.inc_order_failure();
                    }
                    metrics.inc_broadcast();
                    let payload = serde_json::to_value(&order).unwrap_or_default();
                    publisher.publish(ChannelEvent::new("orders", payload));
                }
                Ok(EngineUpdate::Fill { order, fill }) => {
                    metrics.inc_fill();
                    metrics.inc_broadcast();
                    publisher.publish(ChannelEvent::new(
                        "orders",
                        json!({
                            "order_id": order.order_id,
                            "fill": fill,
                            "filled_qty": order.filled_qty,
                            "state": order.state,
                        }),
                    ));
                }
                Ok(EngineUpdate::Position(position)) => {
                    metrics.inc_broadcast();
                    let payload = serde_json::to_value(&position).unwrap_or_default();
                    publisher.publish(ChannelEvent::new("positions", payload));
                }
                Ok(EngineUpdate::Equity(point)) => {
                    metrics.update_equity(point.equity.to_f64().unwrap_or(0.0));
                    metrics.inc_broadcast();
                    let payload = serde_json::to_value(&point).unwrap_or_default();
                    publisher.publish(ChannelEvent::new("equity", payload));
                }
                Ok(EngineUpdate::Alarm { code, message }) => {
                    metrics.inc_broadcast();
                    publisher.publish(ChannelEvent::new(
                        "health",
                        json!({ "alarm": code, "message": message }),
                    ));
                    alerts.notify(code, &message).await;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "update forwarder lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn spawn_heartbeat_loop(
    cache: StateCache,
    journal: Journal,
    interval: Duration,
    shutdown: ShutdownSignal,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut seq = 0u64;
        while shutdown.sleep(interval).await {
            seq += 1;
            let heartbeat = Heartbeat {
                process_id: std::process::id(),
                role: ProcessRole::Trading,
                ts: Utc::now(),
                seq,
            };
            if let Err(err) = cache.set_heartbeat(&heartbeat) {
                error!(error = %err, "failed to write heartbeat");
            }
            if let Err(err) = journal.record(
                RecordKind::Heartbeat,
                json!({ "role": "trading", "seq": seq }),
            ) {
                error!(error = %err, "failed to journal heartbeat");
            }
        }
    })
}

fn spawn_journal_flusher(journal: Journal, shutdown: ShutdownSignal) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while shutdown.sleep(Duration::from_millis(100)).await {
            if let Err(err) = journal.flush() {
                error!(error = %err, "journal flush failed");
            }
        }
        journal.flush().ok();
    })
}

fn spawn_etl_worker(
    journal_path: std::path::PathBuf,
    analytics_path: std::path::PathBuf,
    interval: Duration,
    shutdown: ShutdownSignal,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while shutdown.sleep(interval).await {
            let journal_path = journal_path.clone();
            let analytics_path = analytics_path.clone();
            let result = tokio::task::spawn_blocking(move || {
                gantry_data::Pipeline::new(journal_path, analytics_path).run_once()
            })
            .await;
            match result {
                Ok(Ok(summary)) => {
                    info!(
                        orders = summary.orders,
                        fills = summary.fills,
                        bars = summary.bars,
                        "etl pass complete"
                    );
                }
                Ok(Err(err)) => error!(error = %err, "etl pass failed"),
                Err(err) => error!(error = %err, "etl task panicked"),
            }
        }
    })
}

/// Observes the halt flag; the decision loop stops generating intents as
/// soon as it flips.
fn spawn_halt_watcher(cache: StateCache, shutdown: ShutdownSignal) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while shutdown.sleep(Duration::from_secs(1)).await {
            match cache.halt() {
                Ok(halt) if halt.active => {
                    warn!(reason = %halt.reason, set_by = %halt.set_by, "halt flag observed");
                    shutdown.trigger();
                    break;
                }
                Ok(_) => {}
                Err(err) => error!(error = %err, "failed to poll halt flag"),
            }
        }
    })
}

/// Single reader of the broker event stream. On reconnect it resubscribes
/// from the last seen sequence and runs a full reconciliation before
/// resuming normal processing.
fn spawn_stream_consumer(
    broker: Arc<HttpBroker>,
    engine: Arc<OrderEngine>,
    reconciler: Arc<Reconciler>,
    shutdown: ShutdownSignal,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_seq: Option<u64> = None;
        let mut first_connect = true;
        loop {
            if shutdown.triggered() {
                break;
            }
            let url = broker.stream_url(last_seq);
            let mut stream = match EventStream::connect(&url).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(error = %err, "broker stream connect failed");
                    if !shutdown.sleep(Duration::from_secs(1)).await {
                        break;
                    }
                    continue;
                }
            };
            if !first_connect {
                info!("broker stream reconnected; reconciling before resuming");
                if let Err(err) = reconciler.sweep().await {
                    error!(error = %err, "post-reconnect reconciliation failed");
                }
            }
            first_connect = false;

            loop {
                tokio::select! {
                    event = stream.next_event() => {
                        match event {
                            Ok(Some(event)) => {
                                last_seq = Some(event.seq);
                                if let Err(err) = engine.on_broker_event(event).await {
                                    error!(error = %err, "broker event dispatch failed");
                                }
                            }
                            Ok(None) => {
                                warn!("broker stream closed");
                                break;
                            }
                            Err(err) => {
                                warn!(error = %err, "broker stream error");
                                break;
                            }
                        }
                    }
                    _ = shutdown.wait() => return,
                }
            }
            if !shutdown.sleep(Duration::from_secs(1)).await {
                break;
            }
        }
    })
}

fn write_pid_file(path: &std::path::Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, std::process::id().to_string())
        .with_context(|| format!("failed to write pid file {}", path.display()))
}

fn remove_pid_file(path: &std::path::Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(error = %err, "failed to remove pid file");
        }
    }
}
