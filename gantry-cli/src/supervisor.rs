//! Supervisor process wiring.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use gantry_broker::rest::{BrokerCredentials, HttpBrokerConfig};
use gantry_broker::{BrokerClient, HttpBroker};
use gantry_config::AppConfig;
use gantry_journal::Journal;
use gantry_state::StateCache;
use gantry_supervisor::{ShutdownActuator, Supervisor, SupervisorSettings};
use tracing::info;

use crate::alerts::AlertDispatcher;
use crate::control::spawn_control_server;
use crate::shutdown::ShutdownSignal;
use crate::telemetry::Metrics;

pub async fn run_supervisor(config: AppConfig, shutdown: ShutdownSignal) -> Result<()> {
    let cache = StateCache::open(&config.storage.state_path)
        .context("failed to open live state cache")?;
    let journal =
        Journal::open(&config.storage.journal_path).context("failed to open journal")?;

    // The supervisor holds its own credential pair; it never shares a
    // broker session with the trading process.
    let broker: Arc<dyn BrokerClient> = Arc::new(
        HttpBroker::new(HttpBrokerConfig {
            rest_url: config.broker.rest_url.clone(),
            ws_url: config.broker.ws_url.clone(),
            credentials: BrokerCredentials {
                key_id: config.broker.supervisor.key_id.clone(),
                secret: config.broker.supervisor.secret.clone(),
            },
            request_timeout: Duration::from_secs(config.broker.request_timeout_secs),
            requests_per_second: config.broker.requests_per_second,
        })
        .context("failed to build supervisor broker client")?,
    );

    let metrics = Metrics::new();
    let control_addr = config
        .supervisor
        .control_addr
        .parse()
        .context("invalid supervisor control_addr")?;
    let control_task = spawn_control_server(control_addr, metrics.registry(), cache.clone());

    let alerts = Arc::new(AlertDispatcher::new(config.alerting.webhook_url.clone()));
    let actuator = ShutdownActuator::new(
        broker.clone(),
        cache.clone(),
        journal.clone(),
        config.trading.pid_file.clone(),
        Duration::from_secs(config.supervisor.grace_secs),
    );
    let supervisor = Supervisor::new(
        broker,
        cache,
        journal,
        actuator,
        alerts,
        SupervisorSettings {
            check_interval: Duration::from_secs(config.supervisor.check_interval_secs),
        },
    );

    info!("supervisor process started");
    supervisor.run(shutdown.watch()).await?;
    control_task.abort();
    Ok(())
}
