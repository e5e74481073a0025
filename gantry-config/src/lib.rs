//! Layered configuration loading utilities.
//!
//! Sources, later ones overriding earlier: `config/default.toml`,
//! `config/{env}.toml`, then `GANTRY_*` environment variables
//! (`GANTRY_BROKER__REST_URL=…`). Trading and supervisor credentials are
//! distinct sections; the two processes never share a broker session.

use std::collections::HashMap;
use std::path::PathBuf;

use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;

/// Root application configuration deserialized from layered sources.
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub portfolio: PortfolioSection,
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub alerting: AlertingConfig,
}

/// Storage roots for the three substrates; separately configurable.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_journal_path")]
    pub journal_path: PathBuf,
    #[serde(default = "default_analytics_path")]
    pub analytics_path: PathBuf,
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub trading: CredentialsConfig,
    #[serde(default)]
    pub supervisor: CredentialsConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CredentialsConfig {
    #[serde(default)]
    pub key_id: String,
    #[serde(default)]
    pub secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,
    #[serde(default = "default_zombie_timeout_secs")]
    pub zombie_timeout_secs: u64,
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_not_found_grace_secs")]
    pub not_found_grace_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PortfolioSection {
    #[serde(default = "default_initial_cash")]
    pub initial_cash: Decimal,
    #[serde(default = "default_max_position_pct")]
    pub max_position_pct: Decimal,
    #[serde(default = "default_target_position_pct")]
    pub target_position_pct: Decimal,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TradingConfig {
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
    #[serde(default = "default_strategy_name")]
    pub strategy: String,
    /// Opaque parameters forwarded to the strategy factory.
    #[serde(default)]
    pub strategy_params: HashMap<String, serde_json::Value>,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_bar_history")]
    pub bar_history: usize,
    /// Optional JSONL bar file replayed into the decision loop. Absent
    /// means an external feeder owns ingestion.
    #[serde(default)]
    pub bars_file: Option<PathBuf>,
    #[serde(default)]
    pub replay_pace_ms: Option<u64>,
    #[serde(default = "default_broadcast_addr")]
    pub broadcast_addr: String,
    #[serde(default = "default_trading_control_addr")]
    pub control_addr: String,
    #[serde(default = "default_etl_interval_secs")]
    pub etl_interval_secs: u64,
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
    #[serde(default = "default_trading_log_path")]
    pub log_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
    #[serde(default = "default_supervisor_control_addr")]
    pub control_addr: String,
    #[serde(default = "default_supervisor_log_path")]
    pub log_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AlertingConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            journal_path: default_journal_path(),
            analytics_path: default_analytics_path(),
            state_path: default_state_path(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            rest_url: default_rest_url(),
            ws_url: default_ws_url(),
            requests_per_second: default_requests_per_second(),
            request_timeout_secs: default_request_timeout_secs(),
            trading: CredentialsConfig::default(),
            supervisor: CredentialsConfig::default(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ack_timeout_secs: default_ack_timeout_secs(),
            zombie_timeout_secs: default_zombie_timeout_secs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            not_found_grace_secs: default_not_found_grace_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for PortfolioSection {
    fn default() -> Self {
        Self {
            initial_cash: default_initial_cash(),
            max_position_pct: default_max_position_pct(),
            target_position_pct: default_target_position_pct(),
        }
    }
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            strategy: default_strategy_name(),
            strategy_params: HashMap::new(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            bar_history: default_bar_history(),
            bars_file: None,
            replay_pace_ms: None,
            broadcast_addr: default_broadcast_addr(),
            control_addr: default_trading_control_addr(),
            etl_interval_secs: default_etl_interval_secs(),
            pid_file: default_pid_file(),
            log_path: default_trading_log_path(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            grace_secs: default_grace_secs(),
            control_addr: default_supervisor_control_addr(),
            log_path: default_supervisor_log_path(),
        }
    }
}

/// Load configuration for the given environment name.
pub fn load_config(env: &str) -> Result<AppConfig, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(File::with_name(&format!("config/{env}")).required(false))
        .add_source(Environment::with_prefix("GANTRY").separator("__"));
    builder.build()?.try_deserialize()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_journal_path() -> PathBuf {
    PathBuf::from("./data/journal")
}

fn default_analytics_path() -> PathBuf {
    PathBuf::from("./data/lake")
}

fn default_state_path() -> PathBuf {
    PathBuf::from("./data/state")
}

fn default_rest_url() -> String {
    "http://127.0.0.1:7100".into()
}

fn default_ws_url() -> String {
    "ws://127.0.0.1:7101".into()
}

fn default_requests_per_second() -> u32 {
    8
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_ack_timeout_secs() -> u64 {
    3
}

fn default_zombie_timeout_secs() -> u64 {
    300
}

fn default_reconcile_interval_secs() -> u64 {
    30
}

fn default_not_found_grace_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_cash() -> Decimal {
    Decimal::from(100_000)
}

fn default_max_position_pct() -> Decimal {
    Decimal::new(10, 2)
}

fn default_target_position_pct() -> Decimal {
    Decimal::new(5, 2)
}

fn default_symbols() -> Vec<String> {
    vec!["AAPL".into()]
}

fn default_strategy_name() -> String {
    "sma-crossover".into()
}

fn default_heartbeat_interval_secs() -> u64 {
    5
}

fn default_bar_history() -> usize {
    512
}

fn default_broadcast_addr() -> String {
    "127.0.0.1:8200".into()
}

fn default_trading_control_addr() -> String {
    "127.0.0.1:9100".into()
}

fn default_etl_interval_secs() -> u64 {
    300
}

fn default_pid_file() -> PathBuf {
    PathBuf::from("./data/trading.pid")
}

fn default_trading_log_path() -> PathBuf {
    PathBuf::from("./logs/trading.json")
}

fn default_check_interval_secs() -> u64 {
    5
}

fn default_grace_secs() -> u64 {
    10
}

fn default_supervisor_control_addr() -> String {
    "127.0.0.1:9101".into()
}

fn default_supervisor_log_path() -> PathBuf {
    PathBuf::from("./logs/supervisor.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_section() {
        let config = load_config("nonexistent-env").expect("defaults should satisfy the schema");
        assert_eq!(config.engine.ack_timeout_secs, 3);
        assert_eq!(config.engine.zombie_timeout_secs, 300);
        assert_eq!(config.supervisor.check_interval_secs, 5);
        assert_eq!(config.portfolio.initial_cash, Decimal::from(100_000));
        assert!(config.broker.trading.key_id.is_empty());
    }
}
