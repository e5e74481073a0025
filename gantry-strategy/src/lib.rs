//! Strategy trait definitions, shared context, and the static registry.
//!
//! Strategies are deliberately narrow: they observe market context and emit
//! signals. Sizing, risk, and order placement belong to the decision loop
//! downstream; a strategy can never touch the broker.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use gantry_core::{Bar, Position, Price, Regime, Side, Symbol, TrendRegime, VolRegime};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Result alias used within strategy implementations.
pub type StrategyResult<T> = Result<T, StrategyError>;

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("configuration is invalid: {0}")]
    InvalidConfig(String),
    #[error("unknown strategy '{0}'")]
    UnknownStrategy(String),
}

/// What a signal instructs the decision loop to do.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalAction {
    EnterLong,
    ExitLong,
    EnterShort,
    ExitShort,
}

impl SignalAction {
    /// Side of the order that realizes this action.
    #[must_use]
    pub fn side(self) -> Side {
        match self {
            Self::EnterLong | Self::ExitShort => Side::Buy,
            Self::EnterShort | Self::ExitLong => Side::Sell,
        }
    }

    /// Entries get sized by the risk bridge; exits close what exists.
    #[must_use]
    pub fn is_entry(self) -> bool {
        matches!(self, Self::EnterLong | Self::EnterShort)
    }
}

/// High-level trading signal emitted by a strategy.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Signal {
    pub id: Uuid,
    pub strategy_id: String,
    pub symbol: Symbol,
    pub action: SignalAction,
    pub generated_at: DateTime<Utc>,
}

impl Signal {
    #[must_use]
    pub fn new(strategy_id: &str, symbol: impl Into<Symbol>, action: SignalAction) -> Self {
        Self {
            id: Uuid::new_v4(),
            strategy_id: strategy_id.to_string(),
            symbol: symbol.into(),
            action,
            generated_at: Utc::now(),
        }
    }
}

/// Immutable view of recent market data and portfolio state shared with
/// strategies.
pub struct StrategyContext {
    bars: HashMap<Symbol, VecDeque<Bar>>,
    positions: Vec<Position>,
    equity: Price,
    max_history: usize,
}

impl StrategyContext {
    #[must_use]
    pub fn new(max_history: usize) -> Self {
        Self {
            bars: HashMap::new(),
            positions: Vec::new(),
            equity: Decimal::ZERO,
            max_history: max_history.max(1),
        }
    }

    /// Push a bar while respecting the configured history size.
    pub fn push_bar(&mut self, bar: Bar) {
        let series = self.bars.entry(bar.symbol.clone()).or_default();
        if series.len() >= self.max_history {
            series.pop_front();
        }
        series.push_back(bar);
    }

    pub fn update_positions(&mut self, positions: Vec<Position>) {
        self.positions = positions;
    }

    pub fn update_equity(&mut self, equity: Price) {
        self.equity = equity;
    }

    #[must_use]
    pub fn bars(&self, symbol: &str) -> Option<&VecDeque<Bar>> {
        self.bars.get(symbol)
    }

    #[must_use]
    pub fn last_close(&self, symbol: &str) -> Option<Price> {
        self.bars.get(symbol).and_then(|series| series.back()).map(|bar| bar.close)
    }

    #[must_use]
    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.iter().find(|p| p.symbol == symbol)
    }

    #[must_use]
    pub fn equity(&self) -> Price {
        self.equity
    }
}

impl Default for StrategyContext {
    fn default() -> Self {
        Self::new(512)
    }
}

/// The capability every strategy implements.
pub trait Strategy: Send + Sync {
    /// Identifier used in logs, journals, and idempotency keys.
    fn name(&self) -> &str;

    /// Symbols this strategy wants routed to it.
    fn subscriptions(&self) -> Vec<Symbol>;

    /// Whether the strategy trades under the given regime.
    fn should_run(&self, regime: &Regime) -> bool;

    /// Observe the context and emit zero or more signals.
    fn produce_signals(&mut self, ctx: &StrategyContext) -> Vec<Signal>;
}

type StrategyFactory =
    Arc<dyn Fn(serde_json::Value) -> StrategyResult<Box<dyn Strategy>> + Send + Sync>;

static REGISTRY: Lazy<RwLock<HashMap<String, StrategyFactory>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Register a strategy factory under `name`. Later registrations replace
/// earlier ones.
pub fn register_strategy<F>(name: &str, factory: F)
where
    F: Fn(serde_json::Value) -> StrategyResult<Box<dyn Strategy>> + Send + Sync + 'static,
{
    REGISTRY
        .write()
        .insert(name.to_string(), Arc::new(factory));
}

/// Instantiate a registered strategy with its configuration parameters.
pub fn create_strategy(name: &str, params: serde_json::Value) -> StrategyResult<Box<dyn Strategy>> {
    let factory = {
        let registry = REGISTRY.read();
        registry.get(name).cloned()
    };
    match factory {
        Some(factory) => factory(params),
        None => Err(StrategyError::UnknownStrategy(name.to_string())),
    }
}

/// Names of every registered strategy.
#[must_use]
pub fn registered_strategies() -> Vec<String> {
    let mut names: Vec<String> = REGISTRY.read().keys().cloned().collect();
    names.sort();
    names
}

/// Register the strategies that ship with the workspace.
pub fn register_builtin_strategies() {
    register_strategy("sma-crossover", |params| {
        let config: SmaCrossoverConfig = serde_json::from_value(params)
            .map_err(|err| StrategyError::InvalidConfig(err.to_string()))?;
        Ok(Box::new(SmaCrossover::new(config)?))
    });
}

/// Configuration for the reference crossover strategy.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SmaCrossoverConfig {
    pub symbol: Symbol,
    #[serde(default = "SmaCrossoverConfig::default_fast")]
    pub fast: usize,
    #[serde(default = "SmaCrossoverConfig::default_slow")]
    pub slow: usize,
}

impl SmaCrossoverConfig {
    fn default_fast() -> usize {
        10
    }

    fn default_slow() -> usize {
        30
    }
}

/// Reference momentum strategy: long when the fast SMA crosses above the
/// slow SMA, flat when it crosses back below.
pub struct SmaCrossover {
    config: SmaCrossoverConfig,
    was_above: Option<bool>,
}

impl SmaCrossover {
    pub fn new(config: SmaCrossoverConfig) -> StrategyResult<Self> {
        if config.fast == 0 || config.slow <= config.fast {
            return Err(StrategyError::InvalidConfig(format!(
                "need 0 < fast < slow, got fast={} slow={}",
                config.fast, config.slow
            )));
        }
        Ok(Self {
            config,
            was_above: None,
        })
    }

    fn sma(bars: &VecDeque<Bar>, window: usize) -> Option<Price> {
        if bars.len() < window {
            return None;
        }
        let sum: Price = bars.iter().rev().take(window).map(|bar| bar.close).sum();
        Some(sum / Decimal::from(window as u64))
    }
}

impl Strategy for SmaCrossover {
    fn name(&self) -> &str {
        "sma-crossover"
    }

    fn subscriptions(&self) -> Vec<Symbol> {
        vec![self.config.symbol.clone()]
    }

    fn should_run(&self, regime: &Regime) -> bool {
        // Momentum is off in choppy tape and in crisis volatility.
        regime.trend == TrendRegime::Trending && regime.vol != VolRegime::Crisis
    }

    fn produce_signals(&mut self, ctx: &StrategyContext) -> Vec<Signal> {
        let Some(bars) = ctx.bars(&self.config.symbol) else {
            return Vec::new();
        };
        let (Some(fast), Some(slow)) = (
            Self::sma(bars, self.config.fast),
            Self::sma(bars, self.config.slow),
        ) else {
            return Vec::new();
        };

        let above = fast > slow;
        let crossed = self.was_above.is_some_and(|was| was != above);
        self.was_above = Some(above);
        if !crossed {
            return Vec::new();
        }

        let holding = ctx
            .position(&self.config.symbol)
            .map(|p| p.net_qty > Decimal::ZERO)
            .unwrap_or(false);
        if above && !holding {
            vec![Signal::new(
                self.name(),
                self.config.symbol.clone(),
                SignalAction::EnterLong,
            )]
        } else if !above && holding {
            vec![Signal::new(
                self.name(),
                self.config.symbol.clone(),
                SignalAction::ExitLong,
            )]
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::DataTier;

    fn bar(symbol: &str, close: i64) -> Bar {
        Bar {
            symbol: symbol.into(),
            ts: Utc::now(),
            open: close.into(),
            high: close.into(),
            low: close.into(),
            close: close.into(),
            volume: 1000.into(),
            tier: DataTier::Consolidated,
        }
    }

    fn trending() -> Regime {
        Regime {
            trend: TrendRegime::Trending,
            vol: VolRegime::Normal,
            detected_at: Utc::now(),
        }
    }

    #[test]
    fn crossover_emits_entry_then_exit() {
        let mut strategy = SmaCrossover::new(SmaCrossoverConfig {
            symbol: "AAPL".into(),
            fast: 2,
            slow: 3,
        })
        .unwrap();
        let mut ctx = StrategyContext::new(16);

        // Declining closes: fast below slow.
        for close in [110, 105, 100] {
            ctx.push_bar(bar("AAPL", close));
        }
        assert!(strategy.produce_signals(&ctx).is_empty());

        // Rally pushes the fast average above the slow one.
        for close in [115, 125] {
            ctx.push_bar(bar("AAPL", close));
        }
        let signals = strategy.produce_signals(&ctx);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].action, SignalAction::EnterLong);

        // Collapse crosses back down; holding a position now.
        ctx.update_positions(vec![Position {
            symbol: "AAPL".into(),
            net_qty: 10.into(),
            avg_cost: 120.into(),
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            updated_at: Utc::now(),
            version: 1,
        }]);
        for close in [100, 90, 85] {
            ctx.push_bar(bar("AAPL", close));
        }
        let signals = strategy.produce_signals(&ctx);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].action, SignalAction::ExitLong);
    }

    #[test]
    fn momentum_sits_out_choppy_and_crisis_regimes() {
        let strategy = SmaCrossover::new(SmaCrossoverConfig {
            symbol: "AAPL".into(),
            fast: 2,
            slow: 3,
        })
        .unwrap();
        assert!(strategy.should_run(&trending()));
        assert!(!strategy.should_run(&Regime {
            trend: TrendRegime::Choppy,
            vol: VolRegime::Normal,
            detected_at: Utc::now(),
        }));
        assert!(!strategy.should_run(&Regime {
            trend: TrendRegime::Trending,
            vol: VolRegime::Crisis,
            detected_at: Utc::now(),
        }));
    }

    #[test]
    fn registry_round_trips_builtins() {
        register_builtin_strategies();
        assert!(registered_strategies().contains(&"sma-crossover".to_string()));
        let strategy = create_strategy(
            "sma-crossover",
            serde_json::json!({ "symbol": "MSFT" }),
        )
        .unwrap();
        assert_eq!(strategy.subscriptions(), vec!["MSFT".to_string()]);
        assert!(create_strategy("nope", serde_json::Value::Null).is_err());
    }
}
