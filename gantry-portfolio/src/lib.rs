//! Portfolio accounting primitives.
//!
//! Tracks signed net positions, cash, realized/unrealized PnL, and the
//! equity curve from fills; sizes risk-approved intents under the
//! max-position constraint.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use gantry_core::{EquityPoint, Fill, Position, Price, Qty, Side, Symbol};
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Result alias for portfolio operations.
pub type PortfolioResult<T> = Result<T, PortfolioError>;

#[derive(Debug, Error)]
pub enum PortfolioError {
    /// A fill arrived for a quantity of zero or less.
    #[error("fill quantity must be positive, got {0}")]
    NonPositiveFill(Qty),
}

/// Configuration used when instantiating a portfolio.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PortfolioConfig {
    pub initial_cash: Price,
    /// Largest single-symbol exposure as a fraction of equity.
    pub max_position_pct: Decimal,
    /// Fraction of equity committed per new intent.
    pub target_position_pct: Decimal,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            initial_cash: Decimal::from(100_000),
            max_position_pct: Decimal::new(10, 2),   // 10%
            target_position_pct: Decimal::new(5, 2), // 5%
        }
    }
}

/// Aggregate positions and cash, marked to the latest observed prices.
pub struct Portfolio {
    positions: HashMap<Symbol, Position>,
    marks: HashMap<Symbol, Price>,
    cash: Price,
    initial_equity: Price,
    peak_equity: Price,
}

impl Portfolio {
    #[must_use]
    pub fn new(config: &PortfolioConfig) -> Self {
        Self {
            positions: HashMap::new(),
            marks: HashMap::new(),
            cash: config.initial_cash,
            initial_equity: config.initial_cash,
            peak_equity: config.initial_cash,
        }
    }

    /// Rebuild from a reconciled position snapshot (broker truth).
    pub fn restore_positions(&mut self, positions: Vec<Position>) {
        self.positions.clear();
        for position in positions {
            if !position.is_flat() {
                self.marks
                    .entry(position.symbol.clone())
                    .or_insert(position.avg_cost);
                self.positions.insert(position.symbol.clone(), position);
            }
        }
    }

    /// Apply an executed fill for `symbol` on `side`.
    pub fn apply_execution(
        &mut self,
        symbol: &str,
        side: Side,
        fill: &Fill,
    ) -> PortfolioResult<Position> {
        if fill.qty <= Decimal::ZERO {
            return Err(PortfolioError::NonPositiveFill(fill.qty));
        }
        let signed_qty = fill.qty * side.signum();
        let entry = self
            .positions
            .entry(symbol.to_string())
            .or_insert_with(|| Position::flat(symbol, fill.ts));

        let prior_qty = entry.net_qty;
        let same_direction = prior_qty.is_zero() || prior_qty.signum() == signed_qty.signum();
        if same_direction {
            let total = prior_qty.abs() + fill.qty;
            entry.avg_cost = if total.is_zero() {
                fill.price
            } else {
                (entry.avg_cost * prior_qty.abs() + fill.price * fill.qty) / total
            };
            entry.net_qty = prior_qty + signed_qty;
        } else {
            let closing = prior_qty.abs().min(fill.qty);
            let direction = prior_qty.signum();
            entry.realized_pnl += (fill.price - entry.avg_cost) * closing * direction;
            let remaining = prior_qty + signed_qty;
            if remaining.signum() != prior_qty.signum() && !remaining.is_zero() {
                // Crossed through flat: the residual opens at the fill price.
                entry.avg_cost = fill.price;
            } else if remaining.is_zero() {
                entry.avg_cost = Decimal::ZERO;
            }
            entry.net_qty = remaining;
        }

        self.cash -= signed_qty * fill.price + fill.fees;
        self.marks.insert(symbol.to_string(), fill.price);
        entry.updated_at = fill.ts;
        entry.version += 1;
        refresh_unrealized(entry, fill.price);

        debug!(
            symbol,
            net_qty = %entry.net_qty,
            avg_cost = %entry.avg_cost,
            cash = %self.cash,
            "applied execution"
        );
        Ok(entry.clone())
    }

    /// Update the mark price for a symbol, refreshing its unrealized PnL.
    pub fn mark_price(&mut self, symbol: &str, price: Price, ts: DateTime<Utc>) {
        self.marks.insert(symbol.to_string(), price);
        if let Some(position) = self.positions.get_mut(symbol) {
            refresh_unrealized(position, price);
            position.updated_at = ts;
        }
        let equity = self.equity();
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
    }

    #[must_use]
    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    #[must_use]
    pub fn positions(&self) -> Vec<Position> {
        self.positions
            .values()
            .filter(|p| !p.is_flat())
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn mark(&self, symbol: &str) -> Option<Price> {
        self.marks.get(symbol).copied()
    }

    /// Aggregate market value of all open positions.
    #[must_use]
    pub fn positions_value(&self) -> Price {
        self.positions
            .iter()
            .map(|(symbol, position)| {
                let mark = self
                    .marks
                    .get(symbol)
                    .copied()
                    .unwrap_or(position.avg_cost);
                position.market_value(mark)
            })
            .sum()
    }

    #[must_use]
    pub fn cash(&self) -> Price {
        self.cash
    }

    /// Total net asset value.
    #[must_use]
    pub fn equity(&self) -> Price {
        self.cash + self.positions_value()
    }

    #[must_use]
    pub fn equity_point(&self, ts: DateTime<Utc>) -> EquityPoint {
        EquityPoint {
            ts,
            equity: self.equity(),
            cash: self.cash,
            positions_value: self.positions_value(),
        }
    }

    #[must_use]
    pub fn initial_equity(&self) -> Price {
        self.initial_equity
    }

    #[must_use]
    pub fn peak_equity(&self) -> Price {
        self.peak_equity
    }

    /// Peak-to-trough drawdown as a non-negative fraction.
    #[must_use]
    pub fn drawdown(&self) -> Decimal {
        if self.peak_equity <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let dd = (self.peak_equity - self.equity()) / self.peak_equity;
        dd.max(Decimal::ZERO)
    }
}

fn refresh_unrealized(position: &mut Position, mark: Price) {
    position.unrealized_pnl = if position.is_flat() {
        Decimal::ZERO
    } else {
        (mark - position.avg_cost) * position.net_qty
    };
}

/// Outcome of sizing an intent against the portfolio's constraints.
#[derive(Clone, Debug, PartialEq)]
pub enum SizeDecision {
    /// Approved at this (possibly clamped) share quantity.
    Approved(Qty),
    /// The intent sizes to nothing under current constraints.
    Rejected(String),
}

/// Fixed-fraction sizer with a hard per-symbol concentration cap.
pub struct PositionSizer {
    target_position_pct: Decimal,
    max_position_pct: Decimal,
}

impl PositionSizer {
    #[must_use]
    pub fn new(config: &PortfolioConfig) -> Self {
        Self {
            target_position_pct: config.target_position_pct,
            max_position_pct: config.max_position_pct,
        }
    }

    /// Size a new entry for `symbol` at `price`, clamped so the resulting
    /// exposure stays under `max_position_pct` of equity and, for buys,
    /// within available cash. Quantities are whole shares.
    pub fn size_entry(
        &self,
        portfolio: &Portfolio,
        symbol: &str,
        side: Side,
        price: Price,
    ) -> SizeDecision {
        if price <= Decimal::ZERO {
            return SizeDecision::Rejected(format!("no valid mark price for {symbol}"));
        }
        let equity = portfolio.equity();
        if equity <= Decimal::ZERO {
            return SizeDecision::Rejected("portfolio equity is non-positive".into());
        }

        let current_notional = portfolio
            .position(symbol)
            .map(|p| (p.net_qty * price).abs())
            .unwrap_or(Decimal::ZERO);
        let cap_notional = equity * self.max_position_pct;
        let headroom = cap_notional - current_notional;
        if headroom <= Decimal::ZERO {
            return SizeDecision::Rejected(format!(
                "{symbol} already at concentration cap ({current_notional} of {cap_notional})"
            ));
        }

        let mut notional = (equity * self.target_position_pct).min(headroom);
        if side == Side::Buy {
            notional = notional.min(portfolio.cash());
        }
        let qty = (notional / price).floor();
        if qty < Decimal::ONE {
            return SizeDecision::Rejected(format!(
                "intent for {symbol} sizes to zero shares at {price}"
            ));
        }
        SizeDecision::Approved(qty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(qty: i64, price: i64) -> Fill {
        Fill {
            fill_id: format!("f-{qty}-{price}"),
            order_id: "0000000000001-0000".into(),
            qty: qty.into(),
            price: price.into(),
            fees: Decimal::ZERO,
            ts: Utc::now(),
        }
    }

    #[test]
    fn buys_accumulate_at_weighted_average_cost() {
        let mut portfolio = Portfolio::new(&PortfolioConfig::default());
        portfolio
            .apply_execution("AAPL", Side::Buy, &fill(10, 100))
            .unwrap();
        portfolio
            .apply_execution("AAPL", Side::Buy, &fill(10, 110))
            .unwrap();
        let position = portfolio.position("AAPL").unwrap();
        assert_eq!(position.net_qty, 20.into());
        assert_eq!(position.avg_cost, 105.into());
        assert_eq!(portfolio.cash(), Decimal::from(100_000 - 1000 - 1100));
    }

    #[test]
    fn closing_realizes_pnl_and_frees_cash() {
        let mut portfolio = Portfolio::new(&PortfolioConfig::default());
        portfolio
            .apply_execution("AAPL", Side::Buy, &fill(10, 100))
            .unwrap();
        portfolio
            .apply_execution("AAPL", Side::Sell, &fill(10, 120))
            .unwrap();
        let position = portfolio.position("AAPL").unwrap();
        assert!(position.is_flat());
        assert_eq!(position.realized_pnl, 200.into());
        assert_eq!(portfolio.cash(), Decimal::from(100_200));
        assert_eq!(portfolio.equity(), Decimal::from(100_200));
    }

    #[test]
    fn crossing_through_flat_reopens_at_fill_price() {
        let mut portfolio = Portfolio::new(&PortfolioConfig::default());
        portfolio
            .apply_execution("TSLA", Side::Buy, &fill(5, 200))
            .unwrap();
        portfolio
            .apply_execution("TSLA", Side::Sell, &fill(8, 210))
            .unwrap();
        let position = portfolio.position("TSLA").unwrap();
        assert_eq!(position.net_qty, Decimal::from(-3));
        assert_eq!(position.avg_cost, 210.into());
        assert_eq!(position.realized_pnl, 50.into());
    }

    #[test]
    fn drawdown_tracks_peak_equity() {
        let mut portfolio = Portfolio::new(&PortfolioConfig::default());
        portfolio
            .apply_execution("NVDA", Side::Buy, &fill(100, 100))
            .unwrap();
        portfolio.mark_price("NVDA", 120.into(), Utc::now());
        assert_eq!(portfolio.peak_equity(), Decimal::from(102_000));
        portfolio.mark_price("NVDA", 90.into(), Utc::now());
        let dd = portfolio.drawdown();
        assert!(dd > Decimal::new(2, 2) && dd < Decimal::new(3, 2), "dd={dd}");
    }

    #[test]
    fn sizer_clamps_to_concentration_cap() {
        let config = PortfolioConfig::default();
        let mut portfolio = Portfolio::new(&config);
        let sizer = PositionSizer::new(&config);

        // 5% of 100k at $100 → 50 shares.
        match sizer.size_entry(&portfolio, "AAPL", Side::Buy, 100.into()) {
            SizeDecision::Approved(qty) => assert_eq!(qty, 50.into()),
            other => panic!("unexpected decision {other:?}"),
        }

        // Fill to near the 10% cap; next entry is clamped to the headroom.
        portfolio
            .apply_execution("AAPL", Side::Buy, &fill(90, 100))
            .unwrap();
        match sizer.size_entry(&portfolio, "AAPL", Side::Buy, 100.into()) {
            SizeDecision::Approved(qty) => assert!(qty <= 10.into(), "qty={qty}"),
            SizeDecision::Rejected(_) => {}
        }
    }

    #[test]
    fn sizer_rejects_zero_share_intents() {
        let config = PortfolioConfig {
            initial_cash: Decimal::from(100),
            ..PortfolioConfig::default()
        };
        let portfolio = Portfolio::new(&config);
        let sizer = PositionSizer::new(&config);
        assert!(matches!(
            sizer.size_entry(&portfolio, "BRK.A", Side::Buy, Decimal::from(600_000)),
            SizeDecision::Rejected(_)
        ));
    }
}
