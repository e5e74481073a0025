//! Kill rules enforced by the supervisor.
//!
//! These limits are hardcoded constants, not tunable configuration. Each
//! one names a failure mode that requires immediate protective action.

use chrono::{DateTime, Datelike, NaiveTime, Utc};
use chrono_tz::America::New_York;
use rust_decimal::Decimal;

/// Inputs to one evaluation cycle, assembled from the broker and the live
/// state cache.
#[derive(Clone, Debug, Default)]
pub struct RuleInputs {
    /// Daily PnL as a fraction of start-of-day equity (negative = loss).
    pub daily_pnl_pct: Decimal,
    /// Peak-to-trough drawdown as a non-negative fraction.
    pub drawdown_pct: Decimal,
    /// Largest single-symbol exposure as a fraction of equity.
    pub largest_position_pct: Decimal,
    pub largest_position_symbol: Option<String>,
    pub open_orders_count: usize,
    /// Orders first observed within the trailing minute.
    pub orders_last_minute: usize,
    /// Broker order ids working longer than the zombie threshold.
    pub zombie_order_ids: Vec<String>,
    /// Age of the trading process heartbeat, if one was ever seen.
    pub heartbeat_age_secs: Option<i64>,
    pub now: Option<DateTime<Utc>>,
}

/// What the actuator must do about a breach.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum KillAction {
    /// Cancel everything, flatten the book, halt, terminate the trader.
    FlattenAndHalt,
    /// Same, but the halt is permanent: human intervention to resume.
    HardHalt,
    /// Close one symbol's exposure; trading continues.
    FlattenSymbol(String),
    /// Cancel the named orders through direct broker access.
    CancelOrders(Vec<String>),
    /// Close every position (end-of-week); no halt.
    FlattenPositions,
}

/// A tripped rule with its evidence.
#[derive(Clone, Debug)]
pub struct Breach {
    pub rule: &'static str,
    pub reason: String,
    pub action: KillAction,
}

/// The frozen limits.
pub struct KillRules;

impl KillRules {
    /// Daily loss beyond 5% of start-of-day equity.
    pub const MAX_DAILY_LOSS_PCT: Decimal = Decimal::from_parts(5, 0, 0, true, 2); // -0.05
    /// Peak-to-trough drawdown of 15%.
    pub const MAX_DRAWDOWN_PCT: Decimal = Decimal::from_parts(15, 0, 0, false, 2); // 0.15
    /// Any single symbol above 25% of equity.
    pub const MAX_CONCENTRATION_PCT: Decimal = Decimal::from_parts(25, 0, 0, false, 2); // 0.25
    /// Runaway detection: more open orders than any sane strategy needs.
    pub const MAX_OPEN_ORDERS: usize = 50;
    /// Runaway detection: order placement rate.
    pub const MAX_ORDERS_PER_MINUTE: usize = 20;
    /// Trading-process heartbeat staleness.
    pub const HEARTBEAT_TIMEOUT_SECS: i64 = 30;
    /// Friday forced flatten, local exchange time.
    #[must_use]
    pub fn friday_close() -> NaiveTime {
        NaiveTime::from_hms_opt(15, 55, 0).unwrap()
    }

    /// Evaluate the rules in their fixed order; the first breach wins.
    #[must_use]
    pub fn evaluate(inputs: &RuleInputs) -> Option<Breach> {
        if inputs.daily_pnl_pct <= Self::MAX_DAILY_LOSS_PCT {
            return Some(Breach {
                rule: "daily_loss",
                reason: format!(
                    "daily PnL {:.2}% breached {:.0}% limit",
                    inputs.daily_pnl_pct * Decimal::from(100),
                    Self::MAX_DAILY_LOSS_PCT * Decimal::from(100),
                ),
                action: KillAction::FlattenAndHalt,
            });
        }
        if inputs.drawdown_pct >= Self::MAX_DRAWDOWN_PCT {
            return Some(Breach {
                rule: "max_drawdown",
                reason: format!(
                    "peak-to-trough drawdown {:.2}% breached {:.0}% limit; not auto-resumable",
                    inputs.drawdown_pct * Decimal::from(100),
                    Self::MAX_DRAWDOWN_PCT * Decimal::from(100),
                ),
                action: KillAction::HardHalt,
            });
        }
        if let Some(age) = inputs.heartbeat_age_secs {
            if age > Self::HEARTBEAT_TIMEOUT_SECS {
                return Some(Breach {
                    rule: "heartbeat",
                    reason: format!(
                        "trading heartbeat is {age}s old (limit {}s)",
                        Self::HEARTBEAT_TIMEOUT_SECS
                    ),
                    action: KillAction::FlattenAndHalt,
                });
            }
        }
        if inputs.largest_position_pct > Self::MAX_CONCENTRATION_PCT {
            let symbol = inputs
                .largest_position_symbol
                .clone()
                .unwrap_or_else(|| "?".into());
            return Some(Breach {
                rule: "concentration",
                reason: format!(
                    "{symbol} is {:.1}% of equity (limit {:.0}%)",
                    inputs.largest_position_pct * Decimal::from(100),
                    Self::MAX_CONCENTRATION_PCT * Decimal::from(100),
                ),
                action: KillAction::FlattenSymbol(symbol),
            });
        }
        if !inputs.zombie_order_ids.is_empty() {
            return Some(Breach {
                rule: "zombie_orders",
                reason: format!(
                    "{} order(s) working past the zombie threshold",
                    inputs.zombie_order_ids.len()
                ),
                action: KillAction::CancelOrders(inputs.zombie_order_ids.clone()),
            });
        }
        if inputs.open_orders_count > Self::MAX_OPEN_ORDERS {
            return Some(Breach {
                rule: "open_orders",
                reason: format!(
                    "{} open orders (limit {})",
                    inputs.open_orders_count,
                    Self::MAX_OPEN_ORDERS
                ),
                action: KillAction::FlattenAndHalt,
            });
        }
        if inputs.orders_last_minute > Self::MAX_ORDERS_PER_MINUTE {
            return Some(Breach {
                rule: "order_rate",
                reason: format!(
                    "{} orders in the last minute (limit {})",
                    inputs.orders_last_minute,
                    Self::MAX_ORDERS_PER_MINUTE
                ),
                action: KillAction::FlattenAndHalt,
            });
        }
        if let Some(now) = inputs.now {
            if in_friday_close_window(now) {
                return Some(Breach {
                    rule: "end_of_week",
                    reason: "Friday close window reached; no weekend risk".into(),
                    action: KillAction::FlattenPositions,
                });
            }
        }
        None
    }
}

/// True inside the Friday 15:55–16:00 New York window.
fn in_friday_close_window(now: DateTime<Utc>) -> bool {
    let local = now.with_timezone(&New_York);
    local.weekday() == chrono::Weekday::Fri
        && local.time() >= KillRules::friday_close()
        && local.time() < NaiveTime::from_hms_opt(16, 0, 0).unwrap()
}

/// Early-warning thresholds: alert before the kill limits are hit.
pub struct WarningThresholds;

impl WarningThresholds {
    pub const DAILY_LOSS_PCT: Decimal = Decimal::from_parts(3, 0, 0, true, 2); // -0.03
    pub const CONCENTRATION_PCT: Decimal = Decimal::from_parts(20, 0, 0, false, 2); // 0.20
    pub const OPEN_ORDERS: usize = 30;
    pub const HEARTBEAT_SECS: i64 = 20;

    /// Human-readable warnings for the current inputs.
    #[must_use]
    pub fn evaluate(inputs: &RuleInputs) -> Vec<String> {
        let mut warnings = Vec::new();
        if inputs.daily_pnl_pct <= Self::DAILY_LOSS_PCT {
            warnings.push(format!(
                "daily PnL {:.2}% approaching loss limit",
                inputs.daily_pnl_pct * Decimal::from(100)
            ));
        }
        if inputs.largest_position_pct > Self::CONCENTRATION_PCT {
            warnings.push(format!(
                "{} concentration {:.1}% approaching limit",
                inputs
                    .largest_position_symbol
                    .as_deref()
                    .unwrap_or("?"),
                inputs.largest_position_pct * Decimal::from(100)
            ));
        }
        if inputs.open_orders_count > Self::OPEN_ORDERS {
            warnings.push(format!(
                "{} open orders approaching limit",
                inputs.open_orders_count
            ));
        }
        if inputs
            .heartbeat_age_secs
            .is_some_and(|age| age > Self::HEARTBEAT_SECS)
        {
            warnings.push("trading heartbeat approaching staleness limit".into());
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn healthy() -> RuleInputs {
        RuleInputs {
            daily_pnl_pct: Decimal::new(-1, 2),
            drawdown_pct: Decimal::new(2, 2),
            largest_position_pct: Decimal::new(10, 2),
            largest_position_symbol: Some("AAPL".into()),
            open_orders_count: 3,
            orders_last_minute: 2,
            zombie_order_ids: Vec::new(),
            heartbeat_age_secs: Some(4),
            now: None,
        }
    }

    #[test]
    fn healthy_inputs_trip_nothing() {
        assert!(KillRules::evaluate(&healthy()).is_none());
        assert!(WarningThresholds::evaluate(&healthy()).is_empty());
    }

    #[test]
    fn daily_loss_at_five_point_one_percent_flattens_and_halts() {
        let mut inputs = healthy();
        inputs.daily_pnl_pct = Decimal::new(-51, 3); // -5.1%
        let breach = KillRules::evaluate(&inputs).unwrap();
        assert_eq!(breach.rule, "daily_loss");
        assert_eq!(breach.action, KillAction::FlattenAndHalt);
    }

    #[test]
    fn drawdown_alone_is_a_hard_halt() {
        let mut inputs = healthy();
        inputs.drawdown_pct = Decimal::new(16, 2);
        let breach = KillRules::evaluate(&inputs).unwrap();
        assert_eq!(breach.rule, "max_drawdown");
        assert_eq!(breach.action, KillAction::HardHalt);
    }

    #[test]
    fn daily_loss_is_checked_before_drawdown() {
        // A one-day gap can breach both limits at once; the daily-loss
        // rule runs first, so the halt is the recoverable kind.
        let mut inputs = healthy();
        inputs.daily_pnl_pct = Decimal::new(-9, 2);
        inputs.drawdown_pct = Decimal::new(16, 2);
        let breach = KillRules::evaluate(&inputs).unwrap();
        assert_eq!(breach.rule, "daily_loss");
        assert_eq!(breach.action, KillAction::FlattenAndHalt);
    }

    #[test]
    fn concentration_flattens_only_the_offender() {
        let mut inputs = healthy();
        inputs.largest_position_pct = Decimal::new(26, 2);
        inputs.largest_position_symbol = Some("NVDA".into());
        let breach = KillRules::evaluate(&inputs).unwrap();
        assert_eq!(breach.action, KillAction::FlattenSymbol("NVDA".into()));
    }

    #[test]
    fn zombies_are_cancelled_directly() {
        let mut inputs = healthy();
        inputs.zombie_order_ids = vec!["bx-1".into(), "bx-2".into()];
        let breach = KillRules::evaluate(&inputs).unwrap();
        assert_eq!(
            breach.action,
            KillAction::CancelOrders(vec!["bx-1".into(), "bx-2".into()])
        );
    }

    #[test]
    fn stale_heartbeat_flattens_and_halts() {
        let mut inputs = healthy();
        inputs.heartbeat_age_secs = Some(31);
        let breach = KillRules::evaluate(&inputs).unwrap();
        assert_eq!(breach.rule, "heartbeat");
        assert_eq!(breach.action, KillAction::FlattenAndHalt);
    }

    #[test]
    fn runaway_order_counts_trip() {
        let mut inputs = healthy();
        inputs.open_orders_count = 51;
        assert_eq!(KillRules::evaluate(&inputs).unwrap().rule, "open_orders");

        let mut inputs = healthy();
        inputs.orders_last_minute = 21;
        assert_eq!(KillRules::evaluate(&inputs).unwrap().rule, "order_rate");
    }

    #[test]
    fn friday_window_is_timezone_aware() {
        // 2025-06-06 is a Friday; 19:56 UTC == 15:56 New York (EDT).
        let mut inputs = healthy();
        inputs.now = Some(Utc.with_ymd_and_hms(2025, 6, 6, 19, 56, 0).unwrap());
        let breach = KillRules::evaluate(&inputs).unwrap();
        assert_eq!(breach.rule, "end_of_week");
        assert_eq!(breach.action, KillAction::FlattenPositions);

        // Same wall-clock on a Thursday does not trip.
        inputs.now = Some(Utc.with_ymd_and_hms(2025, 6, 5, 19, 56, 0).unwrap());
        assert!(KillRules::evaluate(&inputs).is_none());

        // Friday morning does not trip either.
        inputs.now = Some(Utc.with_ymd_and_hms(2025, 6, 6, 14, 0, 0).unwrap());
        assert!(KillRules::evaluate(&inputs).is_none());
    }

    #[test]
    fn warnings_fire_before_kills() {
        let mut inputs = healthy();
        inputs.daily_pnl_pct = Decimal::new(-35, 3); // -3.5%
        inputs.largest_position_pct = Decimal::new(22, 2);
        inputs.open_orders_count = 31;
        assert!(KillRules::evaluate(&inputs).is_none());
        assert_eq!(WarningThresholds::evaluate(&inputs).len(), 3);
    }
}
