//! Field-by-field comparison of guard configurations.
//!
//! Used to log what an update actually changed and to report drift from
//! the defaults. Each change is tagged with how much it loosens protection.

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::hedging::HedgeConfig;
use crate::mode_allocation::ModeAllocationConfig;
use crate::mode_safety::ModeSafetyConfig;
use autopilot_core::types::TradingMode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingChange {
    pub path: String,
    pub old: Value,
    pub new: Value,
    pub risk_level: RiskLevel,
}

/// Direction in which a larger value moves protection.
#[derive(Clone, Copy)]
enum Looser {
    /// Raising the value relaxes the guard.
    WhenHigher,
    /// Lowering the value relaxes the guard.
    WhenLower,
    /// Neutral setting.
    Never,
}

struct Differ {
    prefix: String,
    changes: Vec<SettingChange>,
}

impl Differ {
    fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            changes: Vec::new(),
        }
    }

    fn push(&mut self, field: &str, old: Value, new: Value, risk_level: RiskLevel) {
        self.changes.push(SettingChange {
            path: format!("{}.{}", self.prefix, field),
            old,
            new,
            risk_level,
        });
    }

    /// Disabling a guard is always high risk.
    fn toggle(&mut self, field: &str, old: bool, new: bool) {
        if old != new {
            let level = if new { RiskLevel::Low } else { RiskLevel::High };
            self.push(field, json!(old), json!(new), level);
        }
    }

    fn number<T>(&mut self, field: &str, old: T, new: T, looser: Looser)
    where
        T: PartialOrd + Serialize,
    {
        if old == new {
            return;
        }
        let level = match looser {
            Looser::WhenHigher if new > old => RiskLevel::High,
            Looser::WhenLower if new < old => RiskLevel::High,
            Looser::Never => RiskLevel::Low,
            _ => RiskLevel::Medium,
        };
        self.push(field, json!(old), json!(new), level);
    }

    fn value<T: PartialEq + Serialize>(&mut self, field: &str, old: &T, new: &T) {
        if old != new {
            self.push(field, json!(old), json!(new), RiskLevel::Medium);
        }
    }

    fn finish(self) -> Vec<SettingChange> {
        self.changes
    }
}

pub fn diff_circuit_breaker(
    old: &CircuitBreakerConfig,
    new: &CircuitBreakerConfig,
) -> Vec<SettingChange> {
    let mut d = Differ::new("circuit_breaker");
    d.toggle("enabled", old.enabled, new.enabled);
    d.number(
        "max_loss_per_hour",
        old.max_loss_per_hour,
        new.max_loss_per_hour,
        Looser::WhenHigher,
    );
    d.number(
        "max_daily_loss",
        old.max_daily_loss,
        new.max_daily_loss,
        Looser::WhenHigher,
    );
    d.number(
        "max_consecutive_losses",
        old.max_consecutive_losses,
        new.max_consecutive_losses,
        Looser::WhenHigher,
    );
    d.number(
        "cooldown_minutes",
        old.cooldown_minutes,
        new.cooldown_minutes,
        Looser::WhenLower,
    );
    d.number(
        "max_trades_per_minute",
        old.max_trades_per_minute,
        new.max_trades_per_minute,
        Looser::WhenHigher,
    );
    d.number(
        "max_daily_trades",
        old.max_daily_trades,
        new.max_daily_trades,
        Looser::WhenHigher,
    );
    d.finish()
}

pub fn diff_hedge(old: &HedgeConfig, new: &HedgeConfig) -> Vec<SettingChange> {
    let mut d = Differ::new("hedge");
    // Hedging adds exposure, so enabling it is the riskier direction.
    if old.enabled != new.enabled {
        let level = if new.enabled { RiskLevel::Medium } else { RiskLevel::Low };
        d.push("enabled", json!(old.enabled), json!(new.enabled), level);
    }
    d.number(
        "price_drop_trigger_pct",
        old.price_drop_trigger_pct,
        new.price_drop_trigger_pct,
        Looser::Never,
    );
    d.number(
        "unrealized_loss_trigger_usd",
        old.unrealized_loss_trigger_usd,
        new.unrealized_loss_trigger_usd,
        Looser::Never,
    );
    d.toggle("ai_enabled", old.ai_enabled, new.ai_enabled);
    d.number(
        "ai_confidence_min",
        old.ai_confidence_min,
        new.ai_confidence_min,
        Looser::WhenLower,
    );
    d.number(
        "default_percent",
        old.default_percent,
        new.default_percent,
        Looser::WhenHigher,
    );
    d.value("partial_steps", &old.partial_steps, &new.partial_steps);
    d.value("allow_stepping", &old.allow_stepping, &new.allow_stepping);
    d.number(
        "max_hedge_size_percent",
        old.max_hedge_size_percent,
        new.max_hedge_size_percent,
        Looser::WhenHigher,
    );
    d.number(
        "max_total_exposure_multiplier",
        old.max_total_exposure_multiplier,
        new.max_total_exposure_multiplier,
        Looser::WhenHigher,
    );
    d.number(
        "max_simultaneous",
        old.max_simultaneous,
        new.max_simultaneous,
        Looser::WhenHigher,
    );
    d.number(
        "profit_take_pct",
        old.profit_take_pct,
        new.profit_take_pct,
        Looser::Never,
    );
    d.number(
        "close_on_recovery_pct",
        old.close_on_recovery_pct,
        new.close_on_recovery_pct,
        Looser::Never,
    );
    d.number(
        "order_timeout_ms",
        old.order_timeout_ms,
        new.order_timeout_ms,
        Looser::Never,
    );
    d.finish()
}

pub fn diff_allocation(
    old: &ModeAllocationConfig,
    new: &ModeAllocationConfig,
) -> Vec<SettingChange> {
    let mut d = Differ::new("mode_allocation");
    for mode in TradingMode::ALL {
        let (Some(before), Some(after)) = (old.budget(mode), new.budget(mode)) else {
            d.value(
                &mode.to_string(),
                &old.budget(mode).map(|b| b.allocated_percent),
                &new.budget(mode).map(|b| b.allocated_percent),
            );
            continue;
        };
        d.number(
            &format!("{mode}.allocated_percent"),
            before.allocated_percent,
            after.allocated_percent,
            Looser::Never,
        );
        d.number(
            &format!("{mode}.max_positions"),
            before.max_positions,
            after.max_positions,
            Looser::WhenHigher,
        );
        d.number(
            &format!("{mode}.max_usd_per_position"),
            before.max_usd_per_position,
            after.max_usd_per_position,
            Looser::WhenHigher,
        );
    }
    d.value(
        "allow_dynamic_rebalance",
        &old.allow_dynamic_rebalance,
        &new.allow_dynamic_rebalance,
    );
    d.number(
        "rebalance_threshold_pct",
        old.rebalance_threshold_pct,
        new.rebalance_threshold_pct,
        Looser::Never,
    );
    d.finish()
}

pub fn diff_mode_safety(
    mode: TradingMode,
    old: &ModeSafetyConfig,
    new: &ModeSafetyConfig,
) -> Vec<SettingChange> {
    let mut d = Differ::new(format!("mode_safety.{mode}"));
    d.toggle(
        "enable_win_rate_monitor",
        old.enable_win_rate_monitor,
        new.enable_win_rate_monitor,
    );
    d.number(
        "win_rate_sample_size",
        old.win_rate_sample_size,
        new.win_rate_sample_size,
        Looser::Never,
    );
    d.number(
        "min_win_rate_threshold",
        old.min_win_rate_threshold,
        new.min_win_rate_threshold,
        Looser::WhenLower,
    );
    d.number(
        "win_rate_cooldown_minutes",
        old.win_rate_cooldown_minutes,
        new.win_rate_cooldown_minutes,
        Looser::WhenLower,
    );
    d.toggle(
        "enable_profit_monitor",
        old.enable_profit_monitor,
        new.enable_profit_monitor,
    );
    d.number(
        "profit_window_minutes",
        old.profit_window_minutes,
        new.profit_window_minutes,
        Looser::Never,
    );
    // The bound is negative; a lower value permits a deeper loss.
    d.number(
        "max_loss_percent_in_window",
        old.max_loss_percent_in_window,
        new.max_loss_percent_in_window,
        Looser::WhenLower,
    );
    d.number(
        "pause_cooldown_minutes",
        old.pause_cooldown_minutes,
        new.pause_cooldown_minutes,
        Looser::WhenLower,
    );
    d.finish()
}

/// Highest risk among a set of changes.
pub fn max_risk(changes: &[SettingChange]) -> Option<RiskLevel> {
    changes.iter().map(|c| c.risk_level).max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn test_identical_configs_have_no_changes() {
        let cfg = CircuitBreakerConfig::default();
        assert!(diff_circuit_breaker(&cfg, &cfg.clone()).is_empty());
        let hedge = HedgeConfig::default();
        assert!(diff_hedge(&hedge, &hedge.clone()).is_empty());
        let alloc = ModeAllocationConfig::default();
        assert!(diff_allocation(&alloc, &alloc.clone()).is_empty());
    }

    #[test]
    fn test_loosening_breaker_is_high_risk() {
        let old = CircuitBreakerConfig::default();
        let new = CircuitBreakerConfig {
            max_daily_loss: Decimal::new(500, 0),
            max_consecutive_losses: 3,
            ..old.clone()
        };
        let changes = diff_circuit_breaker(&old, &new);
        assert_eq!(changes.len(), 2);

        assert_eq!(changes[0].path, "circuit_breaker.max_daily_loss");
        assert_eq!(changes[0].risk_level, RiskLevel::High);
        assert_eq!(changes[1].path, "circuit_breaker.max_consecutive_losses");
        assert_eq!(changes[1].risk_level, RiskLevel::Medium);
        assert_eq!(changes[1].old, json!(5));
        assert_eq!(changes[1].new, json!(3));
        assert_eq!(max_risk(&changes), Some(RiskLevel::High));
    }

    #[test]
    fn test_disabling_guard_is_high_risk() {
        let old = CircuitBreakerConfig::default();
        let new = CircuitBreakerConfig {
            enabled: false,
            ..old.clone()
        };
        let changes = diff_circuit_breaker(&old, &new);
        assert_eq!(changes[0].risk_level, RiskLevel::High);
        assert_eq!(changes[0].new, json!(false));
    }

    #[test]
    fn test_allocation_paths_include_mode() {
        let old = ModeAllocationConfig::default();
        let mut new = old.clone();
        if let Some(budget) = new.budgets.get_mut(&TradingMode::Scalp) {
            budget.max_positions = 12;
        }
        let changes = diff_allocation(&old, &new);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "mode_allocation.scalp.max_positions");
        assert_eq!(changes[0].risk_level, RiskLevel::High);
    }

    #[test]
    fn test_mode_safety_deeper_loss_bound_is_high_risk() {
        let old = ModeSafetyConfig::for_mode(TradingMode::Swing);
        let new = ModeSafetyConfig {
            max_loss_percent_in_window: Decimal::new(-6, 0),
            ..old.clone()
        };
        let changes = diff_mode_safety(TradingMode::Swing, &old, &new);
        assert_eq!(changes.len(), 1);
        assert_eq!(
            changes[0].path,
            "mode_safety.swing.max_loss_percent_in_window"
        );
        assert_eq!(changes[0].risk_level, RiskLevel::High);
    }

    #[test]
    fn test_enabling_hedging_is_medium_risk() {
        let old = HedgeConfig::default();
        let new = HedgeConfig {
            enabled: true,
            ..old.clone()
        };
        let changes = diff_hedge(&old, &new);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].risk_level, RiskLevel::Medium);
    }
}
