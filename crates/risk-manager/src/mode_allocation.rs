//! Capital allocation across trading modes.
//!
//! Each mode gets `total_capital x allocated_percent / 100`. The engine tracks
//! how much of that slice is deployed and how many positions are open, and
//! refuses new positions that would overrun either.

use autopilot_core::types::{GuardKind, TradingMode, Verdict};
use autopilot_core::{Error, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Taker fee per side, percent.
pub const TAKER_FEE_PERCENT: Decimal = Decimal::from_parts(5, 0, 0, false, 2);
/// Open plus close at taker rates, percent.
pub const ROUND_TRIP_FEE_PERCENT: Decimal = Decimal::from_parts(10, 0, 0, false, 2);
/// Below this per-position size fees consume most of the edge.
pub const MIN_RECOMMENDED_USD: Decimal = Decimal::from_parts(100, 0, 0, false, 0);
pub const OPTIMAL_MIN_USD: Decimal = Decimal::from_parts(200, 0, 0, false, 0);

/// Tolerance around 100% for the allocation sum.
const SUM_TOLERANCE: Decimal = Decimal::ONE;

/// Capital budget for one mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeBudget {
    pub allocated_percent: Decimal,
    pub max_positions: u32,
    pub max_usd_per_position: Decimal,
}

/// Allocation settings for all modes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeAllocationConfig {
    pub budgets: BTreeMap<TradingMode, ModeBudget>,
    pub allow_dynamic_rebalance: bool,
    /// Drift (percentage points) that triggers a rebalance recommendation.
    pub rebalance_threshold_pct: Decimal,
}

impl Default for ModeAllocationConfig {
    fn default() -> Self {
        let budget = |pct: i64, positions: u32, per_position: i64| ModeBudget {
            allocated_percent: Decimal::new(pct, 0),
            max_positions: positions,
            max_usd_per_position: Decimal::new(per_position, 0),
        };
        let mut budgets = BTreeMap::new();
        budgets.insert(TradingMode::UltraFast, budget(20, 3, 200));
        budgets.insert(TradingMode::Scalp, budget(30, 10, 600));
        budgets.insert(TradingMode::Swing, budget(35, 5, 500));
        budgets.insert(TradingMode::Position, budget(15, 2, 600));
        Self {
            budgets,
            allow_dynamic_rebalance: false,
            rebalance_threshold_pct: Decimal::new(20, 0),
        }
    }
}

impl ModeAllocationConfig {
    pub fn budget(&self, mode: TradingMode) -> Option<&ModeBudget> {
        self.budgets.get(&mode)
    }

    pub fn validate(&self) -> Result<()> {
        for mode in TradingMode::ALL {
            let budget = self
                .budgets
                .get(&mode)
                .ok_or_else(|| Error::Validation(format!("missing allocation for mode {mode}")))?;
            if budget.allocated_percent < Decimal::ZERO {
                return Err(Error::Validation(format!(
                    "allocation for {mode} must be non-negative"
                )));
            }
            if budget.max_usd_per_position < Decimal::ZERO {
                return Err(Error::Validation(format!(
                    "max_usd_per_position for {mode} must be non-negative"
                )));
            }
        }
        let sum: Decimal = self.budgets.values().map(|b| b.allocated_percent).sum();
        if (sum - Decimal::ONE_HUNDRED).abs() > SUM_TOLERANCE {
            return Err(Error::Validation(format!(
                "allocations must sum to 100% (got {sum}%)"
            )));
        }
        if self.rebalance_threshold_pct < Decimal::ZERO {
            return Err(Error::Validation(
                "rebalance_threshold_pct must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// New percentages for every mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationPercentages {
    pub ultra_fast_percent: Decimal,
    pub scalp_percent: Decimal,
    pub swing_percent: Decimal,
    pub position_percent: Decimal,
}

impl AllocationPercentages {
    pub fn get(&self, mode: TradingMode) -> Decimal {
        match mode {
            TradingMode::UltraFast => self.ultra_fast_percent,
            TradingMode::Scalp => self.scalp_percent,
            TradingMode::Swing => self.swing_percent,
            TradingMode::Position => self.position_percent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeWarningLevel {
    Low,
    Medium,
    Critical,
}

/// Advisory on how fees compare to the typical position size of a mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeImpact {
    pub per_position_usd: Decimal,
    pub round_trip_fee_percent: Decimal,
    pub round_trip_fee_usd: Decimal,
    pub per_position_fee_usd: Decimal,
    /// Price move needed to cover fees.
    pub break_even_move_percent: Decimal,
    pub warning_level: FeeWarningLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Current allocation and usage of one mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeAllocation {
    pub mode: TradingMode,
    pub allocated_percent: Decimal,
    pub allocated_usd: Decimal,
    pub used_usd: Decimal,
    pub available_usd: Decimal,
    /// Share of the allocation in use, percent.
    pub capacity_percent: Decimal,
    pub current_positions: u32,
    pub max_positions: u32,
    pub max_usd_per_position: Decimal,
    pub fee_impact: FeeImpact,
}

/// Recommendation emitted when deployment drifts away from targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceRecommendation {
    pub mode: TradingMode,
    pub target_percent: Decimal,
    pub actual_percent: Decimal,
    pub drift_percent: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationStatus {
    pub total_capital: Decimal,
    pub modes: Vec<ModeAllocation>,
    pub rebalance_recommendations: Vec<RebalanceRecommendation>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct ModeUsage {
    used_usd: Decimal,
    current_positions: u32,
}

/// Tracks capital per mode for one autopilot instance.
#[derive(Debug, Clone)]
pub struct ModeAllocationEngine {
    config: ModeAllocationConfig,
    total_capital: Decimal,
    usage: BTreeMap<TradingMode, ModeUsage>,
}

impl ModeAllocationEngine {
    pub fn new(config: ModeAllocationConfig, total_capital: Decimal) -> Self {
        Self {
            config,
            total_capital: total_capital.max(Decimal::ZERO),
            usage: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &ModeAllocationConfig {
        &self.config
    }

    pub fn total_capital(&self) -> Decimal {
        self.total_capital
    }

    pub fn set_total_capital(&mut self, total_capital: Decimal) -> Result<()> {
        if total_capital < Decimal::ZERO {
            return Err(Error::Validation(
                "total capital must be non-negative".to_string(),
            ));
        }
        if total_capital != self.total_capital {
            debug!(old = %self.total_capital, new = %total_capital, "Total capital updated");
        }
        self.total_capital = total_capital;
        Ok(())
    }

    /// Replace the percentage split. Other per-mode settings are preserved;
    /// an invalid split leaves the current allocation untouched.
    pub fn update_allocation(&mut self, percentages: &AllocationPercentages) -> Result<()> {
        let mut candidate = self.config.clone();
        for mode in TradingMode::ALL {
            let budget = candidate
                .budgets
                .entry(mode)
                .or_insert_with(|| ModeBudget {
                    allocated_percent: Decimal::ZERO,
                    max_positions: 1,
                    max_usd_per_position: Decimal::ZERO,
                });
            budget.allocated_percent = percentages.get(mode);
        }
        candidate.validate()?;
        self.config = candidate;
        info!(
            ultra_fast = %percentages.ultra_fast_percent,
            scalp = %percentages.scalp_percent,
            swing = %percentages.swing_percent,
            position = %percentages.position_percent,
            "Mode allocations updated"
        );
        Ok(())
    }

    /// Replace the full allocation config (budgets and rebalance settings).
    pub fn update_config(&mut self, config: ModeAllocationConfig) -> Result<()> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    pub fn allocated_usd(&self, mode: TradingMode) -> Decimal {
        self.config
            .budget(mode)
            .map(|b| self.total_capital * b.allocated_percent / Decimal::ONE_HUNDRED)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn used_usd(&self, mode: TradingMode) -> Decimal {
        self.usage.get(&mode).map(|u| u.used_usd).unwrap_or_default()
    }

    pub fn current_positions(&self, mode: TradingMode) -> u32 {
        self.usage
            .get(&mode)
            .map(|u| u.current_positions)
            .unwrap_or_default()
    }

    pub fn check_capacity(&self, mode: TradingMode, requested_usd: Decimal) -> bool {
        self.check_capacity_verdict(mode, requested_usd).is_allowed()
    }

    pub fn check_capacity_verdict(&self, mode: TradingMode, requested_usd: Decimal) -> Verdict {
        let allocated = self.allocated_usd(mode);
        let used = self.used_usd(mode);
        if used + requested_usd > allocated {
            return Verdict::deny(
                GuardKind::Capacity,
                "mode_capacity",
                format!(
                    "{mode} capacity exceeded: used {used} + requested {requested_usd} > allocated {allocated}"
                ),
            );
        }

        let budget = self.config.budget(mode);
        // Zero means no per-position cap.
        let max_usd = budget.map(|b| b.max_usd_per_position).unwrap_or_default();
        if max_usd > Decimal::ZERO && requested_usd > max_usd {
            return Verdict::deny(
                GuardKind::Capacity,
                "max_usd_per_position",
                format!("{mode} position of {requested_usd} exceeds the {max_usd} per-position cap"),
            );
        }

        let max_positions = budget.map(|b| b.max_positions).unwrap_or(0);
        let positions = self.current_positions(mode);
        if positions >= max_positions {
            return Verdict::deny(
                GuardKind::Capacity,
                "mode_max_positions",
                format!("{mode} already has {positions}/{max_positions} positions"),
            );
        }

        Verdict::Allow
    }

    /// Book capital for a newly opened position.
    pub fn open_position(&mut self, mode: TradingMode, usd: Decimal) {
        let usage = self.usage.entry(mode).or_default();
        usage.used_usd += usd.max(Decimal::ZERO);
        usage.current_positions += 1;
    }

    /// Release capital from a closed position. Saturates at zero.
    pub fn close_position(&mut self, mode: TradingMode, usd: Decimal) {
        let usage = self.usage.entry(mode).or_default();
        if usage.current_positions == 0 {
            warn!(mode = %mode, "Closing position on mode with no open positions");
        }
        usage.used_usd = (usage.used_usd - usd.max(Decimal::ZERO)).max(Decimal::ZERO);
        usage.current_positions = usage.current_positions.saturating_sub(1);
    }

    pub fn fee_impact(&self, mode: TradingMode) -> FeeImpact {
        let allocated = self.allocated_usd(mode);
        let max_positions = self
            .config
            .budget(mode)
            .map(|b| b.max_positions.max(1))
            .unwrap_or(1);
        let per_position = allocated / Decimal::from(max_positions);

        let (warning_level, warning) = if per_position < MIN_RECOMMENDED_USD {
            (
                FeeWarningLevel::Critical,
                Some("Position size too small, fees will consume most profits".to_string()),
            )
        } else if per_position < OPTIMAL_MIN_USD {
            (
                FeeWarningLevel::Medium,
                Some("Position size below optimal for fee efficiency".to_string()),
            )
        } else {
            (FeeWarningLevel::Low, None)
        };

        FeeImpact {
            per_position_usd: per_position,
            round_trip_fee_percent: ROUND_TRIP_FEE_PERCENT,
            round_trip_fee_usd: allocated * ROUND_TRIP_FEE_PERCENT / Decimal::ONE_HUNDRED,
            per_position_fee_usd: per_position * ROUND_TRIP_FEE_PERCENT / Decimal::ONE_HUNDRED,
            break_even_move_percent: ROUND_TRIP_FEE_PERCENT,
            warning_level,
            warning,
        }
    }

    /// Modes whose share of deployed capital is off target by more than the
    /// threshold. Never applied automatically.
    pub fn rebalance_recommendations(&self) -> Vec<RebalanceRecommendation> {
        if !self.config.allow_dynamic_rebalance {
            return Vec::new();
        }
        let deployed: Decimal = self.usage.values().map(|u| u.used_usd).sum();
        if deployed <= Decimal::ZERO {
            return Vec::new();
        }

        TradingMode::ALL
            .iter()
            .filter_map(|mode| {
                let target = self.config.budget(*mode)?.allocated_percent;
                let actual = self.used_usd(*mode) / deployed * Decimal::ONE_HUNDRED;
                let drift = (actual - target).abs();
                (drift > self.config.rebalance_threshold_pct).then(|| RebalanceRecommendation {
                    mode: *mode,
                    target_percent: target,
                    actual_percent: actual.round_dp(2),
                    drift_percent: drift.round_dp(2),
                })
            })
            .collect()
    }

    pub fn allocation_status(&self) -> AllocationStatus {
        let modes = TradingMode::ALL
            .iter()
            .map(|mode| {
                let budget = self.config.budget(*mode);
                let allocated = self.allocated_usd(*mode);
                let used = self.used_usd(*mode);
                let capacity_percent = if allocated > Decimal::ZERO {
                    (used / allocated * Decimal::ONE_HUNDRED).round_dp(2)
                } else {
                    Decimal::ZERO
                };
                ModeAllocation {
                    mode: *mode,
                    allocated_percent: budget.map(|b| b.allocated_percent).unwrap_or_default(),
                    allocated_usd: allocated,
                    used_usd: used,
                    available_usd: (allocated - used).max(Decimal::ZERO),
                    capacity_percent,
                    current_positions: self.current_positions(*mode),
                    max_positions: budget.map(|b| b.max_positions).unwrap_or(0),
                    max_usd_per_position: budget
                        .map(|b| b.max_usd_per_position)
                        .unwrap_or_default(),
                    fee_impact: self.fee_impact(*mode),
                }
            })
            .collect();

        AllocationStatus {
            total_capital: self.total_capital,
            modes,
            rebalance_recommendations: self.rebalance_recommendations(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(capital: i64) -> ModeAllocationEngine {
        ModeAllocationEngine::new(ModeAllocationConfig::default(), Decimal::new(capital, 0))
    }

    #[test]
    fn test_scalp_capacity_scenario() {
        let mut engine = engine(10_000);
        engine.open_position(TradingMode::Scalp, Decimal::new(2_800, 0));

        assert_eq!(engine.allocated_usd(TradingMode::Scalp), Decimal::new(3_000, 0));
        assert!(!engine.check_capacity(TradingMode::Scalp, Decimal::new(500, 0)));
        assert!(engine.check_capacity(TradingMode::Scalp, Decimal::new(200, 0)));

        let verdict = engine.check_capacity_verdict(TradingMode::Scalp, Decimal::new(500, 0));
        assert_eq!(verdict.code(), Some("mode_capacity"));
    }

    #[test]
    fn test_max_usd_per_position() {
        let mut engine = engine(10_000);

        // Scalp caps a single position at 600 even with 3,000 free
        let verdict = engine.check_capacity_verdict(TradingMode::Scalp, Decimal::new(601, 0));
        assert_eq!(verdict.code(), Some("max_usd_per_position"));
        assert!(engine.check_capacity(TradingMode::Scalp, Decimal::new(600, 0)));

        // Mode capacity is reported first when both limits are hit
        engine.open_position(TradingMode::Scalp, Decimal::new(2_800, 0));
        let verdict = engine.check_capacity_verdict(TradingMode::Scalp, Decimal::new(700, 0));
        assert_eq!(verdict.code(), Some("mode_capacity"));

        let mut config = ModeAllocationConfig::default();
        if let Some(budget) = config.budgets.get_mut(&TradingMode::Scalp) {
            budget.max_usd_per_position = Decimal::ZERO;
        }
        let uncapped = ModeAllocationEngine::new(config, Decimal::new(10_000, 0));
        assert!(uncapped.check_capacity(TradingMode::Scalp, Decimal::new(2_900, 0)));
    }

    #[test]
    fn test_max_positions() {
        let mut engine = engine(10_000);
        engine.open_position(TradingMode::Position, Decimal::new(100, 0));
        engine.open_position(TradingMode::Position, Decimal::new(100, 0));

        let verdict = engine.check_capacity_verdict(TradingMode::Position, Decimal::new(100, 0));
        assert_eq!(verdict.code(), Some("mode_max_positions"));

        engine.close_position(TradingMode::Position, Decimal::new(100, 0));
        assert!(engine.check_capacity(TradingMode::Position, Decimal::new(100, 0)));
    }

    #[test]
    fn test_close_saturates_at_zero() {
        let mut engine = engine(10_000);
        engine.open_position(TradingMode::Swing, Decimal::new(100, 0));
        engine.close_position(TradingMode::Swing, Decimal::new(500, 0));
        engine.close_position(TradingMode::Swing, Decimal::new(500, 0));
        assert_eq!(engine.used_usd(TradingMode::Swing), Decimal::ZERO);
        assert_eq!(engine.current_positions(TradingMode::Swing), 0);
    }

    #[test]
    fn test_update_allocation_validates_sum() {
        let mut engine = engine(10_000);

        let bad = AllocationPercentages {
            ultra_fast_percent: Decimal::new(30, 0),
            scalp_percent: Decimal::new(30, 0),
            swing_percent: Decimal::new(30, 0),
            position_percent: Decimal::new(30, 0),
        };
        assert!(engine.update_allocation(&bad).is_err());
        assert_eq!(engine.allocated_usd(TradingMode::Scalp), Decimal::new(3_000, 0));

        // 100.5% is within tolerance
        let ok = AllocationPercentages {
            ultra_fast_percent: Decimal::new(10, 0),
            scalp_percent: Decimal::new(405, 1),
            swing_percent: Decimal::new(35, 0),
            position_percent: Decimal::new(15, 0),
        };
        engine.update_allocation(&ok).unwrap();
        assert_eq!(engine.allocated_usd(TradingMode::Scalp), Decimal::new(4_050, 0));
        // Other sub-settings kept
        assert_eq!(
            engine.config().budget(TradingMode::Scalp).unwrap().max_positions,
            10
        );
    }

    #[test]
    fn test_negative_percent_rejected() {
        let mut engine = engine(10_000);
        let bad = AllocationPercentages {
            ultra_fast_percent: Decimal::new(-10, 0),
            scalp_percent: Decimal::new(60, 0),
            swing_percent: Decimal::new(35, 0),
            position_percent: Decimal::new(15, 0),
        };
        assert!(engine.update_allocation(&bad).is_err());
    }

    #[test]
    fn test_fee_warning_levels() {
        // Ultra-fast: 20% of 1000 over 3 positions = 66.67 per position
        let small = engine(1_000);
        assert_eq!(
            small.fee_impact(TradingMode::UltraFast).warning_level,
            FeeWarningLevel::Critical
        );
        // Position: 15% of 2000 over 2 positions = 150
        let medium = engine(2_000);
        assert_eq!(
            medium.fee_impact(TradingMode::Position).warning_level,
            FeeWarningLevel::Medium
        );
        let large = engine(100_000);
        let impact = large.fee_impact(TradingMode::Swing);
        assert_eq!(impact.warning_level, FeeWarningLevel::Low);
        assert_eq!(impact.per_position_fee_usd, Decimal::new(7, 0));
    }

    #[test]
    fn test_rebalance_recommendations() {
        let config = ModeAllocationConfig {
            allow_dynamic_rebalance: true,
            ..ModeAllocationConfig::default()
        };
        let mut engine = ModeAllocationEngine::new(config, Decimal::new(10_000, 0));
        assert!(engine.rebalance_recommendations().is_empty());

        // Everything deployed in scalp: scalp 100% vs 30% target
        engine.open_position(TradingMode::Scalp, Decimal::new(1_000, 0));
        let recs = engine.rebalance_recommendations();
        let modes: Vec<TradingMode> = recs.iter().map(|r| r.mode).collect();
        assert!(modes.contains(&TradingMode::Scalp));
        assert!(modes.contains(&TradingMode::Swing));
        assert!(!modes.contains(&TradingMode::Position));
    }

    #[test]
    fn test_rebalance_disabled_by_default() {
        let mut engine = engine(10_000);
        engine.open_position(TradingMode::Scalp, Decimal::new(1_000, 0));
        assert!(engine.rebalance_recommendations().is_empty());
    }

    #[test]
    fn test_allocation_status() {
        let mut engine = engine(10_000);
        engine.open_position(TradingMode::Swing, Decimal::new(875, 0));
        let status = engine.allocation_status();
        let swing = status
            .modes
            .iter()
            .find(|m| m.mode == TradingMode::Swing)
            .unwrap();
        assert_eq!(swing.allocated_usd, Decimal::new(3_500, 0));
        assert_eq!(swing.available_usd, Decimal::new(2_625, 0));
        assert_eq!(swing.capacity_percent, Decimal::new(25, 0));
        assert_eq!(status.modes.len(), 4);
    }

    #[test]
    fn test_negative_capital_rejected() {
        let mut engine = engine(10_000);
        assert!(engine.set_total_capital(Decimal::new(-1, 0)).is_err());
        assert_eq!(engine.total_capital(), Decimal::new(10_000, 0));
    }
}
