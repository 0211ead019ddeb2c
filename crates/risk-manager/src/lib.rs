//! Risk Manager
//!
//! Circuit breaker, per-mode safety guards, capital allocation and hedging
//! for autopilot trading.

pub mod circuit_breaker;
pub mod config_diff;
pub mod hedging;
pub mod mode_allocation;
pub mod mode_safety;

pub use circuit_breaker::{
    BreakerCounters, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus, TripReason,
};
pub use config_diff::{
    diff_allocation, diff_circuit_breaker, diff_hedge, diff_mode_safety, max_risk, RiskLevel,
    SettingChange,
};
pub use hedging::{
    HedgeConfig, HedgeDecision, HedgeRecord, HedgeStatus, HedgeTrigger, HedgingManager,
    MarketContext,
};
pub use mode_allocation::{
    AllocationPercentages, AllocationStatus, FeeImpact, FeeWarningLevel, ModeAllocation,
    ModeAllocationConfig, ModeAllocationEngine, ModeBudget, RebalanceRecommendation,
};
pub use mode_safety::{
    ModeSafetyConfig, ModeSafetyMonitor, ModeSafetyStatus, PauseInfo, PauseReason,
};
