//! Circuit breaker for emergency trading halts.
//!
//! Tracks realized P&L and trade frequency in rolling windows (1 minute,
//! 1 hour, 24 hours) plus a consecutive-loss streak. Any breach trips the
//! breaker, which then denies every intent until the cooldown elapses or an
//! operator resets it.
//!
//! A trip settles the outcomes that caused it: once trading resumes, threshold
//! checks only look at outcomes recorded after the trip. Reported counters
//! always cover the full windows.

use autopilot_core::types::{GuardKind, Verdict};
use autopilot_core::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{error, info, warn};

/// Reason for circuit breaker activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripReason {
    /// Net loss over the last 24 hours exceeded the limit.
    MaxDailyLoss,
    /// Net loss over the last hour exceeded the limit.
    MaxLossPerHour,
    /// Too many losing trades in a row.
    MaxConsecutiveLosses,
    /// Too many trades in the last 24 hours.
    MaxDailyTrades,
    /// Too many trades in the last minute.
    MaxTradesPerMinute,
    /// Operator kill switch.
    Manual,
}

impl TripReason {
    /// Stable code reported in deny verdicts.
    pub fn code(&self) -> &'static str {
        match self {
            TripReason::MaxDailyLoss => "max_daily_loss",
            TripReason::MaxLossPerHour => "max_loss_per_hour",
            TripReason::MaxConsecutiveLosses => "max_consecutive_losses",
            TripReason::MaxDailyTrades => "max_daily_trades",
            TripReason::MaxTradesPerMinute => "max_trades_per_minute",
            TripReason::Manual => "manual",
        }
    }
}

/// Configuration for circuit breaker thresholds. A threshold of zero disables
/// that check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Whether circuit breaker is enabled.
    pub enabled: bool,
    /// Maximum net loss over a rolling hour (currency).
    pub max_loss_per_hour: Decimal,
    /// Maximum net loss over a rolling 24 hours (currency).
    pub max_daily_loss: Decimal,
    /// Number of consecutive losses before halt.
    pub max_consecutive_losses: u32,
    /// Cooldown period after trip (in minutes).
    pub cooldown_minutes: i64,
    pub max_trades_per_minute: u32,
    pub max_daily_trades: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_loss_per_hour: Decimal::new(100, 0), // $100 per rolling hour
            max_daily_loss: Decimal::new(300, 0),    // $300 per rolling day
            max_consecutive_losses: 5,
            cooldown_minutes: 30,
            max_trades_per_minute: 10,
            max_daily_trades: 100,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_loss_per_hour < Decimal::ZERO || self.max_daily_loss < Decimal::ZERO {
            return Err(Error::Validation(
                "loss limits must be non-negative".to_string(),
            ));
        }
        if self.cooldown_minutes < 0 {
            return Err(Error::Validation(
                "cooldown_minutes must be non-negative".to_string(),
            ));
        }
        if self.enabled && self.cooldown_minutes == 0 {
            return Err(Error::Validation(
                "cooldown_minutes must be positive when the breaker is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

/// One settled trade as seen by the breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeOutcome {
    pub pnl: Decimal,
    pub recorded_at: DateTime<Utc>,
}

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerState {
    /// Whether trading is currently halted.
    pub tripped: bool,
    pub trip_reason: Option<TripReason>,
    /// Human-readable description of the breach.
    pub trip_message: Option<String>,
    pub tripped_at: Option<DateTime<Utc>>,
    /// When trading can resume (if tripped).
    pub resume_at: Option<DateTime<Utc>>,
    /// Count of consecutive losing trades.
    pub consecutive_losses: u32,
    pub total_trips: u32,
    /// Outcomes at or before this instant no longer count toward a trip.
    settled_through: Option<DateTime<Utc>>,
    /// Part of the streak that was already settled by a trip.
    settled_streak: u32,
    /// Outcome log, pruned to 24 hours.
    outcomes: VecDeque<TradeOutcome>,
}

/// Rolling-window accumulators.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakerCounters {
    pub loss_last_hour: Decimal,
    pub loss_last_day: Decimal,
    pub consecutive_losses: u32,
    pub trades_last_minute: u32,
    pub trades_last_day: u32,
}

/// Snapshot reported to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    pub enabled: bool,
    pub tripped: bool,
    pub reason: Option<String>,
    pub tripped_at: Option<DateTime<Utc>>,
    pub resume_at: Option<DateTime<Utc>>,
    pub total_trips: u32,
    pub counters: BreakerCounters,
    pub config: CircuitBreakerConfig,
}

/// Circuit breaker for emergency trading halts.
///
/// Callers serialize access (the owning instance holds it behind a mutex).
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitBreakerState,
}

fn net_loss<'a>(outcomes: impl Iterator<Item = &'a TradeOutcome>) -> Decimal {
    let net: Decimal = outcomes.map(|o| o.pnl).sum();
    if net < Decimal::ZERO {
        -net
    } else {
        Decimal::ZERO
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitBreakerState::default(),
        }
    }

    /// Rebuild a breaker from persisted state.
    pub fn restore(config: CircuitBreakerConfig, state: CircuitBreakerState) -> Self {
        Self { config, state }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> &CircuitBreakerState {
        &self.state
    }

    pub fn is_tripped(&self) -> bool {
        self.state.tripped
    }

    /// Check whether a new trade may be placed.
    pub fn evaluate(&mut self) -> Verdict {
        self.evaluate_at(Utc::now())
    }

    pub fn evaluate_at(&mut self, now: DateTime<Utc>) -> Verdict {
        if !self.config.enabled {
            return Verdict::Allow;
        }

        if self.state.tripped {
            match self.state.resume_at {
                Some(resume_at) if now >= resume_at => {
                    info!(
                        reason = ?self.state.trip_reason,
                        "Circuit breaker cooldown expired, resuming trading"
                    );
                    self.clear_trip();
                }
                _ => return self.tripped_verdict(now),
            }
        }

        if let Some((reason, message)) = self.check_thresholds(now) {
            self.trip_internal(reason, message, now);
            return self.tripped_verdict(now);
        }

        Verdict::Allow
    }

    /// Record a settled trade. Returns the trip reason if this outcome tripped
    /// the breaker.
    pub fn record_outcome(&mut self, pnl: Decimal) -> Option<TripReason> {
        self.record_outcome_at(pnl, Utc::now())
    }

    pub fn record_outcome_at(&mut self, pnl: Decimal, now: DateTime<Utc>) -> Option<TripReason> {
        // Outcomes are kept even while disabled so that re-enabling starts
        // with the recent history.
        self.state.outcomes.push_back(TradeOutcome {
            pnl,
            recorded_at: now,
        });
        self.prune(now);

        if pnl < Decimal::ZERO {
            self.state.consecutive_losses += 1;
        } else {
            self.state.consecutive_losses = 0;
            self.state.settled_streak = 0;
        }

        if !self.config.enabled || self.state.tripped {
            return None;
        }

        let (reason, message) = self.check_thresholds(now)?;
        self.trip_internal(reason, message, now);
        Some(reason)
    }

    /// Operator kill switch.
    pub fn trip_manual(&mut self, reason: Option<String>) {
        self.trip_manual_at(reason, Utc::now());
    }

    pub fn trip_manual_at(&mut self, reason: Option<String>, now: DateTime<Utc>) {
        warn!(reason = ?reason, "Manual circuit breaker trip");
        let message = reason.unwrap_or_else(|| "manual halt".to_string());
        self.trip_internal(TripReason::Manual, message, now);
    }

    /// Operator override: clear the trip and the loss streak immediately.
    pub fn reset(&mut self) {
        self.reset_at(Utc::now());
    }

    pub fn reset_at(&mut self, now: DateTime<Utc>) {
        if self.state.tripped {
            self.clear_trip();
        }
        // Everything recorded so far is considered handled by the operator.
        self.state.settled_through = Some(now);
        self.state.consecutive_losses = 0;
        self.state.settled_streak = 0;
        info!("Circuit breaker reset");
    }

    /// Replace the configuration. Invalid configs are rejected and the current
    /// one is kept.
    pub fn update_config(&mut self, config: CircuitBreakerConfig) -> Result<()> {
        config.validate()?;
        if config.enabled != self.config.enabled {
            info!(
                enabled = config.enabled,
                "Circuit breaker {}",
                if config.enabled { "enabled" } else { "disabled" }
            );
        }
        self.config = config;
        info!("Circuit breaker config updated");
        Ok(())
    }

    pub fn status(&self) -> CircuitBreakerStatus {
        self.status_at(Utc::now())
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> CircuitBreakerStatus {
        CircuitBreakerStatus {
            enabled: self.config.enabled,
            tripped: self.state.tripped,
            reason: self.state.trip_message.clone(),
            tripped_at: self.state.tripped_at,
            resume_at: self.state.resume_at,
            total_trips: self.state.total_trips,
            counters: self.counters_at(now),
            config: self.config.clone(),
        }
    }

    /// Window accumulators over every outcome, settled or not.
    pub fn counters_at(&self, now: DateTime<Utc>) -> BreakerCounters {
        self.accumulate(now, None, 0)
    }

    // Private methods

    fn accumulate(
        &self,
        now: DateTime<Utc>,
        since: Option<DateTime<Utc>>,
        settled_streak: u32,
    ) -> BreakerCounters {
        let minute_ago = now - Duration::minutes(1);
        let hour_ago = now - Duration::hours(1);
        let day_ago = now - Duration::hours(24);
        let counted = |o: &&TradeOutcome| since.map_or(true, |s| o.recorded_at > s);

        let day: Vec<&TradeOutcome> = self
            .state
            .outcomes
            .iter()
            .filter(|o| o.recorded_at > day_ago)
            .filter(counted)
            .collect();

        BreakerCounters {
            loss_last_hour: net_loss(day.iter().copied().filter(|o| o.recorded_at > hour_ago)),
            loss_last_day: net_loss(day.iter().copied()),
            consecutive_losses: self.state.consecutive_losses.saturating_sub(settled_streak),
            trades_last_minute: day.iter().filter(|o| o.recorded_at > minute_ago).count() as u32,
            trades_last_day: day.len() as u32,
        }
    }

    fn check_thresholds(&self, now: DateTime<Utc>) -> Option<(TripReason, String)> {
        let cfg = &self.config;
        let c = self.accumulate(now, self.state.settled_through, self.state.settled_streak);

        if cfg.max_daily_loss > Decimal::ZERO && c.loss_last_day > cfg.max_daily_loss {
            return Some((
                TripReason::MaxDailyLoss,
                format!(
                    "daily loss {} exceeds limit {}",
                    c.loss_last_day, cfg.max_daily_loss
                ),
            ));
        }
        if cfg.max_loss_per_hour > Decimal::ZERO && c.loss_last_hour > cfg.max_loss_per_hour {
            return Some((
                TripReason::MaxLossPerHour,
                format!(
                    "hourly loss {} exceeds limit {}",
                    c.loss_last_hour, cfg.max_loss_per_hour
                ),
            ));
        }
        if cfg.max_consecutive_losses > 0 && c.consecutive_losses >= cfg.max_consecutive_losses {
            return Some((
                TripReason::MaxConsecutiveLosses,
                format!("{} consecutive losses", c.consecutive_losses),
            ));
        }
        if cfg.max_daily_trades > 0 && c.trades_last_day >= cfg.max_daily_trades {
            return Some((
                TripReason::MaxDailyTrades,
                format!("daily trade limit reached: {} trades", c.trades_last_day),
            ));
        }
        if cfg.max_trades_per_minute > 0 && c.trades_last_minute >= cfg.max_trades_per_minute {
            return Some((
                TripReason::MaxTradesPerMinute,
                format!("rate limit reached: {} trades/minute", c.trades_last_minute),
            ));
        }
        None
    }

    fn tripped_verdict(&self, now: DateTime<Utc>) -> Verdict {
        let code = self
            .state
            .trip_reason
            .map(|r| r.code())
            .unwrap_or("tripped");
        let remaining = self
            .state
            .resume_at
            .map(|r| (r - now).num_seconds().max(0))
            .unwrap_or(0);
        let reason = self.state.trip_message.as_deref().unwrap_or("tripped");
        Verdict::deny(
            GuardKind::CircuitBreaker,
            code,
            format!("circuit breaker open ({reason}), cooldown remaining: {remaining}s"),
        )
    }

    fn trip_internal(&mut self, reason: TripReason, message: String, now: DateTime<Utc>) {
        let resume_at = now + Duration::minutes(self.config.cooldown_minutes);
        let counters = self.counters_at(now);

        self.state.tripped = true;
        self.state.trip_reason = Some(reason);
        self.state.trip_message = Some(message);
        self.state.tripped_at = Some(now);
        self.state.resume_at = Some(resume_at);
        self.state.total_trips += 1;
        self.state.settled_through = Some(now);
        self.state.settled_streak = self.state.consecutive_losses;

        error!(
            reason = reason.code(),
            resume_at = %resume_at,
            loss_last_day = %counters.loss_last_day,
            consecutive_losses = self.state.consecutive_losses,
            "Circuit breaker TRIPPED - trading halted"
        );
    }

    fn clear_trip(&mut self) {
        self.state.tripped = false;
        self.state.trip_reason = None;
        self.state.trip_message = None;
        self.state.tripped_at = None;
        self.state.resume_at = None;
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let horizon = now - Duration::hours(24);
        while self
            .state
            .outcomes
            .front()
            .is_some_and(|o| o.recorded_at <= horizon)
        {
            self.state.outcomes.pop_front();
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-02T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn loss_only_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            enabled: true,
            max_loss_per_hour: Decimal::ZERO,
            max_daily_loss: Decimal::new(300, 0),
            max_consecutive_losses: 0,
            cooldown_minutes: 30,
            max_trades_per_minute: 0,
            max_daily_trades: 0,
        }
    }

    #[test]
    fn test_daily_loss_trip_and_cooldown() {
        let mut breaker = CircuitBreaker::new(loss_only_config());
        let start = t0();

        for (i, pnl) in [-100, -80, -90, -50].iter().enumerate() {
            breaker.record_outcome_at(
                Decimal::new(*pnl, 0),
                start + Duration::minutes(i as i64),
            );
        }
        let last = start + Duration::minutes(3);

        let verdict = breaker.evaluate_at(last);
        assert_eq!(verdict.code(), Some("max_daily_loss"));
        assert!(breaker.is_tripped());

        // Still inside cooldown
        let verdict = breaker.evaluate_at(last + Duration::minutes(29));
        assert!(!verdict.is_allowed());

        let verdict = breaker.evaluate_at(last + Duration::minutes(30));
        assert!(verdict.is_allowed());
        assert!(!breaker.is_tripped());

        // Counters are not cleared by the cooldown
        let status = breaker.status_at(last + Duration::minutes(30));
        assert_eq!(status.counters.loss_last_day, Decimal::new(320, 0));
        assert_eq!(status.total_trips, 1);
    }

    #[test]
    fn test_loss_at_limit_does_not_trip() {
        let mut breaker = CircuitBreaker::new(loss_only_config());
        breaker.record_outcome_at(Decimal::new(-300, 0), t0());
        assert!(breaker.evaluate_at(t0()).is_allowed());
    }

    #[test]
    fn test_wins_offset_losses_in_window() {
        let mut breaker = CircuitBreaker::new(loss_only_config());
        breaker.record_outcome_at(Decimal::new(-250, 0), t0());
        breaker.record_outcome_at(Decimal::new(100, 0), t0());
        breaker.record_outcome_at(Decimal::new(-100, 0), t0());
        assert!(breaker.evaluate_at(t0()).is_allowed());
    }

    #[test]
    fn test_hourly_window_slides() {
        let config = CircuitBreakerConfig {
            max_loss_per_hour: Decimal::new(50, 0),
            max_daily_loss: Decimal::ZERO,
            ..loss_only_config()
        };
        let mut breaker = CircuitBreaker::new(config);
        breaker.record_outcome_at(Decimal::new(-40, 0), t0());
        breaker.record_outcome_at(Decimal::new(-20, 0), t0() + Duration::minutes(61));

        // The first loss has left the hourly window
        assert!(breaker.evaluate_at(t0() + Duration::minutes(61)).is_allowed());

        breaker.record_outcome_at(Decimal::new(-40, 0), t0() + Duration::minutes(62));
        let verdict = breaker.evaluate_at(t0() + Duration::minutes(62));
        assert_eq!(verdict.code(), Some("max_loss_per_hour"));
    }

    #[test]
    fn test_consecutive_losses_trip_and_win_resets() {
        let config = CircuitBreakerConfig {
            max_consecutive_losses: 3,
            max_daily_loss: Decimal::ZERO,
            ..loss_only_config()
        };
        let mut breaker = CircuitBreaker::new(config);

        breaker.record_outcome_at(Decimal::new(-1, 0), t0());
        breaker.record_outcome_at(Decimal::new(-1, 0), t0());
        breaker.record_outcome_at(Decimal::new(5, 0), t0());
        assert_eq!(breaker.state().consecutive_losses, 0);

        breaker.record_outcome_at(Decimal::new(-1, 0), t0());
        breaker.record_outcome_at(Decimal::new(-1, 0), t0());
        let tripped = breaker.record_outcome_at(Decimal::new(-1, 0), t0());
        assert_eq!(tripped, Some(TripReason::MaxConsecutiveLosses));

        // After the cooldown the settled streak does not re-trip
        let verdict = breaker.evaluate_at(t0() + Duration::minutes(30));
        assert!(verdict.is_allowed());
        assert_eq!(breaker.state().consecutive_losses, 3);
    }

    #[test]
    fn test_trade_rate_limit() {
        let config = CircuitBreakerConfig {
            max_trades_per_minute: 3,
            max_daily_loss: Decimal::ZERO,
            ..loss_only_config()
        };
        let mut breaker = CircuitBreaker::new(config);
        for _ in 0..2 {
            breaker.record_outcome_at(Decimal::ONE, t0());
        }
        assert!(breaker.evaluate_at(t0()).is_allowed());

        breaker.record_outcome_at(Decimal::ONE, t0());
        assert_eq!(
            breaker.evaluate_at(t0()).code(),
            Some("max_trades_per_minute")
        );
    }

    #[test]
    fn test_daily_trades_checked_before_rate() {
        let config = CircuitBreakerConfig {
            max_trades_per_minute: 2,
            max_daily_trades: 2,
            max_daily_loss: Decimal::ZERO,
            ..loss_only_config()
        };
        let mut breaker = CircuitBreaker::new(config);
        breaker.record_outcome_at(Decimal::ONE, t0());
        let reason = breaker.record_outcome_at(Decimal::ONE, t0());
        assert_eq!(reason, Some(TripReason::MaxDailyTrades));
    }

    #[test]
    fn test_reset_bypasses_cooldown() {
        let mut breaker = CircuitBreaker::new(loss_only_config());
        breaker.record_outcome_at(Decimal::new(-500, 0), t0());
        assert!(breaker.is_tripped());

        breaker.reset_at(t0() + Duration::minutes(1));
        assert!(!breaker.is_tripped());
        assert!(breaker.evaluate_at(t0() + Duration::minutes(1)).is_allowed());
        assert_eq!(breaker.state().consecutive_losses, 0);
    }

    #[test]
    fn test_new_losses_after_resume_trip_again() {
        let mut breaker = CircuitBreaker::new(loss_only_config());
        breaker.record_outcome_at(Decimal::new(-400, 0), t0());
        assert!(breaker
            .evaluate_at(t0() + Duration::minutes(30))
            .is_allowed());

        let later = t0() + Duration::minutes(40);
        breaker.record_outcome_at(Decimal::new(-301, 0), later);
        assert_eq!(breaker.evaluate_at(later).code(), Some("max_daily_loss"));
        assert_eq!(breaker.state().total_trips, 2);
    }

    #[test]
    fn test_zero_threshold_disables_check() {
        let config = CircuitBreakerConfig {
            max_daily_loss: Decimal::ZERO,
            ..loss_only_config()
        };
        let mut breaker = CircuitBreaker::new(config);
        breaker.record_outcome_at(Decimal::new(-10_000, 0), t0());
        assert!(breaker.evaluate_at(t0()).is_allowed());
    }

    #[test]
    fn test_disabled_breaker_allows_but_keeps_recording() {
        let config = CircuitBreakerConfig {
            enabled: false,
            ..loss_only_config()
        };
        let mut breaker = CircuitBreaker::new(config);

        breaker.record_outcome_at(Decimal::new(-500, 0), t0());
        assert!(breaker.evaluate_at(t0()).is_allowed());
        assert!(!breaker.is_tripped());
        assert_eq!(
            breaker.counters_at(t0()).loss_last_day,
            Decimal::new(500, 0)
        );

        // Re-enabling starts with the recorded history
        breaker.update_config(loss_only_config()).unwrap();
        let verdict = breaker.evaluate_at(t0() + Duration::minutes(1));
        assert_eq!(verdict.code(), Some("max_daily_loss"));
    }

    #[test]
    fn test_manual_trip() {
        let mut breaker = CircuitBreaker::default();
        breaker.trip_manual_at(Some("maintenance".to_string()), t0());

        let verdict = breaker.evaluate_at(t0() + Duration::minutes(5));
        assert_eq!(verdict.code(), Some("manual"));
        assert!(verdict.denial().unwrap().message.contains("maintenance"));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut breaker = CircuitBreaker::default();
        let bad = CircuitBreakerConfig {
            cooldown_minutes: 0,
            ..CircuitBreakerConfig::default()
        };
        assert!(breaker.update_config(bad).is_err());
        assert_eq!(breaker.config().cooldown_minutes, 30);

        let negative = CircuitBreakerConfig {
            max_daily_loss: Decimal::new(-1, 0),
            ..CircuitBreakerConfig::default()
        };
        assert!(breaker.update_config(negative).is_err());
    }

    #[test]
    fn test_outcome_log_pruned_to_one_day() {
        let mut breaker = CircuitBreaker::new(loss_only_config());
        breaker.record_outcome_at(Decimal::new(-200, 0), t0());
        breaker.record_outcome_at(Decimal::new(-200, 0), t0() + Duration::hours(25));

        let counters = breaker.counters_at(t0() + Duration::hours(25));
        assert_eq!(counters.trades_last_day, 1);
        assert_eq!(counters.loss_last_day, Decimal::new(200, 0));
        assert!(!breaker.is_tripped());
    }
}
