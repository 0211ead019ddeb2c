//! Per-mode safety guards.
//!
//! Each trading mode is paused independently when its recent win rate drops
//! below a floor or when its cumulative pnl percent over a rolling window
//! falls below a (negative) bound.

use autopilot_core::types::{GuardKind, TradingMode, Verdict};
use autopilot_core::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::{info, warn};

/// Thresholds for one mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeSafetyConfig {
    pub enable_win_rate_monitor: bool,
    /// Trades considered for the win rate.
    pub win_rate_sample_size: usize,
    /// Minimum win rate, percent.
    pub min_win_rate_threshold: Decimal,
    pub win_rate_cooldown_minutes: i64,
    pub enable_profit_monitor: bool,
    pub profit_window_minutes: i64,
    /// Negative percent bound on cumulative pnl within the window.
    pub max_loss_percent_in_window: Decimal,
    pub pause_cooldown_minutes: i64,
}

impl ModeSafetyConfig {
    pub fn for_mode(mode: TradingMode) -> Self {
        // (window, max loss, pause cooldown, sample, min win rate, win-rate cooldown)
        let (window, max_loss, pause, sample, win_rate, win_cooldown) = match mode {
            TradingMode::UltraFast => (10, Decimal::new(-15, 1), 30, 15, 50, 60),
            TradingMode::Scalp => (15, Decimal::new(-20, 1), 30, 20, 50, 60),
            TradingMode::Swing => (60, Decimal::new(-30, 1), 60, 25, 55, 120),
            TradingMode::Position => (120, Decimal::new(-50, 1), 120, 30, 60, 180),
        };
        Self {
            enable_win_rate_monitor: true,
            win_rate_sample_size: sample,
            min_win_rate_threshold: Decimal::new(win_rate, 0),
            win_rate_cooldown_minutes: win_cooldown,
            enable_profit_monitor: true,
            profit_window_minutes: window,
            max_loss_percent_in_window: max_loss,
            pause_cooldown_minutes: pause,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.enable_win_rate_monitor {
            if self.win_rate_sample_size == 0 {
                return Err(Error::Validation(
                    "win_rate_sample_size must be at least 1".to_string(),
                ));
            }
            if self.min_win_rate_threshold < Decimal::ZERO
                || self.min_win_rate_threshold > Decimal::ONE_HUNDRED
            {
                return Err(Error::Validation(
                    "min_win_rate_threshold must be within 0-100".to_string(),
                ));
            }
            if self.win_rate_cooldown_minutes <= 0 {
                return Err(Error::Validation(
                    "win_rate_cooldown_minutes must be positive".to_string(),
                ));
            }
        }
        if self.enable_profit_monitor {
            if self.profit_window_minutes <= 0 {
                return Err(Error::Validation(
                    "profit_window_minutes must be positive".to_string(),
                ));
            }
            if self.max_loss_percent_in_window > Decimal::ZERO {
                return Err(Error::Validation(
                    "max_loss_percent_in_window must be zero or negative".to_string(),
                ));
            }
            if self.pause_cooldown_minutes <= 0 {
                return Err(Error::Validation(
                    "pause_cooldown_minutes must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    LowWinRate,
    WindowLoss,
}

impl PauseReason {
    pub fn code(&self) -> &'static str {
        match self {
            PauseReason::LowWinRate => "low_win_rate",
            PauseReason::WindowLoss => "window_loss",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ModeOutcome {
    won: bool,
    pnl_percent: Decimal,
    recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct ModeSafetyState {
    paused: bool,
    reason: Option<PauseReason>,
    message: Option<String>,
    paused_until: Option<DateTime<Utc>>,
    outcomes: VecDeque<ModeOutcome>,
    pause_count: u32,
}

/// Whether a mode is paused, and until when.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseInfo {
    pub paused: bool,
    pub reason: Option<PauseReason>,
    pub until: Option<DateTime<Utc>>,
}

/// Guard statistics for one mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeSafetyStatus {
    pub mode: TradingMode,
    pub paused: bool,
    pub reason: Option<PauseReason>,
    pub message: Option<String>,
    pub paused_until: Option<DateTime<Utc>>,
    /// Win rate over the sample, percent; `None` until the sample is full.
    pub win_rate: Option<Decimal>,
    pub sample_count: usize,
    pub window_pnl_percent: Decimal,
    pub pause_count: u32,
    pub config: ModeSafetyConfig,
}

/// Independent safety guards for every trading mode.
#[derive(Debug, Clone)]
pub struct ModeSafetyMonitor {
    configs: BTreeMap<TradingMode, ModeSafetyConfig>,
    states: BTreeMap<TradingMode, ModeSafetyState>,
}

impl ModeSafetyMonitor {
    pub fn new(configs: BTreeMap<TradingMode, ModeSafetyConfig>) -> Self {
        Self {
            configs,
            states: BTreeMap::new(),
        }
    }

    pub fn config(&self, mode: TradingMode) -> ModeSafetyConfig {
        self.configs
            .get(&mode)
            .cloned()
            .unwrap_or_else(|| ModeSafetyConfig::for_mode(mode))
    }

    pub fn update_config(&mut self, mode: TradingMode, config: ModeSafetyConfig) -> Result<()> {
        config.validate()?;
        self.configs.insert(mode, config);
        info!(mode = %mode, "Mode safety config updated");
        Ok(())
    }

    /// Deny intents for a paused mode.
    pub fn evaluate_at(&mut self, mode: TradingMode, now: DateTime<Utc>) -> Verdict {
        let info = self.is_paused_at(mode, now);
        if !info.paused {
            return Verdict::Allow;
        }
        let state = self.states.entry(mode).or_default();
        let code = info.reason.map(|r| r.code()).unwrap_or("paused");
        let message = state.message.clone().unwrap_or_default();
        Verdict::deny(
            GuardKind::ModeSafety,
            code,
            format!("{mode} paused: {message}"),
        )
    }

    pub fn record_mode_outcome(&mut self, mode: TradingMode, won: bool, pnl_percent: Decimal) {
        self.record_mode_outcome_at(mode, won, pnl_percent, Utc::now());
    }

    pub fn record_mode_outcome_at(
        &mut self,
        mode: TradingMode,
        won: bool,
        pnl_percent: Decimal,
        now: DateTime<Utc>,
    ) {
        let config = self.config(mode);
        // Expire a finished pause before deciding whether to pause again.
        self.is_paused_at(mode, now);

        let state = self.states.entry(mode).or_default();
        state.outcomes.push_back(ModeOutcome {
            won,
            pnl_percent,
            recorded_at: now,
        });
        Self::prune(state, &config, now);

        if state.paused {
            return;
        }

        if config.enable_profit_monitor {
            let window_pnl = Self::window_pnl(state, &config, now);
            if window_pnl < config.max_loss_percent_in_window {
                let message = format!(
                    "window pnl {}% below {}% over {}m",
                    window_pnl, config.max_loss_percent_in_window, config.profit_window_minutes
                );
                Self::pause(
                    mode,
                    state,
                    PauseReason::WindowLoss,
                    message,
                    now + Duration::minutes(config.pause_cooldown_minutes),
                );
                return;
            }
        }

        if config.enable_win_rate_monitor {
            if let Some(win_rate) = Self::win_rate(state, &config) {
                if win_rate < config.min_win_rate_threshold {
                    let message = format!(
                        "win rate {}% below {}% over last {} trades",
                        win_rate.round_dp(2),
                        config.min_win_rate_threshold,
                        config.win_rate_sample_size
                    );
                    Self::pause(
                        mode,
                        state,
                        PauseReason::LowWinRate,
                        message,
                        now + Duration::minutes(config.win_rate_cooldown_minutes),
                    );
                }
            }
        }
    }

    pub fn is_paused(&mut self, mode: TradingMode) -> PauseInfo {
        self.is_paused_at(mode, Utc::now())
    }

    /// Current pause state; a pause past its deadline clears here.
    pub fn is_paused_at(&mut self, mode: TradingMode, now: DateTime<Utc>) -> PauseInfo {
        let state = self.states.entry(mode).or_default();
        if state.paused && state.paused_until.is_some_and(|until| now >= until) {
            info!(mode = %mode, reason = ?state.reason, "Mode pause expired");
            // Samples are kept; the guard re-evaluates on the next outcome.
            state.paused = false;
            state.reason = None;
            state.message = None;
            state.paused_until = None;
        }
        PauseInfo {
            paused: state.paused,
            reason: state.reason,
            until: state.paused_until,
        }
    }

    /// Manual resume: clear the pause and the sample window.
    pub fn resume(&mut self, mode: TradingMode) {
        let state = self.states.entry(mode).or_default();
        let was_paused = state.paused;
        state.paused = false;
        state.reason = None;
        state.message = None;
        state.paused_until = None;
        state.outcomes.clear();
        info!(mode = %mode, was_paused, "Mode resumed manually");
    }

    pub fn status_at(&self, mode: TradingMode, now: DateTime<Utc>) -> ModeSafetyStatus {
        let config = self.config(mode);
        let empty = ModeSafetyState::default();
        let state = self.states.get(&mode).unwrap_or(&empty);
        let expired = state.paused_until.is_some_and(|until| now >= until);
        let paused = state.paused && !expired;

        ModeSafetyStatus {
            mode,
            paused,
            reason: if paused { state.reason } else { None },
            message: if paused { state.message.clone() } else { None },
            paused_until: if paused { state.paused_until } else { None },
            win_rate: Self::win_rate(state, &config),
            sample_count: state.outcomes.len().min(config.win_rate_sample_size),
            window_pnl_percent: Self::window_pnl(state, &config, now),
            pause_count: state.pause_count,
            config,
        }
    }

    pub fn status(&self) -> Vec<ModeSafetyStatus> {
        let now = Utc::now();
        TradingMode::ALL
            .iter()
            .map(|mode| self.status_at(*mode, now))
            .collect()
    }

    // Private helpers

    fn pause(
        mode: TradingMode,
        state: &mut ModeSafetyState,
        reason: PauseReason,
        message: String,
        until: DateTime<Utc>,
    ) {
        warn!(
            mode = %mode,
            reason = reason.code(),
            until = %until,
            detail = %message,
            "Mode paused by safety monitor"
        );
        state.paused = true;
        state.reason = Some(reason);
        state.message = Some(message);
        state.paused_until = Some(until);
        state.pause_count += 1;
    }

    fn win_rate(state: &ModeSafetyState, config: &ModeSafetyConfig) -> Option<Decimal> {
        let n = config.win_rate_sample_size;
        if n == 0 || state.outcomes.len() < n {
            return None;
        }
        let wins = state.outcomes.iter().rev().take(n).filter(|o| o.won).count();
        Some(Decimal::from(wins as u64) * Decimal::ONE_HUNDRED / Decimal::from(n as u64))
    }

    fn window_pnl(state: &ModeSafetyState, config: &ModeSafetyConfig, now: DateTime<Utc>) -> Decimal {
        let since = now - Duration::minutes(config.profit_window_minutes);
        state
            .outcomes
            .iter()
            .filter(|o| o.recorded_at > since)
            .map(|o| o.pnl_percent)
            .sum()
    }

    /// Keep enough history for both guards.
    fn prune(state: &mut ModeSafetyState, config: &ModeSafetyConfig, now: DateTime<Utc>) {
        let since = now - Duration::minutes(config.profit_window_minutes.max(0));
        let keep = config.win_rate_sample_size;
        while state.outcomes.len() > keep
            && state.outcomes.front().is_some_and(|o| o.recorded_at <= since)
        {
            state.outcomes.pop_front();
        }
    }
}

impl Default for ModeSafetyMonitor {
    fn default() -> Self {
        let configs = TradingMode::ALL
            .iter()
            .map(|mode| (*mode, ModeSafetyConfig::for_mode(*mode)))
            .collect();
        Self::new(configs)
    }
}
