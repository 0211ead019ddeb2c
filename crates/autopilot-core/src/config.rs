//! Configuration management for the autopilot supervisor.

use serde::Deserialize;
use std::time::Duration;

use crate::{Error, Result};

/// How users map onto autopilot instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnershipMode {
    /// One instance per user; the user owns it for its whole life.
    Dedicated,
    /// A single controller instance claimed by whoever starts it.
    Shared,
}

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub ownership_mode: OwnershipMode,
    /// Idle instances older than this are evicted.
    pub retention_minutes: u64,
    pub cleanup_interval_secs: u64,
    pub loop_interval_secs: u64,
    pub exchange_timeout_ms: u64,
    pub stop_timeout_ms: u64,
    pub persistence_queue_capacity: usize,
    /// Starting capital for paper accounts.
    pub paper_balance: u64,
    #[serde(default)]
    pub database_url: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            ownership_mode: OwnershipMode::Dedicated,
            retention_minutes: 30,
            cleanup_interval_secs: 300,
            loop_interval_secs: 5,
            exchange_timeout_ms: 10_000,
            stop_timeout_ms: 15_000,
            persistence_queue_capacity: 256,
            paper_balance: 10_000,
            database_url: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from `AUTOPILOT_*` environment variables.
    ///
    /// `DATABASE_URL` is honoured without the prefix.
    #[allow(clippy::result_large_err)]
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let settings = config::Config::builder()
            .set_default("ownership_mode", "dedicated")?
            .set_default("retention_minutes", defaults.retention_minutes)?
            .set_default("cleanup_interval_secs", defaults.cleanup_interval_secs)?
            .set_default("loop_interval_secs", defaults.loop_interval_secs)?
            .set_default("exchange_timeout_ms", defaults.exchange_timeout_ms)?
            .set_default("stop_timeout_ms", defaults.stop_timeout_ms)?
            .set_default(
                "persistence_queue_capacity",
                defaults.persistence_queue_capacity as u64,
            )?
            .set_default("paper_balance", defaults.paper_balance)?
            .set_override_option("database_url", std::env::var("DATABASE_URL").ok())?
            .add_source(config::Environment::with_prefix("AUTOPILOT").try_parsing(true))
            .build()?;

        let cfg: Self = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    #[allow(clippy::result_large_err)]
    pub fn validate(&self) -> Result<()> {
        if self.loop_interval_secs == 0 {
            return Err(Error::Validation(
                "loop_interval_secs must be positive".to_string(),
            ));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(Error::Validation(
                "cleanup_interval_secs must be positive".to_string(),
            ));
        }
        if self.persistence_queue_capacity == 0 {
            return Err(Error::Validation(
                "persistence_queue_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.retention_minutes as i64)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn loop_interval(&self) -> Duration {
        Duration::from_secs(self.loop_interval_secs)
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}
