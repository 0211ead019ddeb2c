//! Autopilot Core Library
//!
//! Shared types, collaborator traits, settings storage, and configuration for
//! the autopilot risk-control workspace.

pub mod config;
pub mod error;
pub mod exchange;
pub mod settings;
pub mod types;

pub use config::{AppConfig, OwnershipMode};
pub use error::{Error, ErrorKind, Result};
pub use exchange::{DecisionClient, ExchangeClient, PaperExchange, QueuedDecisionClient};
pub use settings::{
    load_or_default, save_typed, MemorySettingsStore, PgSettingsStore, SettingsKey,
    SettingsStore, TradingSettings,
};
