//! Autopilot Risk: risk controls and multi-tenant orchestration for automated trading
//!
//! This is the root crate that provides benchmark and integration-test access
//! to the workspace crates. For actual functionality, use them directly:
//!
//! - `autopilot-core`: Shared types, errors, configuration, exchange and settings traits
//! - `risk-manager`: Circuit breaker, mode allocation, mode safety, hedging, config diffs
//! - `autopilot-engine`: Per-tenant instances, the manager, persistence queue

// Re-export for benchmarks
pub use autopilot_core as core;
pub use autopilot_engine as engine;
pub use risk_manager as risk;
