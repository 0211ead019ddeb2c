//! Autopilot Engine
//!
//! Per-tenant autopilot instances, the manager that owns them, and the
//! background workers they share.
//!
//! # Components
//!
//! - **AutopilotManager**: registry of instances keyed by tenant, ownership
//!   modes, idle eviction, auto-start and shutdown.
//! - **AutopilotInstance**: one tenant's guards, hedging, client bindings and
//!   trading loop.
//! - **PersistenceQueue**: bounded, non-blocking settings writer.
//! - **ClientFactory**: builds exchange and decision clients from stored
//!   credentials.

pub mod bindings;
pub mod instance;
pub mod manager;
pub mod persistence;
mod trading_loop;

pub use bindings::{
    BindAction, BindingOutcome, ClientBindings, ClientDescriptor, ClientFactory,
    PaperClientFactory,
};
pub use instance::{
    AutopilotInstance, BreakerRecord, CycleReport, GuardSet, InstanceDeps, InstanceOptions,
    InstanceStatus, OrderTicket, StartOutcome, StopOutcome, TicketStatus,
};
pub use manager::{
    AutopilotManager, ManagerOptions, ManagerStatus, UserAutopilotStatus, SHARED_INSTANCE_ID,
};
pub use persistence::{PersistenceQueue, PersistenceStats};
