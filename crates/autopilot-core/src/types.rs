//! Core domain types for the autopilot risk core.

pub mod intent;
pub mod mode;
pub mod order;
pub mod position;

pub use intent::*;
pub use mode::*;
pub use order::*;
pub use position::*;
