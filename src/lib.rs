// Core infrastructure modules
pub mod core;

// Fan-out/fan-in coordination
pub mod coord;

// Re-exports for convenience
pub use core::config::{ContinuationPolicy, CoordinatorConfig, FinalCallbackMode};
pub use core::errors::{ConvergeError, Result};
pub use core::metrics::MetricsSnapshot;

pub use coord::*;
