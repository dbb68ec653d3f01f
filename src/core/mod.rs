// Infrastructure shared by the coordination layer

pub mod config;
pub mod errors;
pub mod metrics;

// Re-export commonly used types
pub use config::{ContinuationPolicy, CoordinatorConfig, CoordinatorConfigBuilder, FinalCallbackMode};
pub use errors::{ConvergeError, Result};
pub use metrics::{MetricsSnapshot, RunMetrics};
