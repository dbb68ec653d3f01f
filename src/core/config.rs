use crate::core::errors::{ConvergeError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Where operation completion handlers are driven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContinuationPolicy {
    /// Every operation gets its own runtime task
    #[default]
    Spawn,
    /// All operations of a run are driven together on a single runtime task
    Inline,
}

/// Whether run methods wait for the final callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FinalCallbackMode {
    /// Both run methods return only after the final callback has settled
    #[default]
    Awaited,
    /// The final callback fires in the background once the run settles
    Detached,
}

/// Coordinator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Reject construction when no operations are supplied
    pub require_operations: bool,
    /// Maximum number of operations driven at the same time
    pub max_concurrency: Option<usize>,
    /// How completion handlers are scheduled
    pub continuation: ContinuationPolicy,
    /// Whether run methods wait for the final callback
    pub final_callback_mode: FinalCallbackMode,
    /// Log every recorded failure at warn level
    pub log_failures: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            require_operations: false,
            max_concurrency: None,
            continuation: ContinuationPolicy::Spawn,
            final_callback_mode: FinalCallbackMode::Awaited,
            log_failures: true,
        }
    }
}

impl CoordinatorConfig {
    /// Create a new builder for CoordinatorConfig
    pub fn builder() -> CoordinatorConfigBuilder {
        CoordinatorConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == Some(0) {
            return Err(ConvergeError::configuration_field(
                "max_concurrency",
                "a value greater than 0 or none",
                "0",
            ));
        }
        Ok(())
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.yaml`/`.yml` or `.json` file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConvergeError::io(format!("read {}", path.display()), e))?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&raw),
            Some("json") => Self::from_json_str(&raw),
            other => Err(ConvergeError::configuration_field(
                "path",
                "a .yaml, .yml or .json file",
                other.unwrap_or("<no extension>"),
            )),
        }
    }
}

/// Builder for CoordinatorConfig
#[derive(Debug, Default)]
pub struct CoordinatorConfigBuilder {
    config: CoordinatorConfig,
}

impl CoordinatorConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require_operations(mut self, require: bool) -> Self {
        self.config.require_operations = require;
        self
    }

    pub fn max_concurrency(mut self, limit: usize) -> Self {
        self.config.max_concurrency = Some(limit);
        self
    }

    pub fn continuation(mut self, policy: ContinuationPolicy) -> Self {
        self.config.continuation = policy;
        self
    }

    pub fn final_callback_mode(mut self, mode: FinalCallbackMode) -> Self {
        self.config.final_callback_mode = mode;
        self
    }

    pub fn log_failures(mut self, enabled: bool) -> Self {
        self.config.log_failures = enabled;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<CoordinatorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
