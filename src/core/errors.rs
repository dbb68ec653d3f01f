use thiserror::Error;

/// Unified error type for the converge library
///
/// These are programmer-error class failures (misuse of a coordinator or a
/// context, bad configuration). Runtime failures of individual operations
/// are never reported through this type; they are recorded as
/// [`Failure`](crate::coord::Failure) entries instead.
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// A run method was called on a coordinator whose run already started
    #[error("Coordinator already run: {coordinator}")]
    AlreadyRun { coordinator: String },

    /// A run method was called while another run on the same coordinator was in flight
    #[error("Re-entrant run rejected: {coordinator} is already running")]
    Reentrant { coordinator: String },

    /// A completion context was initialized twice
    #[error("Completion context already initialized (run: {run_id})")]
    AlreadyInitialized { run_id: String },

    /// A write-once field was assigned twice
    #[error("Field already set: {field}")]
    AlreadySet { field: String },

    /// Invalid construction arguments
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
        expected: Option<String>,
        actual: Option<String>,
    },

    /// Configuration file could not be read
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Configuration could not be parsed
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl ConvergeError {
    pub fn already_run<S: Into<String>>(coordinator: S) -> Self {
        Self::AlreadyRun {
            coordinator: coordinator.into(),
        }
    }

    pub fn reentrant<S: Into<String>>(coordinator: S) -> Self {
        Self::Reentrant {
            coordinator: coordinator.into(),
        }
    }

    pub fn already_initialized<S: Into<String>>(run_id: S) -> Self {
        Self::AlreadyInitialized {
            run_id: run_id.into(),
        }
    }

    pub fn already_set<S: Into<String>>(field: S) -> Self {
        Self::AlreadySet {
            field: field.into(),
        }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a validation error with field
    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
            expected: None,
            actual: None,
        }
    }

    /// Create a configuration error naming the offending field and values
    pub fn configuration_field<F: Into<String>, E: Into<String>, A: Into<String>>(
        field: F,
        expected: E,
        actual: A,
    ) -> Self {
        let field = field.into();
        Self::Configuration {
            message: format!("invalid value for `{}`", field),
            field: Some(field),
            expected: Some(expected.into()),
            actual: Some(actual.into()),
        }
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    /// Whether this error reports misuse of a coordinator or context lifecycle
    pub fn is_state_error(&self) -> bool {
        matches!(
            self,
            Self::AlreadyRun { .. }
                | Self::Reentrant { .. }
                | Self::AlreadyInitialized { .. }
                | Self::AlreadySet { .. }
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::AlreadyRun { .. } => "already_run",
            Self::Reentrant { .. } => "reentrant",
            Self::AlreadyInitialized { .. } => "already_initialized",
            Self::AlreadySet { .. } => "already_set",
            Self::Validation { .. } => "validation",
            Self::Configuration { .. } => "configuration",
            Self::Io { .. } => "io",
            Self::Serialization { .. } => "serialization",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ConvergeError>;

impl From<std::io::Error> for ConvergeError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for ConvergeError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for ConvergeError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

/// Macro for creating errors
#[macro_export]
macro_rules! converge_error {
    (validation, $message:expr) => {
        $crate::ConvergeError::validation($message)
    };
    (validation, $message:expr, $field:expr) => {
        $crate::ConvergeError::validation_field($message, $field)
    };
    (configuration, $message:expr) => {
        $crate::ConvergeError::configuration($message)
    };
}
