//! Core value types for coordinated runs
//!
//! These types carry outcomes out of a run: recorded failures, the
//! snapshots handed to callers and final callbacks, and run identity.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::core::metrics::MetricsSnapshot;

/// Identity of one run, used in log fields and outcomes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Classification of a recorded failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The operation itself returned an error, panicked, or produced an invalid result
    Operation,
    /// The operation did not run, or did not complete, because cancellation was observed
    Cancelled,
    /// Starting the operation failed before any pending outcome existed
    Launch,
    /// The final callback failed
    Finalization,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Operation => write!(f, "operation"),
            Self::Cancelled => write!(f, "cancellation"),
            Self::Launch => write!(f, "launch"),
            Self::Finalization => write!(f, "finalization"),
        }
    }
}

/// Causes produced by the coordinator itself rather than by user code
#[derive(Debug, Error)]
pub enum OperationError {
    /// Cancellation was observed before or while the operation ran
    #[error("operation cancelled")]
    Cancelled,

    /// User code panicked
    #[error("operation panicked: {message}")]
    Panicked { message: String },

    /// The result transform produced no value
    #[error("result transform produced no value")]
    MissingResult,

    /// The task driving the operation was dropped before it finished
    #[error("operation aborted before completion")]
    Aborted,
}

impl OperationError {
    /// Build a `Panicked` cause from a caught panic payload
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::Panicked { message }
    }
}

/// A recorded, non-propagating unsuccessful outcome
///
/// A failure wraps exactly one underlying cause. Cloning is cheap; the cause
/// is shared.
#[derive(Clone, Debug)]
pub struct Failure {
    kind: FailureKind,
    operation: Option<usize>,
    cause: Arc<anyhow::Error>,
}

impl Failure {
    pub fn new(kind: FailureKind, operation: Option<usize>, cause: anyhow::Error) -> Self {
        Self {
            kind,
            operation,
            cause: Arc::new(cause),
        }
    }

    /// Classify an error returned by an operation
    ///
    /// Errors carrying [`OperationError::Cancelled`] anywhere in their chain
    /// are cancellation failures; everything else is an operation failure.
    pub fn classify(operation: usize, cause: anyhow::Error) -> Self {
        let cancelled = cause.chain().any(|err| {
            matches!(
                err.downcast_ref::<OperationError>(),
                Some(OperationError::Cancelled)
            )
        });
        let kind = if cancelled {
            FailureKind::Cancelled
        } else {
            FailureKind::Operation
        };
        Self::new(kind, Some(operation), cause)
    }

    pub fn cancelled(operation: usize) -> Self {
        Self::new(
            FailureKind::Cancelled,
            Some(operation),
            OperationError::Cancelled.into(),
        )
    }

    pub fn launch(operation: usize, cause: anyhow::Error) -> Self {
        Self::new(FailureKind::Launch, Some(operation), cause)
    }

    pub fn finalization(cause: anyhow::Error) -> Self {
        Self::new(FailureKind::Finalization, None, cause)
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    /// Index of the operation in submission order, absent for finalization failures
    pub fn operation(&self) -> Option<usize> {
        self.operation
    }

    pub fn cause(&self) -> &anyhow::Error {
        &self.cause
    }

    pub fn is_cancellation(&self) -> bool {
        self.kind == FailureKind::Cancelled
    }

    /// If the cause is itself a `Failure`, return it
    pub fn nested(&self) -> Option<&Failure> {
        self.cause.downcast_ref::<Failure>()
    }

    /// Same classification and operation, different cause
    pub fn with_cause(&self, cause: Arc<anyhow::Error>) -> Self {
        Self {
            kind: self.kind,
            operation: self.operation,
            cause,
        }
    }

    pub(crate) fn shared_cause(&self) -> Arc<anyhow::Error> {
        self.cause.clone()
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operation {
            Some(index) => write!(f, "{} failure in operation #{}: {}", self.kind, index, self.cause),
            None => write!(f, "{} failure: {}", self.kind, self.cause),
        }
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let cause: &(dyn std::error::Error + 'static) = (*self.cause).as_ref();
        Some(cause)
    }
}

/// Immutable copy of a run's results and failures
///
/// `failures` is `None` when nothing failed, so "nothing failed" can be told
/// apart from "nothing recorded yet".
#[derive(Debug)]
pub struct RunSnapshot<R> {
    pub results: Arc<[R]>,
    pub failures: Option<Arc<[Failure]>>,
}

impl<R> RunSnapshot<R> {
    pub fn new(results: Vec<R>, failures: Vec<Failure>) -> Self {
        Self {
            results: results.into(),
            failures: if failures.is_empty() {
                None
            } else {
                Some(failures.into())
            },
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    pub fn failure_count(&self) -> usize {
        self.failures.as_ref().map_or(0, |f| f.len())
    }

    /// Results plus failures
    pub fn len(&self) -> usize {
        self.results.len() + self.failure_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<R> Clone for RunSnapshot<R> {
    fn clone(&self) -> Self {
        Self {
            results: self.results.clone(),
            failures: self.failures.clone(),
        }
    }
}

/// What a run method hands back to its caller
#[derive(Debug, Clone)]
pub struct RunOutcome<R> {
    pub run_id: RunId,
    pub results: Arc<[R]>,
    /// Per-operation failures; `None` when nothing failed
    pub failures: Option<Arc<[Failure]>>,
    /// Failure of the final callback, kept apart from per-operation failures
    pub finalization: Option<Failure>,
    /// Whether every operation had settled when this outcome was taken
    pub settled: bool,
    pub metrics: MetricsSnapshot,
}

impl<R> RunOutcome<R> {
    pub fn is_success(&self) -> bool {
        self.settled && self.failures.is_none() && self.finalization.is_none()
    }

    pub fn failure_count(&self) -> usize {
        self.failures.as_ref().map_or(0, |f| f.len())
    }

    /// Failures of one classification
    pub fn failures_of(&self, kind: FailureKind) -> Vec<&Failure> {
        self.failures
            .iter()
            .flat_map(|failures| failures.iter())
            .filter(|failure| failure.kind() == kind)
            .collect()
    }

    pub fn snapshot(&self) -> RunSnapshot<R> {
        RunSnapshot {
            results: self.results.clone(),
            failures: self.failures.clone(),
        }
    }
}
