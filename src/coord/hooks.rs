//! Injected strategies for the runner and the final callback
//!
//! The runner's extension points are plain function values supplied at
//! construction. Defaults are identity transform, no settle hook, and
//! verbatim failure recording.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

use super::cancel::CancellationSignal;
use super::types::{Failure, RunSnapshot};

/// Post-processes or validates a successful value.
/// `Ok(None)` means the hook produced no value, which is recorded as a failure.
pub type TransformFn<R> = Arc<dyn Fn(R) -> anyhow::Result<Option<R>> + Send + Sync>;

/// Observes the settled snapshot exactly once per run
pub type SettledFn<R> = Arc<dyn Fn(&RunSnapshot<R>) + Send + Sync>;

/// Rewrites a failure before it is recorded
pub type FailurePolicyFn = Arc<dyn Fn(Failure) -> Failure + Send + Sync>;

/// How failures are recorded
#[derive(Clone, Default)]
pub enum FailurePolicy {
    /// Record as-is
    #[default]
    Verbatim,
    /// Replace a cause that is itself a `Failure` with its innermost cause,
    /// keeping the outer classification and operation index
    FlattenNested,
    Custom(FailurePolicyFn),
}

impl FailurePolicy {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(Failure) -> Failure + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    pub fn apply(&self, failure: Failure) -> Failure {
        match self {
            Self::Verbatim => failure,
            Self::FlattenNested => {
                let mut innermost = None;
                let mut current = failure.nested();
                while let Some(inner) = current {
                    innermost = Some(inner.shared_cause());
                    current = inner.nested();
                }
                match innermost {
                    Some(cause) => failure.with_cause(cause),
                    None => failure,
                }
            }
            Self::Custom(f) => f(failure),
        }
    }
}

impl std::fmt::Debug for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Verbatim => write!(f, "Verbatim"),
            Self::FlattenNested => write!(f, "FlattenNested"),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Extension points applied by the runner
pub struct RunnerHooks<R> {
    transform: Option<TransformFn<R>>,
    on_all_settled: Option<SettledFn<R>>,
    failure_policy: FailurePolicy,
}

impl<R> RunnerHooks<R> {
    pub fn new() -> Self {
        Self {
            transform: None,
            on_all_settled: None,
            failure_policy: FailurePolicy::Verbatim,
        }
    }

    pub fn with_transform<F>(mut self, f: F) -> Self
    where
        F: Fn(R) -> anyhow::Result<Option<R>> + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(f));
        self
    }

    pub fn with_on_all_settled<F>(mut self, f: F) -> Self
    where
        F: Fn(&RunSnapshot<R>) + Send + Sync + 'static,
    {
        self.on_all_settled = Some(Arc::new(f));
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Apply the transform hook, identity when none was supplied
    pub fn transform(&self, value: R) -> anyhow::Result<Option<R>> {
        match &self.transform {
            Some(f) => f(value),
            None => Ok(Some(value)),
        }
    }

    pub fn on_all_settled(&self, snapshot: &RunSnapshot<R>) {
        if let Some(f) = &self.on_all_settled {
            f(snapshot);
        }
    }

    pub fn failure_policy(&self) -> &FailurePolicy {
        &self.failure_policy
    }
}

impl<R> Default for RunnerHooks<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Clone for RunnerHooks<R> {
    fn clone(&self) -> Self {
        Self {
            transform: self.transform.clone(),
            on_all_settled: self.on_all_settled.clone(),
            failure_policy: self.failure_policy.clone(),
        }
    }
}

/// Aggregate callback invoked once every operation of a run has settled
#[async_trait]
pub trait FinalCallback<R: Send + Sync + 'static>: Send + Sync {
    async fn on_complete(
        &self,
        snapshot: RunSnapshot<R>,
        cancel: CancellationSignal,
    ) -> anyhow::Result<()>;
}

pub type SharedFinalCallback<R> = Arc<dyn FinalCallback<R>>;

/// Final callback backed by an async closure
pub struct FnFinalCallback<F>(F);

#[async_trait]
impl<R, F, Fut> FinalCallback<R> for FnFinalCallback<F>
where
    R: Send + Sync + 'static,
    F: Fn(Arc<[R]>, Option<Arc<[Failure]>>, CancellationSignal) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn on_complete(
        &self,
        snapshot: RunSnapshot<R>,
        cancel: CancellationSignal,
    ) -> anyhow::Result<()> {
        (self.0)(snapshot.results, snapshot.failures, cancel).await
    }
}

pub fn final_callback_fn<R, F, Fut>(f: F) -> SharedFinalCallback<R>
where
    R: Send + Sync + 'static,
    F: Fn(Arc<[R]>, Option<Arc<[Failure]>>, CancellationSignal) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnFinalCallback(f))
}

/// Final callback that only logs the settled snapshot
pub struct LoggingFinalCallback;

#[async_trait]
impl<R: Send + Sync + 'static> FinalCallback<R> for LoggingFinalCallback {
    async fn on_complete(
        &self,
        snapshot: RunSnapshot<R>,
        _cancel: CancellationSignal,
    ) -> anyhow::Result<()> {
        tracing::info!(
            results = snapshot.results.len(),
            failures = snapshot.failure_count(),
            "Run settled"
        );
        if let Some(failures) = &snapshot.failures {
            for failure in failures.iter() {
                tracing::warn!(kind = %failure.kind(), "{}", failure);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::types::FailureKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_default_hooks_are_identity() {
        let hooks = RunnerHooks::<i32>::new();
        assert_eq!(hooks.transform(5).unwrap(), Some(5));
        hooks.on_all_settled(&RunSnapshot::empty());
        assert!(matches!(hooks.failure_policy(), FailurePolicy::Verbatim));
    }

    #[test]
    fn test_transform_hook() {
        let hooks = RunnerHooks::<i32>::new().with_transform(|v| {
            if v < 0 {
                anyhow::bail!("negative value {}", v);
            }
            Ok(if v == 0 { None } else { Some(v * 10) })
        });
        assert_eq!(hooks.transform(2).unwrap(), Some(20));
        assert_eq!(hooks.transform(0).unwrap(), None);
        assert!(hooks.transform(-1).is_err());
    }

    #[test]
    fn test_on_all_settled_hook() {
        let calls = Arc::new(AtomicUsize::new(0));
        let hooks = {
            let calls = calls.clone();
            RunnerHooks::<i32>::new().with_on_all_settled(move |snapshot| {
                calls.fetch_add(snapshot.len(), Ordering::SeqCst);
            })
        };
        hooks.on_all_settled(&RunSnapshot::new(vec![1, 2, 3], Vec::new()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_flatten_nested_policy() {
        let innermost = Failure::classify(0, anyhow::anyhow!("disk full"));
        let middle = Failure::classify(0, anyhow::Error::new(innermost));
        let outer = Failure::launch(3, anyhow::Error::new(middle));

        let flattened = FailurePolicy::FlattenNested.apply(outer);
        assert_eq!(flattened.kind(), FailureKind::Launch);
        assert_eq!(flattened.operation(), Some(3));
        assert_eq!(flattened.cause().to_string(), "disk full");
        assert!(flattened.nested().is_none());
    }

    #[test]
    fn test_custom_policy() {
        let policy = FailurePolicy::custom(|failure| {
            let cause = anyhow::anyhow!("wrapped: {}", failure.cause());
            Failure::new(failure.kind(), failure.operation(), cause)
        });
        let failure = policy.apply(Failure::cancelled(1));
        assert_eq!(failure.cause().to_string(), "wrapped: operation cancelled");
        assert!(failure.is_cancellation());
    }

    #[tokio::test]
    async fn test_final_callback_fn() {
        let seen = Arc::new(AtomicUsize::new(0));
        let callback = {
            let seen = seen.clone();
            final_callback_fn(move |results: Arc<[i32]>, failures, _cancel| {
                let seen = seen.clone();
                async move {
                    assert!(failures.is_none());
                    seen.store(results.iter().sum::<i32>() as usize, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            })
        };
        callback
            .on_complete(RunSnapshot::new(vec![1, 2, 3], Vec::new()), CancellationSignal::new())
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 6);
    }
}
