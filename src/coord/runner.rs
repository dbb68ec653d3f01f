//! Runner - the fan-out/fan-in engine
//!
//! The runner launches every operation of a run, attaches a completion
//! handler to each one, optionally waits on the context's barrier, and
//! hands the final callback the settled snapshot.
//!
//! Completion handlers are the only writers of the context. Each handler
//! records exactly one outcome, then signals the barrier and decrements the
//! remaining-count, in that order. The handler that takes the count to zero
//! runs the settle sequence: `on_all_settled`, then the final callback.

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::core::config::{ContinuationPolicy, CoordinatorConfig, FinalCallbackMode};
use crate::core::errors::Result;

use super::context::CompletionContext;
use super::hooks::RunnerHooks;
use super::operation::{BoxedOperation, OperationFuture};
use super::types::{Failure, FailureKind, OperationError, RunOutcome, RunSnapshot};

/// Fan-out/fan-in engine for one kind of result value
pub struct Runner<R> {
    config: CoordinatorConfig,
    hooks: RunnerHooks<R>,
}

impl<R> Runner<R>
where
    R: Clone + Send + Sync + 'static,
{
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            hooks: RunnerHooks::new(),
        }
    }

    pub fn with_hooks(mut self, hooks: RunnerHooks<R>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Run `operations` against a fresh `context`
    ///
    /// Per-operation failures are recorded in the outcome and never returned
    /// as `Err`. Errors are returned only for lifecycle misuse (the context
    /// was already initialized) or a missing runtime.
    pub async fn invoke(
        &self,
        context: Arc<CompletionContext<R>>,
        blocking: bool,
        operations: Vec<BoxedOperation<R>>,
    ) -> Result<RunOutcome<R>> {
        let handle = context.runtime_handle()?;
        let operation_count = operations.len();
        context.initialize(operation_count, blocking)?;

        let run_id = context.run_id();
        info!(%run_id, operation_count, blocking, "Starting run");

        let shared = Arc::new(Shared {
            context: context.clone(),
            hooks: self.hooks.clone(),
            limiter: self
                .config
                .max_concurrency
                .map(|permits| Arc::new(Semaphore::new(permits))),
            handle: handle.clone(),
        });

        let cancel = context.cancellation().clone();
        let mut inline: Vec<BoxFuture<'static, ()>> = Vec::new();

        for (index, operation) in operations.into_iter().enumerate() {
            if cancel.is_cancelled() {
                debug!(%run_id, operation = index, "Cancelled before launch");
                shared.record_failure(Failure::cancelled(index));
                shared.complete_detached();
                continue;
            }

            let launched = std::panic::catch_unwind(AssertUnwindSafe(|| {
                operation.launch(cancel.clone())
            }));
            let fut = match launched {
                Ok(Ok(fut)) => fut,
                Ok(Err(err)) => {
                    shared.record_failure(Failure::launch(index, err));
                    shared.complete_detached();
                    continue;
                }
                Err(panic) => {
                    let cause = OperationError::from_panic(panic);
                    shared.record_failure(Failure::launch(index, cause.into()));
                    shared.complete_detached();
                    continue;
                }
            };

            context.record_launched();
            let handler = drive(shared.clone(), index, fut);
            match self.config.continuation {
                ContinuationPolicy::Spawn => {
                    handle.spawn(handler);
                }
                ContinuationPolicy::Inline => inline.push(handler.boxed()),
            }
        }

        if !inline.is_empty() {
            handle.spawn(async move {
                let mut handlers: FuturesUnordered<_> = inline.into_iter().collect();
                while handlers.next().await.is_some() {}
            });
        }

        if operation_count == 0 {
            shared.settle_detached();
        }

        let mut settled = true;
        if blocking {
            settled = context.wait_barrier().await;
            context.dispose();
            if !settled {
                warn!(
                    %run_id,
                    remaining = context.remaining(),
                    "Blocking wait interrupted by cancellation"
                );
            }
        }

        let await_callback = context.has_final_callback()
            && self.config.final_callback_mode == FinalCallbackMode::Awaited
            && settled;

        let finalization = if await_callback {
            context.wait_finalized().await
        } else {
            context.finalization()
        };

        if !blocking {
            // Read the count before snapshotting: a zero count makes every record visible
            settled = context.remaining() == 0;
        }
        let snapshot = match context.settled_snapshot() {
            Some(snapshot) if settled => snapshot,
            _ => context.snapshot(),
        };

        info!(
            %run_id,
            results = snapshot.results.len(),
            failures = snapshot.failure_count(),
            settled,
            "Run returned to caller"
        );

        Ok(RunOutcome {
            run_id,
            results: snapshot.results,
            failures: snapshot.failures,
            finalization,
            settled,
            metrics: context.metrics(),
        })
    }
}

/// State shared by every completion handler of one run
struct Shared<R> {
    context: Arc<CompletionContext<R>>,
    hooks: RunnerHooks<R>,
    limiter: Option<Arc<Semaphore>>,
    handle: Handle,
}

impl<R> Shared<R>
where
    R: Clone + Send + Sync + 'static,
{
    fn record_failure(&self, failure: Failure) {
        self.context
            .record_failure_with(failure, self.hooks.failure_policy());
    }

    /// Signal the barrier and decrement; `true` for the last operation
    fn complete_one(&self) -> bool {
        self.context.signal_barrier();
        self.context.decrement_and_check_last()
    }

    /// Completion outside a handler task
    fn complete_detached(self: &Arc<Self>) {
        if self.complete_one() {
            self.settle_detached();
        }
    }

    /// Settle inline and hand only the final callback to the runtime
    fn settle_detached(self: &Arc<Self>) {
        let Some(snapshot) = self.settle_outcomes() else {
            return;
        };
        if self.context.has_final_callback() {
            self.handle.spawn(self.clone().finalize(snapshot));
        } else {
            self.context.mark_finalized(None);
        }
    }

    /// Await the operation and record exactly one outcome
    async fn classify(&self, index: usize, fut: OperationFuture<R>) {
        match fut.await {
            Ok(value) => match self.hooks.transform(value) {
                Ok(Some(value)) => self.context.record_success(value),
                Ok(None) => self.record_failure(Failure::new(
                    FailureKind::Operation,
                    Some(index),
                    OperationError::MissingResult.into(),
                )),
                Err(err) => self.record_failure(Failure::classify(index, err)),
            },
            Err(err) => self.record_failure(Failure::classify(index, err)),
        }
    }

    /// Runs once per run, after the last operation settled
    async fn settle(self: Arc<Self>) {
        if let Some(snapshot) = self.settle_outcomes() {
            self.finalize(snapshot).await;
        }
    }

    /// Snapshot, `on_all_settled` and the settled mark. `None` if another caller got here first.
    fn settle_outcomes(&self) -> Option<RunSnapshot<R>> {
        if !self.context.begin_settle() {
            return None;
        }
        let run_id = self.context.run_id();
        let snapshot: RunSnapshot<R> = self.context.snapshot();
        info!(
            %run_id,
            results = snapshot.results.len(),
            failures = snapshot.failure_count(),
            "All operations settled"
        );

        let hooks = &self.hooks;
        if std::panic::catch_unwind(AssertUnwindSafe(|| hooks.on_all_settled(&snapshot))).is_err() {
            error!(%run_id, "on_all_settled hook panicked");
        }
        self.context.mark_settled(snapshot.clone());
        Some(snapshot)
    }

    async fn finalize(self: Arc<Self>, snapshot: RunSnapshot<R>) {
        let run_id = self.context.run_id();
        let finalization = match self.context.final_callback() {
            Some(callback) => {
                debug!(%run_id, "Invoking final callback");
                let cancel = self.context.cancellation().clone();
                match AssertUnwindSafe(callback.on_complete(snapshot, cancel))
                    .catch_unwind()
                    .await
                {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(Failure::finalization(err)),
                    Err(panic) => Some(Failure::finalization(
                        OperationError::from_panic(panic).into(),
                    )),
                }
            }
            None => None,
        };

        if let Some(failure) = &finalization {
            error!(%run_id, "{}", failure);
            self.context.record_finalization_failure();
        }
        self.context.mark_finalized(finalization);
    }
}

/// Completion handler for one launched operation
///
/// The guard is created before the returned future is first polled, so a
/// handler dropped unpolled still completes its operation.
fn drive<R>(
    shared: Arc<Shared<R>>,
    index: usize,
    fut: OperationFuture<R>,
) -> impl Future<Output = ()> + Send + 'static
where
    R: Clone + Send + Sync + 'static,
{
    let guard = CompletionGuard {
        shared: shared.clone(),
        index,
        armed: true,
    };
    handle_completion(shared, guard, index, fut)
}

async fn handle_completion<R>(
    shared: Arc<Shared<R>>,
    guard: CompletionGuard<R>,
    index: usize,
    fut: OperationFuture<R>,
) where
    R: Clone + Send + Sync + 'static,
{
    let permit = match &shared.limiter {
        Some(limiter) => limiter.clone().acquire_owned().await.ok(),
        None => None,
    };

    if shared.context.cancellation().is_cancelled() {
        debug!(run_id = %shared.context.run_id(), operation = index, "Cancelled before start");
        shared.record_failure(Failure::cancelled(index));
    } else if let Err(panic) = AssertUnwindSafe(shared.classify(index, fut))
        .catch_unwind()
        .await
    {
        shared.record_failure(Failure::new(
            FailureKind::Operation,
            Some(index),
            OperationError::from_panic(panic).into(),
        ));
    }
    drop(permit);

    if guard.complete() {
        shared.settle().await;
    }
}

/// Keeps barrier and count bookkeeping exact even if a handler is dropped
/// before its operation finished (runtime shutdown, aborted task)
struct CompletionGuard<R>
where
    R: Clone + Send + Sync + 'static,
{
    shared: Arc<Shared<R>>,
    index: usize,
    armed: bool,
}

impl<R> CompletionGuard<R>
where
    R: Clone + Send + Sync + 'static,
{
    fn complete(mut self) -> bool {
        self.armed = false;
        self.shared.complete_one()
    }
}

impl<R> Drop for CompletionGuard<R>
where
    R: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(
            run_id = %self.shared.context.run_id(),
            operation = self.index,
            "Completion handler dropped before its operation finished"
        );
        self.shared.record_failure(Failure::new(
            FailureKind::Cancelled,
            Some(self.index),
            OperationError::Aborted.into(),
        ));
        if self.shared.complete_one() {
            // The runtime may be shutting down, so only the final callback is spawned
            self.shared.settle_detached();
        }
    }
}
