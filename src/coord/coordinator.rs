//! Coordinator - single-use facade over the runner
//!
//! A coordinator owns exactly one context/operation-set pairing. The first
//! run method call takes both out under a lock and hands them to the runner;
//! every later call fails with a state error. A call that arrives while a
//! run is still in flight is rejected immediately instead of queuing.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::core::config::CoordinatorConfig;
use crate::core::errors::{ConvergeError, Result};

use super::cancel::CancellationSignal;
use super::context::{CompletionContext, RunObserver};
use super::hooks::{FailurePolicy, RunnerHooks, SharedFinalCallback};
use super::operation::BoxedOperation;
use super::runner::Runner;
use super::types::{RunOutcome, RunSnapshot};

struct PendingRun<R> {
    context: Arc<CompletionContext<R>>,
    operations: Vec<BoxedOperation<R>>,
}

struct CoordinatorState<R> {
    /// Cleared when a run starts
    pending: Option<PendingRun<R>>,
    running: bool,
}

/// Single-use coordinator for a fixed set of operations
pub struct Coordinator<R> {
    name: String,
    runner: Runner<R>,
    state: Mutex<CoordinatorState<R>>,
    observer: RunObserver<R>,
    cancellation: CancellationSignal,
}

impl<R> Coordinator<R>
where
    R: Clone + Send + Sync + 'static,
{
    pub fn builder() -> CoordinatorBuilder<R> {
        CoordinatorBuilder::new()
    }

    /// Coordinator over a collection of operations with default configuration
    pub fn new(
        operations: Vec<BoxedOperation<R>>,
        final_callback: Option<SharedFinalCallback<R>>,
    ) -> Result<Self> {
        let mut builder = CoordinatorBuilder::new().operations(operations);
        if let Some(callback) = final_callback {
            builder = builder.final_callback(callback);
        }
        builder.build()
    }

    /// Coordinator over a single operation
    pub fn single(
        operation: BoxedOperation<R>,
        final_callback: Option<SharedFinalCallback<R>>,
    ) -> Result<Self> {
        Self::new(vec![operation], final_callback)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal shared by every operation of this coordinator's run
    pub fn cancellation(&self) -> &CancellationSignal {
        &self.cancellation
    }

    /// Handle for polling or awaiting the run, valid before and after it starts
    pub fn observer(&self) -> RunObserver<R> {
        self.observer.clone()
    }

    /// Whether the single run has been started
    pub fn is_consumed(&self) -> bool {
        self.lock_state().pending.is_none()
    }

    /// Whether a run method is currently executing
    pub fn is_running(&self) -> bool {
        self.lock_state().running
    }

    /// Launch every operation and return without waiting for them
    ///
    /// When a final callback is configured in awaited mode this still waits
    /// for it, which means waiting for every operation to settle first.
    pub async fn run_non_blocking(&self) -> Result<RunObserver<R>> {
        let (pending, _running) = self.begin()?;
        self.runner
            .invoke(pending.context, false, pending.operations)
            .await?;
        Ok(self.observer())
    }

    /// Launch every operation and wait until all have settled, or until cancellation
    pub async fn run_blocking(&self) -> Result<RunOutcome<R>> {
        let (pending, _running) = self.begin()?;
        self.runner
            .invoke(pending.context, true, pending.operations)
            .await
    }

    /// Blocking run reduced to its snapshot
    pub async fn run_blocking_snapshot(&self) -> Result<RunSnapshot<R>> {
        Ok(self.run_blocking().await?.snapshot())
    }

    /// Check-and-clear under the lock; the runner itself runs outside it
    fn begin(&self) -> Result<(PendingRun<R>, RunningGuard<'_, R>)> {
        let mut state = self.lock_state();
        if state.running {
            debug!(coordinator = %self.name, "Rejecting re-entrant run");
            return Err(ConvergeError::reentrant(self.name.clone()));
        }
        let Some(pending) = state.pending.take() else {
            debug!(coordinator = %self.name, "Rejecting second run");
            return Err(ConvergeError::already_run(self.name.clone()));
        };
        state.running = true;
        drop(state);

        info!(
            coordinator = %self.name,
            run_id = %pending.context.run_id(),
            operations = pending.operations.len(),
            "Coordinator run started"
        );
        Ok((pending, RunningGuard { coordinator: self }))
    }

    fn lock_state(&self) -> MutexGuard<'_, CoordinatorState<R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clears the re-entrancy flag when a run method exits, however it exits
struct RunningGuard<'a, R> {
    coordinator: &'a Coordinator<R>,
}

impl<R> Drop for RunningGuard<'_, R> {
    fn drop(&mut self) {
        let mut state = self
            .coordinator
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.running = false;
    }
}

/// Fluent construction of a [`Coordinator`]
pub struct CoordinatorBuilder<R> {
    name: Option<String>,
    operations: Vec<BoxedOperation<R>>,
    final_callback: Option<SharedFinalCallback<R>>,
    hooks: RunnerHooks<R>,
    config: CoordinatorConfig,
    cancellation: Option<CancellationSignal>,
    runtime: Option<Handle>,
}

impl<R> CoordinatorBuilder<R>
where
    R: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            name: None,
            operations: Vec::new(),
            final_callback: None,
            hooks: RunnerHooks::new(),
            config: CoordinatorConfig::default(),
            cancellation: None,
            runtime: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn operation(mut self, operation: BoxedOperation<R>) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn operations(mut self, operations: impl IntoIterator<Item = BoxedOperation<R>>) -> Self {
        self.operations.extend(operations);
        self
    }

    pub fn final_callback(mut self, callback: SharedFinalCallback<R>) -> Self {
        self.final_callback = Some(callback);
        self
    }

    pub fn transform<F>(mut self, f: F) -> Self
    where
        F: Fn(R) -> anyhow::Result<Option<R>> + Send + Sync + 'static,
    {
        self.hooks = self.hooks.with_transform(f);
        self
    }

    pub fn on_all_settled<F>(mut self, f: F) -> Self
    where
        F: Fn(&RunSnapshot<R>) + Send + Sync + 'static,
    {
        self.hooks = self.hooks.with_on_all_settled(f);
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.hooks = self.hooks.with_failure_policy(policy);
        self
    }

    pub fn hooks(mut self, hooks: RunnerHooks<R>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an existing signal instead of a fresh one
    pub fn cancellation(mut self, signal: CancellationSignal) -> Self {
        self.cancellation = Some(signal);
        self
    }

    /// Spawn completion handlers on this runtime instead of the ambient one
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn build(self) -> Result<Coordinator<R>> {
        self.config.validate()?;
        if self.config.require_operations && self.operations.is_empty() {
            return Err(crate::converge_error!(
                validation,
                "at least one operation is required",
                "operations"
            ));
        }

        let cancellation = self.cancellation.unwrap_or_default();
        let context = CompletionContext::new(cancellation.clone())
            .with_failure_logging(self.config.log_failures);
        if let Some(callback) = self.final_callback {
            context.set_final_callback(callback)?;
        }
        if let Some(handle) = self.runtime {
            context.set_runtime_handle(handle)?;
        }
        let context = Arc::new(context);

        let name = self
            .name
            .unwrap_or_else(|| format!("coordinator-{}", context.run_id()));
        debug!(
            coordinator = %name,
            operations = self.operations.len(),
            "Coordinator built"
        );

        Ok(Coordinator {
            name,
            runner: Runner::new(self.config).with_hooks(self.hooks),
            observer: RunObserver::new(context.clone()),
            state: Mutex::new(CoordinatorState {
                pending: Some(PendingRun {
                    context,
                    operations: self.operations,
                }),
                running: false,
            }),
            cancellation,
        })
    }
}

impl<R> Default for CoordinatorBuilder<R>
where
    R: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
