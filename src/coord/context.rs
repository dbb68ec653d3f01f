//! Completion context - per-run coordination state
//!
//! A context holds everything the completion handlers of one run touch
//! concurrently: the results and failures containers, the remaining-count,
//! the optional blocking-mode barrier and the cancellation signal. It makes
//! no decisions; the runner drives it.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, warn};

use crate::core::errors::{ConvergeError, Result};
use crate::core::metrics::{MetricsSnapshot, RunMetrics};

use super::cancel::CancellationSignal;
use super::hooks::{FailurePolicy, SharedFinalCallback};
use super::types::{Failure, FailureKind, RunId, RunSnapshot};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking writer cannot leave a Vec half-pushed
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counting signal used by blocking runs
///
/// Starts with zero available permits; each operation releases exactly one.
/// The waiter acquires `capacity` permits at once.
#[derive(Debug)]
pub struct Barrier {
    semaphore: Semaphore,
    capacity: usize,
    signals: AtomicUsize,
}

impl Barrier {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Semaphore::new(0),
            capacity,
            signals: AtomicUsize::new(0),
        }
    }

    /// Release one permit. Returns `false` if the barrier was already fully signalled.
    pub fn signal(&self) -> bool {
        let accepted = self
            .signals
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_ok();
        if accepted {
            self.semaphore.add_permits(1);
        }
        accepted
    }

    /// Wait until every permit has been released.
    /// Returns `false` if the barrier was disposed first.
    pub async fn wait(&self) -> bool {
        let Ok(permits) = u32::try_from(self.capacity) else {
            warn!(capacity = self.capacity, "Barrier capacity exceeds semaphore range");
            return false;
        };
        match self.semaphore.acquire_many(permits).await {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    pub fn signals(&self) -> usize {
        self.signals.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dispose(&self) {
        self.semaphore.close();
    }

    pub fn is_disposed(&self) -> bool {
        self.semaphore.is_closed()
    }
}

/// Thread-safe scratch space for exactly one run
pub struct CompletionContext<R> {
    run_id: RunId,
    results: Mutex<Vec<R>>,
    failures: Mutex<Vec<Failure>>,
    remaining: AtomicUsize,
    operation_count: OnceLock<usize>,
    barrier: OnceLock<Barrier>,
    cancellation: CancellationSignal,
    runtime: OnceLock<Handle>,
    final_callback: OnceLock<SharedFinalCallback<R>>,
    log_failures: AtomicBool,
    metrics: RunMetrics,
    settling: AtomicBool,
    settled: OnceLock<RunSnapshot<R>>,
    settled_notify: Notify,
    finalized: OnceLock<Option<Failure>>,
    finalized_notify: Notify,
}

impl<R> CompletionContext<R> {
    pub fn new(cancellation: CancellationSignal) -> Self {
        Self {
            run_id: RunId::new(),
            results: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            remaining: AtomicUsize::new(0),
            operation_count: OnceLock::new(),
            barrier: OnceLock::new(),
            cancellation,
            runtime: OnceLock::new(),
            final_callback: OnceLock::new(),
            log_failures: AtomicBool::new(true),
            metrics: RunMetrics::new(),
            settling: AtomicBool::new(false),
            settled: OnceLock::new(),
            settled_notify: Notify::new(),
            finalized: OnceLock::new(),
            finalized_notify: Notify::new(),
        }
    }

    pub fn with_failure_logging(self, enabled: bool) -> Self {
        self.log_failures.store(enabled, Ordering::Relaxed);
        self
    }

    /// Arm the context for `operation_count` operations.
    /// In blocking mode this also creates the barrier.
    pub fn initialize(&self, operation_count: usize, blocking: bool) -> Result<()> {
        if self.operation_count.set(operation_count).is_err() {
            return Err(ConvergeError::already_initialized(self.run_id.to_string()));
        }
        self.remaining.store(operation_count, Ordering::Release);
        if blocking {
            // operation_count was unset, so the barrier is too
            let _ = self.barrier.set(Barrier::new(operation_count));
        }
        self.metrics.record_started();
        debug!(run_id = %self.run_id, operation_count, blocking, "Completion context initialized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.operation_count.get().is_some()
    }

    pub fn record_success(&self, value: R) {
        lock(&self.results).push(value);
        self.metrics.record_success();
    }

    /// Record a failure as-is
    pub fn record_failure(&self, failure: Failure) {
        self.record_failure_with(failure, &FailurePolicy::Verbatim);
    }

    /// Record a failure after passing it through `policy`
    pub fn record_failure_with(&self, failure: Failure, policy: &FailurePolicy) {
        let failure = policy.apply(failure);
        if self.log_failures.load(Ordering::Relaxed) {
            warn!(
                run_id = %self.run_id,
                operation = ?failure.operation(),
                kind = %failure.kind(),
                "{}",
                failure
            );
        }
        self.metrics.record_failure(failure.kind());
        lock(&self.failures).push(failure);
    }

    /// Decrement `remaining`; `true` only for the call that reaches zero.
    /// Never goes below zero.
    pub fn decrement_and_check_last(&self) -> bool {
        match self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(previous) => previous == 1,
            Err(_) => {
                warn!(run_id = %self.run_id, "Completion recorded after all operations settled");
                false
            }
        }
    }

    /// Release one barrier permit; no-op outside blocking mode
    pub fn signal_barrier(&self) {
        if let Some(barrier) = self.barrier.get() {
            if !barrier.signal() {
                warn!(run_id = %self.run_id, "Barrier signalled more times than operations");
            }
        }
    }

    /// Wait for every barrier permit, or until cancellation.
    /// Returns `true` when every operation signalled.
    pub async fn wait_barrier(&self) -> bool {
        let Some(barrier) = self.barrier.get() else {
            return self.remaining() == 0;
        };
        tokio::select! {
            biased;
            complete = barrier.wait() => complete,
            _ = self.cancellation.cancelled() => false,
        }
    }

    /// Close the barrier. Safe to call repeatedly.
    pub fn dispose(&self) {
        if let Some(barrier) = self.barrier.get() {
            if !barrier.is_disposed() {
                barrier.dispose();
                debug!(run_id = %self.run_id, "Barrier disposed");
            }
        }
    }

    pub fn barrier(&self) -> Option<&Barrier> {
        self.barrier.get()
    }

    pub fn barrier_signals(&self) -> usize {
        self.barrier.get().map_or(0, Barrier::signals)
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn operation_count(&self) -> Option<usize> {
        self.operation_count.get().copied()
    }

    pub fn cancellation(&self) -> &CancellationSignal {
        &self.cancellation
    }

    /// Write-once: the final callback for this run
    pub fn set_final_callback(&self, callback: SharedFinalCallback<R>) -> Result<()> {
        self.final_callback
            .set(callback)
            .map_err(|_| ConvergeError::already_set("final_callback"))
    }

    pub fn final_callback(&self) -> Option<SharedFinalCallback<R>> {
        self.final_callback.get().cloned()
    }

    pub fn has_final_callback(&self) -> bool {
        self.final_callback.get().is_some()
    }

    /// Write-once: the runtime continuations are spawned on
    pub fn set_runtime_handle(&self, handle: Handle) -> Result<()> {
        self.runtime
            .set(handle)
            .map_err(|_| ConvergeError::already_set("runtime_handle"))
    }

    /// Configured runtime, else the ambient one
    pub fn runtime_handle(&self) -> Result<Handle> {
        if let Some(handle) = self.runtime.get() {
            return Ok(handle.clone());
        }
        Handle::try_current().map_err(|_| {
            ConvergeError::configuration("no tokio runtime available to drive operations")
        })
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let mut snapshot = self.metrics.snapshot();
        // Counted by the barrier itself, before the permit is released
        snapshot.barrier_signals = self.barrier_signals() as u64;
        snapshot
    }

    pub(crate) fn record_launched(&self) {
        self.metrics.record_launched();
    }

    pub(crate) fn record_finalization_failure(&self) {
        self.metrics.record_failure(FailureKind::Finalization);
    }

    /// Claim the right to run the settle sequence. Only the first caller gets `true`.
    pub(crate) fn begin_settle(&self) -> bool {
        !self.settling.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn mark_settled(&self, snapshot: RunSnapshot<R>) {
        self.metrics.record_settled();
        if self.settled.set(snapshot).is_ok() {
            self.settled_notify.notify_waiters();
        }
    }

    pub(crate) fn mark_finalized(&self, finalization: Option<Failure>) {
        if self.finalized.set(finalization).is_ok() {
            self.finalized_notify.notify_waiters();
        }
    }

    pub fn is_settled(&self) -> bool {
        self.settled.get().is_some()
    }

    /// The snapshot taken when the last operation settled
    pub fn settled_snapshot(&self) -> Option<RunSnapshot<R>> {
        self.settled.get().cloned()
    }

    pub async fn wait_settled(&self) -> RunSnapshot<R> {
        loop {
            let notified = self.settled_notify.notified();
            if let Some(snapshot) = self.settled.get() {
                return snapshot.clone();
            }
            notified.await;
        }
    }

    /// Waits for the final callback (if any) to settle and returns its failure
    pub async fn wait_finalized(&self) -> Option<Failure> {
        loop {
            let notified = self.finalized_notify.notified();
            if let Some(finalization) = self.finalized.get() {
                return finalization.clone();
            }
            notified.await;
        }
    }

    pub fn finalization(&self) -> Option<Failure> {
        self.finalized.get().cloned().flatten()
    }
}

impl<R: Clone> CompletionContext<R> {
    /// Copy of everything recorded so far
    pub fn snapshot(&self) -> RunSnapshot<R> {
        let results = lock(&self.results).clone();
        let failures = lock(&self.failures).clone();
        RunSnapshot::new(results, failures)
    }
}

impl<R> Drop for CompletionContext<R> {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Read-only view of a run, for polling or awaiting a non-blocking run
pub struct RunObserver<R> {
    context: Arc<CompletionContext<R>>,
}

impl<R> RunObserver<R> {
    pub(crate) fn new(context: Arc<CompletionContext<R>>) -> Self {
        Self { context }
    }

    pub fn run_id(&self) -> RunId {
        self.context.run_id()
    }

    pub fn is_settled(&self) -> bool {
        self.context.is_settled()
    }

    /// Operations that have not yet settled; zero before the run starts
    pub fn remaining(&self) -> usize {
        self.context.remaining()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.context.metrics()
    }

    pub fn cancellation(&self) -> &CancellationSignal {
        self.context.cancellation()
    }

    /// Resolves with the settled snapshot
    pub async fn settled(&self) -> RunSnapshot<R> {
        self.context.wait_settled().await
    }

    /// Resolves once the final callback (if any) has settled
    pub async fn finalized(&self) -> Option<Failure> {
        self.context.wait_finalized().await
    }
}

impl<R: Clone> RunObserver<R> {
    pub fn snapshot(&self) -> RunSnapshot<R> {
        self.context.snapshot()
    }
}

impl<R> Clone for RunObserver<R> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
        }
    }
}
