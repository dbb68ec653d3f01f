//! Cooperative cancellation shared by every operation of a run

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::Notify;

struct Inner {
    cancelled: AtomicBool,
    reason: OnceLock<String>,
    notify: Notify,
}

/// Cloneable cancellation signal
///
/// Cancellation is cooperative: setting the signal never aborts a running
/// operation. Operations observe it through [`is_cancelled`](Self::is_cancelled)
/// or by awaiting [`cancelled`](Self::cancelled).
#[derive(Clone)]
pub struct CancellationSignal {
    inner: Arc<Inner>,
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                reason: OnceLock::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// Set the signal. Returns `true` for the call that actually flipped it.
    pub fn cancel(&self) -> bool {
        let flipped = !self.inner.cancelled.swap(true, Ordering::AcqRel);
        if flipped {
            tracing::debug!("Cancellation requested");
            self.inner.notify.notify_waiters();
        }
        flipped
    }

    /// Set the signal and remember why. The first reason wins.
    pub fn cancel_with_reason(&self, reason: impl Into<String>) -> bool {
        let _ = self.inner.reason.set(reason.into());
        self.cancel()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> Option<&str> {
        self.inner.reason.get().map(String::as_str)
    }

    /// Resolves once the signal is set
    pub async fn cancelled(&self) {
        loop {
            // Register before checking the flag so a concurrent cancel() is not missed
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Whether two handles refer to the same signal
    pub fn same_signal(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for CancellationSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationSignal")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cancel_flips_once() {
        let signal = CancellationSignal::new();
        assert!(!signal.is_cancelled());
        assert!(signal.cancel());
        assert!(!signal.cancel());
        assert!(signal.is_cancelled());
    }

    #[test]
    fn test_clones_share_state() {
        let signal = CancellationSignal::new();
        let clone = signal.clone();
        clone.cancel_with_reason("shutdown");
        assert!(signal.is_cancelled());
        assert_eq!(signal.reason(), Some("shutdown"));
        assert!(signal.same_signal(&clone));
        assert!(!signal.same_signal(&CancellationSignal::new()));
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let signal = CancellationSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.cancelled().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter was not woken")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_resolves_immediately_when_already_set() {
        let signal = CancellationSignal::new();
        signal.cancel();
        tokio::time::timeout(Duration::from_millis(100), signal.cancelled())
            .await
            .expect("already-cancelled signal should resolve");
    }
}
