//! Operation factories
//!
//! An operation is a one-shot factory that, given the run's cancellation
//! signal, produces a pending future. Producing the future is the *launch*;
//! an error or panic at that point is a launch failure. Awaiting the future
//! yields the operation's result or failure.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;

use super::cancel::CancellationSignal;
use super::types::OperationError;

/// Pending outcome of a launched operation
pub type OperationFuture<R> = BoxFuture<'static, anyhow::Result<R>>;

/// A unit of cancellable asynchronous work
pub trait Operation<R>: Send + 'static {
    /// Produce the pending future for this operation
    fn launch(self: Box<Self>, cancel: CancellationSignal) -> anyhow::Result<OperationFuture<R>>;
}

pub type BoxedOperation<R> = Box<dyn Operation<R>>;

/// Operation backed by an infallible factory closure
pub struct FnOperation<F>(F);

impl<R, F, Fut> Operation<R> for FnOperation<F>
where
    F: FnOnce(CancellationSignal) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    fn launch(self: Box<Self>, cancel: CancellationSignal) -> anyhow::Result<OperationFuture<R>> {
        Ok((self.0)(cancel).boxed())
    }
}

/// Operation backed by a factory that can fail before producing a future
pub struct TryFnOperation<F>(F);

impl<R, F, Fut> Operation<R> for TryFnOperation<F>
where
    F: FnOnce(CancellationSignal) -> anyhow::Result<Fut> + Send + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    fn launch(self: Box<Self>, cancel: CancellationSignal) -> anyhow::Result<OperationFuture<R>> {
        let fut = (self.0)(cancel)?;
        Ok(fut.boxed())
    }
}

/// Box a cancellation-aware async closure as an operation
pub fn operation_fn<R, F, Fut>(factory: F) -> BoxedOperation<R>
where
    R: 'static,
    F: FnOnce(CancellationSignal) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    Box::new(FnOperation(factory))
}

/// Box a factory whose launch step may fail
pub fn try_operation_fn<R, F, Fut>(factory: F) -> BoxedOperation<R>
where
    R: 'static,
    F: FnOnce(CancellationSignal) -> anyhow::Result<Fut> + Send + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    Box::new(TryFnOperation(factory))
}

/// Wrap a cancellation-agnostic future
///
/// The signal is still honoured: if it fires first the operation resolves
/// to [`OperationError::Cancelled`] and the inner future is dropped.
pub fn from_future<R, Fut>(fut: Fut) -> BoxedOperation<R>
where
    R: Send + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    operation_fn(move |cancel: CancellationSignal| until_cancelled(cancel, fut))
}

/// Race a future against the cancellation signal
pub async fn until_cancelled<T, Fut>(cancel: CancellationSignal, fut: Fut) -> anyhow::Result<T>
where
    Fut: Future<Output = anyhow::Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(OperationError::Cancelled.into()),
        out = fut => out,
    }
}
