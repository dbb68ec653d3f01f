//! Fan-out/fan-in coordination of asynchronous operations
//!
//! A [`Coordinator`] launches a fixed set of operations concurrently,
//! collects every success and failure into a [`CompletionContext`], and
//! invokes a final callback exactly once after all of them have settled.
//! Runs are either blocking (the caller waits on a barrier) or non-blocking
//! (the caller gets a [`RunObserver`] back immediately).

pub mod cancel;
pub mod context;
pub mod coordinator;
pub mod hooks;
pub mod operation;
pub mod runner;
pub mod types;

pub use cancel::*;
pub use context::*;
pub use coordinator::*;
pub use hooks::*;
pub use operation::*;
pub use runner::*;
pub use types::*;
