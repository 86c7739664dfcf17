//! A Tokio-based bounded task pool with future-style result handles,
//! completion callbacks, chaining combinators and cooperative cancellation.
//!
//! Submit a fallible computation with [`TaskPoolManager::submit`] and observe
//! it through the returned [`ComputeHandle`]: await it, attach completion
//! callbacks, cancel it, or derive further handles with `map` / `and_then` /
//! `zip_with` / `recover`. Fire-and-forget actions go through
//! [`TaskPoolManager::execute`]. At most `concurrency_limit` task bodies run
//! at once; pending tasks wait in a bounded FIFO queue.

mod chain;
mod error;
mod handle;
mod manager;
mod notifier;
mod task;
mod task_queue;

pub use error::PoolError;
pub use handle::{ComputeHandle, TaskOutcome};
pub use manager::{ShutdownMode, TaskPoolManager};
pub use notifier::{TaskCompletionInfo, TaskCompletionStatus};
pub use task::{ActionFuture, ComputationFuture, TaskError};
