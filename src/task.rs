use crate::handle::HandleState;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

lazy_static::lazy_static! {
  static ref NEXT_TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// Hands out process-wide unique task ids, shared by pool submissions and
/// derived pipeline handles.
pub(crate) fn next_task_id() -> u64 {
  NEXT_TASK_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed)
}

/// The error type a task body may fail with.
pub type TaskError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A value-producing, fallible computation. The pool records its `Ok` value
/// (or rendered error) on the handle returned at submission.
pub type ComputationFuture<T> = Pin<Box<dyn Future<Output = Result<T, TaskError>> + Send + 'static>>;

/// A fire-and-forget action. Failures are logged by the pool and dropped;
/// there is no handle to observe them.
pub type ActionFuture = Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send + 'static>>;

/// The two kinds of work the pool accepts.
pub(crate) enum TaskKind<T: Clone + Send + 'static> {
  Action(ActionFuture),
  Computation {
    future: ComputationFuture<T>,
    state: Arc<HandleState<T>>,
  },
}

/// Internal representation of a task queued in the pool.
pub(crate) struct ManagedTask<T: Clone + Send + 'static> {
  pub(crate) task_id: u64,
  pub(crate) kind: TaskKind<T>,
}
