use thiserror::Error;

/// Errors that can occur within the `futures_relay` pool.
///
/// `Clone` and `PartialEq` so a terminal outcome can be fanned out to any
/// number of observers and compared in assertions.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
  /// The task body ran and returned an error. Carries the rendered cause.
  #[error("task execution failed: {0}")]
  TaskFailed(String),

  #[error("submitted task future panicked")]
  TaskPanicked,

  #[error("task was cancelled")]
  TaskCancelled,

  #[error("timed out waiting for a task result")]
  ResultTimeout,

  #[error("pool is shutting down or already shut down, cannot accept new tasks")]
  PoolShuttingDown,

  #[error("pool's internal task queue (sender side) was closed unexpectedly")]
  QueueSendChannelClosed,
}
