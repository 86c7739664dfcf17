use crate::error::PoolError;
use crate::task::next_task_id;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use futures_intrusive::sync::ManualResetEvent;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

/// The terminal outcome of a computation, as observed through its handle.
///
/// Cancellation and panics are folded into the error side, so every observer
/// (blocking waiters and completion callbacks alike) sees one value type.
pub type TaskOutcome<T> = Result<T, PoolError>;

// Lifecycle phases for the atomic state word. A handle only ever moves
// forward: Queued -> Running -> Terminal, or Queued -> Terminal when a
// cancellation claims the task before a worker does.
const PHASE_QUEUED: u8 = 0;
const PHASE_RUNNING: u8 = 1;
const PHASE_TERMINAL: u8 = 2;

type CompletionCallback<T> = Box<dyn FnOnce(&TaskOutcome<T>) + Send + 'static>;

struct HandleInner<T> {
  outcome: Option<TaskOutcome<T>>,
  callbacks: Vec<CompletionCallback<T>>,
}

/// Shared completion cell behind every `ComputeHandle`.
///
/// The pool worker is the writer for submitted computations; combinator
/// continuations are the writers for derived handles. Whoever writes first
/// wins: the outcome slot is guarded by the mutex and written at most once,
/// and the registered callback list is drained inside that same critical
/// section so no registration can slip between "check" and "complete".
pub(crate) struct HandleState<T: Clone + Send + 'static> {
  phase: AtomicU8,
  inner: Mutex<HandleInner<T>>,
  completed: ManualResetEvent,
  cancel_token: CancellationToken,
}

impl<T: Clone + Send + 'static> HandleState<T> {
  pub(crate) fn new() -> Arc<Self> {
    Arc::new(Self {
      phase: AtomicU8::new(PHASE_QUEUED),
      inner: Mutex::new(HandleInner {
        outcome: None,
        callbacks: Vec::new(),
      }),
      completed: ManualResetEvent::new(false),
      cancel_token: CancellationToken::new(),
    })
  }

  pub(crate) fn cancel_token(&self) -> &CancellationToken {
    &self.cancel_token
  }

  /// Worker-side claim of a dequeued task. Fails when a cancellation already
  /// claimed the handle while it sat in the queue.
  pub(crate) fn try_start(&self) -> bool {
    self
      .phase
      .compare_exchange(
        PHASE_QUEUED,
        PHASE_RUNNING,
        AtomicOrdering::AcqRel,
        AtomicOrdering::Acquire,
      )
      .is_ok()
  }

  /// Records the terminal outcome. Returns `false` if another writer got
  /// there first, in which case `outcome` is dropped.
  ///
  /// Callbacks are removed from the state under the lock but invoked after it
  /// is released, so a callback may safely register further callbacks (or
  /// complete other handles) without deadlocking. They run on the completing
  /// context, in registration order.
  pub(crate) fn complete(&self, outcome: TaskOutcome<T>) -> bool {
    let (snapshot, callbacks) = {
      let mut inner = self.inner.lock();
      if inner.outcome.is_some() {
        trace!("Handle already terminal; late completion dropped.");
        return false;
      }
      let snapshot = outcome.clone();
      inner.outcome = Some(outcome);
      self.phase.store(PHASE_TERMINAL, AtomicOrdering::Release);
      (snapshot, std::mem::take(&mut inner.callbacks))
    };
    self.completed.set();
    for callback in callbacks {
      if catch_unwind(AssertUnwindSafe(|| callback(&snapshot))).is_err() {
        error!("A completion callback panicked; continuing with remaining callbacks.");
      }
    }
    true
  }

  /// Registers a completion callback. Fires immediately (on the registering
  /// context) when the handle is already terminal.
  pub(crate) fn add_callback(&self, callback: CompletionCallback<T>) {
    let mut inner = self.inner.lock();
    match inner.outcome.clone() {
      Some(outcome) => {
        drop(inner);
        if catch_unwind(AssertUnwindSafe(|| callback(&outcome))).is_err() {
          error!("A completion callback panicked during immediate dispatch.");
        }
      }
      None => inner.callbacks.push(callback),
    }
  }

  /// Attempts the `Queued -> Cancelled` claim. On a handle that is already
  /// running (or terminal) this only trips the cooperative token.
  pub(crate) fn request_cancel(&self) -> bool {
    let claimed_while_queued = self
      .phase
      .compare_exchange(
        PHASE_QUEUED,
        PHASE_TERMINAL,
        AtomicOrdering::AcqRel,
        AtomicOrdering::Acquire,
      )
      .is_ok();
    if claimed_while_queued {
      // The claim and the outcome write can still race a combinator-driven
      // completion; `complete` arbitrates, and its verdict is ours.
      return self.complete(Err(PoolError::TaskCancelled));
    }
    self.cancel_token.cancel();
    false
  }

  pub(crate) fn is_finished(&self) -> bool {
    self.completed.is_set()
  }

  pub(crate) async fn wait(&self) -> TaskOutcome<T> {
    self.completed.wait().await;
    self
      .inner
      .lock()
      .outcome
      .clone()
      .expect("completion event set without a recorded outcome")
  }
}

/// A handle to a computation submitted to the pool, or to a node derived from
/// one via the pipeline combinators.
///
/// Handles are cheap to clone; every clone observes the same terminal
/// outcome exactly once it is recorded.
#[derive(Clone)]
pub struct ComputeHandle<T: Clone + Send + 'static> {
  pub(crate) task_id: u64,
  pub(crate) state: Arc<HandleState<T>>,
}

impl<T: Clone + Send + 'static> ComputeHandle<T> {
  /// An already-terminal handle, useful for seeding pipelines and as the
  /// return value of `and_then` closures that can answer without the pool.
  pub fn ready(outcome: TaskOutcome<T>) -> Self {
    let state = HandleState::new();
    state.complete(outcome);
    Self {
      task_id: next_task_id(),
      state,
    }
  }

  /// Returns the unique ID of this handle.
  pub fn id(&self) -> u64 {
    self.task_id
  }

  /// `true` once the handle has reached a terminal outcome.
  pub fn is_finished(&self) -> bool {
    self.state.is_finished()
  }

  /// Checks whether cooperative cancellation has been requested.
  pub fn is_cancellation_requested(&self) -> bool {
    self.state.cancel_token().is_cancelled()
  }

  /// Requests cancellation.
  ///
  /// Returns `true` only when the task had not yet started executing: the
  /// handle then resolves to `Err(PoolError::TaskCancelled)` and the pool
  /// will skip the task at dequeue. Once execution has begun the request is
  /// advisory: the task's cooperative token is tripped, `false` is
  /// returned, and whatever outcome the task naturally produces stands.
  pub fn cancel(&self) -> bool {
    debug!(task_id = %self.task_id, "Handle: cancellation requested.");
    self.state.request_cancel()
  }

  /// Waits for the terminal outcome and returns a clone of it.
  ///
  /// This suspends the calling task; it is the only waiting interaction the
  /// handle offers. Any number of clones may wait concurrently.
  pub async fn result(&self) -> TaskOutcome<T> {
    self.state.wait().await
  }

  /// Like [`result`](Self::result), but gives up after `timeout` with
  /// `Err(PoolError::ResultTimeout)`.
  ///
  /// A timeout fails this call only. The underlying task keeps running and
  /// the handle can still be awaited again; abandoning the task requires a
  /// separate [`cancel`](Self::cancel).
  pub async fn result_timeout(&self, timeout: Duration) -> TaskOutcome<T> {
    match tokio::time::timeout(timeout, self.state.wait()).await {
      Ok(outcome) => outcome,
      Err(_elapsed) => Err(PoolError::ResultTimeout),
    }
  }

  /// Registers `callback` to run exactly once when the handle reaches any
  /// terminal outcome. If the handle is already terminal the callback fires
  /// immediately on the registering context; otherwise it fires on the
  /// completing context. Callbacks on one handle run in registration order.
  pub fn on_complete<F>(&self, callback: F)
  where
    F: FnOnce(&TaskOutcome<T>) + Send + 'static,
  {
    self.state.add_callback(Box::new(callback));
  }
}

impl<T: Clone + Send + 'static> std::fmt::Debug for ComputeHandle<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ComputeHandle")
      .field("task_id", &self.task_id)
      .field("finished", &self.is_finished())
      .finish_non_exhaustive()
  }
}
