use crate::error::PoolError;
use crate::handle::{ComputeHandle, HandleState};
use crate::notifier::{
  CompletionNotifier, InternalCompletionMessage, TaskCompletionInfo, TaskCompletionStatus,
};
use crate::task::{next_task_id, ActionFuture, ComputationFuture, ManagedTask, TaskError, TaskKind};
use crate::task_queue::{QueueConsumer, QueueProducer, TaskQueue};

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use dashmap::DashMap;
use fibre::mpsc::{self, AsyncSender};
use futures::FutureExt;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{self, debug, error, info, info_span, trace, warn, Instrument};

/// Defines how the pool should behave upon shutdown.
///
/// Both modes stop new submissions immediately, and both let in-flight tasks
/// run to their natural outcome; cancellation is cooperative, never
/// preemptive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Queued tasks are still dequeued and executed before the pool stops.
  Drain,
  /// Queued tasks that have not started executing resolve as cancelled.
  DiscardPending,
}

/// A bounded pool executing submitted computations and actions on a fixed
/// number of worker slots, FIFO by submission order.
pub struct TaskPoolManager<R: Clone + Send + 'static> {
  pool_name: Arc<String>,
  concurrency_limit: usize,
  worker_slots: Arc<Semaphore>,
  queue_tx: QueueProducer<R>,
  active_tasks: Arc<DashMap<u64, Instant>>,
  completion_tx: AsyncSender<InternalCompletionMessage>,
  tokio_handle: TokioHandle,
  notifier: Arc<CompletionNotifier>,
  shutdown_token: CancellationToken,
  discard_token: CancellationToken,
  worker_join_handle_internal: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl<R: Clone + Send + 'static> TaskPoolManager<R> {
  pub fn new(
    concurrency_limit: usize,
    queue_capacity: usize,
    tokio_handle: TokioHandle,
    pool_name: &str,
  ) -> Arc<Self> {
    let concurrency_limit = concurrency_limit.max(1);
    let (queue_tx, queue_rx) = TaskQueue::new(queue_capacity).split();
    let (completion_tx, completion_rx) = mpsc::unbounded_async();
    let shutdown_token = CancellationToken::new();
    let discard_token = CancellationToken::new();
    let pool_name_arc = Arc::new(pool_name.to_string());
    let worker_join_handle_internal = Arc::new(Mutex::new(None));

    let notifier = CompletionNotifier::new(
      completion_rx,
      tokio_handle.clone(),
      shutdown_token.clone(),
      pool_name_arc.clone(),
    );

    let manager = Arc::new(Self {
      pool_name: pool_name_arc.clone(),
      concurrency_limit,
      worker_slots: Arc::new(Semaphore::new(concurrency_limit)),
      queue_tx,
      active_tasks: Arc::new(DashMap::new()),
      completion_tx: completion_tx.clone(),
      tokio_handle: tokio_handle.clone(),
      notifier,
      shutdown_token,
      discard_token: discard_token.clone(),
      worker_join_handle_internal: worker_join_handle_internal.clone(),
    });

    let worker_loop_join_handle = tokio_handle.clone().spawn(
      Self::run_worker_loop(
        pool_name_arc,
        manager.worker_slots.clone(),
        queue_rx,
        tokio_handle,
        manager.active_tasks.clone(),
        completion_tx,
        discard_token,
        concurrency_limit,
      )
      .instrument(info_span!("pool_worker_loop", name = %pool_name)),
    );
    *worker_join_handle_internal.lock().unwrap() = Some(worker_loop_join_handle);

    manager
  }

  pub fn name(&self) -> &str {
    &self.pool_name
  }

  /// Maximum number of tasks the pool executes concurrently.
  pub fn concurrency_limit(&self) -> usize {
    self.concurrency_limit
  }

  /// Number of tasks currently executing on a worker slot.
  pub fn active_task_count(&self) -> usize {
    self.active_tasks.len()
  }

  /// Number of tasks in the pending queue.
  pub fn queued_task_count(&self) -> usize {
    self.queue_tx.len()
  }

  /// Registers a handler invoked for every task the pool resolves,
  /// whether completed, failed, panicked or cancelled.
  pub fn add_completion_handler(&self, handler: impl Fn(TaskCompletionInfo) + Send + Sync + 'static) {
    self.notifier.add_handler(handler);
  }

  /// Submits a value-producing computation and returns its handle.
  ///
  /// Enqueues FIFO and returns as soon as a queue slot is available;
  /// suspension here is queue backpressure, never task execution.
  pub async fn submit(&self, task_future: ComputationFuture<R>) -> Result<ComputeHandle<R>, PoolError> {
    let state = HandleState::new();
    self.submit_internal(task_future, state).await
  }

  /// Like [`submit`](Self::submit), but hands the task body a clone of its
  /// own cancellation token, so long-running computations can poll it and
  /// bail out when [`ComputeHandle::cancel`] is called mid-execution.
  pub async fn submit_with<B, F>(&self, build: B) -> Result<ComputeHandle<R>, PoolError>
  where
    B: FnOnce(CancellationToken) -> F,
    F: Future<Output = Result<R, TaskError>> + Send + 'static,
  {
    let state = HandleState::new();
    let task_future: ComputationFuture<R> = Box::pin(build(state.cancel_token().clone()));
    self.submit_internal(task_future, state).await
  }

  /// Submits a dependent computation: when `upstream` completes
  /// successfully, `build(value)` produces the follow-up task body and it is
  /// enqueued on this pool. The returned handle adopts the follow-up task's
  /// terminal outcome; an upstream failure or cancellation propagates to it
  /// without `build` being invoked.
  ///
  /// This is the pool-integrated sibling of [`ComputeHandle::and_then`],
  /// which composes already-existing handles. Returns immediately; the
  /// follow-up submission happens on the completing context.
  pub fn submit_after<T, B, F>(self: &Arc<Self>, upstream: &ComputeHandle<T>, build: B) -> ComputeHandle<R>
  where
    T: Clone + Send + 'static,
    B: FnOnce(T) -> F + Send + 'static,
    F: Future<Output = Result<R, TaskError>> + Send + 'static,
  {
    let state = HandleState::new();
    let task_id = next_task_id();
    let derived = ComputeHandle {
      task_id,
      state: state.clone(),
    };

    let pool = self.clone();
    upstream.on_complete(move |outcome| match outcome {
      Ok(value) => {
        let future: ComputationFuture<R> = Box::pin(build(value.clone()));
        let task = ManagedTask {
          task_id,
          kind: TaskKind::Computation {
            future,
            state: state.clone(),
          },
        };
        // Enqueueing can suspend on queue backpressure, so it runs on its
        // own spawned context rather than on the completing one.
        let pool_for_enqueue = pool.clone();
        pool.tokio_handle.spawn(async move {
          if let Err(enqueue_error) = pool_for_enqueue.enqueue(task).await {
            warn!(
              pool_name = %*pool_for_enqueue.pool_name,
              %task_id,
              "Dependent submission rejected: {}",
              enqueue_error
            );
            state.complete(Err(enqueue_error));
          }
        });
      }
      Err(error) => {
        state.complete(Err(error.clone()));
      }
    });

    derived
  }

  /// Submits a fire-and-forget action. No handle is returned; a failing or
  /// panicking action is logged and otherwise dropped.
  pub async fn execute(&self, action: ActionFuture) -> Result<(), PoolError> {
    if self.shutdown_token.is_cancelled() || self.queue_tx.is_closed() {
      warn!(pool_name = %*self.pool_name, "Execute: attempted on a pool that is shutting down.");
      return Err(PoolError::PoolShuttingDown);
    }
    let task_id = next_task_id();
    let task = ManagedTask {
      task_id,
      kind: TaskKind::Action(action),
    };
    debug!(pool_name = %*self.pool_name, %task_id, "Submitting action to queue.");
    self.enqueue(task).await
  }

  async fn submit_internal(
    &self,
    future: ComputationFuture<R>,
    state: Arc<HandleState<R>>,
  ) -> Result<ComputeHandle<R>, PoolError> {
    if self.shutdown_token.is_cancelled() || self.queue_tx.is_closed() {
      warn!(pool_name = %*self.pool_name, "Submit: attempted on a pool that is shutting down.");
      return Err(PoolError::PoolShuttingDown);
    }
    let task_id = next_task_id();
    let task = ManagedTask {
      task_id,
      kind: TaskKind::Computation {
        future,
        state: state.clone(),
      },
    };
    debug!(pool_name = %*self.pool_name, %task_id, "Submitting computation to queue.");
    self.enqueue(task).await.map(|()| ComputeHandle { task_id, state })
  }

  async fn enqueue(&self, task: ManagedTask<R>) -> Result<(), PoolError> {
    let task_id = task.task_id;
    match self.queue_tx.send(task, &self.shutdown_token).await {
      Ok(()) => Ok(()),
      Err(send_error) => {
        error!(pool_name = %*self.pool_name, %task_id, "Failed to enqueue task: {}", send_error);
        if self.shutdown_token.is_cancelled() || self.queue_tx.is_closed() {
          Err(PoolError::PoolShuttingDown)
        } else {
          Err(send_error)
        }
      }
    }
  }

  /// Stops the pool.
  ///
  /// New submissions fail immediately with `PoolShuttingDown`. With
  /// [`ShutdownMode::Drain`] every queued task is still executed; with
  /// [`ShutdownMode::DiscardPending`] queued tasks resolve as cancelled. In
  /// both modes tasks already executing run to their natural outcome.
  /// Returns once the worker loop has exited, in-flight tasks have finished
  /// and the completion notifier has drained.
  pub async fn shutdown(self: Arc<Self>, mode: ShutdownMode) -> Result<(), PoolError> {
    let already_initiating_shutdown = self.shutdown_token.is_cancelled();

    if !already_initiating_shutdown {
      info!(pool_name = %*self.pool_name, "Initiating pool shutdown (mode: {:?}).", mode);
      self.shutdown_token.cancel();
      self.queue_tx.close();
      if mode == ShutdownMode::DiscardPending {
        info!(pool_name = %*self.pool_name, "Discard shutdown: queued tasks resolve as cancelled; in-flight tasks run to completion.");
        self.discard_token.cancel();
      } else {
        info!(pool_name = %*self.pool_name, "Drain shutdown: queued and in-flight tasks run to completion.");
      }
    } else {
      info!(pool_name = %*self.pool_name, "Shutdown already in progress or initiated by another call/Drop.");
    }

    // Take the handle out of the mutex before awaiting it.
    let handle_to_await: Option<JoinHandle<()>> = {
      let mut guard = self.worker_join_handle_internal.lock().unwrap();
      guard.take()
    };

    if let Some(handle) = handle_to_await {
      info!(pool_name = %*self.pool_name, "Waiting for worker loop to join.");
      match handle.await {
        Ok(()) => info!(pool_name = %*self.pool_name, "Worker loop joined."),
        Err(join_error) => {
          error!(pool_name = %*self.pool_name, "Error joining worker loop during shutdown: {:?}", join_error);
        }
      }
      // The worker loop waits for in-flight tasks before exiting, so no
      // further completion events can be produced. Close the channel and let
      // the notification worker drain what remains.
      let _ = self.completion_tx.close();
      self.notifier.await_shutdown().await;
      info!(pool_name = %*self.pool_name, "Pool shutdown process completed.");
    } else {
      trace!(pool_name = %*self.pool_name, "Worker join handle already taken by a concurrent shutdown call.");
    }

    Ok(())
  }

  #[allow(clippy::too_many_arguments)]
  async fn run_worker_loop(
    pool_name: Arc<String>,
    worker_slots: Arc<Semaphore>,
    queue_rx: QueueConsumer<R>,
    tasks_tokio_handle: TokioHandle,
    active_tasks: Arc<DashMap<u64, Instant>>,
    completion_tx: AsyncSender<InternalCompletionMessage>,
    discard_token: CancellationToken,
    concurrency_limit: usize,
  ) {
    info!(name = %*pool_name, "Worker loop started.");

    'main: loop {
      tokio::select! {
        biased;

        _ = discard_token.cancelled() => {
          info!(name = %*pool_name, "Discard signal received. Worker loop terminating.");
          break 'main;
        }

        permit_acquisition = worker_slots.clone().acquire_owned() => {
          let permit = match permit_acquisition {
            Ok(p) => p,
            Err(_closed) => {
              error!(name = %*pool_name, "Worker semaphore closed. Worker loop exiting.");
              break 'main;
            }
          };
          trace!(name = %*pool_name, "Acquired worker slot. Available: {}", worker_slots.available_permits());

          let dequeued: Option<(ManagedTask<R>, OwnedSemaphorePermit)> = tokio::select! {
            biased;
            _ = discard_token.cancelled() => {
              info!(name = %*pool_name, "Discard signal received while waiting for a task. Releasing slot.");
              drop(permit);
              None
            }
            recv_result = queue_rx.recv() => {
              match recv_result {
                Ok(task) => Some((task, permit)),
                Err(_disconnected) => {
                  info!(name = %*pool_name, "Task queue closed and drained. Releasing slot.");
                  drop(permit);
                  None
                }
              }
            }
          };

          match dequeued {
            Some((task, permit)) => {
              Self::spawn_task(&pool_name, &tasks_tokio_handle, &active_tasks, &completion_tx, permit, task).await;
            }
            None => break 'main,
          }
        }
      }
    }

    // After a discard shutdown the queue may still hold tasks; resolve each
    // as cancelled so their observers are not left pending forever.
    while let Ok(task) = queue_rx.recv().await {
      Self::resolve_discarded(&pool_name, task, &completion_tx).await;
    }

    // Wait for in-flight tasks to hand their worker slots back.
    match worker_slots.clone().acquire_many_owned(concurrency_limit as u32).await {
      Ok(_all_slots) => info!(name = %*pool_name, "All in-flight tasks finished."),
      Err(_closed) => warn!(name = %*pool_name, "Worker semaphore closed while waiting for in-flight tasks."),
    }

    info!(name = %*pool_name, "Worker loop stopped.");
  }

  async fn spawn_task(
    pool_name: &Arc<String>,
    tasks_tokio_handle: &TokioHandle,
    active_tasks: &Arc<DashMap<u64, Instant>>,
    completion_tx: &AsyncSender<InternalCompletionMessage>,
    permit: OwnedSemaphorePermit,
    task: ManagedTask<R>,
  ) {
    let task_id = task.task_id;
    match task.kind {
      TaskKind::Computation { future, state } => {
        if !state.try_start() {
          debug!(name = %**pool_name, %task_id, "Dequeued computation was already cancelled; skipping execution.");
          drop(permit);
          let message = InternalCompletionMessage {
            task_id,
            pool_name: pool_name.clone(),
            status: TaskCompletionStatus::Cancelled,
          };
          if completion_tx.send(message).await.is_err() {
            trace!(%task_id, "Completion channel closed; notification dropped.");
          }
          return;
        }

        active_tasks.insert(task_id, Instant::now());
        debug!(name = %**pool_name, %task_id, "Dequeued computation. Spawning with worker slot.");

        let pool_name_for_task = pool_name.clone();
        let active_tasks_cleanup = active_tasks.clone();
        let completion_tx_for_task = completion_tx.clone();

        tasks_tokio_handle.spawn(
          async move {
            let _slot = permit;
            let started = Instant::now();

            let outcome = match AssertUnwindSafe(future).catch_unwind().await {
              Ok(Ok(value)) => {
                trace!(%task_id, "Computation executed successfully.");
                Ok(value)
              }
              Ok(Err(cause)) => {
                error!(%task_id, "Computation failed: {}", cause);
                Err(PoolError::TaskFailed(cause.to_string()))
              }
              Err(_panic_payload) => {
                error!(%task_id, "Computation panicked during execution.");
                Err(PoolError::TaskPanicked)
              }
            };

            // Deregister before resolving the handle, so observers woken by
            // the completion see a consistent active count.
            active_tasks_cleanup.remove(&task_id);
            debug!(%task_id, "Computation finished in {:?}.", started.elapsed());

            let status = TaskCompletionStatus::from(&outcome);
            if !state.complete(outcome) {
              warn!(%task_id, "Computation outcome arrived after its handle was already terminal.");
            }

            let message = InternalCompletionMessage {
              task_id,
              pool_name: pool_name_for_task,
              status,
            };
            if completion_tx_for_task.send(message).await.is_err() {
              trace!(%task_id, "Completion channel closed; notification dropped.");
            }
          }
          .instrument(info_span!("pool_task", pool_name = %**pool_name, %task_id)),
        );
      }
      TaskKind::Action(future) => {
        active_tasks.insert(task_id, Instant::now());
        debug!(name = %**pool_name, %task_id, "Dequeued action. Spawning with worker slot.");

        let pool_name_for_task = pool_name.clone();
        let active_tasks_cleanup = active_tasks.clone();
        let completion_tx_for_task = completion_tx.clone();

        tasks_tokio_handle.spawn(
          async move {
            let _slot = permit;

            let status = match AssertUnwindSafe(future).catch_unwind().await {
              Ok(Ok(())) => {
                trace!(%task_id, "Action executed successfully.");
                TaskCompletionStatus::Success
              }
              Ok(Err(cause)) => {
                error!(%task_id, "Action failed: {}", cause);
                TaskCompletionStatus::Failed
              }
              Err(_panic_payload) => {
                error!(%task_id, "Action panicked during execution.");
                TaskCompletionStatus::Panicked
              }
            };

            active_tasks_cleanup.remove(&task_id);

            let message = InternalCompletionMessage {
              task_id,
              pool_name: pool_name_for_task,
              status,
            };
            if completion_tx_for_task.send(message).await.is_err() {
              trace!(%task_id, "Completion channel closed; notification dropped.");
            }
          }
          .instrument(info_span!("pool_task", pool_name = %**pool_name, %task_id)),
        );
      }
    }
  }

  async fn resolve_discarded(
    pool_name: &Arc<String>,
    task: ManagedTask<R>,
    completion_tx: &AsyncSender<InternalCompletionMessage>,
  ) {
    let task_id = task.task_id;
    if let TaskKind::Computation { state, .. } = task.kind {
      // May lose to a handle-side cancellation that already resolved the
      // state; either way the observers see TaskCancelled exactly once.
      state.complete(Err(PoolError::TaskCancelled));
    }
    debug!(name = %**pool_name, %task_id, "Queued task discarded during shutdown; resolved as cancelled.");
    let message = InternalCompletionMessage {
      task_id,
      pool_name: pool_name.clone(),
      status: TaskCompletionStatus::Cancelled,
    };
    if completion_tx.send(message).await.is_err() {
      trace!(%task_id, "Completion channel closed; notification dropped.");
    }
  }
}

impl<R: Clone + Send + 'static> Drop for TaskPoolManager<R> {
  fn drop(&mut self) {
    if !self.shutdown_token.is_cancelled() {
      info!(
        pool_name = %*self.pool_name,
        "TaskPoolManager dropped without explicit shutdown. Signalling worker to stop and closing the queue."
      );
      // Signal first, then close the queue: submit checks the token, and the
      // closed queue is what lets a blocked worker-loop recv terminate. The
      // worker join handle is NOT awaited here, drop must stay non-blocking;
      // the loop winds down on its own once the queue drains.
      self.shutdown_token.cancel();
      self.queue_tx.close();
    } else {
      trace!(pool_name = %*self.pool_name, "Drop: shutdown already in progress. No new signals sent.");
    }
  }
}
