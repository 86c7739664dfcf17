use crate::error::PoolError;

use fibre::mpsc::AsyncReceiver;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, Once, RwLock};
use std::time::SystemTime;
use tokio::runtime::Handle as TokioHandle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, Instrument};

/// How a pool task ended, as reported to completion handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCompletionStatus {
  Success,
  Failed,
  Cancelled,
  Panicked,
}

impl<R> From<&Result<R, PoolError>> for TaskCompletionStatus {
  fn from(result: &Result<R, PoolError>) -> Self {
    match result {
      Ok(_) => TaskCompletionStatus::Success,
      Err(PoolError::TaskCancelled) => TaskCompletionStatus::Cancelled,
      Err(PoolError::TaskPanicked) => TaskCompletionStatus::Panicked,
      Err(_) => TaskCompletionStatus::Failed,
    }
  }
}

/// The event handed to every registered completion handler.
#[derive(Debug, Clone)]
pub struct TaskCompletionInfo {
  pub task_id: u64,
  pub pool_name: Arc<String>,
  pub status: TaskCompletionStatus,
  pub completion_time: SystemTime,
}

// Internal wire format between the worker loop and the notification worker.
#[derive(Debug)]
pub(crate) struct InternalCompletionMessage {
  pub(crate) task_id: u64,
  pub(crate) pool_name: Arc<String>,
  pub(crate) status: TaskCompletionStatus,
}

struct NotifierInternalState {
  internal_rx_for_init: Option<AsyncReceiver<InternalCompletionMessage>>,
  tokio_handle: TokioHandle,
  pool_shutdown_token: CancellationToken,
  pool_name_for_logging: Arc<String>,
  worker_join_handle: Option<JoinHandle<()>>,
}

/// Pool-wide completion fan-out.
///
/// The notification worker is started lazily, on the first registered
/// handler; pools that never observe completions pay nothing. The worker
/// terminates once its input channel is closed and drained, which the
/// manager arranges after all in-flight tasks have finished.
pub(crate) struct CompletionNotifier {
  handlers: Arc<RwLock<Vec<Arc<dyn Fn(TaskCompletionInfo) + Send + Sync + 'static>>>>,
  init_once: Once,
  internal_state_for_init: StdMutex<NotifierInternalState>,
}

impl fmt::Debug for CompletionNotifier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let handler_count = self.handlers.try_read().map_or(0, |guard| guard.len());
    f.debug_struct("CompletionNotifier")
      .field("handler_count", &handler_count)
      .field("initialized", &self.init_once.is_completed())
      .finish_non_exhaustive()
  }
}

impl CompletionNotifier {
  pub(crate) fn new(
    internal_rx: AsyncReceiver<InternalCompletionMessage>,
    tokio_handle: TokioHandle,
    pool_shutdown_token: CancellationToken,
    pool_name_for_logging: Arc<String>,
  ) -> Arc<Self> {
    Arc::new(Self {
      handlers: Arc::new(RwLock::new(Vec::new())),
      init_once: Once::new(),
      internal_state_for_init: StdMutex::new(NotifierInternalState {
        internal_rx_for_init: Some(internal_rx),
        tokio_handle,
        pool_shutdown_token,
        pool_name_for_logging,
        worker_join_handle: None,
      }),
    })
  }

  fn ensure_worker_initialized(&self) {
    self.init_once.call_once(|| {
      let mut state_guard = self.internal_state_for_init.lock().unwrap();
      if let Some(rx) = state_guard.internal_rx_for_init.take() {
        info!(pool_name = %*state_guard.pool_name_for_logging, "First completion handler added. Starting notification worker.");
        let worker_handlers = self.handlers.clone();
        let worker_tokio_handle = state_guard.tokio_handle.clone();
        let worker_shutdown_token = state_guard.pool_shutdown_token.clone();
        let worker_pool_name = state_guard.pool_name_for_logging.clone();

        let join_handle = state_guard.tokio_handle.spawn(
          Self::run_notification_worker_loop(rx, worker_handlers, worker_tokio_handle, worker_shutdown_token)
            .instrument(info_span!("notification_worker_loop", pool_name = %*worker_pool_name)),
        );
        state_guard.worker_join_handle = Some(join_handle);
      }
    });
  }

  pub(crate) fn add_handler(&self, handler: impl Fn(TaskCompletionInfo) + Send + Sync + 'static) {
    self.ensure_worker_initialized();
    let mut handlers_guard = self.handlers.write().unwrap();
    handlers_guard.push(Arc::new(handler));
    debug!("Notifier: added completion handler. Total handlers: {}", handlers_guard.len());
  }

  async fn run_notification_worker_loop(
    mut queue_rx: AsyncReceiver<InternalCompletionMessage>,
    handlers_list: Arc<RwLock<Vec<Arc<dyn Fn(TaskCompletionInfo) + Send + Sync + 'static>>>>,
    tokio_handle: TokioHandle,
    pool_shutdown_token: CancellationToken,
  ) {
    info!("Notification worker started; runs until the completion channel closes.");
    let mut pool_shutdown_signaled_once = false;

    loop {
      tokio::select! {
        biased;

        recv_result = queue_rx.recv() => {
          match recv_result {
            Ok(message) => {
              Self::dispatch_message(message, &handlers_list, &tokio_handle);
            }
            Err(_disconnected) => {
              // Channel closed and fully drained; the worker's job is done.
              info!("Notification worker: completion channel closed. Terminating.");
              break;
            }
          }
        },
        // Secondary branch, logging only. The loop keeps draining messages
        // produced by in-flight tasks until the channel itself closes.
        _ = pool_shutdown_token.cancelled(), if !pool_shutdown_signaled_once => {
          trace!("Notification worker: pool shutdown signalled; draining remaining completions.");
          pool_shutdown_signaled_once = true;
        }
      }
    }

    info!("Notification worker stopped.");
  }

  fn dispatch_message(
    message: InternalCompletionMessage,
    handlers_list: &Arc<RwLock<Vec<Arc<dyn Fn(TaskCompletionInfo) + Send + Sync + 'static>>>>,
    tokio_handle: &TokioHandle,
  ) {
    let handlers_guard = handlers_list.read().unwrap();
    if handlers_guard.is_empty() {
      trace!(task_id = %message.task_id, "No completion handlers registered; dropping notification.");
      return;
    }

    let info = TaskCompletionInfo {
      task_id: message.task_id,
      pool_name: message.pool_name.clone(),
      status: message.status,
      completion_time: SystemTime::now(),
    };
    debug!(task_id = %info.task_id, "Dispatching notification to {} handlers.", handlers_guard.len());

    // Handlers run on their own spawned context so a slow or panicking
    // handler cannot stall the notification worker or its siblings.
    for handler in handlers_guard.iter() {
      let handler = handler.clone();
      let handler_info = info.clone();
      tokio_handle.spawn(async move {
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
          handler(handler_info.clone());
        }));
        if outcome.is_err() {
          error!(
            pool_name = %*handler_info.pool_name,
            task_id = %handler_info.task_id,
            "A completion handler panicked during execution."
          );
        }
      });
    }
  }

  pub(crate) async fn await_shutdown(&self) {
    let (join_handle, pool_name) = {
      let mut guard = self.internal_state_for_init.lock().unwrap();
      (guard.worker_join_handle.take(), guard.pool_name_for_logging.clone())
    };

    if let Some(handle) = join_handle {
      info!(pool_name = %*pool_name, "Notifier: waiting for notification worker to join.");
      if let Err(join_error) = handle.await {
        error!(pool_name = %*pool_name, "Notifier: error joining notification worker: {:?}", join_error);
      }
    } else {
      trace!(pool_name = %*pool_name, "Notifier: worker never started or already joined.");
    }
  }
}
