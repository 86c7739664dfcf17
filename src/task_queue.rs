use crate::error::PoolError;
use crate::task::ManagedTask;

use fibre::mpsc::{self, AsyncReceiver, AsyncSender, RecvError};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// An internal message pairing a task with the queue slot it occupies.
///
/// The slot permit is released when the message is dropped, which happens as
/// the worker loop unwraps it after a successful receive. A queue slot is
/// therefore freed only once its task has been fully dequeued.
pub(crate) struct QueueMessage<T: Clone + Send + 'static> {
  pub(crate) task: ManagedTask<T>,
  _slot: OwnedSemaphorePermit,
}

impl<T: Clone + Send + 'static> fmt::Debug for QueueMessage<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueMessage")
      .field("task_id", &self.task.task_id)
      .finish_non_exhaustive()
  }
}

/// A bounded, multi-producer, single-consumer FIFO queue for tasks.
///
/// Capacity is enforced with a semaphore layered over an unbounded
/// `fibre::mpsc` channel: submission acquires a slot permit (suspending when
/// the queue is full) and the permit travels inside the message until
/// dequeue. Backpressure is pure async suspension; no thread ever blocks.
pub(crate) struct TaskQueue<T: Clone + Send + 'static> {
  tx: AsyncSender<QueueMessage<T>>,
  rx: AsyncReceiver<QueueMessage<T>>,
  slots: Arc<Semaphore>,
}

impl<T: Clone + Send + 'static> TaskQueue<T> {
  pub(crate) fn new(capacity: usize) -> Self {
    let (tx, rx) = mpsc::unbounded_async();
    Self {
      tx,
      rx,
      slots: Arc::new(Semaphore::new(capacity.max(1))),
    }
  }

  /// Splits the queue into its producer and consumer halves.
  pub(crate) fn split(self) -> (QueueProducer<T>, QueueConsumer<T>) {
    (
      QueueProducer {
        tx: self.tx,
        slots: self.slots,
      },
      QueueConsumer { rx: self.rx },
    )
  }
}

/// The producer handle. Cloneable, shared across submission sites.
#[derive(Clone)]
pub(crate) struct QueueProducer<T: Clone + Send + 'static> {
  tx: AsyncSender<QueueMessage<T>>,
  slots: Arc<Semaphore>,
}

impl<T: Clone + Send + 'static> fmt::Debug for QueueProducer<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueProducer")
      .field("len", &self.len())
      .field("free_slots", &self.slots.available_permits())
      .finish_non_exhaustive()
  }
}

/// The consumer handle. Not cloneable, enforcing the single-consumer
/// pattern of the worker loop.
#[derive(Debug)]
pub(crate) struct QueueConsumer<T: Clone + Send + 'static> {
  rx: AsyncReceiver<QueueMessage<T>>,
}

impl<T: Clone + Send + 'static> QueueProducer<T> {
  /// Enqueues a task, suspending while the queue is at capacity.
  ///
  /// The acquired slot permit is moved into the message; if the send fails
  /// the message (and with it the permit) is dropped, so no slot leaks.
  pub(crate) async fn send(
    &self,
    task: ManagedTask<T>,
    shutdown_token: &CancellationToken,
  ) -> Result<(), PoolError> {
    if shutdown_token.is_cancelled() || self.tx.is_closed() {
      return Err(PoolError::PoolShuttingDown);
    }

    let slot = tokio::select! {
      biased;
      _ = shutdown_token.cancelled() => return Err(PoolError::PoolShuttingDown),
      acquired = self.slots.clone().acquire_owned() => {
        match acquired {
          Ok(permit) => permit,
          Err(_closed) => return Err(PoolError::PoolShuttingDown),
        }
      },
    };

    let message = QueueMessage { task, _slot: slot };
    if self.tx.send(message).await.is_ok() {
      Ok(())
    } else {
      Err(PoolError::QueueSendChannelClosed)
    }
  }

  /// Closes the sending side of the queue.
  pub(crate) fn close(&self) {
    let _ = self.tx.close();
  }

  pub(crate) fn is_closed(&self) -> bool {
    self.tx.is_closed()
  }

  /// Number of tasks currently queued.
  pub(crate) fn len(&self) -> usize {
    self.tx.len()
  }

  pub(crate) fn free_slots(&self) -> usize {
    self.slots.available_permits()
  }
}

impl<T: Clone + Send + 'static> QueueConsumer<T> {
  /// Receives the oldest queued task. The message wrapper is dropped here,
  /// releasing its queue slot. Errors once the queue is closed and empty.
  pub(crate) async fn recv(&self) -> Result<ManagedTask<T>, RecvError> {
    self.rx.recv().await.map(|message| message.task)
  }
}
