//! Pipeline combinators over [`ComputeHandle`].
//!
//! Every combinator registers a continuation on its upstream handle(s) and
//! returns a new derived handle immediately; nothing here polls or waits.
//! Derived handles propagate failure and cancellation without invoking the
//! user function, and a user function that panics resolves the derived
//! handle to `Err(PoolError::TaskPanicked)` instead of unwinding into the
//! completing context.

use crate::error::PoolError;
use crate::handle::{ComputeHandle, HandleState, TaskOutcome};
use crate::task::next_task_id;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

/// Pairing buffer for [`ComputeHandle::zip_with`]. Each upstream callback
/// deposits its value; whichever deposit finds both sides present takes the
/// merge function and fires.
struct JoinSlots<A, B, F> {
  left: Option<A>,
  right: Option<B>,
  merge: Option<F>,
}

fn try_merge<A, B, V, F>(slots: &Mutex<JoinSlots<A, B, F>>, downstream: &HandleState<V>)
where
  V: Clone + Send + 'static,
  F: FnOnce(A, B) -> V,
{
  let ready = {
    let mut guard = slots.lock();
    if guard.left.is_some() && guard.right.is_some() {
      let merge = guard.merge.take();
      let left = guard.left.take();
      let right = guard.right.take();
      merge.map(|merge| (left, right, merge))
    } else {
      None
    }
  };
  if let Some((Some(left), Some(right), merge)) = ready {
    match catch_unwind(AssertUnwindSafe(move || merge(left, right))) {
      Ok(value) => {
        downstream.complete(Ok(value));
      }
      Err(_panic_payload) => {
        warn!("zip_with merge function panicked; resolving derived handle as panicked.");
        downstream.complete(Err(PoolError::TaskPanicked));
      }
    }
  }
}

impl<T: Clone + Send + 'static> ComputeHandle<T> {
  fn derived<U: Clone + Send + 'static>() -> (Arc<HandleState<U>>, ComputeHandle<U>) {
    let state = HandleState::new();
    let handle = ComputeHandle {
      task_id: next_task_id(),
      state: state.clone(),
    };
    (state, handle)
  }

  /// Transforms a successful outcome with `transform`.
  ///
  /// Failure and cancellation propagate to the derived handle unchanged and
  /// `transform` is never invoked for them.
  pub fn map<U, F>(&self, transform: F) -> ComputeHandle<U>
  where
    U: Clone + Send + 'static,
    F: FnOnce(T) -> U + Send + 'static,
  {
    let (downstream, handle) = Self::derived::<U>();
    self.state.add_callback(Box::new(move |outcome: &TaskOutcome<T>| {
      match outcome {
        Ok(value) => {
          let value = value.clone();
          match catch_unwind(AssertUnwindSafe(move || transform(value))) {
            Ok(mapped) => {
              downstream.complete(Ok(mapped));
            }
            Err(_panic_payload) => {
              warn!("map transform panicked; resolving derived handle as panicked.");
              downstream.complete(Err(PoolError::TaskPanicked));
            }
          }
        }
        Err(error) => {
          downstream.complete(Err(error.clone()));
        }
      }
    }));
    handle
  }

  /// Chains a dependent asynchronous step: on success, `next` produces a new
  /// handle (typically from another `submit`) whose terminal outcome the
  /// derived handle adopts.
  pub fn and_then<U, F>(&self, next: F) -> ComputeHandle<U>
  where
    U: Clone + Send + 'static,
    F: FnOnce(T) -> ComputeHandle<U> + Send + 'static,
  {
    let (downstream, handle) = Self::derived::<U>();
    self.state.add_callback(Box::new(move |outcome: &TaskOutcome<T>| {
      match outcome {
        Ok(value) => {
          let value = value.clone();
          match catch_unwind(AssertUnwindSafe(move || next(value))) {
            Ok(inner) => {
              inner.state.add_callback(Box::new(move |inner_outcome: &TaskOutcome<U>| {
                downstream.complete(inner_outcome.clone());
              }));
            }
            Err(_panic_payload) => {
              warn!("and_then continuation panicked; resolving derived handle as panicked.");
              downstream.complete(Err(PoolError::TaskPanicked));
            }
          }
        }
        Err(error) => {
          downstream.complete(Err(error.clone()));
        }
      }
    }));
    handle
  }

  /// Joins two independent handles: the derived handle completes with
  /// `merge(a, b)` once both inputs have completed successfully, in either
  /// arrival order.
  ///
  /// If either input fails or is cancelled the derived handle adopts that
  /// outcome. Should both inputs fail, the failure whose callback reaches the
  /// derived handle's transition first is kept: first writer wins.
  pub fn zip_with<U, V, F>(&self, other: &ComputeHandle<U>, merge: F) -> ComputeHandle<V>
  where
    U: Clone + Send + 'static,
    V: Clone + Send + 'static,
    F: FnOnce(T, U) -> V + Send + 'static,
  {
    let (downstream, handle) = Self::derived::<V>();
    let slots = Arc::new(Mutex::new(JoinSlots {
      left: None,
      right: None,
      merge: Some(merge),
    }));

    let left_slots = slots.clone();
    let left_downstream = downstream.clone();
    self.state.add_callback(Box::new(move |outcome: &TaskOutcome<T>| {
      match outcome {
        Ok(value) => {
          left_slots.lock().left = Some(value.clone());
          try_merge(&left_slots, &left_downstream);
        }
        Err(error) => {
          left_downstream.complete(Err(error.clone()));
        }
      }
    }));

    other.state.add_callback(Box::new(move |outcome: &TaskOutcome<U>| {
      match outcome {
        Ok(value) => {
          slots.lock().right = Some(value.clone());
          try_merge(&slots, &downstream);
        }
        Err(error) => {
          downstream.complete(Err(error.clone()));
        }
      }
    }));

    handle
  }

  /// Replaces a failure with `fallback(error)`.
  ///
  /// Success passes through untouched, and so does cancellation: a
  /// cancelled pipeline stays cancelled rather than being resurrected by a
  /// fallback value. A panicking `fallback` resolves the derived handle as
  /// panicked.
  pub fn recover<F>(&self, fallback: F) -> ComputeHandle<T>
  where
    F: FnOnce(PoolError) -> T + Send + 'static,
  {
    let (downstream, handle) = Self::derived::<T>();
    self.state.add_callback(Box::new(move |outcome: &TaskOutcome<T>| {
      match outcome {
        Ok(value) => {
          downstream.complete(Ok(value.clone()));
        }
        Err(PoolError::TaskCancelled) => {
          downstream.complete(Err(PoolError::TaskCancelled));
        }
        Err(error) => {
          let error = error.clone();
          match catch_unwind(AssertUnwindSafe(move || fallback(error))) {
            Ok(value) => {
              downstream.complete(Ok(value));
            }
            Err(_panic_payload) => {
              warn!("recover fallback panicked; resolving derived handle as panicked.");
              downstream.complete(Err(PoolError::TaskPanicked));
            }
          }
        }
      }
    }));
    handle
  }
}
