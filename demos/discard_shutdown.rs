use futures_relay::{ComputeHandle, PoolError, ShutdownMode, TaskPoolManager};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

async fn slow_task(id: usize, duration_ms: u64) -> Result<String, futures_relay::TaskError> {
  info!("Task {} starting ({}ms)", id, duration_ms);
  tokio::time::sleep(Duration::from_millis(duration_ms)).await;
  Ok(format!("Task {} completed normally", id))
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();
  info!("--- Discard Shutdown Example ---");

  let manager = TaskPoolManager::<String>::new(
    2, // Concurrency limit of 2
    10,
    Handle::current(),
    "discard_shutdown_pool",
  );

  let mut handles: Vec<ComputeHandle<String>> = Vec::new();

  // Submit 5 tasks of 2s each: two start, three wait in the queue.
  for i in 0..5 {
    let future = Box::pin(async move { slow_task(i, 2000).await });
    match manager.submit(future).await {
      Ok(handle) => {
        info!("Submitted task {} (handle id {})", i, handle.id());
        handles.push(handle);
      }
      Err(e) => tracing::error!("Failed to submit task {}: {:?}", i, e),
    }
  }

  tokio::time::sleep(Duration::from_millis(200)).await; // Let tasks 0 and 1 start
  info!(
    "Queued: {}, Active: {}. Initiating DiscardPending shutdown...",
    manager.queued_task_count(),
    manager.active_task_count()
  );

  let manager_for_shutdown = manager.clone();
  let shutdown_jh = tokio::spawn(async move {
    manager_for_shutdown
      .shutdown(ShutdownMode::DiscardPending)
      .await
      .expect("Shutdown failed");
    info!("Pool shutdown call completed.");
  });

  // Submissions made after the shutdown signal are rejected.
  tokio::time::sleep(Duration::from_millis(50)).await;
  let late_future = Box::pin(async { slow_task(99, 100).await });
  match manager.submit(late_future).await {
    Ok(_) => tracing::error!("LATE SUBMISSION SUCCEEDED (UNEXPECTED!)"),
    Err(e) => info!("Late submission correctly failed: {:?}", e),
  }

  // Expected: tasks 0 and 1 run to completion (cancellation is never
  // preemptive); tasks 2, 3 and 4 resolve as cancelled without running.
  for handle in handles {
    let task_id = handle.id();
    match handle.result().await {
      Ok(result) => info!("Task handle {}: {}", task_id, result),
      Err(PoolError::TaskCancelled) => info!("Task handle {} discarded while queued.", task_id),
      Err(e) => info!("Task handle {} error: {:?}", task_id, e),
    }
  }

  shutdown_jh.await.expect("Shutdown join handle failed");
  info!("--- Discard Shutdown Example End ---");
}
