use futures_relay::{
  ComputationFuture, PoolError, ShutdownMode, TaskCompletionInfo, TaskCompletionStatus, TaskPoolManager,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle as TokioHandle;
use tokio::time::sleep;

fn computation(duration_ms: u64, output_value: String, should_panic: bool) -> ComputationFuture<String> {
  Box::pin(async move {
    sleep(Duration::from_millis(duration_ms)).await;
    if should_panic {
      panic!("intentional panic for notifier test");
    }
    Ok(output_value)
  })
}

fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,futures_relay=trace"));
    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

// Helper for collecting notifications in tests.
fn create_collecting_handler() -> (
  Arc<Mutex<Vec<TaskCompletionInfo>>>,
  impl Fn(TaskCompletionInfo) + Send + Sync + 'static,
) {
  let collected = Arc::new(Mutex::new(Vec::new()));
  let collected_for_handler = collected.clone();
  let handler = move |info: TaskCompletionInfo| {
    tracing::debug!("Collecting handler received task_id: {}, status: {:?}", info.task_id, info.status);
    collected_for_handler.lock().unwrap().push(info);
  };
  (collected, handler)
}

#[tokio::test]
async fn test_notifier_reports_success() {
  setup_tracing_for_test();
  let pool_name = "test_notifier_success";
  let manager = TaskPoolManager::<String>::new(1, 2, TokioHandle::current(), pool_name);
  let (notifications, handler) = create_collecting_handler();
  manager.add_completion_handler(handler);

  let handle = manager.submit(computation(20, "ok_val".to_string(), false)).await.unwrap();
  let task_id = handle.id();
  assert_eq!(handle.result().await, Ok("ok_val".to_string()));

  manager.shutdown(ShutdownMode::Drain).await.unwrap();
  sleep(Duration::from_millis(50)).await; // Handlers run on spawned contexts.

  let notifs = notifications.lock().unwrap();
  assert_eq!(notifs.len(), 1);
  assert_eq!(notifs[0].task_id, task_id);
  assert_eq!(*notifs[0].pool_name, pool_name);
  assert_eq!(notifs[0].status, TaskCompletionStatus::Success);
  assert!(notifs[0].completion_time <= std::time::SystemTime::now());
}

#[tokio::test]
async fn test_notifier_reports_failure_and_panic() {
  setup_tracing_for_test();
  let manager = TaskPoolManager::<String>::new(1, 4, TokioHandle::current(), "test_notifier_failure_panic");
  let (notifications, handler) = create_collecting_handler();
  manager.add_completion_handler(handler);

  let failing: ComputationFuture<String> = Box::pin(async { Err("bad input".into()) });
  let handle_failed = manager.submit(failing).await.unwrap();
  let failed_id = handle_failed.id();
  assert!(matches!(handle_failed.result().await, Err(PoolError::TaskFailed(_))));

  let handle_panicked = manager.submit(computation(10, "never".to_string(), true)).await.unwrap();
  let panicked_id = handle_panicked.id();
  assert_eq!(handle_panicked.result().await, Err(PoolError::TaskPanicked));

  manager.shutdown(ShutdownMode::Drain).await.unwrap();
  sleep(Duration::from_millis(50)).await;

  let notifs = notifications.lock().unwrap();
  assert_eq!(notifs.len(), 2);
  let failed_info = notifs.iter().find(|n| n.task_id == failed_id).expect("no event for failed task");
  assert_eq!(failed_info.status, TaskCompletionStatus::Failed);
  let panicked_info = notifs.iter().find(|n| n.task_id == panicked_id).expect("no event for panicked task");
  assert_eq!(panicked_info.status, TaskCompletionStatus::Panicked);
}

#[tokio::test]
async fn test_notifier_reports_pre_cancelled_dequeued_task() {
  setup_tracing_for_test();
  let manager = TaskPoolManager::<String>::new(1, 5, TokioHandle::current(), "test_notifier_pre_cancelled");
  let (notifications, handler) = create_collecting_handler();
  manager.add_completion_handler(handler);

  // Task A occupies the only worker slot.
  let handle_a = manager.submit(computation(150, "task_a_done".to_string(), false)).await.unwrap();
  let task_a_id = handle_a.id();

  // Task B is queued, then cancelled before it can start.
  let handle_b = manager.submit(computation(500, "task_b_wont_run".to_string(), false)).await.unwrap();
  let task_b_id = handle_b.id();
  assert!(handle_b.cancel());

  assert_eq!(handle_a.result().await, Ok("task_a_done".to_string()));
  assert_eq!(handle_b.result().await, Err(PoolError::TaskCancelled));

  manager.shutdown(ShutdownMode::Drain).await.unwrap();
  sleep(Duration::from_millis(50)).await;

  let notifs = notifications.lock().unwrap();
  assert_eq!(notifs.len(), 2, "Expected events for task A and the cancelled task B");
  let info_a = notifs.iter().find(|n| n.task_id == task_a_id).expect("no event for task A");
  assert_eq!(info_a.status, TaskCompletionStatus::Success);
  let info_b = notifs.iter().find(|n| n.task_id == task_b_id).expect("no event for task B");
  assert_eq!(info_b.status, TaskCompletionStatus::Cancelled);
}

#[tokio::test]
async fn test_notifier_reports_discarded_queued_tasks() {
  setup_tracing_for_test();
  let manager = TaskPoolManager::<String>::new(1, 5, TokioHandle::current(), "test_notifier_discard");
  let (notifications, handler) = create_collecting_handler();
  manager.add_completion_handler(handler);

  let handle_running = manager.submit(computation(150, "running_done".to_string(), false)).await.unwrap();
  let running_id = handle_running.id();
  let handle_queued = manager.submit(computation(10, "queued_wont_run".to_string(), false)).await.unwrap();
  let queued_id = handle_queued.id();

  sleep(Duration::from_millis(30)).await;
  manager.clone().shutdown(ShutdownMode::DiscardPending).await.unwrap();

  assert_eq!(handle_running.result().await, Ok("running_done".to_string()));
  assert_eq!(handle_queued.result().await, Err(PoolError::TaskCancelled));

  sleep(Duration::from_millis(50)).await;

  let notifs = notifications.lock().unwrap();
  assert_eq!(notifs.len(), 2);
  let info_running = notifs.iter().find(|n| n.task_id == running_id).expect("no event for in-flight task");
  assert_eq!(info_running.status, TaskCompletionStatus::Success);
  let info_queued = notifs.iter().find(|n| n.task_id == queued_id).expect("no event for discarded task");
  assert_eq!(info_queued.status, TaskCompletionStatus::Cancelled);
}

#[tokio::test]
async fn test_notifier_reports_actions() {
  setup_tracing_for_test();
  let manager = TaskPoolManager::<String>::new(1, 2, TokioHandle::current(), "test_notifier_actions");
  let (notifications, handler) = create_collecting_handler();
  manager.add_completion_handler(handler);

  manager
    .execute(Box::pin(async {
      Ok(())
    }))
    .await
    .unwrap();
  manager
    .execute(Box::pin(async {
      Err("action failure".into())
    }))
    .await
    .unwrap();

  sleep(Duration::from_millis(50)).await;
  manager.shutdown(ShutdownMode::Drain).await.unwrap();
  sleep(Duration::from_millis(50)).await;

  let notifs = notifications.lock().unwrap();
  assert_eq!(notifs.len(), 2);
  assert!(notifs.iter().any(|n| n.status == TaskCompletionStatus::Success));
  assert!(notifs.iter().any(|n| n.status == TaskCompletionStatus::Failed));
}

#[tokio::test]
async fn test_notifier_multiple_handlers() {
  setup_tracing_for_test();
  let manager = TaskPoolManager::<String>::new(1, 2, TokioHandle::current(), "test_notifier_multi_handler");

  let (notifications1, handler1) = create_collecting_handler();
  let (notifications2, handler2) = create_collecting_handler();
  manager.add_completion_handler(handler1);
  manager.add_completion_handler(handler2);

  let handle = manager.submit(computation(20, "multi_val".to_string(), false)).await.unwrap();
  let task_id = handle.id();
  assert_eq!(handle.result().await, Ok("multi_val".to_string()));

  manager.shutdown(ShutdownMode::Drain).await.unwrap();
  sleep(Duration::from_millis(50)).await;

  for notifications in [&notifications1, &notifications2] {
    let notifs = notifications.lock().unwrap();
    assert_eq!(notifs.len(), 1);
    assert_eq!(notifs[0].task_id, task_id);
    assert_eq!(notifs[0].status, TaskCompletionStatus::Success);
  }
}

#[tokio::test]
async fn test_notifier_handler_panic_is_isolated() {
  setup_tracing_for_test();
  let manager = TaskPoolManager::<String>::new(1, 2, TokioHandle::current(), "test_notifier_handler_panic");

  let (notifications, collecting_handler) = create_collecting_handler();
  let panicking_handler = |_info: TaskCompletionInfo| {
    panic!("intentional panic in completion handler");
  };
  manager.add_completion_handler(panicking_handler);
  manager.add_completion_handler(collecting_handler);

  let handle = manager.submit(computation(20, "survives".to_string(), false)).await.unwrap();
  assert_eq!(handle.result().await, Ok("survives".to_string()));

  manager.shutdown(ShutdownMode::Drain).await.unwrap();
  sleep(Duration::from_millis(50)).await;

  let notifs = notifications.lock().unwrap();
  assert_eq!(notifs.len(), 1, "The well-behaved handler must still be notified.");
  assert_eq!(notifs[0].status, TaskCompletionStatus::Success);
}

#[tokio::test]
async fn test_notifier_without_handlers_is_inert() {
  setup_tracing_for_test();
  let manager = TaskPoolManager::<String>::new(1, 2, TokioHandle::current(), "test_notifier_no_handlers");
  // No handlers registered; the pool must run and shut down normally.

  let handle = manager.submit(computation(20, "no_handler_val".to_string(), false)).await.unwrap();
  assert_eq!(handle.result().await, Ok("no_handler_val".to_string()));

  manager.shutdown(ShutdownMode::Drain).await.unwrap();
}

#[tokio::test]
async fn test_notifier_one_event_per_task_under_load() {
  setup_tracing_for_test();
  let manager = TaskPoolManager::<String>::new(3, 16, TokioHandle::current(), "test_notifier_load");
  let (notifications, handler) = create_collecting_handler();
  manager.add_completion_handler(handler);

  let mut expected_ids = Vec::new();
  let mut handles = Vec::new();
  for i in 0..10u64 {
    // Mix short jittered durations so completions interleave.
    let jitter = u64::from(rand::random::<u8>() % 30);
    let handle = manager.submit(computation(10 + jitter, format!("task_{}", i), false)).await.unwrap();
    expected_ids.push(handle.id());
    handles.push(handle);
  }
  for handle in handles {
    handle.result().await.unwrap();
  }

  manager.shutdown(ShutdownMode::Drain).await.unwrap();
  sleep(Duration::from_millis(100)).await;

  let notifs = notifications.lock().unwrap();
  assert_eq!(notifs.len(), expected_ids.len());
  for task_id in expected_ids {
    assert_eq!(
      notifs.iter().filter(|n| n.task_id == task_id).count(),
      1,
      "Exactly one completion event per task."
    );
  }
}
