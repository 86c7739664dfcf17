use futures_relay::{ComputationFuture, PoolError, ShutdownMode, TaskPoolManager};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

fn fetch_number(value: i64, delay_ms: u64) -> ComputationFuture<i64> {
  Box::pin(async move {
    info!("Producing {} after {}ms", value, delay_ms);
    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    Ok(value)
  })
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();
  info!("--- Pipeline Example ---");

  let manager = TaskPoolManager::<i64>::new(2, 10, Handle::current(), "pipeline_pool");

  // map: transform a successful result without blocking anyone.
  let base = manager.submit(fetch_number(21, 300)).await.expect("submit failed");
  let doubled = base.map(|value| value * 2);
  doubled.on_complete(|outcome| info!("map callback saw: {:?}", outcome));

  // zip_with: merge two independent computations in either arrival order.
  let left = manager.submit(fetch_number(2, 400)).await.expect("submit failed");
  let right = manager.submit(fetch_number(3, 150)).await.expect("submit failed");
  let sum = left.zip_with(&right, |a, b| a + b);

  // submit_after: a dependent step that only runs once its input exists.
  let seed = manager.submit(fetch_number(10, 200)).await.expect("submit failed");
  let dependent = manager.submit_after(&seed, |value| async move {
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(value * 3)
  });

  // recover: a failing step replaced by a fallback value.
  let broken: ComputationFuture<i64> = Box::pin(async {
    Err("upstream data source offline".into())
  });
  let failing = manager.submit(broken).await.expect("submit failed");
  let rescued = failing.recover(|error: PoolError| {
    info!("Recovering from: {}", error);
    -1
  });

  info!("doubled   = {:?}", doubled.result().await);
  info!("sum       = {:?}", sum.result().await);
  info!("dependent = {:?}", dependent.result().await);
  info!("rescued   = {:?}", rescued.result().await);

  manager
    .shutdown(ShutdownMode::Drain)
    .await
    .expect("Pool shutdown failed");
  info!("--- Pipeline Example End ---");
}
