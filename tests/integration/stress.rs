//! Concurrent submitters, membership churn and admission limits.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use fleet_integration_tests::{RecordingWorker, TestFleet};
use fleet_types::{RouterConfig, Task};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(30000)]
async fn test_concurrent_submit_with_churn_accounts_for_every_task() {
    let config = RouterConfig {
        replicas: 16,
        queue_capacity: 64,
        max_in_flight_per_worker: 4,
        ..RouterConfig::default()
    };
    let fleet = TestFleet::new(6, Duration::from_millis(1), config).await;
    let dispatcher = fleet.dispatcher.clone();

    let churn_done = Arc::new(AtomicBool::new(false));
    let churn = {
        let dispatcher = dispatcher.clone();
        let done = churn_done.clone();
        tokio::spawn(async move {
            let mut i = 0;
            while !done.load(Ordering::Relaxed) {
                let id = format!("churn-{}", i % 3);
                dispatcher
                    .add_worker(RecordingWorker::new(&id, Duration::from_millis(1)))
                    .await;
                tokio::time::sleep(Duration::from_millis(2)).await;
                dispatcher.remove_worker(&id).await;
                i += 1;
            }
        })
    };

    let mut submitters = Vec::new();
    for s in 0..4 {
        let dispatcher = dispatcher.clone();
        submitters.push(tokio::spawn(async move {
            for i in 0..500 {
                let _ = dispatcher.submit(Task::new(format!("s{s}-{i}"), "x"));
                if i % 25 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }));
    }
    for s in submitters {
        s.await.unwrap();
    }
    churn_done.store(true, Ordering::Relaxed);
    churn.await.unwrap();

    let stats = fleet.settle().await;
    let d = stats.dispatch;
    assert_eq!(d.submitted + d.rejected, 2_000);
    assert_eq!(d.completed + d.failed + d.dropped(), d.submitted);
    assert_eq!(d.dropped_no_workers, 0);
    assert_eq!(d.failed, 0);
    assert_eq!(stats.totals.worker_count, 6);
    fleet.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(30000)]
async fn test_in_flight_never_exceeds_limit() {
    let config = RouterConfig {
        queue_capacity: 200,
        max_in_flight_per_worker: 3,
        worker_queue_capacity: 200,
        ..RouterConfig::default()
    };
    let fleet = TestFleet::new(2, Duration::from_millis(20), config).await;

    let mut accepted = 0u64;
    for i in 0..150 {
        if fleet.dispatcher.submit(Task::new(format!("t-{i}"), "x")).is_ok() {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 150);

    let stats = fleet.settle().await;
    assert_eq!(stats.dispatch.completed, accepted);

    // worker-1 owns 106 of these IDs, far more than it may run at once.
    for id in ["worker-1", "worker-2"] {
        let peak = fleet.worker(id).peak_running();
        assert!(peak <= 3, "{id} ran {peak} tasks at once");
    }
    assert_eq!(fleet.worker("worker-1").peak_running(), 3);
    fleet.stop().await;
}
