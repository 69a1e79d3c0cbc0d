//! End-to-end dispatch through the bounded queue.

use std::time::Duration;

use fleet_integration_tests::{TestFleet, task_ids};
use fleet_router::RouterError;
use fleet_types::events::{DropReason, TaskDropped};
use fleet_types::{RouterConfig, Task, UnhealthyPolicy};

fn config() -> RouterConfig {
    RouterConfig {
        replicas: 50,
        ..RouterConfig::default()
    }
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_each_task_processed_by_its_owner() {
    let fleet = TestFleet::new(4, Duration::from_millis(1), config()).await;
    let ids = task_ids("route", 0..200);
    let owners = fleet.owners(&ids).await;

    // Queue capacity is 100: submit in two halves.
    assert_eq!(fleet.submit_all(&ids[..100]), 100);
    fleet.settle().await;
    assert_eq!(fleet.submit_all(&ids[100..]), 100);
    let stats = fleet.settle().await;

    assert_eq!(stats.dispatch.completed, 200);
    assert_eq!(fleet.processed_by(), owners);
    fleet.stop().await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_full_queue_rejects_without_blocking() {
    let config = RouterConfig {
        queue_capacity: 5,
        max_in_flight_per_worker: 1,
        ..config()
    };
    let fleet = TestFleet::new(1, Duration::from_millis(50), config).await;

    // No await between submits, so the loop cannot drain the queue meanwhile.
    let burst = task_ids("burst", 0..20);
    let accepted = fleet.submit_all(&burst);
    assert_eq!(accepted, 5);

    let err = fleet
        .dispatcher
        .submit(Task::new("one-more", "x"))
        .unwrap_err();
    assert_eq!(err, RouterError::QueueFull { capacity: 5 });

    let stats = fleet.dispatcher.stats().await;
    assert_eq!(stats.dispatch.submitted, 5);
    assert_eq!(stats.dispatch.rejected, 16);

    // Once the loop has drained the queue, submissions are accepted again.
    fleet.drain_queue().await;
    let again = task_ids("again", 0..5);
    assert_eq!(fleet.submit_all(&again), 5);
    assert_eq!(fleet.dispatcher.queue_len(), 5);
    assert_eq!(
        fleet.dispatcher.submit(Task::new("over", "x")),
        Err(RouterError::QueueFull { capacity: 5 })
    );

    let stats = fleet.settle().await;
    assert_eq!(stats.dispatch.submitted, 10);
    assert_eq!(stats.dispatch.rejected, 17);
    assert_eq!(stats.dispatch.completed, 10);
    assert_eq!(stats.dispatch.dropped(), 0);

    let processed_by = fleet.processed_by();
    for id in burst[..5].iter().chain(&again) {
        assert_eq!(processed_by[id], "worker-1", "{id} was not processed");
    }
    fleet.stop().await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_saturated_worker_does_not_delay_others() {
    let config = RouterConfig {
        max_in_flight_per_worker: 1,
        ..config()
    };
    let fleet = TestFleet::with_workers(
        &[
            ("slow", Duration::from_secs(30)),
            ("fast", Duration::from_millis(1)),
        ],
        config,
    )
    .await;

    let candidates = task_ids("mixed", 0..100);
    let owners = fleet.owners(&candidates).await;
    let owned = |worker: &str, n: usize| -> Vec<String> {
        candidates
            .iter()
            .filter(|id| owners[*id] == worker)
            .take(n)
            .cloned()
            .collect()
    };
    let slow_ids = owned("slow", 2);
    let fast_ids = owned("fast", 5);
    assert_eq!((slow_ids.len(), fast_ids.len()), (2, 5));

    // The slow worker is busy with its first task before the fast ones arrive.
    assert_eq!(fleet.submit_all(&slow_ids), 2);
    fleet.wait_for(|s| s.dispatch.dispatched == 1).await;
    assert_eq!(fleet.submit_all(&fast_ids), 5);

    let stats = fleet
        .wait_for(|s| s.worker("fast").is_some_and(|w| w.processed == 5))
        .await;
    assert_eq!(stats.worker("slow").unwrap().in_flight, 1);
    assert_eq!(stats.dispatch.dropped(), 0);
    assert_eq!(fleet.dispatcher.queue_len(), 0);

    let mut seen: Vec<String> = fleet
        .worker("fast")
        .seen()
        .iter()
        .map(|id| id.to_string())
        .collect();
    seen.sort();
    let mut expected = fast_ids;
    expected.sort();
    assert_eq!(seen, expected);
    fleet.stop().await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_unhealthy_owner_receives_nothing() {
    let fleet = TestFleet::new(3, Duration::from_millis(1), config()).await;
    let ids = task_ids("health", 0..300);
    let owners = fleet.owners(&ids).await;
    let on_down = owners.values().filter(|w| *w == "worker-2").count() as u64;
    assert!(on_down > 0);

    fleet.worker("worker-2").set_healthy(false);
    let mut accepted = 0;
    for chunk in ids.chunks(100) {
        accepted += fleet.submit_all(chunk);
        fleet.settle().await;
    }
    assert_eq!(accepted, 300);

    let stats = fleet.settle().await;
    assert!(fleet.worker("worker-2").seen().is_empty());
    assert_eq!(stats.dispatch.dropped_unhealthy, on_down);
    assert_eq!(stats.dispatch.completed, 300 - on_down);
    fleet.stop().await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_next_healthy_policy_keeps_every_task() {
    let config = RouterConfig {
        unhealthy_policy: UnhealthyPolicy::NextHealthy,
        ..config()
    };
    let fleet = TestFleet::new(3, Duration::from_millis(1), config).await;
    let ids = task_ids("reroute", 0..300);
    let owners = fleet.owners(&ids).await;

    fleet.worker("worker-2").set_healthy(false);
    for chunk in ids.chunks(100) {
        fleet.submit_all(chunk);
        fleet.settle().await;
    }

    let stats = fleet.settle().await;
    assert_eq!(stats.dispatch.completed, 300);
    assert_eq!(stats.dispatch.dropped(), 0);

    let processed_by = fleet.processed_by();
    for id in &ids {
        let by = &processed_by[id];
        assert_ne!(by, "worker-2");
        if owners[id] != "worker-2" {
            assert_eq!(by, &owners[id], "{id} left its healthy owner");
        }
    }
    fleet.stop().await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_empty_fleet_drops_with_event() {
    let fleet = TestFleet::new(0, Duration::ZERO, config()).await;
    let mut dropped = fleet.dispatcher.events().subscribe::<TaskDropped>();

    assert_eq!(fleet.submit_all(&task_ids("orphan", 0..10)), 10);
    let stats = fleet.settle().await;
    assert_eq!(stats.dispatch.dropped_no_workers, 10);
    assert_eq!(stats.totals.worker_count, 0);

    let event = dropped.recv().await.unwrap();
    assert_eq!(event.task_id.as_str(), "orphan-0");
    assert_eq!(event.reason, DropReason::NoWorkersAvailable);
    fleet.stop().await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_stop_abandons_queued_tasks() {
    let config = RouterConfig {
        max_in_flight_per_worker: 1,
        ..config()
    };
    let fleet = TestFleet::new(1, Duration::from_secs(30), config).await;

    assert_eq!(fleet.submit_all(&task_ids("pending", 0..5)), 5);
    fleet.wait_for(|s| s.dispatch.dispatched == 1).await;

    fleet.stop().await;
    let stats = fleet.dispatcher.stats().await;
    assert_eq!(stats.dispatch.abandoned, 4);
    assert_eq!(stats.dispatch.completed, 0);

    assert_eq!(
        fleet.dispatcher.submit(Task::new("late", "x")),
        Err(RouterError::Stopped)
    );
}
