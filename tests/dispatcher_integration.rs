//! Integration tests for the request dispatcher
//!
//! These exercise the admission bound, accounting and backpressure under
//! real concurrent load.

use chat_relay::config::DispatcherConfig;
use chat_relay::dispatch::{DispatchError, RequestDispatcher};
use chat_relay::metrics::RelayMetrics;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn dispatcher_config(max_concurrent: usize, queue: usize, core: usize, max: usize) -> DispatcherConfig {
    DispatcherConfig {
        max_concurrent_requests: max_concurrent,
        queue_capacity: queue,
        core_pool_size: core,
        max_pool_size: max,
        ..Default::default()
    }
}

/// Tracks how many jobs run at once
#[derive(Default)]
struct ConcurrencyTracker {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyTracker {
    async fn hold(&self, duration: Duration) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(duration).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ceiling_bounds_concurrent_work() {
    // More workers than permits, so requests wait at the gate.
    let dispatcher = RequestDispatcher::new(dispatcher_config(10, 50, 15, 20), None).unwrap();
    let tracker = Arc::new(ConcurrencyTracker::default());
    let started = Instant::now();

    let handles: Vec<_> = (0..25)
        .map(|i| {
            let tracker = tracker.clone();
            dispatcher.submit(
                move || async move {
                    tracker.hold(Duration::from_millis(50)).await;
                    Ok::<_, anyhow::Error>(i as u32)
                },
                format!("job-{}", i),
            )
        })
        .collect();
    let all = tokio::spawn(futures::future::join_all(handles));

    tokio::time::sleep(Duration::from_millis(10)).await;
    let early = dispatcher.stats();
    assert!(early.active_requests > 0);
    assert!(early.active_requests <= 10, "active {}", early.active_requests);
    assert!(early.queued_requests + early.active_requests <= 25);

    while !all.is_finished() {
        let stats = dispatcher.stats();
        assert!(stats.active_requests <= 10, "active {}", stats.active_requests);
        assert!(
            stats.queued_requests + stats.active_requests <= 25,
            "queued {} active {}",
            stats.queued_requests,
            stats.active_requests
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let results = all.await.unwrap();
    let elapsed = started.elapsed();

    assert!(results.iter().all(|r| r.is_ok()));
    assert!(tracker.peak.load(Ordering::SeqCst) <= 10);
    // 25 jobs through 10 permits need at least three waves.
    assert!(elapsed >= Duration::from_millis(150), "finished in {:?}", elapsed);

    let stats = dispatcher.stats();
    assert_eq!(stats.total_requests, 25);
    assert_eq!(stats.completed_requests, 25);
    assert_eq!(stats.failed_requests, 0);
    assert_eq!(stats.active_requests, 0);
    assert_eq!(stats.queued_requests, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_counters_are_conserved() {
    let mut config = dispatcher_config(3, 50, 8, 8);
    config.request_timeout_ms = 40;
    let dispatcher = RequestDispatcher::new(config, None).unwrap();

    let handles: Vec<_> = (0..24)
        .map(|i| {
            dispatcher.submit(
                move || async move {
                    tokio::time::sleep(Duration::from_millis(15)).await;
                    match i % 3 {
                        0 => Ok(i as u32),
                        1 => Err(anyhow::anyhow!("upstream rejected job {}", i)),
                        _ => panic!("job {} blew up", i),
                    }
                },
                format!("job-{}", i),
            )
        })
        .collect();

    let results = futures::future::join_all(handles).await;
    let ok = results.iter().filter(|r| r.is_ok()).count() as u64;

    let stats = dispatcher.stats();
    assert_eq!(stats.total_requests, 24);
    assert_eq!(stats.completed_requests, ok);
    assert_eq!(stats.completed_requests + stats.failed_requests, stats.total_requests);
    assert_eq!(stats.active_requests, 0);
    assert_eq!(stats.queued_requests, 0);
}

#[tokio::test]
async fn test_saturation_runs_work_on_caller() {
    let metrics = Arc::new(RelayMetrics::new().unwrap());
    let dispatcher =
        RequestDispatcher::new(dispatcher_config(4, 1, 1, 2), Some(metrics.clone())).unwrap();

    let handles: Vec<_> = (0..10)
        .map(|i| {
            dispatcher.submit(
                move || async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok::<_, anyhow::Error>(i as u32)
                },
                format!("job-{}", i),
            )
        })
        .collect();

    let on_caller = handles.iter().filter(|h| h.runs_on_caller()).count();
    // One queued, one on the surplus worker, the rest on the caller.
    assert_eq!(on_caller, 8);

    let results = futures::future::join_all(handles).await;
    let values: Vec<u32> = results.into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(values, (0..10).collect::<Vec<u32>>());

    assert_eq!(metrics.caller_runs.get(), 8.0);
    assert_eq!(dispatcher.stats().completed_requests, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropped_caller_runs_handles_still_run() {
    let dispatcher = RequestDispatcher::new(dispatcher_config(2, 1, 1, 1), None).unwrap();
    let ran = Arc::new(AtomicUsize::new(0));

    let mut kept = Vec::new();
    let mut dropped = 0;
    for i in 0..6 {
        let ran = ran.clone();
        let handle = dispatcher.submit(
            move || async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                ran.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            },
            format!("job-{}", i),
        );
        if handle.runs_on_caller() {
            dropped += 1;
        } else {
            kept.push(handle);
        }
    }
    assert!(dropped > 0);

    futures::future::join_all(kept).await;
    for _ in 0..100 {
        if dispatcher.stats().completed_requests == 6 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(ran.load(Ordering::SeqCst), 6);
    let stats = dispatcher.stats();
    assert_eq!(stats.total_requests, 6);
    assert_eq!(stats.completed_requests, 6);
    assert_eq!(stats.failed_requests, 0);
    assert_eq!(stats.active_requests, 0);
    assert_eq!(stats.queued_requests, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_caller_runs_work_finishes_after_caller_gives_up() {
    let dispatcher = RequestDispatcher::new(dispatcher_config(4, 1, 1, 1), None).unwrap();
    let ran = Arc::new(AtomicUsize::new(0));

    let mut handles: Vec<_> = (0..3)
        .map(|i| {
            let ran = ran.clone();
            dispatcher.submit(
                move || async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(())
                },
                format!("job-{}", i),
            )
        })
        .collect();

    let on_caller = handles.pop().unwrap();
    assert!(on_caller.runs_on_caller());

    // Started on the caller, then abandoned mid-run.
    let gave_up = tokio::time::timeout(Duration::from_millis(10), on_caller).await;
    assert!(gave_up.is_err());

    futures::future::join_all(handles).await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(ran.load(Ordering::SeqCst), 3);
    let stats = dispatcher.stats();
    assert_eq!(stats.completed_requests, 3);
    assert_eq!(stats.completed_requests + stats.failed_requests, stats.total_requests);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_waiting_request_times_out() {
    let mut config = dispatcher_config(1, 10, 2, 2);
    config.request_timeout_ms = 50;
    let dispatcher = RequestDispatcher::new(config, None).unwrap();

    let slow = dispatcher.submit(
        || async {
            tokio::time::sleep(Duration::from_millis(400)).await;
            Ok::<_, anyhow::Error>(())
        },
        "slow",
    );
    tokio::time::sleep(Duration::from_millis(30)).await;

    let started = Instant::now();
    let starved = dispatcher
        .submit(|| async { Ok::<_, anyhow::Error>(()) }, "starved")
        .await;

    match starved {
        Err(DispatchError::Timeout { request_id, waited }) => {
            assert_eq!(request_id, "starved");
            assert_eq!(waited, Duration::from_millis(50));
        }
        other => panic!("expected timeout, got {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_millis(400));
    assert_eq!(dispatcher.stats().queued_requests, 0);

    assert!(slow.await.is_ok());
    let stats = dispatcher.stats();
    assert_eq!(stats.completed_requests, 1);
    assert_eq!(stats.failed_requests, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_drains_queued_work() {
    let dispatcher = RequestDispatcher::new(dispatcher_config(2, 10, 1, 1), None).unwrap();

    let handles: Vec<_> = (0..5)
        .map(|i| {
            dispatcher.submit(
                move || async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok::<_, anyhow::Error>(i as u32)
                },
                format!("job-{}", i),
            )
        })
        .collect();

    dispatcher.shutdown().await;

    let results = futures::future::join_all(handles).await;
    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(dispatcher.stats().completed_requests, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_forced_shutdown_cancels_stragglers() {
    let mut config = dispatcher_config(2, 10, 1, 1);
    config.shutdown_grace_ms = 50;
    let dispatcher = RequestDispatcher::new(config, None).unwrap();

    let stuck = dispatcher.submit(
        || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, anyhow::Error>(())
        },
        "stuck",
    );
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = Instant::now();
    dispatcher.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(2));

    let result = tokio::time::timeout(Duration::from_secs(1), stuck)
        .await
        .unwrap();
    assert!(matches!(result, Err(DispatchError::Cancelled { .. })));
    assert!(!dispatcher.is_healthy());
}
