//! Fleet-wide limiter tests
//!
//! Several `Limits` instances over one constraint store stand in for worker
//! processes sharing a Redis.

mod common;

use common::{test_config, Harness};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fleet_never_exceeds_twenty_in_flight() {
    let h = Harness::new(test_config());
    let fleet: Vec<_> = (0..5).map(|_| h.limits()).collect();
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for i in 0..100 {
        let limits = fleet[i % fleet.len()].clone();
        let in_flight = in_flight.clone();
        let peak = peak.clone();
        handles.push(tokio::spawn(async move {
            let id = format!("req-{i}");
            let granted = limits
                .semaphore
                .wait_for_permit(&id, Duration::from_secs(10), Duration::from_millis(2))
                .await
                .unwrap();
            assert!(granted);

            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);

            limits.semaphore.release(&id).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 20);
    assert_eq!(fleet[0].semaphore.current().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fleet_admits_sixty_per_window() {
    let h = Harness::new(test_config());
    let fleet: Vec<_> = (0..4).map(|_| h.limits()).collect();

    let attempt_all = |n: usize| {
        let fleet = fleet.clone();
        async move {
            let mut handles = Vec::new();
            for i in 0..n {
                let limits = fleet[i % fleet.len()].clone();
                handles.push(tokio::spawn(async move { limits.rate.acquire().await.unwrap() }));
            }
            let mut granted = 0;
            for handle in handles {
                if handle.await.unwrap() {
                    granted += 1;
                }
            }
            granted
        }
    };

    assert_eq!(attempt_all(200).await, 60);
    assert_eq!(fleet[1].rate.usage().await.unwrap().used, 60);

    // Half a window later nothing has aged out
    h.clock.advance(Duration::from_secs(30));
    assert_eq!(attempt_all(10).await, 0);

    // A full window after the burst every slot is free again
    h.clock.advance(Duration::from_secs(30));
    assert_eq!(attempt_all(100).await, 60);
}

#[tokio::test]
async fn test_crashed_holder_slots_expire() {
    let h = Harness::new(test_config());
    let crashed = h.limits();
    for i in 0..20 {
        assert!(crashed.semaphore.acquire(&format!("lost-{i}")).await.unwrap());
    }

    // Another process is locked out while the slots are live
    let survivor = h.limits();
    assert!(!survivor.semaphore.acquire("fresh").await.unwrap());

    // Never released, but gone once the TTL passes
    let ttl = h.config.limits.semaphore_ttl_secs;
    h.clock.advance(Duration::from_secs(ttl + 1));
    assert_eq!(survivor.semaphore.current().await.unwrap(), 0);
    assert!(survivor.semaphore.acquire("fresh").await.unwrap());
}

#[tokio::test]
async fn test_rate_wait_times_out_when_window_full() {
    let mut config = test_config();
    config.limits.requests_per_window = 2;
    let h = Harness::new(config);
    let limits = h.limits();

    assert!(limits.rate.acquire().await.unwrap());
    assert!(limits.rate.acquire().await.unwrap());
    // The manual clock never moves, so the wait can only time out
    let granted = limits
        .rate
        .wait_for_slot(Duration::from_millis(30))
        .await
        .unwrap();
    assert!(!granted);
}

#[tokio::test]
async fn test_breaker_is_shared_across_processes() {
    let h = Harness::new(test_config());
    let a = h.limits();
    let b = h.limits();

    for _ in 0..3 {
        a.breaker.record_failure().await.unwrap();
    }
    for _ in 0..2 {
        b.breaker.record_failure().await.unwrap();
    }

    assert!(a.breaker.is_open().await.unwrap());
    assert!(b.breaker.is_open().await.unwrap());
}
