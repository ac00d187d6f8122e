//! Concurrent callers racing every limiter kind.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::Rng;
use turnstile::ratelimit::{
    ConcurrencyOptions, FixedWindowOptions, Limiter, LimiterRegistry, ManualClock, Outcome,
    Policy, SlidingWindowOptions, TokenBucketOptions,
};
use turnstile::TurnstileConfig;

const THREADS: usize = 8;
const ATTEMPTS_PER_THREAD: usize = 500;

/// Race `THREADS` threads against a limiter on a frozen clock and count
/// admissions.
fn race(limiter: Arc<dyn Limiter>) -> u32 {
    let admitted = AtomicU32::new(0);
    thread::scope(|scope| {
        for _ in 0..THREADS {
            let limiter = limiter.clone();
            let admitted = &admitted;
            scope.spawn(move || {
                for _ in 0..ATTEMPTS_PER_THREAD {
                    if limiter.try_acquire(1).unwrap().is_admitted() {
                        admitted.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    });
    admitted.into_inner()
}

fn build(policy: Policy, clock: &Arc<ManualClock>) -> Arc<dyn Limiter> {
    policy.build(clock.clone()).unwrap()
}

#[test]
fn test_fixed_window_ceiling_under_contention() {
    let clock = Arc::new(ManualClock::new());
    let limiter = build(FixedWindowOptions::new(100, Duration::from_secs(1)).into(), &clock);

    assert_eq!(race(limiter.clone()), 100);

    clock.advance(Duration::from_secs(1));
    assert_eq!(race(limiter), 100);
}

#[test]
fn test_sliding_window_ceiling_under_contention() {
    let clock = Arc::new(ManualClock::new());
    let limiter = build(
        SlidingWindowOptions::new(100, Duration::from_secs(10), 5).into(),
        &clock,
    );

    assert_eq!(race(limiter.clone()), 100);

    // Everything was admitted in the first segment, which is still fully
    // inside the trailing window
    clock.advance(Duration::from_secs(9));
    assert_eq!(race(limiter), 0);
}

#[test]
fn test_token_bucket_ceiling_under_contention() {
    let clock = Arc::new(ManualClock::new());
    let limiter = build(
        TokenBucketOptions::new(100, 10, Duration::from_secs(1)).into(),
        &clock,
    );

    assert_eq!(race(limiter.clone()), 100);

    clock.advance(Duration::from_secs(2));
    assert_eq!(race(limiter), 20);
}

#[test]
fn test_concurrency_try_acquire_ceiling_under_contention() {
    let clock = Arc::new(ManualClock::new());
    let limiter = build(ConcurrencyOptions::new(10, 0).into(), &clock);

    let held = std::sync::Mutex::new(Vec::new());
    thread::scope(|scope| {
        for _ in 0..THREADS {
            let limiter = limiter.clone();
            let held = &held;
            scope.spawn(move || {
                for _ in 0..ATTEMPTS_PER_THREAD {
                    if let Outcome::Admitted(permit) = limiter.try_acquire(1).unwrap() {
                        held.lock().unwrap().push(permit);
                    }
                }
            });
        }
    });

    let held = held.into_inner().unwrap();
    assert_eq!(held.len(), 10);
    assert_eq!(limiter.statistics().available_permits, 0);

    drop(held);
    assert_eq!(limiter.statistics().available_permits, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrency_in_flight_never_exceeds_limit() {
    let clock = Arc::new(ManualClock::new());
    let limiter = build(ConcurrencyOptions::new(4, 1000).into(), &clock);

    let in_flight = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));

    let mut tasks = Vec::new();
    for _ in 0..200 {
        let limiter = limiter.clone();
        let in_flight = in_flight.clone();
        let peak = peak.clone();
        tasks.push(tokio::spawn(async move {
            let outcome = limiter.acquire(1, None).await.unwrap();
            let permit = outcome.into_permit().expect("queue is large enough for everyone");

            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);

            let spins = rand::thread_rng().gen_range(0..4);
            for _ in 0..spins {
                tokio::task::yield_now().await;
            }

            in_flight.fetch_sub(1, Ordering::SeqCst);
            limiter.release(permit).unwrap();
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 4);
    let stats = limiter.statistics();
    assert_eq!(stats.available_permits, 4);
    assert_eq!(stats.queued_permits, 0);
    assert_eq!(stats.total_successful_leases, 200);
}

#[tokio::test]
async fn test_policy_file_end_to_end() {
    let yaml = r#"
policies:
  fixed:
    kind: fixed
    permit_limit: 4
    window: 12s
  sliding:
    kind: sliding
    permit_limit: 20
    window: 120s
    segments_per_window: 4
  token:
    kind: token
    token_limit: 15
    tokens_per_period: 1
    replenishment_period: 1s
  concurrency:
    kind: concurrency
    permit_limit: 5
    queue_limit: 10
"#;
    let config = TurnstileConfig::from_yaml(yaml).unwrap();
    let clock = Arc::new(ManualClock::new());
    let registry = LimiterRegistry::from_config(&config, clock.clone()).unwrap();

    for name in registry.names() {
        let stats = registry.statistics(&name).unwrap();
        assert!(stats.available_permits > 0, "{} starts empty", name);
    }

    for _ in 0..4 {
        assert!(registry.try_acquire("fixed", 1).unwrap().is_admitted());
    }
    let rejected = registry.try_acquire("fixed", 1).unwrap();
    assert_eq!(rejected.retry_after_secs(), Some(12));

    for _ in 0..15 {
        assert!(registry.try_acquire("token", 1).unwrap().is_admitted());
    }
    assert!(registry.try_acquire("token", 1).unwrap().is_rejected());
    clock.advance(Duration::from_secs(1));
    assert!(registry.try_acquire("token", 1).unwrap().is_admitted());

    let permit = registry
        .acquire("concurrency", 1, Some(Duration::from_secs(1)))
        .await
        .unwrap()
        .into_permit()
        .unwrap();
    assert!(permit.is_lease());
    registry.release("concurrency", permit).unwrap();
}
