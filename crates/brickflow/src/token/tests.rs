use crate::{
    Access, ArbiterConfig, Error, LocalArbiter, ResourceKey, TokenArbiter, TokenRequest,
};
use core::time::Duration;
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn store_reads() -> ResourceKey {
    ResourceKey::read("store")
}

fn arbiter(ceiling: u32) -> LocalArbiter {
    LocalArbiter::new(ArbiterConfig::new().with_ceiling(store_reads(), ceiling))
}

fn request(count: u32) -> TokenRequest {
    TokenRequest::new(store_reads(), count)
}

#[tokio::test]
async fn grants_up_to_the_ceiling_then_queues() {
    let arbiter = arbiter(2);
    let a = arbiter.acquire(&request(1)).await.unwrap();
    let _b = arbiter.acquire(&request(1)).await.unwrap();
    assert_eq!(arbiter.in_use(&store_reads()), 2);

    let waiting = {
        let arbiter = arbiter.clone();
        tokio::spawn(async move { arbiter.acquire(&request(1)).await })
    };
    tokio::task::yield_now().await;
    assert_eq!(arbiter.snapshot().resources[0].queued, 1);
    assert!(!waiting.is_finished());

    assert!(arbiter.release(a).await.unwrap());
    let c = waiting.await.unwrap().unwrap();
    assert_eq!(arbiter.in_use(&store_reads()), 2);
    assert!(arbiter.release_lease(c));
}

#[tokio::test]
async fn duplicate_release_is_a_noop() {
    let arbiter = arbiter(1);
    let lease = arbiter.acquire(&request(1)).await.unwrap();
    assert!(arbiter.release(lease).await.unwrap());
    assert!(!arbiter.release(lease).await.unwrap());
    assert_eq!(arbiter.in_use(&store_reads()), 0);
}

#[tokio::test]
async fn rejects_requests_that_can_never_fit() {
    let arbiter = arbiter(3);
    assert!(matches!(
        arbiter.acquire(&request(0)).await,
        Err(Error::InvalidRequest { .. })
    ));
    assert!(matches!(
        arbiter.acquire(&request(4)).await,
        Err(Error::InvalidRequest { .. })
    ));
    assert!(matches!(
        arbiter
            .acquire(&TokenRequest::new(ResourceKey::write("store"), 1))
            .await,
        Err(Error::UnknownResource(_))
    ));
}

#[tokio::test]
async fn default_ceiling_covers_unknown_resources() {
    let arbiter = LocalArbiter::new(ArbiterConfig::new().with_default_ceiling(2));
    let key = ResourceKey::new("anything", Access::Write);
    let lease = arbiter
        .acquire(&TokenRequest::new(key.clone(), 2))
        .await
        .unwrap();
    assert_eq!(arbiter.in_use(&key), 2);
    assert!(arbiter.release_lease(lease));
}

#[tokio::test(start_paused = true)]
async fn queued_acquire_times_out_as_exhausted() {
    let arbiter = arbiter(1);
    let held = arbiter.acquire(&request(1)).await.unwrap();

    let err = arbiter
        .acquire(&request(1).with_wait(Duration::from_millis(250)))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    match err {
        Error::ResourceExhausted { resource, waited_ms } => {
            assert_eq!(resource, "store:read");
            assert!(waited_ms >= 250);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // the timed-out waiter left the queue
    assert_eq!(arbiter.snapshot().resources[0].queued, 0);
    assert!(arbiter.release_lease(held));
    assert_eq!(arbiter.in_use(&store_reads()), 0);
}

#[tokio::test]
async fn waiters_are_served_in_arrival_order() {
    let arbiter = arbiter(1);
    let first = arbiter.acquire(&request(1)).await.unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut handles = Vec::new();
    for i in 0..8u32 {
        let waiter = arbiter.clone();
        let tx = tx.clone();
        handles.push(tokio::spawn(async move {
            let lease = waiter.acquire(&request(1)).await.unwrap();
            tx.send(i).unwrap();
            waiter.release_lease(lease);
        }));
        // make sure task i is queued before task i + 1 arrives
        while arbiter.snapshot().resources[0].queued < (i + 1) as usize {
            tokio::task::yield_now().await;
        }
    }
    drop(tx);

    arbiter.release_lease(first);
    let mut order = Vec::new();
    while let Some(i) = rx.recv().await {
        order.push(i);
    }
    assert_eq!(order, (0..8).collect::<Vec<_>>());
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn small_request_does_not_overtake_a_large_one() {
    let arbiter = arbiter(3);
    let held = arbiter.acquire(&request(2)).await.unwrap();

    let large = {
        let arbiter = arbiter.clone();
        tokio::spawn(async move { arbiter.acquire(&request(3)).await })
    };
    while arbiter.snapshot().resources[0].queued < 1 {
        tokio::task::yield_now().await;
    }

    // one permit is free, but the queue is not empty
    let small = {
        let arbiter = arbiter.clone();
        tokio::spawn(async move { arbiter.acquire(&request(1)).await })
    };
    while arbiter.snapshot().resources[0].queued < 2 {
        tokio::task::yield_now().await;
    }
    assert_eq!(arbiter.in_use(&store_reads()), 2);

    arbiter.release_lease(held);
    let large = large.await.unwrap().unwrap();
    assert_eq!(arbiter.in_use(&store_reads()), 3);
    assert!(!small.is_finished());

    arbiter.release_lease(large);
    let small = small.await.unwrap().unwrap();
    assert!(arbiter.release_lease(small));
}

#[tokio::test]
async fn dropped_acquire_leaves_the_queue() {
    let arbiter = arbiter(1);
    let held = arbiter.acquire(&request(1)).await.unwrap();

    let cancel = CancellationToken::new();
    let waiter = {
        let arbiter = arbiter.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let req = request(1);
            tokio::select! {
                () = cancel.cancelled() => None,
                lease = arbiter.acquire(&req) => Some(lease),
            }
        })
    };
    while arbiter.snapshot().resources[0].queued < 1 {
        tokio::task::yield_now().await;
    }
    cancel.cancel();
    assert!(waiter.await.unwrap().is_none());
    assert_eq!(arbiter.snapshot().resources[0].queued, 0);

    arbiter.release_lease(held);
    assert_eq!(arbiter.in_use(&store_reads()), 0);
}

#[tokio::test]
async fn lease_guard_releases_on_drop() {
    let arbiter = arbiter(2);
    {
        let _guard = arbiter.lease(&request(2)).await.unwrap();
        assert_eq!(arbiter.in_use(&store_reads()), 2);
    }
    assert_eq!(arbiter.in_use(&store_reads()), 0);

    let guard = arbiter.lease(&request(1)).await.unwrap();
    assert!(guard.release().await.unwrap());
    assert_eq!(arbiter.in_use(&store_reads()), 0);
}

#[tokio::test]
async fn expired_leases_are_reclaimed_and_counted() {
    let arbiter = LocalArbiter::new(
        ArbiterConfig::new()
            .with_ceiling(store_reads(), 1)
            .with_lease_timeout(Duration::from_secs(30)),
    );
    let leaked = arbiter.acquire(&request(1)).await.unwrap();

    let waiting = {
        let arbiter = arbiter.clone();
        tokio::spawn(async move { arbiter.acquire(&request(1)).await })
    };
    while arbiter.snapshot().resources[0].queued < 1 {
        tokio::task::yield_now().await;
    }

    assert!(arbiter.reclaim_expired(Instant::now()).is_empty());
    let reclaimed = arbiter.reclaim_expired(Instant::now() + Duration::from_secs(31));
    assert_eq!(reclaimed, vec![leaked]);
    assert_eq!(arbiter.snapshot().reclaimed, 1);

    // the reclaimed capacity went to the waiter
    let next = waiting.await.unwrap().unwrap();
    assert!(!arbiter.release_lease(leaked));
    assert!(arbiter.release_lease(next));
}

#[tokio::test(start_paused = true)]
async fn reaper_runs_until_cancelled() {
    let arbiter = LocalArbiter::new(
        ArbiterConfig::new()
            .with_ceiling(store_reads(), 1)
            .with_lease_timeout(Duration::from_millis(500)),
    );
    let cancel = CancellationToken::new();
    let reaper = arbiter.spawn_reaper(Duration::from_millis(100), cancel.clone());

    let _leaked = arbiter.acquire(&request(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(750)).await;
    assert_eq!(arbiter.in_use(&store_reads()), 0);
    assert_eq!(arbiter.snapshot().reclaimed, 1);

    cancel.cancel();
    reaper.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn ceiling_holds_under_random_interleavings() {
    const CEILING: u32 = 5;
    let arbiter = arbiter(CEILING);
    let granted = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for seed in 0..64u64 {
        let arbiter = arbiter.clone();
        let granted = Arc::clone(&granted);
        let peak = Arc::clone(&peak);
        handles.push(tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(seed);
            for _ in 0..20 {
                let count = rng.random_range(1..=CEILING);
                let lease = arbiter.acquire(&request(count)).await.unwrap();
                let now = granted.fetch_add(count, Ordering::SeqCst) + count;
                assert!(now <= CEILING, "{now} permits outstanding");
                peak.fetch_max(now, Ordering::SeqCst);
                assert!(arbiter.in_use(&store_reads()) <= CEILING);
                if rng.random_bool(0.5) {
                    tokio::task::yield_now().await;
                }
                granted.fetch_sub(count, Ordering::SeqCst);
                assert!(arbiter.release(lease).await.unwrap());
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(arbiter.in_use(&store_reads()), 0);
    assert!(peak.load(Ordering::SeqCst) <= CEILING);
}

#[tokio::test(start_paused = true)]
async fn ceiling_at_the_integer_limit_does_not_overflow() {
    let arbiter = arbiter(u32::MAX);
    let big = arbiter.acquire(&request(u32::MAX - 1)).await.unwrap();
    let one = arbiter.acquire(&request(1)).await.unwrap();
    assert_eq!(arbiter.in_use(&store_reads()), u32::MAX);

    let err = arbiter
        .acquire(&request(2).with_wait(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ResourceExhausted { .. }), "{err:?}");
    assert_eq!(arbiter.snapshot().resources[0].queued, 0);

    assert!(arbiter.release_lease(one));
    assert!(arbiter.release_lease(big));
    assert_eq!(arbiter.in_use(&store_reads()), 0);
}
