use crate::{
    ArbiterConfig, ChunkId, ConnectedComponents, ContactRule, Error, IdentityLabels,
    InMemoryStore, LabelVolume, LocalArbiter, Orchestrator, PartialResult, Payload, PayloadError,
    RunConfig, RunState, StoreError, VolumeBounds, VolumeStore, decode_labels,
};
use bytes::Bytes;
use core::{future::Future, time::Duration};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

/// In-memory store with scripted failures and concurrency accounting.
#[derive(Default)]
struct TestStore {
    inner: Option<InMemoryStore>,
    /// Remaining transient fetch failures per chunk bounds.
    flaky_fetch: Mutex<HashMap<VolumeBounds, u32>>,
    /// Remaining transient put failures.
    flaky_put: AtomicU32,
    broken_put: bool,
    stall: bool,
    fetch_delay: Option<Duration>,
    fetches: AtomicU32,
    puts: AtomicU32,
    active: AtomicU32,
    peak: AtomicU32,
}

impl TestStore {
    fn new(source: LabelVolume) -> Self {
        Self {
            inner: Some(InMemoryStore::new(source)),
            ..Self::default()
        }
    }

    fn fail_fetch(self, bounds: VolumeBounds, times: u32) -> Self {
        self.flaky_fetch.lock().insert(bounds, times);
        self
    }

    fn objects(&self) -> Vec<String> {
        self.inner.as_ref().map(InMemoryStore::keys).unwrap_or_default()
    }

    fn object(&self, key: &str) -> Option<Bytes> {
        self.inner.as_ref().and_then(|s| s.get(key))
    }

    async fn do_fetch(&self, bounds: VolumeBounds) -> Result<Bytes, StoreError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let result = async {
            if self.stall {
                core::future::pending::<()>().await;
            }
            if let Some(delay) = self.fetch_delay {
                tokio::time::sleep(delay).await;
            }
            {
                let mut flaky = self.flaky_fetch.lock();
                if let Some(left) = flaky.get_mut(&bounds) {
                    if *left > 0 {
                        *left -= 1;
                        return Err(StoreError::Transient(format!("reset reading {bounds}")));
                    }
                }
            }
            match &self.inner {
                Some(store) => store.fetch(&bounds).await,
                None => Err(StoreError::Permanent("no data".into())),
            }
        }
        .await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl VolumeStore for TestStore {
    fn fetch(&self, bounds: &VolumeBounds) -> impl Future<Output = Result<Bytes, StoreError>> + Send {
        self.do_fetch(*bounds)
    }

    fn put(&self, key: &str, data: Bytes) -> impl Future<Output = Result<(), StoreError>> + Send {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let result = if self.broken_put {
            Err(StoreError::Permanent("bucket is read-only".into()))
        } else if self
            .flaky_put
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            Err(StoreError::Transient("throttled".into()))
        } else {
            match &self.inner {
                Some(store) => {
                    // InMemoryStore::put completes synchronously
                    drop(store.put(key, data));
                    Ok(())
                }
                None => Ok(()),
            }
        };
        core::future::ready(result)
    }
}

fn bounds(min: [i64; 3], max: [i64; 3]) -> VolumeBounds {
    VolumeBounds::new(min, max).unwrap()
}

fn arbiter(ceiling: u32) -> LocalArbiter {
    LocalArbiter::new(ArbiterConfig::new().with_default_ceiling(ceiling))
}

fn config(volume: VolumeBounds, edge: [i64; 3]) -> RunConfig {
    let mut c = RunConfig::new(volume);
    c.chunk_shape = edge;
    c.num_workers = 4;
    c.io.backoff_base_ms = 1;
    c.io.backoff_max_ms = 5;
    c.io.jitter = 0.0;
    c
}

/// Two separate objects; the ring spans every chunk of a 2x2 grid.
fn ring_and_dot() -> LabelVolume {
    LabelVolume::from_fn(bounds([0, 0, 0], [2, 12, 12]), |[_, y, x]| {
        let ring = (2..10).contains(&y) && (2..10).contains(&x) && !((4..8).contains(&y) && (4..8).contains(&x));
        if ring {
            1
        } else if y == 0 && x == 11 {
            1
        } else {
            0
        }
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn end_to_end_connected_components() {
    let truth = ring_and_dot();
    let store = Arc::new(TestStore::new(truth.clone()));
    let mut c = config(*truth.bounds(), [2, 6, 6]);
    c.halo = 1;
    c.stitch.rule = ContactRule::HaloOverlap;
    let orchestrator = Orchestrator::new(c.clone(), store.clone(), Arc::new(ConnectedComponents::new(0)), arbiter(2));
    let status = orchestrator.status();

    let report = orchestrator.run().await.unwrap();
    assert_eq!(report.partials.len(), 4);
    assert_eq!(report.final_result.object_count(), 2);
    assert!(report.failed.is_empty());
    assert_eq!(status.borrow().state, RunState::Completed);
    assert_eq!(status.borrow().done, 4);

    // every chunk plus the mapping was written
    let mut expected: Vec<String> = report.partials.keys().map(|id| c.chunk_key(*id)).collect();
    expected.push(c.mapping_key());
    expected.sort();
    assert_eq!(store.objects(), expected);

    // the ring carries one global id everywhere, the dot another
    let mut ids = BTreeMap::new();
    for id in report.partials.keys() {
        let chunk = c.partitioner().unwrap().chunk(*id).unwrap();
        let data = store.object(&c.chunk_key(*id)).unwrap();
        let global = decode_labels(&data, chunk.core).unwrap();
        for (p, label) in global.iter() {
            let object = truth.get(p).unwrap();
            if object == 0 {
                assert_eq!(label, 0);
            } else {
                let is_dot = p[1] == 0 && p[2] == 11;
                assert_eq!(*ids.entry(is_dot).or_insert(label), label, "at {p:?}");
            }
        }
    }
    assert_eq!(ids.len(), 2);
    assert_ne!(ids[&true], ids[&false]);
}

#[tokio::test(start_paused = true)]
async fn chunk_recovers_after_two_transient_failures() {
    let volume = bounds([0, 0, 0], [1, 4, 4]);
    let flaky = bounds([0, 0, 2], [1, 2, 4]);
    let store = Arc::new(TestStore::new(LabelVolume::filled(volume, 1)).fail_fetch(flaky, 2));
    let mut c = config(volume, [1, 2, 2]);
    c.io.retries = 3;
    let orchestrator = Orchestrator::new(c, store.clone(), Arc::new(IdentityLabels), arbiter(4));

    let report = orchestrator.run().await.unwrap();
    assert_eq!(report.partials.len(), 4);
    assert_eq!(report.requeues_used, 0);
    assert_eq!(store.fetches.load(Ordering::SeqCst), 4 + 2);
    assert_eq!(report.final_result.object_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn worker_give_up_is_requeued_by_the_run() {
    let volume = bounds([0, 0, 0], [1, 2, 4]);
    let flaky = bounds([0, 0, 0], [1, 2, 2]);
    let store = Arc::new(TestStore::new(LabelVolume::filled(volume, 1)).fail_fetch(flaky, 3));
    let mut c = config(volume, [1, 2, 2]);
    c.io.retries = 1; // two attempts per dispatch
    c.requeue_budget = 2;
    let orchestrator = Orchestrator::new(c, store.clone(), Arc::new(IdentityLabels), arbiter(4));

    let report = orchestrator.run().await.unwrap();
    assert_eq!(report.requeues_used, 1);
    assert_eq!(orchestrator.status().borrow().requeues, 1);
    assert_eq!(report.partials.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn one_failing_chunk_out_of_fifty_fails_the_run() {
    let volume = bounds([0, 0, 0], [1, 5, 10]);
    let bad = bounds([0, 3, 7], [1, 4, 8]);
    let store = Arc::new(TestStore::new(LabelVolume::filled(volume, 1)).fail_fetch(bad, u32::MAX));
    let mut c = config(volume, [1, 1, 1]);
    c.io.retries = 2;
    c.requeue_budget = 1;
    let orchestrator = Orchestrator::new(c.clone(), store.clone(), Arc::new(IdentityLabels), arbiter(3));

    let failure = orchestrator.run().await.unwrap_err();
    assert_eq!(failure.failed_ids(), vec![ChunkId::new(0, 3, 7)]);
    assert_eq!(failure.failed_chunks[0].requeues, 1);
    assert!(matches!(failure.failed_chunks[0].error, Error::TransientIo(_)));
    assert_eq!(
        failure.cause,
        Error::ChunksFailed {
            failed: 1,
            allowed: 0
        }
    );
    assert_eq!(failure.failed_at, RunState::Collecting);
    assert_eq!(failure.partials.len(), 49);
    assert!(!failure.partials.contains_key(&ChunkId::new(0, 3, 7)));

    let status = orchestrator.status().borrow().clone();
    assert_eq!(status.state, RunState::Failed);
    assert_eq!((status.done, status.failed, status.pending, status.running), (49, 1, 0, 0));
    assert!(store.objects().is_empty(), "nothing persisted on failure");

    // fix the store and resume: only the failed chunk is fetched again
    store.flaky_fetch.lock().clear();
    let before = store.fetches.load(Ordering::SeqCst);
    let report = orchestrator.resume(failure.partials).await.unwrap();
    assert_eq!(store.fetches.load(Ordering::SeqCst), before + 1);
    assert_eq!(report.partials.len(), 50);
    assert_eq!(report.final_result.object_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn tolerated_failures_do_not_fail_the_run() {
    let volume = bounds([0, 0, 0], [1, 2, 2]);
    let bad = bounds([0, 0, 0], [1, 1, 1]);
    let store = Arc::new(TestStore::new(LabelVolume::filled(volume, 1)).fail_fetch(bad, u32::MAX));
    let mut c = config(volume, [1, 1, 1]);
    c.io.retries = 0;
    c.requeue_budget = 0;
    c.max_failed_chunks = 1;
    let orchestrator = Orchestrator::new(c, store, Arc::new(IdentityLabels), arbiter(2));

    let report = orchestrator.run().await.unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.partials.len(), 3);
    assert_eq!(report.final_result.object_count(), 1);
}

#[tokio::test]
async fn payload_errors_fail_without_requeue() {
    let volume = bounds([0, 0, 0], [1, 2, 2]);
    let store = Arc::new(TestStore::new(LabelVolume::filled(volume, 1)));
    let payload = |data: &[u8], b: &VolumeBounds| -> Result<LabelVolume, PayloadError> {
        if b.min() == [0, 0, 0] {
            Err(PayloadError::new("diverged"))
        } else {
            IdentityLabels.process(data, b)
        }
    };
    let orchestrator = Orchestrator::new(config(volume, [1, 1, 1]), store.clone(), Arc::new(payload), arbiter(2));

    let failure = orchestrator.run().await.unwrap_err();
    assert_eq!(failure.failed_chunks.len(), 1);
    assert_eq!(failure.failed_chunks[0].requeues, 0);
    assert_eq!(failure.failed_chunks[0].error, Error::Payload("diverged".into()));
    assert_eq!(store.fetches.load(Ordering::SeqCst), 4);
    assert_eq!(failure.partials.len(), 3);
}

#[tokio::test]
async fn invalid_config_fails_before_dispatch() {
    let volume = bounds([0, 0, 0], [4, 4, 4]);
    let store = Arc::new(TestStore::new(LabelVolume::filled(volume, 1)));
    let mut c = config(volume, [2, 0, 2]);
    c.num_workers = 2;
    let orchestrator = Orchestrator::new(c, store.clone(), Arc::new(IdentityLabels), arbiter(2));

    let failure = orchestrator.run().await.unwrap_err();
    assert!(matches!(failure.cause, Error::Config(_)));
    assert_eq!(failure.failed_at, RunState::Initializing);
    assert_eq!(store.fetches.load(Ordering::SeqCst), 0);
    assert_eq!(orchestrator.status().borrow().state, RunState::Failed);
}

#[tokio::test(start_paused = true)]
async fn persist_is_retried_on_transient_failure() {
    let volume = bounds([0, 0, 0], [1, 2, 2]);
    let store = TestStore::new(LabelVolume::filled(volume, 1));
    store.flaky_put.store(2, Ordering::SeqCst);
    let store = Arc::new(store);
    let c = config(volume, [1, 2, 2]);
    let orchestrator = Orchestrator::new(c, store.clone(), Arc::new(IdentityLabels), arbiter(2));

    let report = orchestrator.run().await.unwrap();
    assert_eq!(report.persisted.len(), 2);
    assert_eq!(store.puts.load(Ordering::SeqCst), 2 + 2);
    assert_eq!(store.objects().len(), 2);
}

#[tokio::test]
async fn persist_failure_keeps_partials_for_resume() {
    let volume = bounds([0, 0, 0], [1, 4, 4]);
    let source = LabelVolume::filled(volume, 1);
    let broken = Arc::new(TestStore {
        broken_put: true,
        ..TestStore::new(source.clone())
    });
    let c = config(volume, [1, 2, 2]);
    let orchestrator = Orchestrator::new(c.clone(), broken, Arc::new(IdentityLabels), arbiter(2));

    let failure = orchestrator.run().await.unwrap_err();
    assert_eq!(failure.failed_at, RunState::Persisting);
    assert!(matches!(failure.cause, Error::Store(_)));
    assert_eq!(failure.partials.len(), 4);

    let healthy = Arc::new(TestStore::new(source));
    let retry = Orchestrator::new(c, healthy.clone(), Arc::new(IdentityLabels), arbiter(2));
    let report = retry.resume(failure.partials.clone()).await.unwrap();
    assert_eq!(healthy.fetches.load(Ordering::SeqCst), 0);
    assert_eq!(report.partials, failure.partials);
    assert_eq!(report.final_result.object_count(), 1);
    assert_eq!(healthy.objects().len(), 5);
}

#[tokio::test]
async fn resuming_twice_gives_the_same_result() {
    let truth = ring_and_dot();
    let store = Arc::new(TestStore::new(truth.clone()));
    let c = config(*truth.bounds(), [2, 4, 4]);
    let orchestrator = Orchestrator::new(c, store, Arc::new(ConnectedComponents::new(0)), arbiter(3));

    let first = orchestrator.run().await.unwrap();
    let partials: BTreeMap<ChunkId, PartialResult> = first.partials.clone();
    let again = orchestrator.resume(partials.clone()).await.unwrap();
    let third = orchestrator.resume(partials).await.unwrap();
    assert_eq!(first.final_result, again.final_result);
    assert_eq!(again.final_result, third.final_result);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_stops_the_run_and_releases_tokens() {
    let volume = bounds([0, 0, 0], [1, 4, 4]);
    let store = Arc::new(TestStore {
        stall: true,
        ..TestStore::new(LabelVolume::filled(volume, 1))
    });
    let arbiter = arbiter(2);
    let orchestrator = Arc::new(Orchestrator::new(
        config(volume, [1, 1, 1]),
        store.clone(),
        Arc::new(IdentityLabels),
        arbiter.clone(),
    ));

    let run = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.run().await })
    };
    while store.active.load(Ordering::SeqCst) < 2 {
        tokio::task::yield_now().await;
    }
    orchestrator.cancel();

    let failure = run.await.unwrap().unwrap_err();
    assert_eq!(failure.cause, Error::Cancelled);
    assert!(failure.failed_chunks.is_empty());
    assert_eq!(arbiter.snapshot().outstanding_leases, 0);
    assert_eq!(orchestrator.status().borrow().state, RunState::Failed);
}

#[tokio::test]
async fn cancelled_orchestrator_can_run_again() {
    let truth = ring_and_dot();
    let store = Arc::new(TestStore::new(truth.clone()));
    let c = config(*truth.bounds(), [2, 6, 6]);
    let orchestrator = Orchestrator::new(c, store, Arc::new(ConnectedComponents::new(0)), arbiter(2));

    let first = orchestrator.run().await.unwrap();
    let stale = orchestrator.cancel_token();
    orchestrator.cancel();
    assert!(stale.is_cancelled());

    let again = orchestrator.resume(first.partials.clone()).await.unwrap();
    assert_eq!(again.final_result, first.final_result);
    assert!(!orchestrator.cancel_token().is_cancelled());
    assert_eq!(orchestrator.status().borrow().state, RunState::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn token_ceiling_bounds_store_concurrency() {
    let volume = bounds([0, 0, 0], [1, 8, 8]);
    let store = Arc::new(TestStore {
        fetch_delay: Some(Duration::from_millis(5)),
        ..TestStore::new(LabelVolume::filled(volume, 1))
    });
    let mut c = config(volume, [1, 2, 2]);
    c.num_workers = 8;
    let orchestrator = Orchestrator::new(c, store.clone(), Arc::new(IdentityLabels), arbiter(3));

    let report = orchestrator.run().await.unwrap();
    assert_eq!(report.partials.len(), 16);
    let peak = store.peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak store concurrency {peak}");
    assert!(peak >= 1);
}
