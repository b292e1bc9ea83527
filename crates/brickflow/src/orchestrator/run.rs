use super::pool::{WorkOutcome, WorkerPool};
use crate::{
    Chunk, ChunkFailure, ChunkId, ChunkStatus, ChunkWorker, Error, FinalResult, PartialResult,
    Payload, Result, RunConfig, RunFailure, RunState, RunStatus, Stitcher, TokenArbiter,
    TokenRequest, Tracker, VolumeStore, encode_labels, with_retries,
};
use bytes::Bytes;
use core::time::Duration;
use futures::{StreamExt, stream};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    sync::Arc,
};
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;

const WORKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// Result of a completed run.
#[derive(Clone, Debug)]
pub struct RunReport {
    pub final_result: FinalResult,
    pub partials: BTreeMap<ChunkId, PartialResult>,
    /// Failures tolerated under `max_failed_chunks`.
    pub failed: Vec<ChunkFailure>,
    pub requeues_used: u32,
    /// Store keys written while persisting.
    pub persisted: Vec<String>,
}

/// Drives one run: partition, dispatch, collect, stitch, persist.
///
/// The orchestrator never processes chunks itself; it only hands them to a
/// bounded worker pool and waits for outcomes. The pool size bounds how
/// many chunks are in flight, while the [`TokenArbiter`] separately bounds
/// how many of them talk to the store at once.
pub struct Orchestrator<S, P, A> {
    config: RunConfig,
    store: Arc<S>,
    payload: Arc<P>,
    arbiter: A,
    /// Token of the current or next run.
    cancel: Mutex<CancellationToken>,
    status: watch::Sender<RunStatus>,
}

/// Event the collect loop wakes up for.
enum Wake {
    Cancelled,
    Outcome(Option<WorkOutcome>),
    Deferred,
}

/// Bookkeeping for chunks still to be processed.
struct Backlog {
    ready: VecDeque<Chunk>,
    deferred: Vec<(Instant, Chunk)>,
    requeues: HashMap<ChunkId, u32>,
    failed: Vec<ChunkFailure>,
}

impl Backlog {
    fn pending(&self) -> usize {
        self.ready.len() + self.deferred.len()
    }

    fn promote_due(&mut self, now: Instant) {
        let (due, later): (Vec<_>, Vec<_>) = self.deferred.drain(..).partition(|(at, _)| *at <= now);
        self.deferred = later;
        self.ready.extend(due.into_iter().map(|(_, chunk)| chunk));
    }

    fn next_wake(&self) -> Option<Instant> {
        self.deferred.iter().map(|(at, _)| *at).min()
    }

    fn clear(&mut self) {
        self.ready.clear();
        self.deferred.clear();
    }

    fn requeues_used(&self) -> u32 {
        self.requeues.values().sum()
    }
}

impl<S, P, A> Orchestrator<S, P, A>
where
    S: VolumeStore,
    P: Payload,
    A: TokenArbiter,
{
    pub fn new(config: RunConfig, store: Arc<S>, payload: Arc<P>, arbiter: A) -> Self {
        let (status, _) = watch::channel(RunStatus::default());
        Self {
            config,
            store,
            payload,
            arbiter,
            cancel: Mutex::new(CancellationToken::new()),
            status,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Live progress of the current run.
    pub fn status(&self) -> watch::Receiver<RunStatus> {
        self.status.subscribe()
    }

    /// Token that aborts the current run when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    /// Aborts the current run. In-flight chunks stop at their next
    /// suspension point and release their tokens.
    ///
    /// Only the run in progress is affected; a later [`Self::run`] or
    /// [`Self::resume`] starts with a fresh token.
    pub fn cancel(&self) {
        self.cancel.lock().cancel();
    }

    /// Token for a run about to start, replacing one spent by an earlier
    /// cancelled run.
    fn run_token(&self) -> CancellationToken {
        let mut current = self.cancel.lock();
        if current.is_cancelled() {
            *current = CancellationToken::new();
        }
        current.clone()
    }

    /// Runs every chunk from scratch.
    ///
    /// # Errors
    ///
    /// Returns a [`RunFailure`] carrying every completed partial when the
    /// configuration is invalid, too many chunks fail, the run is cancelled,
    /// or persisting fails.
    pub async fn run(&self) -> core::result::Result<RunReport, RunFailure> {
        self.resume(BTreeMap::new()).await
    }

    /// Re-runs using partials from an earlier attempt.
    ///
    /// Only chunks without a partial are dispatched. Partials are immutable
    /// and keyed by chunk, so resuming with all of them goes straight to
    /// stitching and yields the same result as the original run.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "info", skip_all, fields(resumed = partials.len())))]
    pub async fn resume(
        &self,
        mut partials: BTreeMap<ChunkId, PartialResult>,
    ) -> core::result::Result<RunReport, RunFailure> {
        let tracker = Tracker::start(&self.status);
        let cancel = self.run_token();

        if let Err(cause) = self.config.validate() {
            return Err(tracker.fail(cause, Vec::new(), partials));
        }

        tracker.enter(RunState::Partitioning);
        let chunks = match self.config.partitioner() {
            Ok(partitioner) => partitioner.chunks(),
            Err(cause) => return Err(tracker.fail(cause, Vec::new(), partials)),
        };
        let ids: BTreeSet<ChunkId> = chunks.iter().map(|c| c.id).collect();
        partials.retain(|id, _| ids.contains(id));
        let todo: VecDeque<Chunk> = chunks
            .into_iter()
            .filter(|c| !partials.contains_key(&c.id))
            .collect();
        tracker.update(|s| {
            s.pending = todo.len();
            s.done = partials.len();
        });

        #[cfg(feature = "tracing")]
        tracing::info!(todo = todo.len(), done = partials.len(), "partitioned volume");

        let (failed, requeues_used) = if todo.is_empty() {
            (Vec::new(), 0)
        } else {
            let backlog = Backlog {
                ready: todo,
                deferred: Vec::new(),
                requeues: HashMap::new(),
                failed: Vec::new(),
            };
            match self.collect(backlog, &mut partials, &tracker, &cancel).await {
                Ok(collected) => collected,
                Err((cause, failed)) => return Err(tracker.fail(cause, failed, partials)),
            }
        };

        tracker.enter(RunState::Stitching);
        let mut stitcher = Stitcher::new(self.config.stitch.clone());
        stitcher.stitch_partials(&partials);
        let final_result = match stitcher.finish() {
            Ok(result) => result,
            Err(cause) => return Err(tracker.fail(cause, failed, partials)),
        };

        #[cfg(feature = "tracing")]
        tracing::info!(
            objects = final_result.object_count(),
            labels = final_result.label_count(),
            contacts = stitcher.contact_count(),
            "stitched"
        );

        tracker.enter(RunState::Persisting);
        let persisted = match self.persist(&final_result, &partials, &cancel).await {
            Ok(keys) => keys,
            Err(cause) => return Err(tracker.fail(cause, failed, partials)),
        };

        tracker.enter(RunState::Completed);
        Ok(RunReport {
            final_result,
            partials,
            failed,
            requeues_used,
            persisted,
        })
    }

    /// Dispatches the backlog and gathers outcomes until nothing is left.
    async fn collect(
        &self,
        mut backlog: Backlog,
        partials: &mut BTreeMap<ChunkId, PartialResult>,
        tracker: &Tracker<'_>,
        cancel: &CancellationToken,
    ) -> core::result::Result<(Vec<ChunkFailure>, u32), (Error, Vec<ChunkFailure>)> {
        let worker = ChunkWorker::new(
            Arc::clone(&self.store),
            Arc::clone(&self.payload),
            self.arbiter.clone(),
            self.config.worker_settings(),
        );
        let work_cancel = cancel.child_token();
        let size = self.config.num_workers.min(backlog.pending());
        let mut pool = WorkerPool::spawn(size, &worker, &work_cancel, WORKER_SHUTDOWN_TIMEOUT);
        let requeue_delay = self.config.io_retry();

        let mut cancelled = false;
        let mut doomed = false;
        let mut broken = None;

        loop {
            backlog.promote_due(Instant::now());

            if pool.has_idle() && !backlog.ready.is_empty() {
                tracker.enter(RunState::Dispatching);
            }
            while pool.has_idle() {
                let Some(mut chunk) = backlog.ready.pop_front() else {
                    break;
                };
                if let Err(_e) = chunk.transition(ChunkStatus::Running) {
                    #[cfg(feature = "tracing")]
                    tracing::error!(chunk = %chunk.id, error = %_e, "skipping chunk");
                    tracker.update(|s| s.pending = s.pending.saturating_sub(1));
                    continue;
                }
                if let Err(err) = pool.dispatch(chunk).await {
                    broken = Some(err);
                    break;
                }
                tracker.update(|s| {
                    s.pending -= 1;
                    s.running += 1;
                });
            }
            if broken.is_some() {
                work_cancel.cancel();
                break;
            }
            tracker.enter(RunState::Collecting);

            if pool.in_flight() == 0 && backlog.deferred.is_empty() {
                break;
            }

            let wake_at = backlog.next_wake();
            let wake = tokio::select! {
                biased;
                () = cancel.cancelled(), if !cancelled => Wake::Cancelled,
                outcome = pool.next_outcome(), if pool.in_flight() > 0 => Wake::Outcome(outcome),
                () = tokio::time::sleep_until(wake_at.unwrap_or_else(Instant::now)),
                    if wake_at.is_some() => Wake::Deferred,
            };

            match wake {
                Wake::Deferred => {}
                Wake::Cancelled => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(in_flight = pool.in_flight(), "run cancelled, draining workers");
                    cancelled = true;
                    let dropped = backlog.pending();
                    backlog.clear();
                    tracker.update(|s| s.pending = s.pending.saturating_sub(dropped));
                }
                Wake::Outcome(None) => {
                    broken = Some(Error::ChannelError {
                        context: "worker outcome channel closed".to_owned(),
                    });
                    break;
                }
                Wake::Outcome(Some(WorkOutcome { chunk, result, .. })) => {
                    tracker.update(|s| s.running -= 1);
                    let stopping = cancelled || doomed || cancel.is_cancelled();
                    self.settle(
                        chunk,
                        result,
                        &mut backlog,
                        partials,
                        tracker,
                        &requeue_delay,
                        stopping,
                    );
                    if !doomed && backlog.failed.len() > self.config.max_failed_chunks {
                        doomed = true;
                        if self.config.fail_fast {
                            work_cancel.cancel();
                            let dropped = backlog.pending();
                            backlog.clear();
                            tracker.update(|s| s.pending = s.pending.saturating_sub(dropped));
                        }
                    }
                }
            }
        }

        pool.shutdown().await;

        let failed = core::mem::take(&mut backlog.failed);
        if let Some(err) = broken {
            return Err((err, failed));
        }
        if cancelled {
            return Err((Error::Cancelled, failed));
        }
        if failed.len() > self.config.max_failed_chunks {
            let cause = Error::ChunksFailed {
                failed: failed.len(),
                allowed: self.config.max_failed_chunks,
            };
            return Err((cause, failed));
        }
        Ok((failed, backlog.requeues_used()))
    }

    /// Books one worker outcome: done, requeued, or permanently failed.
    #[allow(clippy::too_many_arguments)]
    fn settle(
        &self,
        mut chunk: Chunk,
        result: Result<PartialResult>,
        backlog: &mut Backlog,
        partials: &mut BTreeMap<ChunkId, PartialResult>,
        tracker: &Tracker<'_>,
        requeue_delay: &crate::RetryPolicy,
        stopping: bool,
    ) {
        match result {
            Ok(partial) => {
                let _ = chunk.transition(ChunkStatus::Done);
                partials.insert(chunk.id, partial);
                tracker.update(|s| s.done += 1);
            }
            Err(Error::Cancelled) if stopping => {
                // aborted, not failed; stays out of both lists
            }
            Err(err) => {
                let used = backlog.requeues.get(&chunk.id).copied().unwrap_or(0);
                if err.is_retryable() && used < self.config.requeue_budget && !stopping {
                    backlog.requeues.insert(chunk.id, used + 1);
                    let _ = chunk.transition(ChunkStatus::Pending);
                    let at = Instant::now() + requeue_delay.delay_for(used);
                    #[cfg(feature = "tracing")]
                    tracing::warn!(chunk = %chunk.id, requeue = used + 1, error = %err, "requeueing chunk");
                    backlog.deferred.push((at, chunk));
                    tracker.update(|s| {
                        s.pending += 1;
                        s.requeues += 1;
                    });
                } else {
                    let _ = chunk.transition(ChunkStatus::Failed);
                    #[cfg(feature = "tracing")]
                    tracing::error!(chunk = %chunk.id, requeues = used, error = %err, "chunk failed permanently");
                    backlog.failed.push(ChunkFailure {
                        chunk: chunk.id,
                        error: err,
                        requeues: used,
                    });
                    tracker.update(|s| s.failed += 1);
                }
            }
        }
    }

    /// Writes every remapped chunk and the label mapping.
    async fn persist(
        &self,
        final_result: &FinalResult,
        partials: &BTreeMap<ChunkId, PartialResult>,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let mut objects: Vec<(String, Bytes)> = partials
            .values()
            .map(|p| {
                let global = final_result.remap_volume(p.chunk, &p.volume);
                (self.config.chunk_key(p.chunk), encode_labels(&global))
            })
            .collect();
        objects.push((self.config.mapping_key(), final_result.encode_mapping()));

        let keys: Vec<String> = objects.iter().map(|(k, _)| k.clone()).collect();
        let mut writes = stream::iter(objects)
            .map(|(key, data)| async move { self.put_object(&key, data, cancel).await })
            .buffer_unordered(self.config.num_workers.max(1));
        while let Some(result) = writes.next().await {
            result?;
        }
        Ok(keys)
    }

    /// One token-gated, retried store write.
    async fn put_object(&self, key: &str, data: Bytes, cancel: &CancellationToken) -> Result<()> {
        let policy = self.config.persist_retry();
        let request = TokenRequest::new(self.config.tokens.write_key(), self.config.tokens.write_count)
            .with_bytes(data.len() as u64);
        with_retries(&policy, cancel, |_| {
            let data = data.clone();
            let request = &request;
            async move {
                let lease = tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(Error::Cancelled),
                    lease = self.arbiter.lease(request) => lease?,
                };
                let result = tokio::select! {
                    biased;
                    () = cancel.cancelled() => Err(Error::Cancelled),
                    result = self.store.put(key, data) => result.map_err(Error::from),
                };
                if let Err(_err) = lease.release().await {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(key, error = %_err, "lease release failed");
                }
                result
            }
        })
        .await
    }
}
