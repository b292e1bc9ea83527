use crate::{
    Chunk, Error, PartialResult, Payload, ResourceKey, Result, RetryPolicy, TokenArbiter,
    TokenRequest, VolumeStore, LABEL_WIDTH, with_retries,
};
use bytes::Bytes;
use core::time::Duration;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Knobs of a [`ChunkWorker`].
#[derive(Clone, Debug)]
pub struct WorkerSettings {
    /// Resource gating every fetch.
    pub read: ResourceKey,
    /// Permits held per fetch.
    pub read_count: u32,
    pub retry: RetryPolicy,
    /// Upper bound on one fetch. `None` waits forever.
    pub io_timeout: Option<Duration>,
    pub background: u64,
    /// Thickness of the per-face core layer kept for stitching.
    pub slab_depth: i64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            read: ResourceKey::read("volume-store"),
            read_count: 1,
            retry: RetryPolicy::default(),
            io_timeout: None,
            background: 0,
            slab_depth: 1,
        }
    }
}

/// Processes one chunk end to end: token, fetch, payload, summary.
///
/// Tokens are only held around the fetch; the payload runs on the blocking
/// pool without any permits.
pub struct ChunkWorker<S, P, A> {
    store: Arc<S>,
    payload: Arc<P>,
    arbiter: A,
    settings: Arc<WorkerSettings>,
}

impl<S, P, A: Clone> Clone for ChunkWorker<S, P, A> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            payload: Arc::clone(&self.payload),
            arbiter: self.arbiter.clone(),
            settings: Arc::clone(&self.settings),
        }
    }
}

impl<S, P, A> ChunkWorker<S, P, A>
where
    S: VolumeStore,
    P: Payload,
    A: TokenArbiter,
{
    pub fn new(store: Arc<S>, payload: Arc<P>, arbiter: A, settings: WorkerSettings) -> Self {
        Self {
            store,
            payload,
            arbiter,
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Runs the chunk to a [`PartialResult`].
    ///
    /// # Errors
    ///
    /// - [`Error::TransientIo`] / [`Error::ResourceExhausted`] once the I/O
    ///   retries are spent.
    /// - [`Error::Payload`] if the payload fails, panics, or returns labels
    ///   for the wrong bounds.
    /// - [`Error::Cancelled`] if `cancel` fires at any suspension point.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(chunk = %chunk.id)))]
    pub async fn process(&self, chunk: &Chunk, cancel: &CancellationToken) -> Result<PartialResult> {
        let data = with_retries(&self.settings.retry, cancel, |attempt| {
            self.fetch_once(chunk, cancel, attempt)
        })
        .await?;

        let payload = Arc::clone(&self.payload);
        let bounds = chunk.bounds;
        let handle = tokio::task::spawn_blocking(move || payload.process(&data, &bounds));
        let joined = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            joined = handle => joined,
        };
        let labels = match joined {
            Ok(result) => result?,
            Err(err) if err.is_panic() => {
                return Err(Error::Payload(format!("payload panicked on chunk {}", chunk.id)));
            }
            Err(_) => return Err(Error::Cancelled),
        };

        if labels.bounds() != &chunk.bounds {
            return Err(Error::Payload(format!(
                "payload returned labels for {}, expected {}",
                labels.bounds(),
                chunk.bounds
            )));
        }

        Ok(PartialResult::from_labels(
            chunk,
            &labels,
            self.settings.background,
            self.settings.slab_depth,
        ))
    }

    /// One token-gated fetch attempt. The lease is returned on every path.
    async fn fetch_once(&self, chunk: &Chunk, cancel: &CancellationToken, attempt: u32) -> Result<Bytes> {
        let request = TokenRequest::new(self.settings.read.clone(), self.settings.read_count)
            .with_bytes((chunk.bounds.voxel_count() * LABEL_WIDTH) as u64);

        let lease = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            lease = self.arbiter.lease(&request) => lease?,
        };

        #[cfg(feature = "tracing")]
        tracing::trace!(chunk = %chunk.id, attempt, lease = ?lease.id(), "fetching");
        #[cfg(not(feature = "tracing"))]
        let _ = attempt;

        let fetch = async {
            let read = self.store.fetch(&chunk.bounds);
            match self.settings.io_timeout {
                Some(limit) => match tokio::time::timeout(limit, read).await {
                    Ok(result) => result.map_err(Error::from),
                    Err(_) => Err(Error::TransientIo(format!(
                        "fetch of chunk {} timed out after {limit:?}",
                        chunk.id
                    ))),
                },
                None => read.await.map_err(Error::from),
            }
        };
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            result = fetch => result,
        };

        if let Err(_err) = lease.release().await {
            // the service reclaims it by timeout
            #[cfg(feature = "tracing")]
            tracing::warn!(chunk = %chunk.id, error = %_err, "lease release failed");
        }
        result
    }
}
