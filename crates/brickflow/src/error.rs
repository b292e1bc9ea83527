//! Error taxonomy shared by every stage of a run.
//!
//! Per-chunk failures are contained at the worker boundary and reported to
//! the orchestrator as a chunk outcome, so every variant is `Clone` and can
//! be stored alongside the chunk that produced it.

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// All errors that `brickflow` can produce.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Retryable I/O failure: timeout, connection reset, store overload.
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// The payload reported a failure on valid input. Never retried.
    #[error("payload error: {0}")]
    Payload(String),

    /// A token could not be granted within the wait timeout.
    ///
    /// Treated as transient: the chunk is requeued with backoff.
    #[error("resource `{resource}` exhausted after waiting {waited_ms} ms")]
    ResourceExhausted { resource: String, waited_ms: u64 },

    /// Invalid run or partition parameters. Fails a run before dispatch.
    #[error("configuration error: {0}")]
    Config(String),

    /// Cooperative abort requested by the orchestrator.
    #[error("operation cancelled")]
    Cancelled,

    /// Non-retryable store failure (missing object, out-of-range read).
    #[error("store error: {0}")]
    Store(String),

    /// A block of bytes does not match the bounds it claims to cover.
    #[error("codec error: expected {expected} bytes, got {actual}")]
    Codec { expected: usize, actual: usize },

    /// The token service has no ceiling configured for the resource.
    #[error("unknown resource `{0}`")]
    UnknownResource(String),

    /// A request can never be satisfied (zero count, count above ceiling).
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// More chunks failed permanently than the run tolerates.
    #[error("{failed} chunks failed permanently, at most {allowed} allowed")]
    ChunksFailed { failed: usize, allowed: usize },

    /// Internal channel failure between orchestrator and worker tasks.
    #[error("channel error: {context}")]
    ChannelError { context: String },
}

impl Error {
    /// Whether the operation that produced this error may be attempted again.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientIo(_) | Self::ResourceExhausted { .. })
    }

    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::Config(reason.into())
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }
}
