use crate::{LeaseGuard, Result};
use core::{fmt, future::Future, time::Duration};

/// Kind of I/O a token permits. Reads and writes are throttled separately.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Access {
    #[default]
    Read,
    Write,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Access::Read => "read",
            Access::Write => "write",
        })
    }
}

/// A throttled backend resource, e.g. reads against one store.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ResourceKey {
    pub name: String,
    pub access: Access,
}

impl ResourceKey {
    pub fn new(name: impl Into<String>, access: Access) -> Self {
        Self {
            name: name.into(),
            access,
        }
    }

    pub fn read(name: impl Into<String>) -> Self {
        Self::new(name, Access::Read)
    }

    pub fn write(name: impl Into<String>) -> Self {
        Self::new(name, Access::Write)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.access)
    }
}

/// A request for `count` permits on one resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenRequest {
    pub key: ResourceKey,
    pub count: u32,
    /// Size of the transfer the permits cover. Informational only.
    pub bytes: u64,
    /// Overrides the arbiter's default wait before giving up.
    pub wait: Option<Duration>,
}

impl TokenRequest {
    pub const fn new(key: ResourceKey, count: u32) -> Self {
        Self {
            key,
            count,
            bytes: 0,
            wait: None,
        }
    }

    #[must_use]
    pub const fn with_bytes(mut self, bytes: u64) -> Self {
        self.bytes = bytes;
        self
    }

    #[must_use]
    pub const fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = Some(wait);
        self
    }
}

/// Opaque handle to granted permits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LeaseId(pub u64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lease#{}", self.0)
    }
}

/// Grants bounded concurrent permits per resource.
///
/// Implementations must never have more than the configured ceiling of
/// permits outstanding for a resource, must grant in arrival order once
/// capacity is exhausted, and must treat a duplicate release as a no-op.
pub trait TokenArbiter: Clone + Send + Sync + 'static {
    /// Waits until `request.count` permits are available and takes them.
    ///
    /// Dropping the returned future before it resolves gives up the place in
    /// the queue and returns any permits granted in the meantime.
    ///
    /// # Errors
    ///
    /// - [`crate::Error::ResourceExhausted`] if the wait timeout elapses.
    /// - [`crate::Error::UnknownResource`] if no ceiling is configured.
    /// - [`crate::Error::InvalidRequest`] if the request can never fit.
    fn acquire(&self, request: &TokenRequest) -> impl Future<Output = Result<LeaseId>> + Send;

    /// Returns the permits held by `lease`. Returns `Ok(false)` when the
    /// lease was already released or reclaimed.
    fn release(&self, lease: LeaseId) -> impl Future<Output = Result<bool>> + Send;

    /// Fire-and-forget release, usable from `Drop`.
    fn release_detached(&self, lease: LeaseId) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let this = self.clone();
            handle.spawn(async move {
                let _released = this.release(lease).await;
            });
        }
    }

    /// Acquires permits wrapped in a guard that releases them when dropped.
    fn lease(
        &self,
        request: &TokenRequest,
    ) -> impl Future<Output = Result<LeaseGuard<Self>>> + Send {
        async move {
            let id = self.acquire(request).await?;
            Ok(LeaseGuard::new(self.clone(), id))
        }
    }
}
