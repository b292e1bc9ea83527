//! Client side of the token service.
//!
//! [`RemoteArbiter`] speaks to a `brickflow-resource-server` and enforces
//! ceilings across every process that shares it. [`ResourceArbiter`] picks
//! between it and a process-local [`LocalArbiter`], falling back to the
//! latter when no service is configured or the configured one is
//! unreachable. In that degraded mode the ceiling only holds per process.

use crate::{
    Error,
    proto::{self, resource_manager_client::ResourceManagerClient},
};
use brickflow::{ArbiterConfig, ArbiterSnapshot, LeaseId, LocalArbiter, TokenArbiter, TokenRequest};
use core::{future::Future, time::Duration};
use tokio::time::Instant;
use tonic::transport::{Channel, Endpoint};

/// Time allowed to establish the connection before falling back.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Extra deadline on top of the requested wait, covering the round trip.
const RPC_SLACK: Duration = Duration::from_secs(2);

/// [`TokenArbiter`] backed by the remote token service.
#[derive(Clone, Debug)]
pub struct RemoteArbiter {
    client: ResourceManagerClient<Channel>,
}

impl RemoteArbiter {
    pub fn new(channel: Channel) -> Self {
        Self {
            client: ResourceManagerClient::new(channel),
        }
    }

    /// Connects to `addr`, e.g. `http://10.0.0.5:50051`.
    ///
    /// # Errors
    ///
    /// [`Error::Transport`] if the address is malformed or the service does
    /// not answer within [`CONNECT_TIMEOUT`].
    pub async fn connect(addr: impl Into<String>) -> Result<Self, Error> {
        let channel = Endpoint::from_shared(addr.into())?
            .connect_timeout(CONNECT_TIMEOUT)
            .connect()
            .await?;
        Ok(Self::new(channel))
    }

    /// Usage per resource as seen by the service.
    pub async fn snapshot(&self) -> Result<ArbiterSnapshot, Error> {
        let response = self
            .client
            .clone()
            .snapshot(proto::SnapshotRequest {})
            .await?;
        ArbiterSnapshot::try_from(response.into_inner())
    }

    async fn acquire_remote(&self, request: &TokenRequest) -> brickflow::Result<LeaseId> {
        let started = Instant::now();
        let mut call = tonic::Request::new(proto::AcquireRequest::from(request));
        if let Some(wait) = request.wait {
            call.set_timeout(wait + RPC_SLACK);
        }

        let response = self
            .client
            .clone()
            .acquire(call)
            .await
            .map_err(|status| brickflow::Error::from(Error::from(status)))?
            .into_inner();

        if response.granted {
            #[cfg(feature = "tracing")]
            tracing::trace!(key = %request.key, lease = response.lease_id, "remote lease granted");
            Ok(LeaseId(response.lease_id))
        } else {
            Err(brickflow::Error::ResourceExhausted {
                resource: request.key.to_string(),
                waited_ms: response
                    .waited_ms
                    .max(started.elapsed().as_millis() as u64),
            })
        }
    }

    async fn release_remote(&self, lease: LeaseId) -> brickflow::Result<bool> {
        let response = self
            .client
            .clone()
            .release(proto::ReleaseRequest { lease_id: lease.0 })
            .await
            .map_err(|status| brickflow::Error::from(Error::from(status)))?;
        Ok(response.into_inner().released)
    }
}

impl TokenArbiter for RemoteArbiter {
    fn acquire(
        &self,
        request: &TokenRequest,
    ) -> impl Future<Output = brickflow::Result<LeaseId>> + Send {
        self.acquire_remote(request)
    }

    fn release(&self, lease: LeaseId) -> impl Future<Output = brickflow::Result<bool>> + Send {
        self.release_remote(lease)
    }
}

/// The arbiter a worker process actually uses.
#[derive(Clone, Debug)]
pub enum ResourceArbiter {
    Remote(RemoteArbiter),
    /// Process-local ceiling only.
    Local(LocalArbiter),
}

impl ResourceArbiter {
    /// Connects to the token service at `addr`.
    ///
    /// An empty address selects the local arbiter directly. A malformed or
    /// unreachable address logs a warning and degrades to the local arbiter
    /// built from `fallback`; it never fails.
    pub async fn connect(addr: &str, fallback: ArbiterConfig) -> Self {
        if addr.trim().is_empty() {
            #[cfg(feature = "tracing")]
            tracing::info!("no token service configured, using process-local ceilings");
            return Self::Local(LocalArbiter::new(fallback));
        }

        match RemoteArbiter::connect(addr.trim().to_string()).await {
            Ok(remote) => {
                #[cfg(feature = "tracing")]
                tracing::info!(addr, "connected to token service");
                Self::Remote(remote)
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    addr,
                    error = %_e,
                    "token service unreachable, degrading to process-local ceilings"
                );
                Self::Local(LocalArbiter::new(fallback))
            }
        }
    }

    /// Whether ceilings are enforced only within this process.
    pub const fn is_degraded(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    pub async fn snapshot(&self) -> brickflow::Result<ArbiterSnapshot> {
        match self {
            Self::Remote(remote) => remote.snapshot().await.map_err(Into::into),
            Self::Local(local) => Ok(local.snapshot()),
        }
    }
}

impl TokenArbiter for ResourceArbiter {
    fn acquire(
        &self,
        request: &TokenRequest,
    ) -> impl Future<Output = brickflow::Result<LeaseId>> + Send {
        async move {
            match self {
                Self::Remote(remote) => remote.acquire(request).await,
                Self::Local(local) => local.acquire(request).await,
            }
        }
    }

    fn release(&self, lease: LeaseId) -> impl Future<Output = brickflow::Result<bool>> + Send {
        async move {
            match self {
                Self::Remote(remote) => remote.release(lease).await,
                Self::Local(local) => local.release(lease).await,
            }
        }
    }

    fn release_detached(&self, lease: LeaseId) {
        match self {
            Self::Remote(remote) => remote.release_detached(lease),
            Self::Local(local) => local.release_detached(lease),
        }
    }
}
