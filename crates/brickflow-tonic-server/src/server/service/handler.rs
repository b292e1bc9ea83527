//! gRPC front end of the token arbiter.
//!
//! [`ResourceService`] wraps one [`LocalArbiter`] and serves it as the
//! `ResourceManager` service. Every worker in the cluster talks to the same
//! instance, so its ceilings hold cluster-wide.
//!
//! ## Responsibilities
//!
//! - Convert wire requests and cap each client's wait at the server limit.
//! - Answer a wait that runs out with `granted = false` rather than an error.
//! - Reclaim leaked leases on a timer and count them.
//! - Refuse new acquires during shutdown while still accepting releases.

use crate::server::{
    config::ServerConfig,
    telemetry::{
        increment_acquire_timeouts, increment_leases_granted, increment_leases_reclaimed,
        increment_leases_released, increment_request_errors, record_acquire_wait,
    },
};
use brickflow_tonic_core::{
    Error,
    brickflow::{LeaseId, LocalArbiter, TokenRequest},
    proto::{
        AcquireRequest, AcquireResponse, ReleaseRequest, ReleaseResponse, SnapshotRequest,
        SnapshotResponse, resource_manager_server::ResourceManager,
    },
};
use core::time::Duration;
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

#[derive(Clone)]
pub struct ResourceService {
    inner: Arc<Inner>,
}

struct Inner {
    config: ServerConfig,
    arbiter: LocalArbiter,
    shutdown_token: CancellationToken,
    shutting_down: AtomicBool,
    in_flight: AtomicUsize,
}

/// Counts an admitted request until it completes.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ResourceService {
    /// Creates the service and starts the lease reaper.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: ServerConfig) -> Self {
        let arbiter = LocalArbiter::new(config.arbiter.clone());
        let shutdown_token = CancellationToken::new();

        if config.arbiter.lease_timeout.is_some() {
            tokio::spawn(reap_leases(
                arbiter.clone(),
                config.reap_interval,
                shutdown_token.child_token(),
            ));
        }

        Self {
            inner: Arc::new(Inner {
                config,
                arbiter,
                shutdown_token,
                shutting_down: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn arbiter(&self) -> &LocalArbiter {
        &self.inner.arbiter
    }

    fn admit(&self) -> Result<InFlight<'_>, Error> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(Error::ServiceShutdown);
        }
        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        Ok(InFlight(&self.inner.in_flight))
    }

    /// Stops granting, gives in-flight acquires up to the shutdown timeout
    /// to finish, then cancels the rest and stops the reaper.
    pub async fn shutdown(&self) -> Result<(), Error> {
        #[cfg(feature = "tracing")]
        tracing::info!("Refusing new acquires");
        self.inner.shutting_down.store(true, Ordering::Release);

        let drained = timeout(self.inner.config.shutdown_timeout, async {
            while self.inner.in_flight.load(Ordering::Acquire) > 0 {
                sleep(Duration::from_millis(100)).await;
            }
        })
        .await;

        if drained.is_err() {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                "Graceful drain timed out ({} acquires still waiting)",
                self.inner.in_flight.load(Ordering::Acquire)
            );
        }

        self.inner.shutdown_token.cancel();

        #[cfg(feature = "tracing")]
        {
            let snapshot = self.inner.arbiter.snapshot();
            tracing::info!(
                outstanding = snapshot.outstanding_leases,
                reclaimed = snapshot.reclaimed,
                "Resource service shut down"
            );
        }
        Ok(())
    }
}

async fn reap_leases(arbiter: LocalArbiter, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            now = ticker.tick() => {
                let reclaimed = arbiter.reclaim_expired(now);
                if !reclaimed.is_empty() {
                    increment_leases_reclaimed(reclaimed.len() as u64);
                }
            }
        }
    }
}

#[tonic::async_trait]
impl ResourceManager for ResourceService {
    /// Waits for permits in arrival order.
    ///
    /// The wait is the client's `wait_timeout_ms`, or the server limit when
    /// unset, and never longer than the server limit. A cancelled call leaves
    /// the queue without taking permits.
    #[cfg_attr(feature = "tracing", tracing::instrument(
        skip_all,
        fields(resource = %req.get_ref().resource_name, count = req.get_ref().count)
    ))]
    async fn acquire(
        &self,
        req: Request<AcquireRequest>,
    ) -> Result<Response<AcquireResponse>, Status> {
        let _in_flight = self.admit().inspect_err(|_| increment_request_errors())?;
        let request = TokenRequest::try_from(req.into_inner())
            .inspect_err(|_| increment_request_errors())?;

        let limit = self.inner.config.max_wait;
        let wait = request.wait.map_or(limit, |wait| wait.min(limit));
        let request = request.with_wait(wait);

        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            () = self.inner.shutdown_token.cancelled() => Err(Error::ServiceShutdown),
            granted = self.inner.arbiter.acquire_lease(&request) => granted.map_err(Error::from),
        };
        let waited_ms = started.elapsed().as_millis() as u64;
        record_acquire_wait(waited_ms as f64);

        match outcome {
            Ok(lease) => {
                increment_leases_granted();
                #[cfg(feature = "tracing")]
                tracing::debug!(lease = %lease, waited_ms, "granted");
                Ok(Response::new(AcquireResponse {
                    granted: true,
                    lease_id: lease.0,
                    waited_ms,
                }))
            }
            Err(Error::ResourceExhausted { .. }) => {
                increment_acquire_timeouts();
                #[cfg(feature = "tracing")]
                tracing::debug!(waited_ms, "wait limit reached");
                Ok(Response::new(AcquireResponse {
                    granted: false,
                    lease_id: 0,
                    waited_ms,
                }))
            }
            Err(e) => {
                increment_request_errors();
                #[cfg(feature = "tracing")]
                tracing::warn!("Acquire rejected: {}", e);
                Err(e.into())
            }
        }
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(lease = req.get_ref().lease_id)))]
    async fn release(
        &self,
        req: Request<ReleaseRequest>,
    ) -> Result<Response<ReleaseResponse>, Status> {
        let lease = LeaseId(req.into_inner().lease_id);
        let released = self.inner.arbiter.release_lease(lease);
        if released {
            increment_leases_released();
        } else {
            #[cfg(feature = "tracing")]
            tracing::debug!("lease already released or reclaimed");
        }
        Ok(Response::new(ReleaseResponse { released }))
    }

    async fn snapshot(
        &self,
        _req: Request<SnapshotRequest>,
    ) -> Result<Response<SnapshotResponse>, Status> {
        let snapshot = self.inner.arbiter.snapshot();
        Ok(Response::new(SnapshotResponse::from(&snapshot)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brickflow_tonic_core::{
        RemoteArbiter,
        brickflow::{Access, ArbiterConfig, ResourceKey, TokenArbiter},
        proto::{self, resource_manager_server::ResourceManagerServer},
    };
    use tokio::net::TcpListener;
    use tokio_stream::wrappers::TcpListenerStream;
    use tonic::{Code, transport::Server};

    fn config(ceiling: u32) -> ServerConfig {
        ServerConfig {
            server_addr: "127.0.0.1:0".into(),
            uds: false,
            arbiter: ArbiterConfig::new()
                .with_ceiling(ResourceKey::read("store"), ceiling)
                .with_acquire_timeout(Duration::from_secs(30))
                .with_lease_timeout(Duration::from_secs(60)),
            max_wait: Duration::from_secs(30),
            reap_interval: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(1),
        }
    }

    fn acquire_req(count: u32, wait_ms: u64) -> Request<AcquireRequest> {
        Request::new(AcquireRequest {
            resource_name: "store".into(),
            count,
            access: proto::Access::Read as i32,
            bytes: 0,
            wait_timeout_ms: wait_ms,
        })
    }

    async fn release(service: &ResourceService, lease_id: u64) -> bool {
        service
            .release(Request::new(ReleaseRequest { lease_id }))
            .await
            .unwrap()
            .into_inner()
            .released
    }

    #[tokio::test]
    async fn grants_and_releases_once() {
        let service = ResourceService::new(config(2));
        let granted = service.acquire(acquire_req(2, 0)).await.unwrap().into_inner();
        assert!(granted.granted);
        assert_eq!(service.arbiter().in_use(&ResourceKey::read("store")), 2);

        assert!(release(&service, granted.lease_id).await);
        assert!(!release(&service, granted.lease_id).await);
        assert_eq!(service.arbiter().in_use(&ResourceKey::read("store")), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_wait_answers_not_granted() {
        let service = ResourceService::new(config(1));
        let held = service.acquire(acquire_req(1, 0)).await.unwrap().into_inner();
        assert!(held.granted);

        let denied = service.acquire(acquire_req(1, 200)).await.unwrap().into_inner();
        assert!(!denied.granted);
        assert!(denied.waited_ms >= 200);

        let snapshot = service.arbiter().snapshot();
        assert_eq!(snapshot.resources[0].queued, 0);
        assert_eq!(snapshot.resources[0].in_use, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn client_wait_is_capped_by_server_limit() {
        let mut config = config(1);
        config.max_wait = Duration::from_millis(500);
        let service = ResourceService::new(config);
        let _held = service.acquire(acquire_req(1, 0)).await.unwrap();

        let started = Instant::now();
        let denied = service
            .acquire(acquire_req(1, 60_000))
            .await
            .unwrap()
            .into_inner();
        assert!(!denied.granted);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn rejects_what_can_never_be_granted() {
        let service = ResourceService::new(config(2));

        let too_many = service.acquire(acquire_req(3, 0)).await.unwrap_err();
        assert_eq!(too_many.code(), Code::InvalidArgument);

        let zero = service.acquire(acquire_req(0, 0)).await.unwrap_err();
        assert_eq!(zero.code(), Code::InvalidArgument);

        let mut write = acquire_req(1, 0);
        write.get_mut().access = proto::Access::Write as i32;
        let unknown = service.acquire(write).await.unwrap_err();
        assert_eq!(unknown.code(), Code::NotFound);
        assert_eq!(unknown.message(), "store:write");
    }

    #[tokio::test(start_paused = true)]
    async fn leaked_leases_are_reclaimed() {
        let mut config = config(1);
        config.arbiter = config.arbiter.with_lease_timeout(Duration::from_secs(1));
        let service = ResourceService::new(config);

        let leaked = service.acquire(acquire_req(1, 0)).await.unwrap().into_inner();
        sleep(Duration::from_millis(1_500)).await;

        let snapshot = service.arbiter().snapshot();
        assert_eq!(snapshot.reclaimed, 1);
        assert_eq!(snapshot.outstanding_leases, 0);
        assert!(!release(&service, leaked.lease_id).await);

        let again = service.acquire(acquire_req(1, 0)).await.unwrap().into_inner();
        assert!(again.granted);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_refuses_and_cancels_waiters() {
        let service = ResourceService::new(config(1));
        let held = service.acquire(acquire_req(1, 0)).await.unwrap().into_inner();

        let waiter = {
            let service = service.clone();
            tokio::spawn(async move { service.acquire(acquire_req(1, 0)).await })
        };
        while service.arbiter().snapshot().resources[0].queued == 0 {
            tokio::task::yield_now().await;
        }

        service.shutdown().await.unwrap();

        let cancelled = waiter.await.unwrap().unwrap_err();
        assert_eq!(cancelled.code(), Code::Unavailable);
        let refused = service.acquire(acquire_req(1, 0)).await.unwrap_err();
        assert_eq!(refused.code(), Code::Unavailable);

        // Releases still go through so clients can hand permits back.
        assert!(release(&service, held.lease_id).await);
        assert_eq!(service.arbiter().snapshot().resources[0].queued, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn remote_arbiter_over_tcp() {
        let service = ResourceService::new(config(2));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();

        let server = {
            let cancel = cancel.clone();
            let service = service.clone();
            tokio::spawn(async move {
                Server::builder()
                    .add_service(ResourceManagerServer::new(service))
                    .serve_with_incoming_shutdown(
                        TcpListenerStream::new(listener),
                        cancel.cancelled_owned(),
                    )
                    .await
            })
        };

        let remote = RemoteArbiter::connect(format!("http://{addr}")).await.unwrap();
        let key = ResourceKey::new("store", Access::Read);
        let first = remote.acquire(&TokenRequest::new(key.clone(), 2)).await.unwrap();

        let denied = remote
            .acquire(&TokenRequest::new(key.clone(), 1).with_wait(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(denied.is_retryable());

        let snapshot = remote.snapshot().await.unwrap();
        assert_eq!(snapshot.resources[0].in_use, 2);
        assert_eq!(snapshot.outstanding_leases, 1);

        assert!(remote.release(first).await.unwrap());
        assert!(!remote.release(first).await.unwrap());

        let unknown = remote
            .acquire(&TokenRequest::new(ResourceKey::write("store"), 1))
            .await
            .unwrap_err();
        assert!(!unknown.is_retryable());

        {
            let _guard = remote.lease(&TokenRequest::new(key.clone(), 1)).await.unwrap();
        }
        // The guard releases in the background; poll until it lands.
        for _ in 0..50 {
            if service.arbiter().in_use(&key) == 0 {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(service.arbiter().in_use(&key), 0);

        cancel.cancel();
        server.await.unwrap().unwrap();
    }
}
