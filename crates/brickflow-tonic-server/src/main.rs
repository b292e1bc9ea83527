#![doc = include_str!("../README.md")]

mod server;

use brickflow_tonic_core::proto::{
    FILE_DESCRIPTOR_SET, resource_manager_server::ResourceManagerServer,
};
use clap::Parser;
use futures::Stream;
use server::config::{CliArgs, ServerConfig};
use server::service::handler::ResourceService;
use server::telemetry::{TelemetryProviders, init_telemetry};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::server::Connected;
use tonic::{codec::CompressionEncoding, transport::Server};
use tonic_health::server::HealthReporter;
use tonic_reflection::server::Builder;
use tonic_web::GrpcWebLayer;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};

// mimalloc holds up better than the musl allocator under contention.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Encodings offered and accepted on the resource manager.
const ENCODINGS: [CompressionEncoding; 3] = [
    CompressionEncoding::Zstd,
    CompressionEncoding::Gzip,
    CompressionEncoding::Deflate,
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let config = ServerConfig::try_from(CliArgs::parse())?;
    let providers = init_telemetry()?;

    if !config.uds {
        let listener = TcpListener::bind(&config.server_addr).await?;
        announce(&config);
        return serve(TcpListenerStream::new(listener), config, providers).await;
    }

    #[cfg(unix)]
    {
        use tokio::net::UnixListener;
        use tokio_stream::wrappers::UnixListenerStream;

        let socket = SocketFile::claim(&config.server_addr);
        let listener = UnixListener::bind(&socket.0)?;
        announce(&config);
        serve(UnixListenerStream::new(listener), config, providers).await
    }
    #[cfg(not(unix))]
    {
        anyhow::bail!("UDS=true needs a unix platform");
    }
}

/// Socket path owned by this process. Removed before bind and on exit, so a
/// crashed predecessor never blocks a restart.
#[cfg(unix)]
struct SocketFile(String);

#[cfg(unix)]
impl SocketFile {
    fn claim(path: &str) -> Self {
        let _ = std::fs::remove_file(path);
        Self(path.to_owned())
    }
}

#[cfg(unix)]
impl Drop for SocketFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

/// Serves the resource manager until a shutdown signal has drained it.
async fn serve<I, IO, IE>(
    incoming: I,
    config: ServerConfig,
    providers: TelemetryProviders,
) -> anyhow::Result<()>
where
    I: Stream<Item = Result<IO, IE>>,
    IO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
    IE: Into<tower::BoxError>,
{
    let service = ResourceService::new(config);

    let (health, health_service) = tonic_health::server::health_reporter();
    health
        .set_serving::<ResourceManagerServer<ResourceService>>()
        .await;

    let reflection = Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()?;

    let browser_access = ServiceBuilder::new()
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(GrpcWebLayer::new());

    Server::builder()
        .accept_http1(true)
        .http2_adaptive_window(Some(true))
        .layer(browser_access)
        .add_service(health_service)
        .add_service(reflection)
        .add_service(resource_manager(service.clone()))
        .serve_with_incoming_shutdown(incoming, async move {
            let _signal = wait_for_signal().await;
            #[cfg(feature = "tracing")]
            tracing::info!(signal = _signal, "draining resource service");
            drain(service, health, providers).await;
        })
        .await?;

    #[cfg(feature = "tracing")]
    tracing::info!("resource service stopped");
    Ok(())
}

fn resource_manager(service: ResourceService) -> ResourceManagerServer<ResourceService> {
    ENCODINGS
        .into_iter()
        .fold(ResourceManagerServer::new(service), |server, encoding| {
            server
                .send_compressed(encoding)
                .accept_compressed(encoding)
        })
}

fn announce(_config: &ServerConfig) {
    #[cfg(feature = "tracing")]
    {
        let mut ceilings: Vec<_> = _config.arbiter.ceilings.iter().collect();
        ceilings.sort();
        for (key, ceiling) in ceilings {
            tracing::info!(%key, ceiling, "ceiling");
        }
        tracing::info!(
            addr = %_config.server_addr,
            uds = _config.uds,
            default_ceiling = ?_config.arbiter.default_ceiling,
            lease_timeout = ?_config.arbiter.lease_timeout,
            max_wait = ?_config.max_wait,
            "resource service listening"
        );
    }
}

/// Resolves on Ctrl+C or SIGTERM with the name of the signal.
async fn wait_for_signal() -> &'static str {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let interrupt = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = interrupt => "SIGINT",
        () = terminate => "SIGTERM",
    }
}

/// Marks the service unhealthy, lets granted acquires finish, cancels the
/// waiters still queued and flushes telemetry.
async fn drain(service: ResourceService, health: HealthReporter, providers: TelemetryProviders) {
    // load balancers stop routing new acquires here first
    health
        .set_not_serving::<ResourceManagerServer<ResourceService>>()
        .await;

    if let Err(_e) = service.shutdown().await {
        #[cfg(feature = "tracing")]
        tracing::error!(error = %_e, "resource service did not drain cleanly");
    }

    providers.shutdown();
}
