use anyhow::{Context, bail};
use brickflow_tonic_core::brickflow::{Access, ArbiterConfig, ResourceKey};
use clap::Parser;
use core::time::Duration;
use std::collections::HashMap;

/// Runtime configuration for the `brickflow-resource-server` binary.
///
/// Every value is read from a CLI flag or its environment variable (a `.env`
/// file is loaded first). Ceilings are fixed for the lifetime of the
/// process.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "brickflow-resource-server",
    version,
    about = "A gRPC service granting bounded, FIFO-fair I/O permits"
)]
pub struct CliArgs {
    /// Address to listen on (TCP or Unix socket path; use --uds for Unix
    /// socket).
    ///
    /// Example: "0.0.0.0:50051" or "/tmp/brickflow-tokens.sock"
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:50051"))]
    pub server_addr: String,

    /// Listen on a Unix socket instead of TCP. If set, `SERVER_ADDR` must be
    /// a file path.
    #[arg(short, long, default_value_t = false)]
    pub uds: bool,

    /// Comma separated ceilings, `name:access=ceiling`.
    ///
    /// `access` is `read` or `write`; leaving it out (`name=ceiling`) sets
    /// the same ceiling for both.
    ///
    /// Example: "volume-store:read=32,volume-store:write=4"
    ///
    /// Environment variable: `RESOURCE_CEILINGS`
    #[arg(long, env = "RESOURCE_CEILINGS", default_value_t = String::new())]
    pub resource_ceilings: String,

    /// Ceiling for resources not listed in `RESOURCE_CEILINGS`. Zero rejects
    /// them as unknown.
    ///
    /// Environment variable: `DEFAULT_CEILING`
    #[arg(long, env = "DEFAULT_CEILING", default_value_t = 0)]
    pub default_ceiling: u32,

    /// Leases held longer than this are reclaimed and logged as leaks. Zero
    /// disables reclamation.
    ///
    /// Environment variable: `LEASE_TIMEOUT_SECS`
    #[arg(long, env = "LEASE_TIMEOUT_SECS", default_value_t = 600)]
    pub lease_timeout_secs: u64,

    /// Longest an `Acquire` may wait in the queue before it is answered with
    /// `granted = false`. Caps the client's own wait.
    ///
    /// Environment variable: `ACQUIRE_TIMEOUT_MS`
    #[arg(long, env = "ACQUIRE_TIMEOUT_MS", default_value_t = 30_000)]
    pub acquire_timeout_ms: u64,

    /// How often expired leases are looked for.
    ///
    /// Environment variable: `REAP_INTERVAL_MS`
    #[arg(long, env = "REAP_INTERVAL_MS", default_value_t = 1_000)]
    pub reap_interval_ms: u64,

    /// Time given to in-flight requests to finish on shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECS`
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 5)]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub uds: bool,
    pub arbiter: ArbiterConfig,
    pub max_wait: Duration,
    pub reap_interval: Duration,
    pub shutdown_timeout: Duration,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let ceilings = parse_ceilings(&args.resource_ceilings)?;

        if ceilings.is_empty() && args.default_ceiling == 0 {
            bail!("no resources configured: set RESOURCE_CEILINGS or DEFAULT_CEILING");
        }
        if args.acquire_timeout_ms == 0 {
            bail!("ACQUIRE_TIMEOUT_MS must be greater than 0");
        }
        if args.reap_interval_ms == 0 {
            bail!("REAP_INTERVAL_MS must be greater than 0");
        }

        let mut arbiter = ArbiterConfig {
            ceilings,
            ..ArbiterConfig::default()
        }
        .with_acquire_timeout(Duration::from_millis(args.acquire_timeout_ms));
        if args.default_ceiling > 0 {
            arbiter = arbiter.with_default_ceiling(args.default_ceiling);
        }
        if args.lease_timeout_secs > 0 {
            arbiter = arbiter.with_lease_timeout(Duration::from_secs(args.lease_timeout_secs));
        }

        Ok(Self {
            server_addr: args.server_addr,
            uds: args.uds,
            arbiter,
            max_wait: Duration::from_millis(args.acquire_timeout_ms),
            reap_interval: Duration::from_millis(args.reap_interval_ms),
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
        })
    }
}

/// Parses `name:access=ceiling` entries.
pub fn parse_ceilings(raw: &str) -> anyhow::Result<HashMap<ResourceKey, u32>> {
    let mut ceilings = HashMap::new();

    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (resource, ceiling) = entry
            .split_once('=')
            .with_context(|| format!("ceiling entry `{entry}` is missing `=`"))?;
        let ceiling: u32 = ceiling
            .trim()
            .parse()
            .with_context(|| format!("invalid ceiling in `{entry}`"))?;
        if ceiling == 0 {
            bail!("ceiling for `{}` must be greater than 0", resource.trim());
        }

        let (name, modes) = match resource.trim().split_once(':') {
            Some((name, "read")) => (name, &[Access::Read][..]),
            Some((name, "write")) => (name, &[Access::Write][..]),
            Some((_, other)) => bail!("unknown access mode `{other}` in `{entry}`"),
            None => (resource.trim(), &[Access::Read, Access::Write][..]),
        };
        if name.is_empty() {
            bail!("resource name missing in `{entry}`");
        }

        for access in modes {
            let key = ResourceKey::new(name, *access);
            if ceilings.insert(key.clone(), ceiling).is_some() {
                bail!("duplicate ceiling for `{key}`");
            }
        }
    }

    Ok(ceilings)
}
