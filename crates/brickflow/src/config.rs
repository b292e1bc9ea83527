//! Parsed run configuration.
//!
//! Loading (YAML, JSON, CLI) is left to the caller; with the `serde` feature
//! every section deserializes with defaults for anything omitted except the
//! volume itself.

use crate::{
    Access, ArbiterConfig, ContactRule, Error, Partitioner, Point, ResourceKey, Result,
    RetryPolicy, StitchOptions, VolumeBounds, WorkerSettings,
};
use core::time::Duration;

/// Fetch retry and timeout settings.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct IoConfig {
    /// Retries per fetch after the first attempt.
    pub retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub jitter: f64,
    /// Per-fetch timeout. `None` waits forever.
    pub timeout_ms: Option<u64>,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff_base_ms: 100,
            backoff_max_ms: 10_000,
            jitter: 0.1,
            timeout_ms: None,
        }
    }
}

/// Which resource gates store traffic, and how many permits each call takes.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TokenConfig {
    pub resource: String,
    pub read_count: u32,
    pub write_count: u32,
    /// Ceiling for resources without an entry in `ceilings` (local mode).
    pub default_ceiling: u32,
    pub acquire_timeout_ms: Option<u64>,
    pub lease_timeout_ms: Option<u64>,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            resource: "volume-store".to_owned(),
            read_count: 1,
            write_count: 1,
            default_ceiling: 8,
            acquire_timeout_ms: None,
            lease_timeout_ms: None,
        }
    }
}

impl TokenConfig {
    pub fn read_key(&self) -> ResourceKey {
        ResourceKey::read(self.resource.clone())
    }

    pub fn write_key(&self) -> ResourceKey {
        ResourceKey::write(self.resource.clone())
    }
}

/// Fixed ceiling for one resource.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ResourceCeiling {
    pub name: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub access: Access,
    pub ceiling: u32,
}

/// Everything one run needs to know.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RunConfig {
    pub volume: VolumeBounds,
    #[cfg_attr(feature = "serde", serde(default = "defaults::chunk_shape"))]
    pub chunk_shape: [i64; 3],
    #[cfg_attr(feature = "serde", serde(default))]
    pub halo: i64,
    /// Grid anchor. Defaults to the volume minimum.
    #[cfg_attr(feature = "serde", serde(default))]
    pub grid_origin: Option<Point>,
    /// Chunks processed concurrently. Independent of the token ceilings.
    #[cfg_attr(feature = "serde", serde(default = "defaults::num_workers"))]
    pub num_workers: usize,
    #[cfg_attr(feature = "serde", serde(default))]
    pub io: IoConfig,
    /// Times a chunk may be re-enqueued after its worker gave up.
    #[cfg_attr(feature = "serde", serde(default = "defaults::requeue_budget"))]
    pub requeue_budget: u32,
    /// Permanently failed chunks tolerated before the run fails.
    #[cfg_attr(feature = "serde", serde(default))]
    pub max_failed_chunks: usize,
    /// Cancel in-flight chunks as soon as the run is doomed.
    #[cfg_attr(feature = "serde", serde(default))]
    pub fail_fast: bool,
    #[cfg_attr(feature = "serde", serde(default = "defaults::persist_retries"))]
    pub persist_retries: u32,
    #[cfg_attr(feature = "serde", serde(default))]
    pub tokens: TokenConfig,
    #[cfg_attr(feature = "serde", serde(default))]
    pub ceilings: Vec<ResourceCeiling>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub stitch: StitchOptions,
    #[cfg_attr(feature = "serde", serde(default = "defaults::output_prefix"))]
    pub output_prefix: String,
}

mod defaults {
    pub(super) const fn chunk_shape() -> [i64; 3] {
        [64, 64, 64]
    }

    pub(super) fn num_workers() -> usize {
        num_cpus::get()
    }

    pub(super) const fn requeue_budget() -> u32 {
        2
    }

    pub(super) const fn persist_retries() -> u32 {
        3
    }

    pub(super) fn output_prefix() -> String {
        "brickflow".to_owned()
    }
}

impl RunConfig {
    pub fn new(volume: VolumeBounds) -> Self {
        Self {
            volume,
            chunk_shape: defaults::chunk_shape(),
            halo: 0,
            grid_origin: None,
            num_workers: defaults::num_workers(),
            io: IoConfig::default(),
            requeue_budget: defaults::requeue_budget(),
            max_failed_chunks: 0,
            fail_fast: false,
            persist_retries: defaults::persist_retries(),
            tokens: TokenConfig::default(),
            ceilings: Vec::new(),
            stitch: StitchOptions::default(),
            output_prefix: defaults::output_prefix(),
        }
    }

    /// Rejects parameters no run can succeed with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if let Some(edge) = self.chunk_shape.iter().find(|e| **e <= 0) {
            return Err(Error::config(format!("chunk edge must be positive, got {edge}")));
        }
        if self.halo < 0 {
            return Err(Error::config(format!("halo must be non-negative, got {}", self.halo)));
        }
        if self.stitch.rule == ContactRule::HaloOverlap
            && self.chunk_shape.iter().any(|e| self.halo > *e)
        {
            return Err(Error::config(format!(
                "halo {} exceeds chunk edge {:?}; halo overlap cannot see past one neighbor",
                self.halo, self.chunk_shape
            )));
        }
        if self.stitch.rule == ContactRule::HaloOverlap && self.halo == 0 {
            return Err(Error::config(
                "halo overlap needs a halo of at least one voxel to find contacts",
            ));
        }
        let background = self.stitch.background;
        if !(self.stitch.label_offset..=u64::MAX).skip(1).any(|id| id != background) {
            return Err(Error::config(format!(
                "label_offset {} leaves no room for global ids",
                self.stitch.label_offset
            )));
        }
        if self.num_workers == 0 {
            return Err(Error::config("num_workers must be at least 1"));
        }
        if self.tokens.read_count == 0 || self.tokens.write_count == 0 {
            return Err(Error::config("token counts must be positive"));
        }
        if !(0.0..=1.0).contains(&self.io.jitter) {
            return Err(Error::config(format!("jitter must be in [0, 1], got {}", self.io.jitter)));
        }
        if self.io.backoff_base_ms > self.io.backoff_max_ms {
            return Err(Error::config("backoff_base_ms exceeds backoff_max_ms"));
        }
        if let Some(c) = self.ceilings.iter().find(|c| c.ceiling == 0) {
            return Err(Error::config(format!("ceiling for `{}` must be positive", c.name)));
        }
        if self.output_prefix.is_empty() {
            return Err(Error::config("output_prefix must not be empty"));
        }
        Ok(())
    }

    pub fn partitioner(&self) -> Result<Partitioner> {
        let origin = self.grid_origin.unwrap_or_else(|| self.volume.min());
        Ok(Partitioner::new(self.volume, self.chunk_shape, self.halo)?.with_origin(origin))
    }

    pub fn io_retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.io.retries,
            base_delay: Duration::from_millis(self.io.backoff_base_ms),
            max_delay: Duration::from_millis(self.io.backoff_max_ms),
            jitter: self.io.jitter,
        }
    }

    pub fn persist_retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.persist_retries,
            ..self.io_retry()
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            read: self.tokens.read_key(),
            read_count: self.tokens.read_count,
            retry: self.io_retry(),
            io_timeout: self.io.timeout_ms.map(Duration::from_millis),
            background: self.stitch.background,
            slab_depth: self.halo.max(1),
        }
    }

    /// Arbiter settings for local (degraded) mode.
    pub fn local_arbiter_config(&self) -> ArbiterConfig {
        let mut config = ArbiterConfig::new().with_default_ceiling(self.tokens.default_ceiling);
        for c in &self.ceilings {
            config = config.with_ceiling(ResourceKey::new(c.name.clone(), c.access), c.ceiling);
        }
        if let Some(ms) = self.tokens.acquire_timeout_ms {
            config = config.with_acquire_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.tokens.lease_timeout_ms {
            config = config.with_lease_timeout(Duration::from_millis(ms));
        }
        config
    }

    /// Store key of a persisted chunk.
    pub fn chunk_key(&self, chunk: crate::ChunkId) -> String {
        format!("{}/chunks/{chunk}", self.output_prefix)
    }

    pub fn mapping_key(&self) -> String {
        format!("{}/mapping", self.output_prefix)
    }
}
