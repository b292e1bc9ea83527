use crate::ResourceKey;
use core::time::Duration;
use std::collections::HashMap;

/// Ceilings and timeouts for a [`crate::LocalArbiter`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ArbiterConfig {
    pub ceilings: HashMap<ResourceKey, u32>,
    /// Ceiling for resources without an explicit entry. `None` or `Some(0)`
    /// rejects them with [`crate::Error::UnknownResource`].
    pub default_ceiling: Option<u32>,
    /// Leases held longer than this are reclaimed as leaks.
    pub lease_timeout: Option<Duration>,
    /// How long an acquire may wait in the queue before failing.
    pub acquire_timeout: Option<Duration>,
}

impl ArbiterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_ceiling(mut self, key: ResourceKey, ceiling: u32) -> Self {
        self.ceilings.insert(key, ceiling);
        self
    }

    #[must_use]
    pub const fn with_default_ceiling(mut self, ceiling: u32) -> Self {
        self.default_ceiling = Some(ceiling);
        self
    }

    #[must_use]
    pub const fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub const fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    /// Effective ceiling for `key`; zero means unknown.
    pub fn ceiling_for(&self, key: &ResourceKey) -> u32 {
        self.ceilings
            .get(key)
            .copied()
            .or(self.default_ceiling)
            .unwrap_or(0)
    }
}
