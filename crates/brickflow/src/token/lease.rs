use crate::{LeaseId, Result, TokenArbiter};

/// Scoped lease. Returns its permits on every exit path, including unwinds
/// and cancelled futures.
#[must_use = "dropping a LeaseGuard releases its permits immediately"]
pub struct LeaseGuard<A: TokenArbiter> {
    arbiter: A,
    lease: Option<LeaseId>,
}

impl<A: TokenArbiter> LeaseGuard<A> {
    pub const fn new(arbiter: A, lease: LeaseId) -> Self {
        Self {
            arbiter,
            lease: Some(lease),
        }
    }

    pub fn id(&self) -> Option<LeaseId> {
        self.lease
    }

    /// Releases now and reports whether the arbiter still knew the lease.
    pub async fn release(mut self) -> Result<bool> {
        match self.lease.take() {
            Some(lease) => self.arbiter.release(lease).await,
            None => Ok(false),
        }
    }
}

impl<A: TokenArbiter> Drop for LeaseGuard<A> {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            self.arbiter.release_detached(lease);
        }
    }
}

impl<A: TokenArbiter> core::fmt::Debug for LeaseGuard<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}
