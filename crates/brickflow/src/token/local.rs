use crate::{ArbiterConfig, Error, LeaseId, ResourceKey, Result, TokenArbiter, TokenRequest};
use core::{future::Future, time::Duration};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};
use tokio::{sync::oneshot, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

/// Process-local token arbiter.
///
/// All counters live behind one lock and are only touched by
/// [`LocalArbiter::acquire_lease`], [`LocalArbiter::release_lease`] and the
/// reaper. Waiters queue per resource in arrival order; a request never
/// overtakes an earlier one, even when it would fit in the spare capacity.
///
/// This is both the engine behind the remote token service and the degraded
/// fallback used when the service cannot be reached. In the latter case the
/// ceiling only holds within this process.
#[derive(Clone, Debug)]
pub struct LocalArbiter {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    config: ArbiterConfig,
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    pools: HashMap<ResourceKey, Pool>,
    leases: HashMap<LeaseId, LeaseRecord>,
    next_lease: u64,
    next_ticket: u64,
    reclaimed: u64,
}

#[derive(Debug)]
struct Pool {
    ceiling: u32,
    in_use: u32,
    waiters: VecDeque<Waiter>,
}

impl Pool {
    /// Whether `count` more permits stay within the ceiling.
    fn fits(&self, count: u32) -> bool {
        self.in_use
            .checked_add(count)
            .is_some_and(|total| total <= self.ceiling)
    }
}

#[derive(Debug)]
struct Waiter {
    ticket: u64,
    count: u32,
    bytes: u64,
    grant: oneshot::Sender<LeaseId>,
}

#[derive(Clone, Debug)]
struct LeaseRecord {
    key: ResourceKey,
    count: u32,
    bytes: u64,
    granted_at: Instant,
}

/// Point-in-time view of one resource.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ResourceSnapshot {
    pub key: ResourceKey,
    pub ceiling: u32,
    pub in_use: u32,
    pub queued: usize,
    /// Sum of the declared transfer sizes of outstanding leases.
    pub bytes_in_flight: u64,
}

/// Point-in-time view of an arbiter.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ArbiterSnapshot {
    /// Sorted by key.
    pub resources: Vec<ResourceSnapshot>,
    pub outstanding_leases: usize,
    /// Leases reclaimed by timeout since start.
    pub reclaimed: u64,
}

impl State {
    fn pool(&mut self, key: &ResourceKey, ceiling: u32) -> &mut Pool {
        self.pools.entry(key.clone()).or_insert_with(|| Pool {
            ceiling,
            in_use: 0,
            waiters: VecDeque::new(),
        })
    }

    /// Records a lease. The caller has already checked capacity.
    fn issue(&mut self, key: &ResourceKey, count: u32, bytes: u64) -> LeaseId {
        if let Some(pool) = self.pools.get_mut(key) {
            pool.in_use += count;
        }
        self.next_lease += 1;
        let id = LeaseId(self.next_lease);
        self.leases.insert(
            id,
            LeaseRecord {
                key: key.clone(),
                count,
                bytes,
                granted_at: Instant::now(),
            },
        );
        id
    }

    /// Forgets a lease and returns its permits, without waking waiters.
    fn retire(&mut self, id: LeaseId) -> Option<LeaseRecord> {
        let record = self.leases.remove(&id)?;
        if let Some(pool) = self.pools.get_mut(&record.key) {
            pool.in_use = pool.in_use.saturating_sub(record.count);
        }
        Some(record)
    }

    /// Hands out permits to the head of the queue while it fits.
    fn grant_waiters(&mut self, key: &ResourceKey) {
        loop {
            let Some(pool) = self.pools.get_mut(key) else {
                return;
            };
            let Some(front) = pool.waiters.front() else {
                return;
            };
            if !front.grant.is_closed() && !pool.fits(front.count) {
                return;
            }
            let Some(waiter) = pool.waiters.pop_front() else {
                return;
            };
            if waiter.grant.is_closed() {
                continue;
            }
            let id = self.issue(key, waiter.count, waiter.bytes);
            if waiter.grant.send(id).is_err() {
                self.retire(id);
            }
        }
    }

    /// Removes a queued ticket. Returns `false` if it was already granted.
    fn cancel_ticket(&mut self, key: &ResourceKey, ticket: u64) -> bool {
        let Some(pool) = self.pools.get_mut(key) else {
            return false;
        };
        match pool.waiters.iter().position(|w| w.ticket == ticket) {
            Some(pos) => {
                pool.waiters.remove(pos);
                true
            }
            None => false,
        }
    }
}

/// Keeps a queued acquire honest if its future is dropped or times out:
/// the ticket leaves the queue, or the grant that raced in is returned.
struct PendingGrant<'a> {
    shared: &'a Shared,
    key: &'a ResourceKey,
    ticket: u64,
    rx: oneshot::Receiver<LeaseId>,
    settled: bool,
}

impl Drop for PendingGrant<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.shared.state.lock();
        if !state.cancel_ticket(self.key, self.ticket) {
            // grants are sent under the lock, so one is either in the
            // channel now or was never made
            self.rx.close();
            if let Ok(id) = self.rx.try_recv() {
                state.retire(id);
            }
        }
        // the departed waiter may have been blocking smaller requests
        state.grant_waiters(self.key);
    }
}

impl LocalArbiter {
    pub fn new(config: ArbiterConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn config(&self) -> &ArbiterConfig {
        &self.shared.config
    }

    fn validate(&self, request: &TokenRequest) -> Result<u32> {
        let ceiling = self.shared.config.ceiling_for(&request.key);
        if ceiling == 0 {
            return Err(Error::UnknownResource(request.key.to_string()));
        }
        if request.count == 0 {
            return Err(Error::invalid("token count must be positive"));
        }
        if request.count > ceiling {
            return Err(Error::invalid(format!(
                "{} tokens requested for `{}` but its ceiling is {ceiling}",
                request.count, request.key
            )));
        }
        Ok(ceiling)
    }

    /// Acquires permits, queueing behind earlier requests when needed.
    ///
    /// # Errors
    ///
    /// See [`TokenArbiter::acquire`].
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "trace", skip(self)))]
    pub async fn acquire_lease(&self, request: &TokenRequest) -> Result<LeaseId> {
        let ceiling = self.validate(request)?;
        let started = Instant::now();

        let (ticket, rx) = {
            let mut state = self.shared.state.lock();
            let pool = state.pool(&request.key, ceiling);
            if pool.waiters.is_empty() && pool.fits(request.count) {
                return Ok(state.issue(&request.key, request.count, request.bytes));
            }
            state.next_ticket += 1;
            let ticket = state.next_ticket;
            let (tx, rx) = oneshot::channel();
            state.pool(&request.key, ceiling).waiters.push_back(Waiter {
                ticket,
                count: request.count,
                bytes: request.bytes,
                grant: tx,
            });
            (ticket, rx)
        };

        #[cfg(feature = "tracing")]
        tracing::trace!(key = %request.key, ticket, "queued for tokens");

        let mut pending = PendingGrant {
            shared: &self.shared,
            key: &request.key,
            ticket,
            rx,
            settled: false,
        };

        let wait = request.wait.or(self.shared.config.acquire_timeout);
        let outcome = match wait {
            Some(limit) => tokio::time::timeout(limit, &mut pending.rx).await.ok(),
            None => Some((&mut pending.rx).await),
        };

        match outcome {
            Some(Ok(id)) => {
                pending.settled = true;
                Ok(id)
            }
            Some(Err(_)) => Err(Error::ChannelError {
                context: format!("grant channel for `{}` closed", request.key),
            }),
            None => Err(Error::ResourceExhausted {
                resource: request.key.to_string(),
                waited_ms: started.elapsed().as_millis() as u64,
            }),
        }
    }

    /// Returns the permits of `lease` and wakes queued waiters.
    ///
    /// Returns `false` if the lease is unknown (already released or
    /// reclaimed).
    pub fn release_lease(&self, lease: LeaseId) -> bool {
        let mut state = self.shared.state.lock();
        match state.retire(lease) {
            Some(record) => {
                state.grant_waiters(&record.key);
                true
            }
            None => false,
        }
    }

    /// Reclaims every lease older than the configured lease timeout.
    ///
    /// Leaks are logged, never surfaced to callers.
    pub fn reclaim_expired(&self, now: Instant) -> Vec<LeaseId> {
        let Some(timeout) = self.shared.config.lease_timeout else {
            return Vec::new();
        };
        let mut state = self.shared.state.lock();
        let mut expired: Vec<LeaseId> = state
            .leases
            .iter()
            .filter(|(_, record)| now.saturating_duration_since(record.granted_at) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();

        for id in &expired {
            if let Some(record) = state.retire(*id) {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    lease = %id,
                    key = %record.key,
                    count = record.count,
                    bytes = record.bytes,
                    held_ms = now.saturating_duration_since(record.granted_at).as_millis() as u64,
                    "reclaimed leaked lease"
                );
                state.reclaimed += 1;
                state.grant_waiters(&record.key);
            }
        }
        expired
    }

    /// Runs [`Self::reclaim_expired`] every `interval` until cancelled.
    pub fn spawn_reaper(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let arbiter = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    now = ticker.tick() => {
                        arbiter.reclaim_expired(now);
                    }
                }
            }
        })
    }

    /// Permits currently granted for `key`.
    pub fn in_use(&self, key: &ResourceKey) -> u32 {
        self.shared
            .state
            .lock()
            .pools
            .get(key)
            .map_or(0, |pool| pool.in_use)
    }

    pub fn snapshot(&self) -> ArbiterSnapshot {
        let state = self.shared.state.lock();
        let mut bytes: HashMap<&ResourceKey, u64> = HashMap::new();
        for record in state.leases.values() {
            *bytes.entry(&record.key).or_default() += record.bytes;
        }
        let mut resources: Vec<_> = state
            .pools
            .iter()
            .map(|(key, pool)| ResourceSnapshot {
                key: key.clone(),
                ceiling: pool.ceiling,
                in_use: pool.in_use,
                queued: pool.waiters.len(),
                bytes_in_flight: bytes.get(key).copied().unwrap_or(0),
            })
            .collect();
        resources.sort_by(|a, b| a.key.cmp(&b.key));
        ArbiterSnapshot {
            resources,
            outstanding_leases: state.leases.len(),
            reclaimed: state.reclaimed,
        }
    }
}

impl TokenArbiter for LocalArbiter {
    fn acquire(&self, request: &TokenRequest) -> impl Future<Output = Result<LeaseId>> + Send {
        self.acquire_lease(request)
    }

    fn release(&self, lease: LeaseId) -> impl Future<Output = Result<bool>> + Send {
        let released = self.release_lease(lease);
        core::future::ready(Ok(released))
    }

    fn release_detached(&self, lease: LeaseId) {
        self.release_lease(lease);
    }
}
