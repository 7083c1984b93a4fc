/// Backend selection over per-route pools
use anyhow::{anyhow, Result};
use log::{debug, warn};
use std::collections::HashMap;
use std::hash::BuildHasher;
use std::net::IpAddr;
use std::sync::{
    atomic::{AtomicU32, AtomicUsize, Ordering},
    Arc,
};

use crate::config::LoadBalancingAlgorithm;
use crate::routes::Route;

/// Trait for load balancing strategies.
///
/// `candidates` is never empty; the returned value is an index into it.
pub trait LoadBalancingStrategy: Send + Sync {
    fn select(&self, candidates: &[&Arc<BackendState>], key: &[u8]) -> usize;

    fn name(&self) -> &'static str;

    /// Select over the full pool instead of the reachable subset, so a
    /// failing backend does not remap callers of the healthy ones
    fn selects_over_full_pool(&self) -> bool {
        false
    }
}

/// Shared counters for one backend target of one route
#[derive(Debug)]
pub struct BackendState {
    /// Backend base URL
    pub target: String,
    /// Requests currently leased to this backend
    open_connections: AtomicUsize,
    /// Failed forwards since the last success
    consecutive_failures: AtomicU32,
}

impl BackendState {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            open_connections: AtomicUsize::new(0),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn open_connections(&self) -> usize {
        self.open_connections.load(Ordering::Acquire)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    fn increment_connections(&self) {
        self.open_connections.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement connection count, saturating at zero
    fn decrement_connections(&self) {
        let _ = self
            .open_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
    }

    /// Returns the failure count after this failure
    pub fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// A backend is reachable until it reaches the failure threshold
    pub fn is_reachable(&self, failure_threshold: u32) -> bool {
        failure_threshold == 0 || self.consecutive_failures() < failure_threshold
    }
}

/// Round-robin over an atomic per-route cursor
#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    cursor: AtomicUsize,
}

impl LoadBalancingStrategy for RoundRobinStrategy {
    fn select(&self, candidates: &[&Arc<BackendState>], _key: &[u8]) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len()
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

/// Least open connections; ties go to the lowest index
#[derive(Debug, Default)]
pub struct LeastConnectionsStrategy;

impl LoadBalancingStrategy for LeastConnectionsStrategy {
    fn select(&self, candidates: &[&Arc<BackendState>], _key: &[u8]) -> usize {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(index, backend)| (backend.open_connections(), *index))
            .map_or(0, |(index, _)| index)
    }

    fn name(&self) -> &'static str {
        "least_connections"
    }
}

/// Caller IP hash with fixed seeds, so the mapping does not change between
/// restarts for an unchanged pool
pub struct IpHashStrategy {
    hasher: ahash::RandomState,
}

impl IpHashStrategy {
    pub fn new() -> Self {
        Self {
            hasher: ahash::RandomState::with_seeds(
                0x243f_6a88_85a3_08d3,
                0x1319_8a2e_0370_7344,
                0xa409_3822_299f_31d0,
                0x082e_fa98_ec4e_6c89,
            ),
        }
    }

    pub fn hash_key(&self, key: &[u8]) -> u64 {
        self.hasher.hash_one(key)
    }
}

impl Default for IpHashStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancingStrategy for IpHashStrategy {
    fn select(&self, candidates: &[&Arc<BackendState>], key: &[u8]) -> usize {
        (self.hash_key(key) % candidates.len() as u64) as usize
    }

    fn name(&self) -> &'static str {
        "ip_hash"
    }

    fn selects_over_full_pool(&self) -> bool {
        true
    }
}

/// Build the strategy object for a configured algorithm
pub fn build_strategy(algorithm: &LoadBalancingAlgorithm) -> Box<dyn LoadBalancingStrategy> {
    match algorithm {
        LoadBalancingAlgorithm::RoundRobin => Box::<RoundRobinStrategy>::default(),
        LoadBalancingAlgorithm::LeastConnections => Box::new(LeastConnectionsStrategy),
        LoadBalancingAlgorithm::IpHash => Box::new(IpHashStrategy::new()),
    }
}

/// A backend checked out for one request.
///
/// The open-connection count taken at pick time is given back exactly once,
/// either by `release()` or when the lease is dropped.
#[derive(Debug)]
pub struct BackendLease {
    backend: Arc<BackendState>,
    failure_threshold: u32,
}

impl BackendLease {
    fn acquire(backend: Arc<BackendState>, failure_threshold: u32) -> Self {
        backend.increment_connections();
        Self {
            backend,
            failure_threshold,
        }
    }

    pub fn target(&self) -> &str {
        &self.backend.target
    }

    /// Feed the forward outcome into the backend's reachability
    pub fn record_outcome(&self, success: bool) {
        if success {
            self.backend.record_success();
            return;
        }

        let failures = self.backend.record_failure();
        if self.failure_threshold > 0 && failures == self.failure_threshold {
            warn!(
                "Backend {} marked unreachable after {} consecutive failures",
                self.backend.target, failures
            );
        }
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Drop for BackendLease {
    fn drop(&mut self) {
        self.backend.decrement_connections();
    }
}

/// The backends of one route and the strategy choosing among them
pub struct BackendPool {
    backends: Vec<Arc<BackendState>>,
    strategy: Box<dyn LoadBalancingStrategy>,
    failure_threshold: u32,
}

impl BackendPool {
    pub fn new(
        targets: &[String],
        algorithm: &LoadBalancingAlgorithm,
        failure_threshold: u32,
    ) -> Result<Self> {
        if targets.is_empty() {
            return Err(anyhow!("Backend pool must not be empty"));
        }

        Ok(Self {
            backends: targets
                .iter()
                .map(|target| Arc::new(BackendState::new(target.trim_end_matches('/'))))
                .collect(),
            strategy: build_strategy(algorithm),
            failure_threshold,
        })
    }

    pub fn backends(&self) -> &[Arc<BackendState>] {
        &self.backends
    }

    /// Pick a backend, preferring reachable ones. When every backend is
    /// unreachable the whole pool is eligible.
    pub fn pick(&self, caller_ip: IpAddr) -> BackendLease {
        let key = ip_key(caller_ip);

        if self.strategy.selects_over_full_pool() {
            let pool: Vec<&Arc<BackendState>> = self.backends.iter().collect();
            let home = self.strategy.select(&pool, &key).min(pool.len() - 1);
            // Walk forward from the home backend only when it is unreachable
            let index = (0..pool.len())
                .map(|offset| (home + offset) % pool.len())
                .find(|&i| pool[i].is_reachable(self.failure_threshold))
                .unwrap_or(home);
            return BackendLease::acquire(pool[index].clone(), self.failure_threshold);
        }

        let reachable: Vec<&Arc<BackendState>> = self
            .backends
            .iter()
            .filter(|backend| backend.is_reachable(self.failure_threshold))
            .collect();

        let candidates = if reachable.is_empty() {
            self.backends.iter().collect()
        } else {
            reachable
        };

        let index = self.strategy.select(&candidates, &key).min(candidates.len() - 1);
        BackendLease::acquire(candidates[index].clone(), self.failure_threshold)
    }
}

fn ip_key(ip: IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

/// Backend pools for every route of one snapshot
pub struct LoadBalancer {
    pools: HashMap<String, BackendPool>,
}

impl LoadBalancer {
    pub fn new(routes: &[Arc<Route>], failure_threshold: u32) -> Result<Self> {
        let mut pools = HashMap::with_capacity(routes.len());

        for route in routes {
            let pool = BackendPool::new(
                &route.config.backends,
                &route.config.algorithm,
                failure_threshold,
            )
            .map_err(|e| anyhow!("Route '{}': {}", route.name(), e))?;

            debug!(
                "Route '{}' balances {} backends with {}",
                route.name(),
                pool.backends.len(),
                pool.strategy.name()
            );
            pools.insert(route.name().to_string(), pool);
        }

        Ok(Self { pools })
    }

    /// Pick a backend for `route`; `None` only if the route is not part of
    /// this snapshot
    pub fn pick(&self, route: &Route, caller_ip: IpAddr) -> Option<BackendLease> {
        self.pools.get(route.name()).map(|pool| pool.pick(caller_ip))
    }

    pub fn pool(&self, route_name: &str) -> Option<&BackendPool> {
        self.pools.get(route_name)
    }
}
