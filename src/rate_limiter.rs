/// Fixed-window rate limiting over a shared counter store
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::routes::Route;
use crate::store::{with_timeout, CounterStore, MemoryCounterStore};

/// Outcome of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Configured requests per window
    pub limit: u64,
    /// Requests left in the current window
    pub remaining: u64,
    /// UNIX timestamp (seconds) at which the window resets
    pub reset_at: u64,
    /// The shared store was unreachable and a local counter decided
    pub degraded: bool,
}

impl RateLimitDecision {
    /// Seconds a rejected caller should wait, never less than one
    pub fn retry_after_secs(&self, now_secs: u64) -> u64 {
        self.reset_at.saturating_sub(now_secs).max(1)
    }
}

/// Per-route, per-identifier fixed-window limiter.
///
/// Counting happens in the shared store; when the store errors or exceeds
/// its operation timeout the limiter fails open to a process-local counter
/// with identical window semantics.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    fallback: MemoryCounterStore,
    clock: Arc<dyn Clock>,
    operation_timeout: Duration,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            store,
            fallback: MemoryCounterStore::new(clock.clone()),
            clock,
            operation_timeout,
        }
    }

    /// Check and consume one request for `identifier` on `route`.
    ///
    /// Returns `None` for routes without a quota; the store is not touched.
    /// `budget` is what is left of the request deadline and further bounds
    /// the store round-trip.
    pub async fn allow(
        &self,
        identifier: &str,
        route: &Route,
        budget: Option<Duration>,
    ) -> Option<RateLimitDecision> {
        let quota = route.rate_limit()?;
        let window = quota.window_secs();
        let now = self.clock.now_secs();
        let window_start = now - (now % window);
        let reset_at = window_start + window;

        if quota.requests == 0 {
            debug!("Route '{}' is blocked by a zero quota", route.name());
            return Some(RateLimitDecision {
                allowed: false,
                limit: 0,
                remaining: 0,
                reset_at,
                degraded: false,
            });
        }

        let key = format!("ratelimit:{}:{}:{}", route.name(), identifier, window_start);
        let ttl = Duration::from_secs(window);
        let limit = budget.map_or(self.operation_timeout, |b| b.min(self.operation_timeout));

        let (count, degraded) = match with_timeout(limit, self.store.incr(&key, ttl)).await {
            Ok(count) => (count, false),
            Err(e) => {
                warn!(
                    "Rate limit store unavailable for route '{}', counting locally: {}",
                    route.name(),
                    e
                );
                (self.fallback.incr_now(&key, ttl), true)
            }
        };

        let allowed = count <= quota.requests;
        if !allowed {
            debug!(
                "Rate limit exceeded for '{}' on route '{}' ({}/{})",
                identifier,
                route.name(),
                count,
                quota.requests
            );
        }

        Some(RateLimitDecision {
            allowed,
            limit: quota.requests,
            remaining: quota.requests.saturating_sub(count),
            reset_at,
            degraded,
        })
    }

    /// Drop expired windows from the shared store and the local fallback
    pub fn purge_expired(&self) {
        self.store.purge_expired();
        self.fallback.purge_expired();
    }
}
