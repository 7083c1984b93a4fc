/// Time source shared by the rate limiter, response cache and in-memory stores
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Wall-clock source in milliseconds since the UNIX epoch
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;

    fn now_secs(&self) -> u64 {
        self.now_millis() / 1000
    }
}

/// System clock backed by chrono
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}

/// Manually advanced clock for deterministic window and TTL behavior
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    /// Start at a window-aligned instant (divisible by 60 seconds)
    pub const DEFAULT_START_MILLIS: u64 = 1_700_000_040_000;

    pub fn new(start_millis: u64) -> Self {
        Self {
            millis: AtomicU64::new(start_millis),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Self::DEFAULT_START_MILLIS)
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}
