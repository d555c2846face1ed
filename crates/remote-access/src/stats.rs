//! Counters for remote reads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Shared access counters, mirrored into `metrics`.
///
/// Cloning shares the underlying counters, so every reader created by one
/// accessor reports into the same totals.
#[derive(Debug, Clone, Default)]
pub struct AccessStats {
    inner: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    bytes_fetched: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
}

/// Point-in-time copy of [`AccessStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub bytes_fetched: u64,
    pub retries: u64,
    pub failures: u64,
}

impl AccessStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.inner.requests.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("catalog_remote_requests_total").increment(1);
    }

    pub fn record_bytes(&self, bytes: u64) {
        self.inner.bytes_fetched.fetch_add(bytes, Ordering::Relaxed);
        metrics::counter!("catalog_remote_bytes_total").increment(bytes);
    }

    pub fn record_retry(&self) {
        self.inner.retries.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("catalog_remote_retries_total").increment(1);
    }

    pub fn record_failure(&self) {
        self.inner.failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("catalog_remote_failures_total").increment(1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.inner.requests.load(Ordering::Relaxed),
            bytes_fetched: self.inner.bytes_fetched.load(Ordering::Relaxed),
            retries: self.inner.retries.load(Ordering::Relaxed),
            failures: self.inner.failures.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.inner.requests.store(0, Ordering::Relaxed);
        self.inner.bytes_fetched.store(0, Ordering::Relaxed);
        self.inner.retries.store(0, Ordering::Relaxed);
        self.inner.failures.store(0, Ordering::Relaxed);
    }
}

impl StatsSnapshot {
    /// Counter deltas since an earlier snapshot.
    pub fn since(&self, earlier: &StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.saturating_sub(earlier.requests),
            bytes_fetched: self.bytes_fetched.saturating_sub(earlier.bytes_fetched),
            retries: self.retries.saturating_sub(earlier.retries),
            failures: self.failures.saturating_sub(earlier.failures),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_counters() {
        let stats = AccessStats::new();
        let clone = stats.clone();

        clone.record_request();
        clone.record_bytes(512);
        stats.record_retry();

        let snap = stats.snapshot();
        assert_eq!(snap.requests, 1);
        assert_eq!(snap.bytes_fetched, 512);
        assert_eq!(snap.retries, 1);
    }

    #[test]
    fn test_snapshot_delta() {
        let stats = AccessStats::new();
        stats.record_bytes(100);
        let before = stats.snapshot();
        stats.record_bytes(50);
        stats.record_request();

        let delta = stats.snapshot().since(&before);
        assert_eq!(delta.bytes_fetched, 50);
        assert_eq!(delta.requests, 1);

        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }
}
