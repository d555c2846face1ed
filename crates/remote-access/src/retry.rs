//! Bounded retry with exponential backoff for object-store reads.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use catalog_common::{CatalogError, CatalogResult};

use crate::stats::AccessStats;

/// Retry schedule for transient remote failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry (doubles each retry).
    pub initial_backoff: Duration,
    /// Upper bound on a single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails terminally, or attempts run out.
    ///
    /// `NotFound` is terminal on the first attempt; every other object-store
    /// error is treated as transient.
    pub async fn run<T, F, Fut>(
        &self,
        location: &str,
        stats: &AccessStats,
        mut op: F,
    ) -> CatalogResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, object_store::Error>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            stats.record_request();

            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let terminal = matches!(err, object_store::Error::NotFound { .. });
            if terminal || attempt >= max_attempts {
                stats.record_failure();
                return Err(CatalogError::RemoteAccess {
                    location: location.to_string(),
                    message: err.to_string(),
                    attempts: attempt,
                });
            }

            let delay = self.backoff(attempt);
            warn!(
                location = %location,
                error = %err,
                attempt = attempt,
                max_attempts = max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Remote read failed, retrying"
            );
            stats.record_retry();
            tokio::time::sleep(delay).await;
        }
    }
}
