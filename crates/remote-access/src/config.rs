//! Configuration for the remote accessor.

use std::time::Duration;

use catalog_common::{CatalogError, CatalogResult};

use crate::credentials::Credentials;
use crate::retry::RetryPolicy;

/// Configuration for [`RemoteAccessor`](crate::RemoteAccessor).
#[derive(Debug, Clone)]
pub struct AccessorConfig {
    /// Retry schedule around every object-store read.
    pub retry: RetryPolicy,

    /// Fail with `CrsMismatch` instead of warning when the asset's embedded
    /// CRS disagrees with the entry.
    pub strict_crs: bool,

    /// Memory budget for each raster handle's decoded-tile cache.
    pub tile_cache_mb: usize,

    /// Bytes fetched up front when reading a GeoTIFF header.
    pub header_prefetch_bytes: usize,

    /// Ambient credentials, merged with each entry's storage hints.
    pub credentials: Credentials,
}

impl Default for AccessorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            strict_crs: false,
            tile_cache_mb: 64,
            header_prefetch_bytes: 16 * 1024,
            credentials: Credentials::default(),
        }
    }
}

impl AccessorConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("CATALOG_RETRY_MAX_ATTEMPTS") {
            if let Ok(attempts) = val.parse() {
                config.retry.max_attempts = attempts;
            }
        }

        if let Ok(val) = std::env::var("CATALOG_RETRY_INITIAL_BACKOFF_MS") {
            if let Ok(ms) = val.parse() {
                config.retry.initial_backoff = Duration::from_millis(ms);
            }
        }

        if let Ok(val) = std::env::var("CATALOG_RETRY_MAX_BACKOFF_MS") {
            if let Ok(ms) = val.parse() {
                config.retry.max_backoff = Duration::from_millis(ms);
            }
        }

        if let Ok(val) = std::env::var("CATALOG_STRICT_CRS") {
            config.strict_crs = val.to_lowercase() == "true" || val == "1";
        }

        if let Ok(val) = std::env::var("CATALOG_TILE_CACHE_MB") {
            if let Ok(size) = val.parse() {
                config.tile_cache_mb = size;
            }
        }

        config.credentials = Credentials::from_env();
        config
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_strict_crs(mut self, strict: bool) -> Self {
        self.strict_crs = strict;
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> CatalogResult<()> {
        if self.retry.max_attempts == 0 {
            return Err(CatalogError::Config(
                "retry max_attempts must be > 0".to_string(),
            ));
        }

        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err(CatalogError::Config(
                "retry initial_backoff must not exceed max_backoff".to_string(),
            ));
        }

        if self.header_prefetch_bytes < 16 {
            return Err(CatalogError::Config(
                "header_prefetch_bytes must be >= 16".to_string(),
            ));
        }

        if self.credentials.access_key_id.is_some() != self.credentials.secret_access_key.is_some() {
            return Err(CatalogError::Config(
                "access key id and secret access key must be set together".to_string(),
            ));
        }

        Ok(())
    }

    /// Tile cache budget in bytes.
    pub fn tile_cache_bytes(&self) -> usize {
        self.tile_cache_mb * 1024 * 1024
    }
}
