//! Object-store resolution.
//!
//! One store is built per (scheme, bucket, credential set) and reused for
//! every later open against the same bucket. Stores registered explicitly
//! (custom endpoints, in-memory stores in tests) take precedence over built
//! ones.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use object_store::aws::AmazonS3Builder;
use object_store::http::HttpBuilder;
use object_store::local::LocalFileSystem;
use object_store::{ClientOptions, ObjectStore, RetryConfig};
use tracing::{debug, info};

use catalog_common::{CatalogError, CatalogResult};

use crate::credentials::Credentials;
use crate::location::{Scheme, StorageLocation};
use crate::reader::ObjectReader;
use crate::retry::RetryPolicy;
use crate::stats::AccessStats;

/// Builds and caches object-store clients.
#[derive(Default)]
pub struct StoreResolver {
    registered: Mutex<HashMap<String, Arc<dyn ObjectStore>>>,
    built: Mutex<HashMap<String, Arc<dyn ObjectStore>>>,
}

impl std::fmt::Debug for StoreResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registered = self
            .registered
            .lock()
            .map(|m| m.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        f.debug_struct("StoreResolver")
            .field("registered", &registered)
            .finish()
    }
}

impl StoreResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve every location under `scheme://bucket` from `store`.
    pub fn register_store(&self, scheme: Scheme, bucket: &str, store: Arc<dyn ObjectStore>) {
        let key = format!("{}://{}", scheme, bucket);
        info!(store = %key, "Registered object store");
        if let Ok(mut registered) = self.registered.lock() {
            registered.insert(key, store);
        }
    }

    /// Store serving `location`, built on first use.
    pub fn resolve(
        &self,
        location: &StorageLocation,
        credentials: &Credentials,
    ) -> CatalogResult<Arc<dyn ObjectStore>> {
        let store_url = location.store_url();

        if let Some(store) = self.lock(&self.registered)?.get(&store_url) {
            return Ok(Arc::clone(store));
        }

        let cache_key = format!(
            "{}|anon={}|region={}|endpoint={}",
            store_url,
            credentials.anonymous,
            credentials.region.as_deref().unwrap_or(""),
            credentials.endpoint.as_deref().unwrap_or("")
        );

        let mut built = self.lock(&self.built)?;
        if let Some(store) = built.get(&cache_key) {
            return Ok(Arc::clone(store));
        }

        let store = build_store(location, credentials)?;
        debug!(store = %cache_key, "Built object store");
        built.insert(cache_key, Arc::clone(&store));
        Ok(store)
    }

    fn lock<'a>(
        &self,
        map: &'a Mutex<HashMap<String, Arc<dyn ObjectStore>>>,
    ) -> CatalogResult<std::sync::MutexGuard<'a, HashMap<String, Arc<dyn ObjectStore>>>> {
        map.lock()
            .map_err(|_| CatalogError::Internal("store cache lock poisoned".to_string()))
    }
}

/// Client-level retry settings for built stores.
///
/// Transient failures are retried by [`RetryPolicy`](crate::RetryPolicy)
/// around each read; the object-store client makes a single attempt.
fn client_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 0,
        ..RetryConfig::default()
    }
}

fn build_store(
    location: &StorageLocation,
    credentials: &Credentials,
) -> CatalogResult<Arc<dyn ObjectStore>> {
    let store_url = location.store_url();
    let build_err = |e: object_store::Error| CatalogError::RemoteAccess {
        location: store_url.clone(),
        message: format!("failed to create store: {}", e),
        attempts: 1,
    };

    match location.scheme {
        Scheme::S3 => {
            let mut builder = AmazonS3Builder::from_env()
                .with_bucket_name(&location.bucket)
                .with_retry(client_retry());

            if let Some(region) = &credentials.region {
                builder = builder.with_region(region);
            }
            if let Some(endpoint) = &credentials.endpoint {
                builder = builder
                    .with_endpoint(endpoint)
                    .with_allow_http(endpoint.starts_with("http:"));
            }
            if credentials.anonymous {
                builder = builder.with_skip_signature(true);
            } else if let (Some(key), Some(secret)) =
                (&credentials.access_key_id, &credentials.secret_access_key)
            {
                builder = builder
                    .with_access_key_id(key)
                    .with_secret_access_key(secret);
                if let Some(token) = &credentials.session_token {
                    builder = builder.with_token(token);
                }
            }

            Ok(Arc::new(builder.build().map_err(build_err)?))
        }
        Scheme::Http | Scheme::Https => {
            let options = ClientOptions::new().with_allow_http(location.scheme == Scheme::Http);
            let store = HttpBuilder::new()
                .with_url(store_url.clone())
                .with_client_options(options)
                .with_retry(client_retry())
                .build()
                .map_err(build_err)?;
            Ok(Arc::new(store))
        }
        Scheme::Local => Ok(Arc::new(LocalFileSystem::new())),
        Scheme::Memory => Err(CatalogError::Config(format!(
            "no in-memory store registered for {}",
            store_url
        ))),
    }
}

/// Creates [`ObjectReader`]s for one open request.
///
/// Bundles the shared resolver and counters with the credentials that apply
/// to the entry being opened, so VRT members reuse the entry's credentials.
#[derive(Debug, Clone)]
pub struct ReaderFactory {
    resolver: Arc<StoreResolver>,
    credentials: Credentials,
    retry: RetryPolicy,
    stats: AccessStats,
}

impl ReaderFactory {
    pub fn new(
        resolver: Arc<StoreResolver>,
        credentials: Credentials,
        retry: RetryPolicy,
        stats: AccessStats,
    ) -> Self {
        Self {
            resolver,
            credentials,
            retry,
            stats,
        }
    }

    /// Reader for `location`. Performs no I/O.
    pub fn reader(&self, location: &StorageLocation) -> CatalogResult<ObjectReader> {
        let store = self.resolver.resolve(location, &self.credentials)?;
        Ok(ObjectReader::new(
            store,
            location.object_path()?,
            location.to_string(),
            self.retry,
            self.stats.clone(),
        ))
    }

    pub fn stats(&self) -> &AccessStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    #[test]
    fn test_registered_store_wins() {
        let resolver = StoreResolver::new();
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        resolver.register_store(Scheme::Memory, "bucket", Arc::clone(&store));

        let location = StorageLocation::parse("memory://bucket/a.tif").unwrap();
        let resolved = resolver.resolve(&location, &Credentials::default()).unwrap();
        assert!(Arc::ptr_eq(&store, &resolved));
    }

    #[test]
    fn test_unregistered_memory_store_fails() {
        let resolver = StoreResolver::new();
        let location = StorageLocation::parse("memory://nowhere/a.tif").unwrap();
        assert!(matches!(
            resolver.resolve(&location, &Credentials::default()),
            Err(CatalogError::Config(_))
        ));
    }

    #[test]
    fn test_client_does_not_retry() {
        let retry = client_retry();
        assert_eq!(retry.max_retries, 0);
        assert_eq!(retry.retry_timeout, RetryConfig::default().retry_timeout);
    }

    #[test]
    fn test_s3_store_is_cached_per_bucket() {
        let resolver = StoreResolver::new();
        let credentials = Credentials::anonymous().with_region("us-east-1");

        let a = StorageLocation::parse("s3://noaa-nos-coastal-lidar-pds/a.tif").unwrap();
        let b = StorageLocation::parse("s3://noaa-nos-coastal-lidar-pds/b.tif").unwrap();
        let other = StorageLocation::parse("s3://lynker-spatial/c.tif").unwrap();

        let store_a = resolver.resolve(&a, &credentials).unwrap();
        let store_b = resolver.resolve(&b, &credentials).unwrap();
        let store_other = resolver.resolve(&other, &credentials).unwrap();

        assert!(Arc::ptr_eq(&store_a, &store_b));
        assert!(!Arc::ptr_eq(&store_a, &store_other));
    }
}
