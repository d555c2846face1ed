//! Byte-range readers over object storage.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::path::Path;
use object_store::ObjectStore;
use tokio::sync::OnceCell;
use tracing::debug;

use catalog_common::{CatalogError, CatalogResult};

use crate::retry::RetryPolicy;
use crate::stats::AccessStats;

/// Random access to the bytes of one object.
#[async_trait]
pub trait RangeReader: Send + Sync + fmt::Debug {
    /// Human-readable location, used in errors and logs.
    fn location(&self) -> &str;

    /// Object size in bytes.
    async fn size(&self) -> CatalogResult<u64>;

    /// Read `range`, clamped to the object size.
    async fn read_range(&self, range: Range<u64>) -> CatalogResult<Bytes>;

    /// Read the whole object.
    async fn read_all(&self) -> CatalogResult<Bytes>;
}

/// [`RangeReader`] over an `object_store` object, with retry and counters.
#[derive(Clone)]
pub struct ObjectReader {
    store: Arc<dyn ObjectStore>,
    path: Path,
    location: String,
    retry: RetryPolicy,
    stats: AccessStats,
    size: Arc<OnceCell<u64>>,
}

impl fmt::Debug for ObjectReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectReader")
            .field("location", &self.location)
            .field("size", &self.size.get())
            .finish()
    }
}

impl ObjectReader {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        path: Path,
        location: impl Into<String>,
        retry: RetryPolicy,
        stats: AccessStats,
    ) -> Self {
        Self {
            store,
            path,
            location: location.into(),
            retry,
            stats,
            size: Arc::new(OnceCell::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stats(&self) -> &AccessStats {
        &self.stats
    }
}

#[async_trait]
impl RangeReader for ObjectReader {
    fn location(&self) -> &str {
        &self.location
    }

    async fn size(&self) -> CatalogResult<u64> {
        self.size
            .get_or_try_init(|| async {
                let meta = self
                    .retry
                    .run(&self.location, &self.stats, || self.store.head(&self.path))
                    .await?;
                Ok::<_, CatalogError>(meta.size as u64)
            })
            .await
            .copied()
    }

    async fn read_range(&self, range: Range<u64>) -> CatalogResult<Bytes> {
        let size = self.size().await?;
        let start = range.start.min(size);
        let end = range.end.min(size);
        if start >= end {
            return Ok(Bytes::new());
        }

        let bytes = self
            .retry
            .run(&self.location, &self.stats, || {
                self.store
                    .get_range(&self.path, start as usize..end as usize)
            })
            .await?;

        debug!(
            location = %self.location,
            offset = start,
            len = bytes.len(),
            "Range read"
        );
        self.stats.record_bytes(bytes.len() as u64);
        Ok(bytes)
    }

    async fn read_all(&self) -> CatalogResult<Bytes> {
        let bytes = self
            .retry
            .run(&self.location, &self.stats, || async {
                self.store.get(&self.path).await?.bytes().await
            })
            .await?;

        let _ = self.size.set(bytes.len() as u64);
        self.stats.record_bytes(bytes.len() as u64);
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    async fn reader_with(data: &'static [u8]) -> ObjectReader {
        let store = Arc::new(InMemory::new());
        let path = Path::from("data/blob.bin");
        store.put(&path, Bytes::from_static(data)).await.unwrap();
        ObjectReader::new(
            store,
            path,
            "memory://test/data/blob.bin",
            RetryPolicy::none(),
            AccessStats::new(),
        )
    }

    #[tokio::test]
    async fn test_range_is_clamped() {
        let reader = reader_with(b"0123456789").await;

        assert_eq!(reader.size().await.unwrap(), 10);
        assert_eq!(&reader.read_range(2..5).await.unwrap()[..], b"234");
        assert_eq!(&reader.read_range(8..100).await.unwrap()[..], b"89");
        assert!(reader.read_range(20..30).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_counts_bytes_and_requests() {
        let reader = reader_with(b"0123456789").await;
        reader.read_range(0..4).await.unwrap();

        let snap = reader.stats().snapshot();
        // HEAD + GET
        assert_eq!(snap.requests, 2);
        assert_eq!(snap.bytes_fetched, 4);
    }

    #[tokio::test]
    async fn test_missing_object_fails_once() {
        let store = Arc::new(InMemory::new());
        let reader = ObjectReader::new(
            store,
            Path::from("missing.tif"),
            "memory://test/missing.tif",
            RetryPolicy::default(),
            AccessStats::new(),
        );

        let err = reader.read_all().await.unwrap_err();
        assert!(matches!(
            err,
            catalog_common::CatalogError::RemoteAccess { attempts: 1, .. }
        ));
    }
}
