//! Common fixtures: in-memory buckets and catalog snippets.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use tempfile::TempDir;

/// Bucket name used by in-memory fixtures.
pub const TEST_BUCKET: &str = "test-bucket";

/// Common bounding boxes as `(min_x, min_y, max_x, max_y)`.
pub mod bbox {
    /// Galveston Bay, EPSG:4326.
    pub const GALVESTON: (f64, f64, f64, f64) = (-95.2, 29.2, -94.6, 29.8);

    /// Texas coast, EPSG:4326.
    pub const TEXAS_COAST: (f64, f64, f64, f64) = (-98.0, 25.0, -93.5, 30.5);
}

/// Empty in-memory bucket.
pub fn memory_store() -> Arc<InMemory> {
    Arc::new(InMemory::new())
}

/// Write `bytes` under `key`.
pub async fn put_object(store: &InMemory, key: &str, bytes: impl Into<Vec<u8>>) {
    store
        .put(&ObjectPath::from(key), Bytes::from(bytes.into()))
        .await
        .expect("put into in-memory store");
}

/// `memory://test-bucket/<key>`.
pub fn memory_uri(key: &str) -> String {
    format!("memory://{}/{}", TEST_BUCKET, key)
}

/// Write a catalog file into `dir` and return its path.
pub fn write_catalog(dir: &Path, name: &str, yaml: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create catalog dir");
    }
    std::fs::write(&path, yaml).expect("write catalog");
    path
}

/// Temporary directory for catalog and asset files.
pub fn temp_dir() -> TempDir {
    tempfile::tempdir().expect("create temp dir")
}

/// Catalog entry YAML for a raster at `path`.
pub fn raster_entry_yaml(name: &str, path: &str, crs: Option<u32>, rename: &[(&str, &str)]) -> String {
    let mut yaml = format!("{}:\n  data_type: RasterDataset\n  driver: raster\n  path: {}\n", name, path);
    if let Some(code) = crs {
        yaml.push_str(&format!("  crs: {}\n", code));
    }
    if !rename.is_empty() {
        yaml.push_str("  rename:\n");
        for (from, to) in rename {
            yaml.push_str(&format!("    {}: {}\n", from, to));
        }
    }
    yaml
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raster_entry_yaml() {
        let yaml = raster_entry_yaml("dem", "memory://b/dem.tif", Some(6344), &[("dem", "elevtn")]);
        assert!(yaml.starts_with("dem:\n"));
        assert!(yaml.contains("  crs: 6344\n"));
        assert!(yaml.contains("    dem: elevtn\n"));
    }

    #[tokio::test]
    async fn test_put_object() {
        let store = memory_store();
        put_object(&store, "a/b.bin", vec![1u8, 2, 3]).await;
        let meta = store.head(&ObjectPath::from("a/b.bin")).await.unwrap();
        assert_eq!(meta.size, 3);
    }
}
