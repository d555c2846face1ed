//! Remote accessor: turns a catalog entry into an open, lazy dataset handle.

use std::sync::Arc;

use object_store::ObjectStore;
use tracing::{info, instrument, warn};

use catalog_common::{CatalogError, CatalogResult, Crs};
use data_catalog::{CatalogEntry, Driver};

use crate::config::AccessorConfig;
use crate::credentials::Credentials;
use crate::location::{Scheme, StorageLocation};
use crate::raster::{RasterDataset, RasterSource, TiffSource, VrtSource};
use crate::stats::AccessStats;
use crate::store::{ReaderFactory, StoreResolver};
use crate::tabular::{TabularDataset, VectorDataset};

/// An opened dataset, by driver family.
#[derive(Debug, Clone)]
pub enum DatasetHandle {
    Raster(RasterDataset),
    Tabular(TabularDataset),
    Vector(VectorDataset),
}

impl DatasetHandle {
    pub fn name(&self) -> &str {
        match self {
            Self::Raster(ds) => ds.name(),
            Self::Tabular(ds) => ds.name(),
            Self::Vector(ds) => ds.name(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Raster(_) => "raster",
            Self::Tabular(_) => "parquet",
            Self::Vector(_) => "vector",
        }
    }

    pub fn as_raster(&self) -> Option<&RasterDataset> {
        match self {
            Self::Raster(ds) => Some(ds),
            _ => None,
        }
    }

    pub fn into_raster(self) -> CatalogResult<RasterDataset> {
        match self {
            Self::Raster(ds) => Ok(ds),
            other => Err(other.wrong_kind("raster")),
        }
    }

    pub fn into_tabular(self) -> CatalogResult<TabularDataset> {
        match self {
            Self::Tabular(ds) => Ok(ds),
            other => Err(other.wrong_kind("parquet")),
        }
    }

    pub fn into_vector(self) -> CatalogResult<VectorDataset> {
        match self {
            Self::Vector(ds) => Ok(ds),
            other => Err(other.wrong_kind("vector")),
        }
    }

    fn wrong_kind(&self, wanted: &str) -> CatalogError {
        CatalogError::UnsupportedDriver(format!(
            "{} is a {} dataset, not {}",
            self.name(),
            self.kind(),
            wanted
        ))
    }
}

/// Pick the CRS of an opened asset.
///
/// The entry's declared CRS wins. An embedded CRS that disagrees with it is
/// an error under strict validation and a warning otherwise. With nothing
/// declared, the embedded CRS is used as-is.
pub fn resolve_crs(
    declared: Option<&Crs>,
    embedded: Option<&Crs>,
    strict: bool,
    location: &str,
) -> CatalogResult<Option<Crs>> {
    match (declared, embedded) {
        (Some(declared), Some(embedded)) if !declared.is_compatible(embedded) => {
            if strict {
                return Err(CatalogError::CrsMismatch {
                    declared: declared.to_string(),
                    embedded: embedded.to_string(),
                });
            }
            warn!(
                location = %location,
                declared = %declared,
                embedded = %embedded,
                "Embedded CRS differs from catalog entry, using entry CRS"
            );
            Ok(Some(declared.clone()))
        }
        (Some(declared), _) => Ok(Some(declared.clone())),
        (None, embedded) => Ok(embedded.cloned()),
    }
}

/// Opens catalog entries against object storage.
///
/// Holds the store cache and access counters; every handle opened through
/// one accessor shares them.
#[derive(Debug)]
pub struct RemoteAccessor {
    config: AccessorConfig,
    resolver: Arc<StoreResolver>,
    stats: AccessStats,
}

impl RemoteAccessor {
    pub fn new(config: AccessorConfig) -> CatalogResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            resolver: Arc::new(StoreResolver::new()),
            stats: AccessStats::new(),
        })
    }

    pub fn from_env() -> CatalogResult<Self> {
        Self::new(AccessorConfig::from_env())
    }

    pub fn config(&self) -> &AccessorConfig {
        &self.config
    }

    pub fn stats(&self) -> &AccessStats {
        &self.stats
    }

    /// Serve `scheme://bucket` from a caller-provided store.
    pub fn register_store(&self, scheme: Scheme, bucket: &str, store: Arc<dyn ObjectStore>) {
        self.resolver.register_store(scheme, bucket, store);
    }

    fn factory(&self, entry: &CatalogEntry, credentials: Option<&Credentials>) -> ReaderFactory {
        let base = credentials.unwrap_or(&self.config.credentials);
        ReaderFactory::new(
            Arc::clone(&self.resolver),
            base.merged_with(&entry.storage_options),
            self.config.retry,
            self.stats.clone(),
        )
    }

    /// Open `entry` lazily.
    ///
    /// Rasters read only their header, Parquet tables only their footer and
    /// GeoJSON documents only a HEAD. `credentials` replaces the accessor's
    /// ambient credentials for this call; the entry's storage hints apply on
    /// top either way.
    #[instrument(skip(self, entry, credentials), fields(dataset = %entry.name, driver = %entry.driver))]
    pub async fn open(
        &self,
        entry: &CatalogEntry,
        credentials: Option<&Credentials>,
    ) -> CatalogResult<DatasetHandle> {
        let location = StorageLocation::parse(&entry.path)?;
        let factory = self.factory(entry, credentials);
        let before = self.stats.snapshot();

        let handle = match &entry.driver {
            Driver::Raster => DatasetHandle::Raster(self.open_raster(entry, &location, factory).await?),
            Driver::Parquet => {
                let reader = factory.reader(&location)?;
                DatasetHandle::Tabular(TabularDataset::open(entry, reader).await?)
            }
            Driver::Vector => {
                let reader = factory.reader(&location)?;
                DatasetHandle::Vector(
                    VectorDataset::open(entry, reader, self.config.strict_crs).await?,
                )
            }
            Driver::Other(name) => return Err(CatalogError::UnsupportedDriver(name.clone())),
        };

        let cost = self.stats.snapshot().since(&before);
        metrics::counter!("catalog_datasets_opened_total", "driver" => entry.driver.as_str().to_string())
            .increment(1);
        info!(
            location = %location,
            requests = cost.requests,
            bytes = cost.bytes_fetched,
            "Opened dataset"
        );

        Ok(handle)
    }

    async fn open_raster(
        &self,
        entry: &CatalogEntry,
        location: &StorageLocation,
        factory: ReaderFactory,
    ) -> CatalogResult<RasterDataset> {
        let reader = Arc::new(factory.reader(location)?);
        let prefetch = self.config.header_prefetch_bytes;
        let cache = self.config.tile_cache_bytes();

        let source: Arc<dyn RasterSource> = match location.extension().as_deref() {
            Some("vrt") => {
                Arc::new(VrtSource::open(location, reader, factory, prefetch, cache).await?)
            }
            _ => Arc::new(TiffSource::open(reader, prefetch, cache).await?),
        };

        let crs = resolve_crs(
            entry.crs.as_ref(),
            source.crs().as_ref(),
            self.config.strict_crs,
            source.location(),
        )?;

        RasterDataset::from_entry(entry, source, crs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_catalog::DataType;

    #[test]
    fn test_resolve_crs_declared_wins() {
        let declared = Crs::Epsg(6344);
        let embedded = Crs::Epsg(26915);

        let lenient = resolve_crs(Some(&declared), Some(&embedded), false, "x.tif").unwrap();
        assert_eq!(lenient, Some(Crs::Epsg(6344)));

        let strict = resolve_crs(Some(&declared), Some(&embedded), true, "x.tif");
        assert!(matches!(strict, Err(CatalogError::CrsMismatch { .. })));
    }

    #[test]
    fn test_resolve_crs_fills_gaps() {
        assert_eq!(
            resolve_crs(Some(&Crs::Epsg(4326)), None, true, "x").unwrap(),
            Some(Crs::Epsg(4326))
        );
        assert_eq!(
            resolve_crs(None, Some(&Crs::Epsg(5070)), true, "x").unwrap(),
            Some(Crs::Epsg(5070))
        );
        assert_eq!(resolve_crs(None, None, true, "x").unwrap(), None);
        assert_eq!(
            resolve_crs(Some(&Crs::Epsg(4326)), Some(&Crs::Epsg(4326)), true, "x").unwrap(),
            Some(Crs::Epsg(4326))
        );
    }

    #[tokio::test]
    async fn test_unknown_driver_is_rejected_before_io() {
        let accessor = RemoteAccessor::new(AccessorConfig::default()).unwrap();
        let entry = CatalogEntry::new(
            "mystery",
            DataType::Raster,
            Driver::parse("zarr"),
            "s3://bucket/mystery.zarr",
        );

        let err = accessor.open(&entry, None).await.unwrap_err();
        assert!(matches!(err, CatalogError::UnsupportedDriver(ref d) if d == "zarr"));
        assert_eq!(accessor.stats().snapshot().requests, 0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = AccessorConfig::default();
        config.retry.max_attempts = 0;
        assert!(RemoteAccessor::new(config).is_err());
    }
}
