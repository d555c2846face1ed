//! Remote access to catalog datasets.
//!
//! [`RemoteAccessor::open`] turns a [`CatalogEntry`](data_catalog::CatalogEntry)
//! into a lazy handle over object storage: GeoTIFF and VRT rasters read tile
//! by tile, Parquet tables streamed by row group, GeoJSON fetched on demand.
//! Every read goes through a bounded retry and is counted in [`AccessStats`].
//!
//! ```ignore
//! use remote_access::{AccessorConfig, RemoteAccessor};
//!
//! let accessor = RemoteAccessor::new(AccessorConfig::from_env())?;
//! let dem = accessor.open(registry.get("ncei_bathymetry")?, None).await?.into_raster()?;
//! let clipped = dem.clip_bbox(&bbox, 2)?;
//! let elevation = clipped.read_variable("elevtn").await?;
//! ```

pub mod accessor;
pub mod config;
pub mod credentials;
pub mod location;
pub mod provider;
pub mod raster;
pub mod reader;
pub mod retry;
pub mod stats;
pub mod store;
pub mod tabular;

pub use accessor::{resolve_crs, DatasetHandle, RemoteAccessor};
pub use config::AccessorConfig;
pub use credentials::Credentials;
pub use location::{Scheme, StorageLocation};
pub use provider::{CatalogProvider, DatasetProvider, RasterQuery, TabularQuery};
pub use raster::{GeoTransform, RasterArray, RasterDataset, RasterSource, Variable, Window};
pub use reader::{ObjectReader, RangeReader};
pub use retry::RetryPolicy;
pub use stats::{AccessStats, StatsSnapshot};
pub use store::{ReaderFactory, StoreResolver};
pub use tabular::{Feature, FeatureCollection, TabularDataset, VectorDataset};
