//! Dataset provider: the narrow interface a model-input builder consumes.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use catalog_common::{BoundingBox, CatalogResult};
use data_catalog::{presets, DescriptorSource, Registry};

use crate::accessor::RemoteAccessor;
use crate::credentials::Credentials;
use crate::raster::RasterDataset;
use crate::tabular::{TabularDataset, VectorDataset};

/// Narrowing applied to a raster request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RasterQuery {
    /// Clip box in the dataset CRS.
    pub bbox: Option<BoundingBox>,
    /// Extra cells kept around `bbox`.
    #[serde(default)]
    pub buffer: usize,
    pub variables: Option<Vec<String>>,
}

impl RasterQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bbox(mut self, bbox: BoundingBox) -> Self {
        self.bbox = Some(bbox);
        self
    }

    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer;
        self
    }

    pub fn with_variables<S: Into<String>>(mut self, variables: impl IntoIterator<Item = S>) -> Self {
        self.variables = Some(variables.into_iter().map(Into::into).collect());
        self
    }
}

/// Narrowing applied to a table request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TabularQuery {
    pub columns: Option<Vec<String>>,
}

impl TabularQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_columns<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }
}

/// Source of named datasets for model setup.
#[async_trait]
pub trait DatasetProvider: Send + Sync {
    /// Resolve, open and narrow a raster dataset. No pixels are read.
    async fn get_raster_dataset(&self, name: &str, query: &RasterQuery) -> CatalogResult<RasterDataset>;

    /// Resolve and open a table, optionally restricted to some columns.
    async fn get_tabular_dataset(&self, name: &str, query: &TabularQuery) -> CatalogResult<TabularDataset>;

    /// Resolve and open a feature collection.
    async fn get_vector_dataset(&self, name: &str) -> CatalogResult<VectorDataset>;
}

/// [`DatasetProvider`] backed by a registry and a remote accessor.
#[derive(Debug, Clone)]
pub struct CatalogProvider {
    registry: Arc<Registry>,
    accessor: Arc<RemoteAccessor>,
    credentials: Option<Credentials>,
}

impl CatalogProvider {
    pub fn new(registry: Arc<Registry>, accessor: Arc<RemoteAccessor>) -> Self {
        Self {
            registry,
            accessor,
            credentials: None,
        }
    }

    /// Registry over the shipped catalogs, followed by `extra` sources so
    /// user catalogs override shipped names.
    pub fn with_predefined<I, S>(
        catalog_dir: impl AsRef<Path>,
        extra: I,
        accessor: Arc<RemoteAccessor>,
    ) -> CatalogResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<DescriptorSource>,
    {
        let registry = Registry::builder()
            .add_sources(presets::predefined_catalogs(catalog_dir))
            .add_sources(extra)
            .build()?;
        Ok(Self::new(Arc::new(registry), accessor))
    }

    /// Credentials used instead of the accessor's ambient ones.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn accessor(&self) -> &Arc<RemoteAccessor> {
        &self.accessor
    }
}

#[async_trait]
impl DatasetProvider for CatalogProvider {
    #[instrument(skip(self, query))]
    async fn get_raster_dataset(&self, name: &str, query: &RasterQuery) -> CatalogResult<RasterDataset> {
        let entry = self.registry.get(name)?;
        let mut dataset = self
            .accessor
            .open(entry, self.credentials.as_ref())
            .await?
            .into_raster()?;

        if let Some(variables) = &query.variables {
            dataset = dataset.select_variables(variables.as_slice())?;
        }
        if let Some(bbox) = &query.bbox {
            dataset = dataset.clip_bbox(bbox, query.buffer)?;
        }

        debug!(
            variables = ?dataset.variable_names(),
            window = %dataset.window(),
            "Resolved raster dataset"
        );
        Ok(dataset)
    }

    #[instrument(skip(self, query))]
    async fn get_tabular_dataset(&self, name: &str, query: &TabularQuery) -> CatalogResult<TabularDataset> {
        let entry = self.registry.get(name)?;
        let dataset = self
            .accessor
            .open(entry, self.credentials.as_ref())
            .await?
            .into_tabular()?;

        match &query.columns {
            Some(columns) => dataset.select_columns(columns.as_slice()),
            None => Ok(dataset),
        }
    }

    #[instrument(skip(self))]
    async fn get_vector_dataset(&self, name: &str) -> CatalogResult<VectorDataset> {
        let entry = self.registry.get(name)?;
        self.accessor
            .open(entry, self.credentials.as_ref())
            .await?
            .into_vector()
    }
}
