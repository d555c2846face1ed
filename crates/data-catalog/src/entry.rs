//! Catalog entry types.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use catalog_common::{BoundingBox, Crs};

/// Kind of data a catalog entry resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// Gridded data (DEMs, forcing grids).
    Raster,
    /// Features with geometry (GeoJSON, hydrofabric layers).
    Vector,
    /// Plain tables (Parquet attributes).
    Tabular,
}

impl DataType {
    /// Parse both the short names and the long names used by HydroMT
    /// catalogs (`RasterDataset`, `GeoDataFrame`, `DataFrame`).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "raster" | "rasterdataset" => Some(Self::Raster),
            "vector" | "geodataframe" | "geodataset" => Some(Self::Vector),
            "tabular" | "dataframe" => Some(Self::Tabular),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raster => "raster",
            Self::Vector => "vector",
            Self::Tabular => "tabular",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for DataType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DataType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DataType::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown data_type '{}'", raw)))
    }
}

/// Format identifier of an entry.
///
/// Unknown drivers are kept verbatim so that a catalog mentioning a driver
/// this build cannot read still loads; the failure surfaces when the entry
/// is opened.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Driver {
    Raster,
    Vector,
    Parquet,
    Other(String),
}

impl Driver {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "raster" | "rasterio" | "geotiff" | "vrt" => Self::Raster,
            "vector" | "geojson" => Self::Vector,
            "parquet" | "geoparquet" => Self::Parquet,
            _ => Self::Other(s.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Raster => "raster",
            Self::Vector => "vector",
            Self::Parquet => "parquet",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Driver {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Driver {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Driver::parse(&String::deserialize(deserializer)?))
    }
}

/// Fill value declaration: one value for every variable, or one per variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NoData {
    Value(f64),
    PerVariable(BTreeMap<String, f64>),
}

impl NoData {
    /// Fill value for a (renamed) variable.
    pub fn for_variable(&self, variable: &str) -> Option<f64> {
        match self {
            NoData::Value(v) => Some(*v),
            NoData::PerVariable(map) => map.get(variable).copied(),
        }
    }
}

/// Per-entry hints for reaching the storage backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    /// Send unsigned requests (public buckets).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anon: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,
}

impl StorageOptions {
    pub fn is_empty(&self) -> bool {
        self.anon.is_none() && self.region.is_none() && self.endpoint_url.is_none()
    }
}

/// Provenance metadata carried by an entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Provenance {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(alias = "source_license", skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    /// Spatial extent as `[min_x, min_y, max_x, max_y]`.
    #[serde(alias = "bbox", skip_serializing_if = "Option::is_none")]
    pub extent: Option<BoundingBox>,
    #[serde(alias = "source_version", skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Free-form keys (notes, paper references) kept as scalars rendered to text.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// A declarative record describing one dataset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogEntry {
    pub name: String,
    pub data_type: DataType,
    pub driver: Driver,
    /// Format-specific options, e.g. `chunks: {x: 3600, y: 3600}`.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub driver_kwargs: BTreeMap<String, serde_yaml::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crs: Option<Crs>,
    /// Fully resolved storage URI or local path.
    pub path: String,
    /// Source field name -> target field name.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub rename: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodata: Option<NoData>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub unit_mult: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub unit_add: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "StorageOptions::is_empty")]
    pub storage_options: StorageOptions,
    pub meta: Provenance,
    /// Descriptor the entry was loaded from.
    #[serde(skip)]
    pub source: String,
}

impl CatalogEntry {
    /// Minimal entry; everything optional left empty.
    pub fn new(
        name: impl Into<String>,
        data_type: DataType,
        driver: Driver,
        path: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            data_type,
            driver,
            driver_kwargs: BTreeMap::new(),
            crs: None,
            path: path.into(),
            rename: BTreeMap::new(),
            nodata: None,
            unit_mult: BTreeMap::new(),
            unit_add: BTreeMap::new(),
            storage_options: StorageOptions::default(),
            meta: Provenance::default(),
            source: String::new(),
        }
    }

    pub fn with_crs(mut self, crs: Crs) -> Self {
        self.crs = Some(crs);
        self
    }

    pub fn with_rename(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.rename.insert(from.into(), to.into());
        self
    }

    pub fn category(&self) -> Option<&str> {
        self.meta.category.as_deref()
    }

    /// Target name for a source field, or the field itself when not renamed.
    pub fn renamed<'a>(&'a self, field: &'a str) -> &'a str {
        self.rename.get(field).map(String::as_str).unwrap_or(field)
    }

    /// Chunk sizes per named dimension from `driver_kwargs.chunks`.
    ///
    /// Non-integer values (xarray's `auto`, `-1`) are skipped.
    pub fn chunk_sizes(&self) -> BTreeMap<String, usize> {
        let mut chunks = BTreeMap::new();
        if let Some(serde_yaml::Value::Mapping(map)) = self.driver_kwargs.get("chunks") {
            for (dim, size) in map {
                if let (Some(dim), Some(size)) = (dim.as_str(), size.as_u64()) {
                    if size > 0 {
                        chunks.insert(dim.to_string(), size as usize);
                    }
                }
            }
        }
        chunks
    }

    /// Scale and offset for a (renamed) variable, if any are declared.
    pub fn unit_transform(&self, variable: &str) -> Option<(f64, f64)> {
        let mult = self.unit_mult.get(variable).copied();
        let add = self.unit_add.get(variable).copied();
        if mult.is_none() && add.is_none() {
            return None;
        }
        Some((mult.unwrap_or(1.0), add.unwrap_or(0.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_long_names() {
        assert_eq!(DataType::parse("RasterDataset"), Some(DataType::Raster));
        assert_eq!(DataType::parse("GeoDataFrame"), Some(DataType::Vector));
        assert_eq!(DataType::parse("DataFrame"), Some(DataType::Tabular));
        assert_eq!(DataType::parse("raster"), Some(DataType::Raster));
        assert_eq!(DataType::parse("mesh"), None);
    }

    #[test]
    fn test_driver_keeps_unknown() {
        assert_eq!(Driver::parse("raster"), Driver::Raster);
        assert_eq!(Driver::parse("netcdf"), Driver::Other("netcdf".into()));
        assert_eq!(Driver::Other("netcdf".into()).to_string(), "netcdf");
    }

    #[test]
    fn test_chunk_sizes_skip_auto() {
        let mut entry = CatalogEntry::new("dem", DataType::Raster, Driver::Raster, "dem.tif");
        let chunks: serde_yaml::Value = serde_yaml::from_str("{x: 3600, y: 3600, band: auto}").unwrap();
        entry.driver_kwargs.insert("chunks".into(), chunks);

        let sizes = entry.chunk_sizes();
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes["x"], 3600);
        assert_eq!(sizes["y"], 3600);
    }

    #[test]
    fn test_unit_transform_defaults() {
        let mut entry = CatalogEntry::new("dem", DataType::Raster, Driver::Raster, "dem.tif");
        assert_eq!(entry.unit_transform("elevtn"), None);

        entry.unit_mult.insert("elevtn".into(), 0.01);
        assert_eq!(entry.unit_transform("elevtn"), Some((0.01, 0.0)));
    }

    #[test]
    fn test_nodata_per_variable() {
        let nodata: NoData = serde_yaml::from_str("{elevtn: -9999}").unwrap();
        assert_eq!(nodata.for_variable("elevtn"), Some(-9999.0));
        assert_eq!(nodata.for_variable("other"), None);
    }
}
