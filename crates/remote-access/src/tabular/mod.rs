//! Tabular and vector handles: Parquet tables and GeoJSON feature
//! collections.

pub mod geojson;
pub mod parquet;

pub use geojson::{Feature, FeatureCollection, VectorDataset};
pub use parquet::TabularDataset;
