//! Common types shared across the coastal data catalog crates.

pub mod bbox;
pub mod crs;
pub mod error;

pub use bbox::BoundingBox;
pub use crs::Crs;
pub use error::{CatalogError, CatalogResult};
