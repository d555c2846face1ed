//! Data catalog: declarative dataset descriptors and the registry that
//! resolves logical dataset names to them.
//!
//! ```ignore
//! use data_catalog::{presets, Registry};
//!
//! let registry = Registry::load(presets::predefined_catalogs(presets::default_catalog_dir()))?;
//! let dem = registry.get("dem")?;
//! println!("{} -> {}", dem.name, dem.path);
//! ```

pub mod descriptor;
pub mod entry;
pub mod presets;
pub mod registry;

pub use descriptor::{is_uri, parse_descriptor, DescriptorSource, ParsedItem};
pub use entry::{CatalogEntry, DataType, Driver, NoData, Provenance, StorageOptions};
pub use registry::{ConflictPolicy, Registry, RegistryBuilder};
