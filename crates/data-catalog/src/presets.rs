//! Catalogs shipped with the workspace.

use std::path::{Path, PathBuf};

/// NOS coastal topobathymetry catalog, relative to the catalogs directory.
pub const NOS_COASTAL_LIDAR: &str = "nos/coastal_lidar.yaml";

/// Lynker-Spatial gridded resources catalog, relative to the catalogs directory.
pub const LYNKER_GRIDDED_DATA: &str = "lynker_spatial/gridded_data.yaml";

/// Predefined catalog files in load order: NOS first, Lynker-Spatial second,
/// so Lynker definitions win on name collisions.
pub fn predefined_catalogs(catalog_dir: impl AsRef<Path>) -> Vec<PathBuf> {
    let dir = catalog_dir.as_ref();
    vec![dir.join(NOS_COASTAL_LIDAR), dir.join(LYNKER_GRIDDED_DATA)]
}

/// Directory holding the shipped catalogs (`data/data_catalogs` at the
/// workspace root), overridable with `CATALOG_DATA_DIR`.
pub fn default_catalog_dir() -> PathBuf {
    std::env::var("CATALOG_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            Path::new(env!("CARGO_MANIFEST_DIR"))
                .join("../../data/data_catalogs")
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predefined_order() {
        let paths = predefined_catalogs("/catalogs");
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/catalogs/nos/coastal_lidar.yaml"),
                PathBuf::from("/catalogs/lynker_spatial/gridded_data.yaml"),
            ]
        );
    }
}
