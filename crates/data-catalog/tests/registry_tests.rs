//! Registry loading against descriptor files on disk.

use std::fs;
use std::path::PathBuf;

use catalog_common::{BoundingBox, CatalogError, Crs};
use data_catalog::{
    presets, ConflictPolicy, DataType, DescriptorSource, Driver, NoData, Registry,
};
use tempfile::TempDir;

fn write(dir: &TempDir, name: &str, text: &str) -> PathBuf {
    let path = dir.path().join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, text).unwrap();
    path
}

const FULL_ENTRY: &str = r#"
ncei_bathymetry:
  data_type: RasterDataset
  driver: raster
  path: s3://bucket/dem.vrt
  crs: 6344
  driver_kwargs:
    chunks:
      x: 3600
      y: 1800
  rename:
    ncei_bathymetry: elevtn
  nodata: -9999.0
  unit_mult:
    elevtn: 0.5
  unit_add:
    elevtn: 1.0
  storage_options:
    anon: true
    region: us-east-1
  meta:
    category: topography
    source_license: Public Domain
    source_url: https://coast.noaa.gov/dataviewer
    source_version: "2014"
    extent: [-98.0, 25.0, -93.5, 30.5]
    notes: ninth arc-second topobathy
"#;

// ============================================================================
// Round-trip fidelity
// ============================================================================

#[test]
fn test_every_field_round_trips() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "nos.yaml", FULL_ENTRY);

    let registry = Registry::load([path.clone()]).unwrap();
    let entry = registry.get("ncei_bathymetry").unwrap();

    assert_eq!(entry.name, "ncei_bathymetry");
    assert_eq!(entry.data_type, DataType::Raster);
    assert_eq!(entry.driver, Driver::Raster);
    assert_eq!(entry.path, "s3://bucket/dem.vrt");
    assert_eq!(entry.crs, Some(Crs::Epsg(6344)));
    assert_eq!(entry.chunk_sizes()["x"], 3600);
    assert_eq!(entry.chunk_sizes()["y"], 1800);
    assert_eq!(entry.rename["ncei_bathymetry"], "elevtn");
    assert_eq!(entry.nodata, Some(NoData::Value(-9999.0)));
    assert_eq!(entry.unit_transform("elevtn"), Some((0.5, 1.0)));
    assert_eq!(entry.storage_options.anon, Some(true));
    assert_eq!(entry.storage_options.region.as_deref(), Some("us-east-1"));
    assert_eq!(entry.category(), Some("topography"));
    assert_eq!(entry.meta.license.as_deref(), Some("Public Domain"));
    assert_eq!(
        entry.meta.source_url.as_deref(),
        Some("https://coast.noaa.gov/dataviewer")
    );
    assert_eq!(entry.meta.version.as_deref(), Some("2014"));
    assert_eq!(
        entry.meta.extent,
        Some(BoundingBox::new(-98.0, 25.0, -93.5, 30.5))
    );
    assert!(entry.meta.extra.contains_key("notes"));
    assert_eq!(entry.source, path.display().to_string());
}

#[test]
fn test_list_form_matches_mapping_form() {
    let dir = TempDir::new().unwrap();
    let mapping = write(
        &dir,
        "mapping.yaml",
        "dem:\n  data_type: raster\n  driver: raster\n  path: s3://b/dem.tif\n  crs: 5070\n",
    );
    let list = write(
        &dir,
        "list.yaml",
        "- name: dem\n  data_type: raster\n  driver: raster\n  path: s3://b/dem.tif\n  crs: EPSG:5070\n",
    );

    let a = Registry::load([mapping]).unwrap();
    let b = Registry::load([list]).unwrap();

    let mut entry_a = a.get("dem").unwrap().clone();
    let mut entry_b = b.get("dem").unwrap().clone();
    entry_a.source.clear();
    entry_b.source.clear();
    assert_eq!(entry_a, entry_b);
}

// ============================================================================
// Override determinism
// ============================================================================

#[test]
fn test_later_source_overrides() {
    let dir = TempDir::new().unwrap();
    let a = write(
        &dir,
        "a.yaml",
        "dem:\n  data_type: raster\n  driver: raster\n  path: s3://a/dem.tif\n",
    );
    let b = write(
        &dir,
        "b.yaml",
        "dem:\n  data_type: raster\n  driver: raster\n  path: s3://b/dem.tif\n",
    );

    let ab = Registry::load([a.clone(), b.clone()]).unwrap();
    assert_eq!(ab.get("dem").unwrap().path, "s3://b/dem.tif");

    let ba = Registry::load([b, a]).unwrap();
    assert_eq!(ba.get("dem").unwrap().path, "s3://a/dem.tif");
}

#[test]
fn test_unknown_name_never_defaults() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "nos.yaml", FULL_ENTRY);
    let registry = Registry::load([path]).unwrap();

    for name in ["", "dem", "NCEI_BATHYMETRY", "ncei_bathymetry "] {
        assert!(matches!(
            registry.get(name),
            Err(CatalogError::UnknownDataset(ref n)) if n == name
        ));
    }
}

// ============================================================================
// Malformed descriptors
// ============================================================================

#[test]
fn test_missing_path_registers_nothing() {
    let dir = TempDir::new().unwrap();
    let good = write(
        &dir,
        "good.yaml",
        "dem:\n  data_type: raster\n  driver: raster\n  path: s3://a/dem.tif\n",
    );
    let bad = write(
        &dir,
        "bad.yaml",
        "first:\n  data_type: raster\n  driver: raster\n  path: s3://a/x.tif\nbroken:\n  data_type: raster\n  driver: raster\n",
    );

    let err = Registry::load([good, bad]).unwrap_err();
    match err {
        CatalogError::MalformedDescriptor { message, .. } => {
            assert!(message.contains("'broken'"));
            assert!(message.contains("'path'"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_unreadable_file_is_malformed() {
    let err = Registry::load(["/definitely/not/here.yaml"]).unwrap_err();
    assert!(matches!(err, CatalogError::MalformedDescriptor { .. }));
}

#[test]
fn test_invalid_yaml_is_malformed() {
    let source = DescriptorSource::inline("broken.yaml", "dem: [unclosed");
    let err = Registry::load([source]).unwrap_err();
    assert!(matches!(err, CatalogError::MalformedDescriptor { .. }));
}

#[test]
fn test_strict_policy_from_builder() {
    let a = DescriptorSource::inline("a.yaml", "dem:\n  data_type: raster\n  driver: raster\n  path: a.tif\n");
    let b = DescriptorSource::inline("b.yaml", "dem:\n  data_type: raster\n  driver: raster\n  path: b.tif\n");
    let result = Registry::builder()
        .conflict_policy(ConflictPolicy::Strict)
        .add_source(a)
        .add_source(b)
        .build();
    assert!(matches!(result, Err(CatalogError::ConflictingEntry { .. })));
}

// ============================================================================
// Shipped catalogs
// ============================================================================

#[test]
fn test_shipped_catalogs_load() {
    let registry = Registry::load(presets::predefined_catalogs(presets::default_catalog_dir())).unwrap();

    assert_eq!(
        registry.list_names(),
        vec![
            "ncei_bathymetry",
            "dem",
            "USGS_seamless_13",
            "hydrofabric_flowpath_attributes"
        ]
    );

    let dem = registry.get("dem").unwrap();
    assert!(dem.path.ends_with("/dem.vrt"));
    assert_eq!(dem.renamed("dem"), "elevtn");

    let bathy = registry.get("ncei_bathymetry").unwrap();
    assert_eq!(bathy.crs, Some(Crs::Epsg(6344)));
    assert!(bathy
        .path
        .starts_with("s3://noaa-nos-coastal-lidar-pds/dem/"));

    let attrs = registry.get("hydrofabric_flowpath_attributes").unwrap();
    assert_eq!(attrs.driver, Driver::Parquet);
    assert_eq!(attrs.data_type, DataType::Tabular);
}
