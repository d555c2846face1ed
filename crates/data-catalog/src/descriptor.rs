//! Descriptor parsing.
//!
//! A descriptor is a YAML document declaring catalog entries in one of two
//! shapes:
//!
//! ```yaml
//! # mapping form (HydroMT style): keys are logical names
//! meta:
//!   root: s3://lynker-spatial/gridded-resources
//! dem:
//!   data_type: RasterDataset
//!   driver: raster
//!   path: dem.vrt
//!   crs: 5070
//!
//! # list form: every item names itself
//! - name: dem
//!   data_type: raster
//!   driver: raster
//!   path: s3://lynker-spatial/gridded-resources/dem.vrt
//! ```
//!
//! `${VAR}` and `${VAR:-default}` references are expanded before parsing.
//! Relative paths resolve against `meta.root`, or against the descriptor's
//! own directory when no root is given.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use tracing::debug;

use catalog_common::{CatalogError, CatalogResult, Crs};

use crate::entry::{CatalogEntry, DataType, Driver, NoData, Provenance, StorageOptions};

/// Where a descriptor comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum DescriptorSource {
    /// A YAML file on the local filesystem.
    File(PathBuf),
    /// YAML text held in memory; `base` plays the role of the file's directory.
    Inline {
        name: String,
        text: String,
        base: Option<String>,
    },
}

impl DescriptorSource {
    pub fn inline(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::Inline {
            name: name.into(),
            text: text.into(),
            base: None,
        }
    }

    /// Human readable label used in errors and logs.
    pub fn label(&self) -> String {
        match self {
            Self::File(path) => path.display().to_string(),
            Self::Inline { name, .. } => name.clone(),
        }
    }

    fn base_dir(&self) -> Option<String> {
        match self {
            Self::File(path) => path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(|p| p.display().to_string()),
            Self::Inline { base, .. } => base.clone(),
        }
    }

    fn read(&self) -> CatalogResult<String> {
        match self {
            Self::File(path) => std::fs::read_to_string(path).map_err(|e| {
                CatalogError::malformed(self.label(), format!("cannot read descriptor: {}", e))
            }),
            Self::Inline { text, .. } => Ok(text.clone()),
        }
    }
}

impl From<PathBuf> for DescriptorSource {
    fn from(path: PathBuf) -> Self {
        Self::File(path)
    }
}

impl From<&Path> for DescriptorSource {
    fn from(path: &Path) -> Self {
        Self::File(path.to_path_buf())
    }
}

impl From<&str> for DescriptorSource {
    fn from(path: &str) -> Self {
        Self::File(PathBuf::from(path))
    }
}

impl From<String> for DescriptorSource {
    fn from(path: String) -> Self {
        Self::File(PathBuf::from(path))
    }
}

/// One parsed item of a descriptor.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedItem {
    Entry(CatalogEntry),
    /// `name` resolves to the entry registered as `target`.
    Alias { name: String, target: String },
}

impl ParsedItem {
    pub fn name(&self) -> &str {
        match self {
            Self::Entry(entry) => &entry.name,
            Self::Alias { name, .. } => name,
        }
    }
}

/// Raw per-entry fields as written in YAML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawEntry {
    name: Option<String>,
    alias: Option<String>,
    data_type: Option<String>,
    driver: Option<String>,
    driver_kwargs: BTreeMap<String, Value>,
    crs: Option<Crs>,
    path: Option<String>,
    rename: BTreeMap<String, String>,
    nodata: Option<NoData>,
    unit_mult: BTreeMap<String, f64>,
    unit_add: BTreeMap<String, f64>,
    storage_options: StorageOptions,
    meta: Provenance,
}

/// Catalog-wide metadata block.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CatalogMeta {
    root: Option<String>,
}

/// Read and parse a descriptor source.
pub fn load_source(source: &DescriptorSource) -> CatalogResult<Vec<ParsedItem>> {
    let text = source.read()?;
    parse_descriptor(&text, source)
}

/// Parse descriptor text into entries and aliases, in declaration order.
///
/// The whole source is rejected on the first malformed item.
pub fn parse_descriptor(text: &str, source: &DescriptorSource) -> CatalogResult<Vec<ParsedItem>> {
    let label = source.label();
    let expanded = expand_env_vars(text).map_err(|e| CatalogError::malformed(&label, e))?;

    let document: Value = serde_yaml::from_str(&expanded)
        .map_err(|e| CatalogError::malformed(&label, format!("invalid YAML: {}", e)))?;

    let (meta, items) = match document {
        Value::Null => (CatalogMeta::default(), Vec::new()),
        Value::Sequence(seq) => (CatalogMeta::default(), list_items(seq, &label)?),
        Value::Mapping(map) => mapping_items(map, &label)?,
        other => {
            return Err(CatalogError::malformed(
                &label,
                format!("expected a mapping or a list of entries, found {}", kind(&other)),
            ))
        }
    };

    let root = resolve_root(meta.root.as_deref(), source.base_dir().as_deref());

    let parsed = items
        .into_iter()
        .map(|(name, raw)| build_item(name, raw, root.as_deref(), &label))
        .collect::<CatalogResult<Vec<_>>>()?;

    debug!(source = %label, entries = parsed.len(), "Parsed descriptor");
    Ok(parsed)
}

fn list_items(seq: Vec<Value>, label: &str) -> CatalogResult<Vec<(String, RawEntry)>> {
    seq.into_iter()
        .enumerate()
        .map(|(idx, value)| {
            let raw = raw_entry(value, label, &format!("item {}", idx))?;
            let name = raw
                .name
                .clone()
                .filter(|n| !n.trim().is_empty())
                .ok_or_else(|| {
                    CatalogError::malformed(label, format!("item {} is missing 'name'", idx))
                })?;
            Ok((name, raw))
        })
        .collect()
}

fn mapping_items(
    map: Mapping,
    label: &str,
) -> CatalogResult<(CatalogMeta, Vec<(String, RawEntry)>)> {
    let mut meta = CatalogMeta::default();
    let mut items = Vec::with_capacity(map.len());

    for (key, value) in map {
        let name = key
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| CatalogError::malformed(label, "entry names must be strings"))?;

        if name == "meta" {
            meta = serde_yaml::from_value(value).map_err(|e| {
                CatalogError::malformed(label, format!("invalid catalog meta: {}", e))
            })?;
            continue;
        }

        let raw = raw_entry(value, label, &name)?;
        if let Some(inner) = &raw.name {
            if inner != &name {
                return Err(CatalogError::malformed(
                    label,
                    format!("entry '{}' declares a different name '{}'", name, inner),
                ));
            }
        }
        items.push((name, raw));
    }

    Ok((meta, items))
}

fn raw_entry(value: Value, label: &str, what: &str) -> CatalogResult<RawEntry> {
    if !value.is_mapping() {
        return Err(CatalogError::malformed(
            label,
            format!("{} must be a mapping, found {}", what, kind(&value)),
        ));
    }
    serde_yaml::from_value(value)
        .map_err(|e| CatalogError::malformed(label, format!("{}: {}", what, e)))
}

fn build_item(
    name: String,
    raw: RawEntry,
    root: Option<&str>,
    label: &str,
) -> CatalogResult<ParsedItem> {
    if let Some(target) = raw.alias {
        return Ok(ParsedItem::Alias { name, target });
    }

    let missing = |field: &str| {
        CatalogError::malformed(label, format!("entry '{}' is missing '{}'", name, field))
    };

    let data_type_raw = raw.data_type.ok_or_else(|| missing("data_type"))?;
    let data_type = DataType::parse(&data_type_raw).ok_or_else(|| {
        CatalogError::malformed(
            label,
            format!("entry '{}' has unknown data_type '{}'", name, data_type_raw),
        )
    })?;
    let driver = raw
        .driver
        .filter(|d| !d.trim().is_empty())
        .map(|d| Driver::parse(&d))
        .ok_or_else(|| missing("driver"))?;
    let path = raw
        .path
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| missing("path"))?;

    Ok(ParsedItem::Entry(CatalogEntry {
        path: resolve_path(&path, root),
        name,
        data_type,
        driver,
        driver_kwargs: raw.driver_kwargs,
        crs: raw.crs,
        rename: raw.rename,
        nodata: raw.nodata,
        unit_mult: raw.unit_mult,
        unit_add: raw.unit_add,
        storage_options: raw.storage_options,
        meta: raw.meta,
        source: label.to_string(),
    }))
}

/// True for `scheme://...` URIs.
pub fn is_uri(path: &str) -> bool {
    match path.find("://") {
        Some(idx) => idx > 0 && path[..idx].chars().all(|c| c.is_ascii_alphanumeric() || c == '+'),
        None => false,
    }
}

fn resolve_root(root: Option<&str>, base: Option<&str>) -> Option<String> {
    match (root, base) {
        (Some(root), Some(base)) if !is_uri(root) && !Path::new(root).is_absolute() => {
            Some(join(base, root))
        }
        (Some(root), _) => Some(root.to_string()),
        (None, base) => base.map(str::to_string),
    }
}

/// Resolve an entry path against the catalog root.
pub fn resolve_path(path: &str, root: Option<&str>) -> String {
    if is_uri(path) || Path::new(path).is_absolute() {
        return path.to_string();
    }
    match root {
        Some(root) => join(root, path),
        None => path.to_string(),
    }
}

fn join(base: &str, rel: &str) -> String {
    if is_uri(base) {
        format!("{}/{}", base.trim_end_matches('/'), rel.trim_start_matches("./"))
    } else {
        Path::new(base).join(rel).display().to_string()
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a list",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

/// Expand environment variables in descriptor text.
/// Supports ${VAR} and ${VAR:-default} syntax
fn expand_env_vars(content: &str) -> Result<String, String> {
    let mut result = String::with_capacity(content.len());
    let mut chars = content.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' || chars.peek() != Some(&'{') {
            result.push(ch);
            continue;
        }
        chars.next(); // consume '{'

        let mut var_expr = String::new();
        let mut closed = false;
        for c in chars.by_ref() {
            if c == '}' {
                closed = true;
                break;
            }
            var_expr.push(c);
        }
        if !closed {
            return Err(format!("unterminated variable reference '${{{}'", var_expr));
        }

        let (var_name, default) = match var_expr.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (var_expr.as_str(), None),
        };

        match (std::env::var(var_name), default) {
            (Ok(value), _) => result.push_str(&value),
            (Err(_), Some(default)) => result.push_str(default),
            (Err(_), None) => {
                return Err(format!("environment variable '{}' is not set", var_name))
            }
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inline(text: &str) -> DescriptorSource {
        DescriptorSource::inline("test.yaml", text)
    }

    fn entry(item: &ParsedItem) -> &CatalogEntry {
        match item {
            ParsedItem::Entry(entry) => entry,
            ParsedItem::Alias { .. } => panic!("expected an entry"),
        }
    }

    #[test]
    fn test_mapping_form_with_root() {
        let yaml = r#"
meta:
  root: s3://lynker-spatial/gridded-resources
dem:
  data_type: RasterDataset
  driver: raster
  path: dem.vrt
  crs: 5070
"#;
        let items = parse_descriptor(yaml, &inline(yaml)).unwrap();
        assert_eq!(items.len(), 1);
        let dem = entry(&items[0]);
        assert_eq!(dem.name, "dem");
        assert_eq!(dem.path, "s3://lynker-spatial/gridded-resources/dem.vrt");
        assert_eq!(dem.crs, Some(Crs::Epsg(5070)));
    }

    #[test]
    fn test_list_form_requires_name() {
        let yaml = "- data_type: raster\n  driver: raster\n  path: a.tif\n";
        let err = parse_descriptor(yaml, &inline(yaml)).unwrap_err();
        assert!(matches!(err, CatalogError::MalformedDescriptor { .. }));
        assert!(err.to_string().contains("missing 'name'"));
    }

    #[test]
    fn test_missing_driver() {
        let yaml = "dem:\n  data_type: raster\n  path: dem.tif\n";
        let err = parse_descriptor(yaml, &inline(yaml)).unwrap_err();
        assert!(err.to_string().contains("missing 'driver'"));
    }

    #[test]
    fn test_relative_path_uses_file_directory() {
        let source = DescriptorSource::File(PathBuf::from("/data/catalogs/nos/coastal_lidar.yaml"));
        let yaml = "dem:\n  data_type: raster\n  driver: raster\n  path: tiles/dem.tif\n";
        let items = parse_descriptor(yaml, &source).unwrap();
        assert_eq!(entry(&items[0]).path, "/data/catalogs/nos/tiles/dem.tif");
    }

    #[test]
    fn test_absolute_uri_untouched() {
        assert_eq!(
            resolve_path("s3://noaa-nos/dem.vrt", Some("/tmp")),
            "s3://noaa-nos/dem.vrt"
        );
        assert_eq!(resolve_path("/abs/dem.tif", Some("s3://b")), "/abs/dem.tif");
        assert_eq!(resolve_path("dem.tif", Some("s3://b/")), "s3://b/dem.tif");
    }

    #[test]
    fn test_alias_item() {
        let yaml = "elevation:\n  alias: dem\n";
        let items = parse_descriptor(yaml, &inline(yaml)).unwrap();
        assert_eq!(
            items[0],
            ParsedItem::Alias {
                name: "elevation".into(),
                target: "dem".into()
            }
        );
    }

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("CATALOG_TEST_BUCKET", "noaa-nos-coastal-lidar-pds");
        let expanded = expand_env_vars("root: s3://${CATALOG_TEST_BUCKET}/${MISSING_PREFIX:-dem}").unwrap();
        assert_eq!(expanded, "root: s3://noaa-nos-coastal-lidar-pds/dem");

        assert!(expand_env_vars("${CATALOG_TEST_SURELY_UNSET_VAR}").is_err());
        assert!(expand_env_vars("${UNTERMINATED").is_err());
    }

    #[test]
    fn test_is_uri() {
        assert!(is_uri("s3://bucket/key"));
        assert!(is_uri("https://host/x.tif"));
        assert!(!is_uri("relative/path.tif"));
        assert!(!is_uri("://nothing"));
    }
}
