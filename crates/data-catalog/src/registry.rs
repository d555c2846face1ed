//! In-memory registry of catalog entries.

use std::collections::HashMap;

use tracing::{info, warn};

use catalog_common::{CatalogError, CatalogResult};

use crate::descriptor::{load_source, DescriptorSource, ParsedItem};
use crate::entry::CatalogEntry;

/// What to do when a later source redefines a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Later definition replaces the earlier one silently.
    #[default]
    Override,
    /// Later definition wins, with a warning.
    Warn,
    /// Redefinition is an error.
    Strict,
}

impl std::str::FromStr for ConflictPolicy {
    type Err = CatalogError;

    /// Case-insensitive; `error` is accepted for `strict`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "override" => Ok(Self::Override),
            "warn" => Ok(Self::Warn),
            "strict" | "error" => Ok(Self::Strict),
            other => Err(CatalogError::Config(format!(
                "unknown conflict policy '{}', expected override, warn or strict",
                other
            ))),
        }
    }
}

/// Immutable mapping from logical name to catalog entry.
///
/// Built once by folding an ordered list of descriptor sources; later
/// sources override earlier entries of the same name at whole-entry
/// granularity. Names keep the position of their first registration.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    entries: HashMap<String, CatalogEntry>,
    order: Vec<String>,
}

impl Registry {
    /// Load descriptor sources in order with the default conflict policy.
    pub fn load<I, S>(sources: I) -> CatalogResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<DescriptorSource>,
    {
        let mut builder = RegistryBuilder::new();
        for source in sources {
            builder = builder.add_source(source);
        }
        builder.build()
    }

    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Look up an entry by logical name.
    pub fn get(&self, name: &str) -> CatalogResult<&CatalogEntry> {
        self.entries
            .get(name)
            .ok_or_else(|| CatalogError::UnknownDataset(name.to_string()))
    }

    /// All registered names in load order.
    pub fn list_names(&self) -> Vec<&str> {
        self.order.iter().map(String::as_str).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Entries in load order.
    pub fn iter(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.order.iter().filter_map(|name| self.entries.get(name))
    }

    /// Fold one parsed source into the registry.
    fn merge(
        mut self,
        items: Vec<ParsedItem>,
        source: &str,
        policy: ConflictPolicy,
    ) -> CatalogResult<Self> {
        // Aliases may point at entries declared later in the same source.
        let (entries, aliases): (Vec<_>, Vec<_>) = items
            .into_iter()
            .partition(|item| matches!(item, ParsedItem::Entry(_)));

        for item in entries.into_iter().chain(aliases) {
            let entry = match item {
                ParsedItem::Entry(entry) => entry,
                ParsedItem::Alias { name, target } => {
                    let mut resolved = self
                        .entries
                        .get(&target)
                        .cloned()
                        .ok_or_else(|| {
                            CatalogError::malformed(
                                source,
                                format!("alias '{}' points at unknown dataset '{}'", name, target),
                            )
                        })?;
                    resolved.name = name;
                    resolved.source = source.to_string();
                    resolved
                }
            };
            self.insert(entry, source, policy)?;
        }

        Ok(self)
    }

    fn insert(
        &mut self,
        entry: CatalogEntry,
        source: &str,
        policy: ConflictPolicy,
    ) -> CatalogResult<()> {
        if let Some(previous) = self.entries.get(&entry.name) {
            match policy {
                ConflictPolicy::Strict => {
                    return Err(CatalogError::ConflictingEntry {
                        name: entry.name,
                        source_name: source.to_string(),
                    })
                }
                ConflictPolicy::Warn => warn!(
                    name = %entry.name,
                    previous = %previous.source,
                    source = %source,
                    "Dataset redefined, later definition wins"
                ),
                ConflictPolicy::Override => {}
            }
        } else {
            self.order.push(entry.name.clone());
        }

        self.entries.insert(entry.name.clone(), entry);
        Ok(())
    }
}

/// Builder for a [`Registry`] with explicit sources and conflict policy.
#[derive(Debug, Clone, Default)]
pub struct RegistryBuilder {
    sources: Vec<DescriptorSource>,
    policy: ConflictPolicy,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn add_source(mut self, source: impl Into<DescriptorSource>) -> Self {
        self.sources.push(source.into());
        self
    }

    pub fn add_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<DescriptorSource>,
    {
        self.sources.extend(sources.into_iter().map(Into::into));
        self
    }

    /// Parse every source, then fold them in order.
    ///
    /// A malformed source aborts the build; nothing of a failed source is
    /// ever registered.
    pub fn build(self) -> CatalogResult<Registry> {
        let policy = self.policy;
        let registry = self
            .sources
            .iter()
            .try_fold(Registry::default(), |registry, source| {
                let items = load_source(source)?;
                registry.merge(items, &source.label(), policy)
            })?;

        info!(
            sources = self.sources.len(),
            datasets = registry.len(),
            "Loaded data catalog"
        );
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOS: &str = r#"
ncei_bathymetry:
  data_type: RasterDataset
  driver: raster
  path: s3://noaa-nos-coastal-lidar-pds/dem/NCEI_ninth_Topobathy_2014_8483/northeast.vrt
  crs: 6344
  rename:
    ncei_bathymetry: elevtn
"#;

    const LYNKER: &str = r#"
dem:
  data_type: RasterDataset
  driver: raster
  path: s3://lynker-spatial/gridded-resources/dem.vrt
  crs: 5070
ncei_bathymetry:
  data_type: RasterDataset
  driver: raster
  path: s3://other-bucket/bathy.tif
  crs: 6344
"#;

    fn sources() -> Vec<DescriptorSource> {
        vec![
            DescriptorSource::inline("nos.yaml", NOS),
            DescriptorSource::inline("lynker.yaml", LYNKER),
        ]
    }

    #[test]
    fn test_last_source_wins_and_keeps_position() {
        let registry = Registry::load(sources()).unwrap();
        assert_eq!(registry.list_names(), vec!["ncei_bathymetry", "dem"]);
        assert_eq!(
            registry.get("ncei_bathymetry").unwrap().path,
            "s3://other-bucket/bathy.tif"
        );
        assert_eq!(registry.get("ncei_bathymetry").unwrap().source, "lynker.yaml");
    }

    #[test]
    fn test_strict_policy_rejects_redefinition() {
        let err = Registry::builder()
            .conflict_policy(ConflictPolicy::Strict)
            .add_sources(sources())
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            CatalogError::ConflictingEntry { ref name, .. } if name == "ncei_bathymetry"
        ));
    }

    #[test]
    fn test_warn_policy_still_overrides() {
        let registry = Registry::builder()
            .conflict_policy(ConflictPolicy::Warn)
            .add_sources(sources())
            .build()
            .unwrap();
        assert_eq!(
            registry.get("ncei_bathymetry").unwrap().path,
            "s3://other-bucket/bathy.tif"
        );
    }

    #[test]
    fn test_alias_resolves_in_same_source() {
        let yaml = "elevation:\n  alias: dem\ndem:\n  data_type: raster\n  driver: raster\n  path: s3://b/dem.tif\n";
        let registry = Registry::load([DescriptorSource::inline("a.yaml", yaml)]).unwrap();
        let alias = registry.get("elevation").unwrap();
        assert_eq!(alias.name, "elevation");
        assert_eq!(alias.path, "s3://b/dem.tif");
        assert_eq!(registry.list_names(), vec!["dem", "elevation"]);
    }

    #[test]
    fn test_dangling_alias_is_malformed() {
        let yaml = "elevation:\n  alias: nowhere\n";
        let err = Registry::load([DescriptorSource::inline("a.yaml", yaml)]).unwrap_err();
        assert!(matches!(err, CatalogError::MalformedDescriptor { .. }));
    }

    #[test]
    fn test_empty_registry() {
        let registry = Registry::load(Vec::<DescriptorSource>::new()).unwrap();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.get("dem"),
            Err(CatalogError::UnknownDataset(_))
        ));
    }

    #[test]
    fn test_conflict_policy_from_str() {
        assert_eq!("WARN".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::Warn);
        assert_eq!("strict".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::Strict);
        assert_eq!("Override".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::Override);
        assert!(matches!(
            "overide".parse::<ConflictPolicy>(),
            Err(CatalogError::Config(ref m)) if m.contains("overide")
        ));
    }
}
