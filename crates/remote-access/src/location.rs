//! Storage location parsing.
//!
//! Catalog paths come in several spellings: object-store URIs
//! (`s3://bucket/key`, `https://host/key`), GDAL virtual-filesystem prefixes
//! used inside VRT files (`/vsis3/bucket/key`, `/vsicurl/https://...`), plain
//! local paths and `memory://` locations backed by stores registered in
//! process. All of them are normalised to a [`StorageLocation`].

use std::fmt;
use std::path::{Component, PathBuf};

use catalog_common::{CatalogError, CatalogResult};

/// Storage backend addressed by a location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Local,
    S3,
    Http,
    Https,
    Memory,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Local => "file",
            Scheme::S3 => "s3",
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Memory => "memory",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed storage location.
///
/// `bucket` is the S3 bucket, the HTTP authority, or the in-memory store
/// name; it is empty for local files. `key` is the object key (without a
/// leading slash), or the absolute filesystem path for local files.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageLocation {
    pub scheme: Scheme,
    pub bucket: String,
    pub key: String,
}

impl StorageLocation {
    pub fn parse(raw: &str) -> CatalogResult<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(CatalogError::InvalidAsset {
                location: String::new(),
                message: "empty storage path".to_string(),
            });
        }

        if let Some(rest) = raw.strip_prefix("/vsis3/") {
            return Self::bucket_key(Scheme::S3, rest, raw);
        }
        if let Some(rest) = raw.strip_prefix("/vsicurl/") {
            return Self::parse(rest);
        }

        if let Some((scheme, rest)) = raw.split_once("://") {
            return match scheme.to_lowercase().as_str() {
                "s3" | "s3a" => Self::bucket_key(Scheme::S3, rest, raw),
                "http" => Self::bucket_key(Scheme::Http, rest, raw),
                "https" => Self::bucket_key(Scheme::Https, rest, raw),
                "memory" => Self::bucket_key(Scheme::Memory, rest, raw),
                "file" => Ok(Self::local(PathBuf::from(rest))),
                other => Err(CatalogError::UnsupportedFormat(format!(
                    "storage scheme '{}' in {}",
                    other, raw
                ))),
            };
        }

        let path = PathBuf::from(raw);
        let path = if path.is_absolute() {
            path
        } else {
            std::env::current_dir()?.join(path)
        };
        Ok(Self::local(path))
    }

    fn bucket_key(scheme: Scheme, rest: &str, raw: &str) -> CatalogResult<Self> {
        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(CatalogError::InvalidAsset {
                location: raw.to_string(),
                message: format!("missing {} bucket or host", scheme),
            });
        }
        Ok(Self {
            scheme,
            bucket: bucket.to_string(),
            key: normalize(key.trim_start_matches('/')),
        })
    }

    fn local(path: PathBuf) -> Self {
        Self {
            scheme: Scheme::Local,
            bucket: String::new(),
            key: normalize(&path.to_string_lossy()),
        }
    }

    /// Resolve a reference found inside this object (a VRT source filename).
    ///
    /// Absolute URIs, GDAL prefixes and absolute local paths stand alone;
    /// anything else is taken relative to this object's directory.
    pub fn join_relative(&self, reference: &str) -> CatalogResult<Self> {
        let reference = reference.trim();
        if reference.contains("://") || reference.starts_with("/vsi") {
            return Self::parse(reference);
        }
        if reference.starts_with('/') && self.scheme == Scheme::Local {
            return Self::parse(reference);
        }

        let dir = match self.key.rfind('/') {
            Some(idx) => &self.key[..idx],
            None => "",
        };
        let joined = if dir.is_empty() {
            reference.to_string()
        } else {
            format!("{}/{}", dir, reference)
        };

        Ok(Self {
            scheme: self.scheme,
            bucket: self.bucket.clone(),
            key: normalize(&joined),
        })
    }

    /// File extension of the key, lower-cased.
    pub fn extension(&self) -> Option<String> {
        let name = self.key.rsplit('/').next()?;
        let (_, ext) = name.rsplit_once('.')?;
        Some(ext.to_lowercase())
    }

    /// Identity of the store serving this location.
    pub fn store_url(&self) -> String {
        match self.scheme {
            Scheme::Local => "file://".to_string(),
            _ => format!("{}://{}", self.scheme, self.bucket),
        }
    }

    /// Path of the object within its store.
    pub fn object_path(&self) -> CatalogResult<object_store::path::Path> {
        match self.scheme {
            Scheme::Local => object_store::path::Path::from_filesystem_path(&self.key).map_err(
                |e| CatalogError::RemoteAccess {
                    location: self.to_string(),
                    message: e.to_string(),
                    attempts: 1,
                },
            ),
            _ => Ok(object_store::path::Path::from(self.key.as_str())),
        }
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            Scheme::Local => f.write_str(&self.key),
            _ => write!(f, "{}://{}/{}", self.scheme, self.bucket, self.key),
        }
    }
}

/// Collapse `.` and `..` segments and duplicate separators.
fn normalize(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for component in std::path::Path::new(path).components() {
        match component {
            Component::ParentDir => {
                parts.pop();
            }
            Component::Normal(part) => {
                if let Some(part) = part.to_str() {
                    parts.push(part);
                }
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_s3() {
        let loc = StorageLocation::parse("s3://noaa-nos-coastal-lidar-pds/dem/a/b.vrt").unwrap();
        assert_eq!(loc.scheme, Scheme::S3);
        assert_eq!(loc.bucket, "noaa-nos-coastal-lidar-pds");
        assert_eq!(loc.key, "dem/a/b.vrt");
        assert_eq!(loc.to_string(), "s3://noaa-nos-coastal-lidar-pds/dem/a/b.vrt");
        assert_eq!(loc.extension().as_deref(), Some("vrt"));
    }

    #[test]
    fn test_parse_gdal_prefixes() {
        let s3 = StorageLocation::parse("/vsis3/prd-tnm/StagedProducts/x.tif").unwrap();
        assert_eq!(s3.scheme, Scheme::S3);
        assert_eq!(s3.bucket, "prd-tnm");

        let curl = StorageLocation::parse("/vsicurl/https://example.com/data/x.tif").unwrap();
        assert_eq!(curl.scheme, Scheme::Https);
        assert_eq!(curl.bucket, "example.com");
        assert_eq!(curl.key, "data/x.tif");
    }

    #[test]
    fn test_parse_local() {
        let loc = StorageLocation::parse("/data/dem/../dem.tif").unwrap();
        assert_eq!(loc.scheme, Scheme::Local);
        assert_eq!(loc.key, "/data/dem.tif");
        assert_eq!(loc.store_url(), "file://");

        let file = StorageLocation::parse("file:///data/dem.tif").unwrap();
        assert_eq!(file.key, "/data/dem.tif");
    }

    #[test]
    fn test_unknown_scheme() {
        assert!(matches!(
            StorageLocation::parse("gs://bucket/key"),
            Err(CatalogError::UnsupportedFormat(_))
        ));
        assert!(StorageLocation::parse("s3:///key").is_err());
    }

    #[test]
    fn test_join_relative() {
        let vrt = StorageLocation::parse("s3://bucket/dem/mosaic.vrt").unwrap();

        let sibling = vrt.join_relative("tiles/a.tif").unwrap();
        assert_eq!(sibling.to_string(), "s3://bucket/dem/tiles/a.tif");

        let parent = vrt.join_relative("../other/b.tif").unwrap();
        assert_eq!(parent.to_string(), "s3://bucket/other/b.tif");

        let absolute = vrt.join_relative("/vsis3/elsewhere/c.tif").unwrap();
        assert_eq!(absolute.bucket, "elsewhere");
    }

    #[test]
    fn test_join_relative_at_bucket_root() {
        let vrt = StorageLocation::parse("memory://bucket/mosaic.vrt").unwrap();
        let member = vrt.join_relative("a.tif").unwrap();
        assert_eq!(member.to_string(), "memory://bucket/a.tif");
    }
}
