//! GeoJSON feature collections.
//!
//! Opening only checks the object exists (one HEAD). The document is fetched
//! and parsed on `collect`, where properties are renamed and features can be
//! filtered by bounding box.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use catalog_common::{BoundingBox, CatalogError, CatalogResult, Crs};
use data_catalog::CatalogEntry;

use crate::accessor::resolve_crs;
use crate::reader::{ObjectReader, RangeReader};

/// One feature with renamed properties.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Feature {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub geometry: Option<Value>,
    pub properties: Map<String, Value>,
}

impl Feature {
    /// Extent of the geometry's coordinates.
    pub fn bbox(&self) -> Option<BoundingBox> {
        let mut extent: Option<BoundingBox> = None;
        if let Some(geometry) = &self.geometry {
            visit_positions(geometry, &mut |x, y| {
                let point = BoundingBox::new(x, y, x, y);
                extent = Some(match extent {
                    Some(e) => e.union(&point),
                    None => point,
                });
            });
        }
        extent
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }
}

/// Parsed features plus the CRS they are expressed in.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureCollection {
    pub crs: Option<Crs>,
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

/// Walk every coordinate pair of a geometry.
fn visit_positions(geometry: &Value, f: &mut dyn FnMut(f64, f64)) {
    match geometry.get("type").and_then(Value::as_str) {
        Some("GeometryCollection") => {
            if let Some(Value::Array(parts)) = geometry.get("geometries") {
                for part in parts {
                    visit_positions(part, f);
                }
            }
        }
        Some(_) => {
            if let Some(coords) = geometry.get("coordinates") {
                visit_coordinates(coords, f);
            }
        }
        None => {}
    }
}

fn visit_coordinates(coords: &Value, f: &mut dyn FnMut(f64, f64)) {
    let Value::Array(items) = coords else {
        return;
    };
    match (items.first().and_then(Value::as_f64), items.get(1).and_then(Value::as_f64)) {
        (Some(x), Some(y)) => f(x, y),
        _ => {
            for item in items {
                visit_coordinates(item, f);
            }
        }
    }
}

/// CRS from a legacy (pre-RFC 7946) `crs` member.
fn legacy_crs(doc: &Value) -> Option<Crs> {
    let name = doc
        .get("crs")?
        .get("properties")?
        .get("name")?
        .as_str()?;
    Crs::parse(name).ok()
}

fn inclusive_overlap(a: &BoundingBox, b: &BoundingBox) -> bool {
    a.min_x <= b.max_x && a.max_x >= b.min_x && a.min_y <= b.max_y && a.max_y >= b.min_y
}

/// Lazy handle over a GeoJSON document.
#[derive(Debug, Clone)]
pub struct VectorDataset {
    name: String,
    reader: ObjectReader,
    size: u64,
    rename: BTreeMap<String, String>,
    declared_crs: Option<Crs>,
    strict_crs: bool,
}

impl VectorDataset {
    /// Open `entry`; with `strict_crs`, a document `crs` member that
    /// disagrees with the entry fails `collect`.
    #[instrument(skip(entry, reader), fields(dataset = %entry.name, location = %reader.location()))]
    pub async fn open(entry: &CatalogEntry, reader: ObjectReader, strict_crs: bool) -> CatalogResult<Self> {
        let size = reader.size().await?;
        Ok(Self {
            name: entry.name.clone(),
            reader,
            size,
            rename: entry.rename.clone(),
            declared_crs: entry.crs.clone(),
            strict_crs,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn location(&self) -> &str {
        self.reader.location()
    }

    /// Object size in bytes, known from the open.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// CRS declared by the catalog entry.
    pub fn declared_crs(&self) -> Option<&Crs> {
        self.declared_crs.as_ref()
    }

    /// CRS embedded in the document, if it carries a legacy `crs` member.
    /// Fetches the document.
    pub async fn embedded_crs(&self) -> CatalogResult<Option<Crs>> {
        Ok(legacy_crs(&self.fetch().await?))
    }

    async fn fetch(&self) -> CatalogResult<Value> {
        let bytes = self.reader.read_all().await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            CatalogError::invalid_asset(self.location(), format!("invalid GeoJSON: {}", e))
        })
    }

    /// Fetch, parse and rename. With `bbox`, keep only features whose
    /// geometry extent touches it.
    ///
    /// The returned CRS is the entry's declared CRS when present, else the
    /// document's legacy `crs` member, else WGS 84. A legacy member that
    /// disagrees with the declared CRS is checked like a raster header.
    #[instrument(skip(self), fields(dataset = %self.name))]
    pub async fn collect(&self, bbox: Option<&BoundingBox>) -> CatalogResult<FeatureCollection> {
        let doc = self.fetch().await?;
        let crs = resolve_crs(
            self.declared_crs.as_ref(),
            legacy_crs(&doc).as_ref(),
            self.strict_crs,
            self.location(),
        )?
        .or(Some(Crs::Epsg(4326)));

        let raw_features: Vec<&Value> = match doc.get("type").and_then(Value::as_str) {
            Some("FeatureCollection") => doc
                .get("features")
                .and_then(Value::as_array)
                .map(|features| features.iter().collect())
                .unwrap_or_default(),
            Some("Feature") => vec![&doc],
            other => {
                return Err(CatalogError::invalid_asset(
                    self.location(),
                    format!("unexpected GeoJSON type {:?}", other),
                ))
            }
        };

        let total = raw_features.len();
        let mut features = Vec::with_capacity(total);
        for raw in raw_features {
            let feature = self.to_feature(raw);
            if let Some(bbox) = bbox {
                match feature.bbox() {
                    Some(extent) if inclusive_overlap(&extent, bbox) => {}
                    _ => continue,
                }
            }
            features.push(feature);
        }

        debug!(total = total, kept = features.len(), "Parsed GeoJSON");

        Ok(FeatureCollection { crs, features })
    }

    fn to_feature(&self, raw: &Value) -> Feature {
        let properties = raw
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| {
                props
                    .iter()
                    .map(|(key, value)| {
                        let key = self.rename.get(key).cloned().unwrap_or_else(|| key.clone());
                        (key, value.clone())
                    })
                    .collect()
            })
            .unwrap_or_default();

        Feature {
            id: raw.get("id").cloned(),
            geometry: raw.get("geometry").filter(|g| !g.is_null()).cloned(),
            properties,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_feature_bbox() {
        let feature = Feature {
            id: None,
            geometry: Some(json!({
                "type": "LineString",
                "coordinates": [[-95.0, 29.0], [-94.5, 29.5], [-94.0, 29.2]]
            })),
            properties: Map::new(),
        };
        assert_eq!(
            feature.bbox(),
            Some(BoundingBox::new(-95.0, 29.0, -94.0, 29.5))
        );
    }

    #[test]
    fn test_geometry_collection_bbox() {
        let feature = Feature {
            id: None,
            geometry: Some(json!({
                "type": "GeometryCollection",
                "geometries": [
                    {"type": "Point", "coordinates": [1.0, 2.0]},
                    {"type": "Polygon", "coordinates": [[[3.0, 4.0], [5.0, 4.0], [5.0, 6.0], [3.0, 4.0]]]}
                ]
            })),
            properties: Map::new(),
        };
        assert_eq!(feature.bbox(), Some(BoundingBox::new(1.0, 2.0, 5.0, 6.0)));
    }

    #[test]
    fn test_legacy_crs() {
        let doc = json!({"crs": {"type": "name", "properties": {"name": "urn:ogc:def:crs:EPSG::4269"}}});
        assert_eq!(legacy_crs(&doc), Some(Crs::Epsg(4269)));

        let crs84 = json!({"crs": {"type": "name", "properties": {"name": "urn:ogc:def:crs:OGC:1.3:CRS84"}}});
        assert_eq!(legacy_crs(&crs84), Some(Crs::Epsg(4326)));

        assert_eq!(legacy_crs(&json!({})), None);
    }
}
