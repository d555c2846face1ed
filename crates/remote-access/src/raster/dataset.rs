//! Caller-facing raster handle.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use catalog_common::{BoundingBox, CatalogError, CatalogResult, Crs};
use data_catalog::CatalogEntry;

use super::{GeoTransform, RasterSource, Window};

/// One named variable of a raster dataset, backed by a source band.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Variable {
    /// Name after the entry's rename mapping.
    pub name: String,
    /// Name before renaming.
    pub source_name: String,
    /// Zero-based source band.
    pub band: usize,
    pub nodata: Option<f64>,
    /// `(mult, add)` applied to valid samples.
    pub unit: Option<(f64, f64)>,
}

/// Lazy raster dataset.
///
/// Cheap to clone; clones share the underlying source and its tile cache.
/// Narrowing operations (`clip_bbox`, `clip_window`, `select_variables`)
/// return new handles without reading pixels.
#[derive(Clone)]
pub struct RasterDataset {
    name: String,
    source: Arc<dyn RasterSource>,
    variables: Vec<Variable>,
    window: Window,
    crs: Option<Crs>,
    chunks: (usize, usize),
}

impl fmt::Debug for RasterDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RasterDataset")
            .field("name", &self.name)
            .field("location", &self.source.location())
            .field("variables", &self.variable_names())
            .field("window", &self.window)
            .field("crs", &self.crs)
            .finish()
    }
}

/// Source variable names before renaming: a single band takes the dataset
/// name, multiple bands take their description or `band{n}`.
fn source_names(name: &str, source: &dyn RasterSource) -> Vec<String> {
    let count = source.band_count();
    if count == 1 {
        return vec![name.to_string()];
    }
    (0..count)
        .map(|band| {
            source
                .band_info(band)
                .description
                .unwrap_or_else(|| format!("band{}", band + 1))
        })
        .collect()
}

impl RasterDataset {
    /// Wrap an opened source, applying the entry's rename, nodata, unit and
    /// chunk declarations. `crs` is the already-resolved dataset CRS.
    pub fn from_entry(
        entry: &CatalogEntry,
        source: Arc<dyn RasterSource>,
        crs: Option<Crs>,
    ) -> CatalogResult<Self> {
        let mut seen = HashSet::new();
        let mut variables = Vec::new();

        for (band, source_name) in source_names(&entry.name, source.as_ref())
            .into_iter()
            .enumerate()
        {
            let name = entry.renamed(&source_name).to_string();
            if !seen.insert(name.clone()) {
                return Err(CatalogError::invalid_asset(
                    source.location(),
                    format!("variable name '{}' is not unique after renaming", name),
                ));
            }

            let nodata = source
                .band_info(band)
                .nodata
                .or_else(|| entry.nodata.as_ref().and_then(|n| n.for_variable(&name)));

            variables.push(Variable {
                unit: entry.unit_transform(&name),
                nodata,
                band,
                source_name,
                name,
            });
        }

        let chunk_sizes = entry.chunk_sizes();
        let (block_x, block_y) = source.block_shape();
        let chunks = (
            chunk_sizes.get("x").copied().unwrap_or(block_x).max(1),
            chunk_sizes.get("y").copied().unwrap_or(block_y).max(1),
        );

        Ok(Self {
            name: entry.name.clone(),
            window: Window::full(source.width(), source.height()),
            source,
            variables,
            crs,
            chunks,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn location(&self) -> &str {
        self.source.location()
    }

    pub fn source(&self) -> &Arc<dyn RasterSource> {
        &self.source
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn variable_names(&self) -> Vec<&str> {
        self.variables.iter().map(|v| v.name.as_str()).collect()
    }

    pub fn variable(&self, name: &str) -> CatalogResult<&Variable> {
        self.variables
            .iter()
            .find(|v| v.name == name)
            .ok_or_else(|| CatalogError::UnknownVariable(name.to_string()))
    }

    pub fn crs(&self) -> Option<&Crs> {
        self.crs.as_ref()
    }

    pub fn width(&self) -> usize {
        self.window.width
    }

    pub fn height(&self) -> usize {
        self.window.height
    }

    /// (rows, cols) of the current view.
    pub fn shape(&self) -> (usize, usize) {
        (self.window.height, self.window.width)
    }

    /// The view's window in source pixels.
    pub fn window(&self) -> Window {
        self.window
    }

    /// Transform of the current view.
    pub fn transform(&self) -> Option<GeoTransform> {
        self.source
            .geo_transform()
            .map(|gt| gt.shifted(self.window.col_off, self.window.row_off))
    }

    pub fn bounds(&self) -> Option<BoundingBox> {
        self.transform()
            .map(|gt| gt.bounds(self.window.width, self.window.height))
    }

    /// Chunk shape as (x, y) pixels.
    pub fn chunks(&self) -> (usize, usize) {
        self.chunks
    }

    /// Chunk windows tiling the view, row-major, relative to the view.
    pub fn chunk_windows(&self) -> Vec<Window> {
        let (cx, cy) = self.chunks;
        let mut windows = Vec::new();
        for row in (0..self.window.height).step_by(cy) {
            for col in (0..self.window.width).step_by(cx) {
                windows.push(Window::new(
                    col,
                    row,
                    cx.min(self.window.width - col),
                    cy.min(self.window.height - row),
                ));
            }
        }
        windows
    }

    /// Restrict to the named variables, in the given order.
    pub fn select_variables<S: AsRef<str>>(&self, names: &[S]) -> CatalogResult<Self> {
        let variables = names
            .iter()
            .map(|name| self.variable(name.as_ref()).cloned())
            .collect::<CatalogResult<Vec<_>>>()?;
        Ok(Self {
            variables,
            ..self.clone()
        })
    }

    /// Narrow to a window given relative to the current view.
    pub fn clip_window(&self, window: Window) -> CatalogResult<Self> {
        if window.is_empty() {
            return Err(CatalogError::InvalidWindow(format!("empty window {}", window)));
        }
        if !Window::full(self.window.width, self.window.height).contains(&window) {
            return Err(CatalogError::InvalidWindow(format!(
                "window {} outside {}x{} view",
                window, self.window.width, self.window.height
            )));
        }
        Ok(Self {
            window: self.window.offset(&window),
            ..self.clone()
        })
    }

    /// Narrow to the pixels covering `bbox` (in the dataset CRS), grown by
    /// `buffer` cells and clamped to the current view.
    pub fn clip_bbox(&self, bbox: &BoundingBox, buffer: usize) -> CatalogResult<Self> {
        if !bbox.is_valid() {
            return Err(CatalogError::InvalidWindow(format!("invalid bbox {}", bbox)));
        }
        let transform = self.transform().ok_or_else(|| {
            CatalogError::InvalidWindow(format!("{} has no georeferencing", self.name))
        })?;

        let window = transform
            .window_for_bbox(bbox, buffer, self.window.width, self.window.height)?
            .ok_or_else(|| {
                CatalogError::InvalidWindow(format!(
                    "bbox {} does not intersect {}",
                    bbox, self.name
                ))
            })?;
        self.clip_window(window)
    }

    /// Read a whole variable of the current view.
    pub async fn read_variable(&self, name: &str) -> CatalogResult<RasterArray> {
        self.read_window(name, Window::full(self.window.width, self.window.height))
            .await
    }

    /// Read a window (relative to the current view) of one variable.
    ///
    /// Fetches only the source blocks intersecting the window.
    pub async fn read_window(&self, name: &str, window: Window) -> CatalogResult<RasterArray> {
        let variable = self.variable(name)?;
        if !Window::full(self.window.width, self.window.height).contains(&window) {
            return Err(CatalogError::InvalidWindow(format!(
                "window {} outside {}x{} view",
                window, self.window.width, self.window.height
            )));
        }

        let absolute = self.window.offset(&window);
        let mut data = self.source.read_window(variable.band, absolute).await?;

        let band_nodata = self.source.band_info(variable.band).nodata;
        let fill = variable.nodata.unwrap_or(f64::NAN);
        for value in data.iter_mut() {
            let missing = value.is_nan() || Some(*value) == band_nodata || Some(*value) == variable.nodata;
            if missing {
                *value = fill;
            } else if let Some((mult, add)) = variable.unit {
                *value = *value * mult + add;
            }
        }

        let transform = self
            .source
            .geo_transform()
            .map(|gt| gt.shifted(absolute.col_off, absolute.row_off));

        Ok(RasterArray {
            variable: variable.name.clone(),
            width: window.width,
            height: window.height,
            data,
            nodata: variable.nodata,
            transform,
            crs: self.crs.clone(),
        })
    }
}

/// Materialized pixels of one variable.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterArray {
    pub variable: String,
    pub width: usize,
    pub height: usize,
    /// Row-major samples.
    pub data: Vec<f64>,
    pub nodata: Option<f64>,
    pub transform: Option<GeoTransform>,
    pub crs: Option<Crs>,
}

/// Summary statistics over valid samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ArrayStats {
    pub valid: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl RasterArray {
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        if row >= self.height || col >= self.width {
            return None;
        }
        self.data.get(row * self.width + col).copied()
    }

    pub fn is_valid(&self, value: f64) -> bool {
        !value.is_nan() && Some(value) != self.nodata
    }

    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|v| self.is_valid(**v)).count()
    }

    /// Statistics over valid samples; `None` when every sample is nodata.
    pub fn stats(&self) -> Option<ArrayStats> {
        let mut valid = 0usize;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;

        for &value in self.data.iter().filter(|v| self.is_valid(**v)) {
            valid += 1;
            min = min.min(value);
            max = max.max(value);
            sum += value;
        }

        (valid > 0).then(|| ArrayStats {
            valid,
            min,
            max,
            mean: sum / valid as f64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use data_catalog::{DataType, Driver, NoData};

    use crate::raster::BandInfo;

    /// In-memory source: value = band * 1000 + row * width + col.
    #[derive(Debug)]
    struct GridSource {
        width: usize,
        height: usize,
        bands: Vec<BandInfo>,
    }

    #[async_trait]
    impl RasterSource for GridSource {
        fn location(&self) -> &str {
            "memory://grid"
        }
        fn width(&self) -> usize {
            self.width
        }
        fn height(&self) -> usize {
            self.height
        }
        fn band_count(&self) -> usize {
            self.bands.len()
        }
        fn block_shape(&self) -> (usize, usize) {
            (4, 4)
        }
        fn geo_transform(&self) -> Option<GeoTransform> {
            Some(GeoTransform::north_up(0.0, 10.0, 1.0, 1.0))
        }
        fn crs(&self) -> Option<Crs> {
            None
        }
        fn band_info(&self, band: usize) -> BandInfo {
            self.bands[band].clone()
        }
        async fn read_window(&self, band: usize, window: Window) -> CatalogResult<Vec<f64>> {
            let mut out = Vec::with_capacity(window.len());
            for row in window.row_off..window.row_end() {
                for col in window.col_off..window.col_end() {
                    out.push((band * 1000 + row * self.width + col) as f64);
                }
            }
            Ok(out)
        }
    }

    fn grid(bands: Vec<BandInfo>) -> Arc<dyn RasterSource> {
        Arc::new(GridSource {
            width: 10,
            height: 10,
            bands,
        })
    }

    fn entry() -> CatalogEntry {
        CatalogEntry::new("dem", DataType::Raster, Driver::Raster, "memory://grid/dem.tif")
    }

    #[test]
    fn test_single_band_takes_entry_name() {
        let ds = RasterDataset::from_entry(
            &entry().with_rename("dem", "elevtn"),
            grid(vec![BandInfo::default()]),
            None,
        )
        .unwrap();
        assert_eq!(ds.variable_names(), vec!["elevtn"]);
        assert_eq!(ds.variables()[0].source_name, "dem");
        assert_eq!(ds.chunks(), (4, 4));
    }

    #[test]
    fn test_multi_band_names() {
        let bands = vec![
            BandInfo {
                description: Some("elevation".into()),
                nodata: None,
            },
            BandInfo::default(),
        ];
        let ds = RasterDataset::from_entry(&entry(), grid(bands), None).unwrap();
        assert_eq!(ds.variable_names(), vec!["elevation", "band2"]);
    }

    #[test]
    fn test_rename_collision_rejected() {
        let bands = vec![BandInfo::default(), BandInfo::default()];
        let entry = entry().with_rename("band1", "band2");
        assert!(RasterDataset::from_entry(&entry, grid(bands), None).is_err());
    }

    #[test]
    fn test_select_unknown_variable() {
        let ds = RasterDataset::from_entry(&entry(), grid(vec![BandInfo::default()]), None).unwrap();
        assert!(matches!(
            ds.select_variables(&["elevtn"]),
            Err(CatalogError::UnknownVariable(_))
        ));
    }

    #[test]
    fn test_chunk_windows_cover_view() {
        let ds = RasterDataset::from_entry(&entry(), grid(vec![BandInfo::default()]), None).unwrap();
        let windows = ds.chunk_windows();
        assert_eq!(windows.len(), 9);
        assert_eq!(windows[8], Window::new(8, 8, 2, 2));
        assert_eq!(windows.iter().map(Window::len).sum::<usize>(), 100);
    }

    #[tokio::test]
    async fn test_clip_and_read_with_units() {
        let mut entry = entry();
        entry.unit_mult.insert("dem".into(), 2.0);
        entry.unit_add.insert("dem".into(), 1.0);
        entry.nodata = Some(NoData::Value(-1.0));

        let ds = RasterDataset::from_entry(&entry, grid(vec![BandInfo::default()]), None).unwrap();
        // x 2..4, y 6..8 -> cols 2..4, rows 2..4
        let clipped = ds.clip_bbox(&BoundingBox::new(2.0, 6.0, 4.0, 8.0), 0).unwrap();
        assert_eq!(clipped.window(), Window::new(2, 2, 2, 2));
        assert_eq!(clipped.bounds(), Some(BoundingBox::new(2.0, 6.0, 4.0, 8.0)));

        let array = clipped.read_variable("dem").await.unwrap();
        assert_eq!(array.nodata, Some(-1.0));
        // raw 22 -> 45
        assert_eq!(array.get(0, 0), Some(45.0));
        assert_eq!(array.get(1, 1), Some(33.0 * 2.0 + 1.0));
        assert_eq!(array.stats().unwrap().valid, 4);
    }

    #[test]
    fn test_clip_outside_fails() {
        let ds = RasterDataset::from_entry(&entry(), grid(vec![BandInfo::default()]), None).unwrap();
        assert!(matches!(
            ds.clip_bbox(&BoundingBox::new(50.0, 50.0, 60.0, 60.0), 1),
            Err(CatalogError::InvalidWindow(_))
        ));
    }
}
