//! Lazy raster access.
//!
//! A [`RasterSource`] knows an asset's geometry and can read a pixel window
//! of one band; [`RasterDataset`] is the caller-facing handle that adds
//! variable naming, CRS resolution, a clip window and chunking on top.

pub mod cache;
pub mod dataset;
pub mod tiff;
pub mod vrt;

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;

use catalog_common::{BoundingBox, CatalogError, CatalogResult, Crs};

pub use cache::{SharedTileCache, TileCache, TileCacheStats};
pub use dataset::{ArrayStats, RasterArray, RasterDataset, Variable};
pub use tiff::TiffSource;
pub use vrt::VrtSource;

/// Pixel window: offsets and size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Window {
    pub col_off: usize,
    pub row_off: usize,
    pub width: usize,
    pub height: usize,
}

impl Window {
    pub fn new(col_off: usize, row_off: usize, width: usize, height: usize) -> Self {
        Self {
            col_off,
            row_off,
            width,
            height,
        }
    }

    /// Window covering a whole `width` x `height` grid.
    pub fn full(width: usize, height: usize) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn col_end(&self) -> usize {
        self.col_off + self.width
    }

    pub fn row_end(&self) -> usize {
        self.row_off + self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn len(&self) -> usize {
        self.width * self.height
    }

    pub fn intersection(&self, other: &Window) -> Option<Window> {
        let col_off = self.col_off.max(other.col_off);
        let row_off = self.row_off.max(other.row_off);
        let col_end = self.col_end().min(other.col_end());
        let row_end = self.row_end().min(other.row_end());
        if col_off >= col_end || row_off >= row_end {
            return None;
        }
        Some(Window::new(col_off, row_off, col_end - col_off, row_end - row_off))
    }

    /// Whether `other` lies entirely within this window.
    pub fn contains(&self, other: &Window) -> bool {
        other.col_off >= self.col_off
            && other.row_off >= self.row_off
            && other.col_end() <= self.col_end()
            && other.row_end() <= self.row_end()
    }

    /// Translate a window given relative to this one into absolute pixels.
    pub fn offset(&self, inner: &Window) -> Window {
        Window::new(
            self.col_off + inner.col_off,
            self.row_off + inner.row_off,
            inner.width,
            inner.height,
        )
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}+{}+{}",
            self.width, self.height, self.col_off, self.row_off
        )
    }
}

/// Affine pixel-to-world transform in GDAL order.
///
/// `x = c[0] + col * c[1] + row * c[2]`, `y = c[3] + col * c[4] + row * c[5]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeoTransform(pub [f64; 6]);

impl GeoTransform {
    /// North-up transform from an upper-left corner and pixel size.
    pub fn north_up(origin_x: f64, origin_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self([origin_x, pixel_width, 0.0, origin_y, 0.0, -pixel_height.abs()])
    }

    pub fn pixel_width(&self) -> f64 {
        self.0[1]
    }

    pub fn pixel_height(&self) -> f64 {
        self.0[5]
    }

    pub fn is_rotated(&self) -> bool {
        self.0[2] != 0.0 || self.0[4] != 0.0
    }

    /// World coordinates of a pixel corner.
    pub fn pixel_to_world(&self, col: f64, row: f64) -> (f64, f64) {
        let c = &self.0;
        (
            c[0] + col * c[1] + row * c[2],
            c[3] + col * c[4] + row * c[5],
        )
    }

    /// Fractional pixel coordinates of a world point (non-rotated grids).
    pub fn world_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        let c = &self.0;
        ((x - c[0]) / c[1], (y - c[3]) / c[5])
    }

    /// Transform of a window starting at (`col`, `row`).
    pub fn shifted(&self, col: usize, row: usize) -> GeoTransform {
        let (x, y) = self.pixel_to_world(col as f64, row as f64);
        let mut c = self.0;
        c[0] = x;
        c[3] = y;
        GeoTransform(c)
    }

    /// World extent of a `width` x `height` grid.
    pub fn bounds(&self, width: usize, height: usize) -> BoundingBox {
        let corners = [
            self.pixel_to_world(0.0, 0.0),
            self.pixel_to_world(width as f64, 0.0),
            self.pixel_to_world(0.0, height as f64),
            self.pixel_to_world(width as f64, height as f64),
        ];
        let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
        let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
        for (x, y) in corners {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
        BoundingBox::new(min_x, min_y, max_x, max_y)
    }

    /// Smallest pixel window of a `width` x `height` grid covering `bbox`,
    /// grown by `buffer` pixels on every side and clamped to the grid.
    ///
    /// Returns `None` when the box misses the grid.
    pub fn window_for_bbox(
        &self,
        bbox: &BoundingBox,
        buffer: usize,
        width: usize,
        height: usize,
    ) -> CatalogResult<Option<Window>> {
        if self.is_rotated() {
            return Err(CatalogError::UnsupportedFormat(
                "bbox clipping of rotated rasters".to_string(),
            ));
        }
        if self.0[1] == 0.0 || self.0[5] == 0.0 {
            return Err(CatalogError::InvalidWindow(
                "raster has a zero pixel size".to_string(),
            ));
        }

        let (c0, r0) = self.world_to_pixel(bbox.min_x, bbox.max_y);
        let (c1, r1) = self.world_to_pixel(bbox.max_x, bbox.min_y);

        let col_min = c0.min(c1).floor() - buffer as f64;
        let col_max = c0.max(c1).ceil() + buffer as f64;
        let row_min = r0.min(r1).floor() - buffer as f64;
        let row_max = r0.max(r1).ceil() + buffer as f64;

        let col_start = col_min.max(0.0);
        let row_start = row_min.max(0.0);
        let col_end = col_max.min(width as f64);
        let row_end = row_max.min(height as f64);

        if col_start >= col_end || row_start >= row_end {
            return Ok(None);
        }

        let col_off = col_start as usize;
        let row_off = row_start as usize;
        Ok(Some(Window::new(
            col_off,
            row_off,
            col_end as usize - col_off,
            row_end as usize - row_off,
        )))
    }
}

/// Per-band metadata read from an asset header.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BandInfo {
    pub description: Option<String>,
    pub nodata: Option<f64>,
}

/// A raster asset that can read pixel windows on demand.
#[async_trait]
pub trait RasterSource: Send + Sync + fmt::Debug {
    /// Storage location, for logs and errors.
    fn location(&self) -> &str;

    fn width(&self) -> usize;

    fn height(&self) -> usize;

    fn band_count(&self) -> usize;

    /// Native block shape as (width, height).
    fn block_shape(&self) -> (usize, usize);

    fn geo_transform(&self) -> Option<GeoTransform>;

    /// CRS embedded in the asset, if any.
    fn crs(&self) -> Option<Crs>;

    /// Metadata for a zero-based band.
    fn band_info(&self, band: usize) -> BandInfo;

    /// Read a window of a zero-based band as row-major samples.
    ///
    /// Pixels not covered by data are set to the band's nodata value, or
    /// NaN when the band declares none.
    async fn read_window(&self, band: usize, window: Window) -> CatalogResult<Vec<f64>>;
}

/// Check a band index and window against a source's geometry.
pub(crate) fn check_request(
    source: &dyn RasterSource,
    band: usize,
    window: &Window,
) -> CatalogResult<()> {
    if band >= source.band_count() {
        return Err(CatalogError::InvalidWindow(format!(
            "band {} out of range ({} bands) in {}",
            band + 1,
            source.band_count(),
            source.location()
        )));
    }
    if !Window::full(source.width(), source.height()).contains(window) {
        return Err(CatalogError::InvalidWindow(format!(
            "window {} outside {}x{} raster {}",
            window,
            source.width(),
            source.height(),
            source.location()
        )));
    }
    Ok(())
}
