//! GDAL VRT mosaics.
//!
//! Opening reads and parses the VRT XML only. Member GeoTIFFs are opened on
//! first touch, and a window read only touches members whose destination
//! rectangle intersects the window. Sources are sampled concurrently and
//! painted in document order with nearest-neighbour resampling; nodata
//! pixels of a source leave the pixels below them untouched. All members
//! share the handle's one tile cache budget.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tokio::sync::OnceCell;
use tracing::{debug, instrument, warn};

use catalog_common::{CatalogError, CatalogResult, Crs};

use super::cache::{SharedTileCache, TileCache, TileCacheStats};
use super::tiff::TiffSource;
use super::{check_request, BandInfo, GeoTransform, RasterSource, Window};
use crate::location::StorageLocation;
use crate::reader::RangeReader;
use crate::store::ReaderFactory;

/// Rectangle in (possibly fractional) pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Rect {
    x_off: f64,
    y_off: f64,
    x_size: f64,
    y_size: f64,
}

impl Rect {
    fn from_attrs(e: &BytesStart<'_>) -> Option<Self> {
        let mut rect = Rect {
            x_off: 0.0,
            y_off: 0.0,
            x_size: 0.0,
            y_size: 0.0,
        };
        for attr in e.attributes().flatten() {
            let value: f64 = String::from_utf8_lossy(&attr.value).trim().parse().ok()?;
            match attr.key.as_ref() {
                b"xOff" => rect.x_off = value,
                b"yOff" => rect.y_off = value,
                b"xSize" => rect.x_size = value,
                b"ySize" => rect.y_size = value,
                _ => {}
            }
        }
        Some(rect)
    }

    fn full(width: usize, height: usize) -> Self {
        Rect {
            x_off: 0.0,
            y_off: 0.0,
            x_size: width as f64,
            y_size: height as f64,
        }
    }

    fn is_degenerate(&self) -> bool {
        self.x_size <= 0.0 || self.y_size <= 0.0
    }

    /// Integer pixel window covering the rectangle.
    fn covering_window(&self) -> Window {
        let col0 = self.x_off.floor().max(0.0) as usize;
        let row0 = self.y_off.floor().max(0.0) as usize;
        let col1 = (self.x_off + self.x_size).ceil().max(0.0) as usize;
        let row1 = (self.y_off + self.y_size).ceil().max(0.0) as usize;
        Window::new(col0, row0, col1.saturating_sub(col0), row1.saturating_sub(row0))
    }
}

/// One `*Source` element of a band.
#[derive(Debug, Clone)]
struct SourceDef {
    /// Resolved member location.
    member: String,
    /// One-based band of the member.
    band: usize,
    src_rect: Option<Rect>,
    dst_rect: Option<Rect>,
    nodata: Option<f64>,
    scale: f64,
    offset: f64,
}

#[derive(Debug, Clone, Default)]
struct BandDef {
    description: Option<String>,
    nodata: Option<f64>,
    sources: Vec<SourceDef>,
}

#[derive(Debug, Default)]
struct VrtDocument {
    width: usize,
    height: usize,
    srs: Option<String>,
    geo_transform: Option<GeoTransform>,
    block: Option<(usize, usize)>,
    bands: Vec<BandDef>,
}

/// Raw `SourceFilename` before resolution against the VRT location.
#[derive(Debug, Default)]
struct PendingSource {
    filename: Option<String>,
    relative: bool,
    band: usize,
    src_rect: Option<Rect>,
    dst_rect: Option<Rect>,
    nodata: Option<f64>,
    scale: f64,
    offset: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    None,
    Srs,
    GeoTransform,
    NoData,
    Description,
    SourceFilename,
    SourceBand,
    SourceNoData,
    ScaleOffset,
    ScaleRatio,
}

fn attr(e: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == name)
        .map(|a| String::from_utf8_lossy(&a.value).into_owned())
}

fn is_source_element(name: &[u8]) -> bool {
    matches!(
        name,
        b"SimpleSource" | b"ComplexSource" | b"AveragedSource" | b"KernelFilteredSource"
    )
}

fn parse_geo_transform(text: &str) -> Option<GeoTransform> {
    let values: Vec<f64> = text
        .split(',')
        .map(|v| v.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .ok()?;
    let coeffs: [f64; 6] = values.try_into().ok()?;
    Some(GeoTransform(coeffs))
}

/// Parse VRT XML, resolving member filenames against `base`.
fn parse_vrt(xml: &str, base: &StorageLocation) -> CatalogResult<VrtDocument> {
    let location = base.to_string();
    let invalid = |message: String| CatalogError::invalid_asset(&location, message);

    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut doc = VrtDocument::default();
    let mut field = Field::None;
    let mut source: Option<PendingSource> = None;
    let mut buf = Vec::new();
    let mut seen_root = false;

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| invalid(format!("XML error at {}: {}", reader.buffer_position(), e)))?;

        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let name = e.name();
                match name.as_ref() {
                    b"VRTDataset" => {
                        seen_root = true;
                        doc.width = attr(e, b"rasterXSize")
                            .and_then(|v| v.parse().ok())
                            .unwrap_or(0);
                        doc.height = attr(e, b"rasterYSize")
                            .and_then(|v| v.parse().ok())
                            .unwrap_or(0);
                    }
                    b"SRS" => field = Field::Srs,
                    b"GeoTransform" => field = Field::GeoTransform,
                    b"VRTRasterBand" => {
                        let block_x = attr(e, b"blockXSize").and_then(|v| v.parse().ok());
                        let block_y = attr(e, b"blockYSize").and_then(|v| v.parse().ok());
                        if let (Some(x), Some(y)) = (block_x, block_y) {
                            doc.block = Some((x, y));
                        }
                        doc.bands.push(BandDef::default());
                    }
                    b"NoDataValue" if source.is_none() => field = Field::NoData,
                    b"Description" if source.is_none() => field = Field::Description,
                    n if is_source_element(n) => {
                        source = Some(PendingSource {
                            band: 1,
                            scale: 1.0,
                            ..PendingSource::default()
                        });
                    }
                    b"SourceFilename" => {
                        if let Some(s) = source.as_mut() {
                            s.relative = attr(e, b"relativeToVRT").as_deref() == Some("1");
                        }
                        field = Field::SourceFilename;
                    }
                    b"SourceBand" => field = Field::SourceBand,
                    b"NODATA" => field = Field::SourceNoData,
                    b"ScaleOffset" => field = Field::ScaleOffset,
                    b"ScaleRatio" => field = Field::ScaleRatio,
                    b"SrcRect" => {
                        if let Some(s) = source.as_mut() {
                            s.src_rect = Rect::from_attrs(e);
                        }
                    }
                    b"DstRect" => {
                        if let Some(s) = source.as_mut() {
                            s.dst_rect = Rect::from_attrs(e);
                        }
                    }
                    _ => {}
                }
            }
            Event::Text(ref t) => {
                let text = t
                    .unescape()
                    .map_err(|e| invalid(format!("bad XML text: {}", e)))?;
                let text = text.trim();
                let band = doc.bands.last_mut();
                match (field, band, source.as_mut()) {
                    (Field::Srs, _, _) => doc.srs = Some(text.to_string()),
                    (Field::GeoTransform, _, _) => {
                        doc.geo_transform = Some(
                            parse_geo_transform(text)
                                .ok_or_else(|| invalid(format!("bad GeoTransform '{}'", text)))?,
                        );
                    }
                    (Field::NoData, Some(band), _) => band.nodata = text.parse().ok(),
                    (Field::Description, Some(band), _) => {
                        band.description = Some(text.to_string()).filter(|d| !d.is_empty())
                    }
                    (Field::SourceFilename, _, Some(s)) => s.filename = Some(text.to_string()),
                    (Field::SourceBand, _, Some(s)) => {
                        s.band = text
                            .parse()
                            .map_err(|_| invalid(format!("bad SourceBand '{}'", text)))?
                    }
                    (Field::SourceNoData, _, Some(s)) => s.nodata = text.parse().ok(),
                    (Field::ScaleOffset, _, Some(s)) => s.offset = text.parse().unwrap_or(0.0),
                    (Field::ScaleRatio, _, Some(s)) => s.scale = text.parse().unwrap_or(1.0),
                    _ => {}
                }
            }
            Event::End(ref e) => {
                if is_source_element(e.name().as_ref()) {
                    if let Some(pending) = source.take() {
                        let filename = pending
                            .filename
                            .ok_or_else(|| invalid("source without SourceFilename".to_string()))?;
                        let member = if pending.relative {
                            base.join_relative(&filename)?
                        } else {
                            StorageLocation::parse(&filename)?
                        };
                        let band = doc
                            .bands
                            .last_mut()
                            .ok_or_else(|| invalid("source outside VRTRasterBand".to_string()))?;
                        band.sources.push(SourceDef {
                            member: member.to_string(),
                            band: pending.band.max(1),
                            src_rect: pending.src_rect,
                            dst_rect: pending.dst_rect,
                            nodata: pending.nodata,
                            scale: pending.scale,
                            offset: pending.offset,
                        });
                    }
                }
                field = Field::None;
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !seen_root {
        return Err(invalid("missing VRTDataset element".to_string()));
    }
    if doc.width == 0 || doc.height == 0 {
        return Err(invalid("VRT raster size must be positive".to_string()));
    }
    if doc.bands.is_empty() {
        return Err(invalid("VRT has no bands".to_string()));
    }
    Ok(doc)
}

/// Lazy VRT mosaic handle.
pub struct VrtSource {
    location: String,
    doc: VrtDocument,
    crs: Option<Crs>,
    /// Member path -> (cache slot, lazily opened source).
    members: HashMap<String, (usize, OnceCell<Arc<TiffSource>>)>,
    factory: ReaderFactory,
    prefetch_bytes: usize,
    cache: SharedTileCache,
}

impl std::fmt::Debug for VrtSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VrtSource")
            .field("location", &self.location)
            .field("width", &self.doc.width)
            .field("height", &self.doc.height)
            .field("bands", &self.doc.bands.len())
            .field("members", &self.members.len())
            .finish()
    }
}

impl VrtSource {
    /// Read and parse the VRT document. Members are not touched.
    #[instrument(skip(location, reader, factory), fields(location = %location))]
    pub async fn open(
        location: &StorageLocation,
        reader: Arc<dyn RangeReader>,
        factory: ReaderFactory,
        prefetch_bytes: usize,
        cache_bytes: usize,
    ) -> CatalogResult<Self> {
        let bytes = reader.read_all().await?;
        let xml = std::str::from_utf8(&bytes).map_err(|e| {
            CatalogError::invalid_asset(location.to_string(), format!("VRT is not UTF-8: {}", e))
        })?;
        let doc = parse_vrt(xml, location)?;

        let crs = doc.srs.as_deref().and_then(|srs| match Crs::parse(srs) {
            Ok(crs) => Some(crs),
            Err(e) => {
                warn!(location = %location, srs = %srs, error = %e, "Unparseable VRT SRS");
                None
            }
        });

        let mut members: HashMap<String, (usize, OnceCell<Arc<TiffSource>>)> = HashMap::new();
        for source in doc.bands.iter().flat_map(|band| band.sources.iter()) {
            let slot = members.len();
            members
                .entry(source.member.clone())
                .or_insert_with(|| (slot, OnceCell::new()));
        }

        debug!(
            width = doc.width,
            height = doc.height,
            bands = doc.bands.len(),
            members = members.len(),
            "Opened VRT"
        );

        Ok(Self {
            location: location.to_string(),
            doc,
            crs,
            members,
            factory,
            prefetch_bytes,
            cache: TileCache::shared(cache_bytes),
        })
    }

    /// Distinct member files referenced by the mosaic.
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Members whose headers have been read so far.
    pub fn opened_members(&self) -> usize {
        self.members.values().filter(|(_, cell)| cell.initialized()).count()
    }

    /// Statistics of the tile cache shared by all members.
    pub async fn cache_stats(&self) -> TileCacheStats {
        self.cache.lock().await.stats()
    }

    async fn member(&self, key: &str) -> CatalogResult<Arc<TiffSource>> {
        let (slot, cell) = self.members.get(key).ok_or_else(|| {
            CatalogError::Internal(format!("VRT member {} not indexed", key))
        })?;

        cell.get_or_try_init(|| async {
            let location = StorageLocation::parse(key)?;
            if location.extension().as_deref() == Some("vrt") {
                return Err(CatalogError::UnsupportedFormat(format!(
                    "nested VRT {} in {}",
                    key, self.location
                )));
            }
            let reader: Arc<dyn RangeReader> = Arc::new(self.factory.reader(&location)?);
            let member =
                TiffSource::open_with_cache(reader, self.prefetch_bytes, Arc::clone(&self.cache), *slot)
                    .await?;
            Ok(Arc::new(member))
        })
        .await
        .cloned()
    }

    /// Pixels one source contributes to `window`, as (index into the
    /// window, value) pairs.
    async fn sample(&self, source: &SourceDef, window: &Window) -> CatalogResult<Vec<(usize, f64)>> {
        // Skip without I/O when the destination is known not to overlap.
        if let Some(dst) = &source.dst_rect {
            if dst.is_degenerate() {
                warn!(vrt = %self.location, member = %source.member, "Skipping VRT source with empty DstRect");
                return Ok(Vec::new());
            }
            if dst.covering_window().intersection(window).is_none() {
                return Ok(Vec::new());
            }
        }

        let member = self.member(&source.member).await?;
        let src_band = source.band - 1;
        if src_band >= member.band_count() {
            return Err(CatalogError::invalid_asset(
                &self.location,
                format!("{} has no band {}", source.member, source.band),
            ));
        }

        let full = Rect::full(member.width(), member.height());
        let src = source.src_rect.unwrap_or(full);
        let dst = source.dst_rect.unwrap_or(full);
        if src.is_degenerate() || dst.is_degenerate() {
            return Ok(Vec::new());
        }

        let Some(covered) = dst.covering_window().intersection(window) else {
            return Ok(Vec::new());
        };

        // Output pixel centre -> member pixel, nearest neighbour.
        let x_ratio = src.x_size / dst.x_size;
        let y_ratio = src.y_size / dst.y_size;
        let map_col = |col: usize| -> Option<usize> {
            let x = col as f64 + 0.5;
            if x < dst.x_off || x >= dst.x_off + dst.x_size {
                return None;
            }
            let sx = (src.x_off + (x - dst.x_off) * x_ratio).floor();
            (sx >= 0.0 && sx < member.width() as f64).then_some(sx as usize)
        };
        let map_row = |row: usize| -> Option<usize> {
            let y = row as f64 + 0.5;
            if y < dst.y_off || y >= dst.y_off + dst.y_size {
                return None;
            }
            let sy = (src.y_off + (y - dst.y_off) * y_ratio).floor();
            (sy >= 0.0 && sy < member.height() as f64).then_some(sy as usize)
        };

        let cols: Vec<(usize, usize)> = (covered.col_off..covered.col_end())
            .filter_map(|c| map_col(c).map(|sc| (c, sc)))
            .collect();
        let rows: Vec<(usize, usize)> = (covered.row_off..covered.row_end())
            .filter_map(|r| map_row(r).map(|sr| (r, sr)))
            .collect();
        if cols.is_empty() || rows.is_empty() {
            return Ok(Vec::new());
        }

        let (min_sc, max_sc) = cols
            .iter()
            .fold((usize::MAX, 0), |(lo, hi), (_, sc)| (lo.min(*sc), hi.max(*sc)));
        let (min_sr, max_sr) = rows
            .iter()
            .fold((usize::MAX, 0), |(lo, hi), (_, sr)| (lo.min(*sr), hi.max(*sr)));
        let src_window = Window::new(min_sc, min_sr, max_sc - min_sc + 1, max_sr - min_sr + 1);

        let data = member.read_window(src_band, src_window).await?;
        let member_nodata = member.band_info(src_band).nodata;

        let mut pixels = Vec::with_capacity(rows.len() * cols.len());
        for (row, sr) in &rows {
            for (col, sc) in &cols {
                let value = data[(sr - min_sr) * src_window.width + (sc - min_sc)];
                if value.is_nan()
                    || Some(value) == source.nodata
                    || Some(value) == member_nodata
                {
                    continue;
                }
                pixels.push((
                    (row - window.row_off) * window.width + (col - window.col_off),
                    value * source.scale + source.offset,
                ));
            }
        }

        Ok(pixels)
    }
}

#[async_trait]
impl RasterSource for VrtSource {
    fn location(&self) -> &str {
        &self.location
    }

    fn width(&self) -> usize {
        self.doc.width
    }

    fn height(&self) -> usize {
        self.doc.height
    }

    fn band_count(&self) -> usize {
        self.doc.bands.len()
    }

    fn block_shape(&self) -> (usize, usize) {
        self.doc
            .block
            .unwrap_or((128.min(self.doc.width), 128.min(self.doc.height)))
    }

    fn geo_transform(&self) -> Option<GeoTransform> {
        self.doc.geo_transform
    }

    fn crs(&self) -> Option<Crs> {
        self.crs.clone()
    }

    fn band_info(&self, band: usize) -> BandInfo {
        self.doc
            .bands
            .get(band)
            .map(|b| BandInfo {
                description: b.description.clone(),
                nodata: b.nodata,
            })
            .unwrap_or_default()
    }

    async fn read_window(&self, band: usize, window: Window) -> CatalogResult<Vec<f64>> {
        check_request(self, band, &window)?;

        let def = &self.doc.bands[band];
        let mut out = vec![def.nodata.unwrap_or(f64::NAN); window.len()];
        if window.is_empty() {
            return Ok(out);
        }

        let sampled = try_join_all(def.sources.iter().map(|source| self.sample(source, &window))).await?;
        for pixels in sampled {
            for (index, value) in pixels {
                out[index] = value;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOSAIC: &str = r#"<VRTDataset rasterXSize="200" rasterYSize="100">
  <SRS dataAxisToSRSAxisMapping="1,2">EPSG:6344</SRS>
  <GeoTransform>  500000.0,  1.0,  0.0,  4000000.0,  0.0, -1.0</GeoTransform>
  <VRTRasterBand dataType="Float32" band="1">
    <NoDataValue>-9999</NoDataValue>
    <Description>elevation</Description>
    <SimpleSource>
      <SourceFilename relativeToVRT="1">tiles/west.tif</SourceFilename>
      <SourceBand>1</SourceBand>
      <SrcRect xOff="0" yOff="0" xSize="100" ySize="100"/>
      <DstRect xOff="0" yOff="0" xSize="100" ySize="100"/>
    </SimpleSource>
    <ComplexSource>
      <SourceFilename relativeToVRT="0">/vsis3/other-bucket/east.tif</SourceFilename>
      <SourceBand>1</SourceBand>
      <NODATA>0</NODATA>
      <ScaleOffset>1.5</ScaleOffset>
      <ScaleRatio>2</ScaleRatio>
      <SrcRect xOff="0" yOff="0" xSize="100" ySize="100"/>
      <DstRect xOff="100" yOff="0" xSize="100" ySize="100"/>
    </ComplexSource>
  </VRTRasterBand>
</VRTDataset>"#;

    fn base() -> StorageLocation {
        StorageLocation::parse("s3://bucket/dem/mosaic.vrt").unwrap()
    }

    #[test]
    fn test_parse_mosaic() {
        let doc = parse_vrt(MOSAIC, &base()).unwrap();
        assert_eq!((doc.width, doc.height), (200, 100));
        assert_eq!(doc.srs.as_deref(), Some("EPSG:6344"));
        assert_eq!(
            doc.geo_transform,
            Some(GeoTransform([500000.0, 1.0, 0.0, 4000000.0, 0.0, -1.0]))
        );

        let band = &doc.bands[0];
        assert_eq!(band.nodata, Some(-9999.0));
        assert_eq!(band.description.as_deref(), Some("elevation"));
        assert_eq!(band.sources.len(), 2);

        let west = &band.sources[0];
        assert_eq!(west.member, "s3://bucket/dem/tiles/west.tif");
        assert_eq!(west.scale, 1.0);

        let east = &band.sources[1];
        assert_eq!(east.member, "s3://other-bucket/east.tif");
        assert_eq!(east.nodata, Some(0.0));
        assert_eq!((east.scale, east.offset), (2.0, 1.5));
        assert_eq!(east.dst_rect.unwrap().x_off, 100.0);
    }

    #[test]
    fn test_rejects_non_vrt() {
        let err = parse_vrt("<Other/>", &base()).unwrap_err();
        assert!(matches!(err, CatalogError::InvalidAsset { .. }));
    }

    #[test]
    fn test_rejects_source_without_filename() {
        let xml = r#"<VRTDataset rasterXSize="1" rasterYSize="1"><VRTRasterBand><SimpleSource><SourceBand>1</SourceBand></SimpleSource></VRTRasterBand></VRTDataset>"#;
        assert!(parse_vrt(xml, &base()).is_err());
    }

    #[test]
    fn test_covering_window() {
        let rect = Rect {
            x_off: 10.5,
            y_off: 0.0,
            x_size: 5.0,
            y_size: 2.0,
        };
        assert_eq!(rect.covering_window(), Window::new(10, 0, 6, 2));
    }
}
