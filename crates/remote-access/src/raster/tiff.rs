//! GeoTIFF / Cloud-Optimized GeoTIFF reader.
//!
//! Opening reads the first IFD (from a prefetched prefix where possible,
//! with out-of-line tag values fetched on demand). Pixel reads fetch only the
//! tiles or strips intersecting the requested window, concurrently, and keep
//! decoded tiles in a per-handle LRU cache.
//!
//! Supported: classic and BigTIFF, both byte orders, tiles or strips, chunky
//! or planar layout, 8/16/32-bit integer and 32/64-bit float samples,
//! no compression, DEFLATE or LZW, horizontal differencing and
//! floating-point predictors.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::ZlibDecoder;
use futures::future::try_join_all;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::{debug, instrument};

use catalog_common::{CatalogError, CatalogResult, Crs};

use super::cache::{SharedTileCache, TileCache, TileCacheStats, TileData};
use super::{check_request, BandInfo, GeoTransform, RasterSource, Window};
use crate::reader::RangeReader;

// TIFF tags
const IMAGE_WIDTH: u16 = 256;
const IMAGE_LENGTH: u16 = 257;
const BITS_PER_SAMPLE: u16 = 258;
const COMPRESSION: u16 = 259;
const STRIP_OFFSETS: u16 = 273;
const SAMPLES_PER_PIXEL: u16 = 277;
const ROWS_PER_STRIP: u16 = 278;
const STRIP_BYTE_COUNTS: u16 = 279;
const PLANAR_CONFIGURATION: u16 = 284;
const PREDICTOR: u16 = 317;
const TILE_WIDTH: u16 = 322;
const TILE_LENGTH: u16 = 323;
const TILE_OFFSETS: u16 = 324;
const TILE_BYTE_COUNTS: u16 = 325;
const SAMPLE_FORMAT: u16 = 339;
const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const MODEL_TRANSFORMATION: u16 = 34264;
const GEO_KEY_DIRECTORY: u16 = 34735;
const GDAL_METADATA: u16 = 42112;
const GDAL_NODATA: u16 = 42113;

const WANTED_TAGS: &[u16] = &[
    IMAGE_WIDTH,
    IMAGE_LENGTH,
    BITS_PER_SAMPLE,
    COMPRESSION,
    STRIP_OFFSETS,
    SAMPLES_PER_PIXEL,
    ROWS_PER_STRIP,
    STRIP_BYTE_COUNTS,
    PLANAR_CONFIGURATION,
    PREDICTOR,
    TILE_WIDTH,
    TILE_LENGTH,
    TILE_OFFSETS,
    TILE_BYTE_COUNTS,
    SAMPLE_FORMAT,
    MODEL_PIXEL_SCALE,
    MODEL_TIEPOINT,
    MODEL_TRANSFORMATION,
    GEO_KEY_DIRECTORY,
    GDAL_METADATA,
    GDAL_NODATA,
];

// GeoKeys
const GT_MODEL_TYPE: u16 = 1024;
const GT_RASTER_TYPE: u16 = 1025;
const GEOGRAPHIC_TYPE: u16 = 2048;
const PROJECTED_CS_TYPE: u16 = 3072;
const USER_DEFINED: u64 = 32767;
const MODEL_PROJECTED: u64 = 1;
const MODEL_GEOGRAPHIC: u64 = 2;
const RASTER_PIXEL_IS_POINT: u64 = 2;

/// Largest tag payload accepted from a header.
const MAX_TAG_BYTES: u64 = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    fn u16(self, b: &[u8]) -> u16 {
        let raw = [b[0], b[1]];
        match self {
            ByteOrder::Little => u16::from_le_bytes(raw),
            ByteOrder::Big => u16::from_be_bytes(raw),
        }
    }

    fn u32(self, b: &[u8]) -> u32 {
        let raw = [b[0], b[1], b[2], b[3]];
        match self {
            ByteOrder::Little => u32::from_le_bytes(raw),
            ByteOrder::Big => u32::from_be_bytes(raw),
        }
    }

    fn u64(self, b: &[u8]) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&b[..8]);
        match self {
            ByteOrder::Little => u64::from_le_bytes(raw),
            ByteOrder::Big => u64::from_be_bytes(raw),
        }
    }

    /// Unsigned integer of `width` bytes (1, 2, 4 or 8).
    fn uint(self, b: &[u8], width: usize) -> u64 {
        match width {
            1 => b[0] as u64,
            2 => self.u16(b) as u64,
            4 => self.u32(b) as u64,
            _ => self.u64(b),
        }
    }

    fn write_uint(self, b: &mut [u8], width: usize, value: u64) {
        match (self, width) {
            (_, 1) => b[0] = value as u8,
            (ByteOrder::Little, 2) => b[..2].copy_from_slice(&(value as u16).to_le_bytes()),
            (ByteOrder::Big, 2) => b[..2].copy_from_slice(&(value as u16).to_be_bytes()),
            (ByteOrder::Little, 4) => b[..4].copy_from_slice(&(value as u32).to_le_bytes()),
            (ByteOrder::Big, 4) => b[..4].copy_from_slice(&(value as u32).to_be_bytes()),
            (ByteOrder::Little, _) => b[..8].copy_from_slice(&value.to_le_bytes()),
            (ByteOrder::Big, _) => b[..8].copy_from_slice(&value.to_be_bytes()),
        }
    }
}

/// Decoded value of one IFD entry.
#[derive(Debug, Clone, PartialEq)]
enum TagValue {
    Unsigned(Vec<u64>),
    Signed(Vec<i64>),
    Float(Vec<f64>),
    Ascii(String),
    Undefined(Vec<u8>),
}

impl TagValue {
    fn to_u64s(&self) -> Option<Vec<u64>> {
        match self {
            TagValue::Unsigned(v) => Some(v.clone()),
            TagValue::Signed(v) => v.iter().map(|x| u64::try_from(*x).ok()).collect(),
            _ => None,
        }
    }

    fn first_u64(&self) -> Option<u64> {
        self.to_u64s().and_then(|v| v.first().copied())
    }

    fn to_f64s(&self) -> Option<Vec<f64>> {
        match self {
            TagValue::Unsigned(v) => Some(v.iter().map(|x| *x as f64).collect()),
            TagValue::Signed(v) => Some(v.iter().map(|x| *x as f64).collect()),
            TagValue::Float(v) => Some(v.clone()),
            _ => None,
        }
    }

    fn as_text(&self) -> Option<String> {
        match self {
            TagValue::Ascii(s) => Some(s.clone()),
            TagValue::Undefined(b) => Some(String::from_utf8_lossy(b).into_owned()),
            _ => None,
        }
    }
}

/// Byte size of one value of a TIFF field type.
fn type_size(field_type: u16) -> Option<u64> {
    match field_type {
        1 | 2 | 6 | 7 => Some(1),
        3 | 8 => Some(2),
        4 | 9 | 11 | 13 => Some(4),
        5 | 10 | 12 | 16 | 17 | 18 => Some(8),
        _ => None,
    }
}

fn decode_value(field_type: u16, count: usize, data: &[u8], order: ByteOrder) -> TagValue {
    let chunks = |size: usize| data.chunks_exact(size).take(count);
    match field_type {
        1 => TagValue::Unsigned(data.iter().take(count).map(|b| *b as u64).collect()),
        2 => {
            let text = String::from_utf8_lossy(&data[..count.min(data.len())]);
            TagValue::Ascii(text.trim_end_matches('\0').to_string())
        }
        3 => TagValue::Unsigned(chunks(2).map(|b| order.u16(b) as u64).collect()),
        4 | 13 => TagValue::Unsigned(chunks(4).map(|b| order.u32(b) as u64).collect()),
        16 | 18 => TagValue::Unsigned(chunks(8).map(|b| order.u64(b)).collect()),
        6 => TagValue::Signed(data.iter().take(count).map(|b| *b as i8 as i64).collect()),
        8 => TagValue::Signed(chunks(2).map(|b| order.u16(b) as i16 as i64).collect()),
        9 => TagValue::Signed(chunks(4).map(|b| order.u32(b) as i32 as i64).collect()),
        17 => TagValue::Signed(chunks(8).map(|b| order.u64(b) as i64).collect()),
        5 => TagValue::Float(
            chunks(8)
                .map(|b| order.u32(&b[..4]) as f64 / order.u32(&b[4..]).max(1) as f64)
                .collect(),
        ),
        10 => TagValue::Float(
            chunks(8)
                .map(|b| {
                    let den = order.u32(&b[4..]) as i32;
                    order.u32(&b[..4]) as i32 as f64 / if den == 0 { 1.0 } else { den as f64 }
                })
                .collect(),
        ),
        11 => TagValue::Float(
            chunks(4)
                .map(|b| f32::from_bits(order.u32(b)) as f64)
                .collect(),
        ),
        12 => TagValue::Float(chunks(8).map(|b| f64::from_bits(order.u64(b))).collect()),
        _ => TagValue::Undefined(data.to_vec()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Deflate,
    Lzw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Predictor {
    None,
    Horizontal,
    FloatingPoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SampleKind {
    U8,
    U16,
    U32,
    I8,
    I16,
    I32,
    F32,
    F64,
}

impl SampleKind {
    fn from_tags(bits: u64, format: u64) -> CatalogResult<Self> {
        let kind = match (format, bits) {
            (1, 8) => SampleKind::U8,
            (1, 16) => SampleKind::U16,
            (1, 32) => SampleKind::U32,
            (2, 8) => SampleKind::I8,
            (2, 16) => SampleKind::I16,
            (2, 32) => SampleKind::I32,
            (3, 32) => SampleKind::F32,
            (3, 64) => SampleKind::F64,
            _ => {
                return Err(CatalogError::UnsupportedFormat(format!(
                    "GeoTIFF sample format {} with {} bits",
                    format, bits
                )))
            }
        };
        Ok(kind)
    }

    fn size(self) -> usize {
        match self {
            SampleKind::U8 | SampleKind::I8 => 1,
            SampleKind::U16 | SampleKind::I16 => 2,
            SampleKind::U32 | SampleKind::I32 | SampleKind::F32 => 4,
            SampleKind::F64 => 8,
        }
    }

    fn is_float(self) -> bool {
        matches!(self, SampleKind::F32 | SampleKind::F64)
    }

    fn read(self, b: &[u8], order: ByteOrder) -> f64 {
        match self {
            SampleKind::U8 => b[0] as f64,
            SampleKind::I8 => b[0] as i8 as f64,
            SampleKind::U16 => order.u16(b) as f64,
            SampleKind::I16 => order.u16(b) as i16 as f64,
            SampleKind::U32 => order.u32(b) as f64,
            SampleKind::I32 => order.u32(b) as i32 as f64,
            SampleKind::F32 => f32::from_bits(order.u32(b)) as f64,
            SampleKind::F64 => f64::from_bits(order.u64(b)),
        }
    }
}

/// Geometry and encoding of the first image in a GeoTIFF.
#[derive(Debug, Clone)]
struct TiffLayout {
    order: ByteOrder,
    width: usize,
    height: usize,
    samples_per_pixel: usize,
    sample: SampleKind,
    compression: Compression,
    predictor: Predictor,
    planar: bool,
    tiled: bool,
    tile_width: usize,
    tile_height: usize,
    tiles_across: usize,
    tiles_down: usize,
    offsets: Vec<u64>,
    byte_counts: Vec<u64>,
    geo_transform: Option<GeoTransform>,
    crs: Option<Crs>,
    nodata: Option<f64>,
    descriptions: HashMap<usize, String>,
}

impl TiffLayout {
    fn tiles_per_band(&self) -> usize {
        self.tiles_across * self.tiles_down
    }

    /// Samples per pixel stored in one tile.
    fn tile_samples(&self) -> usize {
        if self.planar {
            1
        } else {
            self.samples_per_pixel
        }
    }

    /// Rows actually encoded in a tile (strips at the bottom may be short).
    fn encoded_rows(&self, tile_row: usize) -> usize {
        if self.tiled {
            self.tile_height
        } else {
            self.tile_height
                .min(self.height.saturating_sub(tile_row * self.tile_height))
        }
    }

    fn fill(&self) -> f64 {
        self.nodata.unwrap_or(f64::NAN)
    }

    fn from_tags(tags: &HashMap<u16, TagValue>, order: ByteOrder, location: &str) -> CatalogResult<Self> {
        let invalid = |message: String| CatalogError::invalid_asset(location, message);
        let required = |tag: u16, name: &str| {
            tags.get(&tag)
                .and_then(TagValue::first_u64)
                .ok_or_else(|| invalid(format!("missing {} tag", name)))
        };
        let optional = |tag: u16, default: u64| tags.get(&tag).and_then(TagValue::first_u64).unwrap_or(default);

        let width = required(IMAGE_WIDTH, "ImageWidth")? as usize;
        let height = required(IMAGE_LENGTH, "ImageLength")? as usize;
        if width == 0 || height == 0 {
            return Err(invalid("zero-sized image".to_string()));
        }

        let samples_per_pixel = optional(SAMPLES_PER_PIXEL, 1).max(1) as usize;
        let bits = optional(BITS_PER_SAMPLE, 1);
        let format = optional(SAMPLE_FORMAT, 1);
        let sample = SampleKind::from_tags(bits, format)?;

        let compression = match optional(COMPRESSION, 1) {
            1 => Compression::None,
            8 | 32946 => Compression::Deflate,
            5 => Compression::Lzw,
            7 => return Err(CatalogError::UnsupportedFormat("JPEG-compressed GeoTIFF".into())),
            other => {
                return Err(CatalogError::UnsupportedFormat(format!(
                    "GeoTIFF compression {}",
                    other
                )))
            }
        };

        let predictor = match optional(PREDICTOR, 1) {
            1 => Predictor::None,
            2 if !sample.is_float() => Predictor::Horizontal,
            3 if sample.is_float() => Predictor::FloatingPoint,
            2 => {
                return Err(CatalogError::UnsupportedFormat(
                    "horizontal predictor on floating-point samples".into(),
                ))
            }
            3 => {
                return Err(CatalogError::UnsupportedFormat(
                    "floating-point predictor on integer samples".into(),
                ))
            }
            other => {
                return Err(CatalogError::UnsupportedFormat(format!(
                    "GeoTIFF predictor {}",
                    other
                )))
            }
        };

        let planar = optional(PLANAR_CONFIGURATION, 1) == 2;
        let tiled = tags.contains_key(&TILE_WIDTH);

        let (tile_width, tile_height, offsets_tag, counts_tag) = if tiled {
            (
                required(TILE_WIDTH, "TileWidth")? as usize,
                required(TILE_LENGTH, "TileLength")? as usize,
                TILE_OFFSETS,
                TILE_BYTE_COUNTS,
            )
        } else {
            let rows = optional(ROWS_PER_STRIP, height as u64).min(height as u64) as usize;
            (width, rows, STRIP_OFFSETS, STRIP_BYTE_COUNTS)
        };
        if tile_width == 0 || tile_height == 0 {
            return Err(invalid("zero-sized tiles".to_string()));
        }

        let offsets = tags
            .get(&offsets_tag)
            .and_then(TagValue::to_u64s)
            .ok_or_else(|| invalid("missing tile/strip offsets".to_string()))?;
        let byte_counts = tags
            .get(&counts_tag)
            .and_then(TagValue::to_u64s)
            .ok_or_else(|| invalid("missing tile/strip byte counts".to_string()))?;

        let tiles_across = width.div_ceil(tile_width);
        let tiles_down = height.div_ceil(tile_height);
        let planes = if planar { samples_per_pixel } else { 1 };
        let expected = tiles_across * tiles_down * planes;
        if offsets.len() < expected || byte_counts.len() < expected {
            return Err(invalid(format!(
                "expected {} tiles, header lists {} offsets and {} byte counts",
                expected,
                offsets.len(),
                byte_counts.len()
            )));
        }

        let geo_keys = tags
            .get(&GEO_KEY_DIRECTORY)
            .and_then(TagValue::to_u64s)
            .map(|dir| parse_geo_keys(&dir))
            .unwrap_or_default();

        let mut geo_transform = georeference(tags);
        if geo_keys.get(&GT_RASTER_TYPE) == Some(&RASTER_PIXEL_IS_POINT) {
            if let Some(gt) = geo_transform.as_mut() {
                gt.0[0] -= 0.5 * gt.0[1];
                gt.0[3] -= 0.5 * gt.0[5];
            }
        }

        let crs = crs_from_geo_keys(&geo_keys);

        let nodata = tags
            .get(&GDAL_NODATA)
            .and_then(TagValue::as_text)
            .and_then(|text| parse_nodata(&text));

        let descriptions = tags
            .get(&GDAL_METADATA)
            .and_then(TagValue::as_text)
            .map(|xml| parse_band_descriptions(&xml))
            .unwrap_or_default();

        Ok(Self {
            order,
            width,
            height,
            samples_per_pixel,
            sample,
            compression,
            predictor,
            planar,
            tiled,
            tile_width,
            tile_height,
            tiles_across,
            tiles_down,
            offsets,
            byte_counts,
            geo_transform,
            crs,
            nodata,
            descriptions,
        })
    }
}

/// GeoKey id -> inline SHORT value.
fn parse_geo_keys(directory: &[u64]) -> HashMap<u16, u64> {
    let mut keys = HashMap::new();
    if directory.len() < 4 {
        return keys;
    }
    let count = directory[3] as usize;
    for entry in directory[4..].chunks_exact(4).take(count) {
        // location 0 means the value is stored inline
        if entry[1] == 0 {
            keys.insert(entry[0] as u16, entry[3]);
        }
    }
    keys
}

/// EPSG code named by the GeoKeys for the raster's model type.
///
/// A user-defined projected CRS yields `None`; the geographic key of such a
/// file names only its base datum.
fn crs_from_geo_keys(keys: &HashMap<u16, u64>) -> Option<Crs> {
    let code = |key: u16| {
        keys.get(&key)
            .copied()
            .filter(|code| *code != 0 && *code != USER_DEFINED)
            .map(|code| Crs::Epsg(code as u32))
    };
    match keys.get(&GT_MODEL_TYPE).copied() {
        Some(MODEL_PROJECTED) => code(PROJECTED_CS_TYPE),
        Some(MODEL_GEOGRAPHIC) => code(GEOGRAPHIC_TYPE),
        Some(_) => None,
        None if keys.contains_key(&PROJECTED_CS_TYPE) => code(PROJECTED_CS_TYPE),
        None => code(GEOGRAPHIC_TYPE),
    }
}

fn georeference(tags: &HashMap<u16, TagValue>) -> Option<GeoTransform> {
    if let Some(m) = tags.get(&MODEL_TRANSFORMATION).and_then(TagValue::to_f64s) {
        if m.len() >= 16 {
            return Some(GeoTransform([m[3], m[0], m[1], m[7], m[4], m[5]]));
        }
    }

    let scale = tags.get(&MODEL_PIXEL_SCALE).and_then(TagValue::to_f64s)?;
    let tie = tags.get(&MODEL_TIEPOINT).and_then(TagValue::to_f64s)?;
    if scale.len() < 2 || tie.len() < 6 {
        return None;
    }
    let (sx, sy) = (scale[0], scale[1]);
    let (i, j, x, y) = (tie[0], tie[1], tie[3], tie[4]);
    Some(GeoTransform([x - i * sx, sx, 0.0, y + j * sy, 0.0, -sy]))
}

fn parse_nodata(text: &str) -> Option<f64> {
    let text = text.trim().trim_end_matches('\0').trim();
    match text.to_lowercase().as_str() {
        "nan" => Some(f64::NAN),
        "inf" => Some(f64::INFINITY),
        "-inf" => Some(f64::NEG_INFINITY),
        _ => text.parse().ok(),
    }
}

/// Band descriptions from a `GDAL_METADATA` XML block.
fn parse_band_descriptions(xml: &str) -> HashMap<usize, String> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut descriptions = HashMap::new();
    let mut pending: Option<usize> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.name().as_ref() == b"Item" => {
                let mut name = None;
                let mut role = None;
                let mut sample = None;
                for attr in e.attributes().flatten() {
                    let value = String::from_utf8_lossy(&attr.value).into_owned();
                    match attr.key.as_ref() {
                        b"name" => name = Some(value),
                        b"role" => role = Some(value),
                        b"sample" => sample = value.parse::<usize>().ok(),
                        _ => {}
                    }
                }
                let is_description = role.as_deref() == Some("description")
                    || name.as_deref() == Some("DESCRIPTION");
                pending = if is_description { sample } else { None };
            }
            Ok(Event::Text(t)) => {
                if let Some(band) = pending.take() {
                    if let Ok(text) = t.unescape() {
                        descriptions.insert(band, text.into_owned());
                    }
                }
            }
            Ok(Event::End(_)) => pending = None,
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    descriptions
}

/// Undo horizontal differencing in place, one row at a time.
fn undo_horizontal_predictor(
    buf: &mut [u8],
    row_pixels: usize,
    samples: usize,
    sample_size: usize,
    order: ByteOrder,
) {
    let row_bytes = row_pixels * samples * sample_size;
    if row_bytes == 0 {
        return;
    }
    let mask = if sample_size >= 8 {
        u64::MAX
    } else {
        (1u64 << (sample_size * 8)) - 1
    };
    let stride = samples * sample_size;

    for row in buf.chunks_exact_mut(row_bytes) {
        for pos in (stride..row_bytes).step_by(sample_size) {
            let prev = order.uint(&row[pos - stride..], sample_size);
            let cur = order.uint(&row[pos..], sample_size);
            order.write_uint(&mut row[pos..], sample_size, cur.wrapping_add(prev) & mask);
        }
    }
}

/// Undo the floating-point predictor in place, one row at a time.
///
/// Each row holds the bytes of its samples split into planes, most
/// significant byte first, then byte-wise differenced across pixels.
fn undo_float_predictor(
    buf: &mut [u8],
    row_pixels: usize,
    samples: usize,
    sample_size: usize,
    order: ByteOrder,
) {
    let count = row_pixels * samples;
    let row_bytes = count * sample_size;
    if row_bytes == 0 {
        return;
    }
    let mut planes = vec![0u8; row_bytes];

    for row in buf.chunks_exact_mut(row_bytes) {
        for i in samples..row_bytes {
            row[i] = row[i].wrapping_add(row[i - samples]);
        }
        planes.copy_from_slice(row);
        for value in 0..count {
            for significance in 0..sample_size {
                let pos = match order {
                    ByteOrder::Big => significance,
                    ByteOrder::Little => sample_size - 1 - significance,
                };
                row[value * sample_size + pos] = planes[significance * count + value];
            }
        }
    }
}

/// Decode one tile into planes of `tile_width * tile_height` samples.
///
/// `raw` is `None` for sparse tiles. Short strips are padded with the fill
/// value so every plane has the full tile shape.
fn decode_tile(layout: &TiffLayout, raw: Option<&[u8]>, rows: usize, location: &str) -> CatalogResult<Vec<Vec<f64>>> {
    let samples = layout.tile_samples();
    let plane_len = layout.tile_width * layout.tile_height;
    let fill = layout.fill();

    let raw = match raw {
        Some(raw) => raw,
        None => return Ok(vec![vec![fill; plane_len]; samples]),
    };

    let mut bytes = match layout.compression {
        Compression::None => raw.to_vec(),
        Compression::Deflate => {
            let mut out = Vec::with_capacity(plane_len * samples * layout.sample.size());
            ZlibDecoder::new(raw).read_to_end(&mut out).map_err(|e| {
                CatalogError::invalid_asset(location, format!("deflate error: {}", e))
            })?;
            out
        }
        Compression::Lzw => weezl::decode::Decoder::with_tiff_size_switch(weezl::BitOrder::Msb, 8)
            .decode(raw)
            .map_err(|e| CatalogError::invalid_asset(location, format!("LZW error: {}", e)))?,
    };

    let sample_size = layout.sample.size();
    let expected = layout.tile_width * rows * samples * sample_size;
    if bytes.len() < expected {
        return Err(CatalogError::invalid_asset(
            location,
            format!("tile holds {} bytes, expected {}", bytes.len(), expected),
        ));
    }
    bytes.truncate(expected);

    match layout.predictor {
        Predictor::None => {}
        Predictor::Horizontal => {
            undo_horizontal_predictor(&mut bytes, layout.tile_width, samples, sample_size, layout.order)
        }
        Predictor::FloatingPoint => {
            undo_float_predictor(&mut bytes, layout.tile_width, samples, sample_size, layout.order)
        }
    }

    let mut planes = vec![vec![fill; plane_len]; samples];
    for (i, chunk) in bytes.chunks_exact(sample_size).enumerate() {
        let pixel = i / samples;
        planes[i % samples][pixel] = layout.sample.read(chunk, layout.order);
    }
    Ok(planes)
}

/// Header bytes with on-demand fetches past the prefetched prefix.
struct HeaderBytes<'a> {
    reader: &'a dyn RangeReader,
    prefix: Bytes,
}

impl HeaderBytes<'_> {
    async fn read(&self, offset: u64, len: u64) -> CatalogResult<Bytes> {
        let end = offset.saturating_add(len);
        if end <= self.prefix.len() as u64 {
            return Ok(self.prefix.slice(offset as usize..end as usize));
        }
        let bytes = self.reader.read_range(offset..end).await?;
        if (bytes.len() as u64) < len {
            return Err(CatalogError::invalid_asset(
                self.reader.location(),
                format!("truncated header at offset {}", offset),
            ));
        }
        Ok(bytes)
    }
}

async fn read_first_ifd(reader: &dyn RangeReader, prefetch: usize) -> CatalogResult<(HashMap<u16, TagValue>, ByteOrder)> {
    let location = reader.location().to_string();
    let invalid = |message: &str| CatalogError::invalid_asset(&location, message);

    let prefix = reader.read_range(0..prefetch as u64).await?;
    if prefix.len() < 8 {
        return Err(invalid("too short for a TIFF header"));
    }

    let order = match &prefix[..2] {
        b"II" => ByteOrder::Little,
        b"MM" => ByteOrder::Big,
        _ => return Err(invalid("not a TIFF file")),
    };

    let (big, ifd_offset) = match order.u16(&prefix[2..4]) {
        42 => (false, order.u32(&prefix[4..8]) as u64),
        43 => {
            if prefix.len() < 16 {
                return Err(invalid("too short for a BigTIFF header"));
            }
            (true, order.u64(&prefix[8..16]))
        }
        _ => return Err(invalid("bad TIFF magic number")),
    };

    let header = HeaderBytes { reader, prefix };

    let (count_size, entry_size, inline_size) = if big { (8, 20, 8) } else { (2, 12, 4) };
    let count_bytes = header.read(ifd_offset, count_size).await?;
    let count = if big {
        order.u64(&count_bytes)
    } else {
        order.u16(&count_bytes) as u64
    };
    if count == 0 || count * entry_size > MAX_TAG_BYTES {
        return Err(invalid("bad IFD entry count"));
    }

    let table = header.read(ifd_offset + count_size, count * entry_size).await?;
    let mut tags = HashMap::new();

    for entry in table.chunks_exact(entry_size as usize) {
        let tag = order.u16(&entry[0..2]);
        if !WANTED_TAGS.contains(&tag) {
            continue;
        }
        let field_type = order.u16(&entry[2..4]);
        let Some(size) = type_size(field_type) else {
            continue;
        };
        let (n, inline) = if big {
            (order.u64(&entry[4..12]), &entry[12..20])
        } else {
            (order.u32(&entry[4..8]) as u64, &entry[8..12])
        };

        let total = n.saturating_mul(size);
        if total > MAX_TAG_BYTES {
            return Err(invalid("oversized tag value"));
        }

        let data = if total <= inline_size {
            Bytes::copy_from_slice(&inline[..total as usize])
        } else {
            let offset = if big { order.u64(inline) } else { order.u32(inline) as u64 };
            header.read(offset, total).await?
        };

        tags.insert(tag, decode_value(field_type, n as usize, &data, order));
    }

    Ok((tags, order))
}

/// Lazy GeoTIFF handle.
pub struct TiffSource {
    reader: Arc<dyn RangeReader>,
    layout: TiffLayout,
    cache: SharedTileCache,
    cache_slot: usize,
}

impl std::fmt::Debug for TiffSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TiffSource")
            .field("location", &self.reader.location())
            .field("width", &self.layout.width)
            .field("height", &self.layout.height)
            .field("bands", &self.layout.samples_per_pixel)
            .field("tile", &(self.layout.tile_width, self.layout.tile_height))
            .finish()
    }
}

impl TiffSource {
    /// Read the header. No pixel data is fetched.
    pub async fn open(
        reader: Arc<dyn RangeReader>,
        prefetch_bytes: usize,
        cache_bytes: usize,
    ) -> CatalogResult<Self> {
        Self::open_with_cache(reader, prefetch_bytes, TileCache::shared(cache_bytes), 0).await
    }

    /// Read the header, keeping decoded tiles in `cache` under `cache_slot`.
    #[instrument(skip(reader, cache), fields(location = %reader.location()))]
    pub async fn open_with_cache(
        reader: Arc<dyn RangeReader>,
        prefetch_bytes: usize,
        cache: SharedTileCache,
        cache_slot: usize,
    ) -> CatalogResult<Self> {
        let (tags, order) = read_first_ifd(reader.as_ref(), prefetch_bytes).await?;
        let layout = TiffLayout::from_tags(&tags, order, reader.location())?;

        debug!(
            width = layout.width,
            height = layout.height,
            bands = layout.samples_per_pixel,
            tile_width = layout.tile_width,
            tile_height = layout.tile_height,
            compression = ?layout.compression,
            "Opened GeoTIFF"
        );

        Ok(Self {
            reader,
            layout,
            cache,
            cache_slot,
        })
    }

    pub fn compression(&self) -> Compression {
        self.layout.compression
    }

    pub fn is_tiled(&self) -> bool {
        self.layout.tiled
    }

    /// Number of tiles (or strips) per band.
    pub fn tile_count(&self) -> usize {
        self.layout.tiles_per_band()
    }

    pub async fn cache_stats(&self) -> TileCacheStats {
        self.cache.lock().await.stats()
    }

    /// Fetch and decode one tile, returning every band it holds.
    async fn load_tile(&self, band: usize, tile: usize) -> CatalogResult<Vec<(usize, TileData)>> {
        let layout = &self.layout;
        let data_index = if layout.planar {
            band * layout.tiles_per_band() + tile
        } else {
            tile
        };

        let (offset, count) = match (layout.offsets.get(data_index), layout.byte_counts.get(data_index)) {
            (Some(o), Some(c)) => (*o, *c),
            _ => {
                return Err(CatalogError::invalid_asset(
                    self.reader.location(),
                    format!("tile {} missing from header", data_index),
                ))
            }
        };

        let raw = if offset == 0 || count == 0 {
            None
        } else {
            Some(self.reader.read_range(offset..offset + count).await?)
        };

        let rows = layout.encoded_rows(tile / layout.tiles_across);
        let planes = decode_tile(layout, raw.as_deref(), rows, self.reader.location())?;

        if layout.planar {
            Ok(planes
                .into_iter()
                .next()
                .map(|plane| vec![(band, Arc::new(plane))])
                .unwrap_or_default())
        } else {
            Ok(planes
                .into_iter()
                .enumerate()
                .map(|(b, plane)| (b, Arc::new(plane)))
                .collect())
        }
    }

    /// Decoded tiles for `band`, from cache or storage, in `tiles` order.
    async fn tiles(&self, band: usize, tiles: &[usize]) -> CatalogResult<Vec<TileData>> {
        let mut found: Vec<Option<TileData>> = vec![None; tiles.len()];
        let mut missing = Vec::new();
        {
            let mut cache = self.cache.lock().await;
            for (i, tile) in tiles.iter().enumerate() {
                match cache.get(&(self.cache_slot, band, *tile)) {
                    Some(data) => found[i] = Some(data),
                    None => missing.push(i),
                }
            }
        }

        if !missing.is_empty() {
            debug!(
                location = %self.reader.location(),
                band = band,
                fetching = missing.len(),
                cached = tiles.len() - missing.len(),
                "Loading tiles"
            );
            let loaded = try_join_all(missing.iter().map(|&i| self.load_tile(band, tiles[i]))).await?;

            let mut cache = self.cache.lock().await;
            for (&i, planes) in missing.iter().zip(loaded) {
                for (b, data) in planes {
                    if b == band {
                        found[i] = Some(Arc::clone(&data));
                    }
                    cache.insert((self.cache_slot, b, tiles[i]), data);
                }
            }
        }

        found
            .into_iter()
            .map(|data| {
                data.ok_or_else(|| CatalogError::Internal("decoded tile missing band".to_string()))
            })
            .collect()
    }
}

#[async_trait]
impl RasterSource for TiffSource {
    fn location(&self) -> &str {
        self.reader.location()
    }

    fn width(&self) -> usize {
        self.layout.width
    }

    fn height(&self) -> usize {
        self.layout.height
    }

    fn band_count(&self) -> usize {
        self.layout.samples_per_pixel
    }

    fn block_shape(&self) -> (usize, usize) {
        (self.layout.tile_width, self.layout.tile_height)
    }

    fn geo_transform(&self) -> Option<GeoTransform> {
        self.layout.geo_transform
    }

    fn crs(&self) -> Option<Crs> {
        self.layout.crs.clone()
    }

    fn band_info(&self, band: usize) -> BandInfo {
        BandInfo {
            description: self.layout.descriptions.get(&band).cloned(),
            nodata: self.layout.nodata,
        }
    }

    async fn read_window(&self, band: usize, window: Window) -> CatalogResult<Vec<f64>> {
        check_request(self, band, &window)?;

        let layout = &self.layout;
        let mut out = vec![layout.fill(); window.len()];
        if window.is_empty() {
            return Ok(out);
        }

        let (tw, th) = (layout.tile_width, layout.tile_height);
        let cols = window.col_off / tw..=(window.col_end() - 1) / tw;
        let rows = window.row_off / th..=(window.row_end() - 1) / th;
        let wanted: Vec<usize> = rows
            .flat_map(|tr| cols.clone().map(move |tc| tr * layout.tiles_across + tc))
            .collect();

        let tiles = self.tiles(band, &wanted).await?;

        for (tile, data) in wanted.iter().zip(tiles) {
            let tile_window = Window::new(
                (tile % layout.tiles_across) * tw,
                (tile / layout.tiles_across) * th,
                tw,
                th,
            );
            let Some(overlap) = tile_window.intersection(&window) else {
                continue;
            };
            for row in overlap.row_off..overlap.row_end() {
                let src = (row - tile_window.row_off) * tw + (overlap.col_off - tile_window.col_off);
                let dst = (row - window.row_off) * window.width + (overlap.col_off - window.col_off);
                out[dst..dst + overlap.width].copy_from_slice(&data[src..src + overlap.width]);
            }
        }

        Ok(out)
    }
}
