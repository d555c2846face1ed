//! In-memory GeoTIFF writer for tests.
//!
//! Produces little-endian classic TIFFs with the IFD right after the header,
//! the way Cloud-Optimized GeoTIFFs are laid out, so header-only opens can be
//! checked against byte counters.

use std::io::Write;
use std::sync::Arc;

use flate2::write::ZlibEncoder;
use flate2::Compression;

const SHORT: u16 = 3;
const LONG: u16 = 4;
const ASCII: u16 = 2;
const DOUBLE: u16 = 12;

/// Sample encoding of the written image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    U8,
    U16,
    I16,
    F32,
    F64,
}

impl SampleFormat {
    fn bits(self) -> u16 {
        match self {
            SampleFormat::U8 => 8,
            SampleFormat::U16 | SampleFormat::I16 => 16,
            SampleFormat::F32 => 32,
            SampleFormat::F64 => 64,
        }
    }

    fn size(self) -> usize {
        self.bits() as usize / 8
    }

    /// TIFF SampleFormat tag value.
    fn code(self) -> u16 {
        match self {
            SampleFormat::U8 | SampleFormat::U16 => 1,
            SampleFormat::I16 => 2,
            SampleFormat::F32 | SampleFormat::F64 => 3,
        }
    }

    fn encode(self, value: f64, out: &mut Vec<u8>) {
        match self {
            SampleFormat::U8 => out.push(value as u8),
            SampleFormat::U16 => out.extend_from_slice(&(value as u16).to_le_bytes()),
            SampleFormat::I16 => out.extend_from_slice(&(value as i16).to_le_bytes()),
            SampleFormat::F32 => out.extend_from_slice(&(value as f32).to_le_bytes()),
            SampleFormat::F64 => out.extend_from_slice(&value.to_le_bytes()),
        }
    }
}

/// Default pixel pattern: `band * 100_000 + row * width + col`.
pub fn pattern_value(band: usize, row: usize, col: usize, width: usize) -> f64 {
    (band * 100_000 + row * width + col) as f64
}

type ValueFn = Arc<dyn Fn(usize, usize, usize) -> f64 + Send + Sync>;

struct Tag {
    tag: u16,
    field_type: u16,
    count: u32,
    data: Vec<u8>,
}

impl Tag {
    fn shorts(tag: u16, values: &[u16]) -> Self {
        Self {
            tag,
            field_type: SHORT,
            count: values.len() as u32,
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    fn longs(tag: u16, values: &[u32]) -> Self {
        Self {
            tag,
            field_type: LONG,
            count: values.len() as u32,
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    fn doubles(tag: u16, values: &[f64]) -> Self {
        Self {
            tag,
            field_type: DOUBLE,
            count: values.len() as u32,
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    fn ascii(tag: u16, text: &str) -> Self {
        let mut data = text.as_bytes().to_vec();
        data.push(0);
        Self {
            tag,
            field_type: ASCII,
            count: data.len() as u32,
            data,
        }
    }

    fn out_of_line(&self) -> usize {
        if self.data.len() > 4 {
            self.data.len() + self.data.len() % 2
        } else {
            0
        }
    }
}

/// Builder for synthetic GeoTIFFs.
///
/// ```ignore
/// let tif = GeoTiffBuilder::new(64, 64).tiled(16, 16).epsg(6344).deflate().build();
/// ```
#[derive(Clone)]
pub struct GeoTiffBuilder {
    width: usize,
    height: usize,
    bands: usize,
    sample: SampleFormat,
    tile: Option<(usize, usize)>,
    rows_per_strip: usize,
    compression: u16,
    predictor: u16,
    planar: bool,
    origin: (f64, f64),
    pixel_size: (f64, f64),
    epsg: Option<u16>,
    geo_keys: Option<Vec<(u16, u16)>>,
    nodata: Option<f64>,
    descriptions: Vec<String>,
    values: Option<ValueFn>,
}

impl GeoTiffBuilder {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            bands: 1,
            sample: SampleFormat::F32,
            tile: None,
            rows_per_strip: 1,
            compression: 1,
            predictor: 1,
            planar: false,
            origin: (0.0, height as f64),
            pixel_size: (1.0, 1.0),
            epsg: None,
            geo_keys: None,
            nodata: None,
            descriptions: Vec::new(),
            values: None,
        }
    }

    pub fn bands(mut self, bands: usize) -> Self {
        self.bands = bands.max(1);
        self
    }

    pub fn sample_format(mut self, sample: SampleFormat) -> Self {
        self.sample = sample;
        self
    }

    pub fn tiled(mut self, tile_width: usize, tile_height: usize) -> Self {
        self.tile = Some((tile_width, tile_height));
        self
    }

    pub fn rows_per_strip(mut self, rows: usize) -> Self {
        self.tile = None;
        self.rows_per_strip = rows.max(1);
        self
    }

    pub fn deflate(mut self) -> Self {
        self.compression = 8;
        self
    }

    pub fn lzw(mut self) -> Self {
        self.compression = 5;
        self
    }

    /// Horizontal differencing. Integer samples only.
    pub fn predictor(mut self) -> Self {
        self.predictor = 2;
        self
    }

    /// Byte-plane shuffle plus differencing. Float samples only.
    pub fn float_predictor(mut self) -> Self {
        self.predictor = 3;
        self
    }

    pub fn planar(mut self) -> Self {
        self.planar = true;
        self
    }

    /// World coordinates of the upper-left corner.
    pub fn origin(mut self, x: f64, y: f64) -> Self {
        self.origin = (x, y);
        self
    }

    pub fn pixel_size(mut self, x: f64, y: f64) -> Self {
        self.pixel_size = (x, y);
        self
    }

    pub fn epsg(mut self, code: u16) -> Self {
        self.epsg = Some(code);
        self
    }

    /// Write these GeoKeys verbatim instead of deriving them from `epsg`.
    pub fn geo_keys(mut self, keys: &[(u16, u16)]) -> Self {
        self.geo_keys = Some(keys.to_vec());
        self
    }

    pub fn nodata(mut self, nodata: f64) -> Self {
        self.nodata = Some(nodata);
        self
    }

    pub fn descriptions<S: Into<String>>(mut self, descriptions: impl IntoIterator<Item = S>) -> Self {
        self.descriptions = descriptions.into_iter().map(Into::into).collect();
        self
    }

    /// Pixel values as a function of `(band, row, col)`.
    pub fn fill_with(mut self, f: impl Fn(usize, usize, usize) -> f64 + Send + Sync + 'static) -> Self {
        self.values = Some(Arc::new(f));
        self
    }

    pub fn value(&self, band: usize, row: usize, col: usize) -> f64 {
        match &self.values {
            Some(f) => f(band, row, col),
            None => pattern_value(band, row, col, self.width),
        }
    }

    fn block_shape(&self) -> (usize, usize) {
        match self.tile {
            Some(shape) => shape,
            None => (self.width, self.rows_per_strip.min(self.height)),
        }
    }

    /// Number of tiles or strips per band.
    pub fn block_count(&self) -> usize {
        let (bw, bh) = self.block_shape();
        self.width.div_ceil(bw) * self.height.div_ceil(bh)
    }

    fn encode_block(&self, bx: usize, by: usize, band: Option<usize>) -> Vec<u8> {
        let (bw, bh) = self.block_shape();
        let rows = match self.tile {
            Some(_) => bh,
            None => bh.min(self.height - by * bh),
        };
        let bands: Vec<usize> = match band {
            Some(b) => vec![b],
            None => (0..self.bands).collect(),
        };
        let fill = self.nodata.unwrap_or(0.0);

        let mut raw = Vec::with_capacity(bw * rows * bands.len() * self.sample.size());
        for r in 0..rows {
            for c in 0..bw {
                let (row, col) = (by * bh + r, bx * bw + c);
                for b in &bands {
                    let value = if row < self.height && col < self.width {
                        self.value(*b, row, col)
                    } else {
                        fill
                    };
                    self.sample.encode(value, &mut raw);
                }
            }
        }

        let row_bytes = bw * bands.len() * self.sample.size();
        match self.predictor {
            2 => apply_predictor(&mut raw, row_bytes, bands.len(), self.sample.size()),
            3 => apply_float_predictor(&mut raw, row_bytes, bands.len(), self.sample.size()),
            _ => {}
        }

        match self.compression {
            8 => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(&raw).expect("write to Vec");
                encoder.finish().expect("finish zlib stream")
            }
            5 => weezl::encode::Encoder::with_tiff_size_switch(weezl::BitOrder::Msb, 8)
                .encode(&raw)
                .expect("LZW encode"),
            _ => raw,
        }
    }

    fn blocks(&self) -> Vec<Vec<u8>> {
        let (bw, bh) = self.block_shape();
        let across = self.width.div_ceil(bw);
        let down = self.height.div_ceil(bh);
        let grid: Vec<(usize, usize)> = (0..down)
            .flat_map(|by| (0..across).map(move |bx| (bx, by)))
            .collect();

        if self.planar {
            (0..self.bands)
                .flat_map(|band| grid.iter().map(move |(bx, by)| (*bx, *by, Some(band))))
                .map(|(bx, by, band)| self.encode_block(bx, by, band))
                .collect()
        } else {
            grid.iter()
                .map(|(bx, by)| self.encode_block(*bx, *by, None))
                .collect()
        }
    }

    fn tags(&self, offsets: &[u32], counts: &[u32]) -> Vec<Tag> {
        let (bw, bh) = self.block_shape();
        let mut tags = vec![
            Tag::longs(256, &[self.width as u32]),
            Tag::longs(257, &[self.height as u32]),
            Tag::shorts(258, &vec![self.sample.bits(); self.bands]),
            Tag::shorts(259, &[self.compression]),
            Tag::shorts(262, &[1]),
            Tag::shorts(277, &[self.bands as u16]),
            Tag::shorts(284, &[if self.planar { 2 } else { 1 }]),
            Tag::shorts(339, &vec![self.sample.code(); self.bands]),
            Tag::doubles(33550, &[self.pixel_size.0, self.pixel_size.1, 0.0]),
            Tag::doubles(33922, &[0.0, 0.0, 0.0, self.origin.0, self.origin.1, 0.0]),
        ];

        if self.predictor != 1 {
            tags.push(Tag::shorts(317, &[self.predictor]));
        }

        match self.tile {
            Some(_) => {
                tags.push(Tag::longs(322, &[bw as u32]));
                tags.push(Tag::longs(323, &[bh as u32]));
                tags.push(Tag::longs(324, offsets));
                tags.push(Tag::longs(325, counts));
            }
            None => {
                tags.push(Tag::longs(273, offsets));
                tags.push(Tag::longs(278, &[bh as u32]));
                tags.push(Tag::longs(279, counts));
            }
        }

        let geo_keys = match (&self.geo_keys, self.epsg) {
            (Some(keys), _) => Some(keys.clone()),
            (None, Some(code)) if (4000..5000).contains(&code) => Some(vec![(1024, 2), (1025, 1), (2048, code)]),
            (None, Some(code)) => Some(vec![(1024, 1), (1025, 1), (3072, code)]),
            (None, None) => None,
        };
        if let Some(keys) = geo_keys {
            let mut directory = vec![1, 1, 0, keys.len() as u16];
            for (key, value) in keys {
                directory.extend_from_slice(&[key, 0, 1, value]);
            }
            tags.push(Tag::shorts(34735, &directory));
        }

        if !self.descriptions.is_empty() {
            let items: String = self
                .descriptions
                .iter()
                .enumerate()
                .map(|(i, d)| {
                    format!(
                        "<Item name=\"DESCRIPTION\" sample=\"{}\" role=\"description\">{}</Item>",
                        i, d
                    )
                })
                .collect();
            tags.push(Tag::ascii(42112, &format!("<GDALMetadata>{}</GDALMetadata>", items)));
        }

        if let Some(nodata) = self.nodata {
            tags.push(Tag::ascii(42113, &nodata.to_string()));
        }

        tags.sort_by_key(|t| t.tag);
        tags
    }

    /// Encode the image.
    pub fn build(&self) -> Vec<u8> {
        let blocks = self.blocks();
        let counts: Vec<u32> = blocks.iter().map(|b| b.len() as u32).collect();

        // the offsets tag has a fixed size, so lay out once with zeros
        let placeholder = self.tags(&vec![0; blocks.len()], &counts);
        let ifd_len = 2 + 12 * placeholder.len() + 4;
        let values_len: usize = placeholder.iter().map(Tag::out_of_line).sum();
        let data_start = 8 + ifd_len + values_len;

        let mut offsets = Vec::with_capacity(blocks.len());
        let mut next = data_start as u32;
        for count in &counts {
            offsets.push(next);
            next += count;
        }
        let tags = self.tags(&offsets, &counts);

        let mut out = Vec::with_capacity(next as usize);
        out.extend_from_slice(b"II");
        out.extend_from_slice(&42u16.to_le_bytes());
        out.extend_from_slice(&8u32.to_le_bytes());

        out.extend_from_slice(&(tags.len() as u16).to_le_bytes());
        let mut value_offset = 8 + ifd_len;
        for tag in &tags {
            out.extend_from_slice(&tag.tag.to_le_bytes());
            out.extend_from_slice(&tag.field_type.to_le_bytes());
            out.extend_from_slice(&tag.count.to_le_bytes());
            if tag.data.len() <= 4 {
                let mut inline = tag.data.clone();
                inline.resize(4, 0);
                out.extend_from_slice(&inline);
            } else {
                out.extend_from_slice(&(value_offset as u32).to_le_bytes());
                value_offset += tag.out_of_line();
            }
        }
        out.extend_from_slice(&0u32.to_le_bytes());

        for tag in &tags {
            if tag.data.len() > 4 {
                out.extend_from_slice(&tag.data);
                if tag.data.len() % 2 == 1 {
                    out.push(0);
                }
            }
        }
        debug_assert_eq!(out.len(), data_start);

        for block in blocks {
            out.extend_from_slice(&block);
        }
        out
    }

    /// Offset of the first pixel byte; everything before it is header.
    pub fn header_len(&self) -> usize {
        let counts = vec![0; self.block_count() * if self.planar { self.bands } else { 1 }];
        let tags = self.tags(&counts, &counts);
        8 + 2 + 12 * tags.len() + 4 + tags.iter().map(Tag::out_of_line).sum::<usize>()
    }
}

/// Horizontal differencing, in place, on little-endian integer rows.
fn apply_predictor(raw: &mut [u8], row_bytes: usize, samples: usize, size: usize) {
    let stride = samples * size;
    let mask = if size >= 8 { u64::MAX } else { (1u64 << (size * 8)) - 1 };
    let read = |b: &[u8]| b[..size].iter().rev().fold(0u64, |acc, v| (acc << 8) | *v as u64);

    for row in raw.chunks_exact_mut(row_bytes) {
        let positions: Vec<usize> = (stride..row_bytes).step_by(size).collect();
        for pos in positions.into_iter().rev() {
            let diff = read(&row[pos..]).wrapping_sub(read(&row[pos - stride..])) & mask;
            for (i, byte) in row[pos..pos + size].iter_mut().enumerate() {
                *byte = (diff >> (8 * i)) as u8;
            }
        }
    }
}

/// Floating-point predictor, in place, on little-endian float rows: split
/// each row into byte planes (most significant first), then difference.
fn apply_float_predictor(raw: &mut [u8], row_bytes: usize, samples: usize, size: usize) {
    let count = row_bytes / size;
    for row in raw.chunks_exact_mut(row_bytes) {
        let mut planes = vec![0u8; row_bytes];
        for value in 0..count {
            for significance in 0..size {
                planes[significance * count + value] = row[value * size + size - 1 - significance];
            }
        }
        for i in (samples..row_bytes).rev() {
            planes[i] = planes[i].wrapping_sub(planes[i - samples]);
        }
        row.copy_from_slice(&planes);
    }
}
