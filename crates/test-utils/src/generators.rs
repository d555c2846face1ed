//! Generators for the non-TIFF fixtures: VRT mosaics, GeoJSON documents
//! and Parquet tables.

use std::sync::Arc;

use arrow_array::{ArrayRef, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema};
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use serde_json::{json, Value};

/// One member GeoTIFF placed in a VRT mosaic.
#[derive(Debug, Clone)]
pub struct VrtMember {
    /// `SourceFilename` text.
    pub filename: String,
    pub relative: bool,
    pub width: usize,
    pub height: usize,
    /// Destination offset in the mosaic, in pixels.
    pub x_off: usize,
    pub y_off: usize,
}

impl VrtMember {
    pub fn relative(filename: impl Into<String>, width: usize, height: usize, x_off: usize, y_off: usize) -> Self {
        Self {
            filename: filename.into(),
            relative: true,
            width,
            height,
            x_off,
            y_off,
        }
    }

    pub fn absolute(filename: impl Into<String>, width: usize, height: usize, x_off: usize, y_off: usize) -> Self {
        Self {
            relative: false,
            ..Self::relative(filename, width, height, x_off, y_off)
        }
    }
}

/// Single-band VRT mosaic XML.
pub fn vrt_mosaic(
    width: usize,
    height: usize,
    geo_transform: [f64; 6],
    epsg: Option<u32>,
    nodata: Option<f64>,
    members: &[VrtMember],
) -> String {
    let mut xml = format!(
        "<VRTDataset rasterXSize=\"{}\" rasterYSize=\"{}\">\n",
        width, height
    );
    if let Some(code) = epsg {
        xml.push_str(&format!("  <SRS>EPSG:{}</SRS>\n", code));
    }
    let gt: Vec<String> = geo_transform.iter().map(|v| v.to_string()).collect();
    xml.push_str(&format!("  <GeoTransform>{}</GeoTransform>\n", gt.join(", ")));
    xml.push_str("  <VRTRasterBand dataType=\"Float32\" band=\"1\">\n");
    if let Some(nodata) = nodata {
        xml.push_str(&format!("    <NoDataValue>{}</NoDataValue>\n", nodata));
    }
    for member in members {
        xml.push_str(&format!(
            "    <SimpleSource>\n      <SourceFilename relativeToVRT=\"{}\">{}</SourceFilename>\n      <SourceBand>1</SourceBand>\n      <SrcRect xOff=\"0\" yOff=\"0\" xSize=\"{w}\" ySize=\"{h}\"/>\n      <DstRect xOff=\"{}\" yOff=\"{}\" xSize=\"{w}\" ySize=\"{h}\"/>\n    </SimpleSource>\n",
            u8::from(member.relative),
            member.filename,
            member.x_off,
            member.y_off,
            w = member.width,
            h = member.height,
        ));
    }
    xml.push_str("  </VRTRasterBand>\n</VRTDataset>\n");
    xml
}

/// Point feature collection with one numeric and one text property per
/// feature. Feature `i` sits at `(x0 + i, y0 + i)`.
pub fn point_features(count: usize, x0: f64, y0: f64) -> Value {
    let features: Vec<Value> = (0..count)
        .map(|i| {
            json!({
                "type": "Feature",
                "id": i,
                "geometry": {"type": "Point", "coordinates": [x0 + i as f64, y0 + i as f64]},
                "properties": {"ID": format!("gage-{}", i), "Q_cms": i as f64 * 1.5}
            })
        })
        .collect();
    json!({"type": "FeatureCollection", "features": features})
}

/// Hydrofabric-like flowpath attribute table: `id`, `TopWdth`, `n`, `Y`.
pub fn flowpath_batch(rows: usize) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("name", DataType::Utf8, true),
        Field::new("TopWdth", DataType::Float64, true),
        Field::new("n", DataType::Float64, true),
        Field::new("Y", DataType::Float64, true),
    ]));
    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from_iter_values(0..rows as i64)),
        Arc::new(StringArray::from_iter_values((0..rows).map(|i| format!("wb-{}", i)))),
        Arc::new(Float64Array::from_iter_values((0..rows).map(|i| 10.0 + i as f64))),
        Arc::new(Float64Array::from_iter_values((0..rows).map(|_| 0.035))),
        Arc::new(Float64Array::from_iter_values((0..rows).map(|i| 1.0 + i as f64 * 0.1))),
    ];
    RecordBatch::try_new(schema, columns).expect("valid flowpath batch")
}

/// Encode batches into a Parquet file with `row_group_size` rows per group.
pub fn parquet_bytes(batches: &[RecordBatch], row_group_size: usize) -> Vec<u8> {
    let schema = batches
        .first()
        .map(|b| b.schema())
        .expect("at least one batch");
    let props = WriterProperties::builder()
        .set_max_row_group_size(row_group_size)
        .build();

    let mut out = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut out, schema, Some(props)).expect("parquet writer");
    for batch in batches {
        writer.write(batch).expect("write batch");
    }
    writer.close().expect("close parquet writer");
    out
}
