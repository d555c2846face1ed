//! Parquet tables.
//!
//! Opening fetches the 8-byte footer trailer and the metadata block it
//! points at, nothing else. Row groups are streamed on `collect`, with
//! column projection pushed into the reader.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

use arrow_array::RecordBatch;
use arrow_schema::{Field, Schema, SchemaRef};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{FutureExt, TryStreamExt};
use parquet::arrow::arrow_reader::{ArrowReaderMetadata, ArrowReaderOptions};
use parquet::arrow::async_reader::AsyncFileReader;
use parquet::arrow::{ParquetRecordBatchStreamBuilder, ProjectionMask};
use parquet::errors::{ParquetError, Result as ParquetResult};
use parquet::file::footer::{decode_footer, decode_metadata};
use parquet::file::metadata::ParquetMetaData;
use tracing::{debug, instrument};

use catalog_common::{CatalogError, CatalogResult};
use data_catalog::CatalogEntry;

use crate::reader::{ObjectReader, RangeReader};

const FOOTER_SIZE: u64 = 8;
const DEFAULT_BATCH_SIZE: usize = 8192;

/// [`AsyncFileReader`] over an [`ObjectReader`], so Parquet reads share the
/// accessor's retry policy and counters.
#[derive(Debug, Clone)]
struct ParquetObjectFile {
    reader: ObjectReader,
    metadata: Option<Arc<ParquetMetaData>>,
}

fn external(err: CatalogError) -> ParquetError {
    ParquetError::External(Box::new(err))
}

async fn read_metadata(reader: &ObjectReader) -> CatalogResult<Arc<ParquetMetaData>> {
    let invalid = |message: String| CatalogError::invalid_asset(reader.location(), message);

    let size = reader.size().await?;
    if size < FOOTER_SIZE + 4 {
        return Err(invalid(format!("{} bytes is too small for Parquet", size)));
    }

    let trailer = reader.read_range(size - FOOTER_SIZE..size).await?;
    let footer: [u8; FOOTER_SIZE as usize] = trailer[..]
        .try_into()
        .map_err(|_| invalid("truncated footer".to_string()))?;
    let metadata_len = decode_footer(&footer).map_err(|e| invalid(e.to_string()))? as u64;
    if metadata_len + FOOTER_SIZE > size {
        return Err(invalid(format!(
            "metadata length {} exceeds file size {}",
            metadata_len, size
        )));
    }

    let start = size - FOOTER_SIZE - metadata_len;
    let block = reader.read_range(start..size - FOOTER_SIZE).await?;
    let metadata = decode_metadata(&block).map_err(|e| invalid(e.to_string()))?;
    Ok(Arc::new(metadata))
}

impl AsyncFileReader for ParquetObjectFile {
    fn get_bytes(&mut self, range: Range<usize>) -> BoxFuture<'_, ParquetResult<Bytes>> {
        async move {
            self.reader
                .read_range(range.start as u64..range.end as u64)
                .await
                .map_err(external)
        }
        .boxed()
    }

    fn get_metadata(&mut self) -> BoxFuture<'_, ParquetResult<Arc<ParquetMetaData>>> {
        async move {
            if let Some(metadata) = &self.metadata {
                return Ok(Arc::clone(metadata));
            }
            let metadata = read_metadata(&self.reader).await.map_err(external)?;
            self.metadata = Some(Arc::clone(&metadata));
            Ok(metadata)
        }
        .boxed()
    }
}

fn parquet_error(location: &str, err: ParquetError) -> CatalogError {
    match err {
        ParquetError::External(inner) => match inner.downcast::<CatalogError>() {
            Ok(catalog) => *catalog,
            Err(other) => CatalogError::invalid_asset(location, other.to_string()),
        },
        other => CatalogError::invalid_asset(location, other.to_string()),
    }
}

/// Lazy handle over a Parquet table.
///
/// Column names are exposed after the entry's rename mapping; the mapping is
/// applied to each batch as it is read.
#[derive(Debug, Clone)]
pub struct TabularDataset {
    name: String,
    file: ParquetObjectFile,
    metadata: ArrowReaderMetadata,
    schema: SchemaRef,
    projection: Option<Vec<usize>>,
    batch_size: usize,
}

impl TabularDataset {
    /// Read the footer and build the renamed schema.
    #[instrument(skip(entry, reader), fields(dataset = %entry.name, location = %reader.location()))]
    pub async fn open(entry: &CatalogEntry, reader: ObjectReader) -> CatalogResult<Self> {
        let location = reader.location().to_string();
        let mut file = ParquetObjectFile {
            reader,
            metadata: None,
        };

        let metadata = ArrowReaderMetadata::load_async(&mut file, ArrowReaderOptions::new())
            .await
            .map_err(|e| parquet_error(&location, e))?;

        let schema = rename_schema(metadata.schema(), &entry.rename);

        debug!(
            columns = schema.fields().len(),
            rows = metadata.metadata().file_metadata().num_rows(),
            row_groups = metadata.metadata().num_row_groups(),
            "Opened Parquet table"
        );

        Ok(Self {
            name: entry.name.clone(),
            file,
            metadata,
            schema,
            projection: None,
            batch_size: DEFAULT_BATCH_SIZE,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn location(&self) -> &str {
        self.file.reader.location()
    }

    /// Renamed schema of the selected columns.
    pub fn schema(&self) -> SchemaRef {
        match &self.projection {
            None => Arc::clone(&self.schema),
            Some(indices) => Arc::new(Schema::new(
                indices
                    .iter()
                    .map(|i| self.schema.field(*i).clone())
                    .collect::<Vec<Field>>(),
            )),
        }
    }

    pub fn column_names(&self) -> Vec<String> {
        self.schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect()
    }

    pub fn num_rows(&self) -> i64 {
        self.metadata.metadata().file_metadata().num_rows()
    }

    pub fn num_row_groups(&self) -> usize {
        self.metadata.metadata().num_row_groups()
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Restrict to the named (renamed) columns. Output keeps file order.
    pub fn select_columns<S: AsRef<str>>(&self, names: &[S]) -> CatalogResult<Self> {
        let mut indices = names
            .iter()
            .map(|name| {
                self.schema
                    .index_of(name.as_ref())
                    .map_err(|_| CatalogError::UnknownVariable(name.as_ref().to_string()))
            })
            .collect::<CatalogResult<Vec<_>>>()?;
        indices.sort_unstable();
        indices.dedup();

        Ok(Self {
            projection: Some(indices),
            ..self.clone()
        })
    }

    /// Stream every row group and return the renamed batches.
    #[instrument(skip(self), fields(dataset = %self.name))]
    pub async fn collect(&self) -> CatalogResult<Vec<RecordBatch>> {
        let location = self.location().to_string();
        let mut builder =
            ParquetRecordBatchStreamBuilder::new_with_metadata(self.file.clone(), self.metadata.clone())
                .with_batch_size(self.batch_size);

        if let Some(indices) = &self.projection {
            let mask = ProjectionMask::roots(builder.parquet_schema(), indices.iter().copied());
            builder = builder.with_projection(mask);
        }

        let stream = builder.build().map_err(|e| parquet_error(&location, e))?;
        let batches: Vec<RecordBatch> = stream
            .try_collect()
            .await
            .map_err(|e| parquet_error(&location, e))?;

        let schema = self.schema();
        batches
            .into_iter()
            .map(|batch| {
                RecordBatch::try_new(Arc::clone(&schema), batch.columns().to_vec())
                    .map_err(|e| CatalogError::invalid_asset(&location, e.to_string()))
            })
            .collect()
    }
}

/// Apply a source -> target rename to top-level fields.
fn rename_schema(schema: &SchemaRef, rename: &BTreeMap<String, String>) -> SchemaRef {
    let fields: Vec<Field> = schema
        .fields()
        .iter()
        .map(|field| match rename.get(field.name()) {
            Some(target) => field.as_ref().clone().with_name(target.clone()),
            None => field.as_ref().clone(),
        })
        .collect();
    Arc::new(Schema::new_with_metadata(fields, schema.metadata().clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_schema::DataType;

    #[test]
    fn test_rename_schema() {
        let schema: SchemaRef = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("TopWdth", DataType::Float64, true),
            Field::new("n", DataType::Float64, true),
        ]));
        let rename = BTreeMap::from([
            ("TopWdth".to_string(), "rivwth".to_string()),
            ("n".to_string(), "manning".to_string()),
        ]);

        let renamed = rename_schema(&schema, &rename);
        let names: Vec<&str> = renamed.fields().iter().map(|f| f.name().as_str()).collect();
        assert_eq!(names, vec!["id", "rivwth", "manning"]);
        assert!(renamed.field(1).is_nullable());
    }

    #[test]
    fn test_external_error_round_trips() {
        let err = parquet_error(
            "memory://b/x.parquet",
            external(CatalogError::remote("memory://b/x.parquet", "reset")),
        );
        assert!(matches!(err, CatalogError::RemoteAccess { .. }));
    }
}
