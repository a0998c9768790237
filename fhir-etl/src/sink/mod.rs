//! Parquet warehouse sink.
//!
//! One writer per resource type, created lazily on first write. The per-type
//! writer is the unit of mutual exclusion: concurrent writes to different
//! types proceed independently, writes to the same type serialize on its
//! mutex. Part files rotate once the serialized-byte estimate for the open
//! part exceeds the configured budget, and every part is finalized with a
//! proper footer on close.

use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use arrow::array::{
    ArrayRef, BooleanBuilder, Float64Builder, Int64Builder, ListBuilder, StringBuilder,
    StructBuilder,
};
use arrow::datatypes::{DataType, Field, SchemaRef};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use tracing::{debug, info, warn};

use crate::dwh::DwhFiles;
use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::fhir::Resource;
use crate::metrics::ETL_PARQUET_FILES_TOTAL;
use crate::schema::{
    tag_struct_fields, SchemaRegistry, ID_COLUMN, LAST_UPDATED_COLUMN, RESOURCE_COLUMN,
    TAGS_COLUMN, VERSION_ID_COLUMN,
};
use crate::{bail, etl_error};

/// Rows buffered in memory before a record batch is handed to the writer.
const WRITE_BATCH_ROWS: usize = 1024;

enum ColumnBuilder {
    Utf8(StringBuilder),
    Bool(BooleanBuilder),
    Int(Int64Builder),
    Float(Float64Builder),
    Tags(ListBuilder<StructBuilder>),
}

impl ColumnBuilder {
    fn for_field(field: &Field) -> EtlResult<Self> {
        if field.name() == TAGS_COLUMN {
            let item_field = Field::new("item", DataType::Struct(tag_struct_fields()), true);
            let values = StructBuilder::from_fields(tag_struct_fields(), 0);
            return Ok(ColumnBuilder::Tags(
                ListBuilder::new(values).with_field(Arc::new(item_field)),
            ));
        }

        match field.data_type() {
            DataType::Utf8 => Ok(ColumnBuilder::Utf8(StringBuilder::new())),
            DataType::Boolean => Ok(ColumnBuilder::Bool(BooleanBuilder::new())),
            DataType::Int64 => Ok(ColumnBuilder::Int(Int64Builder::new())),
            DataType::Float64 => Ok(ColumnBuilder::Float(Float64Builder::new())),
            other => Err(etl_error!(
                ErrorKind::SchemaError,
                "unsupported column type in resource schema",
                format!("{}: {other}", field.name())
            )),
        }
    }

    fn finish(&mut self) -> ArrayRef {
        match self {
            ColumnBuilder::Utf8(b) => Arc::new(b.finish()),
            ColumnBuilder::Bool(b) => Arc::new(b.finish()),
            ColumnBuilder::Int(b) => Arc::new(b.finish()),
            ColumnBuilder::Float(b) => Arc::new(b.finish()),
            ColumnBuilder::Tags(b) => Arc::new(b.finish()),
        }
    }
}

/// Looks up a value in the resource body by underscore-joined element path.
fn body_value<'a>(body: &'a serde_json::Value, column_name: &str) -> Option<&'a serde_json::Value> {
    let mut current = body;
    for segment in column_name.split('_') {
        current = current.get(segment)?;
    }
    Some(current)
}

struct RowBuffer {
    schema: SchemaRef,
    builders: Vec<ColumnBuilder>,
    rows: usize,
}

impl RowBuffer {
    fn new(schema: SchemaRef) -> EtlResult<Self> {
        let builders = schema
            .fields()
            .iter()
            .map(|f| ColumnBuilder::for_field(f))
            .collect::<EtlResult<Vec<_>>>()?;

        Ok(RowBuffer {
            schema,
            builders,
            rows: 0,
        })
    }

    fn append(&mut self, resource: &Resource, resource_json: &str) -> EtlResult<()> {
        for (field, builder) in self.schema.fields().iter().zip(self.builders.iter_mut()) {
            match builder {
                ColumnBuilder::Tags(tags) => {
                    for coding in &resource.meta.tag {
                        let entry = tags.values();
                        entry
                            .field_builder::<StringBuilder>(0)
                            .ok_or_else(|| tag_builder_error())?
                            .append_option(coding.system.as_deref());
                        entry
                            .field_builder::<StringBuilder>(1)
                            .ok_or_else(|| tag_builder_error())?
                            .append_option(coding.code.as_deref());
                        entry.append(true);
                    }
                    tags.append(true);
                }
                ColumnBuilder::Utf8(b) => match field.name().as_str() {
                    ID_COLUMN => b.append_value(&resource.id),
                    VERSION_ID_COLUMN => b.append_option(resource.meta.version_id.as_deref()),
                    LAST_UPDATED_COLUMN => b.append_option(resource.meta.last_updated.as_deref()),
                    RESOURCE_COLUMN => b.append_value(resource_json),
                    name => {
                        let value = body_value(resource.body(), name);
                        match value {
                            Some(serde_json::Value::String(s)) => b.append_value(s),
                            Some(serde_json::Value::Null) | None => b.append_null(),
                            // Non-string scalars in a string column keep their
                            // JSON rendering.
                            Some(other) => b.append_value(other.to_string()),
                        }
                    }
                },
                ColumnBuilder::Bool(b) => {
                    b.append_option(
                        body_value(resource.body(), field.name()).and_then(|v| v.as_bool()),
                    );
                }
                ColumnBuilder::Int(b) => {
                    b.append_option(
                        body_value(resource.body(), field.name()).and_then(|v| v.as_i64()),
                    );
                }
                ColumnBuilder::Float(b) => {
                    b.append_option(
                        body_value(resource.body(), field.name()).and_then(|v| v.as_f64()),
                    );
                }
            }
        }

        self.rows += 1;
        Ok(())
    }

    fn finish(&mut self) -> EtlResult<RecordBatch> {
        let arrays: Vec<ArrayRef> = self.builders.iter_mut().map(|b| b.finish()).collect();
        self.rows = 0;
        Ok(RecordBatch::try_new(self.schema.clone(), arrays)?)
    }
}

fn tag_builder_error() -> EtlError {
    etl_error!(
        ErrorKind::ConversionError,
        "tag struct builder does not match the tag schema"
    )
}

struct TypeWriter {
    resource_type: String,
    schema: SchemaRef,
    dir: PathBuf,
    part_index: usize,
    writer: ArrowWriter<File>,
    buffer: RowBuffer,
    part_bytes_estimate: usize,
    rows_written: u64,
}

impl TypeWriter {
    fn create(resource_type: &str, schema: SchemaRef, dir: PathBuf) -> EtlResult<Self> {
        std::fs::create_dir_all(&dir)?;
        let writer = Self::open_part(&dir, 0, &schema)?;
        let buffer = RowBuffer::new(schema.clone())?;

        Ok(TypeWriter {
            resource_type: resource_type.to_string(),
            schema,
            dir,
            part_index: 0,
            writer,
            buffer,
            part_bytes_estimate: 0,
            rows_written: 0,
        })
    }

    fn open_part(dir: &std::path::Path, index: usize, schema: &SchemaRef) -> EtlResult<ArrowWriter<File>> {
        let path = dir.join(DwhFiles::part_file_name(index));
        let file = File::create(&path)?;
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        Ok(ArrowWriter::try_new(file, schema.clone(), Some(props))?)
    }

    fn append(&mut self, resource: &Resource, row_group_size: usize) -> EtlResult<()> {
        if self.part_bytes_estimate >= row_group_size {
            self.flush_buffer()?;
            self.rotate()?;
        }

        let resource_json = resource.to_json_string()?;
        self.part_bytes_estimate += resource_json.len();
        self.buffer.append(resource, &resource_json)?;
        self.rows_written += 1;

        if self.buffer.rows >= WRITE_BATCH_ROWS {
            self.flush_buffer()?;
        }
        Ok(())
    }

    fn flush_buffer(&mut self) -> EtlResult<()> {
        if self.buffer.rows == 0 {
            return Ok(());
        }
        let batch = self.buffer.finish()?;
        self.writer.write(&batch)?;
        Ok(())
    }

    fn rotate(&mut self) -> EtlResult<()> {
        self.part_index += 1;
        let next = Self::open_part(&self.dir, self.part_index, &self.schema)?;
        let finished = std::mem::replace(&mut self.writer, next);
        finished.close()?;
        metrics::counter!(ETL_PARQUET_FILES_TOTAL).increment(1);

        debug!(
            resource_type = %self.resource_type,
            part = self.part_index,
            "rotated parquet part file"
        );
        self.part_bytes_estimate = 0;
        Ok(())
    }

    fn close(mut self) -> EtlResult<u64> {
        self.flush_buffer()?;
        self.writer.close()?;
        metrics::counter!(ETL_PARQUET_FILES_TOTAL).increment(1);
        Ok(self.rows_written)
    }
}

enum TypeWriterState {
    Open(TypeWriter),
    /// The writer hit an I/O error and was discarded; writes to this type
    /// keep failing until the pipeline restarts.
    Failed(String),
}

/// The warehouse sink: per-type Parquet writers over one [`DwhFiles`] root.
pub struct ParquetSink {
    dwh: DwhFiles,
    registry: Arc<SchemaRegistry>,
    row_group_size: usize,
    writers: Mutex<HashMap<String, Arc<Mutex<TypeWriterState>>>>,
    closed: AtomicBool,
}

impl ParquetSink {
    /// Creates a sink writing under the given warehouse root.
    pub fn new(dwh: DwhFiles, registry: Arc<SchemaRegistry>, row_group_size: usize) -> Self {
        ParquetSink {
            dwh,
            registry,
            row_group_size,
            writers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Deterministic output directory for a resource type.
    pub fn resource_path(&self, resource_type: &str) -> PathBuf {
        self.dwh.resource_path(resource_type)
    }

    /// Appends one resource, creating the type's writer on first use.
    ///
    /// Safe to call from multiple worker tasks; writes to the same type
    /// serialize on that type's writer mutex.
    pub fn write(&self, resource: &Resource) -> EtlResult<()> {
        if self.closed.load(Ordering::Acquire) {
            bail!(ErrorKind::SinkClosed, "write after sink close");
        }

        let handle = self.writer_handle(&resource.resource_type)?;
        let mut state = handle.lock().unwrap_or_else(|e| e.into_inner());

        match &mut *state {
            TypeWriterState::Failed(message) => Err(etl_error!(
                ErrorKind::SinkIoError,
                "writes disabled for resource type after earlier failure",
                format!("{}: {message}", resource.resource_type)
            )),
            TypeWriterState::Open(writer) => {
                if let Err(error) = writer.append(resource, self.row_group_size) {
                    warn!(
                        resource_type = %resource.resource_type,
                        error = %error,
                        "parquet writer failed, discarding writer for type"
                    );
                    *state = TypeWriterState::Failed(error.to_string());
                    return Err(error);
                }
                Ok(())
            }
        }
    }

    fn writer_handle(&self, resource_type: &str) -> EtlResult<Arc<Mutex<TypeWriterState>>> {
        let mut writers = self.writers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = writers.get(resource_type) {
            return Ok(handle.clone());
        }

        let schema = self.registry.schema_for(resource_type)?;
        let writer = TypeWriter::create(
            resource_type,
            schema,
            self.dwh.resource_path(resource_type),
        )?;
        let handle = Arc::new(Mutex::new(TypeWriterState::Open(writer)));
        writers.insert(resource_type.to_string(), handle.clone());

        debug!(resource_type = %resource_type, "created parquet writer");
        Ok(handle)
    }

    /// Flushes and closes every writer and writes the `_types.txt` side file.
    ///
    /// Safe to call multiple times; writes after the first close fail with
    /// `SinkClosed`. All writes issued before this call are observed.
    pub fn close_all(&self) -> EtlResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let writers = {
            let mut map = self.writers.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *map)
        };

        let mut errors = Vec::new();
        for (resource_type, handle) in writers {
            let state = match Arc::try_unwrap(handle) {
                Ok(mutex) => mutex.into_inner().unwrap_or_else(|e| e.into_inner()),
                Err(handle) => {
                    // A writer still borrowed at close time means a worker
                    // was not drained first.
                    let _ = handle;
                    errors.push(etl_error!(
                        ErrorKind::SinkIoError,
                        "writer still in use during close",
                        resource_type
                    ));
                    continue;
                }
            };

            match state {
                TypeWriterState::Failed(message) => {
                    errors.push(etl_error!(
                        ErrorKind::SinkIoError,
                        "resource type failed during the run",
                        format!("{resource_type}: {message}")
                    ));
                }
                TypeWriterState::Open(writer) => match writer.close() {
                    Ok(rows) => {
                        info!(resource_type = %resource_type, rows, "closed parquet writer");
                    }
                    Err(error) => errors.push(error),
                },
            }
        }

        let types = self.dwh.find_non_empty_resource_types()?;
        self.dwh.write_types_file(&types)?;

        if errors.is_empty() {
            Ok(())
        } else {
            Err(EtlError::from_many(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fhir_etl_config::shared::FhirVersion;
    use serde_json::json;

    fn test_sink(root: &std::path::Path, row_group_size: usize) -> ParquetSink {
        let registry = Arc::new(SchemaRegistry::new(FhirVersion::R4, None, 1).unwrap());
        let dwh = DwhFiles::for_root(root).unwrap();
        ParquetSink::new(dwh, registry, row_group_size)
    }

    fn patient(id: &str) -> Resource {
        Resource::from_json(json!({
            "resourceType": "Patient",
            "id": id,
            "meta": {"versionId": "1", "lastUpdated": "2024-01-01T00:00:00Z"}
        }))
        .unwrap()
    }

    #[test]
    fn test_write_after_close_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = test_sink(tmp.path(), 1 << 20);

        sink.write(&patient("p1")).unwrap();
        sink.close_all().unwrap();
        // Second close is a no-op.
        sink.close_all().unwrap();

        let error = sink.write(&patient("p2")).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::SinkClosed);
    }

    #[test]
    fn test_types_file_written_on_close() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = test_sink(tmp.path(), 1 << 20);

        sink.write(&patient("p1")).unwrap();
        sink.close_all().unwrap();

        let dwh = DwhFiles::for_root(tmp.path()).unwrap();
        let types = dwh.read_types_file().unwrap();
        assert!(types.contains("Patient"));
    }

    #[test]
    fn test_tiny_row_group_budget_rotates_parts() {
        let tmp = tempfile::tempdir().unwrap();
        // Every resource body is larger than the budget, so each write after
        // the first should land in a fresh part.
        let sink = test_sink(tmp.path(), 1);

        for i in 0..3 {
            sink.write(&patient(&format!("p{i}"))).unwrap();
        }
        sink.close_all().unwrap();

        let dwh = DwhFiles::for_root(tmp.path()).unwrap();
        let parts = dwh
            .list_part_files(&dwh.resource_path("Patient"))
            .unwrap();
        assert_eq!(parts.len(), 3);
    }
}
