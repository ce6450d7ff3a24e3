//! Parquet encoding/decoding helpers for catalog snapshots and fragments.
//!
//! Snapshots are GeoParquet 1.1: `geometry` is WKB and the `bbox` struct is
//! declared as its covering, so readers can prune row groups on bbox
//! statistics. The writer emits no wall-clock metadata; the same batch and
//! settings always produce the same bytes.

use std::collections::BTreeMap;
use std::io::Cursor;

use arrow::array::{Array, AsArray};
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use serde::{Deserialize, Serialize};

use crate::config::SnapshotCompression;
use crate::entry::bbox_at;
use crate::error::{CatalogError, Result};
use crate::geometry::BBox;
use crate::schema::{BBOX_FIELDS, columns};

/// Key of the GeoParquet file metadata entry.
pub const GEO_METADATA_KEY: &str = "geo";

/// GeoParquet specification version written.
pub const GEOPARQUET_VERSION: &str = "1.1.0";

const ZSTD_LEVEL: i32 = 3;

/// Physical layout settings for snapshot files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSettings {
    /// Maximum rows per row group.
    pub max_row_group_size: usize,
    /// Compression codec.
    pub compression: SnapshotCompression,
}

impl Default for WriteSettings {
    fn default() -> Self {
        Self {
            max_row_group_size: crate::config::DEFAULT_ROW_GROUP_SIZE,
            compression: SnapshotCompression::default(),
        }
    }
}

/// GeoParquet `geo` metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoMetadata {
    /// Specification version.
    pub version: String,
    /// Name of the primary geometry column.
    pub primary_column: String,
    /// Per-column geometry descriptions.
    pub columns: BTreeMap<String, GeoColumn>,
}

/// Description of one geometry column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoColumn {
    /// Geometry encoding.
    pub encoding: String,
    /// Geometry types present; empty means unspecified.
    pub geometry_types: Vec<String>,
    /// Extent of all rows as `[xmin, ymin, xmax, ymax]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[f64; 4]>,
    /// Covering columns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub covering: Option<Covering>,
}

/// GeoParquet covering declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Covering {
    /// Paths of the bbox struct children.
    pub bbox: BTreeMap<String, [String; 2]>,
}

impl GeoMetadata {
    /// Builds the metadata for a snapshot batch.
    #[must_use]
    pub fn for_snapshot(batch: &RecordBatch) -> Self {
        let covering = Covering {
            bbox: BBOX_FIELDS
                .iter()
                .map(|child| {
                    (
                        (*child).to_string(),
                        [columns::BBOX.to_string(), (*child).to_string()],
                    )
                })
                .collect(),
        };
        let column = GeoColumn {
            encoding: "WKB".to_string(),
            geometry_types: Vec::new(),
            bbox: extent(batch).map(|b| [b.xmin, b.ymin, b.xmax, b.ymax]),
            covering: Some(covering),
        };
        Self {
            version: GEOPARQUET_VERSION.to_string(),
            primary_column: columns::GEOMETRY.to_string(),
            columns: BTreeMap::from([(columns::GEOMETRY.to_string(), column)]),
        }
    }
}

/// Union of all non-null bboxes in the batch.
fn extent(batch: &RecordBatch) -> Option<BBox> {
    let bbox = batch.column_by_name(columns::BBOX)?.as_struct_opt()?;
    (0..bbox.len())
        .filter_map(|row| bbox_at(bbox, row))
        .filter(BBox::is_finite)
        .reduce(|acc, b| {
            BBox::new(
                acc.xmin.min(b.xmin),
                acc.ymin.min(b.ymin),
                acc.xmax.max(b.xmax),
                acc.ymax.max(b.ymax),
            )
        })
}

fn compression(codec: SnapshotCompression) -> Result<Compression> {
    Ok(match codec {
        SnapshotCompression::Zstd => {
            let level = ZstdLevel::try_new(ZSTD_LEVEL).map_err(|e| CatalogError::Parquet {
                message: format!("invalid zstd level: {e}"),
            })?;
            Compression::ZSTD(level)
        }
        SnapshotCompression::Snappy => Compression::SNAPPY,
        SnapshotCompression::Uncompressed => Compression::UNCOMPRESSED,
    })
}

fn writer_properties(batch: &RecordBatch, settings: &WriteSettings) -> Result<WriterProperties> {
    let geo = serde_json::to_string(&GeoMetadata::for_snapshot(batch)).map_err(|e| {
        CatalogError::Parquet {
            message: format!("geo metadata encoding failed: {e}"),
        }
    })?;
    let created_by = KeyValue {
        key: "created_by".to_string(),
        value: Some("footprint-catalog".to_string()),
    };
    let geo = KeyValue {
        key: GEO_METADATA_KEY.to_string(),
        value: Some(geo),
    };
    Ok(WriterProperties::builder()
        .set_max_row_group_size(settings.max_row_group_size)
        .set_compression(compression(settings.compression)?)
        .set_key_value_metadata(Some(vec![created_by, geo]))
        .build())
}

/// Encodes a snapshot batch as GeoParquet.
///
/// # Errors
///
/// Returns [`CatalogError::Parquet`] if the writer rejects the batch.
pub fn write_snapshot(batch: &RecordBatch, settings: &WriteSettings) -> Result<Bytes> {
    let props = writer_properties(batch, settings)?;
    write_batches(batch.schema(), std::slice::from_ref(batch), props)
}

/// Encodes batches as plain Parquet (no geo metadata), as the ingestion side
/// does for fragments.
///
/// # Errors
///
/// Returns [`CatalogError::Parquet`] if the writer rejects a batch.
pub fn write_fragment(batch: &RecordBatch) -> Result<Bytes> {
    write_batches(
        batch.schema(),
        std::slice::from_ref(batch),
        WriterProperties::builder().build(),
    )
}

fn write_batches(
    schema: SchemaRef,
    batches: &[RecordBatch],
    props: WriterProperties,
) -> Result<Bytes> {
    let mut cursor = Cursor::new(Vec::<u8>::new());
    let mut writer = ArrowWriter::try_new(&mut cursor, schema, Some(props)).map_err(|e| {
        CatalogError::Parquet {
            message: format!("parquet writer init failed: {e}"),
        }
    })?;
    for batch in batches {
        writer.write(batch).map_err(|e| CatalogError::Parquet {
            message: format!("parquet write failed: {e}"),
        })?;
    }
    writer.close().map_err(|e| CatalogError::Parquet {
        message: format!("parquet close failed: {e}"),
    })?;
    Ok(Bytes::from(cursor.into_inner()))
}

/// Decoded Parquet file.
#[derive(Debug, Clone)]
pub struct DecodedFile {
    /// File schema (present even when the file has no rows).
    pub schema: SchemaRef,
    /// Row batches in file order.
    pub batches: Vec<RecordBatch>,
    /// File-level key/value metadata.
    pub metadata: BTreeMap<String, String>,
}

impl DecodedFile {
    /// Returns the total row count.
    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(RecordBatch::num_rows).sum()
    }

    /// Returns the parsed `geo` metadata, if present and valid.
    #[must_use]
    pub fn geo_metadata(&self) -> Option<GeoMetadata> {
        self.metadata
            .get(GEO_METADATA_KEY)
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

/// Decodes a Parquet file.
///
/// # Errors
///
/// Returns [`CatalogError::Parquet`] if the bytes are not a readable Parquet
/// file.
pub fn read_parquet(bytes: &Bytes) -> Result<DecodedFile> {
    let builder =
        ParquetRecordBatchReaderBuilder::try_new(bytes.clone()).map_err(|e| {
            CatalogError::Parquet {
                message: format!("parquet reader init failed: {e}"),
            }
        })?;
    let schema = builder.schema().clone();
    let metadata = builder
        .metadata()
        .file_metadata()
        .key_value_metadata()
        .map(|kvs| {
            kvs.iter()
                .filter_map(|kv| kv.value.as_ref().map(|v| (kv.key.clone(), v.clone())))
                .collect()
        })
        .unwrap_or_default();
    let reader = builder.build().map_err(|e| CatalogError::Parquet {
        message: format!("parquet reader build failed: {e}"),
    })?;

    let mut batches = Vec::new();
    for batch in reader {
        let batch = batch.map_err(|e| CatalogError::Parquet {
            message: format!("parquet read batch failed: {e}"),
        })?;
        batches.push(batch);
    }
    Ok(DecodedFile {
        schema,
        batches,
        metadata,
    })
}
