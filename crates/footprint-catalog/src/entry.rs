//! Typed row view of the catalog.
//!
//! The merge engine works on Arrow batches; [`CatalogEntry`] exists for
//! fixtures, tests and tooling that want to build or inspect rows one at a
//! time.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, AsArray, BinaryArray, Float64Array, Int64Array, StringArray, StructArray,
};
use arrow::buffer::NullBuffer;
use arrow::datatypes::{DataType, Float64Type};
use arrow::record_batch::RecordBatch;
use geo_types::Geometry;

use crate::error::{CatalogError, Result};
use crate::geometry::{BBox, decode_wkb, encode_wkb};
use crate::schema::{bbox_fields, columns, snapshot_schema};

/// One catalog record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CatalogEntry {
    /// Unique identity.
    pub id: String,
    /// Title.
    pub title: Option<String>,
    /// Acquisition date/time (ISO-8601 text).
    pub datetime: Option<String>,
    /// Ground sample distance in meters.
    pub gsd: Option<f64>,
    /// Platform type.
    pub platform_type: Option<String>,
    /// Producer name.
    pub producer_name: Option<String>,
    /// License text.
    pub license: Option<String>,
    /// COG location.
    pub cog_href: Option<String>,
    /// Thumbnail location.
    pub thumbnail_href: Option<String>,
    /// File size in bytes.
    pub file_size: Option<i64>,
    /// Width in pixels.
    pub width: Option<i64>,
    /// Height in pixels.
    pub height: Option<i64>,
    /// Band count.
    pub bands: Option<i64>,
    /// Source EPSG code.
    pub epsg: Option<i64>,
    /// Uploading user.
    pub uploaded_by: Option<String>,
    /// Upload timestamp.
    pub uploaded_at: Option<String>,
    /// Footprint (WGS84).
    pub geometry: Option<Geometry<f64>>,
    /// Covering bbox.
    pub bbox: Option<BBox>,
}

impl CatalogEntry {
    /// Creates an entry with only an id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Sets the geometry and its derived bbox.
    #[must_use]
    pub fn with_geometry(mut self, geometry: Geometry<f64>) -> Self {
        self.bbox = BBox::from_geometry(&geometry);
        self.geometry = Some(geometry);
        self
    }

    /// Sets the upload timestamp.
    #[must_use]
    pub fn with_uploaded_at(mut self, uploaded_at: impl Into<String>) -> Self {
        self.uploaded_at = Some(uploaded_at.into());
        self
    }

    /// Sets the title.
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// Builds a canonical `bbox` struct column.
#[must_use]
pub fn bbox_array(values: &[Option<BBox>]) -> ArrayRef {
    let child = |f: fn(&BBox) -> f64| -> ArrayRef {
        Arc::new(Float64Array::from(
            values.iter().map(|b| b.as_ref().map(f)).collect::<Vec<_>>(),
        ))
    };
    let children = vec![
        child(|b| b.xmin),
        child(|b| b.ymin),
        child(|b| b.xmax),
        child(|b| b.ymax),
    ];
    let validity: Vec<bool> = values.iter().map(Option::is_some).collect();
    let nulls = NullBuffer::from(validity);
    let nulls = (nulls.null_count() > 0).then_some(nulls);
    Arc::new(StructArray::new(bbox_fields(), children, nulls))
}

/// Rebuilds a canonical `bbox` column with `patches` applied.
///
/// Rows with a patch take the patched value; every other row is copied from
/// `original` as is, including structs with some null coordinates.
#[must_use]
pub fn patch_bbox_array(original: &StructArray, patches: &[Option<BBox>]) -> ArrayRef {
    let coord = |b: &BBox, i: usize| [b.xmin, b.ymin, b.xmax, b.ymax][i];
    let children: Vec<ArrayRef> = (0..4)
        .map(|i| {
            let source = original.column(i).as_primitive_opt::<Float64Type>();
            let values: Vec<Option<f64>> = patches
                .iter()
                .enumerate()
                .map(|(row, patch)| match patch {
                    Some(b) => Some(coord(b, i)),
                    None => source.filter(|c| c.is_valid(row)).map(|c| c.value(row)),
                })
                .collect();
            Arc::new(Float64Array::from(values)) as ArrayRef
        })
        .collect();
    let validity: Vec<bool> = patches
        .iter()
        .enumerate()
        .map(|(row, patch)| patch.is_some() || original.is_valid(row))
        .collect();
    let nulls = NullBuffer::from(validity);
    let nulls = (nulls.null_count() > 0).then_some(nulls);
    Arc::new(StructArray::new(bbox_fields(), children, nulls))
}

/// Reads row `row` of a canonical `bbox` column.
///
/// Returns `None` when the struct or any of its children is null.
#[must_use]
pub fn bbox_at(bbox: &StructArray, row: usize) -> Option<BBox> {
    if bbox.is_null(row) {
        return None;
    }
    let mut values = [0.0_f64; 4];
    for (i, value) in values.iter_mut().enumerate() {
        let child = bbox.column(i).as_primitive_opt::<Float64Type>()?;
        if child.is_null(row) {
            return None;
        }
        *value = child.value(row);
    }
    Some(BBox::new(values[0], values[1], values[2], values[3]))
}

fn strings(values: impl Iterator<Item = Option<String>>) -> ArrayRef {
    Arc::new(StringArray::from(values.collect::<Vec<_>>()))
}

fn ints(values: impl Iterator<Item = Option<i64>>) -> ArrayRef {
    Arc::new(Int64Array::from(values.collect::<Vec<_>>()))
}

/// Converts entries into a batch with the canonical snapshot schema.
///
/// # Errors
///
/// Returns an error if Arrow rejects the assembled batch.
pub fn entries_to_batch(entries: &[CatalogEntry]) -> Result<RecordBatch> {
    let e = entries;
    let wkb: Vec<Option<Vec<u8>>> = e
        .iter()
        .map(|x| x.geometry.as_ref().map(encode_wkb))
        .collect();
    let bboxes: Vec<Option<BBox>> = e.iter().map(|x| x.bbox).collect();

    let arrays: Vec<ArrayRef> = vec![
        strings(e.iter().map(|x| Some(x.id.clone()))),
        strings(e.iter().map(|x| x.title.clone())),
        strings(e.iter().map(|x| x.datetime.clone())),
        Arc::new(Float64Array::from(e.iter().map(|x| x.gsd).collect::<Vec<_>>())),
        strings(e.iter().map(|x| x.platform_type.clone())),
        strings(e.iter().map(|x| x.producer_name.clone())),
        strings(e.iter().map(|x| x.license.clone())),
        strings(e.iter().map(|x| x.cog_href.clone())),
        strings(e.iter().map(|x| x.thumbnail_href.clone())),
        ints(e.iter().map(|x| x.file_size)),
        ints(e.iter().map(|x| x.width)),
        ints(e.iter().map(|x| x.height)),
        ints(e.iter().map(|x| x.bands)),
        ints(e.iter().map(|x| x.epsg)),
        strings(e.iter().map(|x| x.uploaded_by.clone())),
        strings(e.iter().map(|x| x.uploaded_at.clone())),
        Arc::new(BinaryArray::from(
            wkb.iter().map(Option::as_deref).collect::<Vec<_>>(),
        )),
        bbox_array(&bboxes),
    ];

    RecordBatch::try_new(snapshot_schema(), arrays).map_err(|e| CatalogError::Parquet {
        message: format!("record batch build failed: {e}"),
    })
}

fn col<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a ArrayRef> {
    batch
        .column_by_name(name)
        .ok_or_else(|| CatalogError::Parquet {
            message: format!("missing column: {name}"),
        })
}

fn type_error(name: &str, found: &DataType) -> CatalogError {
    CatalogError::Parquet {
        message: format!("column {name} has unexpected type {found}"),
    }
}

fn col_string<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    let array = col(batch, name)?;
    array
        .as_string_opt::<i32>()
        .ok_or_else(|| type_error(name, array.data_type()))
}

fn col_i64<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Int64Array> {
    let array = col(batch, name)?;
    array
        .as_primitive_opt()
        .ok_or_else(|| type_error(name, array.data_type()))
}

fn opt_string(array: &StringArray, row: usize) -> Option<String> {
    array.is_valid(row).then(|| array.value(row).to_string())
}

fn opt_i64(array: &Int64Array, row: usize) -> Option<i64> {
    array.is_valid(row).then(|| array.value(row))
}

/// Reads entries back from a batch with canonical columns.
///
/// Extra columns are ignored.
///
/// # Errors
///
/// Returns an error if a canonical column is missing, has the wrong type, or
/// holds undecodable WKB.
pub fn batch_to_entries(batch: &RecordBatch) -> Result<Vec<CatalogEntry>> {
    let id = col_string(batch, columns::ID)?;
    let title = col_string(batch, columns::TITLE)?;
    let datetime = col_string(batch, columns::DATETIME)?;
    let gsd_col = col(batch, columns::GSD)?;
    let gsd = gsd_col
        .as_primitive_opt::<Float64Type>()
        .ok_or_else(|| type_error(columns::GSD, gsd_col.data_type()))?;
    let platform_type = col_string(batch, columns::PLATFORM_TYPE)?;
    let producer_name = col_string(batch, columns::PRODUCER_NAME)?;
    let license = col_string(batch, columns::LICENSE)?;
    let cog_href = col_string(batch, columns::COG_HREF)?;
    let thumbnail_href = col_string(batch, columns::THUMBNAIL_HREF)?;
    let file_size = col_i64(batch, columns::FILE_SIZE)?;
    let width = col_i64(batch, columns::WIDTH)?;
    let height = col_i64(batch, columns::HEIGHT)?;
    let bands = col_i64(batch, columns::BANDS)?;
    let epsg = col_i64(batch, columns::EPSG)?;
    let uploaded_by = col_string(batch, columns::UPLOADED_BY)?;
    let uploaded_at = col_string(batch, columns::UPLOADED_AT)?;
    let geometry_col = col(batch, columns::GEOMETRY)?;
    let geometry = geometry_col
        .as_binary_opt::<i32>()
        .ok_or_else(|| type_error(columns::GEOMETRY, geometry_col.data_type()))?;
    let bbox_col = col(batch, columns::BBOX)?;
    let bbox = bbox_col
        .as_struct_opt()
        .ok_or_else(|| type_error(columns::BBOX, bbox_col.data_type()))?;

    let mut entries = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let geom = if geometry.is_valid(row) {
            let decoded = decode_wkb(geometry.value(row)).map_err(|e| CatalogError::Parquet {
                message: format!("row {row}: invalid geometry: {e}"),
            })?;
            Some(decoded)
        } else {
            None
        };
        entries.push(CatalogEntry {
            id: id.value(row).to_string(),
            title: opt_string(title, row),
            datetime: opt_string(datetime, row),
            gsd: gsd.is_valid(row).then(|| gsd.value(row)),
            platform_type: opt_string(platform_type, row),
            producer_name: opt_string(producer_name, row),
            license: opt_string(license, row),
            cog_href: opt_string(cog_href, row),
            thumbnail_href: opt_string(thumbnail_href, row),
            file_size: opt_i64(file_size, row),
            width: opt_i64(width, row),
            height: opt_i64(height, row),
            bands: opt_i64(bands, row),
            epsg: opt_i64(epsg, row),
            uploaded_by: opt_string(uploaded_by, row),
            uploaded_at: opt_string(uploaded_at, row),
            geometry: geom,
            bbox: bbox_at(bbox, row),
        });
    }
    Ok(entries)
}
