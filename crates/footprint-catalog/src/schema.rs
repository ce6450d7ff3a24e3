//! Canonical snapshot schema and by-name schema union.
//!
//! The snapshot schema is the contract for spatial readers (DuckDB, GDAL,
//! GeoPandas). Known columns always appear first in a fixed order with a fixed
//! physical type; extra columns seen in any source are carried through after
//! them, in first-seen order.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, StructArray, new_null_array};
use arrow::compute::{CastOptions, can_cast_types, cast_with_options};
use arrow::datatypes::{DataType, Field, Fields, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use thiserror::Error;

/// Column names of the canonical snapshot schema.
pub mod columns {
    /// Unique identity of the record.
    pub const ID: &str = "id";
    /// Human readable title.
    pub const TITLE: &str = "title";
    /// Acquisition date/time (ISO-8601 text).
    pub const DATETIME: &str = "datetime";
    /// Ground sample distance in meters.
    pub const GSD: &str = "gsd";
    /// Platform type (satellite, aerial, drone...).
    pub const PLATFORM_TYPE: &str = "platform_type";
    /// Producer of the imagery.
    pub const PRODUCER_NAME: &str = "producer_name";
    /// License text.
    pub const LICENSE: &str = "license";
    /// Cloud-optimized GeoTIFF location.
    pub const COG_HREF: &str = "cog_href";
    /// Thumbnail location.
    pub const THUMBNAIL_HREF: &str = "thumbnail_href";
    /// Size of the image file in bytes.
    pub const FILE_SIZE: &str = "file_size";
    /// Raster width in pixels.
    pub const WIDTH: &str = "width";
    /// Raster height in pixels.
    pub const HEIGHT: &str = "height";
    /// Number of raster bands.
    pub const BANDS: &str = "bands";
    /// EPSG code of the source raster.
    pub const EPSG: &str = "epsg";
    /// Uploading user.
    pub const UPLOADED_BY: &str = "uploaded_by";
    /// Upload timestamp; decides which duplicate wins.
    pub const UPLOADED_AT: &str = "uploaded_at";
    /// Footprint as WKB.
    pub const GEOMETRY: &str = "geometry";
    /// Covering bounding box struct.
    pub const BBOX: &str = "bbox";
}

/// Child field names of the `bbox` struct, in order.
pub const BBOX_FIELDS: [&str; 4] = ["xmin", "ymin", "xmax", "ymax"];

/// Pandas index artefact dropped from every source.
pub const INDEX_ARTIFACT_COLUMN: &str = "__index_level_0__";

/// Schema union failures. Each one makes the offending source malformed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    /// The identity column is absent.
    #[error("missing required column '{}'", columns::ID)]
    MissingId,

    /// The identity column has null values.
    #[error("{count} row(s) have a null '{}'", columns::ID)]
    NullId {
        /// Number of null ids.
        count: usize,
    },

    /// A column's type cannot be converted to the expected type.
    #[error("column '{column}' has type {from}, cannot convert to {to}")]
    Incompatible {
        /// Column name.
        column: String,
        /// Source type.
        from: DataType,
        /// Expected type.
        to: DataType,
    },

    /// Value-level conversion failed.
    #[error("column '{column}': {message}")]
    Cast {
        /// Column name.
        column: String,
        /// Arrow error message.
        message: String,
    },

    /// A column of a projected batch was never registered with the union.
    #[error("column '{column}' is not part of the union schema")]
    Unregistered {
        /// Column name.
        column: String,
    },

    /// Arrow rejected the assembled batch.
    #[error("arrow error: {0}")]
    Arrow(String),
}

/// Returns the fields of the `bbox` struct.
#[must_use]
pub fn bbox_fields() -> Fields {
    BBOX_FIELDS
        .iter()
        .map(|name| Field::new(*name, DataType::Float64, true))
        .collect()
}

/// Returns the physical type of the `bbox` column.
#[must_use]
pub fn bbox_data_type() -> DataType {
    DataType::Struct(bbox_fields())
}

fn canonical_fields() -> Vec<Field> {
    use columns::*;

    let utf8 = |name: &str| Field::new(name, DataType::Utf8, true);
    let int64 = |name: &str| Field::new(name, DataType::Int64, true);
    vec![
        Field::new(ID, DataType::Utf8, false),
        utf8(TITLE),
        utf8(DATETIME),
        Field::new(GSD, DataType::Float64, true),
        utf8(PLATFORM_TYPE),
        utf8(PRODUCER_NAME),
        utf8(LICENSE),
        utf8(COG_HREF),
        utf8(THUMBNAIL_HREF),
        int64(FILE_SIZE),
        int64(WIDTH),
        int64(HEIGHT),
        int64(BANDS),
        int64(EPSG),
        utf8(UPLOADED_BY),
        utf8(UPLOADED_AT),
        Field::new(GEOMETRY, DataType::Binary, true),
        Field::new(BBOX, bbox_data_type(), true),
    ]
}

/// Returns the canonical snapshot schema without extra columns.
#[must_use]
pub fn snapshot_schema() -> SchemaRef {
    Arc::new(Schema::new(canonical_fields()))
}

fn is_canonical(name: &str) -> bool {
    canonical_fields().iter().any(|f| f.name() == name)
}

/// Maps large and view encodings to their plain counterparts.
fn plain_type(data_type: &DataType) -> DataType {
    match data_type {
        DataType::LargeUtf8 | DataType::Utf8View => DataType::Utf8,
        DataType::LargeBinary | DataType::BinaryView => DataType::Binary,
        DataType::Dictionary(_, value) => plain_type(value),
        other => other.clone(),
    }
}

fn strict_cast(column: &str, array: &ArrayRef, to: &DataType) -> Result<ArrayRef, SchemaError> {
    if array.data_type() == to {
        return Ok(Arc::clone(array));
    }
    let options = CastOptions {
        safe: false,
        ..CastOptions::default()
    };
    cast_with_options(array, to, &options).map_err(|e| SchemaError::Cast {
        column: column.to_string(),
        message: e.to_string(),
    })
}

fn check_convertible(field: &Field, to: &DataType) -> Result<(), SchemaError> {
    let from = field.data_type();
    let ok = match field.name().as_str() {
        columns::GEOMETRY => matches!(
            from,
            DataType::Null | DataType::Binary | DataType::LargeBinary | DataType::BinaryView
        ),
        columns::BBOX => match from {
            DataType::Null => true,
            DataType::Struct(children) => BBOX_FIELDS.iter().all(|name| {
                children
                    .iter()
                    .find(|c| c.name() == name)
                    .is_some_and(|c| can_cast_types(c.data_type(), &DataType::Float64))
            }),
            _ => false,
        },
        _ => can_cast_types(from, to),
    };
    if ok {
        Ok(())
    } else {
        Err(SchemaError::Incompatible {
            column: field.name().clone(),
            from: from.clone(),
            to: to.clone(),
        })
    }
}

fn convert_bbox(array: &ArrayRef) -> Result<ArrayRef, SchemaError> {
    match array.data_type() {
        DataType::Struct(_) => {
            let source = array.as_struct();
            let mut children = Vec::with_capacity(BBOX_FIELDS.len());
            for name in BBOX_FIELDS {
                let child = source
                    .column_by_name(name)
                    .ok_or_else(|| SchemaError::Incompatible {
                        column: columns::BBOX.to_string(),
                        from: array.data_type().clone(),
                        to: bbox_data_type(),
                    })?;
                children.push(strict_cast(columns::BBOX, child, &DataType::Float64)?);
            }
            let rebuilt = StructArray::try_new(bbox_fields(), children, source.nulls().cloned())
                .map_err(|e| SchemaError::Arrow(e.to_string()))?;
            Ok(Arc::new(rebuilt))
        }
        DataType::Null => Ok(new_null_array(&bbox_data_type(), array.len())),
        other => Err(SchemaError::Incompatible {
            column: columns::BBOX.to_string(),
            from: other.clone(),
            to: bbox_data_type(),
        }),
    }
}

/// By-name union of the schemas of all merge inputs.
///
/// Register every source with [`SchemaUnion::add`], then bring each batch onto
/// the union with [`SchemaUnion::project`].
///
/// # Example
///
/// ```
/// use arrow::datatypes::{DataType, Field, Schema};
/// use footprint_catalog::schema::SchemaUnion;
///
/// let mut union = SchemaUnion::new();
/// union
///     .add(&Schema::new(vec![
///         Field::new("id", DataType::Utf8, false),
///         Field::new("cloud_cover", DataType::Float64, true),
///     ]))
///     .unwrap();
/// let schema = union.schema();
/// assert_eq!(schema.fields().len(), 19);
/// assert_eq!(schema.field(18).name(), "cloud_cover");
/// ```
#[derive(Debug, Clone, Default)]
pub struct SchemaUnion {
    extras: Vec<Field>,
}

impl SchemaUnion {
    /// Creates a union holding only the canonical columns.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a source schema.
    ///
    /// The union is left unchanged when the source is rejected.
    ///
    /// # Errors
    ///
    /// Returns an error if `id` is missing or a column's type cannot be
    /// converted to the union's type for that column.
    pub fn add(&mut self, schema: &Schema) -> Result<(), SchemaError> {
        if schema.field_with_name(columns::ID).is_err() {
            return Err(SchemaError::MissingId);
        }

        let canonical = snapshot_schema();
        let mut new_extras = Vec::new();
        for field in schema.fields() {
            let name = field.name().as_str();
            if name == INDEX_ARTIFACT_COLUMN {
                continue;
            }
            if let Ok(target) = canonical.field_with_name(name) {
                check_convertible(field, target.data_type())?;
                continue;
            }
            let registered = self
                .extras
                .iter()
                .chain(new_extras.iter())
                .find(|f: &&Field| f.name() == name);
            match registered {
                Some(existing) => {
                    if !can_cast_types(field.data_type(), existing.data_type()) {
                        return Err(SchemaError::Incompatible {
                            column: name.to_string(),
                            from: field.data_type().clone(),
                            to: existing.data_type().clone(),
                        });
                    }
                }
                None => {
                    new_extras.push(Field::new(name, plain_type(field.data_type()), true));
                }
            }
        }
        self.extras.extend(new_extras);
        Ok(())
    }

    /// Returns the extra (non-canonical) columns in first-seen order.
    #[must_use]
    pub fn extras(&self) -> &[Field] {
        &self.extras
    }

    /// Returns the union schema: canonical columns, then extras.
    #[must_use]
    pub fn schema(&self) -> SchemaRef {
        let mut fields = canonical_fields();
        fields.extend(self.extras.iter().cloned());
        Arc::new(Schema::new(fields))
    }

    /// Projects a batch onto the union schema.
    ///
    /// Columns are matched by name and cast to the union type. Absent columns
    /// are materialized as nulls; `__index_level_0__` is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if `id` is missing or null, a value cannot be
    /// converted, or the batch carries a column that was never registered.
    pub fn project(&self, batch: &RecordBatch) -> Result<RecordBatch, SchemaError> {
        let source = batch.schema();
        for field in source.fields() {
            let name = field.name().as_str();
            if name != INDEX_ARTIFACT_COLUMN
                && !is_canonical(name)
                && !self.extras.iter().any(|f| f.name() == name)
            {
                return Err(SchemaError::Unregistered {
                    column: name.to_string(),
                });
            }
        }

        let schema = self.schema();
        let rows = batch.num_rows();
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
        for field in schema.fields() {
            let name = field.name().as_str();
            let array = match batch.column_by_name(name) {
                None if name == columns::ID => return Err(SchemaError::MissingId),
                None => new_null_array(field.data_type(), rows),
                Some(array) if name == columns::BBOX => convert_bbox(array)?,
                Some(array) => strict_cast(name, array, field.data_type())?,
            };
            arrays.push(array);
        }

        let id_nulls = arrays[0].null_count();
        if id_nulls > 0 {
            return Err(SchemaError::NullId { count: id_nulls });
        }

        RecordBatch::try_new(schema, arrays).map_err(|e| SchemaError::Arrow(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{
        BinaryArray, Float32Array, Float64Array, Int32Array, LargeStringArray, StringArray,
    };

    fn batch(fields: Vec<Field>, arrays: Vec<ArrayRef>) -> RecordBatch {
        RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays).expect("batch")
    }

    #[test]
    fn canonical_order_is_fixed() {
        let schema = snapshot_schema();
        let names: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
        assert_eq!(
            names,
            vec![
                "id",
                "title",
                "datetime",
                "gsd",
                "platform_type",
                "producer_name",
                "license",
                "cog_href",
                "thumbnail_href",
                "file_size",
                "width",
                "height",
                "bands",
                "epsg",
                "uploaded_by",
                "uploaded_at",
                "geometry",
                "bbox",
            ]
        );
    }

    #[test]
    fn absent_columns_become_null() {
        let input = batch(
            vec![Field::new("id", DataType::Utf8, false)],
            vec![Arc::new(StringArray::from(vec!["a", "b"]))],
        );
        let mut union = SchemaUnion::new();
        union.add(&input.schema()).expect("add");
        let out = union.project(&input).expect("project");

        assert_eq!(out.num_rows(), 2);
        assert_eq!(out.num_columns(), 18);
        let gsd = out.column_by_name("gsd").expect("gsd");
        assert_eq!(gsd.null_count(), 2);
        assert_eq!(out.column_by_name("bbox").expect("bbox").null_count(), 2);
    }

    #[test]
    fn extras_keep_first_seen_order_and_artifact_is_dropped() {
        let first = Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("cloud_cover", DataType::Float64, true),
            Field::new(INDEX_ARTIFACT_COLUMN, DataType::Int64, true),
        ]);
        let second = Schema::new(vec![
            Field::new("sun_elevation", DataType::Float64, true),
            Field::new("id", DataType::LargeUtf8, false),
            Field::new("cloud_cover", DataType::Float32, true),
        ]);
        let mut union = SchemaUnion::new();
        union.add(&first).expect("first");
        union.add(&second).expect("second");

        let names: Vec<&str> = union.extras().iter().map(|f| f.name().as_str()).collect();
        assert_eq!(names, vec!["cloud_cover", "sun_elevation"]);
        assert_eq!(union.extras()[0].data_type(), &DataType::Float64);
    }

    #[test]
    fn known_columns_are_cast_to_canonical_types() {
        let input = batch(
            vec![
                Field::new("id", DataType::LargeUtf8, false),
                Field::new("width", DataType::Int32, true),
                Field::new("gsd", DataType::Float32, true),
            ],
            vec![
                Arc::new(LargeStringArray::from(vec!["a"])),
                Arc::new(Int32Array::from(vec![Some(512)])),
                Arc::new(Float32Array::from(vec![Some(0.5)])),
            ],
        );
        let mut union = SchemaUnion::new();
        union.add(&input.schema()).expect("add");
        let out = union.project(&input).expect("project");

        assert_eq!(out.column_by_name("id").expect("id").data_type(), &DataType::Utf8);
        assert_eq!(out.column_by_name("width").expect("w").data_type(), &DataType::Int64);
        let gsd = out.column_by_name("gsd").expect("gsd");
        let gsd = gsd.as_any().downcast_ref::<Float64Array>().expect("f64");
        assert!((gsd.value(0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn bbox_children_are_matched_by_name() {
        let children = Fields::from(vec![
            Field::new("ymax", DataType::Float32, true),
            Field::new("xmin", DataType::Float32, true),
            Field::new("xmax", DataType::Float32, true),
            Field::new("ymin", DataType::Float32, true),
        ]);
        let bbox = StructArray::try_new(
            children.clone(),
            vec![
                Arc::new(Float32Array::from(vec![4.0])) as ArrayRef,
                Arc::new(Float32Array::from(vec![1.0])),
                Arc::new(Float32Array::from(vec![3.0])),
                Arc::new(Float32Array::from(vec![2.0])),
            ],
            None,
        )
        .expect("struct");
        let input = batch(
            vec![
                Field::new("id", DataType::Utf8, false),
                Field::new("bbox", DataType::Struct(children), true),
            ],
            vec![Arc::new(StringArray::from(vec!["a"])), Arc::new(bbox)],
        );
        let mut union = SchemaUnion::new();
        union.add(&input.schema()).expect("add");
        let out = union.project(&input).expect("project");

        let bbox = out.column_by_name("bbox").expect("bbox").as_struct();
        let value = |i: usize| bbox.column(i).as_primitive::<arrow::datatypes::Float64Type>().value(0);
        assert_eq!([value(0), value(1), value(2), value(3)], [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn incompatible_known_column_is_rejected_without_mutation() {
        let mut union = SchemaUnion::new();
        let bad = Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("extra", DataType::Utf8, true),
            Field::new("geometry", DataType::Int64, true),
        ]);
        let err = union.add(&bad).expect_err("geometry must be binary");
        assert!(matches!(err, SchemaError::Incompatible { ref column, .. } if column == "geometry"));
        assert!(union.extras().is_empty());
    }

    #[test]
    fn missing_or_null_id_is_rejected() {
        let mut union = SchemaUnion::new();
        let no_id = Schema::new(vec![Field::new("title", DataType::Utf8, true)]);
        assert_eq!(union.add(&no_id), Err(SchemaError::MissingId));

        let input = batch(
            vec![Field::new("id", DataType::Utf8, true)],
            vec![Arc::new(StringArray::from(vec![Some("a"), None]))],
        );
        union.add(&input.schema()).expect("add");
        assert_eq!(union.project(&input), Err(SchemaError::NullId { count: 1 }));
    }

    #[test]
    fn unparseable_values_fail_instead_of_becoming_null() {
        let input = batch(
            vec![
                Field::new("id", DataType::Utf8, false),
                Field::new("epsg", DataType::Utf8, true),
            ],
            vec![
                Arc::new(StringArray::from(vec!["a"])),
                Arc::new(StringArray::from(vec![Some("not-a-code")])),
            ],
        );
        let mut union = SchemaUnion::new();
        union.add(&input.schema()).expect("add");
        let err = union.project(&input).expect_err("cast must fail");
        assert!(matches!(err, SchemaError::Cast { ref column, .. } if column == "epsg"));
    }

    #[test]
    fn unregistered_columns_are_rejected() {
        let input = batch(
            vec![
                Field::new("id", DataType::Utf8, false),
                Field::new("geometry", DataType::Binary, true),
                Field::new("mystery", DataType::Utf8, true),
            ],
            vec![
                Arc::new(StringArray::from(vec!["a"])),
                Arc::new(BinaryArray::from(vec![None::<&[u8]>])),
                Arc::new(StringArray::from(vec![Some("x")])),
            ],
        );
        let union = SchemaUnion::new();
        assert!(matches!(
            union.project(&input),
            Err(SchemaError::Unregistered { .. })
        ));
    }
}
