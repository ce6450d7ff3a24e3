//! Duplicate resolution: one row per `id`, most recent upload wins.

use std::cmp::Ordering;
use std::collections::HashMap;

use arrow::array::{Array, AsArray};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::error::{CatalogError, Result};
use crate::schema::columns;

/// Comparable form of an `uploaded_at` value.
///
/// Ordering: missing < unparseable (compared as text) < parsed (compared as
/// instants). Naive timestamps are taken as UTC.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum RecencyKey {
    /// Null `uploaded_at`.
    Missing,
    /// Text that is not a recognizable timestamp.
    Unparsed(String),
    /// A timestamp.
    Parsed(DateTime<Utc>),
}

impl RecencyKey {
    /// Parses an optional `uploaded_at` value.
    #[must_use]
    pub fn parse(value: Option<&str>) -> Self {
        let Some(raw) = value else {
            return Self::Missing;
        };
        let raw = raw.trim();
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Self::Parsed(ts.with_timezone(&Utc));
        }
        for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
            if let Ok(ts) = NaiveDateTime::parse_from_str(raw, format) {
                return Self::Parsed(ts.and_utc());
            }
        }
        if let Some(ts) = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
        {
            return Self::Parsed(ts.and_utc());
        }
        Self::Unparsed(raw.to_string())
    }
}

/// Result of resolving duplicates in a working table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Row indices of the winners, ascending.
    pub winners: Vec<usize>,
    /// Number of rows discarded as superseded duplicates.
    pub superseded: usize,
}

/// Picks one winning row per `id`.
///
/// The row with the greatest [`RecencyKey`] wins. On equal keys the row that
/// comes later in the working table wins; since the table is assembled as
/// snapshot rows followed by fragments in key order, a fragment beats the
/// snapshot and a later fragment beats an earlier one.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    /// Resolves duplicates in a batch projected onto the union schema.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::InvariantViolation`] if `id` or `uploaded_at`
    /// is missing or not a string column.
    pub fn resolve(&self, batch: &RecordBatch) -> Result<Resolution> {
        let ids = string_column(batch, columns::ID)?;
        let uploaded_at = string_column(batch, columns::UPLOADED_AT)?;

        let keys: Vec<RecencyKey> = (0..batch.num_rows())
            .map(|row| RecencyKey::parse(uploaded_at.is_valid(row).then(|| uploaded_at.value(row))))
            .collect();

        let mut best: HashMap<&str, usize> = HashMap::with_capacity(batch.num_rows());
        for row in 0..batch.num_rows() {
            if ids.is_null(row) {
                return Err(CatalogError::InvariantViolation {
                    message: format!("null id at row {row} after projection"),
                });
            }
            best.entry(ids.value(row))
                .and_modify(|current| {
                    if keys[row].cmp(&keys[*current]) != Ordering::Less {
                        *current = row;
                    }
                })
                .or_insert(row);
        }

        let mut winners: Vec<usize> = best.into_values().collect();
        winners.sort_unstable();
        Ok(Resolution {
            superseded: batch.num_rows() - winners.len(),
            winners,
        })
    }
}

fn string_column<'a>(
    batch: &'a RecordBatch,
    name: &str,
) -> Result<&'a arrow::array::StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_string_opt::<i32>())
        .ok_or_else(|| CatalogError::InvariantViolation {
            message: format!("column {name} missing or not utf8"),
        })
}
