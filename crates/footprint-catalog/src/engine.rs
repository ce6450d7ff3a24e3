//! Catalog merge/compaction engine.
//!
//! One run folds every pending fragment into a new snapshot:
//!
//! 1. sweep staging leftovers of crashed runs
//! 2. list pending fragments (none: no-op, nothing is read or written)
//! 3. read the current snapshot and fetch the fragments
//! 4. union schemas by name and concatenate
//! 5. keep the most recent row per `id`
//! 6. derive missing or stale bboxes from geometry
//! 7. order rows along the Hilbert curve
//! 8. encode GeoParquet, publish atomically, then retire the consumed fragments
//!
//! Steps 4–7 are a pure function of the snapshot and the sorted fragment set
//! ([`merge_tables`]), and encoding is deterministic, so re-running over the
//! same inputs produces byte-identical snapshots.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use arrow::array::{Array, AsArray, StringArray, UInt64Array};
use arrow::compute::{concat_batches, take_record_batch};
use arrow::record_batch::RecordBatch;
use futures::{StreamExt, stream};
use footprint_core::{StorageBackend, merge_span};
use serde::Serialize;
use tracing::Instrument;
use ulid::Ulid;

use crate::config::{FragmentFailurePolicy, MergeConfig, SpatialOrdering};
use crate::entry::{bbox_at, patch_bbox_array};
use crate::error::{CatalogError, FailureKind, Result};
use crate::geometry::{BBOX_TOLERANCE, BBox, decode_wkb};
use crate::metrics;
use crate::parquet_util::{DecodedFile, WriteSettings, write_snapshot};
use crate::pending::{DeleteReport, FragmentRef, PendingRegistry};
use crate::resolver::ConflictResolver;
use crate::schema::{SchemaError, SchemaUnion, columns};
use crate::snapshot::SnapshotStore;
use crate::spatial_key::SpatialKey;

/// Fragments fetched concurrently.
const FETCH_CONCURRENCY: usize = 8;

/// A decoded fragment ready to merge.
#[derive(Debug, Clone)]
pub struct MergeSource {
    /// Fragment key.
    pub key: String,
    /// Decoded contents.
    pub file: DecodedFile,
}

/// A fragment left out of a run under [`FragmentFailurePolicy::Skip`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedFragment {
    /// Fragment key; the object is left in place.
    pub key: String,
    /// Why it was rejected.
    pub reason: String,
}

/// Result of the pure merge step.
#[derive(Debug, Clone)]
pub struct MergedTable {
    /// The new snapshot contents.
    pub batch: RecordBatch,
    /// Keys of the fragments folded in, in merge order.
    pub merged_keys: Vec<String>,
    /// Fragments rejected under the skip policy.
    pub skipped: Vec<SkippedFragment>,
    /// Rows dropped as superseded duplicates.
    pub superseded: usize,
    /// Null bboxes filled from geometry.
    pub bbox_filled: usize,
    /// Present bboxes that disagreed with their geometry and were recomputed.
    pub bbox_corrected: usize,
    /// Rows whose geometry could not be decoded.
    pub undecodable_geometries: usize,
    /// Rows with no spatial key, placed after all located rows.
    pub unlocated: usize,
}

/// Report of a completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    /// Run identifier (ULID), also on every log line of the run.
    pub run_id: String,
    /// Fragments folded into the committed snapshot; 0 means nothing was written.
    pub merged_fragments: usize,
    /// Rows in the committed snapshot (0 when nothing was written).
    pub rows: usize,
    /// Duplicate rows superseded by a more recent upload.
    pub superseded: usize,
    /// Bboxes filled or corrected from geometry.
    pub bbox_repaired: usize,
    /// Rows without a spatial key.
    pub unlocated: usize,
    /// Ordering applied to the snapshot.
    pub ordering: SpatialOrdering,
    /// Fragments rejected and left pending.
    pub skipped: Vec<SkippedFragment>,
    /// Fragments listed but gone before they could be read.
    pub vanished: Vec<String>,
    /// Version of the published snapshot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_version: Option<String>,
    /// Fragment deletion after commit.
    pub deleted: DeleteReport,
    /// Staging leftovers removed at the start of the run.
    pub staging_swept: usize,
}

impl MergeOutcome {
    fn empty(run_id: String, ordering: SpatialOrdering) -> Self {
        Self {
            run_id,
            merged_fragments: 0,
            rows: 0,
            superseded: 0,
            bbox_repaired: 0,
            unlocated: 0,
            ordering,
            skipped: Vec::new(),
            vanished: Vec::new(),
            snapshot_version: None,
            deleted: DeleteReport::default(),
            staging_swept: 0,
        }
    }

    /// Returns true if the run wrote nothing.
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        self.merged_fragments == 0
    }
}

/// Machine-readable status of one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CompactionStatus {
    /// Nothing to merge.
    Noop(MergeOutcome),
    /// A new snapshot was committed.
    Success(MergeOutcome),
    /// The run failed; state is unchanged (or, after commit, harmlessly
    /// re-mergeable).
    Failed {
        /// Failure classification.
        kind: FailureKind,
        /// Whether re-running may succeed.
        retryable: bool,
        /// Error description.
        message: String,
    },
}

impl CompactionStatus {
    /// Builds the status of a finished run.
    #[must_use]
    pub fn from_result(result: &Result<MergeOutcome>) -> Self {
        match result {
            Ok(outcome) if outcome.is_noop() => Self::Noop(outcome.clone()),
            Ok(outcome) => Self::Success(outcome.clone()),
            Err(err) => Self::failed(err.kind(), err.to_string()),
        }
    }

    /// Builds a failed status.
    #[must_use]
    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failed {
            kind,
            retryable: kind.is_retryable(),
            message: message.into(),
        }
    }

    /// Returns the status label (`noop`, `success`, `failed`).
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Noop(_) => "noop",
            Self::Success(_) => "success",
            Self::Failed { .. } => "failed",
        }
    }

    /// Returns true for a failed run.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// The merge engine.
#[derive(Debug, Clone)]
pub struct MergeEngine {
    config: MergeConfig,
    pending: PendingRegistry,
    snapshots: SnapshotStore,
}

impl MergeEngine {
    /// Creates an engine over a storage backend.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::InvalidConfig`] if the configuration is invalid.
    pub fn new(storage: Arc<dyn StorageBackend>, config: MergeConfig) -> Result<Self> {
        config.validate()?;
        let paths = config.paths();
        let pending = PendingRegistry::new(Arc::clone(&storage), paths.clone())
            .with_delete_batch_size(config.delete_batch_size);
        let snapshots = SnapshotStore::new(storage, paths)
            .with_delete_batch_size(config.delete_batch_size);
        Ok(Self {
            config,
            pending,
            snapshots,
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    /// Runs one merge.
    ///
    /// # Errors
    ///
    /// Any error before commit leaves the snapshot and the pending set
    /// unchanged. See [`CatalogError`] for the classification.
    pub async fn run(&self) -> Result<MergeOutcome> {
        let run_id = Ulid::new().to_string();
        let span = merge_span(&run_id, self.snapshots.key());
        let started = Instant::now();

        let result = self.run_inner(run_id).instrument(span).await;

        let elapsed = started.elapsed().as_secs_f64();
        match &result {
            Ok(outcome) => {
                let status = if outcome.is_noop() { "noop" } else { "success" };
                metrics::record_run(status, elapsed);
            }
            Err(err) => {
                metrics::record_run("failed", elapsed);
                metrics::record_failure(err.kind().as_str());
            }
        }
        result
    }

    async fn run_inner(&self, run_id: String) -> Result<MergeOutcome> {
        let mut outcome = MergeOutcome::empty(run_id, self.config.spatial_ordering);

        match self
            .snapshots
            .sweep_staging(self.config.staging_max_age())
            .await
        {
            Ok(swept) => outcome.staging_swept = swept,
            Err(e) => tracing::warn!(error = %e, "staging sweep failed; continuing"),
        }

        let refs = self.pending.list().await?;
        if refs.is_empty() {
            tracing::info!("no pending fragments");
            return Ok(outcome);
        }
        tracing::info!(fragments = refs.len(), "merging pending fragments");

        let snapshot = self.snapshots.read().await?;
        let (sources, vanished, mut skipped) = self.fetch_all(&refs).await?;
        outcome.vanished = vanished;

        if sources.is_empty() {
            tracing::info!(
                skipped = skipped.len(),
                vanished = outcome.vanished.len(),
                "no readable fragments"
            );
            metrics::record_excluded(skipped.len() as u64, outcome.vanished.len() as u64);
            outcome.skipped = skipped;
            return Ok(outcome);
        }

        let merged = merge_tables(
            snapshot.as_ref().map(|s| &s.file),
            self.snapshots.key(),
            &sources,
            self.config.fragment_failure_policy,
            self.config.spatial_ordering,
        )?;
        skipped.extend(merged.skipped.iter().cloned());
        metrics::record_excluded(skipped.len() as u64, outcome.vanished.len() as u64);
        outcome.skipped = skipped;

        if merged.merged_keys.is_empty() {
            tracing::info!(skipped = outcome.skipped.len(), "every fragment was rejected");
            return Ok(outcome);
        }

        let settings = WriteSettings {
            max_row_group_size: self.config.row_group_size,
            compression: self.config.compression,
        };
        let bytes = write_snapshot(&merged.batch, &settings)?;
        tracing::debug!(bytes = bytes.len(), "encoded snapshot");

        let observed = snapshot.as_ref().map(|s| s.version.as_str());
        outcome.snapshot_version = self.snapshots.commit(bytes, observed).await?;

        outcome.merged_fragments = merged.merged_keys.len();
        outcome.rows = merged.batch.num_rows();
        outcome.superseded = merged.superseded;
        outcome.bbox_repaired = merged.bbox_filled + merged.bbox_corrected;
        outcome.unlocated = merged.unlocated;
        metrics::record_commit(
            outcome.merged_fragments as u64,
            outcome.superseded as u64,
            outcome.bbox_repaired as u64,
            outcome.rows,
        );

        let merged_keys: HashSet<&str> = merged.merged_keys.iter().map(String::as_str).collect();
        let consumed: Vec<FragmentRef> = refs
            .into_iter()
            .filter(|r| merged_keys.contains(r.key.as_str()))
            .collect();
        outcome.deleted = self.pending.delete(&consumed).await;

        tracing::info!(
            merged = outcome.merged_fragments,
            rows = outcome.rows,
            superseded = outcome.superseded,
            bbox_filled = merged.bbox_filled,
            bbox_corrected = merged.bbox_corrected,
            unlocated = outcome.unlocated,
            skipped = outcome.skipped.len(),
            vanished = outcome.vanished.len(),
            "merge committed"
        );
        Ok(outcome)
    }

    async fn fetch_all(
        &self,
        refs: &[FragmentRef],
    ) -> Result<(Vec<MergeSource>, Vec<String>, Vec<SkippedFragment>)> {
        let fetched: Vec<(FragmentRef, Result<DecodedFile>)> = stream::iter(refs.iter().cloned())
            .map(|fragment| async move {
                let result = self.pending.fetch(&fragment).await;
                (fragment, result)
            })
            .buffered(FETCH_CONCURRENCY)
            .collect()
            .await;

        let mut sources = Vec::with_capacity(fetched.len());
        let mut vanished = Vec::new();
        let mut skipped = Vec::new();
        for (fragment, result) in fetched {
            match result {
                Ok(file) => sources.push(MergeSource {
                    key: fragment.key,
                    file,
                }),
                Err(CatalogError::NotFound { .. }) => {
                    tracing::warn!(key = %fragment.key, "fragment vanished before fetch; skipping");
                    vanished.push(fragment.key);
                }
                Err(err @ CatalogError::MalformedFragment { .. }) => {
                    match self.config.fragment_failure_policy {
                        FragmentFailurePolicy::Abort => return Err(err),
                        FragmentFailurePolicy::Skip => {
                            tracing::warn!(key = %fragment.key, error = %err, "skipping unreadable fragment");
                            skipped.push(SkippedFragment {
                                key: fragment.key,
                                reason: err.to_string(),
                            });
                        }
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Ok((sources, vanished, skipped))
    }
}

/// Folds fragments into a snapshot.
///
/// Sources are concatenated as snapshot rows first, then each fragment in the
/// given order; the caller passes fragments sorted by key.
///
/// # Errors
///
/// - [`CatalogError::CorruptSnapshot`] if the snapshot cannot be projected
/// - [`CatalogError::MalformedFragment`] for a bad fragment under
///   [`FragmentFailurePolicy::Abort`]
/// - [`CatalogError::InvariantViolation`] if Arrow rejects an intermediate
///   table
pub fn merge_tables(
    snapshot: Option<&DecodedFile>,
    snapshot_key: &str,
    fragments: &[MergeSource],
    policy: FragmentFailurePolicy,
    ordering: SpatialOrdering,
) -> Result<MergedTable> {
    let mut rejections = Rejections::new(policy);

    // Rebuilt from scratch whenever a fragment is rejected during projection
    // so that its extra columns do not leak into the union.
    let (union, projected, merged_keys) = 'build: loop {
        let mut union = SchemaUnion::new();
        if let Some(snapshot) = snapshot {
            union
                .add(&snapshot.schema)
                .map_err(|e| corrupt(snapshot_key, &e))?;
        }
        let mut accepted = Vec::new();
        for (index, fragment) in fragments.iter().enumerate() {
            if rejections.contains(index) {
                continue;
            }
            let mut trial = union.clone();
            match trial.add(&fragment.file.schema) {
                Ok(()) => {
                    union = trial;
                    accepted.push(index);
                }
                Err(e) => rejections.reject(index, &fragment.key, &e)?,
            }
        }

        let mut projected = Vec::new();
        if let Some(snapshot) = snapshot {
            for batch in &snapshot.batches {
                projected.push(union.project(batch).map_err(|e| corrupt(snapshot_key, &e))?);
            }
        }
        for &index in &accepted {
            for batch in &fragments[index].file.batches {
                match union.project(batch) {
                    Ok(batch) => projected.push(batch),
                    Err(e) => {
                        rejections.reject(index, &fragments[index].key, &e)?;
                        continue 'build;
                    }
                }
            }
        }

        let merged_keys: Vec<String> = accepted
            .iter()
            .map(|&index| fragments[index].key.clone())
            .collect();
        break (union, projected, merged_keys);
    };

    let schema = union.schema();
    let table = concat_batches(&schema, &projected).map_err(|e| invariant("concat", &e))?;

    let resolution = ConflictResolver.resolve(&table)?;
    let winners = UInt64Array::from_iter_values(resolution.winners.iter().map(|&i| i as u64));
    let table = take_record_batch(&table, &winners).map_err(|e| invariant("dedup", &e))?;

    let repaired = repair_bboxes(&table)?;

    let ids = table
        .column_by_name(columns::ID)
        .and_then(|c| c.as_string_opt::<i32>())
        .ok_or_else(|| CatalogError::InvariantViolation {
            message: "id column missing after projection".to_string(),
        })?;
    let order = row_order(ids, &repaired.keys, ordering);
    let batch =
        take_record_batch(&repaired.batch, &order).map_err(|e| invariant("order", &e))?;

    if ordering == SpatialOrdering::IdOnly {
        tracing::warn!(
            ordering = ordering.as_str(),
            "spatial ordering disabled; snapshot rows are ordered by id only"
        );
    }
    if repaired.undecodable > 0 {
        tracing::warn!(
            rows = repaired.undecodable,
            "rows with undecodable geometry; bbox kept as provided"
        );
    }
    if repaired.partial > 0 {
        tracing::warn!(
            rows = repaired.partial,
            "rows with a partially null bbox and no usable geometry; bbox kept as provided"
        );
    }

    Ok(MergedTable {
        batch,
        merged_keys,
        skipped: rejections.skipped,
        superseded: resolution.superseded,
        bbox_filled: repaired.filled,
        bbox_corrected: repaired.corrected,
        undecodable_geometries: repaired.undecodable,
        unlocated: repaired.keys.iter().filter(|k| k.is_none()).count(),
    })
}

/// Fragments rejected so far in one merge.
struct Rejections {
    policy: FragmentFailurePolicy,
    indices: HashSet<usize>,
    skipped: Vec<SkippedFragment>,
}

impl Rejections {
    fn new(policy: FragmentFailurePolicy) -> Self {
        Self {
            policy,
            indices: HashSet::new(),
            skipped: Vec::new(),
        }
    }

    fn contains(&self, index: usize) -> bool {
        self.indices.contains(&index)
    }

    /// Records a bad fragment, or fails the merge under the abort policy.
    fn reject(&mut self, index: usize, key: &str, err: &SchemaError) -> Result<()> {
        match self.policy {
            FragmentFailurePolicy::Abort => Err(CatalogError::MalformedFragment {
                key: key.to_string(),
                message: err.to_string(),
            }),
            FragmentFailurePolicy::Skip => {
                tracing::warn!(key, error = %err, "skipping malformed fragment");
                self.indices.insert(index);
                self.skipped.push(SkippedFragment {
                    key: key.to_string(),
                    reason: err.to_string(),
                });
                Ok(())
            }
        }
    }
}

fn corrupt(key: &str, err: &SchemaError) -> CatalogError {
    CatalogError::CorruptSnapshot {
        key: key.to_string(),
        message: err.to_string(),
    }
}

fn invariant(step: &str, err: &arrow::error::ArrowError) -> CatalogError {
    CatalogError::InvariantViolation {
        message: format!("{step} failed: {err}"),
    }
}

struct Repaired {
    batch: RecordBatch,
    keys: Vec<Option<SpatialKey>>,
    filled: usize,
    corrected: usize,
    undecodable: usize,
    partial: usize,
}

/// Derives bboxes from geometry and computes each row's spatial key.
fn repair_bboxes(table: &RecordBatch) -> Result<Repaired> {
    let schema = table.schema();
    let geometry = table
        .column_by_name(columns::GEOMETRY)
        .and_then(|c| c.as_binary_opt::<i32>())
        .ok_or_else(|| CatalogError::InvariantViolation {
            message: "geometry column missing after projection".to_string(),
        })?;
    let bbox_index = schema
        .index_of(columns::BBOX)
        .map_err(|e| invariant("bbox lookup", &e))?;
    let bbox = table
        .column(bbox_index)
        .as_struct_opt()
        .ok_or_else(|| CatalogError::InvariantViolation {
            message: "bbox column is not a struct after projection".to_string(),
        })?;

    let rows = table.num_rows();
    let mut patches = Vec::with_capacity(rows);
    let mut keys = Vec::with_capacity(rows);
    let (mut filled, mut corrected, mut undecodable, mut partial) = (0, 0, 0, 0);
    for row in 0..rows {
        let geom = if geometry.is_valid(row) {
            match decode_wkb(geometry.value(row)) {
                Ok(geom) => Some(geom),
                Err(e) => {
                    tracing::debug!(row, error = %e, "undecodable geometry");
                    undecodable += 1;
                    None
                }
            }
        } else {
            None
        };

        let existing = bbox_at(bbox, row);
        let derived = geom.as_ref().and_then(BBox::from_geometry);
        let patch = match (existing, derived) {
            (None, Some(d)) => {
                filled += 1;
                Some(d)
            }
            (Some(e), Some(d)) if !e.approx_eq(&d, BBOX_TOLERANCE) => {
                corrected += 1;
                Some(d)
            }
            (None, None) if bbox.is_valid(row) => {
                partial += 1;
                None
            }
            _ => None,
        };

        let key = geom
            .as_ref()
            .and_then(SpatialKey::from_geometry)
            .or_else(|| patch.or(existing).as_ref().and_then(SpatialKey::from_bbox));
        patches.push(patch);
        keys.push(key);
    }

    let mut arrays = table.columns().to_vec();
    arrays[bbox_index] = patch_bbox_array(bbox, &patches);
    let batch = RecordBatch::try_new(schema, arrays).map_err(|e| invariant("bbox repair", &e))?;
    Ok(Repaired {
        batch,
        keys,
        filled,
        corrected,
        undecodable,
        partial,
    })
}

/// Returns the row permutation for the requested ordering.
fn row_order(ids: &StringArray, keys: &[Option<SpatialKey>], ordering: SpatialOrdering) -> UInt64Array {
    let mut order: Vec<usize> = (0..ids.len()).collect();
    let by_id = |a: usize, b: usize| ids.value(a).cmp(ids.value(b));
    match ordering {
        SpatialOrdering::Hilbert => order.sort_by(|&a, &b| match (keys[a], keys[b]) {
            (Some(ka), Some(kb)) => ka.cmp(&kb).then_with(|| by_id(a, b)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => by_id(a, b),
        }),
        SpatialOrdering::IdOnly => order.sort_by(|&a, &b| by_id(a, b)),
    }
    UInt64Array::from_iter_values(order.into_iter().map(|i| i as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use arrow::array::{ArrayRef, BinaryArray, Float64Array, Int64Array, StructArray};
    use arrow::datatypes::{DataType, Field, Float64Type, Schema};
    use footprint_core::MemoryBackend;
    use geo_types::{Geometry, Point, Rect};

    use crate::entry::{CatalogEntry, batch_to_entries, entries_to_batch};

    fn rect(x: f64, y: f64) -> Geometry<f64> {
        Geometry::Rect(Rect::new((x, y), (x + 0.1, y + 0.1)))
    }

    fn file(batch: RecordBatch) -> DecodedFile {
        DecodedFile {
            schema: batch.schema(),
            batches: vec![batch],
            metadata: std::collections::BTreeMap::new(),
        }
    }

    fn source(key: &str, entries: &[CatalogEntry]) -> MergeSource {
        MergeSource {
            key: key.to_string(),
            file: file(entries_to_batch(entries).expect("batch")),
        }
    }

    fn ids(batch: &RecordBatch) -> Vec<String> {
        batch_to_entries(batch)
            .expect("entries")
            .into_iter()
            .map(|e| e.id)
            .collect()
    }

    fn merge(
        snapshot: Option<&DecodedFile>,
        fragments: &[MergeSource],
        ordering: SpatialOrdering,
    ) -> MergedTable {
        merge_tables(
            snapshot,
            "catalog.parquet",
            fragments,
            FragmentFailurePolicy::Abort,
            ordering,
        )
        .expect("merge")
    }

    #[test]
    fn located_rows_follow_hilbert_order_and_unlocated_rows_trail() {
        let fragments = [
            source("p/1.parquet", &[CatalogEntry::new("far").with_geometry(rect(150.0, -30.0))]),
            source("p/2.parquet", &[CatalogEntry::new("b-nowhere"), CatalogEntry::new("a-nowhere")]),
            source("p/3.parquet", &[CatalogEntry::new("near").with_geometry(rect(-170.0, -80.0))]),
        ];
        let merged = merge(None, &fragments, SpatialOrdering::Hilbert);

        assert_eq!(ids(&merged.batch), vec!["near", "far", "a-nowhere", "b-nowhere"]);
        assert_eq!(merged.unlocated, 2);
        assert_eq!(merged.merged_keys.len(), 3);
    }

    #[test]
    fn id_only_ordering_sorts_by_id() {
        let fragments = [source(
            "p/1.parquet",
            &[
                CatalogEntry::new("c").with_geometry(rect(0.0, 0.0)),
                CatalogEntry::new("a").with_geometry(rect(100.0, 50.0)),
                CatalogEntry::new("b"),
            ],
        )];
        let merged = merge(None, &fragments, SpatialOrdering::IdOnly);
        assert_eq!(ids(&merged.batch), vec!["a", "b", "c"]);
    }

    #[test]
    fn equal_keys_tie_break_on_id() {
        let g = Geometry::Point(Point::new(10.0, 10.0));
        let fragments = [source(
            "p/1.parquet",
            &[
                CatalogEntry::new("z").with_geometry(g.clone()),
                CatalogEntry::new("m").with_geometry(g),
            ],
        )];
        let merged = merge(None, &fragments, SpatialOrdering::Hilbert);
        assert_eq!(ids(&merged.batch), vec!["m", "z"]);
    }

    #[test]
    fn stale_and_missing_bboxes_are_recomputed() {
        let mut stale = CatalogEntry::new("stale").with_geometry(rect(1.0, 1.0));
        stale.bbox = Some(BBox::new(0.0, 0.0, 0.5, 0.5));
        let mut missing = CatalogEntry::new("missing").with_geometry(rect(2.0, 2.0));
        missing.bbox = None;
        let mut bbox_only = CatalogEntry::new("bbox-only");
        bbox_only.bbox = Some(BBox::new(5.0, 5.0, 6.0, 6.0));

        let merged = merge(
            None,
            &[source("p/1.parquet", &[stale, missing, bbox_only])],
            SpatialOrdering::Hilbert,
        );
        assert_eq!(merged.bbox_filled, 1);
        assert_eq!(merged.bbox_corrected, 1);
        assert_eq!(merged.unlocated, 0);

        for entry in batch_to_entries(&merged.batch).expect("entries") {
            match entry.id.as_str() {
                "stale" => {
                    let bbox = entry.bbox.expect("bbox");
                    assert!(bbox.approx_eq(&BBox::new(1.0, 1.0, 1.1, 1.1), 1e-12));
                }
                "missing" => assert!(entry.bbox.is_some()),
                "bbox-only" => assert_eq!(entry.bbox, Some(BBox::new(5.0, 5.0, 6.0, 6.0))),
                other => panic!("unexpected id {other}"),
            }
        }
    }

    #[test]
    fn partially_null_bbox_is_kept_as_provided() {
        let batch = entries_to_batch(&[CatalogEntry::new("partial")]).expect("batch");
        let schema = batch.schema();
        let bbox_index = schema.index_of(columns::BBOX).expect("bbox");
        let partial: ArrayRef = Arc::new(StructArray::new(
            crate::schema::bbox_fields(),
            vec![
                Arc::new(Float64Array::from(vec![Some(1.0)])) as ArrayRef,
                Arc::new(Float64Array::from(vec![None::<f64>])),
                Arc::new(Float64Array::from(vec![Some(2.0)])),
                Arc::new(Float64Array::from(vec![Some(3.0)])),
            ],
            None,
        ));
        let mut arrays = batch.columns().to_vec();
        arrays[bbox_index] = partial;
        let batch = RecordBatch::try_new(schema, arrays).expect("batch");
        let fragment = MergeSource {
            key: "p/1.parquet".to_string(),
            file: file(batch),
        };

        let merged = merge(None, &[fragment], SpatialOrdering::Hilbert);
        assert_eq!(merged.bbox_filled + merged.bbox_corrected, 0);
        assert_eq!(merged.unlocated, 1);

        let bbox = merged
            .batch
            .column_by_name(columns::BBOX)
            .expect("bbox")
            .as_struct();
        assert!(bbox.is_valid(0));
        let xmin = bbox.column(0).as_primitive::<Float64Type>();
        assert!((xmin.value(0) - 1.0).abs() < f64::EPSILON);
        assert!(bbox.column(1).is_null(0));
        let ymax = bbox.column(3).as_primitive::<Float64Type>();
        assert!((ymax.value(0) - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn undecodable_geometry_falls_back_to_bbox_center() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("geometry", DataType::Binary, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec!["broken"])) as ArrayRef,
                Arc::new(BinaryArray::from(vec![Some(&b"\x01\x03"[..])])),
            ],
        )
        .expect("batch");
        let fragments = [MergeSource {
            key: "p/1.parquet".to_string(),
            file: file(batch),
        }];
        let merged = merge(None, &fragments, SpatialOrdering::Hilbert);
        assert_eq!(merged.undecodable_geometries, 1);
        assert_eq!(merged.unlocated, 1);
    }

    #[test]
    fn skip_policy_excludes_fragment_and_its_extra_columns() {
        let good = source("p/1.parquet", &[CatalogEntry::new("ok")]);
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("mission", DataType::Utf8, true),
            Field::new("width", DataType::Utf8, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec!["bad"])) as ArrayRef,
                Arc::new(StringArray::from(vec![Some("m-1")])),
                Arc::new(StringArray::from(vec![Some("wide")])),
            ],
        )
        .expect("batch");
        let bad = MergeSource {
            key: "p/2.parquet".to_string(),
            file: file(batch),
        };
        let fragments = [good, bad];

        let err = merge_tables(
            None,
            "catalog.parquet",
            &fragments,
            FragmentFailurePolicy::Abort,
            SpatialOrdering::Hilbert,
        )
        .expect_err("abort policy");
        assert!(matches!(err, CatalogError::MalformedFragment { ref key, .. } if key == "p/2.parquet"));

        let merged = merge_tables(
            None,
            "catalog.parquet",
            &fragments,
            FragmentFailurePolicy::Skip,
            SpatialOrdering::Hilbert,
        )
        .expect("skip policy");
        assert_eq!(merged.merged_keys, vec!["p/1.parquet".to_string()]);
        assert_eq!(merged.skipped.len(), 1);
        assert_eq!(merged.skipped[0].key, "p/2.parquet");
        assert!(merged.batch.column_by_name("mission").is_none());
        assert_eq!(ids(&merged.batch), vec!["ok"]);
    }

    #[test]
    fn snapshot_projection_failure_is_corruption() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("geometry", DataType::Int64, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec!["a"])) as ArrayRef,
                Arc::new(Int64Array::from(vec![Some(1)])),
            ],
        )
        .expect("batch");
        let snapshot = file(batch);
        let err = merge_tables(
            Some(&snapshot),
            "catalog.parquet",
            &[source("p/1.parquet", &[CatalogEntry::new("b")])],
            FragmentFailurePolicy::Skip,
            SpatialOrdering::Hilbert,
        )
        .expect_err("corrupt");
        assert!(matches!(err, CatalogError::CorruptSnapshot { .. }));
    }

    #[test]
    fn status_serializes_with_tag() {
        let outcome = MergeOutcome::empty("run".into(), SpatialOrdering::Hilbert);
        let json = serde_json::to_value(CompactionStatus::from_result(&Ok(outcome))).expect("json");
        assert_eq!(json["status"], "noop");
        assert_eq!(json["merged_fragments"], 0);

        let err: Result<MergeOutcome> = Err(CatalogError::Conflict {
            message: "moved".into(),
        });
        let status = CompactionStatus::from_result(&err);
        assert!(status.is_failure());
        let json = serde_json::to_value(&status).expect("json");
        assert_eq!(json["status"], "failed");
        assert_eq!(json["kind"], "conflict");
        assert_eq!(json["retryable"], true);
    }

    #[tokio::test]
    async fn empty_pending_area_is_a_cheap_noop() {
        let storage = Arc::new(MemoryBackend::new());
        let engine = MergeEngine::new(storage.clone(), MergeConfig::default()).expect("engine");
        let outcome = engine.run().await.expect("run");
        assert!(outcome.is_noop());
        assert!(storage.head("catalog.parquet").await.expect("head").is_none());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = MergeConfig {
            row_group_size: 0,
            ..MergeConfig::default()
        };
        let err = MergeEngine::new(Arc::new(MemoryBackend::new()), config).expect_err("invalid");
        assert!(matches!(err, CatalogError::InvalidConfig { .. }));
    }
}
