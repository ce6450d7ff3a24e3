//! Merge metrics.
//!
//! Recorded through the `metrics` facade; the compactor binary installs the
//! Prometheus recorder. Without a recorder these calls are no-ops.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

// ============================================================================
// Run Metrics
// ============================================================================

/// Merge runs by outcome (`noop`, `success`, `failed`).
pub const MERGE_RUNS: &str = "footprint_merge_runs_total";

/// Merge run duration histogram.
pub const MERGE_DURATION: &str = "footprint_merge_duration_seconds";

/// Failed runs by failure kind.
pub const MERGE_FAILURES: &str = "footprint_merge_failures_total";

// ============================================================================
// Content Metrics
// ============================================================================

/// Fragments folded into a committed snapshot.
pub const FRAGMENTS_MERGED: &str = "footprint_merge_fragments_merged_total";

/// Fragments excluded under the skip policy.
pub const FRAGMENTS_SKIPPED: &str = "footprint_merge_fragments_skipped_total";

/// Fragments that disappeared between listing and fetching.
pub const FRAGMENTS_VANISHED: &str = "footprint_merge_fragments_vanished_total";

/// Rows dropped as superseded duplicates.
pub const ROWS_SUPERSEDED: &str = "footprint_merge_rows_superseded_total";

/// Bboxes filled or corrected from geometry.
pub const BBOX_REPAIRED: &str = "footprint_merge_bbox_repaired_total";

/// Row count of the last committed snapshot.
pub const SNAPSHOT_ROWS: &str = "footprint_merge_snapshot_rows";

// ============================================================================
// Cleanup Metrics
// ============================================================================

/// Delete chunks that failed after commit.
pub const DELETE_CHUNK_FAILURES: &str = "footprint_merge_delete_chunk_failures_total";

/// Staging leftovers removed.
pub const STAGING_SWEPT: &str = "footprint_merge_staging_swept_total";

// ============================================================================
// Metric Registration
// ============================================================================

/// Registers all merge metric descriptions.
///
/// Call this once at application startup after installing the recorder.
pub fn register_metrics() {
    describe_counter!(MERGE_RUNS, "Total merge runs by status");
    describe_histogram!(MERGE_DURATION, "Duration of merge runs in seconds");
    describe_counter!(MERGE_FAILURES, "Total failed merge runs by failure kind");
    describe_counter!(FRAGMENTS_MERGED, "Total fragments merged into a snapshot");
    describe_counter!(FRAGMENTS_SKIPPED, "Total unreadable fragments skipped");
    describe_counter!(FRAGMENTS_VANISHED, "Total fragments gone before fetch");
    describe_counter!(ROWS_SUPERSEDED, "Total duplicate rows superseded");
    describe_counter!(BBOX_REPAIRED, "Total bboxes derived from geometry");
    describe_gauge!(SNAPSHOT_ROWS, "Rows in the last committed snapshot");
    describe_counter!(DELETE_CHUNK_FAILURES, "Total fragment delete chunks that failed");
    describe_counter!(STAGING_SWEPT, "Total staging leftovers removed");
}

// ============================================================================
// Metric Recording
// ============================================================================

/// Records the end of a run.
pub fn record_run(status: &str, duration_secs: f64) {
    counter!(MERGE_RUNS, "status" => status.to_string()).increment(1);
    histogram!(MERGE_DURATION, "status" => status.to_string()).record(duration_secs);
}

/// Records a failed run.
pub fn record_failure(kind: &str) {
    counter!(MERGE_FAILURES, "kind" => kind.to_string()).increment(1);
}

/// Records the content of a committed merge.
#[allow(clippy::cast_precision_loss)]
pub fn record_commit(
    merged: u64,
    superseded: u64,
    bbox_repaired: u64,
    snapshot_rows: usize,
) {
    counter!(FRAGMENTS_MERGED).increment(merged);
    counter!(ROWS_SUPERSEDED).increment(superseded);
    counter!(BBOX_REPAIRED).increment(bbox_repaired);
    gauge!(SNAPSHOT_ROWS).set(snapshot_rows as f64);
}

/// Records fragments excluded from a run.
pub fn record_excluded(skipped: u64, vanished: u64) {
    counter!(FRAGMENTS_SKIPPED).increment(skipped);
    counter!(FRAGMENTS_VANISHED).increment(vanished);
}

/// Records a failed delete chunk.
pub fn record_delete_chunk_failure() {
    counter!(DELETE_CHUNK_FAILURES).increment(1);
}

/// Records swept staging objects.
pub fn record_staging_swept(count: u64) {
    counter!(STAGING_SWEPT).increment(count);
}
