//! Custom assertion helpers for merge integration tests.

use footprint_catalog::CatalogEntry;

use crate::storage::{StorageOp, TracingMemoryBackend};

/// Asserts that every id appears exactly once.
///
/// # Panics
///
/// Panics on the first duplicated id.
pub fn assert_unique_ids(entries: &[CatalogEntry]) {
    let mut seen = std::collections::HashSet::new();
    for entry in entries {
        assert!(seen.insert(entry.id.as_str()), "duplicate id {}", entry.id);
    }
}

/// Asserts that no write, rename or delete touched `key`.
///
/// # Panics
///
/// Panics if `key` was modified.
pub fn assert_untouched(storage: &TracingMemoryBackend, key: &str) {
    let writes: Vec<StorageOp> = storage
        .operations()
        .into_iter()
        .filter(|op| match op {
            StorageOp::Put { path, .. } | StorageOp::Delete { path } => path == key,
            StorageOp::DeleteBatch { paths } => paths.iter().any(|p| p == key),
            StorageOp::Rename { from, to } => from == key || to == key,
            _ => false,
        })
        .collect();
    assert!(writes.is_empty(), "expected {key} untouched, saw {writes:?}");
}

/// Asserts that the run issued no delete of any kind.
///
/// # Panics
///
/// Panics if a delete was recorded.
pub fn assert_no_deletes(storage: &TracingMemoryBackend) {
    let deletes: Vec<StorageOp> = storage
        .operations()
        .into_iter()
        .filter(|op| matches!(op, StorageOp::Delete { .. } | StorageOp::DeleteBatch { .. }))
        .collect();
    assert!(deletes.is_empty(), "expected no deletes, saw {deletes:?}");
}
