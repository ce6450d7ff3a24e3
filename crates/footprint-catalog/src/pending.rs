//! Pending fragment registry.
//!
//! Fragments are written by the ingestion side, one per upload, under the
//! pending prefix. The registry lists them, fetches their contents, and
//! retires them in bounded delete requests once a snapshot containing them has
//! been committed.

use std::sync::Arc;

use footprint_core::{CatalogPaths, StorageBackend};
use serde::Serialize;

use crate::config::DEFAULT_DELETE_BATCH_SIZE;
use crate::error::{CatalogError, Result};
use crate::metrics;
use crate::parquet_util::{DecodedFile, read_parquet};

/// Reference to a pending fragment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FragmentRef {
    /// Storage key.
    pub key: String,
    /// Object size in bytes at listing time.
    pub size: u64,
}

/// A delete request that failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedChunk {
    /// Keys in the failed request.
    pub keys: Vec<String>,
    /// Storage error.
    pub message: String,
}

/// Outcome of retiring fragments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    /// Keys deleted successfully.
    pub deleted: usize,
    /// Chunks that failed; their fragments stay pending and are re-merged
    /// harmlessly by the next run.
    pub failed_chunks: Vec<FailedChunk>,
}

impl DeleteReport {
    /// Returns the number of keys left behind by failed chunks.
    #[must_use]
    pub fn failed_keys(&self) -> usize {
        self.failed_chunks.iter().map(|c| c.keys.len()).sum()
    }

    /// Returns true if every chunk succeeded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed_chunks.is_empty()
    }
}

/// Registry of pending fragments.
#[derive(Clone)]
pub struct PendingRegistry {
    storage: Arc<dyn StorageBackend>,
    paths: CatalogPaths,
    delete_batch_size: usize,
}

impl std::fmt::Debug for PendingRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRegistry")
            .field("pending_prefix", &self.paths.pending_prefix())
            .field("delete_batch_size", &self.delete_batch_size)
            .finish_non_exhaustive()
    }
}

impl PendingRegistry {
    /// Creates a registry with the default delete batch size.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, paths: CatalogPaths) -> Self {
        Self {
            storage,
            paths,
            delete_batch_size: DEFAULT_DELETE_BATCH_SIZE,
        }
    }

    /// Sets the maximum number of keys per delete request.
    #[must_use]
    pub fn with_delete_batch_size(mut self, size: usize) -> Self {
        self.delete_batch_size = size.max(1);
        self
    }

    /// Lists every fragment present now, sorted by key.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::TransientStorage`] if enumeration fails.
    pub async fn list(&self) -> Result<Vec<FragmentRef>> {
        let objects = self
            .storage
            .list(self.paths.pending_prefix())
            .await
            .map_err(|e| CatalogError::TransientStorage {
                message: format!("list pending fragments: {e}"),
            })?;

        let mut refs: Vec<FragmentRef> = objects
            .into_iter()
            .filter(|meta| self.paths.is_fragment_key(&meta.path))
            .map(|meta| FragmentRef {
                key: meta.path,
                size: meta.size,
            })
            .collect();
        refs.sort();
        tracing::debug!(fragments = refs.len(), "listed pending fragments");
        Ok(refs)
    }

    /// Fetches and decodes a fragment.
    ///
    /// # Errors
    ///
    /// - [`CatalogError::NotFound`] if the fragment was deleted after listing
    /// - [`CatalogError::TransientStorage`] on other read failures
    /// - [`CatalogError::MalformedFragment`] if the payload is not Parquet
    pub async fn fetch(&self, fragment: &FragmentRef) -> Result<DecodedFile> {
        let bytes = self
            .storage
            .get(&fragment.key)
            .await
            .map_err(|e| CatalogError::from_storage("fetch fragment", &e))?;
        read_parquet(&bytes).map_err(|e| CatalogError::MalformedFragment {
            key: fragment.key.clone(),
            message: e.to_string(),
        })
    }

    /// Deletes fragments in chunks of at most the configured batch size.
    ///
    /// A failed chunk is logged and reported; the remaining chunks are still
    /// attempted.
    pub async fn delete(&self, fragments: &[FragmentRef]) -> DeleteReport {
        let keys: Vec<String> = fragments.iter().map(|f| f.key.clone()).collect();
        let mut report = DeleteReport::default();

        for chunk in keys.chunks(self.delete_batch_size) {
            match self.storage.delete_batch(chunk).await {
                Ok(()) => report.deleted += chunk.len(),
                Err(e) => {
                    tracing::warn!(
                        keys = chunk.len(),
                        first_key = %chunk[0],
                        error = %e,
                        "failed to delete fragment chunk; fragments stay pending"
                    );
                    metrics::record_delete_chunk_failure();
                    report.failed_chunks.push(FailedChunk {
                        keys: chunk.to_vec(),
                        message: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            deleted = report.deleted,
            failed_keys = report.failed_keys(),
            "retired merged fragments"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use footprint_core::{MemoryBackend, WritePrecondition};

    use crate::entry::{CatalogEntry, entries_to_batch};
    use crate::parquet_util::write_fragment;

    async fn put(storage: &MemoryBackend, key: &str, data: Bytes) {
        storage
            .put(key, data, WritePrecondition::None)
            .await
            .expect("put");
    }

    fn fragment_bytes(id: &str) -> Bytes {
        let batch = entries_to_batch(&[CatalogEntry::new(id)]).expect("batch");
        write_fragment(&batch).expect("write")
    }

    fn registry(storage: Arc<MemoryBackend>) -> PendingRegistry {
        PendingRegistry::new(storage, CatalogPaths::default())
    }

    #[tokio::test]
    async fn list_returns_sorted_parquet_fragments_only() {
        let storage = Arc::new(MemoryBackend::new());
        put(&storage, "catalog/pending/b.parquet", fragment_bytes("b")).await;
        put(&storage, "catalog/pending/a.parquet", fragment_bytes("a")).await;
        put(&storage, "catalog/pending/notes.txt", Bytes::from_static(b"x")).await;
        put(&storage, "catalog.parquet", fragment_bytes("s")).await;

        let refs = registry(storage).list().await.expect("list");
        let keys: Vec<&str> = refs.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["catalog/pending/a.parquet", "catalog/pending/b.parquet"]);
        assert!(refs.iter().all(|r| r.size > 0));
    }

    #[tokio::test]
    async fn fetch_classifies_failures() {
        let storage = Arc::new(MemoryBackend::new());
        put(&storage, "catalog/pending/bad.parquet", Bytes::from_static(b"nope")).await;
        let registry = registry(storage);

        let bad = FragmentRef {
            key: "catalog/pending/bad.parquet".into(),
            size: 4,
        };
        assert!(matches!(
            registry.fetch(&bad).await,
            Err(CatalogError::MalformedFragment { .. })
        ));

        let gone = FragmentRef {
            key: "catalog/pending/gone.parquet".into(),
            size: 1,
        };
        assert!(matches!(
            registry.fetch(&gone).await,
            Err(CatalogError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn delete_removes_all_fragments_in_chunks() {
        let storage = Arc::new(MemoryBackend::new());
        let mut refs = Vec::new();
        for i in 0..5 {
            let key = format!("catalog/pending/{i}.parquet");
            put(&storage, &key, fragment_bytes("x")).await;
            refs.push(FragmentRef { key, size: 1 });
        }

        let registry = registry(Arc::clone(&storage)).with_delete_batch_size(2);
        let report = registry.delete(&refs).await;
        assert_eq!(report.deleted, 5);
        assert!(report.is_complete());
        assert!(registry.list().await.expect("list").is_empty());
    }
}
