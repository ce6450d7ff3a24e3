//! Canonical snapshot storage with two-phase publish.
//!
//! A new snapshot is written under a unique staging key, the canonical
//! object's version is checked against the one observed when the merge read
//! it, and the staged object is promoted with the backend's atomic rename.
//! Readers of the canonical key see either the old snapshot or the complete
//! new one.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use footprint_core::{CatalogPaths, StorageBackend, WritePrecondition};
use ulid::Ulid;

use crate::error::{CatalogError, Result};
use crate::metrics;
use crate::parquet_util::{DecodedFile, read_parquet};

/// Snapshot read from storage together with the version observed.
#[derive(Debug, Clone)]
pub struct LoadedSnapshot {
    /// Decoded contents.
    pub file: DecodedFile,
    /// Object version at read time.
    pub version: String,
}

/// Reader and sole writer of the canonical snapshot.
#[derive(Clone)]
pub struct SnapshotStore {
    storage: Arc<dyn StorageBackend>,
    paths: CatalogPaths,
    delete_batch_size: usize,
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("snapshot_key", &self.paths.snapshot_key())
            .field("staging_prefix", &self.paths.staging_prefix())
            .field("delete_batch_size", &self.delete_batch_size)
            .finish_non_exhaustive()
    }
}

impl SnapshotStore {
    /// Creates a store over the given backend and key layout.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, paths: CatalogPaths) -> Self {
        Self {
            storage,
            paths,
            delete_batch_size: crate::config::DEFAULT_DELETE_BATCH_SIZE,
        }
    }

    /// Sets the maximum keys per delete request used by the staging sweep.
    #[must_use]
    pub fn with_delete_batch_size(mut self, size: usize) -> Self {
        self.delete_batch_size = size.max(1);
        self
    }

    /// Returns the canonical snapshot key.
    #[must_use]
    pub fn key(&self) -> &str {
        self.paths.snapshot_key()
    }

    /// Reads the current snapshot.
    ///
    /// Returns `Ok(None)` when no snapshot has been published yet.
    ///
    /// # Errors
    ///
    /// - [`CatalogError::TransientStorage`] if the object cannot be read
    /// - [`CatalogError::CorruptSnapshot`] if it cannot be decoded
    pub async fn read(&self) -> Result<Option<LoadedSnapshot>> {
        let key = self.paths.snapshot_key();
        let Some(meta) = self
            .storage
            .head(key)
            .await
            .map_err(|e| CatalogError::from_storage("head snapshot", &e))?
        else {
            tracing::info!(snapshot = key, "no existing snapshot");
            return Ok(None);
        };

        let bytes = self
            .storage
            .get(key)
            .await
            .map_err(|e| CatalogError::TransientStorage {
                message: format!("read snapshot {key}: {e}"),
            })?;
        let file = read_parquet(&bytes).map_err(|e| CatalogError::CorruptSnapshot {
            key: key.to_string(),
            message: e.to_string(),
        })?;

        tracing::info!(
            snapshot = key,
            version = %meta.version,
            rows = file.num_rows(),
            "loaded snapshot"
        );
        Ok(Some(LoadedSnapshot {
            file,
            version: meta.version,
        }))
    }

    /// Publishes a new snapshot.
    ///
    /// `observed_version` is the version returned by [`SnapshotStore::read`],
    /// or `None` if no snapshot existed. Returns the version of the published
    /// object when the backend reports one.
    ///
    /// # Errors
    ///
    /// - [`CatalogError::Conflict`] if the canonical snapshot changed since it
    ///   was read
    /// - [`CatalogError::TransientStorage`] if staging or promotion fails
    ///
    /// On error the canonical snapshot is untouched and the staged object is
    /// removed best-effort.
    pub async fn commit(&self, bytes: Bytes, observed_version: Option<&str>) -> Result<Option<String>> {
        let staging_key = self.paths.staging_key(&Ulid::new().to_string());
        let canonical = self.paths.snapshot_key();

        // Staging keys are fresh ULIDs, so the write needs no precondition.
        self.storage
            .put(&staging_key, bytes, WritePrecondition::None)
            .await
            .map_err(|e| CatalogError::TransientStorage {
                message: format!("stage snapshot {staging_key}: {e}"),
            })?;
        tracing::debug!(staging_key = %staging_key, "staged snapshot");

        if let Err(err) = self.promote(&staging_key, canonical, observed_version).await {
            self.discard(&staging_key).await;
            return Err(err);
        }

        let version = self
            .storage
            .head(canonical)
            .await
            .ok()
            .flatten()
            .map(|meta| meta.version);
        tracing::info!(
            snapshot = canonical,
            version = version.as_deref().unwrap_or("unknown"),
            "published snapshot"
        );
        Ok(version)
    }

    async fn promote(
        &self,
        staging_key: &str,
        canonical: &str,
        observed_version: Option<&str>,
    ) -> Result<()> {
        let current = self
            .storage
            .head(canonical)
            .await
            .map_err(|e| CatalogError::TransientStorage {
                message: format!("check snapshot version: {e}"),
            })?
            .map(|meta| meta.version);
        if current.as_deref() != observed_version {
            return Err(CatalogError::Conflict {
                message: format!(
                    "snapshot {canonical} is at version {} but {} was read",
                    current.as_deref().unwrap_or("<absent>"),
                    observed_version.unwrap_or("<absent>"),
                ),
            });
        }

        self.storage
            .rename(staging_key, canonical)
            .await
            .map_err(|e| CatalogError::TransientStorage {
                message: format!("promote {staging_key} to {canonical}: {e}"),
            })
    }

    async fn discard(&self, staging_key: &str) {
        if let Err(e) = self.storage.delete(staging_key).await {
            tracing::warn!(staging_key, error = %e, "failed to remove staged snapshot");
        }
    }

    /// Removes staged snapshots older than `max_age` left by crashed runs.
    ///
    /// Returns the number of objects removed.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::TransientStorage`] if listing or deletion fails.
    pub async fn sweep_staging(&self, max_age: Duration) -> Result<usize> {
        let max_age = chrono::Duration::from_std(max_age).map_err(|e| {
            CatalogError::InvalidConfig {
                message: format!("staging max age out of range: {e}"),
            }
        })?;
        let cutoff = Utc::now() - max_age;

        let objects = self
            .storage
            .list(self.paths.staging_prefix())
            .await
            .map_err(|e| CatalogError::TransientStorage {
                message: format!("list staging: {e}"),
            })?;
        let stale: Vec<String> = objects
            .into_iter()
            .filter(|meta| self.paths.is_staging_key(&meta.path))
            .filter(|meta| meta.last_modified.is_some_and(|at| at <= cutoff))
            .map(|meta| meta.path)
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }

        for chunk in stale.chunks(self.delete_batch_size) {
            self.storage
                .delete_batch(chunk)
                .await
                .map_err(|e| CatalogError::TransientStorage {
                    message: format!("sweep staging: {e}"),
                })?;
        }
        tracing::info!(swept = stale.len(), "removed stale staged snapshots");
        metrics::record_staging_swept(stale.len() as u64);
        Ok(stale.len())
    }
}
