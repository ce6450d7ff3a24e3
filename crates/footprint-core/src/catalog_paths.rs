//! Canonical storage paths for the footprint catalog.
//!
//! This module is the **single source of truth** for catalog storage keys.
//! Writers and readers construct keys through [`CatalogPaths`]; no other module
//! hardcodes a key layout.
//!
//! # Path Layout
//!
//! ```text
//! {bucket}/
//! ├── catalog.parquet              # canonical snapshot (GeoParquet)
//! └── catalog/
//!     ├── pending/
//!     │   └── {upload_id}.parquet  # one sidecar fragment per upload
//!     └── _staging/
//!         └── {ulid}.parquet       # snapshot being published
//! ```

/// Default key of the canonical snapshot.
pub const DEFAULT_SNAPSHOT_KEY: &str = "catalog.parquet";

/// Default prefix holding pending fragments.
pub const DEFAULT_PENDING_PREFIX: &str = "catalog/pending/";

/// Default prefix for staged snapshots awaiting promotion.
pub const DEFAULT_STAGING_PREFIX: &str = "catalog/_staging/";

/// File suffix shared by fragments and snapshots.
pub const PARQUET_SUFFIX: &str = ".parquet";

/// Canonical key generator for catalog storage.
///
/// # Example
///
/// ```
/// use footprint_core::catalog_paths::CatalogPaths;
///
/// let paths = CatalogPaths::default();
/// assert_eq!(paths.snapshot_key(), "catalog.parquet");
/// assert_eq!(paths.fragment_key("up-1"), "catalog/pending/up-1.parquet");
/// assert!(paths.is_fragment_key("catalog/pending/up-1.parquet"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogPaths {
    snapshot_key: String,
    pending_prefix: String,
    staging_prefix: String,
}

impl Default for CatalogPaths {
    fn default() -> Self {
        Self {
            snapshot_key: DEFAULT_SNAPSHOT_KEY.to_string(),
            pending_prefix: DEFAULT_PENDING_PREFIX.to_string(),
            staging_prefix: DEFAULT_STAGING_PREFIX.to_string(),
        }
    }
}

impl CatalogPaths {
    /// Creates a path layout with custom locations.
    ///
    /// Prefixes are normalized to end with `/`.
    #[must_use]
    pub fn new(
        snapshot_key: impl Into<String>,
        pending_prefix: impl Into<String>,
        staging_prefix: impl Into<String>,
    ) -> Self {
        Self {
            snapshot_key: snapshot_key.into(),
            pending_prefix: normalize_prefix(pending_prefix.into()),
            staging_prefix: normalize_prefix(staging_prefix.into()),
        }
    }

    /// Returns the canonical snapshot key.
    #[must_use]
    pub fn snapshot_key(&self) -> &str {
        &self.snapshot_key
    }

    /// Returns the pending fragment prefix (ends with `/`).
    #[must_use]
    pub fn pending_prefix(&self) -> &str {
        &self.pending_prefix
    }

    /// Returns the staging prefix (ends with `/`).
    #[must_use]
    pub fn staging_prefix(&self) -> &str {
        &self.staging_prefix
    }

    /// Returns the key of the fragment for an upload.
    #[must_use]
    pub fn fragment_key(&self, upload_id: &str) -> String {
        format!("{}{upload_id}{PARQUET_SUFFIX}", self.pending_prefix)
    }

    /// Returns a staging key for a snapshot identified by `staging_id`.
    #[must_use]
    pub fn staging_key(&self, staging_id: &str) -> String {
        format!("{}{staging_id}{PARQUET_SUFFIX}", self.staging_prefix)
    }

    /// Returns true if `key` is a fragment under the pending prefix.
    #[must_use]
    pub fn is_fragment_key(&self, key: &str) -> bool {
        key.starts_with(&self.pending_prefix) && key.ends_with(PARQUET_SUFFIX)
    }

    /// Returns true if `key` is a staged snapshot.
    #[must_use]
    pub fn is_staging_key(&self, key: &str) -> bool {
        key.starts_with(&self.staging_prefix) && key.ends_with(PARQUET_SUFFIX)
    }

    /// Checks that the layout is usable.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if keys are empty or overlap.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.snapshot_key.trim().is_empty() {
            return Err("snapshot key must not be empty".to_string());
        }
        if self.pending_prefix == "/" {
            return Err("pending prefix must not be the bucket root".to_string());
        }
        if self.staging_prefix == "/" {
            return Err("staging prefix must not be the bucket root".to_string());
        }
        if self.snapshot_key.starts_with(&self.pending_prefix) {
            return Err(format!(
                "snapshot key {} must not live under the pending prefix {}",
                self.snapshot_key, self.pending_prefix
            ));
        }
        if self.staging_prefix.starts_with(&self.pending_prefix)
            || self.pending_prefix.starts_with(&self.staging_prefix)
        {
            return Err("pending and staging prefixes must not overlap".to_string());
        }
        Ok(())
    }
}

fn normalize_prefix(prefix: String) -> String {
    let trimmed = prefix.trim_start_matches('/');
    if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    }
}
