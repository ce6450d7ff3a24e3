//! Merge configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use footprint_core::CatalogPaths;
use footprint_core::catalog_paths::{
    DEFAULT_PENDING_PREFIX, DEFAULT_SNAPSHOT_KEY, DEFAULT_STAGING_PREFIX,
};
use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, Result};

/// Default maximum rows per Parquet row group.
pub const DEFAULT_ROW_GROUP_SIZE: usize = 10_000;

/// Default number of keys per delete request.
pub const DEFAULT_DELETE_BATCH_SIZE: usize = 1000;

/// Default age after which staging leftovers are swept.
pub const DEFAULT_STAGING_MAX_AGE_SECS: u64 = 3600;

/// Snapshot compression codec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotCompression {
    /// Zstandard (level 3).
    #[default]
    Zstd,
    /// Snappy.
    Snappy,
    /// No compression.
    Uncompressed,
}

impl FromStr for SnapshotCompression {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zstd" => Ok(Self::Zstd),
            "snappy" => Ok(Self::Snappy),
            "uncompressed" | "none" => Ok(Self::Uncompressed),
            other => Err(format!(
                "unknown compression '{other}' (expected zstd, snappy or uncompressed)"
            )),
        }
    }
}

/// What to do when a pending fragment cannot be read or projected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentFailurePolicy {
    /// Fail the whole run; nothing is written or deleted.
    #[default]
    Abort,
    /// Exclude the fragment, leave it pending, and report it.
    Skip,
}

impl FromStr for FragmentFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(Self::Abort),
            "skip" => Ok(Self::Skip),
            other => Err(format!("unknown fragment policy '{other}' (expected abort or skip)")),
        }
    }
}

/// Row ordering of the emitted snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpatialOrdering {
    /// Hilbert-curve order, ties and unlocated rows by `id`.
    #[default]
    Hilbert,
    /// Degraded mode: global `id` order, no spatial clustering.
    IdOnly,
}

impl SpatialOrdering {
    /// Returns the stable string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Hilbert => "hilbert",
            Self::IdOnly => "id_only",
        }
    }
}

impl fmt::Display for SpatialOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpatialOrdering {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "hilbert" => Ok(Self::Hilbert),
            "id_only" | "id" => Ok(Self::IdOnly),
            other => Err(format!("unknown ordering '{other}' (expected hilbert or id_only)")),
        }
    }
}

fn default_snapshot_key() -> String {
    DEFAULT_SNAPSHOT_KEY.to_string()
}

fn default_pending_prefix() -> String {
    DEFAULT_PENDING_PREFIX.to_string()
}

fn default_staging_prefix() -> String {
    DEFAULT_STAGING_PREFIX.to_string()
}

const fn default_row_group_size() -> usize {
    DEFAULT_ROW_GROUP_SIZE
}

const fn default_delete_batch_size() -> usize {
    DEFAULT_DELETE_BATCH_SIZE
}

const fn default_staging_max_age_secs() -> u64 {
    DEFAULT_STAGING_MAX_AGE_SECS
}

/// Configuration of one merge run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Key of the canonical snapshot.
    #[serde(default = "default_snapshot_key")]
    pub snapshot_key: String,

    /// Prefix holding pending fragments.
    #[serde(default = "default_pending_prefix")]
    pub pending_prefix: String,

    /// Prefix for staged snapshots.
    #[serde(default = "default_staging_prefix")]
    pub staging_prefix: String,

    /// Maximum rows per Parquet row group.
    #[serde(default = "default_row_group_size")]
    pub row_group_size: usize,

    /// Snapshot compression codec.
    #[serde(default)]
    pub compression: SnapshotCompression,

    /// Maximum keys per delete request.
    #[serde(default = "default_delete_batch_size")]
    pub delete_batch_size: usize,

    /// Handling of unreadable fragments.
    #[serde(default)]
    pub fragment_failure_policy: FragmentFailurePolicy,

    /// Row ordering mode.
    #[serde(default)]
    pub spatial_ordering: SpatialOrdering,

    /// Staging leftovers older than this are swept (seconds).
    #[serde(default = "default_staging_max_age_secs")]
    pub staging_max_age_secs: u64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            snapshot_key: default_snapshot_key(),
            pending_prefix: default_pending_prefix(),
            staging_prefix: default_staging_prefix(),
            row_group_size: DEFAULT_ROW_GROUP_SIZE,
            compression: SnapshotCompression::default(),
            delete_batch_size: DEFAULT_DELETE_BATCH_SIZE,
            fragment_failure_policy: FragmentFailurePolicy::default(),
            spatial_ordering: SpatialOrdering::default(),
            staging_max_age_secs: DEFAULT_STAGING_MAX_AGE_SECS,
        }
    }
}

impl MergeConfig {
    /// Returns the storage key layout.
    #[must_use]
    pub fn paths(&self) -> CatalogPaths {
        CatalogPaths::new(
            self.snapshot_key.clone(),
            self.pending_prefix.clone(),
            self.staging_prefix.clone(),
        )
    }

    /// Returns the staging max age as a duration.
    #[must_use]
    pub const fn staging_max_age(&self) -> Duration {
        Duration::from_secs(self.staging_max_age_secs)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::InvalidConfig`] for zero sizes or an
    /// inconsistent key layout.
    pub fn validate(&self) -> Result<()> {
        if self.row_group_size == 0 {
            return Err(CatalogError::InvalidConfig {
                message: "row_group_size must be greater than zero".to_string(),
            });
        }
        if self.delete_batch_size == 0 {
            return Err(CatalogError::InvalidConfig {
                message: "delete_batch_size must be greater than zero".to_string(),
            });
        }
        if self.delete_batch_size > DEFAULT_DELETE_BATCH_SIZE {
            return Err(CatalogError::InvalidConfig {
                message: format!(
                    "delete_batch_size {} exceeds the object store limit of {DEFAULT_DELETE_BATCH_SIZE}",
                    self.delete_batch_size
                ),
            });
        }
        self.paths()
            .validate()
            .map_err(|message| CatalogError::InvalidConfig { message })
    }
}
