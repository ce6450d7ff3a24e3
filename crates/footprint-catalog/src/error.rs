//! Error types for catalog compaction.

use serde::Serialize;
use thiserror::Error;

/// Result type alias for catalog operations.
pub type Result<T> = std::result::Result<T, CatalogError>;

/// Errors that can occur while compacting the catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Enumeration, read or write against the object store failed.
    ///
    /// Retryable by re-running the whole job.
    #[error("storage error: {message}")]
    TransientStorage {
        /// Description of the storage failure.
        message: String,
    },

    /// The object does not exist (e.g. a fragment deleted by a racing run).
    #[error("not found: {message}")]
    NotFound {
        /// Description of what was not found.
        message: String,
    },

    /// The canonical snapshot exists but cannot be decoded.
    #[error("corrupt snapshot {key}: {message}")]
    CorruptSnapshot {
        /// Snapshot key.
        key: String,
        /// Decoder error.
        message: String,
    },

    /// A pending fragment cannot be decoded or projected onto the catalog schema.
    #[error("malformed fragment {key}: {message}")]
    MalformedFragment {
        /// Fragment key.
        key: String,
        /// Decoder or schema error.
        message: String,
    },

    /// Another writer replaced the snapshot while this run was merging.
    #[error("snapshot changed concurrently: {message}")]
    Conflict {
        /// Description of the conflicting state.
        message: String,
    },

    /// Arrow/Parquet encoding of the new snapshot failed.
    #[error("parquet error: {message}")]
    Parquet {
        /// Description of the encoding failure.
        message: String,
    },

    /// Configuration is invalid.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the problem.
        message: String,
    },

    /// An internal invariant was violated.
    #[error("invariant violation: {message}")]
    InvariantViolation {
        /// Description of the violated invariant.
        message: String,
    },
}

/// Machine-readable classification of a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Object store enumeration/read/write failure; retry the job.
    TransientStorage,
    /// The existing snapshot is unreadable; needs operator intervention.
    CorruptSnapshot,
    /// A fragment is unreadable under the `abort` policy.
    MalformedFragment,
    /// A concurrent writer won the publish race; retry the job.
    Conflict,
    /// The new snapshot could not be encoded.
    Encoding,
    /// Configuration is invalid.
    InvalidConfig,
    /// The run hit its time limit. Nothing commits after the limit, so a
    /// rerun starts from a consistent state.
    Timeout,
    /// Internal invariant violation.
    Internal,
}

impl FailureKind {
    /// Returns the stable string form used in logs and metrics labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::TransientStorage => "transient_storage",
            Self::CorruptSnapshot => "corrupt_snapshot",
            Self::MalformedFragment => "malformed_fragment",
            Self::Conflict => "conflict",
            Self::Encoding => "encoding",
            Self::InvalidConfig => "invalid_config",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
        }
    }

    /// Returns true if blindly re-running the job may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientStorage | Self::Conflict | Self::Timeout)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CatalogError {
    /// Classifies the error for status reporting.
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::TransientStorage { .. } | Self::NotFound { .. } => FailureKind::TransientStorage,
            Self::CorruptSnapshot { .. } => FailureKind::CorruptSnapshot,
            Self::MalformedFragment { .. } => FailureKind::MalformedFragment,
            Self::Conflict { .. } => FailureKind::Conflict,
            Self::Parquet { .. } => FailureKind::Encoding,
            Self::InvalidConfig { .. } => FailureKind::InvalidConfig,
            Self::InvariantViolation { .. } => FailureKind::Internal,
        }
    }

    /// Wraps a storage error, preserving not-found classification.
    #[must_use]
    pub fn from_storage(context: &str, err: &footprint_core::Error) -> Self {
        if err.is_not_found() {
            Self::NotFound {
                message: format!("{context}: {err}"),
            }
        } else {
            Self::TransientStorage {
                message: format!("{context}: {err}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable_strings() {
        let err = CatalogError::CorruptSnapshot {
            key: "catalog.parquet".into(),
            message: "bad magic".into(),
        };
        assert_eq!(err.kind().as_str(), "corrupt_snapshot");
        assert!(!err.kind().is_retryable());

        let err = CatalogError::Conflict {
            message: "version moved".into(),
        };
        assert!(err.kind().is_retryable());
    }

    #[test]
    fn storage_not_found_is_preserved() {
        let core = footprint_core::Error::NotFound("catalog/pending/a.parquet".into());
        let err = CatalogError::from_storage("fetch fragment", &core);
        assert!(matches!(err, CatalogError::NotFound { .. }));

        let core = footprint_core::Error::storage("timeout");
        let err = CatalogError::from_storage("list pending", &core);
        assert!(matches!(err, CatalogError::TransientStorage { .. }));
    }

    #[test]
    fn timeout_is_retryable() {
        assert_eq!(FailureKind::Timeout.as_str(), "timeout");
        assert!(FailureKind::Timeout.is_retryable());
        assert!(!FailureKind::Internal.is_retryable());
    }

    #[test]
    fn failure_kind_serializes_snake_case() {
        let json = serde_json::to_string(&FailureKind::MalformedFragment).expect("json");
        assert_eq!(json, "\"malformed_fragment\"");
    }
}
