//! Storage-level errors shared by the footprint crates.
//!
//! The catalog maps these into its own failure kinds; see
//! `footprint_catalog::CatalogError::from_storage`.

/// Result alias for storage calls.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by a [`StorageBackend`](crate::StorageBackend).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The store could not complete the call. Usually worth retrying.
    #[error("storage error: {message}")]
    Storage {
        /// What was being attempted.
        message: String,
        /// Client error, when there is one.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// No object at the requested key.
    #[error("not found: {0}")]
    NotFound(String),

    /// A bucket URL or key the backend cannot use.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Storage failure without an underlying client error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Storage failure caused by `source`.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether the key was absent.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_error_is_kept_as_source() {
        let err = Error::storage_with_source("list failed", std::io::Error::other("reset"));
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(err.to_string(), "storage error: list failed");
    }

    #[test]
    fn only_absent_keys_are_not_found() {
        assert!(Error::NotFound("catalog.parquet".into()).is_not_found());
        assert!(!Error::storage("boom").is_not_found());
        assert!(!Error::InvalidInput("ftp://x".into()).is_not_found());
    }
}
