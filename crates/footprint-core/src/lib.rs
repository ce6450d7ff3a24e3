//! # footprint-core
//!
//! Core abstractions shared by the footprint catalog crates:
//!
//! - **Storage**: the [`StorageBackend`] contract plus memory and `object_store` backends
//! - **Paths**: the canonical key layout of snapshot, pending and staging objects
//! - **Errors**: shared storage error type and result alias
//! - **Observability**: logging initialization and span helpers
//!
//! ## Example
//!
//! ```rust
//! use footprint_core::prelude::*;
//!
//! let backend = MemoryBackend::new();
//! let paths = CatalogPaths::default();
//! assert_eq!(paths.snapshot_key(), "catalog.parquet");
//! # let _ = backend;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]

pub mod catalog_paths;
pub mod error;
pub mod observability;
pub mod storage;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::catalog_paths::CatalogPaths;
    pub use crate::error::{Error, Result};
    pub use crate::storage::{
        MemoryBackend, ObjectMeta, ObjectStoreBackend, StorageBackend, WritePrecondition,
        WriteResult,
    };
}

pub use catalog_paths::CatalogPaths;
pub use error::{Error, Result};
pub use observability::{LogFormat, init_logging, merge_span};
pub use storage::{
    MemoryBackend, ObjectMeta, ObjectStoreBackend, StorageBackend, WritePrecondition, WriteResult,
};
