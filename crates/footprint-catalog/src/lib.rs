//! # footprint-catalog
//!
//! Merge/compaction engine for the footprint imagery catalog.
//!
//! The catalog is a single GeoParquet snapshot of imagery metadata that
//! clients query directly with spatial predicate pushdown. Uploads drop one
//! small Parquet fragment each under a pending prefix; the engine
//! periodically folds them into a new snapshot:
//!
//! - **Schema union**: columns matched by name, absent columns become nulls
//! - **Conflict resolution**: one row per `id`, most recent `uploaded_at` wins
//! - **Derived columns**: bbox recomputed from geometry where missing or stale
//! - **Spatial ordering**: rows sorted along a Hilbert curve for row-group pruning
//! - **Atomic publish**: staged write, version check, rename
//!
//! ## Storage Layout
//!
//! ```text
//! {bucket}/
//! ├── catalog.parquet              # canonical snapshot
//! └── catalog/
//!     ├── pending/{upload}.parquet # fragments awaiting merge
//!     └── _staging/{ulid}.parquet  # snapshot being published
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use footprint_catalog::{MergeConfig, MergeEngine};
//! use footprint_core::MemoryBackend;
//!
//! let engine = MergeEngine::new(Arc::new(MemoryBackend::new()), MergeConfig::default())?;
//! let outcome = engine.run().await?;
//! println!("merged {} fragments", outcome.merged_fragments);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod engine;
pub mod entry;
pub mod error;
pub mod geometry;
pub mod metrics;
pub mod parquet_util;
pub mod pending;
pub mod resolver;
pub mod schema;
pub mod snapshot;
pub mod spatial_key;

// Re-export main types at crate root
pub use config::{FragmentFailurePolicy, MergeConfig, SnapshotCompression, SpatialOrdering};
pub use engine::{CompactionStatus, MergeEngine, MergeOutcome, MergedTable, SkippedFragment, merge_tables};
pub use entry::{CatalogEntry, batch_to_entries, entries_to_batch};
pub use error::{CatalogError, FailureKind, Result};
pub use geometry::BBox;
pub use pending::{DeleteReport, FragmentRef, PendingRegistry};
pub use resolver::{ConflictResolver, RecencyKey};
pub use schema::{SchemaUnion, snapshot_schema};
pub use snapshot::{LoadedSnapshot, SnapshotStore};
pub use spatial_key::{HILBERT_ORDER, SpatialKey};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{FragmentFailurePolicy, MergeConfig, SpatialOrdering};
    pub use crate::engine::{CompactionStatus, MergeEngine, MergeOutcome};
    pub use crate::entry::CatalogEntry;
    pub use crate::error::{CatalogError, Result};
}
