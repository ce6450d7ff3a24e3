//! Pre-built test fixtures for common merge scenarios.
//!
//! Provides factory functions to create catalog rows and to place fragments
//! and snapshots in storage the way the ingestion side would.

use std::str::FromStr;
use std::sync::Arc;

use arrow::compute::concat_batches;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use footprint_catalog::parquet_util::{DecodedFile, WriteSettings, read_parquet, write_fragment, write_snapshot};
use footprint_catalog::schema::columns;
use footprint_catalog::{CatalogEntry, MergeConfig, MergeEngine, batch_to_entries, entries_to_batch};
use footprint_core::{StorageBackend, WritePrecondition};
use geo_types::Geometry;

use crate::storage::TracingMemoryBackend;

/// Parses WKT into a geometry.
///
/// # Panics
///
/// Panics if the text is not valid WKT.
pub fn parse_wkt(text: &str) -> Geometry<f64> {
    wkt::Wkt::from_str(text)
        .map_err(|e| format!("{e:?}"))
        .and_then(|w| w.try_into().map_err(|e: wkt::conversion::Error| format!("{e:?}")))
        .expect("valid WKT")
}

/// Axis-aligned square footprint centered on `(lon, lat)` with side `size`.
pub fn square(lon: f64, lat: f64, size: f64) -> Geometry<f64> {
    let h = size / 2.0;
    parse_wkt(&format!(
        "POLYGON(({x0} {y0}, {x1} {y0}, {x1} {y1}, {x0} {y1}, {x0} {y0}))",
        x0 = lon - h,
        x1 = lon + h,
        y0 = lat - h,
        y1 = lat + h,
    ))
}

/// A located entry with a title and upload time.
pub fn footprint(id: &str, geometry: Geometry<f64>, uploaded_at: &str) -> CatalogEntry {
    CatalogEntry::new(id)
        .with_geometry(geometry)
        .with_uploaded_at(uploaded_at)
        .with_title(format!("image {id}"))
}

/// Encodes entries as an ingestion-side fragment.
pub fn fragment_bytes(entries: &[CatalogEntry]) -> Bytes {
    let batch = entries_to_batch(entries).expect("entries batch");
    write_fragment(&batch).expect("write fragment")
}

/// Encodes entries as a fragment that omits the `bbox` column entirely.
pub fn fragment_bytes_without_bbox(entries: &[CatalogEntry]) -> Bytes {
    let batch = entries_to_batch(entries).expect("entries batch");
    let keep: Vec<usize> = batch
        .schema()
        .fields()
        .iter()
        .enumerate()
        .filter(|(_, f)| f.name() != columns::BBOX)
        .map(|(i, _)| i)
        .collect();
    write_fragment(&batch.project(&keep).expect("project")).expect("write fragment")
}

/// Encodes an arbitrary batch as a fragment.
pub fn batch_fragment_bytes(batch: &RecordBatch) -> Bytes {
    write_fragment(batch).expect("write fragment")
}

/// Encodes entries as a snapshot with default settings.
pub fn snapshot_bytes(entries: &[CatalogEntry]) -> Bytes {
    let batch = entries_to_batch(entries).expect("entries batch");
    write_snapshot(&batch, &WriteSettings::default()).expect("write snapshot")
}

/// Concatenates every batch of a decoded file.
pub fn single_batch(file: &DecodedFile) -> RecordBatch {
    concat_batches(&file.schema, &file.batches).expect("concat")
}

/// Test context with pre-configured storage and merge settings.
pub struct TestContext {
    /// Shared storage backend.
    pub storage: Arc<TracingMemoryBackend>,
    /// Merge configuration used by [`TestContext::engine`].
    pub config: MergeConfig,
}

impl TestContext {
    /// Creates a context with default merge settings.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MergeConfig::default())
    }

    /// Creates a context with the given merge settings.
    #[must_use]
    pub fn with_config(config: MergeConfig) -> Self {
        Self {
            storage: Arc::new(TracingMemoryBackend::new()),
            config,
        }
    }

    /// Builds an engine over this context's storage.
    pub fn engine(&self) -> MergeEngine {
        MergeEngine::new(
            Arc::clone(&self.storage) as Arc<dyn StorageBackend>,
            self.config.clone(),
        )
        .expect("valid config")
    }

    /// Returns the key a fragment for `upload_id` is stored under.
    pub fn fragment_key(&self, upload_id: &str) -> String {
        self.config.paths().fragment_key(upload_id)
    }

    /// Writes raw bytes to a key.
    pub async fn put_raw(&self, key: &str, data: Bytes) {
        self.storage
            .put(key, data, WritePrecondition::None)
            .await
            .expect("put");
    }

    /// Writes a fragment holding `entries` and returns its key.
    pub async fn put_fragment(&self, upload_id: &str, entries: &[CatalogEntry]) -> String {
        let key = self.fragment_key(upload_id);
        self.put_raw(&key, fragment_bytes(entries)).await;
        key
    }

    /// Writes the canonical snapshot directly.
    pub async fn put_snapshot(&self, entries: &[CatalogEntry]) {
        let key = self.config.snapshot_key.clone();
        self.put_raw(&key, snapshot_bytes(entries)).await;
    }

    /// Returns the canonical snapshot bytes, if present.
    pub fn snapshot_raw(&self) -> Option<Bytes> {
        self.storage.object(&self.config.snapshot_key)
    }

    /// Decodes the canonical snapshot.
    pub fn snapshot_file(&self) -> DecodedFile {
        read_parquet(&self.snapshot_raw().expect("snapshot exists")).expect("decode snapshot")
    }

    /// Reads the canonical snapshot back as entries, in file order.
    pub fn snapshot_entries(&self) -> Vec<CatalogEntry> {
        batch_to_entries(&single_batch(&self.snapshot_file())).expect("snapshot entries")
    }

    /// Returns the ids in the canonical snapshot, in file order.
    pub fn snapshot_ids(&self) -> Vec<String> {
        self.snapshot_entries().into_iter().map(|e| e.id).collect()
    }

    /// Returns the keys still under the pending prefix.
    pub fn pending_keys(&self) -> Vec<String> {
        self.storage.paths_under(&self.config.pending_prefix)
    }

    /// Returns the keys under the staging prefix.
    pub fn staging_keys(&self) -> Vec<String> {
        self.storage.paths_under(&self.config.staging_prefix)
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}
