//! Object storage contract for the catalog, with in-memory and
//! `object_store` implementations.
//!
//! Beyond plain reads and writes the catalog relies on conditional puts,
//! batched deletes and a server-side rename that promotes a staged snapshot.
//!
//! Version tokens are opaque strings. [`ObjectStoreBackend`] uses the object
//! `ETag`, falling back to the store's version id when no `ETag` is reported;
//! [`MemoryBackend`] counts writes per key.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use object_store::aws::{AmazonS3Builder, S3ConditionalPut};
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload, UpdateVersion};

use crate::error::{Error, Result};

/// Condition a `put` must satisfy before it replaces anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePrecondition {
    /// The key must be absent.
    DoesNotExist,
    /// The key must currently hold this version, as reported by `head`,
    /// `list` or a previous `put`.
    MatchesVersion(String),
    /// No condition.
    None,
}

/// Outcome of a `put`.
#[derive(Debug, Clone)]
pub enum WriteResult {
    /// The object was written.
    Success {
        /// Version of the object just written.
        version: String,
    },
    /// The precondition did not hold; nothing was written.
    PreconditionFailed {
        /// Version found at the key, `"0"` when absent.
        current_version: String,
    },
}

/// Listing and `head` entry.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Full key.
    pub path: String,
    /// Length in bytes.
    pub size: u64,
    /// Opaque version token.
    pub version: String,
    /// When the store last wrote the object, if known.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Object storage as the catalog sees it.
///
/// Whole-object writes are atomic and there are no multi-key transactions.
/// A listing returns everything present when it was issued, in no
/// particular order.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Reads an object; `Error::NotFound` when the key is absent.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Writes an object if `precondition` holds.
    ///
    /// A failed precondition is reported as
    /// [`WriteResult::PreconditionFailed`], not as an error.
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>;

    /// Removes an object. Removing an absent key succeeds.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Removes several objects with one request.
    ///
    /// Callers keep each request within the store's limit (1000 keys on S3).
    /// Absent keys are ignored.
    async fn delete_batch(&self, paths: &[String]) -> Result<()>;

    /// Lists every object whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Reads metadata only; `None` when the key is absent.
    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>>;

    /// Moves `from` over `to`.
    ///
    /// Readers of `to` see the old object or the whole new one.
    /// `Error::NotFound` when `from` is absent.
    async fn rename(&self, from: &str, to: &str) -> Result<()>;
}

/// Storage held in process memory.
///
/// Each key carries a write counter as its version, starting at 1.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: RwLock<BTreeMap<String, Slot>>,
}

#[derive(Debug, Clone)]
struct Slot {
    bytes: Bytes,
    generation: u64,
    written_at: DateTime<Utc>,
}

impl Slot {
    fn meta(&self, key: &str) -> ObjectMeta {
        ObjectMeta {
            path: key.to_owned(),
            size: self.bytes.len() as u64,
            version: self.generation.to_string(),
            last_modified: Some(self.written_at),
        }
    }
}

/// Version blocking a write under `precondition`, if any.
fn blocking_version(slot: Option<&Slot>, precondition: &WritePrecondition) -> Option<String> {
    let current = slot.map(|s| s.generation.to_string());
    match precondition {
        WritePrecondition::None => None,
        WritePrecondition::DoesNotExist => current,
        WritePrecondition::MatchesVersion(expected) => {
            if current.as_deref() == Some(expected.as_str()) {
                None
            } else {
                Some(current.unwrap_or_else(|| "0".to_owned()))
            }
        }
    }
}

fn store_slot(objects: &mut BTreeMap<String, Slot>, key: &str, bytes: Bytes) -> u64 {
    let generation = objects.get(key).map_or(0, |s| s.generation) + 1;
    objects.insert(
        key.to_owned(),
        Slot {
            bytes,
            generation,
            written_at: Utc::now(),
        },
    );
    generation
}

impl MemoryBackend {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> RwLockReadGuard<'_, BTreeMap<String, Slot>> {
        self.objects.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn objects_mut(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Slot>> {
        self.objects.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bytes stored at `key`.
    #[must_use]
    pub fn contents(&self, key: &str) -> Option<Bytes> {
        self.objects().get(key).map(|s| s.bytes.clone())
    }

    /// Version stored at `key`.
    #[must_use]
    pub fn version_of(&self, key: &str) -> Option<String> {
        self.objects().get(key).map(|s| s.generation.to_string())
    }

    /// Every stored key, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.objects().keys().cloned().collect()
    }

    /// Writes `bytes` to `key` unconditionally and returns the new version.
    pub fn insert(&self, key: &str, bytes: Bytes) -> String {
        store_slot(&mut self.objects_mut(), key, bytes).to_string()
    }

    /// Drops `key`; returns whether it was present.
    pub fn remove(&self, key: &str) -> bool {
        self.objects_mut().remove(key).is_some()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        self.contents(path)
            .ok_or_else(|| Error::NotFound(format!("no object at {path}")))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let mut objects = self.objects_mut();
        if let Some(current_version) = blocking_version(objects.get(path), &precondition) {
            return Ok(WriteResult::PreconditionFailed { current_version });
        }
        let generation = store_slot(&mut objects, path, data);
        Ok(WriteResult::Success {
            version: generation.to_string(),
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.remove(path);
        Ok(())
    }

    async fn delete_batch(&self, paths: &[String]) -> Result<()> {
        let mut objects = self.objects_mut();
        paths.iter().for_each(|p| {
            objects.remove(p);
        });
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let objects = self.objects();
        let listed = objects
            .range(prefix.to_owned()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, slot)| slot.meta(key))
            .collect();
        Ok(listed)
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        Ok(self.objects().get(path).map(|slot| slot.meta(path)))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut objects = self.objects_mut();
        let Some(staged) = objects.remove(from) else {
            return Err(Error::NotFound(format!("no object at {from}")));
        };
        store_slot(&mut objects, to, staged.bytes);
        Ok(())
    }
}

/// Storage backend over any [`object_store::ObjectStore`].
///
/// Construct it from a bucket URL with [`ObjectStoreBackend::from_bucket`]:
/// `s3://bucket`, `gs://bucket`, `file:///abs/path`, or `memory://`.
/// Cloud credentials come from the standard environment variables read by
/// `object_store`'s `from_env` builders.
#[derive(Debug, Clone)]
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreBackend {
    /// Wraps an existing object store.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Builds a backend from a bucket URL.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` for unsupported schemes or malformed URLs,
    /// and `Error::Storage` if the underlying client cannot be built.
    pub fn from_bucket(url: &str) -> Result<Self> {
        let url = url.trim();
        let (scheme, rest) = url.split_once("://").unwrap_or(("file", url));

        let store: Arc<dyn ObjectStore> = match scheme {
            "memory" => Arc::new(InMemory::new()),
            "file" => {
                let root = PathBuf::from(rest);
                std::fs::create_dir_all(&root).map_err(|e| {
                    Error::storage_with_source(
                        format!("failed to create storage root {}", root.display()),
                        e,
                    )
                })?;
                let fs = LocalFileSystem::new_with_prefix(&root).map_err(|e| {
                    Error::storage_with_source("failed to open local storage", e)
                })?;
                Arc::new(fs)
            }
            "s3" => {
                let bucket = bucket_name(url, rest)?;
                let s3 = s3_builder(bucket)
                    .build()
                    .map_err(|e| Error::storage_with_source("failed to build S3 client", e))?;
                Arc::new(s3)
            }
            "gs" => {
                let bucket = bucket_name(url, rest)?;
                let gcs = GoogleCloudStorageBuilder::from_env()
                    .with_bucket_name(bucket)
                    .build()
                    .map_err(|e| Error::storage_with_source("failed to build GCS client", e))?;
                Arc::new(gcs)
            }
            other => {
                return Err(Error::InvalidInput(format!(
                    "unsupported storage scheme '{other}' in {url} (expected s3, gs, file, memory)"
                )));
            }
        };

        Ok(Self { store })
    }
}

/// S3 client settings. Conditional puts need an explicit mode on S3; without
/// it `PutMode::Create` and `PutMode::Update` are rejected client-side.
fn s3_builder(bucket: &str) -> AmazonS3Builder {
    AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_conditional_put(S3ConditionalPut::ETagMatch)
}

fn bucket_name<'a>(url: &str, rest: &'a str) -> Result<&'a str> {
    let bucket = rest.trim_end_matches('/');
    if bucket.is_empty() || bucket.contains('/') {
        return Err(Error::InvalidInput(format!(
            "expected a bare bucket name in {url}"
        )));
    }
    Ok(bucket)
}

fn map_store_error(op: &str, path: &str, err: object_store::Error) -> Error {
    match err {
        object_store::Error::NotFound { .. } => {
            Error::NotFound(format!("object not found: {path}"))
        }
        other => Error::storage_with_source(format!("{op} failed for {path}"), other),
    }
}

fn to_meta(meta: &object_store::ObjectMeta) -> ObjectMeta {
    // `put` guards updates with an ETag, so the ETag is the version token.
    let version = meta
        .e_tag
        .clone()
        .or_else(|| meta.version.clone())
        .unwrap_or_else(|| meta.last_modified.timestamp_nanos_opt().unwrap_or_default().to_string());
    ObjectMeta {
        path: meta.location.to_string(),
        size: u64::try_from(meta.size).unwrap_or(u64::MAX),
        version,
        last_modified: Some(meta.last_modified),
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let location = ObjectPath::from(path);
        let result = self
            .store
            .get(&location)
            .await
            .map_err(|e| map_store_error("get", path, e))?;
        result
            .bytes()
            .await
            .map_err(|e| map_store_error("get", path, e))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let location = ObjectPath::from(path);
        let mode = match precondition {
            WritePrecondition::DoesNotExist => PutMode::Create,
            WritePrecondition::MatchesVersion(version) => PutMode::Update(UpdateVersion {
                e_tag: Some(version),
                version: None,
            }),
            WritePrecondition::None => PutMode::Overwrite,
        };
        let opts = PutOptions {
            mode,
            ..PutOptions::default()
        };

        match self
            .store
            .put_opts(&location, PutPayload::from(data), opts)
            .await
        {
            Ok(result) => Ok(WriteResult::Success {
                version: result.e_tag.or(result.version).unwrap_or_default(),
            }),
            Err(
                object_store::Error::AlreadyExists { .. }
                | object_store::Error::Precondition { .. },
            ) => {
                let current_version = self
                    .head(path)
                    .await?
                    .map_or_else(|| "0".to_string(), |m| m.version);
                Ok(WriteResult::PreconditionFailed { current_version })
            }
            Err(e) => Err(map_store_error("put", path, e)),
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        match self.store.delete(&ObjectPath::from(path)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(map_store_error("delete", path, e)),
        }
    }

    async fn delete_batch(&self, paths: &[String]) -> Result<()> {
        let locations = futures::stream::iter(
            paths
                .iter()
                .map(|p| Ok::<_, object_store::Error>(ObjectPath::from(p.as_str())))
                .collect::<Vec<_>>(),
        )
        .boxed();

        let mut results = self.store.delete_stream(locations);
        let mut failures = Vec::new();
        while let Some(result) = results.next().await {
            match result {
                Ok(_) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => failures.push(e.to_string()),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::storage(format!(
                "batch delete failed for {} of {} objects: {}",
                failures.len(),
                paths.len(),
                failures.join("; ")
            )))
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let location = ObjectPath::from(prefix);
        let metas: Vec<object_store::ObjectMeta> = self
            .store
            .list(Some(&location))
            .try_collect()
            .await
            .map_err(|e| map_store_error("list", prefix, e))?;
        Ok(metas.iter().map(to_meta).collect())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        match self.store.head(&ObjectPath::from(path)).await {
            Ok(meta) => Ok(Some(to_meta(&meta))),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(map_store_error("head", path, e)),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.store
            .rename(&ObjectPath::from(from), &ObjectPath::from(to))
            .await
            .map_err(|e| map_store_error("rename", from, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed(backend: &impl StorageBackend, key: &str, body: &'static str) -> String {
        match backend
            .put(key, Bytes::from(body), WritePrecondition::None)
            .await
            .expect("put")
        {
            WriteResult::Success { version } => version,
            other => panic!("unconditional put refused: {other:?}"),
        }
    }

    #[tokio::test]
    async fn memory_versions_count_writes_per_key() {
        let backend = MemoryBackend::new();
        assert_eq!(seed(&backend, "catalog.parquet", "one").await, "1");
        assert_eq!(seed(&backend, "catalog.parquet", "two").await, "2");
        assert_eq!(seed(&backend, "other", "x").await, "1");

        assert_eq!(backend.get("catalog.parquet").await.expect("get"), Bytes::from("two"));
        let meta = backend.head("catalog.parquet").await.expect("head").expect("present");
        assert_eq!(meta.size, 3);
        assert!(meta.last_modified.is_some());
    }

    #[tokio::test]
    async fn absent_key_reads_as_not_found() {
        let backend = MemoryBackend::new();
        assert!(backend.get("missing.parquet").await.expect_err("absent").is_not_found());
        assert!(backend.head("missing.parquet").await.expect("head").is_none());
        backend.delete("missing.parquet").await.expect("delete is idempotent");
    }

    #[tokio::test]
    async fn create_only_put_refuses_existing_key() {
        let backend = MemoryBackend::new();
        let first = backend
            .put("k", Bytes::from("a"), WritePrecondition::DoesNotExist)
            .await
            .expect("put");
        assert!(matches!(first, WriteResult::Success { .. }));

        let second = backend
            .put("k", Bytes::from("b"), WritePrecondition::DoesNotExist)
            .await
            .expect("put");
        assert!(
            matches!(second, WriteResult::PreconditionFailed { ref current_version } if current_version == "1")
        );
        assert_eq!(backend.contents("k"), Some(Bytes::from("a")));
    }

    #[tokio::test]
    async fn version_guarded_put_detects_interleaved_write() {
        let backend = MemoryBackend::new();
        let seen = seed(&backend, "snap", "base").await;
        seed(&backend, "snap", "rival").await;

        let result = backend
            .put("snap", Bytes::from("mine"), WritePrecondition::MatchesVersion(seen))
            .await
            .expect("put");
        assert!(matches!(result, WriteResult::PreconditionFailed { .. }));
        assert_eq!(backend.contents("snap"), Some(Bytes::from("rival")));

        let absent = backend
            .put("new", Bytes::from("x"), WritePrecondition::MatchesVersion("1".into()))
            .await
            .expect("put");
        assert!(
            matches!(absent, WriteResult::PreconditionFailed { ref current_version } if current_version == "0")
        );
    }

    #[tokio::test]
    async fn listing_is_scoped_to_prefix() {
        let backend = MemoryBackend::new();
        for key in ["pending/a", "pending/b", "pendingx", "staging/a"] {
            seed(&backend, key, "x").await;
        }

        let listed: Vec<String> = backend
            .list("pending/")
            .await
            .expect("list")
            .into_iter()
            .map(|m| m.path)
            .collect();
        assert_eq!(listed, vec!["pending/a", "pending/b"]);
        assert_eq!(backend.list("").await.expect("list").len(), 4);
    }

    #[tokio::test]
    async fn batch_delete_skips_absent_keys() {
        let backend = MemoryBackend::new();
        seed(&backend, "p/1", "1").await;
        seed(&backend, "p/2", "2").await;

        backend
            .delete_batch(&["p/1".into(), "p/2".into(), "p/3".into()])
            .await
            .expect("batch delete");
        assert!(backend.keys().is_empty());
    }

    #[tokio::test]
    async fn rename_promotes_staged_object() {
        let backend = MemoryBackend::new();
        seed(&backend, "final", "old").await;
        seed(&backend, "staged", "new").await;

        backend.rename("staged", "final").await.expect("rename");

        assert_eq!(backend.contents("final"), Some(Bytes::from("new")));
        assert_eq!(backend.version_of("final").as_deref(), Some("2"));
        assert_eq!(backend.keys(), vec!["final"]);
        assert!(backend.rename("staged", "final").await.expect_err("gone").is_not_found());
    }

    #[tokio::test]
    async fn object_store_backend_honours_contract() {
        let backend = ObjectStoreBackend::from_bucket("memory://").expect("backend");
        seed(&backend, "catalog/pending/a.parquet", "a").await;

        let refused = backend
            .put(
                "catalog/pending/a.parquet",
                Bytes::from("b"),
                WritePrecondition::DoesNotExist,
            )
            .await
            .expect("put");
        assert!(matches!(refused, WriteResult::PreconditionFailed { .. }));

        let listed = backend.list("catalog/pending/").await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].path, "catalog/pending/a.parquet");

        backend
            .rename("catalog/pending/a.parquet", "catalog.parquet")
            .await
            .expect("rename");
        assert_eq!(backend.get("catalog.parquet").await.expect("get"), Bytes::from("a"));

        backend
            .delete_batch(&["catalog.parquet".to_owned()])
            .await
            .expect("delete");
        assert!(backend.head("catalog.parquet").await.expect("head").is_none());
    }

    #[tokio::test]
    async fn object_store_versions_guard_updates() {
        let backend = ObjectStoreBackend::from_bucket("memory://").expect("backend");
        seed(&backend, "catalog.parquet", "one").await;
        let seen = backend
            .head("catalog.parquet")
            .await
            .expect("head")
            .expect("present")
            .version;

        let updated = backend
            .put(
                "catalog.parquet",
                Bytes::from("two"),
                WritePrecondition::MatchesVersion(seen.clone()),
            )
            .await
            .expect("put");
        assert!(matches!(updated, WriteResult::Success { .. }));

        let stale = backend
            .put(
                "catalog.parquet",
                Bytes::from("three"),
                WritePrecondition::MatchesVersion(seen),
            )
            .await
            .expect("put");
        assert!(matches!(stale, WriteResult::PreconditionFailed { .. }));
    }

    #[test]
    fn s3_client_enables_conditional_puts() {
        use object_store::aws::AmazonS3ConfigKey;

        let builder = s3_builder("imagery");
        assert_eq!(
            builder.get_config_value(&AmazonS3ConfigKey::ConditionalPut),
            Some("etag".to_owned())
        );
    }

    #[test]
    fn bucket_urls_are_validated() {
        for bad in ["ftp://bucket", "s3://bucket/some/prefix", "gs://"] {
            let err = ObjectStoreBackend::from_bucket(bad).expect_err(bad);
            assert!(matches!(err, Error::InvalidInput(_)), "{bad}: {err:?}");
        }
    }
}
