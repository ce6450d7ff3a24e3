//! A recording, fault-injecting wrapper over [`MemoryBackend`].
//!
//! Merge tests use it to assert which storage calls a run made and to stage
//! failures: failing calls by key prefix, a rival writer racing a read, or a
//! fragment disappearing between list and get.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use footprint_core::error::{Error, Result};
use footprint_core::storage::{
    MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
};

/// One call made against the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOp {
    /// `get`
    Get {
        /// Key read.
        path: String,
    },
    /// `head`
    Head {
        /// Key inspected.
        path: String,
    },
    /// `put`
    Put {
        /// Key written.
        path: String,
        /// Payload length.
        size: usize,
        /// Condition attached to the write.
        precondition: WritePrecondition,
    },
    /// `delete`
    Delete {
        /// Key removed.
        path: String,
    },
    /// `delete_batch`
    DeleteBatch {
        /// Keys in the request, in request order.
        paths: Vec<String>,
    },
    /// `list`
    List {
        /// Prefix listed.
        prefix: String,
    },
    /// `rename`
    Rename {
        /// Staged key.
        from: String,
        /// Destination key.
        to: String,
    },
}

impl StorageOp {
    /// Kind of call this entry records.
    #[must_use]
    pub fn kind(&self) -> OpKind {
        match self {
            Self::Get { .. } => OpKind::Get,
            Self::Head { .. } => OpKind::Head,
            Self::Put { .. } => OpKind::Put,
            Self::Delete { .. } => OpKind::Delete,
            Self::DeleteBatch { .. } => OpKind::DeleteBatch,
            Self::List { .. } => OpKind::List,
            Self::Rename { .. } => OpKind::Rename,
        }
    }

    fn touches(&self, key: &str) -> bool {
        match self {
            Self::Put { path, .. } | Self::Delete { path } => path == key,
            Self::DeleteBatch { paths } => paths.iter().any(|p| p == key),
            Self::Rename { from, to } => from == key || to == key,
            Self::Get { .. } | Self::Head { .. } | Self::List { .. } => false,
        }
    }
}

/// Call kinds a fault can be restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// `get`
    Get,
    /// `head`
    Head,
    /// `put`
    Put,
    /// `delete`
    Delete,
    /// `delete_batch`
    DeleteBatch,
    /// `list`
    List,
    /// `rename`
    Rename,
}

#[derive(Debug)]
struct Fault {
    prefix: String,
    only: Option<OpKind>,
}

#[derive(Debug)]
struct RivalWrite {
    after_reading: String,
    key: String,
    bytes: Bytes,
}

#[derive(Debug, Default)]
struct FaultPlan {
    faults: Vec<Fault>,
    rival: Option<RivalWrite>,
    vanishing: Vec<String>,
    delays: Vec<(OpKind, Duration)>,
}

/// [`MemoryBackend`] that logs every call and can be told to misbehave.
///
/// Clones share the same objects, log and faults.
#[derive(Debug, Clone, Default)]
pub struct TracingMemoryBackend {
    inner: Arc<MemoryBackend>,
    log: Arc<Mutex<Vec<StorageOp>>>,
    plan: Arc<Mutex<FaultPlan>>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl TracingMemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls made so far, oldest first.
    #[must_use]
    pub fn operations(&self) -> Vec<StorageOp> {
        guard(&self.log).clone()
    }

    /// Key lists of the `delete_batch` calls made so far.
    #[must_use]
    pub fn delete_batches(&self) -> Vec<Vec<String>> {
        guard(&self.log)
            .iter()
            .filter_map(|op| match op {
                StorageOp::DeleteBatch { paths } => Some(paths.clone()),
                _ => None,
            })
            .collect()
    }

    /// Whether any logged write, delete or rename involved `key`.
    #[must_use]
    pub fn was_modified(&self, key: &str) -> bool {
        guard(&self.log).iter().any(|op| op.touches(key))
    }

    /// Forgets the calls logged so far.
    pub fn clear_operations(&self) {
        guard(&self.log).clear();
    }

    /// Fails every call on keys under `prefix`.
    pub fn inject_failure(&self, prefix: impl Into<String>) {
        self.add_fault(prefix.into(), None);
    }

    /// Fails calls of kind `op` on keys under `prefix`.
    pub fn inject_op_failure(&self, op: OpKind, prefix: impl Into<String>) {
        self.add_fault(prefix.into(), Some(op));
    }

    /// Removes every injected failure.
    pub fn clear_failures(&self) {
        guard(&self.plan).faults.clear();
    }

    /// Once `trigger` has been read, a rival writer overwrites `key` with
    /// `bytes`. Fires a single time.
    pub fn race_after_read(&self, trigger: impl Into<String>, key: impl Into<String>, bytes: Bytes) {
        guard(&self.plan).rival = Some(RivalWrite {
            after_reading: trigger.into(),
            key: key.into(),
            bytes,
        });
    }

    /// Deletes `key` as soon as a listing has returned it.
    pub fn vanish_after_list(&self, key: impl Into<String>) {
        guard(&self.plan).vanishing.push(key.into());
    }

    /// Makes every call of kind `op` sleep for `delay` before running.
    pub fn delay_op(&self, op: OpKind, delay: Duration) {
        guard(&self.plan).delays.push((op, delay));
    }

    /// Current version of `key`.
    #[must_use]
    pub fn version(&self, key: &str) -> Option<String> {
        self.inner.version_of(key)
    }

    /// Current bytes of `key`.
    #[must_use]
    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.inner.contents(key)
    }

    /// Every stored key, sorted.
    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        self.inner.keys()
    }

    /// Stored keys under `prefix`, sorted.
    #[must_use]
    pub fn paths_under(&self, prefix: &str) -> Vec<String> {
        self.inner
            .keys()
            .into_iter()
            .filter(|key| key.starts_with(prefix))
            .collect()
    }

    fn add_fault(&self, prefix: String, only: Option<OpKind>) {
        guard(&self.plan).faults.push(Fault { prefix, only });
    }

    async fn stall(&self, kind: OpKind) {
        let delay = guard(&self.plan)
            .delays
            .iter()
            .filter(|(op, _)| *op == kind)
            .map(|(_, delay)| *delay)
            .max();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn log(&self, op: StorageOp) {
        guard(&self.log).push(op);
    }

    fn fault(&self, kind: OpKind, key: &str) -> Result<()> {
        let plan = guard(&self.plan);
        let tripped = plan
            .faults
            .iter()
            .any(|f| key.starts_with(&f.prefix) && f.only.is_none_or(|only| only == kind));
        if tripped {
            return Err(Error::storage(format!("injected {kind:?} failure on {key}")));
        }
        Ok(())
    }

    fn rival_write_after(&self, key: &str) {
        let rival = {
            let mut plan = guard(&self.plan);
            if plan.rival.as_ref().is_some_and(|r| r.after_reading == key) {
                plan.rival.take()
            } else {
                None
            }
        };
        if let Some(rival) = rival {
            self.inner.insert(&rival.key, rival.bytes);
        }
    }
}

#[async_trait::async_trait]
impl StorageBackend for TracingMemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        self.stall(OpKind::Get).await;
        self.fault(OpKind::Get, path)?;
        self.log(StorageOp::Get {
            path: path.to_owned(),
        });
        let bytes = self.inner.get(path).await?;
        self.rival_write_after(path);
        Ok(bytes)
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        self.stall(OpKind::Put).await;
        self.fault(OpKind::Put, path)?;
        self.log(StorageOp::Put {
            path: path.to_owned(),
            size: data.len(),
            precondition: precondition.clone(),
        });
        self.inner.put(path, data, precondition).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.stall(OpKind::Delete).await;
        self.fault(OpKind::Delete, path)?;
        self.log(StorageOp::Delete {
            path: path.to_owned(),
        });
        self.inner.delete(path).await
    }

    async fn delete_batch(&self, paths: &[String]) -> Result<()> {
        self.stall(OpKind::DeleteBatch).await;
        // A refused batch is still a request the caller made.
        self.log(StorageOp::DeleteBatch {
            paths: paths.to_vec(),
        });
        paths
            .iter()
            .try_for_each(|key| self.fault(OpKind::DeleteBatch, key))?;
        self.inner.delete_batch(paths).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        self.stall(OpKind::List).await;
        self.fault(OpKind::List, prefix)?;
        self.log(StorageOp::List {
            prefix: prefix.to_owned(),
        });
        let listed = self.inner.list(prefix).await?;

        let gone: Vec<String> = {
            let mut plan = guard(&self.plan);
            let (gone, kept): (Vec<String>, Vec<String>) = std::mem::take(&mut plan.vanishing)
                .into_iter()
                .partition(|key| listed.iter().any(|m| &m.path == key));
            plan.vanishing = kept;
            gone
        };
        for key in &gone {
            self.inner.remove(key);
        }
        Ok(listed)
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        self.stall(OpKind::Head).await;
        self.fault(OpKind::Head, path)?;
        self.log(StorageOp::Head {
            path: path.to_owned(),
        });
        self.inner.head(path).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.stall(OpKind::Rename).await;
        self.fault(OpKind::Rename, to)?;
        self.log(StorageOp::Rename {
            from: from.to_owned(),
            to: to.to_owned(),
        });
        self.inner.rename(from, to).await
    }
}
