//! Merges pending footprint fragments into the catalog snapshot.
//!
//! `compact` performs one merge, prints its status as JSON and exits non-zero
//! on failure; it suits cron jobs and queue workers. `serve` merges on an
//! interval and exposes:
//!
//! - `GET /health`: liveness, always 200
//! - `GET /ready`: 200 while merges keep succeeding, 503 otherwise
//! - `GET /metrics`: Prometheus text format
//! - `POST /compact`: start a merge now
//!
//! ```bash
//! footprint-compactor --bucket s3://imagery compact
//! footprint-compactor --bucket gs://imagery serve --port 8081 --interval-secs 300
//! ```

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

mod metrics;
mod service;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use footprint_catalog::{
    CompactionStatus, FailureKind, FragmentFailurePolicy, MergeConfig, MergeEngine,
    SnapshotCompression, SpatialOrdering,
};
use footprint_core::catalog_paths::{
    DEFAULT_PENDING_PREFIX, DEFAULT_SNAPSHOT_KEY, DEFAULT_STAGING_PREFIX,
};
use footprint_core::{LogFormat, ObjectStoreBackend, StorageBackend, init_logging};

use crate::service::ServiceState;

// ============================================================================
// CLI Arguments
// ============================================================================

/// Footprint catalog compactor.
#[derive(Debug, Parser)]
#[command(name = "footprint-compactor")]
#[command(about = "Merges pending catalog fragments into the GeoParquet snapshot")]
#[command(version)]
struct Args {
    /// Storage location (`s3://bucket`, `gs://bucket`, `file:///path`, `memory://`).
    #[arg(long, env = "FOOTPRINT_STORAGE_BUCKET", global = true)]
    bucket: Option<String>,

    /// Key of the canonical snapshot.
    #[arg(long, env = "FOOTPRINT_SNAPSHOT_KEY", global = true, default_value = DEFAULT_SNAPSHOT_KEY)]
    snapshot_key: String,

    /// Prefix holding pending fragments.
    #[arg(long, env = "FOOTPRINT_PENDING_PREFIX", global = true, default_value = DEFAULT_PENDING_PREFIX)]
    pending_prefix: String,

    /// Prefix for staged snapshots.
    #[arg(long, env = "FOOTPRINT_STAGING_PREFIX", global = true, default_value = DEFAULT_STAGING_PREFIX)]
    staging_prefix: String,

    /// Maximum rows per Parquet row group.
    #[arg(long, env = "FOOTPRINT_ROW_GROUP_SIZE", global = true, default_value_t = footprint_catalog::config::DEFAULT_ROW_GROUP_SIZE)]
    row_group_size: usize,

    /// Snapshot compression (`zstd`, `snappy`, `none`).
    #[arg(long, env = "FOOTPRINT_COMPRESSION", global = true, default_value = "zstd")]
    compression: SnapshotCompression,

    /// Maximum keys per delete request (at most 1000).
    #[arg(long, env = "FOOTPRINT_DELETE_BATCH_SIZE", global = true, default_value_t = footprint_catalog::config::DEFAULT_DELETE_BATCH_SIZE)]
    delete_batch_size: usize,

    /// Handling of unreadable fragments (`abort`, `skip`).
    #[arg(long, env = "FOOTPRINT_FRAGMENT_FAILURE_POLICY", global = true, default_value = "abort")]
    fragment_failure_policy: FragmentFailurePolicy,

    /// Row ordering (`hilbert`, `id_only`).
    #[arg(long, env = "FOOTPRINT_SPATIAL_ORDERING", global = true, default_value = "hilbert")]
    spatial_ordering: SpatialOrdering,

    /// Staged snapshots older than this are swept (seconds).
    #[arg(long, env = "FOOTPRINT_STAGING_MAX_AGE_SECS", global = true, default_value_t = footprint_catalog::config::DEFAULT_STAGING_MAX_AGE_SECS)]
    staging_max_age_secs: u64,

    /// Per-run timeout in seconds.
    #[arg(long, env = "FOOTPRINT_TIMEOUT_SECS", global = true, default_value = "900")]
    timeout_secs: u64,

    /// Log format (`json`, `pretty`).
    #[arg(long, env = "FOOTPRINT_LOG_FORMAT", global = true, default_value = "json")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a single merge and print its status as JSON.
    Compact,

    /// Merge on an interval and serve HTTP endpoints.
    Serve {
        /// Port for the HTTP endpoints.
        #[arg(long, env = "FOOTPRINT_COMPACTOR_PORT", default_value = "8081")]
        port: u16,

        /// Seconds between scheduled merges.
        #[arg(long, env = "FOOTPRINT_COMPACTOR_INTERVAL_SECS", default_value = "60")]
        interval_secs: u64,

        /// Seconds without a successful merge before `/ready` fails.
        #[arg(
            long,
            env = "FOOTPRINT_COMPACTOR_UNHEALTHY_THRESHOLD_SECS",
            default_value = "300"
        )]
        unhealthy_threshold_secs: u64,
    },
}

impl Args {
    fn merge_config(&self) -> MergeConfig {
        MergeConfig {
            snapshot_key: self.snapshot_key.clone(),
            pending_prefix: self.pending_prefix.clone(),
            staging_prefix: self.staging_prefix.clone(),
            row_group_size: self.row_group_size,
            compression: self.compression,
            delete_batch_size: self.delete_batch_size,
            fragment_failure_policy: self.fragment_failure_policy,
            spatial_ordering: self.spatial_ordering,
            staging_max_age_secs: self.staging_max_age_secs,
        }
    }

    fn storage(&self) -> Result<Arc<dyn StorageBackend>> {
        let bucket = self
            .bucket
            .as_deref()
            .context("missing FOOTPRINT_STORAGE_BUCKET (or --bucket)")?;
        let backend = ObjectStoreBackend::from_bucket(bucket)
            .with_context(|| format!("failed to open storage {bucket}"))?;
        Ok(Arc::new(backend))
    }
}

// ============================================================================
// Runner
// ============================================================================

/// One merge engine plus the per-run timeout.
#[derive(Debug, Clone)]
pub(crate) struct Compactor {
    engine: MergeEngine,
    timeout: Duration,
}

impl Compactor {
    fn new(storage: Arc<dyn StorageBackend>, config: MergeConfig, timeout: Duration) -> Result<Self> {
        let engine = MergeEngine::new(storage, config).context("invalid merge configuration")?;
        Ok(Self { engine, timeout })
    }

    /// Runs one merge and classifies the result.
    ///
    /// A timeout drops the run in flight and reports a retryable
    /// `timeout` failure: before commit nothing has changed, after commit the
    /// remaining fragments are re-merged next time.
    async fn run_once(&self) -> CompactionStatus {
        let status = match tokio::time::timeout(self.timeout, self.engine.run()).await {
            Ok(result) => CompactionStatus::from_result(&result),
            Err(_) => {
                metrics::record_timeout();
                CompactionStatus::failed(
                    FailureKind::Timeout,
                    format!("merge timed out after {:?}", self.timeout),
                )
            }
        };
        metrics::record_cycle(status.label());
        status
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_logging(args.log_format);

    let storage = args.storage()?;
    let timeout = Duration::from_secs(args.timeout_secs);
    let runner = Compactor::new(storage, args.merge_config(), timeout)?;

    match args.command {
        Commands::Compact => {
            tracing::info!(
                snapshot = %args.snapshot_key,
                pending_prefix = %args.pending_prefix,
                "running single merge"
            );

            let status = runner.run_once().await;
            println!("{}", serde_json::to_string(&status)?);
            if status.is_failure() {
                return Ok(ExitCode::FAILURE);
            }
        }

        Commands::Serve {
            port,
            interval_secs,
            unhealthy_threshold_secs,
        } => {
            metrics::init_metrics();

            tracing::info!(
                port,
                interval_secs,
                unhealthy_threshold_secs,
                snapshot = %args.snapshot_key,
                "starting merge service"
            );

            let every = Duration::from_secs(interval_secs.max(1));
            let state = Arc::new(ServiceState::new(
                runner,
                Duration::from_secs(unhealthy_threshold_secs),
            ));
            service::serve(state, port, every).await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use footprint_catalog::CatalogEntry;
    use footprint_core::MemoryBackend;
    use footprint_test_utils::{OpKind, TestContext};

    fn runner(config: MergeConfig) -> Compactor {
        Compactor::new(Arc::new(MemoryBackend::new()), config, Duration::from_secs(5))
            .expect("runner")
    }

    #[test]
    fn args_fill_merge_config() {
        let args = Args::try_parse_from([
            "footprint-compactor",
            "--bucket",
            "memory://",
            "--delete-batch-size",
            "500",
            "--fragment-failure-policy",
            "skip",
            "--spatial-ordering",
            "id-only",
            "compact",
        ])
        .expect("parse");

        let config = args.merge_config();
        assert_eq!(config.delete_batch_size, 500);
        assert_eq!(config.fragment_failure_policy, FragmentFailurePolicy::Skip);
        assert_eq!(config.spatial_ordering, SpatialOrdering::IdOnly);
        assert_eq!(config.snapshot_key, DEFAULT_SNAPSHOT_KEY);
        assert_eq!(config.compression, SnapshotCompression::Zstd);
        assert!(matches!(args.command, Commands::Compact));
    }

    #[test]
    fn missing_bucket_is_an_error() {
        let args = Args::try_parse_from(["footprint-compactor", "compact"]).expect("parse");
        if args.bucket.is_none() {
            assert!(args.storage().is_err());
        }
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = MergeConfig {
            delete_batch_size: 5000,
            ..MergeConfig::default()
        };
        assert!(
            Compactor::new(Arc::new(MemoryBackend::new()), config, Duration::from_secs(1)).is_err()
        );
    }

    #[tokio::test]
    async fn empty_bucket_reports_noop() {
        let status = runner(MergeConfig::default()).run_once().await;
        assert_eq!(status.label(), "noop");
    }

    #[tokio::test]
    async fn slow_storage_times_out_as_retryable() {
        let ctx = TestContext::new();
        let pending = ctx.put_fragment("u1", &[CatalogEntry::new("a")]).await;
        ctx.storage.delay_op(OpKind::Get, Duration::from_millis(200));

        let compactor =
            Compactor::new(ctx.storage.clone(), ctx.config.clone(), Duration::from_millis(50))
                .expect("runner");
        let status = compactor.run_once().await;

        match &status {
            CompactionStatus::Failed {
                kind,
                retryable,
                message,
            } => {
                assert_eq!(*kind, FailureKind::Timeout);
                assert!(*retryable);
                assert!(message.contains("50ms"), "{message}");
            }
            other => panic!("expected a timeout, got {other:?}"),
        }
        assert_eq!(ctx.pending_keys(), vec![pending]);
        assert!(ctx.snapshot_raw().is_none());
        assert!(ctx.staging_keys().is_empty());
    }
}
