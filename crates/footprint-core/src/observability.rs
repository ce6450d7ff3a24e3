//! Logging setup and the span that frames a merge run.
//!
//! Binaries install the subscriber once with [`init_logging`]; libraries only
//! emit `tracing` events. `RUST_LOG` overrides the default `info` level.

use std::str::FromStr;
use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static SUBSCRIBER: Once = Once::new();

/// Log line layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// Human-readable multi-line output.
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            _ => Err(format!("unknown log format '{s}', expected json or pretty")),
        }
    }
}

/// Installs the global subscriber. Later calls do nothing.
pub fn init_logging(format: LogFormat) {
    SUBSCRIBER.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(filter);
        match format {
            LogFormat::Json => registry.with(fmt::layer().json()).init(),
            LogFormat::Pretty => registry.with(fmt::layer().pretty()).init(),
        }
    });
}

/// Span entered for the duration of one merge run.
///
/// ```rust
/// use footprint_core::observability::merge_span;
///
/// let span = merge_span("01J0000000000000000000000", "catalog.parquet");
/// let _entered = span.enter();
/// ```
#[must_use]
pub fn merge_span(run_id: &str, snapshot_key: &str) -> Span {
    tracing::info_span!("merge", run_id, snapshot = snapshot_key)
}
