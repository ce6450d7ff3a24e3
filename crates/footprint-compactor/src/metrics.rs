//! Prometheus exposition for the compactor.
//!
//! The merge engine records through the `metrics` facade; this module installs
//! the recorder behind it and adds the series only the service knows about.

use std::sync::OnceLock;

use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Cycles run by the binary, labelled by status (`noop`, `success`, `failed`).
pub const COMPACTION_CYCLES_TOTAL: &str = "footprint_compactor_cycles_total";

/// Cycles cut short by the run timeout.
pub const COMPACTION_TIMEOUTS_TOTAL: &str = "footprint_compactor_timeouts_total";

/// Age of the last successful cycle, in seconds.
pub const COMPACTION_LAG: &str = "footprint_compactor_lag_seconds";

static RECORDER: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the Prometheus recorder on first call and returns its handle.
///
/// # Panics
///
/// Panics when another global recorder is already installed.
#[allow(clippy::panic)]
pub fn init_metrics() -> PrometheusHandle {
    RECORDER
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .unwrap_or_else(|e| panic!("cannot install prometheus recorder: {e}"));

            describe_counter!(COMPACTION_CYCLES_TOTAL, "Compaction cycles by status");
            describe_counter!(COMPACTION_TIMEOUTS_TOTAL, "Compaction cycles that hit the timeout");
            describe_gauge!(COMPACTION_LAG, "Seconds since the last successful compaction");
            footprint_catalog::metrics::register_metrics();

            tracing::debug!("prometheus recorder installed");
            handle
        })
        .clone()
}

/// GET /metrics
pub async fn serve_metrics() -> impl IntoResponse {
    let content_type = [(header::CONTENT_TYPE, "text/plain; version=0.0.4")];
    match RECORDER.get() {
        Some(handle) => (StatusCode::OK, content_type, handle.render()),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            content_type,
            "metrics recorder not installed\n".to_owned(),
        ),
    }
}

/// Counts a finished cycle.
pub fn record_cycle(status: &'static str) {
    counter!(COMPACTION_CYCLES_TOTAL, "status" => status).increment(1);
}

/// Counts a cycle abandoned at the timeout.
pub fn record_timeout() {
    counter!(COMPACTION_TIMEOUTS_TOTAL).increment(1);
}

/// Publishes the age of the last successful cycle.
pub fn set_compaction_lag(seconds: f64) {
    gauge!(COMPACTION_LAG).set(seconds);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn metrics_endpoint_without_recorder_is_unavailable() {
        if RECORDER.get().is_none() {
            let response = serve_metrics().await.into_response();
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        }
    }
}
