//! Service mode: periodic merges behind HTTP health endpoints.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use footprint_catalog::CompactionStatus;

use crate::Compactor;
use crate::metrics;

/// How often the lag gauge is refreshed.
const LAG_REFRESH: Duration = Duration::from_secs(30);

/// Outcome history of the service's merge cycles.
#[derive(Debug, Default)]
struct HealthRecord {
    started_loop: bool,
    last_good_run: Option<DateTime<Utc>>,
    good_runs: u64,
    failed_runs: u64,
    last_status: Option<CompactionStatus>,
}

/// State shared by the merge loop and the HTTP handlers.
#[derive(Debug)]
pub struct ServiceState {
    runner: Compactor,
    /// Held for the whole of a cycle; cycles never overlap.
    cycle: Mutex<()>,
    /// Cycles queued or running.
    cycles_in_flight: AtomicUsize,
    record: Mutex<HealthRecord>,
    stale_after: chrono::Duration,
    booted_at: DateTime<Utc>,
}

/// Body of `GET /ready`.
#[derive(Debug, Serialize)]
struct Readiness {
    ready: bool,
    healthy: bool,
    busy: bool,
    good_runs: u64,
    failed_runs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_good_run: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_status: Option<CompactionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

impl ServiceState {
    /// Creates the state; the service reports unhealthy once no cycle has
    /// succeeded for `unhealthy_after`.
    pub fn new(runner: Compactor, unhealthy_after: Duration) -> Self {
        let stale_after =
            chrono::Duration::from_std(unhealthy_after).unwrap_or(chrono::Duration::MAX);
        Self {
            runner,
            cycle: Mutex::new(()),
            cycles_in_flight: AtomicUsize::new(0),
            record: Mutex::new(HealthRecord::default()),
            stale_after,
            booted_at: Utc::now(),
        }
    }

    /// Runs one merge cycle, waiting for any cycle already running.
    pub async fn run_cycle(&self) -> CompactionStatus {
        self.cycles_in_flight.fetch_add(1, Ordering::AcqRel);
        self.run_claimed_cycle().await
    }

    /// Claims a cycle only when none is queued or running.
    fn try_claim_cycle(&self) -> bool {
        self.cycles_in_flight
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_busy(&self) -> bool {
        self.cycles_in_flight.load(Ordering::Acquire) > 0
    }

    /// Runs a cycle already counted in `cycles_in_flight` and releases it.
    async fn run_claimed_cycle(&self) -> CompactionStatus {
        let _cycle = self.cycle.lock().await;

        let status = self.runner.run_once().await;
        {
            let mut record = self.record.lock().await;
            if status.is_failure() {
                record.failed_runs += 1;
            } else {
                record.good_runs += 1;
                record.last_good_run = Some(Utc::now());
            }
            record.last_status = Some(status.clone());
        }
        match &status {
            CompactionStatus::Failed { kind, message, .. } => {
                tracing::error!(kind = %kind, error = %message, "merge cycle failed");
            }
            other => tracing::info!(status = other.label(), "merge cycle finished"),
        }

        self.cycles_in_flight.fetch_sub(1, Ordering::AcqRel);
        status
    }

    async fn readiness(&self) -> Readiness {
        let record = self.record.lock().await;
        let now = Utc::now();
        let fresh = record
            .last_good_run
            .is_some_and(|at| now.signed_duration_since(at) < self.stale_after);

        let reason = if !record.started_loop {
            Some("merge loop not started".to_string())
        } else if record.good_runs == 0 {
            Some("no merge has completed yet".to_string())
        } else if !fresh {
            Some(format!(
                "no successful merge in the last {}s",
                self.stale_after.num_seconds()
            ))
        } else {
            None
        };

        Readiness {
            ready: record.started_loop,
            healthy: reason.is_none(),
            busy: self.is_busy(),
            good_runs: record.good_runs,
            failed_runs: record.failed_runs,
            last_good_run: record.last_good_run.map(|at| at.to_rfc3339()),
            last_status: record.last_status.clone(),
            reason,
        }
    }

    async fn lag_seconds(&self) -> f64 {
        let since = self.record.lock().await.last_good_run.unwrap_or(self.booted_at);
        let millis = Utc::now().signed_duration_since(since).num_milliseconds().max(0);
        #[allow(clippy::cast_precision_loss)]
        let millis = millis as f64;
        millis / 1000.0
    }
}

/// GET /health: process is up.
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /ready: 200 while merges keep succeeding, 503 otherwise.
async fn ready(State(state): State<Arc<ServiceState>>) -> impl IntoResponse {
    let readiness = state.readiness().await;
    let code = if readiness.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(readiness))
}

/// POST /compact: start a cycle now.
///
/// Returns `202 Accepted` when a cycle was started and `409 Conflict` when
/// one is already queued or running.
async fn compact(State(state): State<Arc<ServiceState>>) -> impl IntoResponse {
    if !state.try_claim_cycle() {
        return (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "status": "busy", "message": "a merge is already running" })),
        );
    }

    let state = Arc::clone(&state);
    tokio::spawn(async move {
        state.run_claimed_cycle().await;
    });
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "started" })),
    )
}

/// Builds the HTTP router.
pub fn router(state: Arc<ServiceState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics::serve_metrics))
        .route("/compact", post(compact))
        .with_state(state)
}

/// Merges immediately, then once per `every`.
async fn merge_loop(state: Arc<ServiceState>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    state.record.lock().await.started_loop = true;
    tracing::info!(interval_secs = every.as_secs(), "merge loop started");

    loop {
        ticker.tick().await;
        state.run_cycle().await;
    }
}

async fn lag_loop(state: Arc<ServiceState>) {
    loop {
        metrics::set_compaction_lag(state.lag_seconds().await);
        tokio::time::sleep(LAG_REFRESH).await;
    }
}

/// Runs the service until the listener fails.
///
/// # Errors
///
/// Returns an error if the port cannot be bound or the server stops.
pub async fn serve(state: Arc<ServiceState>, port: u16, every: Duration) -> Result<()> {
    tokio::spawn(merge_loop(Arc::clone(&state), every));
    tokio::spawn(lag_loop(Arc::clone(&state)));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(address = %addr, "listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
