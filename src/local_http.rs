//! Loopback-bound HTTP surface for ad-hoc process control: snooze, unsnooze,
//! and restart a monitored process by nickname.
//!
//! Grounded on `agent/src/main.rs`'s `Router::new().route(...)
//! .with_state(Arc<...>)` shape; responses are plain status codes per
//! spec.md §6 rather than the teacher's JSON envelopes, since the contract
//! here calls for bare 200/400/500.

use crate::supervisor::{parse_snooze_duration, ProcessSupervisor};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::error;

pub fn router(supervisor: Arc<ProcessSupervisor>) -> Router {
    Router::new()
        .route("/stop_monitoring/:process", get(stop_monitoring))
        .route("/start_monitoring/:process", get(start_monitoring))
        .route("/restart_process/:process", get(restart_process))
        .with_state(supervisor)
}

async fn stop_monitoring(
    State(supervisor): State<Arc<ProcessSupervisor>>,
    Path(process): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> StatusCode {
    if supervisor.snoozed_monitor(&process).await.is_none() {
        return StatusCode::BAD_REQUEST;
    }
    let duration = parse_snooze_duration(params.get("duration").map(String::as_str));
    supervisor.snooze.snooze(&process, duration).await;
    StatusCode::OK
}

async fn start_monitoring(State(supervisor): State<Arc<ProcessSupervisor>>, Path(process): Path<String>) -> StatusCode {
    if supervisor.snoozed_monitor(&process).await.is_none() {
        return StatusCode::BAD_REQUEST;
    }
    supervisor.snooze.unsnooze(&process).await;
    StatusCode::OK
}

/// Snoozes indefinitely for the duration of the restart so the supervisor's
/// own reconciliation tick doesn't race the manual stop/start, then
/// unsnoozes regardless of outcome.
async fn restart_process(State(supervisor): State<Arc<ProcessSupervisor>>, Path(process): Path<String>) -> StatusCode {
    let Some(monitor) = supervisor.snoozed_monitor(&process).await else {
        return StatusCode::BAD_REQUEST;
    };
    supervisor.snooze.snooze(&process, None).await;

    let result = async {
        supervisor.stop_process(&monitor).await?;
        supervisor.start_process(&monitor).await
    }
    .await;

    supervisor.snooze.unsnooze(&process).await;

    match result {
        Ok(()) => StatusCode::OK,
        Err(err) => {
            error!(process = %process, error = %err, "failed to restart process");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
