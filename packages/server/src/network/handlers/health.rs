//! Health, liveness, readiness and detail endpoint handlers.
//!
//! These handlers expose server health information for orchestrators
//! (Kubernetes, load balancers) and operational monitoring.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use super::AppState;
use crate::network::HealthState;

/// Plain liveness answer, `"ok"`.
pub async fn health_handler() -> Json<&'static str> {
    Json("ok")
}

/// Kubernetes liveness probe -- always returns 200 OK.
///
/// The liveness probe only checks whether the process is running and
/// responsive. It intentionally does not check downstream dependencies
/// or health state, because a failed liveness probe triggers a pod restart.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Kubernetes readiness probe -- returns 200 when ready, 503 otherwise.
///
/// Returns 503 until the listener serves and every deployment's start hook
/// has returned, during draining, and after stop.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.lifecycle.health_state() == HealthState::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Renders a duration as `1d 2h 3m 4s`, omitting leading zero units.
fn human_uptime(secs: u64) -> String {
    let (days, rem) = (secs / 86_400, secs % 86_400);
    let (hours, rem) = (rem / 3_600, rem % 3_600);
    let (minutes, seconds) = (rem / 60, rem % 60);
    let units = [(days, "d"), (hours, "h"), (minutes, "m")];
    let mut out: Vec<String> = units
        .iter()
        .skip_while(|(value, _)| *value == 0)
        .map(|(value, unit)| format!("{value}{unit}"))
        .collect();
    out.push(format!("{seconds}s"));
    out.join(" ")
}

/// Returns detailed health information as JSON.
///
/// Always returns 200 -- the `state` field in the response body indicates
/// whether the server is actually healthy.
pub async fn detail_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let uptime_secs = state.start_time.elapsed().as_secs();
    let deployments: serde_json::Map<String, serde_json::Value> = state
        .lifecycle
        .deployments()
        .into_iter()
        .map(|(target, start)| (target, json!(start.as_str())))
        .collect();
    Json(json!({
        "state": state.lifecycle.health_state().as_str(),
        "plugins": &*state.plugins,
        "deployments": deployments,
        "routes": state.routes.len(),
        "in_flight": state.lifecycle.in_flight(),
        "uptime": human_uptime(uptime_secs),
        "uptime_secs": uptime_secs,
    }))
}
