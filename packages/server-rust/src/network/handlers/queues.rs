//! Dead-letter diagnostics and recovery endpoints.
//!
//! - `GET /queues/diagnostics?limit=N` lists failed and dead-lettered jobs
//! - `POST /queues/recover` runs a recovery pass (dry run unless the body
//!   says `"dryRun": false`)
//!
//! Both answer 503 with `enabled: false` while the queue circuit is open.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use super::AppState;
use crate::recovery::{clamp_limit, RecoveryOptions};

/// Default number of entries listed per category.
pub const DEFAULT_DIAGNOSTICS_LIMIT: usize = 20;

#[derive(Debug, Default, Deserialize)]
pub struct DiagnosticsQuery {
    pub limit: Option<usize>,
}

pub async fn diagnostics_handler(
    State(state): State<AppState>,
    Query(query): Query<DiagnosticsQuery>,
) -> Response {
    let _guard = state.shutdown.in_flight_guard();
    let limit = clamp_limit(query.limit.unwrap_or(DEFAULT_DIAGNOSTICS_LIMIT));

    let report = state.recovery.collect_diagnostics(limit).await;
    let status = if report.enabled {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

/// Runs a recovery pass. An empty body means all defaults.
pub async fn recover_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let _guard = state.shutdown.in_flight_guard();

    let options = if body.iter().all(u8::is_ascii_whitespace) {
        RecoveryOptions::default()
    } else {
        match serde_json::from_slice::<RecoveryOptions>(&body) {
            Ok(options) => options,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": format!("invalid recovery options: {e}") })),
                )
                    .into_response();
            }
        }
    };

    match state.recovery.recover(options).await {
        Ok(report) if report.enabled => (StatusCode::OK, Json(report)).into_response(),
        Ok(report) => (StatusCode::SERVICE_UNAVAILABLE, Json(report)).into_response(),
        Err(e) => {
            warn!(error = %e, "recovery request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}
