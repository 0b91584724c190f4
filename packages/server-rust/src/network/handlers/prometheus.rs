use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

use super::AppState;

const CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Prometheus text exposition of every recorded metric. 404 when the server
/// runs without a Prometheus recorder.
pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, CONTENT_TYPE)],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use metrics_exporter_prometheus::PrometheusBuilder;

    use super::*;
    use crate::network::handlers::test_support::app_state;

    #[tokio::test]
    async fn renders_when_a_recorder_is_present() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let mut state = app_state(None);
        state.prometheus = Some(recorder.handle());

        let response = metrics_handler(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], CONTENT_TYPE);
    }

    #[tokio::test]
    async fn missing_recorder_is_not_found() {
        let response = metrics_handler(State(app_state(None))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
