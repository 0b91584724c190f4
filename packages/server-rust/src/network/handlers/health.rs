//! Health, liveness, and readiness endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use serde_json::json;

use super::AppState;
use crate::network::HealthState;
use crate::queue::CircuitState;

#[derive(Debug, Serialize)]
struct CircuitHealth {
    configured: bool,
    #[serde(flatten)]
    state: CircuitState,
    open_queues: usize,
}

/// Lifecycle and queue-circuit state as JSON. Always 200; the body tells
/// whether the queue path is usable.
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let circuit = state.registry.circuit();
    let queue_circuit = CircuitHealth {
        configured: circuit.is_configured(),
        state: circuit.state(),
        open_queues: state.registry.open_count(),
    };

    Json(json!({
        "state": state.shutdown.health_state().as_str(),
        "queue_circuit": queue_circuit,
        "jobs_processed": state.metrics.processed_total(),
        "in_flight": state.shutdown.in_flight_count(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// Liveness probe: 200 while the process answers at all.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe: 200 only in the `Ready` state.
///
/// An open queue circuit does not make the server unready, since every
/// caller still gets a result through its fallback.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.shutdown.health_state() == HealthState::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
mod tests {
    use waybill_core::{ErrorClass, JobKind, Outcome};

    use super::*;
    use crate::broker::MemoryBroker;
    use crate::network::handlers::test_support::app_state;

    #[tokio::test]
    async fn health_reports_lifecycle_and_circuit() {
        let broker = MemoryBroker::new();
        let state = app_state(Some(&broker));
        state.shutdown.set_ready();
        state.registry.get_queue("geocoding-queue").unwrap();

        let json = health_handler(State(state)).await.0;

        assert_eq!(json["state"], "ready");
        assert_eq!(json["queue_circuit"]["configured"], true);
        assert_eq!(json["queue_circuit"]["enabled"], true);
        assert_eq!(json["queue_circuit"]["open_queues"], 1);
        assert_eq!(json["in_flight"], 0);
        assert!(json["uptime_secs"].is_number());
    }

    #[tokio::test]
    async fn health_reports_disabled_circuit_and_job_counts() {
        let state = app_state(None);
        state.metrics.record_processed(
            "geocoding-queue",
            JobKind::GeocodeAddress,
            Outcome::Failed,
            Some(ErrorClass::Unknown),
        );

        let json = health_handler(State(state)).await.0;

        assert_eq!(json["state"], "starting");
        assert_eq!(json["queue_circuit"]["configured"], false);
        assert_eq!(json["queue_circuit"]["enabled"], false);
        assert_eq!(json["jobs_processed"], 1);
    }

    #[tokio::test]
    async fn health_carries_the_circuit_snapshot() {
        let broker = MemoryBroker::new();
        let state = app_state(Some(&broker));
        state.registry.disable("Connection is closed").await;
        state.registry.circuit().reset();
        let snapshot = state.registry.circuit().state();

        let json = health_handler(State(state)).await.0;

        assert_eq!(json["queue_circuit"]["enabled"], snapshot.enabled);
        assert_eq!(json["queue_circuit"]["generation"], snapshot.generation);
        assert_eq!(json["queue_circuit"]["generation"], 2);
        assert_eq!(json["queue_circuit"]["open_queues"], 0);
    }

    #[tokio::test]
    async fn liveness_is_always_ok() {
        assert_eq!(liveness_handler().await, StatusCode::OK);
    }

    #[tokio::test]
    async fn readiness_follows_the_lifecycle() {
        let state = app_state(None);
        assert_eq!(
            readiness_handler(State(state.clone())).await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        state.shutdown.set_ready();
        assert_eq!(readiness_handler(State(state.clone())).await, StatusCode::OK);

        state.shutdown.trigger_shutdown();
        assert_eq!(
            readiness_handler(State(state)).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
