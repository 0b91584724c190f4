//! HTTP server lifecycle.
//!
//! `new()` allocates shared state, `start()` binds the listener, and
//! `serve()` accepts requests until the shutdown future resolves or the
//! [`ShutdownController`] is triggered. After the
//! listener stops, in-flight operator requests are drained and the queue
//! registry closes every broker handle.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::NetworkConfig;
use super::handlers::{
    diagnostics_handler, health_handler, liveness_handler, metrics_handler, readiness_handler,
    recover_handler, AppState,
};
use super::middleware::build_http_layers;
use super::shutdown::ShutdownController;
use crate::job_metrics::JobMetrics;
use crate::queue::QueueRegistry;
use crate::recovery::RecoveryService;

pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    state: AppState,
}

impl NetworkModule {
    #[must_use]
    pub fn new(
        config: NetworkConfig,
        registry: Arc<QueueRegistry>,
        recovery: Arc<RecoveryService>,
        metrics: Arc<JobMetrics>,
    ) -> Self {
        Self {
            config,
            listener: None,
            state: AppState {
                registry,
                recovery,
                metrics,
                shutdown: Arc::new(ShutdownController::new()),
                prometheus: None,
                start_time: Instant::now(),
            },
        }
    }

    /// Serves `/metrics` from `handle`.
    #[must_use]
    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.state.prometheus = Some(handle);
        self
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.state.shutdown)
    }

    /// Routes:
    /// - `GET /health`, `/health/live`, `/health/ready`
    /// - `GET /metrics`
    /// - `GET /queues/diagnostics`
    /// - `POST /queues/recover`
    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .route("/metrics", get(metrics_handler))
            .route("/queues/diagnostics", get(diagnostics_handler))
            .route("/queues/recover", post(recover_handler))
            .layer(build_http_layers(&self.config))
            .with_state(self.state.clone())
    }

    /// Binds the listener and returns the bound port (OS-assigned when the
    /// configured port is 0).
    ///
    /// # Errors
    ///
    /// Fails if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let port = listener.local_addr()?.port();
        info!(host = %self.config.host, port, "listener bound");
        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves until `shutdown` resolves or the shutdown controller fires,
    /// then drains and closes the queues.
    ///
    /// # Errors
    ///
    /// Fails if `start()` was not called or the server hits a fatal I/O
    /// error.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .take()
            .context("start() must be called before serve()")?;
        let router = self.build_router();
        let controller = Arc::clone(&self.state.shutdown);
        let stopped = controller.stopped();

        controller.set_ready();
        info!("serving operator HTTP");
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    () = shutdown => {}
                    () = stopped => {}
                }
            })
            .await?;

        controller.trigger_shutdown();
        if controller.wait_for_drain(self.config.drain_timeout).await {
            info!("in-flight requests drained");
        } else {
            warn!(
                in_flight = controller.in_flight_count(),
                "drain timeout expired with requests outstanding"
            );
        }
        self.state.registry.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use waybill_core::JobState;

    use super::*;
    use crate::broker::{Broker, MemoryBroker};
    use crate::config::QueueConfig;

    fn module(broker: Option<&MemoryBroker>) -> NetworkModule {
        let registry =
            QueueRegistry::new(broker.map(|b| Arc::new(b.clone()) as Arc<dyn Broker>));
        let recovery = Arc::new(RecoveryService::new(
            Arc::clone(&registry),
            Arc::new(QueueConfig::default()),
        ));
        NetworkModule::new(
            NetworkConfig {
                host: "127.0.0.1".to_string(),
                ..NetworkConfig::default()
            },
            registry,
            recovery,
            Arc::new(JobMetrics::new()),
        )
    }

    #[tokio::test]
    async fn router_serves_recovery_with_request_ids() {
        let broker = MemoryBroker::new();
        broker.seed(
            "dead-letter-queue",
            "d1",
            "DeadLetter",
            json!({"queue": "dead-letter-queue", "name": "GeocodeAddress", "data": {}}),
            JobState::Waiting,
        );
        let router = module(Some(&broker)).build_router();

        let request = Request::post("/queues/recover")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"dryRun": false, "removeSkippedDeadLetter": true}"#))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["deadLetterSkipped"], 1);
        assert_eq!(json["deadLetterSkippedRemoved"], 1);
    }

    #[tokio::test]
    async fn router_reports_disabled_diagnostics() {
        let router = module(None).build_router();
        let request = Request::get("/queues/diagnostics?limit=500")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn serve_without_start_is_an_error() {
        let err = module(None)
            .serve(std::future::ready(()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("start()"));
    }

    #[tokio::test]
    async fn serve_closes_queue_handles_on_shutdown() {
        let broker = MemoryBroker::new();
        let mut module = module(Some(&broker));
        let port = module.start().await.unwrap();
        assert!(port > 0);

        module.state.registry.get_queue("geocoding-queue").unwrap();
        let controller = module.shutdown_controller();
        module.serve(std::future::ready(())).await.unwrap();

        assert_eq!(broker.closed_handles(), broker.opened_handles());
        assert_eq!(controller.health_state(), crate::network::HealthState::Stopped);
    }

    #[tokio::test]
    async fn triggering_the_controller_stops_serving() {
        let broker = MemoryBroker::new();
        let mut module = module(Some(&broker));
        module.start().await.unwrap();
        module.state.registry.get_queue("route-distance-queue").unwrap();
        let controller = module.shutdown_controller();

        let server = tokio::spawn(module.serve(std::future::pending()));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        controller.trigger_shutdown();

        tokio::time::timeout(std::time::Duration::from_secs(5), server)
            .await
            .expect("serve returns after the controller fires")
            .unwrap()
            .unwrap();
        assert_eq!(broker.closed_handles(), broker.opened_handles());
        assert_eq!(controller.health_state(), crate::network::HealthState::Stopped);
    }
}
