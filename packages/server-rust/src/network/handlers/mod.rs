//! Operator HTTP handlers and the state they share.

pub mod health;
pub mod prometheus;
pub mod queues;

pub use health::{health_handler, liveness_handler, readiness_handler};
pub use prometheus::metrics_handler;
pub use queues::{diagnostics_handler, recover_handler};

use std::sync::Arc;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusHandle;

use super::ShutdownController;
use crate::job_metrics::JobMetrics;
use crate::queue::QueueRegistry;
use crate::recovery::RecoveryService;

/// Shared state carried through axum's `State` extractor. Clones are cheap.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<QueueRegistry>,
    pub recovery: Arc<RecoveryService>,
    pub metrics: Arc<JobMetrics>,
    pub shutdown: Arc<ShutdownController>,
    /// Renders `/metrics`. `None` when no Prometheus recorder is installed.
    pub prometheus: Option<PrometheusHandle>,
    pub start_time: Instant,
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::broker::{Broker, MemoryBroker};
    use crate::config::QueueConfig;

    /// State over an in-memory broker, or over no broker at all.
    pub(crate) fn app_state(broker: Option<&MemoryBroker>) -> AppState {
        let registry =
            QueueRegistry::new(broker.map(|b| Arc::new(b.clone()) as Arc<dyn Broker>));
        let config = Arc::new(QueueConfig::default());
        AppState {
            recovery: Arc::new(RecoveryService::new(Arc::clone(&registry), config)),
            registry,
            metrics: Arc::new(JobMetrics::new()),
            shutdown: Arc::new(ShutdownController::new()),
            prometheus: None,
            start_time: Instant::now(),
        }
    }
}
