use std::future::Future;
use std::sync::Arc;

use waybill_core::{Coordinates, JobKind, RouteRequest};

use crate::config::QueueConfig;
use crate::dispatch::{Dispatcher, RouteOptions};
use crate::job_metrics::JobMetrics;
use crate::queue::QueueRegistry;
use crate::waiter::ResultWaiter;

/// Dispatch-then-wait entry points for the two job kinds.
///
/// Each call submits the job, waits up to the configured timeout, and runs
/// the caller's fallback whenever the queue path does not produce a value.
#[derive(Clone)]
pub struct Orchestrator {
    dispatcher: Dispatcher,
    waiter: ResultWaiter,
    config: Arc<QueueConfig>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        registry: Arc<QueueRegistry>,
        config: Arc<QueueConfig>,
        metrics: Arc<JobMetrics>,
    ) -> Self {
        Self {
            dispatcher: Dispatcher::new(registry, Arc::clone(&config)),
            waiter: ResultWaiter::new(metrics),
            config,
        }
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Geocodes `address` through the geocoding queue.
    ///
    /// # Errors
    ///
    /// Only errors produced by `fallback`.
    pub async fn geocode<E, F, Fut>(&self, address: &str, fallback: F) -> Result<Coordinates, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Coordinates, E>>,
    {
        let submission = self.dispatcher.request_geocoding(address).await;
        self.waiter
            .await_result(
                self.config.queue_for(JobKind::GeocodeAddress),
                JobKind::GeocodeAddress,
                submission,
                self.config.wait_timeout,
                fallback,
            )
            .await
    }

    /// Computes a route distance (in meters) through the route queue.
    ///
    /// # Errors
    ///
    /// Only errors produced by `fallback`.
    pub async fn route_distance<E, F, Fut>(
        &self,
        route: &RouteRequest,
        options: &RouteOptions,
        fallback: F,
    ) -> Result<f64, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<f64, E>>,
    {
        let submission = self.dispatcher.request_route_distance(route, options).await;
        self.waiter
            .await_result(
                self.config.queue_for(JobKind::RouteDistance),
                JobKind::RouteDistance,
                submission,
                self.config.wait_timeout,
                fallback,
            )
            .await
    }
}
