//! Idempotent job submission.
//!
//! The job id is the request's idempotency key, so resubmitting an identical
//! payload while the first job is still retained by the broker returns that
//! job instead of creating a second one.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;
use waybill_core::{idempotency_key, JobHandle, JobKind, JobRequest, RouteRequest};

use crate::broker::{BrokerError, NewJob};
use crate::config::QueueConfig;
use crate::queue::{QueueLease, QueueRegistry};

/// Payload field carrying the distributed-trace token of a route request.
pub const TRACE_CONTEXT_FIELD: &str = "traceContext";

/// Errors from [`Dispatcher::submit`].
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("queue {queue} unavailable: circuit open")]
    CircuitOpen { queue: String },
    #[error("failed to enqueue {kind} on {queue}: {source}")]
    Broker {
        queue: String,
        kind: JobKind,
        #[source]
        source: BrokerError,
    },
}

/// Per-call options of [`Dispatcher::request_route_distance`].
#[derive(Debug, Clone, Default)]
pub struct RouteOptions {
    /// Propagation token so the worker can continue the caller's trace.
    pub trace_context: Option<String>,
}

/// A job accepted by the broker, plus the lease needed to wait on it.
#[derive(Clone)]
pub struct Submission {
    pub request: JobRequest,
    pub handle: JobHandle,
    pub(crate) lease: QueueLease,
}

impl std::fmt::Debug for Submission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Submission")
            .field("request", &self.request)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// Submits jobs through the circuit-gated registry.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<QueueRegistry>,
    config: Arc<QueueConfig>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(registry: Arc<QueueRegistry>, config: Arc<QueueConfig>) -> Self {
        Self { registry, config }
    }

    /// Submits `payload` as a `kind` job on `queue`, keyed by the digest of
    /// the whole payload.
    ///
    /// # Errors
    ///
    /// [`DispatchError::CircuitOpen`] when the registry has no queue to offer,
    /// [`DispatchError::Broker`] when the broker rejects the add.
    pub async fn submit(
        &self,
        queue: &str,
        kind: JobKind,
        payload: Value,
    ) -> Result<Submission, DispatchError> {
        self.submit_request(JobRequest::new(queue, kind, payload)).await
    }

    /// Submits a prepared request, using its idempotency key as the job id.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::submit`].
    pub async fn submit_request(&self, request: JobRequest) -> Result<Submission, DispatchError> {
        let Some(lease) = self.registry.get_queue(&request.queue) else {
            return Err(DispatchError::CircuitOpen {
                queue: request.queue,
            });
        };

        let job = NewJob {
            id: request.idempotency_key.clone(),
            name: request.kind.as_str().to_string(),
            data: request.payload.clone(),
            options: self.config.job_options(),
        };
        let handle = lease
            .queue
            .add(job)
            .await
            .map_err(|source| DispatchError::Broker {
                queue: request.queue.clone(),
                kind: request.kind,
                source,
            })?;

        debug!(
            queue = %request.queue,
            kind = %request.kind,
            job_id = %handle.id,
            "job submitted"
        );
        Ok(Submission {
            request,
            handle,
            lease,
        })
    }

    /// Dispatches a `GeocodeAddress` job for `address`.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::submit`].
    pub async fn request_geocoding(&self, address: &str) -> Result<Submission, DispatchError> {
        let queue = self.config.queue_for(JobKind::GeocodeAddress);
        self.submit(queue, JobKind::GeocodeAddress, json!({ "address": address }))
            .await
    }

    /// Dispatches a `RouteDistance` job.
    ///
    /// The idempotency key covers `start` and `finish` only; the trace token is
    /// merged into the payload afterwards so identical routes requested under
    /// different traces still share one job.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::submit`].
    pub async fn request_route_distance(
        &self,
        route: &RouteRequest,
        options: &RouteOptions,
    ) -> Result<Submission, DispatchError> {
        let request = route_request(self.config.queue_for(JobKind::RouteDistance), route, options);
        self.submit_request(request).await
    }
}

fn route_request(queue: &str, route: &RouteRequest, options: &RouteOptions) -> JobRequest {
    let geometry = json!({ "start": route.start, "finish": route.finish });
    let idempotency_key = idempotency_key(JobKind::RouteDistance, &geometry);

    let mut payload = geometry;
    if let (Some(trace), Value::Object(map)) = (&options.trace_context, &mut payload) {
        map.insert(TRACE_CONTEXT_FIELD.to_string(), Value::String(trace.clone()));
    }

    JobRequest {
        queue: queue.to_string(),
        kind: JobKind::RouteDistance,
        payload,
        idempotency_key,
    }
}
