//! Job payloads for the two dispatchable job kinds.

use serde::{Deserialize, Serialize};

/// Payload of a `GeocodeAddress` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeocodePayload {
    pub address: String,
}

/// A point on the map, in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

/// Geometry of a `RouteDistance` job.
///
/// Only these fields feed the idempotency key. Trace metadata travels next to
/// them in the job payload but never changes the job's identity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RouteRequest {
    pub start: Coordinates,
    pub finish: Coordinates,
}
