//! Content-addressed job identifiers.
//!
//! Two submissions with byte-identical canonical payloads and the same job
//! kind produce the same key, which the broker uses as the job id so the
//! second submission collapses onto the first.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::types::JobKind;

/// Rebuilds `value` with every object's keys in sorted order.
///
/// Serializing the result gives the same bytes regardless of the field
/// order the caller built the payload with, even when `serde_json` is
/// compiled with `preserve_order`.
#[must_use]
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::with_capacity(map.len());
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key.as_str()]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Computes `<kind-prefix>-<sha256 hex>` over the canonical JSON of `payload`.
#[must_use]
pub fn idempotency_key(kind: JobKind, payload: &Value) -> String {
    // Serializing a `Value` cannot fail: every key is already a string.
    let bytes = serde_json::to_vec(&canonicalize(payload)).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    format!("{}-{}", kind.idempotency_prefix(), hex::encode(digest))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    #[test]
    fn key_has_kind_prefix_and_hex_digest() {
        let key = idempotency_key(JobKind::GeocodeAddress, &json!({"address": "Kyiv"}));
        let (prefix, digest) = key.split_once('-').unwrap();
        assert_eq!(prefix, "geocode");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn field_order_does_not_change_the_key() {
        let a = json!({"start": {"lat": 1.0, "lng": 2.0}, "finish": {"lng": 4.0, "lat": 3.0}});
        let b = json!({"finish": {"lat": 3.0, "lng": 4.0}, "start": {"lng": 2.0, "lat": 1.0}});
        assert_eq!(
            idempotency_key(JobKind::RouteDistance, &a),
            idempotency_key(JobKind::RouteDistance, &b)
        );
    }

    #[test]
    fn same_payload_different_kind_differs() {
        let payload = json!({"address": "Lviv"});
        assert_ne!(
            idempotency_key(JobKind::GeocodeAddress, &payload),
            idempotency_key(JobKind::RouteDistance, &payload)
        );
    }

    #[test]
    fn different_payloads_differ() {
        assert_ne!(
            idempotency_key(JobKind::GeocodeAddress, &json!({"address": "Lviv"})),
            idempotency_key(JobKind::GeocodeAddress, &json!({"address": "Odesa"}))
        );
    }

    #[test]
    fn canonicalize_sorts_nested_objects_inside_arrays() {
        let value = json!([{"b": 1, "a": 2}]);
        let text = serde_json::to_string(&canonicalize(&value)).unwrap();
        assert_eq!(text, r#"[{"a":2,"b":1}]"#);
    }

    proptest! {
        #[test]
        fn key_is_deterministic(address in ".{0,64}", house in 0u32..10_000) {
            let payload = json!({"address": address, "house": house});
            prop_assert_eq!(
                idempotency_key(JobKind::GeocodeAddress, &payload),
                idempotency_key(JobKind::GeocodeAddress, &payload.clone())
            );
        }
    }
}
