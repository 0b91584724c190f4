//! Heuristic error classification for metrics labels.
//!
//! Maps any failure into a small closed set of classes by looking at its
//! text. This is a heuristic over names and messages, not a taxonomy of
//! typed errors: a message that happens to mention "invalid" is a
//! validation failure as far as the dashboards are concerned.

use std::error::Error;
use std::fmt;

/// Closed set of failure categories used as the `error_class` metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Timeout,
    /// Broker connectivity (the broker is Redis-backed in production).
    Redis,
    Validation,
    Upstream,
    Unknown,
}

impl ErrorClass {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Redis => "redis",
            Self::Validation => "validation",
            Self::Upstream => "upstream",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const BROKER_PHRASES: &[&str] = &[
    "redis",
    "econnrefused",
    "connection refused",
    "connection is closed",
];

/// Classifies a failure from its name and message. First match wins.
#[must_use]
pub fn classify(name: &str, message: &str) -> ErrorClass {
    let text = format!("{name}: {message}").to_lowercase();

    if text.contains("timeout") || text.contains("timedout") {
        ErrorClass::Timeout
    } else if BROKER_PHRASES.iter().any(|p| text.contains(p)) {
        ErrorClass::Redis
    } else if text.contains("validation") || text.contains("invalid") {
        ErrorClass::Validation
    } else if text.contains("osrm") || text.contains("upstream") {
        ErrorClass::Upstream
    } else {
        ErrorClass::Unknown
    }
}

/// Classifies an error value using its display text and every `source()` in
/// its chain.
#[must_use]
pub fn classify_error(err: &(dyn Error + 'static)) -> ErrorClass {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    classify("", &message)
}
