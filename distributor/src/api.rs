use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// The push API surface: request/response bodies and the error taxonomy
// returned to callers. Everything here serializes over the wire, both for
// the inbound handler and for the outbound pushes to ingesters.

#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct PushRequest {
    #[serde(default)]
    pub streams: Vec<Stream>,
}

/// A label-identified, timestamp-ordered sequence of log entries.
#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct Stream {
    /// Raw label-set string as received, e.g. `{app="api", env="prod"}`.
    /// Rewritten to the canonical sorted form during validation.
    pub labels: String,
    #[serde(default)]
    pub entries: Vec<Entry>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Entry {
    /// Unix timestamp in nanoseconds.
    pub timestamp: i64,
    pub line: String,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct PushResponse {}

impl Stream {
    /// Sum of the line bytes across all entries.
    pub fn line_bytes(&self) -> usize {
        self.entries.iter().map(|e| e.line.len()).sum()
    }
}

/// Why a single entry was rejected. The reason string feeds the
/// `discarded_samples_total` / `discarded_bytes_total` counters.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EntryError {
    #[error("max entry size {limit} bytes exceeded for stream '{labels}' while adding an entry with length {actual} bytes")]
    LineTooLong {
        limit: usize,
        actual: usize,
        labels: String,
    },
    #[error("entry for stream '{labels}' has timestamp too old: {timestamp}")]
    TooOld { labels: String, timestamp: i64 },
    #[error("entry for stream '{labels}' has timestamp too new: {timestamp}")]
    TooNew { labels: String, timestamp: i64 },
}

impl EntryError {
    pub fn reason(&self) -> &'static str {
        match self {
            EntryError::LineTooLong { .. } => crate::validation::LINE_TOO_LONG,
            EntryError::TooOld { .. } => crate::validation::GREATER_THAN_MAX_SAMPLE_AGE,
            EntryError::TooNew { .. } => crate::validation::TOO_FAR_IN_FUTURE,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PushError {
    #[error("no tenant id present in request")]
    MissingTenant,

    #[error("failed to decode push request: {message}")]
    InvalidRequest { message: String },

    #[error("error parsing labels '{labels}': {message}")]
    InvalidLabels { labels: String, message: String },

    #[error("{0}")]
    InvalidEntry(#[from] EntryError),

    #[error("ingestion rate limit exceeded for tenant {tenant} (limit: {limit} bytes/sec) while attempting to ingest {samples} samples totaling {bytes} bytes")]
    RateLimited {
        tenant: String,
        limit: u32,
        samples: usize,
        bytes: usize,
    },

    #[error("at least one stream exhausted its failure budget: {message}")]
    ReplicationFailed { message: String },

    #[error("ring lookup failed: {message}")]
    Ring { message: String },
}

impl PushError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            PushError::MissingTenant => StatusCode::UNAUTHORIZED,
            PushError::InvalidRequest { .. }
            | PushError::InvalidLabels { .. }
            | PushError::InvalidEntry(_) => StatusCode::BAD_REQUEST,
            PushError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            PushError::ReplicationFailed { .. } | PushError::Ring { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for PushError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_statuses_match_taxonomy() {
        assert_eq!(
            PushError::MissingTenant.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            PushError::RateLimited {
                tenant: "t".to_string(),
                limit: 100,
                samples: 1,
                bytes: 500,
            }
            .status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            PushError::InvalidLabels {
                labels: "{".to_string(),
                message: "unexpected end of input".to_string(),
            }
            .status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn rate_limited_message_carries_tenant_and_counts() {
        let err = PushError::RateLimited {
            tenant: "team-a".to_string(),
            limit: 100,
            samples: 3,
            bytes: 500,
        };
        let msg = err.to_string();
        assert!(msg.contains("team-a"));
        assert!(msg.contains("100"));
        assert!(msg.contains('3'));
        assert!(msg.contains("500"));
    }

    #[test]
    fn request_round_trips_through_json() {
        let req = PushRequest {
            streams: vec![Stream {
                labels: r#"{app="api"}"#.to_string(),
                entries: vec![Entry {
                    timestamp: 1_600_000_000_000_000_000,
                    line: "hello".to_string(),
                }],
            }],
        };
        let body = serde_json::to_string(&req).unwrap();
        let decoded: PushRequest = serde_json::from_str(&body).unwrap();
        assert_eq!(req, decoded);
    }
}
