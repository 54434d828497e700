//! Error classification shared by every delivery path.
//!
//! Each module keeps its own `thiserror` enum; `ErrorKind` is the common
//! vocabulary the persister and the HTTP surface match on to decide between
//! retry, dead-letter and "try again later".

use serde::Serialize;

/// Classification of a failure on a delivery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Timeout, connection loss, storage busy. Retry via requeue/backoff.
    TransientIo,
    /// Rejected by the record store. Never retried.
    Validation,
    /// Update/delete targeted a record that does not exist. Never retried.
    NotFound,
    /// Admission control denied the request. Caller should back off.
    RateLimited,
    /// Payload could not be decoded into a mutation. Never retried.
    MalformedPayload,
}

impl ErrorKind {
    /// Whether retrying the same input can never succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ErrorKind::Validation | ErrorKind::NotFound | ErrorKind::MalformedPayload
        )
    }

    /// Stable string form used in logs and wire responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransientIo => "transient_io",
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::MalformedPayload => "malformed_payload",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
