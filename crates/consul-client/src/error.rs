//! Consul client errors

use thiserror::Error;

/// Errors that can occur when talking to a Consul agent.
///
/// The client never retries; callers decide whether a failure is worth
/// retrying (the controller leaves retry to the next sweep).
#[derive(Debug, Error)]
pub enum ConsulError {
    /// Transport-level failure: connection refused, DNS, timeout.
    #[error("Consul agent unavailable: {0}")]
    Unavailable(String),

    /// The agent rejected the request as malformed (4xx).
    #[error("invalid request: {0}")]
    InvalidArgument(String),

    /// The agent refused the operation (5xx or unexpected status).
    #[error("agent refused operation: {0}")]
    Conflict(String),

    /// JSON encoding/decoding error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<reqwest::Error> for ConsulError {
    fn from(err: reqwest::Error) -> Self {
        ConsulError::Unavailable(err.to_string())
    }
}
