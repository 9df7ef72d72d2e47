//! Controller-specific error types.

use consul_client::ConsulError;
use thiserror::Error;

/// Errors that can occur in the register controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Consul agent error
    #[error("Consul error: {0}")]
    Consul(#[from] ConsulError),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A source object cannot be turned into a catalog entry
    #[error("invalid catalog entry: {0}")]
    InvalidEntry(String),

    /// Metrics registration error
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Metrics endpoint failed to bind or serve
    #[error("HTTP serve error: {0}")]
    Serve(String),

    /// Resource watch failed
    #[error("resource watch failed: {0}")]
    Watch(String),
}
