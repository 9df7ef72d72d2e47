//! Prometheus metrics for the register controller.
//!
//! Counters track Consul calls (labeled by operation and agent address)
//! and pod-level operations; a histogram tracks the runtime of the
//! controller functions. Everything is registered on one registry that
//! the `/metrics` endpoint serves.

use crate::error::ControllerError;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use tracing::info;

/// Metrics shared by every reconciler variant.
#[derive(Clone)]
pub struct ControllerMetrics {
    /// `consul_errors_total{operation, consul_address}`
    pub consul_failure: CounterVec,
    /// `consul_successes_total{operation, consul_address}`
    pub consul_success: CounterVec,
    /// `pod_errors_total{operation}`
    pub pod_failure: CounterVec,
    /// `pod_successes_total{operation}`
    pub pod_success: CounterVec,
    /// `controller_function_duration_seconds{function}`
    pub func_duration: HistogramVec,
    registry: Registry,
}

impl ControllerMetrics {
    pub fn new() -> Result<Self, ControllerError> {
        let registry = Registry::new();

        let consul_failure = CounterVec::new(
            Opts::new(
                "consul_errors_total",
                "Number of Consul errors for HTTP request.",
            ),
            &["operation", "consul_address"],
        )?;
        registry.register(Box::new(consul_failure.clone()))?;

        let consul_success = CounterVec::new(
            Opts::new(
                "consul_successes_total",
                "Number of Consul success for HTTP request.",
            ),
            &["operation", "consul_address"],
        )?;
        registry.register(Box::new(consul_success.clone()))?;

        let pod_failure = CounterVec::new(
            Opts::new("pod_errors_total", "Number of failed operations on pods."),
            &["operation"],
        )?;
        registry.register(Box::new(pod_failure.clone()))?;

        let pod_success = CounterVec::new(
            Opts::new(
                "pod_successes_total",
                "Number of succeeded operations on pods.",
            ),
            &["operation"],
        )?;
        registry.register(Box::new(pod_success.clone()))?;

        let func_duration = HistogramVec::new(
            HistogramOpts::new(
                "controller_function_duration_seconds",
                "The runtime of a controller function.",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
            &["function"],
        )?;
        registry.register(Box::new(func_duration.clone()))?;

        Ok(Self {
            consul_failure,
            consul_success,
            pod_failure,
            pod_success,
            func_duration,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Serve the registry on `/metrics` until the process exits.
pub async fn serve(registry: Registry, addr: SocketAddr) -> Result<(), ControllerError> {
    let app = Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(registry);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ControllerError::Serve(format!("cannot bind {}: {}", addr, e)))?;

    info!("Metrics listening on http://{}/metrics", addr);

    axum::serve(listener, app)
        .await
        .map_err(|e| ControllerError::Serve(e.to_string()))
}

async fn render_metrics(State(registry): State<Registry>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    match encoder.encode(&registry.gather(), &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, encoder.format_type().to_string())],
            buffer,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_register_and_increment() {
        let metrics = ControllerMetrics::new().unwrap();

        metrics
            .consul_success
            .with_label_values(&["register", "localhost:8500"])
            .inc();
        metrics.pod_failure.with_label_values(&["update"]).inc();
        let timer = metrics
            .func_duration
            .with_label_values(&["sync"])
            .start_timer();
        drop(timer);

        let families = metrics.registry().gather();
        let names: Vec<_> = families.iter().map(|f| f.get_name().to_string()).collect();
        assert!(names.contains(&"consul_successes_total".to_string()));
        assert!(names.contains(&"pod_errors_total".to_string()));
        assert!(names.contains(&"controller_function_duration_seconds".to_string()));
    }
}
