//! Reconciliation engine.
//!
//! Three reconciler variants translate cluster objects into Consul
//! catalog entries, driven by whichever source the configuration picks:
//! - `pods`: workload instances, one entry per ready container
//! - `endpoints`: endpoint sets, one entry per address and port
//! - `services`: exposed services, one entry per node address and port
//!
//! Each variant implements the same three operations (`watch`, `sync`,
//! `clean`) behind `RegisterReconciler`; shared pieces live in
//! `agents` (agent cache) and `sweep` (owned-entry indexing, orphan
//! removal).

pub mod agents;
pub mod endpoints;
pub mod pod_info;
pub mod pods;
pub mod services;
pub mod sweep;

use crate::config::{ControllerConfig, RegisterSource};
use crate::consul::AgentFactory;
use crate::error::ControllerError;
use crate::metrics::ControllerMetrics;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Annotation enabling registration for a source object.
pub const ENABLED_ANNOTATION: &str = "consul.register/enabled";
/// Annotation overriding the entry name (pod source).
pub const SERVICE_NAME_ANNOTATION: &str = "consul.register/service.name";
/// Annotation prefix contributing `k -> v` pairs to entry meta.
pub const SERVICE_META_PREFIX_ANNOTATION: &str = "consul.register/service.meta.";
/// Annotation holding the JSON-serialized controller reference.
pub const CREATED_BY_ANNOTATION: &str = "kubernetes.io/created-by";
/// Annotation with the comma-separated container allow-list.
pub const EXPECTED_CONTAINER_NAMES_ANNOTATION: &str = "consul.register/pod.container.name";

/// The three operations every reconciler variant provides.
///
/// All three serialize on one per-reconciler lock, so the sequence of
/// register/deregister calls issued by one instance is totally ordered.
#[async_trait::async_trait]
pub trait RegisterReconciler: Send + Sync {
    /// Consume cluster events until the stream ends or fails.
    async fn watch(self: Arc<Self>) -> Result<(), ControllerError>;

    /// Forward sweep: ensure every enabled object has its entries.
    async fn sync(&self) -> Result<(), ControllerError>;

    /// Backward sweep: remove owner-tagged entries with no live source.
    async fn clean(&self) -> Result<(), ControllerError>;
}

/// Pick the reconciler variant for the configured register source.
pub fn new_reconciler(
    client: kube::Client,
    factory: Arc<dyn AgentFactory>,
    cfg: Arc<ControllerConfig>,
    namespace: Option<String>,
    metrics: ControllerMetrics,
) -> Arc<dyn RegisterReconciler> {
    match cfg.register_source {
        RegisterSource::Service => {
            info!("Using service register source");
            Arc::new(services::ServiceController::new(
                client, factory, cfg, namespace, metrics,
            ))
        }
        RegisterSource::Endpoint => {
            info!("Using endpoint register source");
            Arc::new(endpoints::EndpointController::new(
                client, factory, cfg, namespace, metrics,
            ))
        }
        RegisterSource::Pod => {
            info!("Using pod register source");
            Arc::new(pods::PodController::new(
                client, factory, cfg, namespace, metrics,
            ))
        }
    }
}

/// Whether the `consul.register/enabled` annotation opts this object in.
///
/// A missing annotation, an unparsable value and an explicit `false`
/// all keep the object out of scope.
pub(crate) fn is_register_enabled(
    kind: &str,
    name: &str,
    namespace: &str,
    annotations: Option<&BTreeMap<String, String>>,
) -> bool {
    match annotations.and_then(|a| a.get(ENABLED_ANNOTATION)) {
        Some(value) => match crate::config::parse_bool(value) {
            Some(true) => true,
            Some(false) => {
                info!(
                    "{} {} in {} namespace is disabled by annotation. Value: {}",
                    kind, name, namespace, value
                );
                false
            }
            None => {
                error!(
                    "Can't convert value of {} annotation: {}",
                    ENABLED_ANNOTATION, value
                );
                false
            }
        },
        None => {
            debug!(
                "{} {} in {} namespace will not be registered in Consul. Lack of annotation {}",
                kind, name, namespace, ENABLED_ANNOTATION
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotations(value: Option<&str>) -> Option<BTreeMap<String, String>> {
        value.map(|v| BTreeMap::from([(ENABLED_ANNOTATION.to_string(), v.to_string())]))
    }

    #[test]
    fn enabled_annotation_gates_objects() {
        assert!(is_register_enabled(
            "Pod",
            "p",
            "default",
            annotations(Some("true")).as_ref()
        ));
        assert!(!is_register_enabled(
            "Pod",
            "p",
            "default",
            annotations(Some("false")).as_ref()
        ));
        assert!(!is_register_enabled(
            "Pod",
            "p",
            "default",
            annotations(Some("not-a-bool")).as_ref()
        ));
        assert!(!is_register_enabled("Pod", "p", "default", None));
        assert!(!is_register_enabled(
            "Pod",
            "p",
            "default",
            Some(&BTreeMap::new())
        ));
    }
}
