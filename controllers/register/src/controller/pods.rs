//! Pod-sourced reconciler.
//!
//! Registers one catalog entry per ready container of every enabled pod
//! and deregisters on pod deletion. The periodic sweeps list pods and
//! catalog entries and fix whatever the event stream missed.

use crate::config::ControllerConfig;
use crate::consul::AgentFactory;
use crate::controller::agents::cache_agents;
use crate::controller::pod_info::PodSnapshot;
use crate::controller::sweep::{collect_owned, deregister_unexpected_ids};
use crate::controller::RegisterReconciler;
use crate::error::ControllerError;
use crate::metrics::ControllerMetrics;
use consul_client::tags::has_label;
use consul_client::ConsulAgent;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, Client};
use kube_runtime::watcher;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Reconciles pods into Consul catalog entries.
pub struct PodController {
    client: Client,
    factory: Arc<dyn AgentFactory>,
    cfg: Arc<ControllerConfig>,
    namespace: Option<String>,
    metrics: ControllerMetrics,
    state: Mutex<PodState>,
}

/// Outcome of the per-container gates that run before an entry is built.
#[derive(Debug, PartialEq)]
enum ContainerGate {
    /// The container is the configured agent sidecar; never registered.
    SelfContainer,
    /// The allow-list annotation rejects this container.
    NotAllowed,
    Register,
}

fn container_gate(info: &PodSnapshot, container_name: &str, self_container: &str) -> ContainerGate {
    if container_name == self_container {
        ContainerGate::SelfContainer
    } else if !info.allows_container(container_name) {
        ContainerGate::NotAllowed
    } else {
        ContainerGate::Register
    }
}

/// Bookkeeping guarded by the reconciler lock. Hints only; the sweeps
/// treat the cluster and the registry as ground truth.
#[derive(Default)]
struct PodState {
    /// Pod uids this instance has seen.
    seen_pods: HashSet<String>,
    /// Container run-ids currently believed registered.
    seen_containers: HashSet<String>,
    /// Agent cache, rebuilt inside the lock on every sweep.
    agents: HashMap<String, Arc<dyn ConsulAgent>>,
}

impl PodController {
    pub fn new(
        client: Client,
        factory: Arc<dyn AgentFactory>,
        cfg: Arc<ControllerConfig>,
        namespace: Option<String>,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            client,
            factory,
            cfg,
            namespace,
            metrics,
            state: Mutex::new(PodState::default()),
        }
    }

    fn pod_api(&self) -> Api<Pod> {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn list_params(&self) -> ListParams {
        if self.cfg.pod_label_selector.is_empty() {
            ListParams::default()
        } else {
            ListParams::default().labels(&self.cfg.pod_label_selector)
        }
    }

    /// Watch events carry no server-side selector, so the configured pod
    /// label selector is applied here.
    fn skipped_by_selector(&self, pod: &Pod) -> bool {
        let selector = &self.cfg.pod_label_selector;
        if selector.is_empty() {
            return false;
        }
        let labels = pod.metadata.labels.clone().unwrap_or_default();
        if has_label(&labels, selector) {
            return false;
        }
        info!(
            "Skip pod {}. Label selector is {}, pod's labels: {:?}",
            pod.metadata.name.as_deref().unwrap_or("<unknown>"),
            selector,
            labels
        );
        true
    }

    /// Register every ready, allowed, not-yet-seen container of the pod.
    async fn apply_pod(&self, pod: &Pod, state: &mut PodState) -> Result<(), ControllerError> {
        let info = PodSnapshot::from_pod(pod);
        if !info.is_register_enabled() {
            return Ok(());
        }

        if !state.seen_pods.contains(&info.uid) {
            info!(
                "POD ADD: Name: {}, Namespace: {}, Phase: {}",
                info.name, info.namespace, info.phase
            );
            state.seen_pods.insert(info.uid.clone());
            self.metrics.pod_success.with_label_values(&["add"]).inc();
        }

        if info.phase != "Running" {
            debug!(
                "POD UPDATE: Name: {}, Namespace: {}, Phase: {}",
                info.name, info.namespace, info.phase
            );
            return Ok(());
        }

        info!(
            "POD UPDATE: Name: {}, Namespace: {}, Phase: {}, Ready: {}",
            info.name, info.namespace, info.phase, info.ready
        );

        for container in &info.container_statuses {
            match container_gate(&info, &container.name, &self.cfg.consul_container_name) {
                ContainerGate::SelfContainer => {
                    info!(
                        "Container {} name's equal to `consul_container_name` value. Skipping registering.",
                        container.name
                    );
                    continue;
                }
                ContainerGate::NotAllowed => {
                    info!(
                        "Container {} is not on list of allowed containers. Omitted.",
                        container.name
                    );
                    continue;
                }
                ContainerGate::Register => {}
            }

            let run_id = container.container_id.clone().unwrap_or_default();

            if !state.seen_containers.contains(&run_id) && container.ready {
                info!(
                    "Adding service for container {} in POD {} to consul",
                    container.name, info.name
                );
                let entry = match info.to_entry(container, &self.cfg) {
                    Ok(entry) => entry,
                    Err(e) => {
                        error!("Can't convert POD to Consul's service: {}", e);
                        self.metrics.pod_failure.with_label_values(&["update"]).inc();
                        continue;
                    }
                };
                let agent = match self.factory.agent(&info.node_name, &info.ip) {
                    Ok(agent) => agent,
                    Err(e) => {
                        error!("Can't build Consul agent client: {}", e);
                        self.metrics.pod_failure.with_label_values(&["update"]).inc();
                        continue;
                    }
                };
                match agent.register(&entry).await {
                    Ok(()) => {
                        info!(
                            "Service's been registered, Name: {}, ID: {}",
                            entry.name, entry.id
                        );
                        state.seen_containers.insert(run_id);
                        self.metrics
                            .consul_success
                            .with_label_values(&["register", agent.address()])
                            .inc();
                    }
                    Err(e) => {
                        error!("Can't register service: {}", e);
                        self.metrics
                            .consul_failure
                            .with_label_values(&["register", agent.address()])
                            .inc();
                    }
                }
            } else if state.seen_containers.contains(&run_id) && !container.ready {
                // Deregistration happens on pod delete; a not-ready
                // container is only forgotten so a later ready state
                // registers it again.
                warn!(
                    "Container {} in POD {} has status Ready:{}, RestartCount:{}",
                    container.name, info.name, container.ready, container.restart_count
                );
                state.seen_containers.remove(&run_id);
            }
        }

        self.metrics.pod_success.with_label_values(&["update"]).inc();
        Ok(())
    }

    /// Deregister every container entry of a deleted pod.
    async fn delete_pod(&self, pod: &Pod, state: &mut PodState) -> Result<(), ControllerError> {
        let info = PodSnapshot::from_pod(pod);
        if !info.is_register_enabled() {
            return Ok(());
        }

        info!(
            "POD DELETE: Name: {}, Namespace: {}, Phase: {}, Ready: {}",
            info.name, info.namespace, info.phase, info.ready
        );
        state.seen_pods.remove(&info.uid);

        for container in &info.container_statuses {
            info!(
                "Deleting service for container {} in POD {} from consul",
                container.name, info.name
            );
            let service_id = format!("{}-{}", info.name, container.name);
            let agent = match self.factory.agent(&info.node_name, &info.ip) {
                Ok(agent) => agent,
                Err(e) => {
                    error!("Can't build Consul agent client: {}", e);
                    self.metrics.pod_failure.with_label_values(&["delete"]).inc();
                    continue;
                }
            };
            match agent.deregister(&service_id).await {
                Ok(()) => {
                    info!("Service's been deregistered, ID: {}", service_id);
                    self.metrics
                        .consul_success
                        .with_label_values(&["deregister", agent.address()])
                        .inc();
                }
                Err(e) => {
                    error!("Can't deregister service: {}", e);
                    self.metrics
                        .consul_failure
                        .with_label_values(&["deregister", agent.address()])
                        .inc();
                }
            }
            if let Some(run_id) = &container.container_id {
                state.seen_containers.remove(run_id);
            }
        }

        self.metrics.pod_success.with_label_values(&["delete"]).inc();
        Ok(())
    }
}

#[async_trait::async_trait]
impl RegisterReconciler for PodController {
    async fn watch(self: Arc<Self>) -> Result<(), ControllerError> {
        info!("Starting pod watcher");

        let mut stream = Box::pin(watcher(self.pod_api(), watcher::Config::default()));

        while let Some(event) = stream
            .try_next()
            .await
            .map_err(|e| ControllerError::Watch(format!("pod watcher stream error: {}", e)))?
        {
            match event {
                watcher::Event::Apply(pod) | watcher::Event::InitApply(pod) => {
                    if self.skipped_by_selector(&pod) {
                        continue;
                    }
                    let _timer = self
                        .metrics
                        .func_duration
                        .with_label_values(&["update"])
                        .start_timer();
                    let mut state = self.state.lock().await;
                    if let Err(e) = self.apply_pod(&pod, &mut state).await {
                        error!("Failed to update pod: {}", e);
                    }
                }
                watcher::Event::Delete(pod) => {
                    if self.skipped_by_selector(&pod) {
                        continue;
                    }
                    let _timer = self
                        .metrics
                        .func_duration
                        .with_label_values(&["delete"])
                        .start_timer();
                    let mut state = self.state.lock().await;
                    if let Err(e) = self.delete_pod(&pod, &mut state).await {
                        error!("Failed to delete pod: {}", e);
                    }
                }
                watcher::Event::Init => debug!("Pod watcher initialized"),
                watcher::Event::InitDone => info!("Pod watcher initialization complete"),
            }
        }

        Ok(())
    }

    async fn sync(&self) -> Result<(), ControllerError> {
        let _timer = self
            .metrics
            .func_duration
            .with_label_values(&["sync"])
            .start_timer();
        let mut state = self.state.lock().await;

        state.agents =
            cache_agents(&self.client, &self.cfg, &self.factory, self.namespace.as_deref()).await?;
        let owned = collect_owned(&state.agents, &self.cfg.k8s_tag).await;

        let pods = self.pod_api().list(&self.list_params()).await?;
        for pod in pods.items {
            let info = PodSnapshot::from_pod(&pod);
            if !info.is_register_enabled() {
                continue;
            }

            // A container whose entry vanished from every agent is
            // forgotten, then the regular update path re-registers it.
            let mut resync = false;
            for container in &info.container_statuses {
                let service_id = format!("{}-{}", info.name, container.name);
                if !owned.by_id.contains_key(&service_id) {
                    if let Some(run_id) = &container.container_id {
                        state.seen_containers.remove(run_id);
                    }
                    resync = true;
                }
            }
            if resync {
                if let Err(e) = self.apply_pod(&pod, &mut state).await {
                    error!("Failed to sync pod {}: {}", info.name, e);
                }
            }
        }

        Ok(())
    }

    async fn clean(&self) -> Result<(), ControllerError> {
        let _timer = self
            .metrics
            .func_duration
            .with_label_values(&["clean"])
            .start_timer();
        let mut state = self.state.lock().await;

        state.agents =
            cache_agents(&self.client, &self.cfg, &self.factory, self.namespace.as_deref()).await?;
        let owned = collect_owned(&state.agents, &self.cfg.k8s_tag).await;

        let pods = self.pod_api().list(&self.list_params()).await?;
        let mut expected = HashSet::new();
        for pod in pods.items {
            let info = PodSnapshot::from_pod(&pod);
            if !info.is_register_enabled() {
                continue;
            }
            for container in &info.container_statuses {
                expected.insert(format!("{}-{}", info.name, container.name));
            }
        }

        deregister_unexpected_ids(&state.agents, &owned.by_id, &expected, &self.metrics).await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::EXPECTED_CONTAINER_NAMES_ANNOTATION;

    fn snapshot(annotations: &[(&str, &str)]) -> PodSnapshot {
        PodSnapshot {
            name: "podname".to_string(),
            annotations: annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn self_container_is_never_registered() {
        let info = snapshot(&[]);
        assert_eq!(
            container_gate(&info, "consul", "consul"),
            ContainerGate::SelfContainer
        );
        assert_eq!(
            container_gate(&info, "app", "consul"),
            ContainerGate::Register
        );
    }

    #[test]
    fn allow_list_rejects_unlisted_containers() {
        let info = snapshot(&[(EXPECTED_CONTAINER_NAMES_ANNOTATION, "app,sidecar")]);
        assert_eq!(
            container_gate(&info, "app", "consul"),
            ContainerGate::Register
        );
        assert_eq!(
            container_gate(&info, "other", "consul"),
            ContainerGate::NotAllowed
        );
        // The self-container check wins over the allow-list.
        let info = snapshot(&[(EXPECTED_CONTAINER_NAMES_ANNOTATION, "consul")]);
        assert_eq!(
            container_gate(&info, "consul", "consul"),
            ContainerGate::SelfContainer
        );
    }
}
