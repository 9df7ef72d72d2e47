//! Endpoint-sourced reconciler.
//!
//! Registers one catalog entry per endpoint address and port of every
//! enabled endpoint set. The raw watch stream only carries the new
//! object revision, so the previous revision is cached per object to
//! diff out removed addresses.

use crate::config::ControllerConfig;
use crate::consul::AgentFactory;
use crate::controller::agents::cache_agents;
use crate::controller::sweep::{collect_owned, deregister_orphans};
use crate::controller::{is_register_enabled, RegisterReconciler};
use crate::error::ControllerError;
use crate::metrics::ControllerMetrics;
use consul_client::tags::labels_to_tags;
use consul_client::{AgentServiceRegistration, ConsulAgent};
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::{EndpointAddress, EndpointPort, Endpoints, Pod};
use kube::api::ListParams;
use kube::{Api, Client};
use kube_runtime::watcher;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// Reconciles endpoint sets into Consul catalog entries.
pub struct EndpointController {
    client: Client,
    factory: Arc<dyn AgentFactory>,
    cfg: Arc<ControllerConfig>,
    namespace: Option<String>,
    metrics: ControllerMetrics,
    state: Mutex<EndpointState>,
}

#[derive(Default)]
struct EndpointState {
    /// Target-ref uids currently believed registered.
    seen_endpoints: HashSet<String>,
    /// Last observed revision per endpoints object uid, kept to diff
    /// updates against.
    last_seen: HashMap<String, Endpoints>,
    /// Agent cache, rebuilt inside the lock on every sweep.
    agents: HashMap<String, Arc<dyn ConsulAgent>>,
}

/// An address that disappeared between two revisions, with the entry ids
/// that were registered for it.
#[derive(Debug, PartialEq)]
struct RemovedTarget {
    uid: String,
    pod_name: String,
    pod_namespace: String,
    service_ids: Vec<String>,
}

/// Target-ref uids present in an endpoint set.
fn subset_target_uids(endpoints: &Endpoints) -> HashSet<String> {
    let mut uids = HashSet::new();
    for subset in endpoints.subsets.iter().flatten() {
        for address in subset.addresses.iter().flatten() {
            if let Some(uid) = address.target_ref.as_ref().and_then(|t| t.uid.clone()) {
                uids.insert(uid);
            }
        }
    }
    uids
}

/// Addresses of `old` whose target uid is absent from `new_uids`, with
/// the `<name>-<port>` ids their subset's ports produced.
fn removed_targets(old: &Endpoints, new_uids: &HashSet<String>) -> Vec<RemovedTarget> {
    let mut removed = Vec::new();
    for subset in old.subsets.iter().flatten() {
        for address in subset.addresses.iter().flatten() {
            let Some(target) = address.target_ref.as_ref() else {
                continue;
            };
            let (Some(uid), Some(name)) = (target.uid.clone(), target.name.clone()) else {
                continue;
            };
            if new_uids.contains(&uid) {
                continue;
            }
            let service_ids = subset
                .ports
                .iter()
                .flatten()
                .map(|port| format!("{}-{}", name, port.port))
                .collect();
            removed.push(RemovedTarget {
                uid,
                pod_name: name,
                pod_namespace: target.namespace.clone().unwrap_or_default(),
                service_ids,
            });
        }
    }
    removed
}

/// Catalog entry for one address and port of an endpoint set.
fn build_entry(
    endpoints: &Endpoints,
    address: &EndpointAddress,
    port: &EndpointPort,
    owner_tag: &str,
) -> AgentServiceRegistration {
    let target = address.target_ref.as_ref();
    let target_name = target
        .and_then(|t| t.name.clone())
        .unwrap_or_default();
    let target_uid = target.and_then(|t| t.uid.clone()).unwrap_or_default();

    let mut tags = vec![owner_tag.to_string(), format!("uid:{}", target_uid)];
    tags.extend(labels_to_tags(
        &endpoints.metadata.labels.clone().unwrap_or_default(),
    ));

    AgentServiceRegistration {
        id: format!("{}-{}", target_name, port.port),
        name: endpoints.metadata.name.clone().unwrap_or_default(),
        tags,
        address: address.ip.clone(),
        port: u16::try_from(port.port).unwrap_or(0),
        ..Default::default()
    }
}

impl EndpointController {
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
            state: Mutex::new(EndpointState::default()),
        }
    }

    fn watch_api(&self) -> Api<Endpoints> {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn enabled(&self, endpoints: &Endpoints) -> bool {
        is_register_enabled(
            "Endpoints",
            endpoints.metadata.name.as_deref().unwrap_or("<unknown>"),
            endpoints.metadata.namespace.as_deref().unwrap_or("<unknown>"),
            endpoints.metadata.annotations.as_ref(),
        )
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ControllerError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    /// Deregister one entry on the agent scoped to the given placement.
    async fn deregister_id(&self, node_name: &str, pod_ip: &str, service_id: &str) {
        let agent = match self.factory.agent(node_name, pod_ip) {
            Ok(agent) => agent,
            Err(e) => {
                error!("Can't build Consul agent client: {}", e);
                self.metrics.pod_failure.with_label_values(&["delete"]).inc();
                return;
            }
        };
        match agent.deregister(service_id).await {
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
    }

    /// Deregister entries of vanished addresses, then register every
    /// unseen address of the new revision.
    async fn update_endpoints(
        &self,
        old: Option<&Endpoints>,
        new: &Endpoints,
        state: &mut EndpointState,
    ) -> Result<(), ControllerError> {
        let new_uids = subset_target_uids(new);

        if let Some(old) = old {
            for removed in removed_targets(old, &new_uids) {
                info!(
                    "Deletion of endpoint with UID {} (POD: {})",
                    removed.uid, removed.pod_name
                );
                let pod = self
                    .get_pod(&removed.pod_namespace, &removed.pod_name)
                    .await?;
                let node_name = pod.spec.and_then(|s| s.node_name).unwrap_or_default();
                let pod_ip = pod
                    .status
                    .and_then(|s| s.pod_ip)
                    .unwrap_or_default();
                for service_id in &removed.service_ids {
                    self.deregister_id(&node_name, &pod_ip, service_id).await;
                }
                state.seen_endpoints.remove(&removed.uid);
            }
        }

        for subset in new.subsets.iter().flatten() {
            for address in subset.addresses.iter().flatten() {
                let Some(target) = address.target_ref.as_ref() else {
                    continue;
                };
                let (Some(uid), Some(name)) = (target.uid.clone(), target.name.clone()) else {
                    continue;
                };
                if state.seen_endpoints.contains(&uid) {
                    continue;
                }

                let pod = self
                    .get_pod(target.namespace.as_deref().unwrap_or_default(), &name)
                    .await?;
                let node_name = pod.spec.and_then(|s| s.node_name).unwrap_or_default();
                let pod_ip = pod.status.and_then(|s| s.pod_ip).unwrap_or_default();

                for port in subset.ports.iter().flatten() {
                    let entry = build_entry(new, address, port, &self.cfg.k8s_tag);
                    let agent = match self.factory.agent(&node_name, &pod_ip) {
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
                            state.seen_endpoints.insert(uid.clone());
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
                }
            }
        }

        self.metrics.pod_success.with_label_values(&["update"]).inc();
        Ok(())
    }

    /// Deregister every entry of a deleted endpoint set.
    async fn delete_endpoints(
        &self,
        endpoints: &Endpoints,
        state: &mut EndpointState,
    ) -> Result<(), ControllerError> {
        for subset in endpoints.subsets.iter().flatten() {
            for address in subset.addresses.iter().flatten() {
                let Some(target) = address.target_ref.as_ref() else {
                    continue;
                };
                let (Some(uid), Some(name)) = (target.uid.clone(), target.name.clone()) else {
                    continue;
                };
                info!("Deletion of endpoint with UID {} (POD: {})", uid, name);

                let pod = self
                    .get_pod(target.namespace.as_deref().unwrap_or_default(), &name)
                    .await?;
                let node_name = pod.spec.and_then(|s| s.node_name).unwrap_or_default();
                let pod_ip = pod.status.and_then(|s| s.pod_ip).unwrap_or_default();

                for port in subset.ports.iter().flatten() {
                    let service_id = format!("{}-{}", name, port.port);
                    self.deregister_id(&node_name, &pod_ip, &service_id).await;
                }
                state.seen_endpoints.remove(&uid);
            }
        }

        self.metrics.pod_success.with_label_values(&["delete"]).inc();
        Ok(())
    }
}

#[async_trait::async_trait]
impl RegisterReconciler for EndpointController {
    async fn watch(self: Arc<Self>) -> Result<(), ControllerError> {
        info!("Starting endpoints watcher");

        let mut stream = Box::pin(watcher(self.watch_api(), watcher::Config::default()));

        while let Some(event) = stream.try_next().await.map_err(|e| {
            ControllerError::Watch(format!("endpoints watcher stream error: {}", e))
        })? {
            match event {
                watcher::Event::Apply(endpoints) | watcher::Event::InitApply(endpoints) => {
                    if !self.enabled(&endpoints) {
                        continue;
                    }
                    let _timer = self
                        .metrics
                        .func_duration
                        .with_label_values(&["update"])
                        .start_timer();
                    let uid = endpoints.metadata.uid.clone().unwrap_or_default();
                    let mut state = self.state.lock().await;
                    let old = state.last_seen.insert(uid, endpoints.clone());
                    if let Err(e) = self
                        .update_endpoints(old.as_ref(), &endpoints, &mut state)
                        .await
                    {
                        error!("Failed to update endpoints: {}", e);
                    }
                }
                watcher::Event::Delete(endpoints) => {
                    if !self.enabled(&endpoints) {
                        continue;
                    }
                    let _timer = self
                        .metrics
                        .func_duration
                        .with_label_values(&["delete"])
                        .start_timer();
                    let uid = endpoints.metadata.uid.clone().unwrap_or_default();
                    let mut state = self.state.lock().await;
                    state.last_seen.remove(&uid);
                    if let Err(e) = self.delete_endpoints(&endpoints, &mut state).await {
                        error!("Failed to delete endpoints: {}", e);
                    }
                }
                watcher::Event::Init => debug!("Endpoints watcher initialized"),
                watcher::Event::InitDone => info!("Endpoints watcher initialization complete"),
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

        state.agents = cache_agents(&self.client, &self.cfg, &self.factory, None).await?;
        let owned = collect_owned(&state.agents, &self.cfg.k8s_tag).await;

        let endpoints: Api<Endpoints> = Api::all(self.client.clone());
        for ep in endpoints.list(&ListParams::default()).await?.items {
            if !self.enabled(&ep) {
                continue;
            }

            // Forget addresses whose entries vanished so the update path
            // registers them again.
            for subset in ep.subsets.iter().flatten() {
                for address in subset.addresses.iter().flatten() {
                    let Some(target) = address.target_ref.as_ref() else {
                        continue;
                    };
                    let (Some(uid), Some(name)) = (target.uid.as_ref(), target.name.as_ref())
                    else {
                        continue;
                    };
                    let missing = subset.ports.iter().flatten().any(|port| {
                        !owned.by_id.contains_key(&format!("{}-{}", name, port.port))
                    });
                    if missing {
                        state.seen_endpoints.remove(uid);
                    }
                }
            }

            if let Err(e) = self.update_endpoints(None, &ep, &mut state).await {
                error!(
                    "Failed to sync endpoint {}: {}",
                    ep.metadata.name.as_deref().unwrap_or("<unknown>"),
                    e
                );
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

        state.agents = cache_agents(&self.client, &self.cfg, &self.factory, None).await?;
        let owned = collect_owned(&state.agents, &self.cfg.k8s_tag).await;

        let endpoints: Api<Endpoints> = Api::all(self.client.clone());
        let mut expected = HashSet::new();
        for ep in endpoints.list(&ListParams::default()).await?.items {
            if !self.enabled(&ep) {
                continue;
            }
            expected.extend(subset_target_uids(&ep));
        }

        deregister_orphans(&state.agents, &owned, &expected, &self.metrics).await;

        for uid in owned.by_uid.keys() {
            if !expected.contains(uid) {
                state.seen_endpoints.remove(uid);
            }
        }

        Ok(())
    }
}
