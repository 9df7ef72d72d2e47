//! Service-sourced reconciler.
//!
//! Registers one catalog entry per reachable node address and TCP port
//! of every enabled exposed service. Because the reachable address set
//! depends on cluster membership, a node watch runs next to the service
//! watch: a new node re-derives every enabled service, a deleted node
//! removes the entries that pointed at it.

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
use k8s_openapi::api::core::v1::{Node, Service};
use kube::api::ListParams;
use kube::{Api, Client};
use kube_runtime::watcher;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// Reconciles exposed services into Consul catalog entries.
pub struct ServiceController {
    client: Client,
    factory: Arc<dyn AgentFactory>,
    cfg: Arc<ControllerConfig>,
    namespace: Option<String>,
    metrics: ControllerMetrics,
    state: Mutex<ServiceState>,
}

#[derive(Default)]
struct ServiceState {
    /// Entry ids currently believed registered.
    seen_entries: HashSet<String>,
    /// Node uids already processed, so node status churn does not
    /// re-derive every service.
    seen_nodes: HashSet<String>,
    /// Agent cache, rebuilt inside the lock on every sweep.
    agents: HashMap<String, Arc<dyn ConsulAgent>>,
}

/// External and internal addresses of the given nodes.
fn node_addresses(nodes: &[Node]) -> Vec<String> {
    let mut addresses = Vec::new();
    for node in nodes {
        for address in node
            .status
            .iter()
            .flat_map(|s| s.addresses.iter().flatten())
        {
            if address.type_ == "ExternalIP" || address.type_ == "InternalIP" {
                addresses.push(address.address.clone());
            }
        }
    }
    addresses
}

/// The catalog entries an exposed service should have, given the current
/// node address set. Only TCP ports participate.
///
/// `NodePort` services use their declared external ips, or all node
/// addresses when none are declared. `ClusterIP` services participate
/// only with explicit external ips. Other service types produce nothing.
fn service_entries(
    service: &Service,
    node_ips: &[String],
    owner_tag: &str,
) -> Vec<AgentServiceRegistration> {
    let Some(spec) = service.spec.as_ref() else {
        return Vec::new();
    };
    let external_ips = spec.external_ips.clone().unwrap_or_default();

    let addresses = match spec.type_.as_deref() {
        Some("NodePort") => {
            if external_ips.is_empty() {
                node_ips.to_vec()
            } else {
                external_ips
            }
        }
        Some("ClusterIP") => {
            if external_ips.is_empty() {
                return Vec::new();
            }
            external_ips
        }
        _ => return Vec::new(),
    };

    let ports: Vec<i32> = spec
        .ports
        .iter()
        .flatten()
        .filter(|port| port.protocol.as_deref().unwrap_or("TCP") == "TCP")
        .map(|port| port.node_port.unwrap_or(0))
        .collect();

    let name = service.metadata.name.clone().unwrap_or_default();
    let uid = service.metadata.uid.clone().unwrap_or_default();
    let mut base_tags = vec![owner_tag.to_string(), format!("uid:{}", uid)];
    base_tags.extend(labels_to_tags(
        &service.metadata.labels.clone().unwrap_or_default(),
    ));

    let mut entries = Vec::new();
    for address in &addresses {
        for port in &ports {
            entries.push(AgentServiceRegistration {
                id: format!("{}-{}-{}-{}", name, uid, address, port),
                name: name.clone(),
                tags: base_tags.clone(),
                address: address.clone(),
                port: u16::try_from(*port).unwrap_or(0),
                ..Default::default()
            });
        }
    }
    entries
}

impl ServiceController {
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
            state: Mutex::new(ServiceState::default()),
        }
    }

    fn service_api(&self) -> Api<Service> {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn enabled(&self, service: &Service) -> bool {
        is_register_enabled(
            "Service",
            service.metadata.name.as_deref().unwrap_or("<unknown>"),
            service.metadata.namespace.as_deref().unwrap_or("<unknown>"),
            service.metadata.annotations.as_ref(),
        )
    }

    async fn node_ips(&self) -> Result<Vec<String>, ControllerError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await?;
        Ok(node_addresses(&nodes.items))
    }

    /// Register every not-yet-seen entry the service should have.
    async fn add_service(
        &self,
        service: &Service,
        node_ips: &[String],
        state: &mut ServiceState,
    ) {
        let name = service.metadata.name.as_deref().unwrap_or("<unknown>");
        for entry in service_entries(service, node_ips, &self.cfg.k8s_tag) {
            if state.seen_entries.contains(&entry.id) {
                debug!("Service {} has already been registered in Consul", entry.id);
                continue;
            }
            let agent = match self.factory.agent(&entry.address, "") {
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
                        "Service {} has been registered in Consul with ID: {}",
                        name, entry.id
                    );
                    state.seen_entries.insert(entry.id);
                    self.metrics
                        .consul_success
                        .with_label_values(&["register", agent.address()])
                        .inc();
                }
                Err(e) => {
                    error!("Cannot register service in Consul: {}", e);
                    self.metrics
                        .consul_failure
                        .with_label_values(&["register", agent.address()])
                        .inc();
                }
            }
        }
    }

    /// Deregister every present entry of the service.
    async fn delete_service(
        &self,
        service: &Service,
        node_ips: &[String],
        state: &mut ServiceState,
    ) {
        let name = service.metadata.name.as_deref().unwrap_or("<unknown>");
        for entry in service_entries(service, node_ips, &self.cfg.k8s_tag) {
            if !state.seen_entries.contains(&entry.id) {
                debug!("Service {} has already been deleted in Consul", entry.id);
                continue;
            }
            let agent = match self.factory.agent(&entry.address, "") {
                Ok(agent) => agent,
                Err(e) => {
                    error!("Can't build Consul agent client: {}", e);
                    self.metrics.pod_failure.with_label_values(&["delete"]).inc();
                    continue;
                }
            };
            match agent.deregister(&entry.id).await {
                Ok(()) => {
                    info!(
                        "Service {} has been deregistered in Consul with ID: {}",
                        name, entry.id
                    );
                    state.seen_entries.remove(&entry.id);
                    self.metrics
                        .consul_success
                        .with_label_values(&["deregister", agent.address()])
                        .inc();
                }
                Err(e) => {
                    error!("Cannot deregister service in Consul: {}", e);
                    self.metrics
                        .consul_failure
                        .with_label_values(&["deregister", agent.address()])
                        .inc();
                }
            }
        }
    }

    /// Whether any seen entry belongs to this service.
    fn has_seen_entries(&self, service: &Service, state: &ServiceState) -> bool {
        let name = service.metadata.name.clone().unwrap_or_default();
        let uid = service.metadata.uid.clone().unwrap_or_default();
        let prefix = format!("{}-{}-", name, uid);
        state.seen_entries.iter().any(|id| id.starts_with(&prefix))
    }

    /// Remove entries that pointed at a deleted node: every indexed
    /// entry whose id embeds one of the node's addresses.
    async fn node_delete(&self, node: &Node, state: &mut ServiceState) -> Result<(), ControllerError> {
        state.agents = cache_agents(&self.client, &self.cfg, &self.factory, None).await?;
        let owned = collect_owned(&state.agents, &self.cfg.k8s_tag).await;

        let addresses = node_addresses(std::slice::from_ref(node));

        for (service_id, agent_key) in &owned.by_id {
            let matches_node = addresses
                .iter()
                .any(|address| service_id.contains(&format!("-{}-", address)));
            if !matches_node {
                continue;
            }
            let Some(agent) = state.agents.get(agent_key) else {
                continue;
            };
            match agent.deregister(service_id).await {
                Ok(()) => {
                    info!(
                        "Service has been deregistered in Consul with ID: {}",
                        service_id
                    );
                    state.seen_entries.remove(service_id);
                    self.metrics
                        .consul_success
                        .with_label_values(&["deregister", agent.address()])
                        .inc();
                }
                Err(e) => {
                    error!("Cannot deregister service in Consul: {}", e);
                    self.metrics
                        .consul_failure
                        .with_label_values(&["deregister", agent.address()])
                        .inc();
                }
            }
        }

        Ok(())
    }

    async fn watch_services(self: Arc<Self>) -> Result<(), ControllerError> {
        info!("Starting service watcher");

        let mut stream = Box::pin(watcher(self.service_api(), watcher::Config::default()));

        while let Some(event) = stream.try_next().await.map_err(|e| {
            ControllerError::Watch(format!("service watcher stream error: {}", e))
        })? {
            match event {
                watcher::Event::Apply(service) | watcher::Event::InitApply(service) => {
                    let _timer = self
                        .metrics
                        .func_duration
                        .with_label_values(&["update"])
                        .start_timer();
                    let mut state = self.state.lock().await;
                    if self.enabled(&service) {
                        match self.node_ips().await {
                            Ok(node_ips) => {
                                self.add_service(&service, &node_ips, &mut state).await
                            }
                            Err(e) => error!("Failed to list nodes: {}", e),
                        }
                    } else if self.has_seen_entries(&service, &state) {
                        // An update flipped `enabled` off: drop the entries.
                        match self.node_ips().await {
                            Ok(node_ips) => {
                                self.delete_service(&service, &node_ips, &mut state).await
                            }
                            Err(e) => error!("Failed to list nodes: {}", e),
                        }
                    }
                }
                watcher::Event::Delete(service) => {
                    if !self.enabled(&service) {
                        continue;
                    }
                    let _timer = self
                        .metrics
                        .func_duration
                        .with_label_values(&["delete"])
                        .start_timer();
                    let mut state = self.state.lock().await;
                    match self.node_ips().await {
                        Ok(node_ips) => {
                            self.delete_service(&service, &node_ips, &mut state).await
                        }
                        Err(e) => error!("Failed to list nodes: {}", e),
                    }
                }
                watcher::Event::Init => debug!("Service watcher initialized"),
                watcher::Event::InitDone => info!("Service watcher initialization complete"),
            }
        }

        Ok(())
    }

    async fn watch_nodes(self: Arc<Self>) -> Result<(), ControllerError> {
        info!("Starting node watcher");

        let api: Api<Node> = Api::all(self.client.clone());
        let mut stream = Box::pin(watcher(api, watcher::Config::default()));

        while let Some(event) = stream
            .try_next()
            .await
            .map_err(|e| ControllerError::Watch(format!("node watcher stream error: {}", e)))?
        {
            match event {
                watcher::Event::Apply(node) | watcher::Event::InitApply(node) => {
                    let uid = node.metadata.uid.clone().unwrap_or_default();
                    let mut state = self.state.lock().await;
                    // Nodes heartbeat constantly; only a genuinely new
                    // node enlarges the address set.
                    if !state.seen_nodes.insert(uid) {
                        continue;
                    }
                    info!(
                        "Node added: {}",
                        node.metadata.name.as_deref().unwrap_or("<unknown>")
                    );
                    let node_ips = match self.node_ips().await {
                        Ok(node_ips) => node_ips,
                        Err(e) => {
                            error!("Failed to list nodes: {}", e);
                            continue;
                        }
                    };
                    let services = match self.service_api().list(&ListParams::default()).await {
                        Ok(services) => services,
                        Err(e) => {
                            error!("Failed to list services: {}", e);
                            continue;
                        }
                    };
                    for service in services.items {
                        if !self.enabled(&service) {
                            continue;
                        }
                        self.add_service(&service, &node_ips, &mut state).await;
                    }
                }
                watcher::Event::Delete(node) => {
                    info!(
                        "Node deleted: {}",
                        node.metadata.name.as_deref().unwrap_or("<unknown>")
                    );
                    let _timer = self
                        .metrics
                        .func_duration
                        .with_label_values(&["delete"])
                        .start_timer();
                    let mut state = self.state.lock().await;
                    if let Some(uid) = &node.metadata.uid {
                        state.seen_nodes.remove(uid);
                    }
                    if let Err(e) = self.node_delete(&node, &mut state).await {
                        error!("Failed to clean up after node deletion: {}", e);
                    }
                }
                watcher::Event::Init => debug!("Node watcher initialized"),
                watcher::Event::InitDone => info!("Node watcher initialization complete"),
            }
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl RegisterReconciler for ServiceController {
    async fn watch(self: Arc<Self>) -> Result<(), ControllerError> {
        let services = tokio::spawn(self.clone().watch_services());
        let nodes = tokio::spawn(self.clone().watch_nodes());

        tokio::select! {
            result = services => match result {
                Ok(result) => result,
                Err(e) => Err(ControllerError::Watch(format!("service watcher task failed: {}", e))),
            },
            result = nodes => match result {
                Ok(result) => result,
                Err(e) => Err(ControllerError::Watch(format!("node watcher task failed: {}", e))),
            },
        }
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

        let node_ips = self.node_ips().await?;
        let services = self.service_api().list(&ListParams::default()).await?;
        for service in services.items {
            if !self.enabled(&service) {
                continue;
            }

            let entries = service_entries(&service, &node_ips, &self.cfg.k8s_tag);
            let missing: Vec<&AgentServiceRegistration> = entries
                .iter()
                .filter(|entry| !owned.by_id.contains_key(&entry.id))
                .collect();
            if missing.is_empty() {
                continue;
            }
            for entry in missing {
                state.seen_entries.remove(&entry.id);
            }
            self.add_service(&service, &node_ips, &mut state).await;
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

        let services = self.service_api().list(&ListParams::default()).await?;
        let mut expected = HashSet::new();
        for service in services.items {
            if !self.enabled(&service) {
                continue;
            }
            if let Some(uid) = &service.metadata.uid {
                expected.insert(uid.clone());
            }
        }

        let removed = deregister_orphans(&state.agents, &owned, &expected, &self.metrics).await;
        for service_id in removed {
            state.seen_entries.remove(&service_id);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeAddress, NodeStatus, ServicePort, ServiceSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn node(external: Option<&str>, internal: Option<&str>) -> Node {
        let mut addresses = Vec::new();
        if let Some(ip) = external {
            addresses.push(NodeAddress {
                type_: "ExternalIP".to_string(),
                address: ip.to_string(),
            });
        }
        if let Some(ip) = internal {
            addresses.push(NodeAddress {
                type_: "InternalIP".to_string(),
                address: ip.to_string(),
            });
        }
        Node {
            status: Some(NodeStatus {
                addresses: Some(addresses),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn node_port_service(external_ips: Vec<&str>) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                uid: Some("U1".to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("NodePort".to_string()),
                external_ips: if external_ips.is_empty() {
                    None
                } else {
                    Some(external_ips.iter().map(|s| s.to_string()).collect())
                },
                ports: Some(vec![
                    ServicePort {
                        protocol: Some("TCP".to_string()),
                        node_port: Some(30080),
                        ..Default::default()
                    },
                    ServicePort {
                        protocol: Some("UDP".to_string()),
                        node_port: Some(30053),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn node_addresses_collects_external_and_internal() {
        let nodes = vec![node(Some("1.2.3.4"), Some("10.0.0.1")), node(None, Some("10.0.0.2"))];
        assert_eq!(node_addresses(&nodes), vec!["1.2.3.4", "10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn node_port_service_uses_node_addresses_and_tcp_ports_only() {
        let svc = node_port_service(vec![]);
        let entries = service_entries(
            &svc,
            &["10.0.0.1".to_string(), "10.0.0.2".to_string()],
            "kubernetes",
        );

        let ids: Vec<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["web-U1-10.0.0.1-30080", "web-U1-10.0.0.2-30080"]);
        for entry in &entries {
            assert_eq!(entry.port, 30080);
            assert!(entry.tags.contains(&"kubernetes".to_string()));
            assert!(entry.tags.contains(&"uid:U1".to_string()));
        }
    }

    #[test]
    fn declared_external_ips_win_over_node_addresses() {
        let svc = node_port_service(vec!["5.6.7.8"]);
        let entries = service_entries(&svc, &["10.0.0.1".to_string()], "kubernetes");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].address, "5.6.7.8");
    }

    #[test]
    fn cluster_ip_without_external_ips_is_skipped() {
        let mut svc = node_port_service(vec![]);
        svc.spec.as_mut().unwrap().type_ = Some("ClusterIP".to_string());
        assert!(service_entries(&svc, &["10.0.0.1".to_string()], "kubernetes").is_empty());

        svc.spec.as_mut().unwrap().external_ips = Some(vec!["5.6.7.8".to_string()]);
        let entries = service_entries(&svc, &["10.0.0.1".to_string()], "kubernetes");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].address, "5.6.7.8");
    }

    #[test]
    fn other_service_types_produce_nothing() {
        let mut svc = node_port_service(vec![]);
        svc.spec.as_mut().unwrap().type_ = Some("LoadBalancer".to_string());
        assert!(service_entries(&svc, &["10.0.0.1".to_string()], "kubernetes").is_empty());
    }
}
