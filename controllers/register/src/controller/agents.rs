//! Agent cache.
//!
//! Sweeps need a mapping from agent key to client covering every agent
//! the controller may have written to. The mapping is rebuilt on every
//! sweep because node and pod membership changes over time; it must not
//! be shared or cached across reconciler instances.

use crate::config::{ControllerConfig, RegisterMode};
use crate::consul::AgentFactory;
use crate::error::ControllerError;
use consul_client::ConsulAgent;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::ListParams;
use kube::{Api, Client};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Build the agent mapping for the current register mode.
///
/// - `single`: one agent keyed by the configured address
/// - `node`: one agent per cluster node, keyed by node name
/// - `pod`: one agent per distinct pod host-ip
///
/// A failed cluster listing aborts with the error; the caller abandons
/// the current sweep and retries on the next tick.
pub(crate) async fn cache_agents(
    client: &Client,
    cfg: &ControllerConfig,
    factory: &Arc<dyn AgentFactory>,
    namespace: Option<&str>,
) -> Result<HashMap<String, Arc<dyn ConsulAgent>>, ControllerError> {
    let mut agents: HashMap<String, Arc<dyn ConsulAgent>> = HashMap::new();

    debug!(
        "Caching Consul agents, register mode={}",
        cfg.register_mode.as_str()
    );

    match cfg.register_mode {
        RegisterMode::Single => {
            agents.insert(cfg.consul_address.clone(), factory.agent("", "")?);
        }
        RegisterMode::Node => {
            let api: Api<Node> = Api::all(client.clone());
            let nodes = api.list(&list_params(&cfg.consul_node_selector)).await?;
            for node in nodes.items {
                if let Some(name) = node.metadata.name {
                    let agent = factory.agent(&name, "")?;
                    agents.insert(name, agent);
                }
            }
        }
        RegisterMode::Pod => {
            let api: Api<Pod> = match namespace {
                Some(ns) => Api::namespaced(client.clone(), ns),
                None => Api::all(client.clone()),
            };
            let pods = api.list(&list_params(&cfg.pod_label_selector)).await?;
            for pod in pods.items {
                let host_ip = pod.status.as_ref().and_then(|s| s.host_ip.clone());
                if let Some(host_ip) = host_ip {
                    // Pods sharing a node collapse to one agent.
                    if !agents.contains_key(&host_ip) {
                        let agent = factory.agent("", &host_ip)?;
                        agents.insert(host_ip, agent);
                    }
                }
            }
        }
    }

    Ok(agents)
}

fn list_params(selector: &str) -> ListParams {
    if selector.is_empty() {
        ListParams::default()
    } else {
        ListParams::default().labels(selector)
    }
}
