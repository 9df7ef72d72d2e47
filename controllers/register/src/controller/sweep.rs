//! Shared sweep scaffolding.
//!
//! Both sweeps start the same way: list every agent's services, keep the
//! owner-tagged ones, and index them by entry id and by source uid. The
//! backward sweep then deregisters indexed entries whose source object
//! is gone. Only entries carrying the owner tag ever make it into the
//! index, so nothing else can be touched.

use crate::metrics::ControllerMetrics;
use consul_client::tags::{get_service_tag, has_owner_tag};
use consul_client::ConsulAgent;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Owner-tagged entries found across all cached agents.
#[derive(Debug, Default)]
pub(crate) struct OwnedServices {
    /// entry id -> agent key it was found on
    pub by_id: HashMap<String, String>,
    /// `uid:` tag value -> entry ids carrying it
    pub by_uid: HashMap<String, Vec<String>>,
}

/// List every agent and index its owner-tagged services.
///
/// An agent that fails to answer is logged and skipped; its entries are
/// simply invisible this sweep and picked up on the next one.
pub(crate) async fn collect_owned(
    agents: &HashMap<String, Arc<dyn ConsulAgent>>,
    owner_tag: &str,
) -> OwnedServices {
    let mut owned = OwnedServices::default();

    for (agent_key, agent) in agents {
        match agent.services().await {
            Ok(services) => {
                for service in services.into_values() {
                    if !has_owner_tag(&service.tags, owner_tag) {
                        continue;
                    }
                    owned.by_id.insert(service.id.clone(), agent_key.clone());
                    let uid = get_service_tag(&service.tags, "uid");
                    owned.by_uid.entry(uid).or_default().push(service.id);
                }
            }
            Err(e) => {
                error!(
                    "Can't get services from Consul Agent {}: {}",
                    agent.address(),
                    e
                );
            }
        }
    }

    owned
}

/// Deregister every indexed entry whose uid is not expected anymore.
///
/// Entries whose recorded agent is no longer in the cache are logged and
/// skipped; without a reachable agent there is nothing to act on.
/// Returns the ids that were successfully deregistered.
pub(crate) async fn deregister_orphans(
    agents: &HashMap<String, Arc<dyn ConsulAgent>>,
    owned: &OwnedServices,
    expected_uids: &HashSet<String>,
    metrics: &ControllerMetrics,
) -> Vec<String> {
    let mut removed = Vec::new();

    for (uid, service_ids) in &owned.by_uid {
        if expected_uids.contains(uid) {
            continue;
        }
        for service_id in service_ids {
            let Some(agent) = owned.by_id.get(service_id).and_then(|key| agents.get(key)) else {
                warn!(
                    "Cannot find Consul Agent instance for service with ID: {}",
                    service_id
                );
                continue;
            };
            match agent.deregister(service_id).await {
                Ok(()) => {
                    info!("Service's been deregistered, ID: {}", service_id);
                    metrics
                        .consul_success
                        .with_label_values(&["deregister", agent.address()])
                        .inc();
                    removed.push(service_id.clone());
                }
                Err(e) => {
                    error!("Can't deregister service: {}", e);
                    metrics
                        .consul_failure
                        .with_label_values(&["deregister", agent.address()])
                        .inc();
                }
            }
        }
    }

    removed
}

/// Deregister every indexed entry whose id is not in the expected set.
/// Used by the pod variant, whose entries carry no uid tag.
pub(crate) async fn deregister_unexpected_ids(
    agents: &HashMap<String, Arc<dyn ConsulAgent>>,
    owned_by_id: &HashMap<String, String>,
    expected_ids: &HashSet<String>,
    metrics: &ControllerMetrics,
) -> Vec<String> {
    let mut removed = Vec::new();

    for (service_id, agent_key) in owned_by_id {
        if expected_ids.contains(service_id) {
            continue;
        }
        let Some(agent) = agents.get(agent_key) else {
            warn!(
                "Cannot find Consul Agent instance for service with ID: {}",
                service_id
            );
            continue;
        };
        match agent.deregister(service_id).await {
            Ok(()) => {
                info!("Service's been deregistered, ID: {}", service_id);
                metrics
                    .consul_success
                    .with_label_values(&["deregister", agent.address()])
                    .inc();
                removed.push(service_id.clone());
            }
            Err(e) => {
                error!("Can't deregister service: {}", e);
                metrics
                    .consul_failure
                    .with_label_values(&["deregister", agent.address()])
                    .inc();
            }
        }
    }

    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use consul_client::{AgentService, MockConsulAgent};

    fn service(id: &str, tags: &[&str]) -> AgentService {
        AgentService {
            id: id.to_string(),
            service: id.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    fn agent_map(agent: &MockConsulAgent, key: &str) -> HashMap<String, Arc<dyn ConsulAgent>> {
        HashMap::from([(key.to_string(), Arc::new(agent.clone()) as Arc<dyn ConsulAgent>)])
    }

    #[tokio::test]
    async fn owned_index_filters_by_owner_tag() {
        let agent = MockConsulAgent::new("localhost:8500");
        agent.add_service(service("x", &["kubernetes", "uid:U"]));
        agent.add_service(service("y", &["uid:V"]));
        agent.add_service(service("z", &["kubernetes"]));

        let agents = agent_map(&agent, "localhost");
        let owned = collect_owned(&agents, "kubernetes").await;

        assert_eq!(owned.by_id.len(), 2);
        assert!(owned.by_id.contains_key("x"));
        assert!(!owned.by_id.contains_key("y"));
        assert_eq!(owned.by_uid["U"], vec!["x".to_string()]);
        // Entries without a uid tag index under the empty string.
        assert_eq!(owned.by_uid[""], vec!["z".to_string()]);
    }

    #[tokio::test]
    async fn orphans_are_deregistered_and_foreign_entries_kept() {
        let agent = MockConsulAgent::new("localhost:8500");
        agent.add_service(service("X", &["kubernetes", "uid:U"]));
        agent.add_service(service("keep", &["uid:U"]));

        let agents = agent_map(&agent, "localhost");
        let owned = collect_owned(&agents, "kubernetes").await;
        let metrics = ControllerMetrics::new().unwrap();

        // No workload with uid U exists: the owner-tagged entry goes,
        // the entry without the owner tag is untouched.
        let removed = deregister_orphans(&agents, &owned, &HashSet::new(), &metrics).await;
        assert_eq!(removed, vec!["X".to_string()]);

        let remaining = agent.registered();
        assert!(!remaining.contains_key("X"));
        assert!(remaining.contains_key("keep"));
    }

    #[tokio::test]
    async fn expected_uids_are_kept() {
        let agent = MockConsulAgent::new("localhost:8500");
        agent.add_service(service("X", &["kubernetes", "uid:U"]));

        let agents = agent_map(&agent, "localhost");
        let owned = collect_owned(&agents, "kubernetes").await;
        let metrics = ControllerMetrics::new().unwrap();

        let expected = HashSet::from(["U".to_string()]);
        let removed = deregister_orphans(&agents, &owned, &expected, &metrics).await;
        assert!(removed.is_empty());
        assert!(agent.registered().contains_key("X"));
    }

    #[tokio::test]
    async fn missing_agent_is_skipped() {
        let agent = MockConsulAgent::new("localhost:8500");
        agent.add_service(service("X", &["kubernetes", "uid:U"]));

        let agents = agent_map(&agent, "localhost");
        let owned = collect_owned(&agents, "kubernetes").await;
        let metrics = ControllerMetrics::new().unwrap();

        // The agent disappeared from the cache between listing and cleaning.
        let empty: HashMap<String, Arc<dyn ConsulAgent>> = HashMap::new();
        let removed = deregister_orphans(&empty, &owned, &HashSet::new(), &metrics).await;
        assert!(removed.is_empty());
        assert!(agent.registered().contains_key("X"));
    }

    #[tokio::test]
    async fn unexpected_ids_are_deregistered() {
        let agent = MockConsulAgent::new("localhost:8500");
        agent.add_service(service("podname-app", &["kubernetes"]));
        agent.add_service(service("other-app", &["kubernetes"]));

        let agents = agent_map(&agent, "localhost");
        let owned = collect_owned(&agents, "kubernetes").await;
        let metrics = ControllerMetrics::new().unwrap();

        let expected = HashSet::from(["podname-app".to_string()]);
        let removed =
            deregister_unexpected_ids(&agents, &owned.by_id, &expected, &metrics).await;
        assert_eq!(removed, vec!["other-app".to_string()]);
        assert!(agent.registered().contains_key("podname-app"));
    }
}
