//! Workload snapshot and pod-sourced entry building.
//!
//! A `PodSnapshot` is an ephemeral, read-only extract of one pod taken
//! at event entry. It carries everything the entry builder needs:
//! identity, placement, readiness, labels, annotations and the container
//! lists from spec and status.

use crate::config::ControllerConfig;
use crate::controller::{
    CREATED_BY_ANNOTATION, EXPECTED_CONTAINER_NAMES_ANNOTATION, SERVICE_META_PREFIX_ANNOTATION,
    SERVICE_NAME_ANNOTATION,
};
use crate::error::ControllerError;
use consul_client::tags::labels_to_tags;
use consul_client::{AgentServiceCheck, AgentServiceRegistration};
use k8s_openapi::api::core::v1::{Container, ContainerStatus, Pod, Probe};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// The reference stored in the `kubernetes.io/created-by` annotation.
#[derive(Debug, Deserialize)]
struct SerializedReference {
    reference: ControllerReference,
}

#[derive(Debug, Deserialize)]
struct ControllerReference {
    name: String,
}

/// Read-only, per-event extract of a pod.
#[derive(Debug, Clone, Default)]
pub struct PodSnapshot {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub phase: String,
    pub ip: String,
    pub node_name: String,
    pub ready: bool,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub containers: Vec<Container>,
    pub container_statuses: Vec<ContainerStatus>,
}

impl PodSnapshot {
    pub fn from_pod(pod: &Pod) -> Self {
        let meta = &pod.metadata;
        let spec = pod.spec.as_ref();
        let status = pod.status.as_ref();

        let ready = status
            .and_then(|s| s.conditions.as_ref())
            .map(|conditions| {
                conditions
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            })
            .unwrap_or(false);

        Self {
            uid: meta.uid.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
            namespace: meta.namespace.clone().unwrap_or_default(),
            phase: status
                .and_then(|s| s.phase.clone())
                .unwrap_or_default(),
            ip: status.and_then(|s| s.pod_ip.clone()).unwrap_or_default(),
            node_name: spec.and_then(|s| s.node_name.clone()).unwrap_or_default(),
            ready,
            labels: meta.labels.clone().unwrap_or_default(),
            annotations: meta.annotations.clone().unwrap_or_default(),
            containers: spec.map(|s| s.containers.clone()).unwrap_or_default(),
            container_statuses: status
                .and_then(|s| s.container_statuses.clone())
                .unwrap_or_default(),
        }
    }

    pub fn is_register_enabled(&self) -> bool {
        crate::controller::is_register_enabled(
            "Pod",
            &self.name,
            &self.namespace,
            Some(&self.annotations),
        )
    }

    /// Whether the container allow-list annotation admits this container.
    /// An absent annotation admits every container.
    pub fn allows_container(&self, container_name: &str) -> bool {
        match self.annotations.get(EXPECTED_CONTAINER_NAMES_ANNOTATION) {
            Some(value) => value.split(',').any(|name| name.trim() == container_name),
            None => true,
        }
    }

    /// Build the catalog entry for one container of this pod.
    ///
    /// Callers gate on enablement, self-container and the allow-list
    /// before calling; this fails only when the container declares no
    /// port, which skips the container but not the pod.
    pub fn to_entry(
        &self,
        container: &ContainerStatus,
        cfg: &ControllerConfig,
    ) -> Result<AgentServiceRegistration, ControllerError> {
        let port = self.container_port(&container.name);
        if port == 0 {
            return Err(ControllerError::InvalidEntry(format!(
                "container {} in pod {} declares no port",
                container.name, self.name
            )));
        }

        let mut tags = self.entry_tags(&container.name);
        tags.push(cfg.k8s_tag.clone());

        let check = self.probe_to_check(self.liveness_probe(&container.name));

        Ok(AgentServiceRegistration {
            id: format!("{}-{}", self.name, container.name),
            name: self.entry_name(),
            tags,
            address: self.ip.clone(),
            port,
            meta: self.meta(),
            check: if check.is_empty() { None } else { Some(check) },
        })
    }

    /// Entry name: the `service.name` annotation, else the name of the
    /// controller reference from the `created-by` annotation, else the
    /// pod's own name.
    fn entry_name(&self) -> String {
        if let Some(name) = self.annotations.get(SERVICE_NAME_ANNOTATION) {
            return name.clone();
        }
        match self.controller_reference() {
            Some(reference) => reference.name,
            None => self.name.clone(),
        }
    }

    fn controller_reference(&self) -> Option<ControllerReference> {
        let raw = self.annotations.get(CREATED_BY_ANNOTATION)?;
        match serde_json::from_str::<SerializedReference>(raw) {
            Ok(sr) => Some(sr.reference),
            Err(e) => {
                debug!("Pod {} has unparsable created-by annotation: {}", self.name, e);
                None
            }
        }
    }

    fn entry_tags(&self, container_name: &str) -> Vec<String> {
        let mut tags = vec![
            self.name.clone(),
            format!("pod:{}", self.name),
            format!("node:{}", self.node_name),
            format!("container:{}", container_name),
        ];
        tags.extend(labels_to_tags(&self.labels));
        tags
    }

    /// Meta from `service.meta.<k>` annotations, prefix stripped.
    fn meta(&self) -> HashMap<String, String> {
        self.annotations
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(SERVICE_META_PREFIX_ANNOTATION)
                    .map(|k| (k.to_string(), value.clone()))
            })
            .collect()
    }

    /// First declared port of the named spec container, or 0.
    fn container_port(&self, container_name: &str) -> u16 {
        for container in &self.containers {
            if container.name == container_name {
                if let Some(port) = container.ports.as_ref().and_then(|p| p.first()) {
                    return u16::try_from(port.container_port).unwrap_or(0);
                }
            }
        }
        warn!("Container {} hasn't set ContainerPort", container_name);
        0
    }

    fn liveness_probe(&self, container_name: &str) -> Option<&Probe> {
        self.containers
            .iter()
            .find(|c| c.name == container_name)
            .and_then(|c| c.liveness_probe.as_ref())
    }

    /// Translate a liveness probe into a Consul check.
    ///
    /// Absent and exec probes produce an empty check. HTTP and TCP
    /// handlers target the pod ip unless the probe overrides the host.
    fn probe_to_check(&self, probe: Option<&Probe>) -> AgentServiceCheck {
        let mut check = AgentServiceCheck::default();

        let Some(probe) = probe else {
            return check;
        };
        if probe.exec.is_some() {
            return check;
        }

        check.status = Some("passing".to_string());
        check.interval = Some(format!("{}s", probe.period_seconds.unwrap_or(0)));
        check.timeout = Some(format!("{}s", probe.timeout_seconds.unwrap_or(0)));

        let mut host = self.ip.clone();

        if let Some(http) = &probe.http_get {
            if let Some(probe_host) = &http.host {
                if !probe_host.is_empty() {
                    host = probe_host.clone();
                }
            }
            let scheme = http
                .scheme
                .as_deref()
                .filter(|s| !s.is_empty())
                .unwrap_or("http")
                .to_lowercase();
            check.http = Some(format!(
                "{}://{}:{}{}",
                scheme,
                host,
                port_number(&http.port),
                http.path.as_deref().unwrap_or("")
            ));
        } else if let Some(tcp) = &probe.tcp_socket {
            check.tcp = Some(format!("{}:{}", host, port_number(&tcp.port)));
        }

        check
    }
}

/// Numeric value of a probe port; named ports cannot be resolved here
/// and count as 0.
fn port_number(port: &IntOrString) -> i32 {
    match port {
        IntOrString::Int(value) => *value,
        IntOrString::String(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerPort, HTTPGetAction, PodCondition, PodSpec, PodStatus, TCPSocketAction,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn string_map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn test_pod() -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("podname".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("pod-uid-1".to_string()),
                labels: Some(string_map(&[("production", "tag"), ("app", "web")])),
                annotations: Some(string_map(&[
                    ("consul.register/enabled", "true"),
                    ("consul.register/service.name", "svc"),
                    ("consul.register/service.meta.env", "prod"),
                ])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("n1".to_string()),
                containers: vec![Container {
                    name: "app".to_string(),
                    ports: Some(vec![ContainerPort {
                        container_port: 8080,
                        ..Default::default()
                    }]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                pod_ip: Some("10.0.0.5".to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                container_statuses: Some(vec![ContainerStatus {
                    name: "app".to_string(),
                    ready: true,
                    container_id: Some("docker://abc".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    fn test_config() -> ControllerConfig {
        ControllerConfig::from_map(&BTreeMap::new()).unwrap()
    }

    #[test]
    fn pod_converts_to_entry() {
        let info = PodSnapshot::from_pod(&test_pod());
        assert!(info.is_register_enabled());
        assert!(info.ready);

        let container = info.container_statuses[0].clone();
        let entry = info.to_entry(&container, &test_config()).unwrap();

        assert_eq!(entry.id, "podname-app");
        assert_eq!(entry.name, "svc");
        assert_eq!(entry.address, "10.0.0.5");
        assert_eq!(entry.port, 8080);
        assert_eq!(entry.meta, HashMap::from([("env".to_string(), "prod".to_string())]));

        for expected in [
            "podname",
            "pod:podname",
            "node:n1",
            "container:app",
            "production",
            "app:web",
            "kubernetes",
        ] {
            assert!(entry.tags.contains(&expected.to_string()), "missing tag {}", expected);
        }
    }

    #[test]
    fn entry_name_falls_back_to_created_by_reference() {
        let mut pod = test_pod();
        let annotations = pod.metadata.annotations.as_mut().unwrap();
        annotations.remove("consul.register/service.name");
        annotations.insert(
            CREATED_BY_ANNOTATION.to_string(),
            r#"{"kind":"SerializedReference","reference":{"kind":"ReplicaSet","name":"web-rs"}}"#
                .to_string(),
        );

        let info = PodSnapshot::from_pod(&pod);
        let entry = info
            .to_entry(&info.container_statuses[0].clone(), &test_config())
            .unwrap();
        assert_eq!(entry.name, "web-rs");

        // Unparsable reference falls back to the pod name.
        pod.metadata
            .annotations
            .as_mut()
            .unwrap()
            .insert(CREATED_BY_ANNOTATION.to_string(), "{broken".to_string());
        let info = PodSnapshot::from_pod(&pod);
        let entry = info
            .to_entry(&info.container_statuses[0].clone(), &test_config())
            .unwrap();
        assert_eq!(entry.name, "podname");
    }

    #[test]
    fn missing_port_fails_the_container() {
        let mut pod = test_pod();
        pod.spec.as_mut().unwrap().containers[0].ports = None;

        let info = PodSnapshot::from_pod(&pod);
        let result = info.to_entry(&info.container_statuses[0].clone(), &test_config());
        assert!(matches!(result, Err(ControllerError::InvalidEntry(_))));
    }

    #[test]
    fn container_allow_list() {
        let mut pod = test_pod();
        pod.metadata.annotations.as_mut().unwrap().insert(
            EXPECTED_CONTAINER_NAMES_ANNOTATION.to_string(),
            "app,sidecar".to_string(),
        );
        let info = PodSnapshot::from_pod(&pod);
        assert!(info.allows_container("app"));
        assert!(info.allows_container("sidecar"));
        assert!(!info.allows_container("other"));

        // Without the annotation every container is allowed.
        let info = PodSnapshot::from_pod(&test_pod());
        assert!(info.allows_container("anything"));
    }

    #[test]
    fn http_probe_translates_to_http_check() {
        let mut pod = test_pod();
        pod.spec.as_mut().unwrap().containers[0].liveness_probe = Some(Probe {
            http_get: Some(HTTPGetAction {
                scheme: Some("HTTP".to_string()),
                path: Some("/ping".to_string()),
                port: IntOrString::Int(8080),
                ..Default::default()
            }),
            period_seconds: Some(10),
            timeout_seconds: Some(1),
            ..Default::default()
        });
        pod.status.as_mut().unwrap().pod_ip = Some("192.168.8.8".to_string());

        let info = PodSnapshot::from_pod(&pod);
        let entry = info
            .to_entry(&info.container_statuses[0].clone(), &test_config())
            .unwrap();
        let check = entry.check.unwrap();
        assert_eq!(check.http.as_deref(), Some("http://192.168.8.8:8080/ping"));
        assert_eq!(check.interval.as_deref(), Some("10s"));
        assert_eq!(check.timeout.as_deref(), Some("1s"));
        assert_eq!(check.status.as_deref(), Some("passing"));
    }

    #[test]
    fn tcp_probe_translates_to_tcp_check() {
        let mut pod = test_pod();
        pod.spec.as_mut().unwrap().containers[0].liveness_probe = Some(Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(5432),
                ..Default::default()
            }),
            period_seconds: Some(5),
            timeout_seconds: Some(2),
            ..Default::default()
        });
        pod.status.as_mut().unwrap().pod_ip = Some("192.168.8.8".to_string());

        let info = PodSnapshot::from_pod(&pod);
        let entry = info
            .to_entry(&info.container_statuses[0].clone(), &test_config())
            .unwrap();
        assert_eq!(
            entry.check.unwrap().tcp.as_deref(),
            Some("192.168.8.8:5432")
        );
    }

    #[test]
    fn exec_and_absent_probes_produce_no_check() {
        let info = PodSnapshot::from_pod(&test_pod());
        let entry = info
            .to_entry(&info.container_statuses[0].clone(), &test_config())
            .unwrap();
        assert!(entry.check.is_none());

        let mut pod = test_pod();
        pod.spec.as_mut().unwrap().containers[0].liveness_probe = Some(Probe {
            exec: Some(k8s_openapi::api::core::v1::ExecAction {
                command: Some(vec!["true".to_string()]),
            }),
            ..Default::default()
        });
        let info = PodSnapshot::from_pod(&pod);
        let entry = info
            .to_entry(&info.container_statuses[0].clone(), &test_config())
            .unwrap();
        assert!(entry.check.is_none());
    }

    #[test]
    fn probe_host_overrides_pod_ip() {
        let mut pod = test_pod();
        pod.spec.as_mut().unwrap().containers[0].liveness_probe = Some(Probe {
            http_get: Some(HTTPGetAction {
                host: Some("healthz.local".to_string()),
                path: Some("/".to_string()),
                port: IntOrString::Int(80),
                ..Default::default()
            }),
            ..Default::default()
        });

        let info = PodSnapshot::from_pod(&pod);
        let check = info.probe_to_check(info.liveness_probe("app"));
        assert_eq!(check.http.as_deref(), Some("http://healthz.local:80/"));
    }
}
