//! Consul agent selection.
//!
//! The register mode decides which agent a write goes to: the shared
//! agent from the configuration, the agent on the workload's node, or a
//! per-pod sidecar agent. The factory derives the target URI for the
//! current mode and builds a client bound to exactly that agent.

use crate::config::{ControllerConfig, RegisterMode};
use crate::error::ControllerError;
use consul_client::{AgentConfig, ConsulAgent, ConsulClient, TlsSettings};
use std::sync::Arc;

/// Builds agent clients scoped to a node name / pod ip pair.
///
/// Abstracted behind a trait so reconciler tests can hand out mock
/// agents instead of HTTP clients.
pub trait AgentFactory: Send + Sync {
    fn agent(&self, node_name: &str, pod_ip: &str) -> Result<Arc<dyn ConsulAgent>, ControllerError>;
}

/// Factory producing real HTTP clients from the controller configuration.
pub struct HttpAgentFactory {
    cfg: Arc<ControllerConfig>,
}

impl HttpAgentFactory {
    pub fn new(cfg: Arc<ControllerConfig>) -> Self {
        Self { cfg }
    }

    /// Target URI for the configured register mode.
    pub fn target_uri(&self, node_name: &str, pod_ip: &str) -> String {
        let host = match self.cfg.register_mode {
            RegisterMode::Single => self.cfg.consul_address.as_str(),
            RegisterMode::Node => node_name,
            RegisterMode::Pod => pod_ip,
        };
        format!(
            "{}://{}:{}",
            self.cfg.consul_scheme, host, self.cfg.consul_port
        )
    }
}

impl AgentFactory for HttpAgentFactory {
    fn agent(&self, node_name: &str, pod_ip: &str) -> Result<Arc<dyn ConsulAgent>, ControllerError> {
        let token = if self.cfg.consul_token.is_empty() {
            None
        } else {
            Some(self.cfg.consul_token.clone())
        };

        let config = AgentConfig::new(self.target_uri(node_name, pod_ip))
            .with_token(token)
            .with_timeout(self.cfg.consul_timeout)
            .with_tls(TlsSettings {
                ca_file: self.cfg.consul_ca_file.clone(),
                cert_file: self.cfg.consul_cert_file.clone(),
                key_file: self.cfg.consul_key_file.clone(),
                insecure_skip_verify: self.cfg.consul_insecure_skip_verify,
            });

        let client = ConsulClient::new(config)?;
        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use std::collections::BTreeMap;

    fn config_with_mode(mode: &str) -> Arc<ControllerConfig> {
        let data: BTreeMap<String, String> = [
            ("consul_address".to_string(), "x".to_string()),
            ("consul_port".to_string(), "8500".to_string()),
            ("consul_scheme".to_string(), "http".to_string()),
            ("register_mode".to_string(), mode.to_string()),
        ]
        .into();
        Arc::new(ControllerConfig::from_map(&data).unwrap())
    }

    #[test]
    fn single_mode_targets_configured_address() {
        let factory = HttpAgentFactory::new(config_with_mode("single"));
        assert_eq!(factory.target_uri("n1", "10.0.0.5"), "http://x:8500");

        let agent = factory.agent("n1", "10.0.0.5").unwrap();
        assert_eq!(agent.address(), "x:8500");
    }

    #[test]
    fn node_mode_targets_node_name() {
        let factory = HttpAgentFactory::new(config_with_mode("node"));
        assert_eq!(factory.target_uri("n1", "10.0.0.5"), "http://n1:8500");

        let agent = factory.agent("n1", "10.0.0.5").unwrap();
        assert_eq!(agent.address(), "n1:8500");
    }

    #[test]
    fn pod_mode_targets_pod_ip() {
        let factory = HttpAgentFactory::new(config_with_mode("pod"));
        assert_eq!(factory.target_uri("n1", "10.0.0.5"), "http://10.0.0.5:8500");

        let agent = factory.agent("n1", "10.0.0.5").unwrap();
        assert_eq!(agent.address(), "10.0.0.5:8500");
    }
}
