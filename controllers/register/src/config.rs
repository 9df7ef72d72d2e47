//! Controller configuration.
//!
//! The configuration lives in a ConfigMap inside the cluster and is read
//! once at boot. Every key has a default, so an empty ConfigMap yields a
//! working configuration pointed at a local agent.

use crate::error::ControllerError;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::warn;

/// Which agent receives a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterMode {
    /// One shared agent, named by `consul_address`.
    Single,
    /// The agent on the same node as the workload.
    Node,
    /// A per-pod sidecar agent, reached via the pod's host ip.
    Pod,
}

impl RegisterMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegisterMode::Single => "single",
            RegisterMode::Node => "node",
            RegisterMode::Pod => "pod",
        }
    }
}

/// Which cluster object kind drives reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterSource {
    Pod,
    Endpoint,
    Service,
}

/// Immutable controller configuration, filled from ConfigMap data.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub consul_address: String,
    pub consul_port: u16,
    pub consul_scheme: String,
    pub consul_ca_file: String,
    pub consul_cert_file: String,
    pub consul_key_file: String,
    pub consul_insecure_skip_verify: bool,
    pub consul_token: String,
    pub consul_timeout: Duration,
    /// Container name skipped when walking a pod's containers, so the
    /// agent sidecar never registers itself.
    pub consul_container_name: String,
    /// Owner tag stamped on every entry this controller creates.
    pub k8s_tag: String,
    pub register_mode: RegisterMode,
    pub register_source: RegisterSource,
    pub pod_label_selector: String,
    pub consul_node_selector: String,
}

impl ControllerConfig {
    /// Load the configuration from a ConfigMap in the cluster.
    pub async fn load(client: &Client, namespace: &str, name: &str) -> Result<Self, ControllerError> {
        let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
        let cm = api.get(name).await?;
        Self::from_map(&cm.data.unwrap_or_default())
    }

    /// Fill the configuration from ConfigMap data, applying defaults for
    /// absent or empty values.
    pub fn from_map(data: &BTreeMap<String, String>) -> Result<Self, ControllerError> {
        let get = |key: &str, default: &str| -> String {
            match data.get(key) {
                Some(value) if !value.is_empty() => value.clone(),
                _ => default.to_string(),
            }
        };

        let consul_port = {
            let raw = get("consul_port", "8500");
            raw.parse::<u16>().map_err(|e| {
                ControllerError::InvalidConfig(format!("bad consul_port {}: {}", raw, e))
            })?
        };

        let consul_insecure_skip_verify = {
            let raw = get("consul_insecure_skip_verify", "false");
            parse_bool(&raw).ok_or_else(|| {
                ControllerError::InvalidConfig(format!(
                    "bad consul_insecure_skip_verify value: {}",
                    raw
                ))
            })?
        };

        let consul_timeout = {
            let raw = get("consul_timeout", "2s");
            parse_duration(&raw)
                .map_err(|e| ControllerError::InvalidConfig(format!("bad consul_timeout: {}", e)))?
        };

        let register_mode = match data.get("register_mode").map(String::as_str) {
            None | Some("") | Some("single") => RegisterMode::Single,
            Some("node") => RegisterMode::Node,
            Some("pod") => RegisterMode::Pod,
            Some(other) => {
                warn!(
                    "Wrong value of 'register_mode' option. Permitted values: single|node|pod, is {}",
                    other
                );
                RegisterMode::Single
            }
        };

        let register_source = match data.get("register_source").map(String::as_str) {
            Some("endpoint") => RegisterSource::Endpoint,
            Some("service") => RegisterSource::Service,
            None | Some("") | Some("pod") => RegisterSource::Pod,
            Some(other) => {
                warn!(
                    "Wrong value of 'register_source' option. Permitted values: pod|endpoint|service, is {}",
                    other
                );
                RegisterSource::Pod
            }
        };

        Ok(Self {
            consul_address: get("consul_address", "localhost"),
            consul_port,
            consul_scheme: get("consul_scheme", "http"),
            consul_ca_file: get("consul_ca_file", ""),
            consul_cert_file: get("consul_cert_file", ""),
            consul_key_file: get("consul_key_file", ""),
            consul_insecure_skip_verify,
            consul_token: get("consul_token", ""),
            consul_timeout,
            consul_container_name: get("consul_container_name", "consul"),
            k8s_tag: get("k8s_tag", "kubernetes"),
            register_mode,
            register_source,
            pod_label_selector: get("pod_label_selector", ""),
            consul_node_selector: get("consul_node_selector", ""),
        })
    }
}

/// Parse `namespace/name` into its two parts.
pub fn parse_ns_name(input: &str) -> Result<(String, String), ControllerError> {
    match input.split_once('/') {
        Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok((namespace.to_string(), name.to_string()))
        }
        _ => Err(ControllerError::InvalidConfig(format!(
            "invalid format (namespace/name) found in '{}'",
            input
        ))),
    }
}

/// Boolean parsing with the value set ConfigMaps conventionally carry.
pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Parse a duration string such as `2s`, `1500ms`, `3m` or `1h`.
fn parse_duration(value: &str) -> Result<Duration, String> {
    let split = value
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .ok_or_else(|| format!("missing unit in duration '{}'", value))?;
    let (number, unit) = value.split_at(split);
    let number: f64 = number
        .parse()
        .map_err(|_| format!("bad number in duration '{}'", value))?;
    let factor = match unit {
        "ms" => 0.001,
        "s" => 1.0,
        "m" => 60.0,
        "h" => 3600.0,
        _ => return Err(format!("unknown unit '{}' in duration '{}'", unit, value)),
    };
    Ok(Duration::from_secs_f64(number * factor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_data_yields_defaults() {
        let cfg = ControllerConfig::from_map(&BTreeMap::new()).unwrap();

        assert_eq!(cfg.consul_address, "localhost");
        assert_eq!(cfg.consul_port, 8500);
        assert_eq!(cfg.consul_scheme, "http");
        assert!(!cfg.consul_insecure_skip_verify);
        assert_eq!(cfg.consul_container_name, "consul");
        assert_eq!(cfg.k8s_tag, "kubernetes");
        assert_eq!(cfg.register_mode, RegisterMode::Single);
        assert_eq!(cfg.register_source, RegisterSource::Pod);
        assert_eq!(cfg.consul_timeout, Duration::from_secs(2));
        assert!(cfg.consul_token.is_empty());
        assert!(cfg.pod_label_selector.is_empty());
    }

    #[test]
    fn values_override_defaults() {
        let data: BTreeMap<String, String> = [
            ("consul_address", "consul.service"),
            ("consul_port", "8501"),
            ("consul_scheme", "https"),
            ("consul_insecure_skip_verify", "true"),
            ("consul_timeout", "1500ms"),
            ("register_mode", "node"),
            ("register_source", "endpoint"),
            ("k8s_tag", "k8s"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let cfg = ControllerConfig::from_map(&data).unwrap();
        assert_eq!(cfg.consul_address, "consul.service");
        assert_eq!(cfg.consul_port, 8501);
        assert_eq!(cfg.consul_scheme, "https");
        assert!(cfg.consul_insecure_skip_verify);
        assert_eq!(cfg.consul_timeout, Duration::from_millis(1500));
        assert_eq!(cfg.register_mode, RegisterMode::Node);
        assert_eq!(cfg.register_source, RegisterSource::Endpoint);
        assert_eq!(cfg.k8s_tag, "k8s");
    }

    #[test]
    fn unknown_register_mode_falls_back_to_single() {
        let data: BTreeMap<String, String> =
            [("register_mode".to_string(), "multi".to_string())].into();
        let cfg = ControllerConfig::from_map(&data).unwrap();
        assert_eq!(cfg.register_mode, RegisterMode::Single);
    }

    #[test]
    fn bad_values_are_rejected() {
        let data: BTreeMap<String, String> =
            [("consul_port".to_string(), "eighty".to_string())].into();
        assert!(ControllerConfig::from_map(&data).is_err());

        let data: BTreeMap<String, String> =
            [("consul_timeout".to_string(), "2 parsecs".to_string())].into();
        assert!(ControllerConfig::from_map(&data).is_err());

        let data: BTreeMap<String, String> =
            [("consul_insecure_skip_verify".to_string(), "maybe".to_string())].into();
        assert!(ControllerConfig::from_map(&data).is_err());
    }

    #[test]
    fn ns_name_parsing() {
        assert_eq!(
            parse_ns_name("default/consul-register-config").unwrap(),
            ("default".to_string(), "consul-register-config".to_string())
        );
        assert!(parse_ns_name("no-slash").is_err());
        assert!(parse_ns_name("too/many/parts").is_err());
        assert!(parse_ns_name("/name").is_err());
    }

    #[test]
    fn duration_units() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("3m").unwrap(), Duration::from_secs(180));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("tens").is_err());
    }
}
