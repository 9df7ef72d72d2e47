//! Consul agent API models
//!
//! These models match the Consul agent endpoint payloads
//! (`/v1/agent/service/register`, `/v1/agent/services`). Field names on
//! the wire are the agent's PascalCase keys.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A service registration sent to `PUT /v1/agent/service/register`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentServiceRegistration {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Tags", default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(rename = "Address", default, skip_serializing_if = "String::is_empty")]
    pub address: String,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "Meta", default, skip_serializing_if = "HashMap::is_empty")]
    pub meta: HashMap<String, String>,
    #[serde(rename = "Check", default, skip_serializing_if = "Option::is_none")]
    pub check: Option<AgentServiceCheck>,
}

/// Health check definition attached to a registration.
///
/// Exactly one of `http`/`tcp` is set by the probe translation; an
/// absent check means the entry carries no health at all.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentServiceCheck {
    #[serde(rename = "HTTP", default, skip_serializing_if = "Option::is_none")]
    pub http: Option<String>,
    #[serde(rename = "TCP", default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<String>,
    #[serde(rename = "Interval", default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(rename = "Timeout", default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(rename = "Status", default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl AgentServiceCheck {
    /// True when no handler was derived, i.e. the probe was absent or exec.
    pub fn is_empty(&self) -> bool {
        self.http.is_none() && self.tcp.is_none()
    }
}

/// A service snapshot as returned by `GET /v1/agent/services`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentService {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Service")]
    pub service: String,
    #[serde(rename = "Tags", default)]
    pub tags: Vec<String>,
    #[serde(rename = "Address", default)]
    pub address: String,
    #[serde(rename = "Port", default)]
    pub port: u16,
    #[serde(rename = "Meta", default)]
    pub meta: HashMap<String, String>,
}
