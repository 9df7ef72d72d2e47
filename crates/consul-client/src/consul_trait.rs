//! ConsulAgent trait for mocking
//!
//! This trait abstracts a single Consul agent to enable mocking in unit
//! tests. The concrete `ConsulClient` implements it; tests use
//! `MockConsulAgent` instead.

use crate::error::ConsulError;
use crate::models::{AgentService, AgentServiceRegistration};
use std::collections::HashMap;

/// Operations against one Consul agent.
///
/// All operations are idempotent with respect to the service id: a
/// repeated register with the same id refreshes the entry, a repeated
/// deregister propagates whatever the agent answers.
#[async_trait::async_trait]
pub trait ConsulAgent: Send + Sync {
    /// The agent's `host:port` address, used for log context and metric labels.
    fn address(&self) -> &str;

    /// Register a service with this agent.
    async fn register(&self, entry: &AgentServiceRegistration) -> Result<(), ConsulError>;

    /// Deregister the service with the given id.
    async fn deregister(&self, service_id: &str) -> Result<(), ConsulError>;

    /// List all services registered with this agent.
    async fn services(&self) -> Result<HashMap<String, AgentService>, ConsulError>;
}
