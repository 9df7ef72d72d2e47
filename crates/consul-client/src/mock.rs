//! Mock Consul agent for unit testing
//!
//! In-memory implementation of `ConsulAgent` so reconciler logic can be
//! tested without a running agent. The mock stores registrations in a
//! shared map and can be told to fail each operation.

use crate::consul_trait::ConsulAgent;
use crate::error::ConsulError;
use crate::models::{AgentService, AgentServiceRegistration};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Mock Consul agent for testing.
///
/// Clones share the same underlying service map, so a test can hold one
/// handle while the code under test holds another.
#[derive(Clone)]
pub struct MockConsulAgent {
    address: String,
    services: Arc<Mutex<HashMap<String, AgentService>>>,
    fail_register: Arc<Mutex<bool>>,
    fail_deregister: Arc<Mutex<bool>>,
    fail_services: Arc<Mutex<bool>>,
}

impl MockConsulAgent {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            services: Arc::new(Mutex::new(HashMap::new())),
            fail_register: Arc::new(Mutex::new(false)),
            fail_deregister: Arc::new(Mutex::new(false)),
            fail_services: Arc::new(Mutex::new(false)),
        }
    }

    /// Seed a service as if it had been registered earlier (for test setup).
    pub fn add_service(&self, service: AgentService) {
        self.services
            .lock()
            .unwrap()
            .insert(service.id.clone(), service);
    }

    /// Snapshot of the current registrations.
    pub fn registered(&self) -> HashMap<String, AgentService> {
        self.services.lock().unwrap().clone()
    }

    pub fn set_fail_register(&self, fail: bool) {
        *self.fail_register.lock().unwrap() = fail;
    }

    pub fn set_fail_deregister(&self, fail: bool) {
        *self.fail_deregister.lock().unwrap() = fail;
    }

    pub fn set_fail_services(&self, fail: bool) {
        *self.fail_services.lock().unwrap() = fail;
    }
}

#[async_trait::async_trait]
impl ConsulAgent for MockConsulAgent {
    fn address(&self) -> &str {
        &self.address
    }

    async fn register(&self, entry: &AgentServiceRegistration) -> Result<(), ConsulError> {
        if *self.fail_register.lock().unwrap() {
            return Err(ConsulError::Unavailable("mock register failure".to_string()));
        }
        let service = AgentService {
            id: entry.id.clone(),
            service: entry.name.clone(),
            tags: entry.tags.clone(),
            address: entry.address.clone(),
            port: entry.port,
            meta: entry.meta.clone(),
        };
        self.services
            .lock()
            .unwrap()
            .insert(entry.id.clone(), service);
        Ok(())
    }

    async fn deregister(&self, service_id: &str) -> Result<(), ConsulError> {
        if *self.fail_deregister.lock().unwrap() {
            return Err(ConsulError::Unavailable(
                "mock deregister failure".to_string(),
            ));
        }
        self.services.lock().unwrap().remove(service_id);
        Ok(())
    }

    async fn services(&self) -> Result<HashMap<String, AgentService>, ConsulError> {
        if *self.fail_services.lock().unwrap() {
            return Err(ConsulError::Unavailable("mock services failure".to_string()));
        }
        Ok(self.services.lock().unwrap().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_list_then_deregister() {
        let agent = MockConsulAgent::new("localhost:8500");
        let entry = AgentServiceRegistration {
            id: "web-0-nginx".to_string(),
            name: "web".to_string(),
            tags: vec!["kubernetes".to_string()],
            port: 80,
            ..Default::default()
        };

        agent.register(&entry).await.unwrap();
        let services = agent.services().await.unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services["web-0-nginx"].service, "web");

        // Re-registering the same id is idempotent.
        agent.register(&entry).await.unwrap();
        assert_eq!(agent.services().await.unwrap().len(), 1);

        agent.deregister("web-0-nginx").await.unwrap();
        assert!(agent.services().await.unwrap().is_empty());
        // Deregistering an unknown id is not an error.
        agent.deregister("web-0-nginx").await.unwrap();
    }

    #[tokio::test]
    async fn injected_failures_surface_as_unavailable() {
        let agent = MockConsulAgent::new("localhost:8500");
        agent.set_fail_services(true);
        assert!(matches!(
            agent.services().await,
            Err(ConsulError::Unavailable(_))
        ));
    }
}
