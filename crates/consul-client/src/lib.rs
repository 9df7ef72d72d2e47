//! Consul Agent HTTP API Client
//!
//! A Rust client library for the parts of the Consul agent API the
//! register controller needs: service registration, deregistration and
//! the local service catalog.
//!
//! # Example
//!
//! ```no_run
//! use consul_client::{AgentConfig, AgentServiceRegistration, ConsulAgent, ConsulClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ConsulClient::new(AgentConfig::new("http://consul.service:8500"))?;
//!
//! let entry = AgentServiceRegistration {
//!     id: "web-0-nginx".to_string(),
//!     name: "web".to_string(),
//!     tags: vec!["kubernetes".to_string()],
//!     address: "10.0.0.5".to_string(),
//!     port: 8080,
//!     ..Default::default()
//! };
//! client.register(&entry).await?;
//!
//! let services = client.services().await?;
//! assert!(services.contains_key("web-0-nginx"));
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod consul_trait;
pub mod error;
pub mod models;
pub mod tags;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use client::{AgentConfig, ConsulClient, TlsSettings};
pub use consul_trait::ConsulAgent;
pub use error::ConsulError;
pub use models::{AgentService, AgentServiceCheck, AgentServiceRegistration};
#[cfg(any(test, feature = "test-util"))]
pub use mock::MockConsulAgent;
