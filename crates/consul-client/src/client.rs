//! Consul agent API client
//!
//! Implements the agent-scoped endpoints the controller uses:
//! `/v1/agent/service/register`, `/v1/agent/service/deregister/{id}` and
//! `/v1/agent/services`.
//!
//! The client is bound to exactly one agent; the controller constructs
//! one client per target agent and never retries a failed call (retry
//! comes from the periodic sweeps).

use crate::consul_trait::ConsulAgent;
use crate::error::ConsulError;
use crate::models::{AgentService, AgentServiceRegistration};
use reqwest::{Client, Url};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// TLS material used when the agent is reached over `https`.
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    pub ca_file: String,
    pub cert_file: String,
    pub key_file: String,
    pub insecure_skip_verify: bool,
}

/// Connection settings for a single Consul agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Full target URI, e.g. `http://consul.service:8500`.
    pub uri: String,
    /// Optional ACL token, sent as `X-Consul-Token`.
    pub token: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
    pub tls: TlsSettings,
}

impl AgentConfig {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            token: None,
            timeout: Duration::from_secs(2),
            tls: TlsSettings::default(),
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = tls;
        self
    }
}

/// Consul agent API client bound to one agent.
#[derive(Debug)]
pub struct ConsulClient {
    http: Client,
    base_url: String,
    address: String,
    token: Option<String>,
}

impl ConsulClient {
    /// Create a client for the agent named by `config.uri`.
    ///
    /// Scheme handling: a `consul-unix` URI strips the `consul-` prefix,
    /// leaving a unix-socket address — this HTTP transport cannot reach
    /// those, so construction fails with `InvalidArgument`. An `https`
    /// URI loads the configured TLS material. Anything else uses the
    /// host portion unmodified.
    pub fn new(config: AgentConfig) -> Result<Self, ConsulError> {
        let uri = match config.uri.strip_prefix("consul-") {
            Some(rest) => rest.to_string(),
            None => config.uri.clone(),
        };

        if uri.starts_with("unix://") {
            return Err(ConsulError::InvalidArgument(format!(
                "unix socket address {} is not supported by the HTTP transport",
                uri
            )));
        }

        let url = Url::parse(&uri)
            .map_err(|e| ConsulError::InvalidArgument(format!("bad agent uri {}: {}", uri, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| ConsulError::InvalidArgument(format!("agent uri {} has no host", uri)))?;
        let address = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        let mut builder = Client::builder().timeout(config.timeout);

        if url.scheme() == "https" {
            builder = Self::apply_tls(builder, &config.tls)?;
        }

        let http = builder.build()?;

        Ok(Self {
            http,
            base_url: uri.trim_end_matches('/').to_string(),
            address,
            token: config.token,
        })
    }

    fn apply_tls(
        mut builder: reqwest::ClientBuilder,
        tls: &TlsSettings,
    ) -> Result<reqwest::ClientBuilder, ConsulError> {
        if !tls.ca_file.is_empty() {
            let pem = std::fs::read(&tls.ca_file).map_err(|e| {
                ConsulError::InvalidArgument(format!("cannot read CA file {}: {}", tls.ca_file, e))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| ConsulError::InvalidArgument(format!("bad CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }

        if !tls.cert_file.is_empty() && !tls.key_file.is_empty() {
            let mut pem = std::fs::read(&tls.cert_file).map_err(|e| {
                ConsulError::InvalidArgument(format!(
                    "cannot read client certificate {}: {}",
                    tls.cert_file, e
                ))
            })?;
            let key = std::fs::read(&tls.key_file).map_err(|e| {
                ConsulError::InvalidArgument(format!(
                    "cannot read client key {}: {}",
                    tls.key_file, e
                ))
            })?;
            pem.extend_from_slice(&key);
            let identity = reqwest::Identity::from_pem(&pem).map_err(|e| {
                ConsulError::InvalidArgument(format!("bad client identity: {}", e))
            })?;
            builder = builder.identity(identity);
        }

        if tls.insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        Ok(builder)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, format!("{}{}", self.base_url, path));
        if let Some(token) = &self.token {
            req = req.header("X-Consul-Token", token);
        }
        req
    }

    /// Map a non-success agent response to an error category: 4xx means
    /// the request was malformed, everything else is the agent refusing.
    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ConsulError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(ConsulError::InvalidArgument(format!("{}: {}", status, body)))
        } else {
            Err(ConsulError::Conflict(format!("{}: {}", status, body)))
        }
    }
}

#[async_trait::async_trait]
impl ConsulAgent for ConsulClient {
    fn address(&self) -> &str {
        &self.address
    }

    async fn register(&self, entry: &AgentServiceRegistration) -> Result<(), ConsulError> {
        debug!("Registering service {} with ID {}", entry.name, entry.id);
        let response = self
            .request(reqwest::Method::PUT, "/v1/agent/service/register")
            .json(entry)
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn deregister(&self, service_id: &str) -> Result<(), ConsulError> {
        debug!("Deregistering service with ID {}", service_id);
        let response = self
            .request(
                reqwest::Method::PUT,
                &format!("/v1/agent/service/deregister/{}", service_id),
            )
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn services(&self) -> Result<HashMap<String, AgentService>, ConsulError> {
        debug!("Listing services on agent {}", self.address);
        let response = self
            .request(reqwest::Method::GET, "/v1/agent/services")
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_derives_address_from_uri() {
        let client = ConsulClient::new(AgentConfig::new("http://n1:8500")).unwrap();
        assert_eq!(client.address(), "n1:8500");
        assert_eq!(client.base_url, "http://n1:8500");
    }

    #[test]
    fn unix_scheme_is_rejected_by_transport() {
        let err = ConsulClient::new(AgentConfig::new("consul-unix:///var/run/consul.sock"))
            .unwrap_err();
        assert!(matches!(err, ConsulError::InvalidArgument(_)));
    }

    #[test]
    fn bad_uri_is_invalid_argument() {
        let err = ConsulClient::new(AgentConfig::new("not a uri")).unwrap_err();
        assert!(matches!(err, ConsulError::InvalidArgument(_)));
    }
}
