//! Consul service registry agency

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::utils::error::{HealthError, Result};

/// One registered instance of a consul service.
#[derive(Debug, Clone)]
pub struct ServiceInstance {
    /// Registration id, used for deregistration
    pub id: String,
    /// Dialable address of the instance (`host:port`)
    pub address: String,
}

/// Consul operations the registry check depends on.
#[async_trait::async_trait]
pub trait ConsulAgency: Send + Sync {
    /// Instances registered under the (namespaced) service name.
    async fn service_instances(&self, service: &str) -> Result<Vec<ServiceInstance>>;

    /// Deregister one instance by its registration id.
    async fn deregister_instance(&self, id: &str) -> Result<()>;
}

/// Agency backed by the local consul agent HTTP API.
pub struct ConsulHttpAgency {
    client: reqwest::Client,
    base_url: String,
}

impl ConsulHttpAgency {
    /// Build an agency against the given consul agent.
    pub fn new(url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| HealthError::Consul(format!("failed to build consul client: {}", e)))?;
        Ok(Self {
            client,
            base_url: url.trim_end_matches('/').to_string(),
        })
    }
}

/// Shape of one entry in `/v1/agent/services`.
#[derive(Debug, Deserialize)]
struct AgentService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Service")]
    service: String,
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
}

#[async_trait::async_trait]
impl ConsulAgency for ConsulHttpAgency {
    async fn service_instances(&self, service: &str) -> Result<Vec<ServiceInstance>> {
        let url = format!("{}/v1/agent/services", self.base_url);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(HealthError::Consul(format!(
                "agent services request returned status {}",
                resp.status()
            )));
        }

        let services = resp.json::<HashMap<String, AgentService>>().await?;
        let instances = services
            .into_values()
            .filter(|s| s.service == service)
            .map(|s| {
                let host = if s.address.is_empty() {
                    "127.0.0.1"
                } else {
                    s.address.as_str()
                };
                ServiceInstance {
                    address: format!("{}:{}", host, s.port),
                    id: s.id,
                }
            })
            .collect();
        Ok(instances)
    }

    async fn deregister_instance(&self, id: &str) -> Result<()> {
        let url = format!("{}/v1/agent/service/deregister/{}", self.base_url, id);
        let resp = self.client.put(&url).send().await?;
        if !resp.status().is_success() {
            return Err(HealthError::Consul(format!(
                "deregister request for {} returned status {}",
                id,
                resp.status()
            )));
        }
        Ok(())
    }
}
