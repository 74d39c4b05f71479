//! Write-only persistence of history records
//!
//! The Elasticsearch implementation bootstraps its index on construction
//! (idempotent) and indexes one flattened document per tick.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::config::EsStorageConfig;
use crate::utils::error::{HealthError, Result};

/// Write-only history persistence shared by all checks of one domain.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Persist one flattened history document. Safe for concurrent callers.
    async fn store(&self, document: Map<String, Value>) -> Result<()>;
}

/// History store backed by an Elasticsearch index.
pub struct EsHistoryStore {
    client: reqwest::Client,
    base_url: String,
    index: String,
}

impl EsHistoryStore {
    /// Build the store and make sure the backing index exists with the
    /// configured shard and replica settings.
    pub async fn new(cfg: &EsStorageConfig, index: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .build()
            .map_err(|e| HealthError::Storage(format!("failed to build history client: {}", e)))?;

        let store = Self {
            client,
            base_url: cfg.url.trim_end_matches('/').to_string(),
            index: index.to_string(),
        };
        store.ensure_index(cfg.index_shards, cfg.index_replicas).await?;
        Ok(store)
    }

    /// Create the backing index if it does not exist yet. A concurrent
    /// creation race resolves to "already exists" and is not an error.
    async fn ensure_index(&self, shards: u32, replicas: u32) -> Result<()> {
        let url = format!("{}/{}", self.base_url, self.index);

        let head = self
            .client
            .head(&url)
            .send()
            .await
            .map_err(|e| HealthError::Storage(format!("failed to check index existence: {}", e)))?;
        if head.status().is_success() {
            debug!("history index {} already exists", self.index);
            return Ok(());
        }

        let body = index_settings_body(shards, replicas);
        let resp = self
            .client
            .put(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| HealthError::Storage(format!("failed to create index: {}", e)))?;

        if resp.status().is_success() {
            info!("created history index {}", self.index);
            return Ok(());
        }

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if text.contains("resource_already_exists_exception") {
            debug!("history index {} was created concurrently", self.index);
            return Ok(());
        }
        Err(HealthError::Storage(format!(
            "failed to create index {}: status {}, body: {}",
            self.index, status, text
        )))
    }
}

/// Settings document applied when an index is bootstrapped.
fn index_settings_body(shards: u32, replicas: u32) -> Value {
    json!({
        "settings": {
            "index": {
                "number_of_shards": shards,
                "number_of_replicas": replicas,
            }
        }
    })
}

#[async_trait]
impl HistoryStore for EsHistoryStore {
    async fn store(&self, document: Map<String, Value>) -> Result<()> {
        let url = format!("{}/{}/_doc", self.base_url, self.index);
        let resp = self
            .client
            .post(&url)
            .json(&Value::Object(document))
            .send()
            .await
            .map_err(|e| HealthError::Storage(format!("failed to index history document: {}", e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(HealthError::Storage(format!(
                "history index request returned {}: {}",
                status, text
            )));
        }

        debug!("stored history document in {}", self.index);
        Ok(())
    }
}
