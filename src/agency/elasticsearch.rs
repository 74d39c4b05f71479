//! Elasticsearch cluster agency
//!
//! Covers the three operations the cluster check needs: the health snapshot,
//! pattern-scoped index listing and index deletion.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;

use crate::utils::error::{HealthError, Result};

/// Cluster health snapshot used by the elasticsearch check.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ClusterHealth {
    /// Active primary shards in the cluster
    pub active_primary_shards: u32,
    /// Active shards in the cluster
    pub active_shards: u32,
    /// Shards without an assigned node
    pub unassigned_shards: u32,
    /// Percentage of shards that are active
    #[serde(rename = "active_shards_percent_as_number")]
    pub active_shards_percent: f64,
}

impl ClusterHealth {
    /// Active plus unassigned shards, the number the weakness threshold is
    /// compared against.
    pub fn total_shards(&self) -> u32 {
        self.active_shards + self.unassigned_shards
    }
}

/// One index with its creation time.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    /// Index name
    pub name: String,
    /// Index creation time
    pub created_at: DateTime<Utc>,
}

/// Catalog of the indices matched by a pattern query.
#[derive(Debug, Clone, Default)]
pub struct IndexCatalog {
    /// Matched indices
    pub entries: Vec<IndexEntry>,
}

impl IndexCatalog {
    /// Names of the indices that have existed for at least `min_lifecycle`.
    pub fn older_than(&self, min_lifecycle: Duration, now: DateTime<Utc>) -> Vec<String> {
        let min_age = chrono::Duration::from_std(min_lifecycle)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        self.entries
            .iter()
            .filter(|entry| now.signed_duration_since(entry.created_at) >= min_age)
            .map(|entry| entry.name.clone())
            .collect()
    }
}

/// Elasticsearch operations the cluster check depends on.
#[async_trait::async_trait]
pub trait ElasticsearchAgency: Send + Sync {
    /// Current cluster health.
    async fn cluster_health(&self) -> Result<ClusterHealth>;

    /// Indices matching any of the glob patterns.
    async fn indices_with_patterns(&self, patterns: &[String]) -> Result<IndexCatalog>;

    /// Delete the named indices. A no-op for an empty list.
    async fn delete_indices(&self, names: &[String]) -> Result<()>;
}

/// Agency backed by the Elasticsearch HTTP API.
pub struct EsHttpAgency {
    client: reqwest::Client,
    base_url: String,
}

impl EsHttpAgency {
    /// Build an agency against the given cluster with a per-request timeout.
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                HealthError::Elasticsearch(format!("failed to build cluster client: {}", e))
            })?;
        Ok(Self {
            client,
            base_url: url.trim_end_matches('/').to_string(),
        })
    }
}

/// Row shape of `_cat/indices?format=json&h=index,creation.date`.
#[derive(Debug, Deserialize)]
struct CatIndexRow {
    index: String,
    #[serde(rename = "creation.date")]
    creation_date: Option<String>,
}

#[async_trait::async_trait]
impl ElasticsearchAgency for EsHttpAgency {
    async fn cluster_health(&self) -> Result<ClusterHealth> {
        let url = format!("{}/_cluster/health", self.base_url);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(HealthError::Elasticsearch(format!(
                "cluster health request returned status {}",
                resp.status()
            )));
        }
        Ok(resp.json::<ClusterHealth>().await?)
    }

    async fn indices_with_patterns(&self, patterns: &[String]) -> Result<IndexCatalog> {
        if patterns.is_empty() {
            return Ok(IndexCatalog::default());
        }
        let url = format!(
            "{}/_cat/indices/{}?format=json&h=index,creation.date",
            self.base_url,
            patterns.join(",")
        );
        let resp = self.client.get(&url).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(IndexCatalog::default());
        }
        if !resp.status().is_success() {
            return Err(HealthError::Elasticsearch(format!(
                "cat indices request returned status {}",
                resp.status()
            )));
        }

        let rows = resp.json::<Vec<CatIndexRow>>().await?;
        let entries = rows
            .into_iter()
            .filter_map(|row| {
                let millis = row.creation_date?.parse::<i64>().ok()?;
                let created_at = DateTime::<Utc>::from_timestamp_millis(millis)?;
                Some(IndexEntry {
                    name: row.index,
                    created_at,
                })
            })
            .collect();
        Ok(IndexCatalog { entries })
    }

    async fn delete_indices(&self, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        let url = format!("{}/{}", self.base_url, names.join(","));
        let resp = self.client.delete(&url).send().await?;
        if !resp.status().is_success() {
            return Err(HealthError::Elasticsearch(format!(
                "delete indices request returned status {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_shards() {
        let health = ClusterHealth {
            active_primary_shards: 250,
            active_shards: 500,
            unassigned_shards: 100,
            active_shards_percent: 83.3,
        };
        assert_eq!(health.total_shards(), 600);
    }

    #[test]
    fn test_catalog_filters_by_age() {
        let now = Utc::now();
        let catalog = IndexCatalog {
            entries: vec![
                IndexEntry {
                    name: "jaeger-span-old".to_string(),
                    created_at: now - chrono::Duration::days(40),
                },
                IndexEntry {
                    name: "jaeger-span-fresh".to_string(),
                    created_at: now - chrono::Duration::days(2),
                },
            ],
        };

        let names = catalog.older_than(Duration::from_secs(30 * 24 * 3600), now);
        assert_eq!(names, vec!["jaeger-span-old".to_string()]);
    }

    #[test]
    fn test_catalog_empty_when_everything_is_fresh() {
        let now = Utc::now();
        let catalog = IndexCatalog {
            entries: vec![IndexEntry {
                name: "jaeger-span-fresh".to_string(),
                created_at: now,
            }],
        };
        assert!(catalog.older_than(Duration::from_secs(3600), now).is_empty());
    }

    #[test]
    fn test_cluster_health_deserializes_percent_field() {
        let health: ClusterHealth = serde_json::from_str(
            r#"{
                "active_primary_shards": 10,
                "active_shards": 20,
                "unassigned_shards": 5,
                "active_shards_percent_as_number": 80.0,
                "status": "yellow"
            }"#,
        )
        .unwrap();
        assert_eq!(health.active_shards, 20);
        assert_eq!(health.unassigned_shards, 5);
        assert_eq!(health.active_shards_percent, 80.0);
    }
}
