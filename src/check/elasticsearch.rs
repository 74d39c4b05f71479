//! Elasticsearch cluster check
//!
//! Probe: cluster health; the weakness signal is the total shard count
//! (active plus unassigned) exceeding the configured maximum. Remediation:
//! delete jaeger indices that outlived their minimum lifecycle, then
//! re-probe the cluster. Every partial failure forces `Unhealthy`.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use super::status::{CheckStatus, StatusCell};
use super::Check;
use crate::agency::chat::ChatAgency;
use crate::agency::elasticsearch::ElasticsearchAgency;
use crate::config::EsCheckConfig;
use crate::history::{EsCheckHistory, HistoryStore, ProcessLevel};
use crate::utils::error::{HealthError, Result};

/// Elasticsearch cluster health check.
pub struct EsClusterCheck {
    cfg: EsCheckConfig,
    history: Arc<dyn HistoryStore>,
    chat: Arc<dyn ChatAgency>,
    elasticsearch: Arc<dyn ElasticsearchAgency>,
    status: StatusCell,
}

impl EsClusterCheck {
    /// Create the check; status starts at `Healthy`.
    pub fn new(
        cfg: EsCheckConfig,
        history: Arc<dyn HistoryStore>,
        chat: Arc<dyn ChatAgency>,
        elasticsearch: Arc<dyn ElasticsearchAgency>,
    ) -> Self {
        Self {
            cfg,
            history,
            chat,
            elasticsearch,
            status: StatusCell::new(),
        }
    }

    fn guard_record(&self, history: &mut EsCheckHistory) {
        history.header.process_level.set(ProcessLevel::Recovering);
        history.header.message = "recovering elasticsearch health is already on process".to_string();
    }

    async fn probe_failed(&self, history: &mut EsCheckHistory, err: HealthError) {
        let uuid = history.header.uuid.clone();
        history.header.process_level.set(ProcessLevel::Error);
        history
            .header
            .set_error(format!("failed to get cluster health: {}", err));
        let delivery = self
            .chat
            .send_message(
                "x",
                "!elasticsearch check error occurred! unable to get cluster health",
                &uuid,
            )
            .await;
        history.header.set_alarm_result(&delivery);
    }

    async fn observe(&self) -> EsCheckHistory {
        let mut history = EsCheckHistory::new();
        let uuid = history.header.uuid.clone();
        let maximum = self.cfg.maximum_shards;

        match self.status.get() {
            CheckStatus::Recovering => {
                self.guard_record(&mut history);
                return history;
            }
            CheckStatus::Unhealthy => {
                let cluster = match self.elasticsearch.cluster_health().await {
                    Ok(v) => v,
                    Err(e) => {
                        self.probe_failed(&mut history, e).await;
                        return history;
                    }
                };
                history.cluster_health = Some(cluster);

                if cluster.total_shards() < maximum {
                    self.status.set(CheckStatus::Healthy);
                    history.header.process_level.set(ProcessLevel::Recovered);
                    history.header.message =
                        "elasticsearch check is recovered to be healthy".to_string();
                    let msg = format!(
                        "!elasticsearch check recovered to health! total shards - {}",
                        cluster.total_shards()
                    );
                    let delivery = self.chat.send_message("heart", &msg, &uuid).await;
                    history.header.set_alarm_result(&delivery);
                } else {
                    history.header.process_level.set(ProcessLevel::Unhealthy);
                    history.header.message = "elasticsearch check is unhealthy now".to_string();
                }
                return history;
            }
            CheckStatus::Healthy => {}
        }

        let cluster = match self.elasticsearch.cluster_health().await {
            Ok(v) => v,
            Err(e) => {
                self.probe_failed(&mut history, e).await;
                return history;
            }
        };
        history.cluster_health = Some(cluster);

        if cluster.total_shards() <= maximum {
            history.header.process_level.set(ProcessLevel::Healthy);
            history.header.message = "elasticsearch service is healthy now".to_string();
            return history;
        }

        // weakness detected
        if !self.status.begin_recovery() {
            self.guard_record(&mut history);
            return history;
        }
        history.header.process_level.set(ProcessLevel::WeakDetected);
        let delivery = self
            .chat
            .send_message(
                "pill",
                "!elasticsearch check weak detected! start to delete jaeger index",
                &uuid,
            )
            .await;
        history.header.set_alarm_result(&delivery);

        let patterns = vec![self.cfg.jaeger_index_pattern.clone()];
        let catalog = match self.elasticsearch.indices_with_patterns(&patterns).await {
            Ok(v) => v,
            Err(e) => {
                self.status.set(CheckStatus::Unhealthy);
                let _ = self
                    .chat
                    .send_message(
                        "broken_heart",
                        "!elasticsearch check error occurred! failed to get indices, please check for yourself",
                        &uuid,
                    )
                    .await;
                history
                    .header
                    .set_error(format!("failed to get indices with pattern: {}", e));
                return history;
            }
        };
        let expired = catalog.older_than(self.cfg.jaeger_index_min_lifecycle, Utc::now());

        if let Err(e) = self.elasticsearch.delete_indices(&expired).await {
            self.status.set(CheckStatus::Unhealthy);
            let _ = self
                .chat
                .send_message(
                    "anger",
                    "!elasticsearch check error occurred! failed to delete indices, please check for yourself",
                    &uuid,
                )
                .await;
            history
                .header
                .set_error(format!("failed to delete indices: {}", e));
            return history;
        }
        history.if_jaeger_index_deleted = true;
        history.deleted_jaeger_indices = expired;
        history.header.message =
            "deleted jaeger indices as total shards is more than the maximum".to_string();

        let again = match self.elasticsearch.cluster_health().await {
            Ok(v) => v,
            Err(e) => {
                self.status.set(CheckStatus::Unhealthy);
                let _ = self
                    .chat
                    .send_message(
                        "broken_heart",
                        "!elasticsearch check error occurred! failed to again get cluster health, please check for yourself",
                        &uuid,
                    )
                    .await;
                history
                    .header
                    .set_error(format!("failed to again get cluster health: {}", e));
                return history;
            }
        };
        history.cluster_health = Some(again);

        if again.total_shards() < maximum {
            self.status.set(CheckStatus::Healthy);
            let msg = format!(
                "!elasticsearch check is recovered! total shards - {}",
                again.total_shards()
            );
            let _ = self.chat.send_message("heart", &msg, &uuid).await;
        } else {
            self.status.set(CheckStatus::Unhealthy);
            let _ = self
                .chat
                .send_message(
                    "broken_heart",
                    "!elasticsearch check has deteriorated! please check for yourself",
                    &uuid,
                )
                .await;
        }
        history
    }
}

#[async_trait::async_trait]
impl Check for EsClusterCheck {
    fn name(&self) -> &'static str {
        "elasticsearch"
    }

    fn cycle(&self) -> Duration {
        self.cfg.check_cycle
    }

    async fn run(&self) -> Result<()> {
        let history = self.observe().await;
        self.history.store(history.dotted_map()).await
    }
}
