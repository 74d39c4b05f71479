//! Memory check
//!
//! Structurally the cpu check with byte-sized thresholds over container
//! resident memory.

use bytesize::ByteSize;
use std::sync::Arc;
use std::time::Duration;

use super::status::{CheckStatus, StatusCell};
use super::Check;
use crate::agency::chat::ChatAgency;
use crate::agency::docker::{ContainerStat, DockerAgency};
use crate::config::MemoryCheckConfig;
use crate::history::{HistoryStore, MemoryCheckHistory, ProcessLevel};
use crate::utils::error::{HealthError, Result};

/// Container memory health check.
pub struct MemoryCheck {
    cfg: MemoryCheckConfig,
    history: Arc<dyn HistoryStore>,
    chat: Arc<dyn ChatAgency>,
    docker: Arc<dyn DockerAgency>,
    status: StatusCell,
}

fn total_usage(stats: &[ContainerStat]) -> u64 {
    stats.iter().map(|s| s.memory_bytes).sum()
}

impl MemoryCheck {
    /// Create the check; status starts at `Healthy`.
    pub fn new(
        cfg: MemoryCheckConfig,
        history: Arc<dyn HistoryStore>,
        chat: Arc<dyn ChatAgency>,
        docker: Arc<dyn DockerAgency>,
    ) -> Self {
        Self {
            cfg,
            history,
            chat,
            docker,
            status: StatusCell::new(),
        }
    }

    fn guard_record(&self, history: &mut MemoryCheckHistory) {
        history.header.process_level.set(ProcessLevel::Recovering);
        history.header.message = "removing containers is already on process".to_string();
    }

    async fn probe_failed(&self, history: &mut MemoryCheckHistory, err: HealthError) {
        let uuid = history.header.uuid.clone();
        history.header.process_level.set(ProcessLevel::Error);
        history
            .header
            .set_error(format!("failed to get total memory usage: {}", err));
        let delivery = self
            .chat
            .send_message(
                "x",
                "!memory check error occurred! unable to get container memory usage",
                &uuid,
            )
            .await;
        history.header.set_alarm_result(&delivery);
    }

    async fn observe(&self) -> MemoryCheckHistory {
        let mut history = MemoryCheckHistory::new();
        let uuid = history.header.uuid.clone();
        let maximum = self.cfg.maximum_usage.as_u64();

        match self.status.get() {
            CheckStatus::Recovering => {
                self.guard_record(&mut history);
                return history;
            }
            CheckStatus::Unhealthy => {
                let stats = match self.docker.container_stats().await {
                    Ok(v) => v,
                    Err(e) => {
                        self.probe_failed(&mut history, e).await;
                        return history;
                    }
                };
                let total = total_usage(&stats);
                history.total_usage_bytes = Some(total);

                if total < maximum {
                    self.status.set(CheckStatus::Healthy);
                    history.header.process_level.set(ProcessLevel::Recovered);
                    history.header.message = "memory check is recovered to be healthy".to_string();
                    let msg = format!(
                        "!memory check recovered to health! total usage - {}",
                        ByteSize(total)
                    );
                    let delivery = self.chat.send_message("heart", &msg, &uuid).await;
                    history.header.set_alarm_result(&delivery);
                } else {
                    history.header.process_level.set(ProcessLevel::Unhealthy);
                    history.header.message = "memory check is unhealthy now".to_string();
                }
                return history;
            }
            CheckStatus::Healthy => {}
        }

        let stats = match self.docker.container_stats().await {
            Ok(v) => v,
            Err(e) => {
                self.probe_failed(&mut history, e).await;
                return history;
            }
        };
        let total = total_usage(&stats);
        history.total_usage_bytes = Some(total);

        if total <= self.cfg.warning_usage.as_u64() {
            history.header.process_level.set(ProcessLevel::Healthy);
            history.header.message = "memory system is healthy now".to_string();
            return history;
        }
        if total <= maximum {
            history.header.process_level.set(ProcessLevel::Warning);
            history.header.message = "memory usage is in warning level now".to_string();
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
                "!memory check weak detected! start to remove containers",
                &uuid,
            )
            .await;
        history.header.set_alarm_result(&delivery);

        let min_remove = self.cfg.min_usage_to_remove.as_u64();
        let mut removed = Vec::new();
        for target in stats.iter().filter(|s| s.memory_bytes > min_remove) {
            match self.docker.remove_container(&target.id, true).await {
                Ok(()) => removed.push(target.id.clone()),
                Err(e) => {
                    let msg = format!(
                        "!memory check error occurred! failed to remove container, id: {}, err: {}",
                        target.id, e
                    );
                    let _ = self.chat.send_message("broken_heart", &msg, &uuid).await;
                    history
                        .header
                        .set_error(format!("failed to remove container: {}", e));
                }
            }
        }
        history.if_containers_removed = !removed.is_empty();
        history.removed_containers = removed;
        if history.if_containers_removed && history.header.error.is_none() {
            history.header.message =
                "removed containers as memory usage is more than the maximum".to_string();
        }

        let again = match self.docker.container_stats().await {
            Ok(v) => v,
            Err(e) => {
                self.status.set(CheckStatus::Unhealthy);
                let _ = self
                    .chat
                    .send_message(
                        "broken_heart",
                        "!memory check error occurred! failed to again get memory usage, please check for yourself",
                        &uuid,
                    )
                    .await;
                history
                    .header
                    .set_error(format!("failed to again get total memory usage: {}", e));
                return history;
            }
        };
        let again_total = total_usage(&again);
        history.total_usage_bytes = Some(again_total);

        if again_total < maximum {
            self.status.set(CheckStatus::Healthy);
            let msg = format!(
                "!memory check is recovered! total usage - {}",
                ByteSize(again_total)
            );
            let _ = self.chat.send_message("heart", &msg, &uuid).await;
        } else {
            self.status.set(CheckStatus::Unhealthy);
            let _ = self
                .chat
                .send_message(
                    "broken_heart",
                    "!memory check has deteriorated! please check for yourself",
                    &uuid,
                )
                .await;
        }
        history
    }
}

#[async_trait::async_trait]
impl Check for MemoryCheck {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn cycle(&self) -> Duration {
        self.cfg.check_cycle
    }

    async fn run(&self) -> Result<()> {
        let history = self.observe().await;
        self.history.store(history.dotted_map()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::testing::{stat, MemoryHistoryStore, RecordingChat, ScriptedDocker};
    use serde_json::json;

    const GIB: u64 = 1 << 30;

    fn check(
        store: Arc<MemoryHistoryStore>,
        chat: Arc<RecordingChat>,
        docker: Arc<ScriptedDocker>,
    ) -> MemoryCheck {
        let cfg = MemoryCheckConfig {
            warning_usage: ByteSize::gib(6),
            maximum_usage: ByteSize::gib(7),
            min_usage_to_remove: ByteSize::gib(1),
            check_cycle: Duration::from_secs(300),
        };
        MemoryCheck::new(cfg, store, chat, docker)
    }

    #[tokio::test]
    async fn test_usage_below_warning_is_healthy() {
        let store = MemoryHistoryStore::shared();
        let chat = RecordingChat::shared();
        let docker = ScriptedDocker::shared();
        docker.push_stats(Ok(vec![stat("a", 0.0, 2 * GIB), stat("b", 0.0, GIB)]));

        let check = check(store.clone(), chat.clone(), docker);
        check.run().await.unwrap();

        assert_eq!(check.status.get(), CheckStatus::Healthy);
        let doc = store.only_doc();
        assert_eq!(doc["process_level"], json!("HEALTHY"));
        assert_eq!(doc["total_usage_bytes"], json!(3 * GIB));
        assert!(chat.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_warning_band_is_flagged_without_remediation() {
        let store = MemoryHistoryStore::shared();
        let chat = RecordingChat::shared();
        let docker = ScriptedDocker::shared();
        docker.push_stats(Ok(vec![stat("a", 0.0, 13 * GIB / 2)]));

        let check = check(store.clone(), chat.clone(), docker.clone());
        check.run().await.unwrap();

        let doc = store.only_doc();
        assert_eq!(doc["process_level"], json!("WARNING"));
        assert!(docker.removed.lock().is_empty());
        assert!(chat.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_weakness_removes_heavy_containers_and_recovers() {
        let store = MemoryHistoryStore::shared();
        let chat = RecordingChat::shared();
        let docker = ScriptedDocker::shared();
        docker.push_stats(Ok(vec![
            stat("hog", 0.0, 6 * GIB),
            stat("small", 0.0, GIB / 2),
            stat("mid", 0.0, 2 * GIB),
        ]));
        docker.push_stats(Ok(vec![stat("small", 0.0, GIB / 2)]));

        let check = check(store.clone(), chat.clone(), docker.clone());
        check.run().await.unwrap();

        assert_eq!(check.status.get(), CheckStatus::Healthy);
        assert_eq!(*docker.removed.lock(), vec!["hog".to_string(), "mid".to_string()]);
        let doc = store.only_doc();
        assert_eq!(doc["process_level"], json!("WEAK_DETECTED"));
        assert_eq!(doc["if_containers_removed"], json!(true));
        assert_eq!(doc["removed_containers"], json!(["hog", "mid"]));
        assert_eq!(chat.emojis(), vec!["pill", "heart"]);
    }

    #[tokio::test]
    async fn test_recovering_tick_is_guarded() {
        let store = MemoryHistoryStore::shared();
        let chat = RecordingChat::shared();
        let docker = ScriptedDocker::shared();

        let check = check(store.clone(), chat.clone(), docker);
        check.status.set(CheckStatus::Recovering);
        check.run().await.unwrap();

        let doc = store.only_doc();
        assert_eq!(doc["process_level"], json!("RECOVERING"));
        assert!(!doc.contains_key("total_usage_bytes"));
        assert!(chat.sent.lock().is_empty());
    }
}
