//! CPU check
//!
//! Probe: total container CPU usage across all running containers, in
//! fraction-of-cores. Two thresholds: above `warning_usage` the record is
//! flagged WARNING without remediation; above `maximum_usage` every
//! container whose own usage exceeds `min_usage_to_remove` is force-removed
//! and a re-probe decides the outcome.

use std::sync::Arc;
use std::time::Duration;

use super::status::{CheckStatus, StatusCell};
use super::Check;
use crate::agency::chat::ChatAgency;
use crate::agency::docker::{ContainerStat, DockerAgency};
use crate::config::CpuCheckConfig;
use crate::history::{CpuCheckHistory, HistoryStore, ProcessLevel};
use crate::utils::error::{HealthError, Result};

/// Container CPU health check.
pub struct CpuCheck {
    cfg: CpuCheckConfig,
    history: Arc<dyn HistoryStore>,
    chat: Arc<dyn ChatAgency>,
    docker: Arc<dyn DockerAgency>,
    status: StatusCell,
}

fn total_usage(stats: &[ContainerStat]) -> f64 {
    stats.iter().map(|s| s.cpu_cores).sum()
}

impl CpuCheck {
    /// Create the check; status starts at `Healthy`.
    pub fn new(
        cfg: CpuCheckConfig,
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

    fn guard_record(&self, history: &mut CpuCheckHistory) {
        history.header.process_level.set(ProcessLevel::Recovering);
        history.header.message = "removing containers is already on process".to_string();
    }

    async fn probe_failed(&self, history: &mut CpuCheckHistory, err: HealthError) {
        let uuid = history.header.uuid.clone();
        history.header.process_level.set(ProcessLevel::Error);
        history
            .header
            .set_error(format!("failed to get total cpu usage: {}", err));
        let delivery = self
            .chat
            .send_message(
                "x",
                "!cpu check error occurred! unable to get container cpu usage",
                &uuid,
            )
            .await;
        history.header.set_alarm_result(&delivery);
    }

    async fn observe(&self) -> CpuCheckHistory {
        let mut history = CpuCheckHistory::new();
        let uuid = history.header.uuid.clone();

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
                history.total_usage_cores = Some(total);

                if total < self.cfg.maximum_usage {
                    self.status.set(CheckStatus::Healthy);
                    history.header.process_level.set(ProcessLevel::Recovered);
                    history.header.message = "cpu check is recovered to be healthy".to_string();
                    let msg = format!(
                        "!cpu check recovered to health! total usage - {:.2} cores",
                        total
                    );
                    let delivery = self.chat.send_message("heart", &msg, &uuid).await;
                    history.header.set_alarm_result(&delivery);
                } else {
                    history.header.process_level.set(ProcessLevel::Unhealthy);
                    history.header.message = "cpu check is unhealthy now".to_string();
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
        history.total_usage_cores = Some(total);

        if total <= self.cfg.warning_usage {
            history.header.process_level.set(ProcessLevel::Healthy);
            history.header.message = "cpu system is healthy now".to_string();
            return history;
        }
        if total <= self.cfg.maximum_usage {
            history.header.process_level.set(ProcessLevel::Warning);
            history.header.message = "cpu usage is in warning level now".to_string();
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
                "!cpu check weak detected! start to remove containers",
                &uuid,
            )
            .await;
        history.header.set_alarm_result(&delivery);

        let mut removed = Vec::new();
        for target in stats
            .iter()
            .filter(|s| s.cpu_cores > self.cfg.min_usage_to_remove)
        {
            match self.docker.remove_container(&target.id, true).await {
                Ok(()) => removed.push(target.id.clone()),
                Err(e) => {
                    let msg = format!(
                        "!cpu check error occurred! failed to remove container, id: {}, err: {}",
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
                "removed containers as cpu usage is more than the maximum".to_string();
        }

        let again = match self.docker.container_stats().await {
            Ok(v) => v,
            Err(e) => {
                self.status.set(CheckStatus::Unhealthy);
                let _ = self
                    .chat
                    .send_message(
                        "broken_heart",
                        "!cpu check error occurred! failed to again get cpu usage, please check for yourself",
                        &uuid,
                    )
                    .await;
                history
                    .header
                    .set_error(format!("failed to again get total cpu usage: {}", e));
                return history;
            }
        };
        let again_total = total_usage(&again);
        history.total_usage_cores = Some(again_total);

        if again_total < self.cfg.maximum_usage {
            self.status.set(CheckStatus::Healthy);
            let msg = format!("!cpu check is recovered! total usage - {:.2} cores", again_total);
            let _ = self.chat.send_message("heart", &msg, &uuid).await;
        } else {
            self.status.set(CheckStatus::Unhealthy);
            let _ = self
                .chat
                .send_message(
                    "broken_heart",
                    "!cpu check has deteriorated! please check for yourself",
                    &uuid,
                )
                .await;
        }
        history
    }
}

#[async_trait::async_trait]
impl Check for CpuCheck {
    fn name(&self) -> &'static str {
        "cpu"
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

    fn check(
        store: Arc<MemoryHistoryStore>,
        chat: Arc<RecordingChat>,
        docker: Arc<ScriptedDocker>,
    ) -> CpuCheck {
        let cfg = CpuCheckConfig {
            warning_usage: 1.0,
            maximum_usage: 1.5,
            min_usage_to_remove: 0.5,
            check_cycle: Duration::from_secs(300),
        };
        CpuCheck::new(cfg, store, chat, docker)
    }

    #[tokio::test]
    async fn test_usage_below_warning_is_healthy() {
        let store = MemoryHistoryStore::shared();
        let chat = RecordingChat::shared();
        let docker = ScriptedDocker::shared();
        docker.push_stats(Ok(vec![stat("a", 0.25, 0), stat("b", 0.5, 0)]));

        let check = check(store.clone(), chat.clone(), docker);
        check.run().await.unwrap();

        assert_eq!(check.status.get(), CheckStatus::Healthy);
        let doc = store.only_doc();
        assert_eq!(doc["process_level"], json!("HEALTHY"));
        assert_eq!(doc["total_usage_cores"], json!(0.75));
        assert_eq!(doc["if_containers_removed"], json!(false));
        assert!(chat.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_warning_band_is_flagged_without_remediation() {
        let store = MemoryHistoryStore::shared();
        let chat = RecordingChat::shared();
        let docker = ScriptedDocker::shared();
        docker.push_stats(Ok(vec![stat("a", 1.2, 0)]));

        let check = check(store.clone(), chat.clone(), docker.clone());
        check.run().await.unwrap();

        assert_eq!(check.status.get(), CheckStatus::Healthy);
        let doc = store.only_doc();
        assert_eq!(doc["process_level"], json!("WARNING"));
        assert!(docker.removed.lock().is_empty());
        assert!(chat.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_weakness_removes_only_heavy_containers() {
        let store = MemoryHistoryStore::shared();
        let chat = RecordingChat::shared();
        let docker = ScriptedDocker::shared();
        docker.push_stats(Ok(vec![
            stat("heavy-1", 1.2, 0),
            stat("light", 0.2, 0),
            stat("heavy-2", 0.8, 0),
        ]));
        docker.push_stats(Ok(vec![stat("light", 0.2, 0)]));

        let check = check(store.clone(), chat.clone(), docker.clone());
        check.run().await.unwrap();

        assert_eq!(check.status.get(), CheckStatus::Healthy);
        assert_eq!(
            *docker.removed.lock(),
            vec!["heavy-1".to_string(), "heavy-2".to_string()]
        );
        let doc = store.only_doc();
        assert_eq!(doc["process_level"], json!("WEAK_DETECTED"));
        assert_eq!(doc["if_containers_removed"], json!(true));
        assert_eq!(doc["removed_containers"], json!(["heavy-1", "heavy-2"]));
        assert_eq!(doc["total_usage_cores"], json!(0.2));
        assert_eq!(chat.emojis(), vec!["pill", "heart"]);
    }

    #[tokio::test]
    async fn test_partial_removal_failure_is_surfaced() {
        let store = MemoryHistoryStore::shared();
        let chat = RecordingChat::shared();
        let docker = ScriptedDocker::shared();
        docker.push_stats(Ok(vec![stat("stuck", 1.0, 0), stat("movable", 0.9, 0)]));
        docker.fail_removal_of("stuck");
        docker.push_stats(Ok(vec![stat("stuck", 1.0, 0)]));

        let check = check(store.clone(), chat.clone(), docker.clone());
        check.run().await.unwrap();

        // removal of "movable" succeeded, "stuck" failed, re-probe below max
        assert_eq!(check.status.get(), CheckStatus::Healthy);
        let doc = store.only_doc();
        let levels = doc["process_level"].as_str().unwrap();
        assert!(levels.contains("WEAK_DETECTED"));
        assert!(levels.contains("ERROR"));
        assert_eq!(doc["removed_containers"], json!(["movable"]));
        assert!(!doc["error"].is_null());
        assert_eq!(chat.emojis(), vec!["pill", "broken_heart", "heart"]);
    }

    #[tokio::test]
    async fn test_reprobe_still_hot_goes_unhealthy() {
        let store = MemoryHistoryStore::shared();
        let chat = RecordingChat::shared();
        let docker = ScriptedDocker::shared();
        docker.push_stats(Ok(vec![stat("a", 2.0, 0)]));
        docker.push_stats(Ok(vec![stat("b", 1.9, 0)]));

        let check = check(store.clone(), chat.clone(), docker);
        check.run().await.unwrap();

        assert_eq!(check.status.get(), CheckStatus::Unhealthy);
        let doc = store.only_doc();
        assert_eq!(doc["total_usage_cores"], json!(1.9));
        assert_eq!(chat.emojis(), vec!["pill", "broken_heart"]);
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
        assert!(!doc.contains_key("total_usage_cores"));
        assert!(chat.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unhealthy_recovers_on_cool_probe() {
        let store = MemoryHistoryStore::shared();
        let chat = RecordingChat::shared();
        let docker = ScriptedDocker::shared();
        docker.push_stats(Ok(vec![stat("a", 0.4, 0)]));

        let check = check(store.clone(), chat.clone(), docker);
        check.status.set(CheckStatus::Unhealthy);
        check.run().await.unwrap();

        assert_eq!(check.status.get(), CheckStatus::Healthy);
        let doc = store.only_doc();
        assert_eq!(doc["process_level"], json!("RECOVERED"));
        assert_eq!(chat.emojis(), vec!["heart"]);
    }
}
