//! Swarmpit check
//!
//! Probe: memory usage of the container backing the configured swarmpit
//! service. Remediation: force-remove the container and let the
//! orchestrator re-create it. The restart is asynchronous on the
//! orchestrator side, so a successful removal goes straight back to
//! `Healthy` without a re-probe; waiting here would only serialize future
//! ticks.

use bytesize::ByteSize;
use std::sync::Arc;
use std::time::Duration;

use super::status::{CheckStatus, StatusCell};
use super::Check;
use crate::agency::chat::ChatAgency;
use crate::agency::docker::DockerAgency;
use crate::config::SwarmpitCheckConfig;
use crate::history::{HistoryStore, ProcessLevel, SwarmpitCheckHistory};
use crate::utils::error::{HealthError, Result};

/// Swarmpit app health check.
pub struct SwarmpitCheck {
    cfg: SwarmpitCheckConfig,
    history: Arc<dyn HistoryStore>,
    chat: Arc<dyn ChatAgency>,
    docker: Arc<dyn DockerAgency>,
    status: StatusCell,
}

impl SwarmpitCheck {
    /// Create the check; status starts at `Healthy`.
    pub fn new(
        cfg: SwarmpitCheckConfig,
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

    fn guard_record(&self, history: &mut SwarmpitCheckHistory) {
        history.header.process_level.set(ProcessLevel::Recovering);
        history.header.message = "recovering swarmpit health is already on process".to_string();
    }

    async fn probe_failed(&self, history: &mut SwarmpitCheckHistory, err: HealthError) {
        let uuid = history.header.uuid.clone();
        history.header.process_level.set(ProcessLevel::Error);
        history
            .header
            .set_error(format!("failed to get swarmpit app docker container: {}", err));
        let delivery = self
            .chat
            .send_message(
                "x",
                "!swarmpit check error occurred! unable to get swarmpit app container",
                &uuid,
            )
            .await;
        history.header.set_alarm_result(&delivery);
    }

    async fn observe(&self) -> SwarmpitCheckHistory {
        let mut history = SwarmpitCheckHistory::new();
        let uuid = history.header.uuid.clone();
        let max_memory = self.cfg.app_max_memory.as_u64();

        match self.status.get() {
            CheckStatus::Recovering => {
                self.guard_record(&mut history);
                return history;
            }
            CheckStatus::Unhealthy => {
                let container = match self
                    .docker
                    .container_for_service(&self.cfg.app_service_name)
                    .await
                {
                    Ok(v) => v,
                    Err(e) => {
                        self.probe_failed(&mut history, e).await;
                        return history;
                    }
                };
                history.swarmpit_app_memory_usage = Some(container.memory_usage);

                if container.memory_usage < max_memory {
                    self.status.set(CheckStatus::Healthy);
                    history.header.process_level.set(ProcessLevel::Recovered);
                    history.header.message =
                        "swarmpit check is recovered to be healthy".to_string();
                    let msg = format!(
                        "!swarmpit check recovered to health! memory usage - {}",
                        ByteSize(container.memory_usage)
                    );
                    let delivery = self.chat.send_message("heart", &msg, &uuid).await;
                    history.header.set_alarm_result(&delivery);
                } else {
                    history.header.process_level.set(ProcessLevel::Unhealthy);
                    history.header.message = "swarmpit check is unhealthy now".to_string();
                }
                return history;
            }
            CheckStatus::Healthy => {}
        }

        let container = match self
            .docker
            .container_for_service(&self.cfg.app_service_name)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                self.probe_failed(&mut history, e).await;
                return history;
            }
        };
        history.swarmpit_app_memory_usage = Some(container.memory_usage);

        if container.memory_usage <= max_memory {
            history.header.process_level.set(ProcessLevel::Healthy);
            history.header.message = "swarmpit service is healthy now".to_string();
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
                "!swarmpit check weak detected! start to restart swarmpit app",
                &uuid,
            )
            .await;
        history.header.set_alarm_result(&delivery);

        match self.docker.remove_container(&container.id, true).await {
            Ok(()) => {
                // the orchestrator re-creates the container asynchronously
                self.status.set(CheckStatus::Healthy);
                history.if_swarmpit_app_restarted = true;
                history.header.message =
                    "restart swarmpit app as swarmpit app memory usage is more than the maximum"
                        .to_string();
                let _ = self
                    .chat
                    .send_message(
                        "heart",
                        "!swarmpit check is recovered! succeed to restart swarmpit app",
                        &uuid,
                    )
                    .await;
            }
            Err(e) => {
                self.status.set(CheckStatus::Unhealthy);
                let _ = self
                    .chat
                    .send_message(
                        "anger",
                        "!swarmpit check error occurred! failed to remove swarmpit app, please check for yourself",
                        &uuid,
                    )
                    .await;
                history
                    .header
                    .set_error(format!("failed to remove swarmpit app: {}", e));
            }
        }
        history
    }
}

#[async_trait::async_trait]
impl Check for SwarmpitCheck {
    fn name(&self) -> &'static str {
        "swarmpit"
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
    use crate::agency::docker::ServiceContainer;
    use crate::check::testing::{MemoryHistoryStore, RecordingChat, ScriptedDocker};
    use serde_json::json;

    const MIB: u64 = 1 << 20;

    fn check(
        store: Arc<MemoryHistoryStore>,
        chat: Arc<RecordingChat>,
        docker: Arc<ScriptedDocker>,
    ) -> SwarmpitCheck {
        let cfg = SwarmpitCheckConfig {
            app_service_name: "swarmpit_app".to_string(),
            app_max_memory: ByteSize::mb(600),
            check_cycle: Duration::from_secs(6 * 3600),
        };
        SwarmpitCheck::new(cfg, store, chat, docker)
    }

    fn app_container(memory_usage: u64) -> ServiceContainer {
        ServiceContainer {
            id: "swarmpit-app-1".to_string(),
            memory_usage,
        }
    }

    #[tokio::test]
    async fn test_app_below_limit_is_healthy() {
        let store = MemoryHistoryStore::shared();
        let chat = RecordingChat::shared();
        let docker = ScriptedDocker::shared();
        docker.push_service_container(Ok(app_container(200 * MIB)));

        let check = check(store.clone(), chat.clone(), docker.clone());
        check.run().await.unwrap();

        assert_eq!(check.status.get(), CheckStatus::Healthy);
        let doc = store.only_doc();
        assert_eq!(doc["process_level"], json!("HEALTHY"));
        assert_eq!(doc["swarmpit_app_memory_usage"], json!(200 * MIB));
        assert!(docker.removed.lock().is_empty());
        assert!(chat.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_successful_restart_recovers_without_reprobe() {
        let store = MemoryHistoryStore::shared();
        let chat = RecordingChat::shared();
        let docker = ScriptedDocker::shared();
        // one single lookup scripted: a re-probe would panic
        docker.push_service_container(Ok(app_container(900 * MIB)));

        let check = check(store.clone(), chat.clone(), docker.clone());
        check.run().await.unwrap();

        assert_eq!(check.status.get(), CheckStatus::Healthy);
        assert_eq!(*docker.removed.lock(), vec!["swarmpit-app-1".to_string()]);
        let doc = store.only_doc();
        assert_eq!(doc["process_level"], json!("WEAK_DETECTED"));
        assert_eq!(doc["if_swarmpit_app_restarted"], json!(true));
        assert_eq!(chat.emojis(), vec!["pill", "heart"]);
    }

    #[tokio::test]
    async fn test_failed_restart_goes_unhealthy() {
        let store = MemoryHistoryStore::shared();
        let chat = RecordingChat::shared();
        let docker = ScriptedDocker::shared();
        docker.push_service_container(Ok(app_container(900 * MIB)));
        docker.fail_removal_of("swarmpit-app-1");

        let check = check(store.clone(), chat.clone(), docker);
        check.run().await.unwrap();

        assert_eq!(check.status.get(), CheckStatus::Unhealthy);
        let doc = store.only_doc();
        let levels = doc["process_level"].as_str().unwrap();
        assert!(levels.contains("WEAK_DETECTED"));
        assert!(levels.contains("ERROR"));
        assert_eq!(doc["if_swarmpit_app_restarted"], json!(false));
        assert_eq!(chat.emojis(), vec!["pill", "anger"]);
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
        assert!(!doc.contains_key("swarmpit_app_memory_usage"));
        assert!(chat.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unhealthy_recovers_when_memory_drops() {
        let store = MemoryHistoryStore::shared();
        let chat = RecordingChat::shared();
        let docker = ScriptedDocker::shared();
        docker.push_service_container(Ok(app_container(100 * MIB)));

        let check = check(store.clone(), chat.clone(), docker);
        check.status.set(CheckStatus::Unhealthy);
        check.run().await.unwrap();

        assert_eq!(check.status.get(), CheckStatus::Healthy);
        let doc = store.only_doc();
        assert_eq!(doc["process_level"], json!("RECOVERED"));
        assert_eq!(chat.emojis(), vec!["heart"]);
    }
}
