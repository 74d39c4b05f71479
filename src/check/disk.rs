//! Disk check
//!
//! Probe: remaining capacity of the host filesystem. Weakness: capacity
//! below the configured floor. Remediation: docker system prune, then a
//! re-probe decides whether the prune was enough.

use bytesize::ByteSize;
use std::sync::Arc;
use std::time::Duration;

use super::status::{CheckStatus, StatusCell};
use super::Check;
use crate::agency::chat::ChatAgency;
use crate::agency::system::DiskSysAgency;
use crate::config::DiskCheckConfig;
use crate::history::{DiskCheckHistory, HistoryStore, ProcessLevel};
use crate::utils::error::{HealthError, Result};

/// Host disk health check.
pub struct DiskCheck {
    cfg: DiskCheckConfig,
    history: Arc<dyn HistoryStore>,
    chat: Arc<dyn ChatAgency>,
    disk: Arc<dyn DiskSysAgency>,
    status: StatusCell,
}

impl DiskCheck {
    /// Create the check; status starts at `Healthy`.
    pub fn new(
        cfg: DiskCheckConfig,
        history: Arc<dyn HistoryStore>,
        chat: Arc<dyn ChatAgency>,
        disk: Arc<dyn DiskSysAgency>,
    ) -> Self {
        Self {
            cfg,
            history,
            chat,
            disk,
            status: StatusCell::new(),
        }
    }

    fn guard_record(&self, history: &mut DiskCheckHistory) {
        history.header.process_level.set(ProcessLevel::Recovering);
        history.header.message = "pruning docker system is already on process".to_string();
    }

    async fn probe_failed(&self, history: &mut DiskCheckHistory, err: HealthError) {
        let uuid = history.header.uuid.clone();
        history.header.process_level.set(ProcessLevel::Error);
        history
            .header
            .set_error(format!("failed to get remain disk capacity: {}", err));
        let delivery = self
            .chat
            .send_message(
                "x",
                "!disk check error occurred! unable to get remain disk capacity",
                &uuid,
            )
            .await;
        history.header.set_alarm_result(&delivery);
    }

    async fn observe(&self) -> DiskCheckHistory {
        let mut history = DiskCheckHistory::new();
        let uuid = history.header.uuid.clone();
        let min_capacity = self.cfg.min_capacity.as_u64();

        match self.status.get() {
            CheckStatus::Recovering => {
                self.guard_record(&mut history);
                return history;
            }
            CheckStatus::Unhealthy => {
                let remain = match self.disk.remaining_disk_capacity().await {
                    Ok(v) => v,
                    Err(e) => {
                        self.probe_failed(&mut history, e).await;
                        return history;
                    }
                };
                history.remaining_capacity = Some(remain);

                if remain > min_capacity {
                    self.status.set(CheckStatus::Healthy);
                    history.header.process_level.set(ProcessLevel::Recovered);
                    history.header.message = "disk check is recovered to be healthy".to_string();
                    let msg = format!(
                        "!disk check recovered to health! remain capacity - {}",
                        ByteSize(remain)
                    );
                    let delivery = self.chat.send_message("heart", &msg, &uuid).await;
                    history.header.set_alarm_result(&delivery);
                } else {
                    history.header.process_level.set(ProcessLevel::Unhealthy);
                    history.header.message = "disk check is unhealthy now".to_string();
                }
                return history;
            }
            CheckStatus::Healthy => {}
        }

        let remain = match self.disk.remaining_disk_capacity().await {
            Ok(v) => v,
            Err(e) => {
                self.probe_failed(&mut history, e).await;
                return history;
            }
        };
        history.remaining_capacity = Some(remain);

        if remain >= min_capacity {
            history.header.process_level.set(ProcessLevel::Healthy);
            history.header.message = "disk system is healthy now".to_string();
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
                "!disk check weak detected! start to prune docker system",
                &uuid,
            )
            .await;
        history.header.set_alarm_result(&delivery);

        match self.disk.prune_docker_system().await {
            Ok(reclaimed) => {
                history.reclaimed_capacity = Some(reclaimed);
                history.header.message =
                    "pruned docker system as current disk capacity is less than the minimum"
                        .to_string();
            }
            Err(e) => {
                self.status.set(CheckStatus::Unhealthy);
                history.header.process_level.append(ProcessLevel::Warning);
                let _ = self
                    .chat
                    .send_message(
                        "anger",
                        "!disk check error occurred! failed to prune docker system",
                        &uuid,
                    )
                    .await;
                history
                    .header
                    .set_error(format!("failed to prune docker system: {}", e));
                return history;
            }
        }

        let again = match self.disk.remaining_disk_capacity().await {
            Ok(v) => v,
            Err(e) => {
                self.status.set(CheckStatus::Unhealthy);
                let _ = self
                    .chat
                    .send_message(
                        "broken_heart",
                        "!disk check error occurred! failed to again get disk capacity, please check for yourself",
                        &uuid,
                    )
                    .await;
                history
                    .header
                    .set_error(format!("failed to again get remain disk capacity: {}", e));
                return history;
            }
        };

        if again > min_capacity {
            self.status.set(CheckStatus::Healthy);
            let msg = format!(
                "!disk check is healthy by pruning! remain capacity - {}",
                ByteSize(again)
            );
            let _ = self.chat.send_message("heart", &msg, &uuid).await;
        } else {
            self.status.set(CheckStatus::Unhealthy);
            let _ = self
                .chat
                .send_message(
                    "broken_heart",
                    "!disk check has deteriorated! please check for yourself",
                    &uuid,
                )
                .await;
        }
        history
    }
}

#[async_trait::async_trait]
impl Check for DiskCheck {
    fn name(&self) -> &'static str {
        "disk"
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
    use crate::check::testing::{MemoryHistoryStore, RecordingChat, ScriptedDisk};
    use serde_json::json;

    const GIB: u64 = 1 << 30;

    fn check(
        store: Arc<MemoryHistoryStore>,
        chat: Arc<RecordingChat>,
        disk: Arc<ScriptedDisk>,
    ) -> DiskCheck {
        let cfg = DiskCheckConfig {
            min_capacity: ByteSize::gib(2),
            check_cycle: Duration::from_secs(300),
        };
        DiskCheck::new(cfg, store, chat, disk)
    }

    #[tokio::test]
    async fn test_steady_state_stays_healthy_and_silent() {
        let store = MemoryHistoryStore::shared();
        let chat = RecordingChat::shared();
        let disk = ScriptedDisk::shared();
        disk.push_capacity(Ok(10 * GIB));

        let check = check(store.clone(), chat.clone(), disk);
        check.run().await.unwrap();

        assert_eq!(check.status.get(), CheckStatus::Healthy);
        let doc = store.only_doc();
        assert_eq!(doc["process_level"], json!("HEALTHY"));
        assert_eq!(doc["remaining_capacity"], json!(10 * GIB));
        assert!(chat.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_remediation_succeeds_and_recovers() {
        let store = MemoryHistoryStore::shared();
        let chat = RecordingChat::shared();
        let disk = ScriptedDisk::shared();
        disk.push_capacity(Ok(GIB));
        disk.push_prune(Ok(4 * GIB));
        disk.push_capacity(Ok(5 * GIB));

        let check = check(store.clone(), chat.clone(), disk);
        check.run().await.unwrap();

        assert_eq!(check.status.get(), CheckStatus::Healthy);
        let doc = store.only_doc();
        assert_eq!(doc["process_level"], json!("WEAK_DETECTED"));
        assert_eq!(doc["reclaimed_capacity"], json!(4 * GIB));
        assert_eq!(chat.emojis(), vec!["pill", "heart"]);
        // the weakness alarm is mirrored on the record
        assert_eq!(doc["alerted"], json!(true));
        assert!(doc["alarm_text"].as_str().unwrap().contains("weak detected"));
        // every chat of the tick is correlated with the record uuid
        let doc_uuid = doc["uuid"].as_str().unwrap();
        let sent = chat.sent.lock();
        assert!(sent.iter().all(|m| m.uuid == doc_uuid));
        assert!(sent[0].text.contains("weak detected"));
    }

    #[tokio::test]
    async fn test_prune_failure_goes_unhealthy() {
        let store = MemoryHistoryStore::shared();
        let chat = RecordingChat::shared();
        let disk = ScriptedDisk::shared();
        disk.push_capacity(Ok(GIB));
        disk.push_prune(Err(HealthError::System("prune refused".to_string())));

        let check = check(store.clone(), chat.clone(), disk);
        check.run().await.unwrap();

        assert_eq!(check.status.get(), CheckStatus::Unhealthy);
        let doc = store.only_doc();
        let levels = doc["process_level"].as_str().unwrap();
        assert!(levels.contains("WEAK_DETECTED"));
        assert!(levels.contains("WARNING"));
        assert!(!doc["error"].is_null());
        assert_eq!(chat.emojis(), vec!["pill", "anger"]);
    }

    #[tokio::test]
    async fn test_reprobe_failure_goes_unhealthy() {
        let store = MemoryHistoryStore::shared();
        let chat = RecordingChat::shared();
        let disk = ScriptedDisk::shared();
        disk.push_capacity(Ok(GIB));
        disk.push_prune(Ok(512 << 20));
        disk.push_capacity(Err(HealthError::System("statfs failed".to_string())));

        let check = check(store.clone(), chat.clone(), disk);
        check.run().await.unwrap();

        assert_eq!(check.status.get(), CheckStatus::Unhealthy);
        let doc = store.only_doc();
        let levels = doc["process_level"].as_str().unwrap();
        assert!(levels.contains("WEAK_DETECTED"));
        assert!(levels.contains("ERROR"));
        assert_eq!(chat.emojis(), vec!["pill", "broken_heart"]);
    }

    #[tokio::test]
    async fn test_recovering_tick_is_guarded_and_makes_no_probe() {
        let store = MemoryHistoryStore::shared();
        let chat = RecordingChat::shared();
        // empty script: any probe would panic
        let disk = ScriptedDisk::shared();

        let check = check(store.clone(), chat.clone(), disk);
        check.status.set(CheckStatus::Recovering);
        check.run().await.unwrap();

        let doc = store.only_doc();
        assert_eq!(doc["process_level"], json!("RECOVERING"));
        assert!(!doc.contains_key("remaining_capacity"));
        assert!(chat.sent.lock().is_empty());
        assert_eq!(check.status.get(), CheckStatus::Recovering);
    }

    #[tokio::test]
    async fn test_unhealthy_tick_recovers_when_probe_is_good_again() {
        let store = MemoryHistoryStore::shared();
        let chat = RecordingChat::shared();
        let disk = ScriptedDisk::shared();
        disk.push_capacity(Ok(8 * GIB));

        let check = check(store.clone(), chat.clone(), disk);
        check.status.set(CheckStatus::Unhealthy);
        check.run().await.unwrap();

        assert_eq!(check.status.get(), CheckStatus::Healthy);
        let doc = store.only_doc();
        assert_eq!(doc["process_level"], json!("RECOVERED"));
        assert_eq!(chat.emojis(), vec!["heart"]);
        assert_eq!(doc["alerted"], json!(true));
    }

    #[tokio::test]
    async fn test_unhealthy_tick_stays_put_without_remediation() {
        let store = MemoryHistoryStore::shared();
        let chat = RecordingChat::shared();
        let disk = ScriptedDisk::shared();
        disk.push_capacity(Ok(GIB));
        // no prune scripted: attempting one would panic

        let check = check(store.clone(), chat.clone(), disk);
        check.status.set(CheckStatus::Unhealthy);
        check.run().await.unwrap();

        assert_eq!(check.status.get(), CheckStatus::Unhealthy);
        let doc = store.only_doc();
        assert_eq!(doc["process_level"], json!("UNHEALTHY"));
        assert!(chat.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_probe_failure_alarms_and_keeps_status() {
        let store = MemoryHistoryStore::shared();
        let chat = RecordingChat::shared();
        let disk = ScriptedDisk::shared();
        disk.push_capacity(Err(HealthError::System("statfs failed".to_string())));

        let check = check(store.clone(), chat.clone(), disk);
        check.run().await.unwrap();

        assert_eq!(check.status.get(), CheckStatus::Healthy);
        let doc = store.only_doc();
        assert_eq!(doc["process_level"], json!("ERROR"));
        assert!(!doc["error"].is_null());
        assert_eq!(chat.emojis(), vec!["x"]);
        assert_eq!(doc["alerted"], json!(true));
    }

    #[tokio::test]
    async fn test_store_failure_is_the_only_propagated_error() {
        let store = MemoryHistoryStore::failing();
        let chat = RecordingChat::shared();
        let disk = ScriptedDisk::shared();
        disk.push_capacity(Ok(10 * GIB));

        let check = check(store, chat, disk);
        let err = check.run().await.unwrap_err();
        assert!(matches!(err, HealthError::Storage(_)));
    }

    #[tokio::test]
    async fn test_record_uuids_are_unique_across_ticks() {
        let store = MemoryHistoryStore::shared();
        let chat = RecordingChat::shared();
        let disk = ScriptedDisk::shared();
        disk.push_capacity(Ok(10 * GIB));
        disk.push_capacity(Ok(10 * GIB));

        let check = check(store.clone(), chat, disk);
        check.run().await.unwrap();
        check.run().await.unwrap();

        let docs = store.docs.lock();
        assert_eq!(docs.len(), 2);
        assert_ne!(docs[0]["uuid"], docs[1]["uuid"]);
    }
}
