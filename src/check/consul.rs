//! Consul registry check
//!
//! The probe has two phases. Phase A lists every target service's instances
//! and dials each one with a bounded connection probe: a timeout marks the
//! registration as stale, while a probe failure aborts the tick. Phase B
//! then looks for target services with no instances at all. The ordering
//! matters: stale registrations must be cleared before a service can be
//! judged empty, otherwise a service whose only problem is ghost entries
//! would get its container restarted.
//!
//! Both remediation batches return to `Healthy` without a re-probe; the
//! next tick re-evaluates the registry.

use std::sync::Arc;
use std::time::Duration;

use super::status::{CheckStatus, StatusCell};
use super::Check;
use crate::agency::chat::ChatAgency;
use crate::agency::consul::ConsulAgency;
use crate::agency::docker::DockerAgency;
use crate::agency::ping::{PingAgency, PingOutcome};
use crate::config::ConsulCheckConfig;
use crate::history::{ConsulCheckHistory, HistoryStore, ProcessLevel};
use crate::utils::error::Result;

/// Consul registry health check.
pub struct ConsulCheck {
    cfg: ConsulCheckConfig,
    history: Arc<dyn HistoryStore>,
    chat: Arc<dyn ChatAgency>,
    consul: Arc<dyn ConsulAgency>,
    ping: Arc<dyn PingAgency>,
    docker: Arc<dyn DockerAgency>,
    status: StatusCell,
}

/// What the two probe phases observed.
struct Survey {
    /// Instance ids that timed out on the connection probe
    stale_instances: Vec<String>,
    /// Docker service names of targets with no registered instances
    empty_services: Vec<String>,
}

impl ConsulCheck {
    /// Create the check; status starts at `Healthy`.
    pub fn new(
        cfg: ConsulCheckConfig,
        history: Arc<dyn HistoryStore>,
        chat: Arc<dyn ChatAgency>,
        consul: Arc<dyn ConsulAgency>,
        ping: Arc<dyn PingAgency>,
        docker: Arc<dyn DockerAgency>,
    ) -> Self {
        Self {
            cfg,
            history,
            chat,
            consul,
            ping,
            docker,
            status: StatusCell::new(),
        }
    }

    fn guard_record(&self, history: &mut ConsulCheckHistory) {
        history.header.process_level.set(ProcessLevel::Recovering);
        history.header.message = "recovering consul health is already on process".to_string();
    }

    /// Run both probe phases, recording the instance map as it goes.
    /// Returns `None` when the tick must abort; the failure is already
    /// recorded on the history.
    async fn survey(&self, history: &mut ConsulCheckHistory) -> Option<Survey> {
        let uuid = history.header.uuid.clone();
        let mut instance_sets = Vec::new();

        for service in &self.cfg.check_target_services {
            let consul_name = format!("{}{}", self.cfg.consul_service_namespace, service);
            let instances = match self.consul.service_instances(&consul_name).await {
                Ok(v) => v,
                Err(e) => {
                    history.header.process_level.set(ProcessLevel::Error);
                    history
                        .header
                        .set_error(format!("failed to get services in consul: {}", e));
                    let delivery = self
                        .chat
                        .send_message(
                            "x",
                            "!consul check error occurred! unable to get services in consul",
                            &uuid,
                        )
                        .await;
                    history.header.set_alarm_result(&delivery);
                    return None;
                }
            };
            history
                .instances_per_service
                .insert(consul_name, instances.iter().map(|i| i.id.clone()).collect());
            instance_sets.push((service.clone(), instances));
        }

        // Phase A: connection probe of every registered instance
        let mut stale_instances = Vec::new();
        for (_, instances) in &instance_sets {
            for instance in instances {
                match self.ping.ping(&instance.address, self.cfg.ping_timeout).await {
                    PingOutcome::Reachable => {}
                    PingOutcome::Timeout => stale_instances.push(instance.id.clone()),
                    PingOutcome::Failed(reason) => {
                        history.header.process_level.set(ProcessLevel::Error);
                        history.header.set_error(format!(
                            "failed to ping connection check, id: {}: {}",
                            instance.id, reason
                        ));
                        return None;
                    }
                }
            }
        }

        // Phase B: target services with no instances at all
        let empty_services = instance_sets
            .iter()
            .filter(|(_, instances)| instances.is_empty())
            .map(|(service, _)| format!("{}{}", self.cfg.docker_service_namespace, service))
            .collect();

        Some(Survey {
            stale_instances,
            empty_services,
        })
    }

    async fn deregister_stale(&self, history: &mut ConsulCheckHistory, stale: Vec<String>) {
        let uuid = history.header.uuid.clone();
        history.header.process_level.set(ProcessLevel::WeakDetected);
        history.if_instance_deregistered = true;
        history.header.message =
            "deregistered instances in consul which are unable to check connection".to_string();
        let delivery = self
            .chat
            .send_message(
                "pill",
                "!consul check weak detected! start to deregister unable services",
                &uuid,
            )
            .await;
        history.header.set_alarm_result(&delivery);

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for id in stale {
            match self.consul.deregister_instance(&id).await {
                Ok(()) => succeeded.push(id),
                Err(e) => {
                    let msg = format!(
                        "!consul check error occurred! failed to deregister instance, id: {}, err: {}",
                        id, e
                    );
                    let _ = self.chat.send_message("broken_heart", &msg, &uuid).await;
                    history
                        .header
                        .set_error(format!("failed to deregister instance: {}", e));
                    failed.push(id);
                }
            }
        }
        history.deregistered_instances = succeeded;
        history.deregister_failed_instances = failed;

        // the unreachable instances are gone or will be retried next tick
        self.status.set(CheckStatus::Healthy);
    }

    async fn restart_empty(&self, history: &mut ConsulCheckHistory, services: Vec<String>) {
        let uuid = history.header.uuid.clone();
        history.header.process_level.set(ProcessLevel::WeakDetected);
        history.if_container_restarted = true;
        history.header.message =
            "restarted containers in docker which do not have any instances in consul".to_string();
        let delivery = self
            .chat
            .send_message(
                "pill",
                "!consul check weak detected! start to restart container",
                &uuid,
            )
            .await;
        history.header.set_alarm_result(&delivery);

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for service in services {
            let container = match self.docker.container_for_service(&service).await {
                Ok(v) => v,
                Err(e) => {
                    let msg = format!(
                        "!consul check error occurred! failed to get container, srv: {}, err: {}",
                        service, e
                    );
                    let _ = self.chat.send_message("broken_heart", &msg, &uuid).await;
                    history
                        .header
                        .set_error(format!("failed to get container: {}", e));
                    failed.push(service);
                    continue;
                }
            };
            match self.docker.remove_container(&container.id, true).await {
                Ok(()) => succeeded.push(service),
                Err(e) => {
                    let msg = format!(
                        "!consul check error occurred! failed to restart container, id: {}, err: {}",
                        container.id, e
                    );
                    let _ = self.chat.send_message("broken_heart", &msg, &uuid).await;
                    history
                        .header
                        .set_error(format!("failed to restart container: {}", e));
                    failed.push(service);
                }
            }
        }
        history.restarted_services = succeeded;
        history.restart_failed_services = failed;

        // the orchestrator re-creates and re-registers asynchronously
        self.status.set(CheckStatus::Healthy);
    }

    async fn observe(&self) -> ConsulCheckHistory {
        let mut history = ConsulCheckHistory::new();
        let uuid = history.header.uuid.clone();

        match self.status.get() {
            CheckStatus::Recovering => {
                self.guard_record(&mut history);
                return history;
            }
            CheckStatus::Unhealthy => {
                let survey = match self.survey(&mut history).await {
                    Some(s) => s,
                    None => return history,
                };
                if survey.stale_instances.is_empty() && survey.empty_services.is_empty() {
                    self.status.set(CheckStatus::Healthy);
                    history.header.process_level.set(ProcessLevel::Recovered);
                    history.header.message = "consul check is recovered to be healthy".to_string();
                    let delivery = self
                        .chat
                        .send_message("heart", "!consul check recovered to health!", &uuid)
                        .await;
                    history.header.set_alarm_result(&delivery);
                } else {
                    history.header.process_level.set(ProcessLevel::Unhealthy);
                    history.header.message = "consul check is unhealthy now".to_string();
                }
                return history;
            }
            CheckStatus::Healthy => {}
        }

        let survey = match self.survey(&mut history).await {
            Some(s) => s,
            None => return history,
        };

        if !survey.stale_instances.is_empty() {
            if !self.status.begin_recovery() {
                self.guard_record(&mut history);
                return history;
            }
            self.deregister_stale(&mut history, survey.stale_instances).await;
            return history;
        }

        if !survey.empty_services.is_empty() {
            if !self.status.begin_recovery() {
                self.guard_record(&mut history);
                return history;
            }
            self.restart_empty(&mut history, survey.empty_services).await;
            return history;
        }

        history.header.process_level.set(ProcessLevel::Healthy);
        history.header.message = "consul service is healthy now".to_string();
        history
    }
}

#[async_trait::async_trait]
impl Check for ConsulCheck {
    fn name(&self) -> &'static str {
        "consul"
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
    use crate::check::testing::{
        instance, MemoryHistoryStore, RecordingChat, ScriptedConsul, ScriptedDocker, ScriptedPing,
    };
    use serde_json::json;

    struct Fixture {
        store: Arc<MemoryHistoryStore>,
        chat: Arc<RecordingChat>,
        consul: Arc<ScriptedConsul>,
        ping: Arc<ScriptedPing>,
        docker: Arc<ScriptedDocker>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: MemoryHistoryStore::shared(),
                chat: RecordingChat::shared(),
                consul: ScriptedConsul::shared(),
                ping: ScriptedPing::shared(),
                docker: ScriptedDocker::shared(),
            }
        }

        fn check(&self, targets: &[&str]) -> ConsulCheck {
            let cfg = ConsulCheckConfig {
                check_target_services: targets.iter().map(|s| s.to_string()).collect(),
                consul_service_namespace: "fleet.service.".to_string(),
                docker_service_namespace: "fleet_service-".to_string(),
                ping_timeout: Duration::from_secs(5),
                check_cycle: Duration::from_secs(60),
            };
            ConsulCheck::new(
                cfg,
                self.store.clone(),
                self.chat.clone(),
                self.consul.clone(),
                self.ping.clone(),
                self.docker.clone(),
            )
        }
    }

    #[tokio::test]
    async fn test_all_instances_reachable_is_healthy() {
        let f = Fixture::new();
        f.consul.register(
            "fleet.service.auth",
            vec![instance("auth-1", "10.0.0.1:8080"), instance("auth-2", "10.0.0.2:8080")],
        );

        let check = f.check(&["auth"]);
        check.run().await.unwrap();

        assert_eq!(check.status.get(), CheckStatus::Healthy);
        let doc = f.store.only_doc();
        assert_eq!(doc["process_level"], json!("HEALTHY"));
        assert_eq!(
            doc["instances_per_service.fleet.service.auth"],
            json!(["auth-1", "auth-2"])
        );
        assert!(f.consul.deregistered.lock().is_empty());
        assert!(f.chat.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_stale_instance_is_deregistered_exactly_once() {
        let f = Fixture::new();
        f.consul.register(
            "fleet.service.auth",
            vec![instance("A", "10.0.0.1:8080"), instance("B", "10.0.0.2:8080")],
        );
        f.ping.answer("10.0.0.1:8080", PingOutcome::Timeout);

        let check = f.check(&["auth"]);
        check.run().await.unwrap();

        assert_eq!(check.status.get(), CheckStatus::Healthy);
        assert_eq!(*f.consul.deregistered.lock(), vec!["A".to_string()]);
        let doc = f.store.only_doc();
        assert_eq!(doc["process_level"], json!("WEAK_DETECTED"));
        assert_eq!(doc["if_instance_deregistered"], json!(true));
        assert_eq!(doc["deregistered_instances"], json!(["A"]));
        assert_eq!(doc["deregister_failed_instances"], json!([]));
        assert_eq!(f.chat.emojis(), vec!["pill"]);
    }

    #[tokio::test]
    async fn test_deregister_failures_are_tolerated() {
        let f = Fixture::new();
        f.consul.register(
            "fleet.service.auth",
            vec![instance("A", "10.0.0.1:8080"), instance("B", "10.0.0.2:8080")],
        );
        f.ping.answer("10.0.0.1:8080", PingOutcome::Timeout);
        f.ping.answer("10.0.0.2:8080", PingOutcome::Timeout);
        f.consul.fail_deregister_of("B");

        let check = f.check(&["auth"]);
        check.run().await.unwrap();

        // per-item failures do not stop the batch or the return to Healthy
        assert_eq!(check.status.get(), CheckStatus::Healthy);
        let doc = f.store.only_doc();
        let levels = doc["process_level"].as_str().unwrap();
        assert!(levels.contains("WEAK_DETECTED"));
        assert!(levels.contains("ERROR"));
        assert_eq!(doc["deregistered_instances"], json!(["A"]));
        assert_eq!(doc["deregister_failed_instances"], json!(["B"]));
        assert!(!doc["error"].is_null());
        assert_eq!(f.chat.emojis(), vec!["pill", "broken_heart"]);
    }

    #[tokio::test]
    async fn test_empty_service_restarts_its_container() {
        let f = Fixture::new();
        // "club" has no instances registered at all
        f.docker.push_service_container(Ok(ServiceContainer {
            id: "club-1".to_string(),
            memory_usage: 0,
        }));

        let check = f.check(&["club"]);
        check.run().await.unwrap();

        assert_eq!(check.status.get(), CheckStatus::Healthy);
        assert_eq!(*f.docker.removed.lock(), vec!["club-1".to_string()]);
        let doc = f.store.only_doc();
        assert_eq!(doc["if_container_restarted"], json!(true));
        assert_eq!(doc["restarted_services"], json!(["fleet_service-club"]));
        assert_eq!(doc["restart_failed_services"], json!([]));
        assert_eq!(
            doc["instances_per_service.fleet.service.club"],
            json!([])
        );
    }

    #[tokio::test]
    async fn test_stale_instances_shadow_emptiness_remediation() {
        let f = Fixture::new();
        // auth has a stale instance, club is empty; only the deregister
        // batch must run on this tick
        f.consul
            .register("fleet.service.auth", vec![instance("A", "10.0.0.1:8080")]);
        f.ping.answer("10.0.0.1:8080", PingOutcome::Timeout);

        let check = f.check(&["auth", "club"]);
        check.run().await.unwrap();

        let doc = f.store.only_doc();
        assert_eq!(doc["if_instance_deregistered"], json!(true));
        assert_eq!(doc["if_container_restarted"], json!(false));
        assert!(f.docker.removed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_ping_failure_is_fatal_for_the_tick() {
        let f = Fixture::new();
        f.consul
            .register("fleet.service.auth", vec![instance("A", "bad target")]);
        f.ping
            .answer("bad target", PingOutcome::Failed("invalid address".to_string()));

        let check = f.check(&["auth"]);
        check.run().await.unwrap();

        assert_eq!(check.status.get(), CheckStatus::Healthy);
        let doc = f.store.only_doc();
        assert_eq!(doc["process_level"], json!("ERROR"));
        assert!(!doc["error"].is_null());
        assert!(f.consul.deregistered.lock().is_empty());
    }

    #[tokio::test]
    async fn test_listing_failure_alarms_and_aborts() {
        let f = Fixture::new();
        *f.consul.fail_listing.lock() = true;

        let check = f.check(&["auth"]);
        check.run().await.unwrap();

        let doc = f.store.only_doc();
        assert_eq!(doc["process_level"], json!("ERROR"));
        assert_eq!(doc["alerted"], json!(true));
        assert_eq!(f.chat.emojis(), vec!["x"]);
    }

    #[tokio::test]
    async fn test_recovering_tick_is_guarded() {
        let f = Fixture::new();

        let check = f.check(&["auth"]);
        check.status.set(CheckStatus::Recovering);
        check.run().await.unwrap();

        let doc = f.store.only_doc();
        assert_eq!(doc["process_level"], json!("RECOVERING"));
        assert!(f.chat.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_no_targets_configured_is_healthy() {
        let f = Fixture::new();

        let check = f.check(&[]);
        check.run().await.unwrap();

        let doc = f.store.only_doc();
        assert_eq!(doc["process_level"], json!("HEALTHY"));
        assert!(f.chat.sent.lock().is_empty());
    }
}
