//! In-memory doubles used by the check engine tests
//!
//! Scripted agencies pop pre-loaded responses; popping an empty script
//! panics, which doubles as the "this call must not happen" assertion for
//! the guard-path tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::agency::chat::{ChatAgency, ChatDelivery};
use crate::agency::consul::{ConsulAgency, ServiceInstance};
use crate::agency::docker::{ContainerStat, DockerAgency, ServiceContainer};
use crate::agency::elasticsearch::{ClusterHealth, ElasticsearchAgency, IndexCatalog};
use crate::agency::ping::{PingAgency, PingOutcome};
use crate::agency::system::DiskSysAgency;
use crate::history::HistoryStore;
use crate::utils::error::{HealthError, Result};

/// History store collecting documents in memory.
#[derive(Default)]
pub(crate) struct MemoryHistoryStore {
    pub docs: Mutex<Vec<Map<String, Value>>>,
    pub failing: bool,
}

impl MemoryHistoryStore {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            docs: Mutex::new(Vec::new()),
            failing: true,
        })
    }

    /// The single stored document, panicking unless exactly one exists.
    pub fn only_doc(&self) -> Map<String, Value> {
        let docs = self.docs.lock();
        assert_eq!(docs.len(), 1, "expected exactly one stored document");
        docs[0].clone()
    }
}

#[async_trait::async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn store(&self, document: Map<String, Value>) -> Result<()> {
        if self.failing {
            return Err(HealthError::Storage("simulated store failure".to_string()));
        }
        self.docs.lock().push(document);
        Ok(())
    }
}

/// One captured chat send.
#[derive(Debug, Clone)]
pub(crate) struct SentMessage {
    pub emoji: String,
    pub text: String,
    pub uuid: String,
}

/// Chat agency recording every send.
#[derive(Default)]
pub(crate) struct RecordingChat {
    pub sent: Mutex<Vec<SentMessage>>,
}

impl RecordingChat {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn emojis(&self) -> Vec<String> {
        self.sent.lock().iter().map(|m| m.emoji.clone()).collect()
    }
}

#[async_trait::async_trait]
impl ChatAgency for RecordingChat {
    async fn send_message(&self, emoji: &str, text: &str, uuid: &str) -> ChatDelivery {
        self.sent.lock().push(SentMessage {
            emoji: emoji.to_string(),
            text: text.to_string(),
            uuid: uuid.to_string(),
        });
        ChatDelivery {
            time: Utc::now(),
            text: format!(":{}: {}", emoji, text),
            error: None,
        }
    }
}

/// Scripted disk agency.
#[derive(Default)]
pub(crate) struct ScriptedDisk {
    pub capacity: Mutex<VecDeque<Result<u64>>>,
    pub prune: Mutex<VecDeque<Result<u64>>>,
}

impl ScriptedDisk {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_capacity(&self, value: Result<u64>) {
        self.capacity.lock().push_back(value);
    }

    pub fn push_prune(&self, value: Result<u64>) {
        self.prune.lock().push_back(value);
    }
}

#[async_trait::async_trait]
impl DiskSysAgency for ScriptedDisk {
    async fn remaining_disk_capacity(&self) -> Result<u64> {
        self.capacity
            .lock()
            .pop_front()
            .expect("unexpected disk capacity probe")
    }

    async fn prune_docker_system(&self) -> Result<u64> {
        self.prune.lock().pop_front().expect("unexpected docker prune")
    }
}

/// Scripted docker agency.
#[derive(Default)]
pub(crate) struct ScriptedDocker {
    pub stats: Mutex<VecDeque<Result<Vec<ContainerStat>>>>,
    pub service_containers: Mutex<VecDeque<Result<ServiceContainer>>>,
    pub removed: Mutex<Vec<String>>,
    pub fail_removals: Mutex<HashSet<String>>,
    pub prune: Mutex<VecDeque<Result<u64>>>,
}

impl ScriptedDocker {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_stats(&self, value: Result<Vec<ContainerStat>>) {
        self.stats.lock().push_back(value);
    }

    pub fn push_service_container(&self, value: Result<ServiceContainer>) {
        self.service_containers.lock().push_back(value);
    }

    pub fn fail_removal_of(&self, id: &str) {
        self.fail_removals.lock().insert(id.to_string());
    }
}

/// Stat builder used across the cpu and memory tests.
pub(crate) fn stat(id: &str, cpu_cores: f64, memory_bytes: u64) -> ContainerStat {
    ContainerStat {
        id: id.to_string(),
        cpu_cores,
        memory_bytes,
    }
}

#[async_trait::async_trait]
impl DockerAgency for ScriptedDocker {
    async fn container_stats(&self) -> Result<Vec<ContainerStat>> {
        self.stats
            .lock()
            .pop_front()
            .expect("unexpected container stats probe")
    }

    async fn container_for_service(&self, _service: &str) -> Result<ServiceContainer> {
        self.service_containers
            .lock()
            .pop_front()
            .expect("unexpected service container lookup")
    }

    async fn remove_container(&self, id: &str, _force: bool) -> Result<()> {
        if self.fail_removals.lock().contains(id) {
            return Err(HealthError::System(format!("cannot remove {}", id)));
        }
        self.removed.lock().push(id.to_string());
        Ok(())
    }

    async fn prune_system(&self) -> Result<u64> {
        self.prune.lock().pop_front().expect("unexpected docker prune")
    }
}

/// Scripted elasticsearch agency.
#[derive(Default)]
pub(crate) struct ScriptedEs {
    pub health: Mutex<VecDeque<Result<ClusterHealth>>>,
    pub catalogs: Mutex<VecDeque<Result<IndexCatalog>>>,
    pub deleted: Mutex<Vec<Vec<String>>>,
    pub fail_delete: Mutex<bool>,
}

impl ScriptedEs {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_health(&self, value: Result<ClusterHealth>) {
        self.health.lock().push_back(value);
    }

    pub fn push_catalog(&self, value: Result<IndexCatalog>) {
        self.catalogs.lock().push_back(value);
    }
}

/// Health snapshot builder used across the elasticsearch tests.
pub(crate) fn cluster_health(active: u32, unassigned: u32) -> ClusterHealth {
    ClusterHealth {
        active_primary_shards: active / 2,
        active_shards: active,
        unassigned_shards: unassigned,
        active_shards_percent: 100.0,
    }
}

#[async_trait::async_trait]
impl ElasticsearchAgency for ScriptedEs {
    async fn cluster_health(&self) -> Result<ClusterHealth> {
        self.health
            .lock()
            .pop_front()
            .expect("unexpected cluster health probe")
    }

    async fn indices_with_patterns(&self, _patterns: &[String]) -> Result<IndexCatalog> {
        self.catalogs
            .lock()
            .pop_front()
            .expect("unexpected index listing")
    }

    async fn delete_indices(&self, names: &[String]) -> Result<()> {
        if *self.fail_delete.lock() {
            return Err(HealthError::Elasticsearch("delete rejected".to_string()));
        }
        self.deleted.lock().push(names.to_vec());
        Ok(())
    }
}

/// Scripted consul agency.
#[derive(Default)]
pub(crate) struct ScriptedConsul {
    pub instances: Mutex<HashMap<String, Vec<ServiceInstance>>>,
    pub fail_listing: Mutex<bool>,
    pub deregistered: Mutex<Vec<String>>,
    pub fail_deregister: Mutex<HashSet<String>>,
}

impl ScriptedConsul {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, service: &str, instances: Vec<ServiceInstance>) {
        self.instances.lock().insert(service.to_string(), instances);
    }

    pub fn fail_deregister_of(&self, id: &str) {
        self.fail_deregister.lock().insert(id.to_string());
    }
}

/// Instance builder used across the consul tests.
pub(crate) fn instance(id: &str, address: &str) -> ServiceInstance {
    ServiceInstance {
        id: id.to_string(),
        address: address.to_string(),
    }
}

#[async_trait::async_trait]
impl ConsulAgency for ScriptedConsul {
    async fn service_instances(&self, service: &str) -> Result<Vec<ServiceInstance>> {
        if *self.fail_listing.lock() {
            return Err(HealthError::Consul("agent unavailable".to_string()));
        }
        Ok(self
            .instances
            .lock()
            .get(service)
            .cloned()
            .unwrap_or_default())
    }

    async fn deregister_instance(&self, id: &str) -> Result<()> {
        if self.fail_deregister.lock().contains(id) {
            return Err(HealthError::Consul(format!("cannot deregister {}", id)));
        }
        self.deregistered.lock().push(id.to_string());
        Ok(())
    }
}

/// Ping agency answering from a fixed outcome table.
#[derive(Default)]
pub(crate) struct ScriptedPing {
    pub outcomes: Mutex<HashMap<String, PingOutcome>>,
}

impl ScriptedPing {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn answer(&self, address: &str, outcome: PingOutcome) {
        self.outcomes.lock().insert(address.to_string(), outcome);
    }
}

#[async_trait::async_trait]
impl PingAgency for ScriptedPing {
    async fn ping(&self, target: &str, _timeout: Duration) -> PingOutcome {
        self.outcomes
            .lock()
            .get(target)
            .cloned()
            .unwrap_or(PingOutcome::Reachable)
    }
}
