//! History record model shared by every check

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::agency::chat::ChatDelivery;
use crate::agency::elasticsearch::ClusterHealth;

/// Condition label attached to a tick's history record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessLevel {
    /// The subsystem is operating normally
    Healthy,
    /// Usage is elevated but below the remediation threshold
    Warning,
    /// A weakness was detected and remediation started
    WeakDetected,
    /// A remediation from an earlier tick is still in flight
    Recovering,
    /// The subsystem returned to healthy after being unhealthy
    Recovered,
    /// Remediation did not help; manual intervention is needed
    Unhealthy,
    /// An error occurred while handling the tick
    Error,
}

impl ProcessLevel {
    /// Label rendered into persisted documents and chat messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessLevel::Healthy => "HEALTHY",
            ProcessLevel::Warning => "WARNING",
            ProcessLevel::WeakDetected => "WEAK_DETECTED",
            ProcessLevel::Recovering => "RECOVERING",
            ProcessLevel::Recovered => "RECOVERED",
            ProcessLevel::Unhealthy => "UNHEALTHY",
            ProcessLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for ProcessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered, duplicate-free list of process levels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessLevels(Vec<ProcessLevel>);

impl ProcessLevels {
    /// Replace the list with exactly the given level.
    pub fn set(&mut self, level: ProcessLevel) {
        self.0 = vec![level];
    }

    /// Append the level unless it is already present.
    pub fn append(&mut self, level: ProcessLevel) {
        if !self.0.contains(&level) {
            self.0.push(level);
        }
    }

    /// Whether the level is present.
    pub fn contains(&self, level: ProcessLevel) -> bool {
        self.0.contains(&level)
    }

    /// Number of labels in the list.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no label has been set yet.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ProcessLevels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .0
            .iter()
            .map(|l| l.as_str())
            .collect::<Vec<_>>()
            .join(" | ");
        f.write_str(&joined)
    }
}

/// Check domain a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckDomain {
    /// Host system checks: disk, cpu, memory
    Syscheck,
    /// Service checks: elasticsearch, swarmpit, consul
    Srvcheck,
}

impl CheckDomain {
    /// Domain name rendered into persisted documents.
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckDomain::Syscheck => "syscheck",
            CheckDomain::Srvcheck => "srvcheck",
        }
    }
}

/// Outcome of the chat alarm sent during a tick.
///
/// Set at most once per record: the first send of a tick wins, follow-up
/// notifications go out without being mirrored here.
#[derive(Debug, Clone, Default)]
pub struct AlarmResult {
    /// Whether an alarm was sent during the tick
    pub alerted: bool,
    /// Rendered text of the alarm
    pub alarm_text: String,
    /// Time the alarm was sent
    pub alarm_time: Option<DateTime<Utc>>,
    /// Delivery error reported by the chat agency
    pub alarm_error: Option<String>,
}

/// Common header stamped on every history record.
#[derive(Debug, Clone)]
pub struct HistoryHeader {
    /// Fixed identifier of the daemon
    pub agent: &'static str,
    /// Daemon version the record was created by
    pub version: &'static str,
    /// Tick start time
    pub timestamp: DateTime<Utc>,
    /// Check domain
    pub domain: CheckDomain,
    /// Check name within the domain
    pub kind: &'static str,
    /// Fresh identifier, unique per record, also the chat correlation id
    pub uuid: String,
    /// Condition labels accumulated during the tick
    pub process_level: ProcessLevels,
    /// Human-readable description of the tick outcome
    pub message: String,
    /// Error text when the tick was handled abnormally
    pub error: Option<String>,
    /// Chat alarm outcome
    pub alarm: AlarmResult,
}

impl HistoryHeader {
    /// Stamp a new header for the given check: fresh uuid, current time,
    /// daemon identity.
    pub fn new(domain: CheckDomain, kind: &'static str) -> Self {
        Self {
            agent: crate::NAME,
            version: crate::VERSION,
            timestamp: Utc::now(),
            domain,
            kind,
            uuid: Uuid::new_v4().to_string(),
            process_level: ProcessLevels::default(),
            message: String::new(),
            error: None,
            alarm: AlarmResult::default(),
        }
    }

    /// Record a failure: message and error text, with the ERROR label kept
    /// in sync so a non-null error always carries the level.
    pub fn set_error(&mut self, context: impl Into<String>) {
        let context = context.into();
        self.message = context.clone();
        self.error = Some(context);
        self.process_level.append(ProcessLevel::Error);
    }

    /// Attach the outcome of a chat send. Only the first send of a tick is
    /// kept.
    pub fn set_alarm_result(&mut self, delivery: &ChatDelivery) {
        if self.alarm.alerted {
            return;
        }
        self.alarm = AlarmResult {
            alerted: true,
            alarm_text: delivery.text.clone(),
            alarm_time: Some(delivery.time),
            alarm_error: delivery.error.clone(),
        };
    }

    fn dotted_map(&self) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("agent".to_string(), json!(self.agent));
        m.insert("version".to_string(), json!(self.version));
        m.insert("@timestamp".to_string(), json!(rfc3339_nanos(&self.timestamp)));
        m.insert("domain".to_string(), json!(self.domain.as_str()));
        m.insert("type".to_string(), json!(self.kind));
        m.insert("uuid".to_string(), json!(self.uuid));
        m.insert("process_level".to_string(), json!(self.process_level.to_string()));
        m.insert("message".to_string(), json!(self.message));
        m.insert(
            "error".to_string(),
            self.error.as_ref().map_or(Value::Null, |e| json!(e)),
        );
        m.insert("alerted".to_string(), json!(self.alarm.alerted));
        m.insert("alarm_text".to_string(), json!(self.alarm.alarm_text));
        m.insert(
            "alarm_time".to_string(),
            self.alarm
                .alarm_time
                .as_ref()
                .map_or(Value::Null, |t| json!(rfc3339_nanos(t))),
        );
        m.insert(
            "alarm_error".to_string(),
            self.alarm.alarm_error.as_ref().map_or(Value::Null, |e| json!(e)),
        );
        m
    }
}

fn rfc3339_nanos(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Disk check history record.
#[derive(Debug, Clone)]
pub struct DiskCheckHistory {
    pub header: HistoryHeader,
    /// Remaining disk capacity observed by the probe, in bytes
    pub remaining_capacity: Option<u64>,
    /// Bytes reclaimed by the docker prune remediation
    pub reclaimed_capacity: Option<u64>,
}

impl DiskCheckHistory {
    pub fn new() -> Self {
        Self {
            header: HistoryHeader::new(CheckDomain::Syscheck, "disk"),
            remaining_capacity: None,
            reclaimed_capacity: None,
        }
    }

    /// Flatten the record into a dotted-key document.
    pub fn dotted_map(&self) -> Map<String, Value> {
        let mut m = self.header.dotted_map();
        if let Some(v) = self.remaining_capacity {
            m.insert("remaining_capacity".to_string(), json!(v));
        }
        if let Some(v) = self.reclaimed_capacity {
            m.insert("reclaimed_capacity".to_string(), json!(v));
        }
        m
    }
}

impl Default for DiskCheckHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// CPU check history record.
#[derive(Debug, Clone)]
pub struct CpuCheckHistory {
    pub header: HistoryHeader,
    /// Total container CPU usage in fraction-of-cores
    pub total_usage_cores: Option<f64>,
    /// Whether the remediation removed containers
    pub if_containers_removed: bool,
    /// Identifiers of the removed containers
    pub removed_containers: Vec<String>,
}

impl CpuCheckHistory {
    pub fn new() -> Self {
        Self {
            header: HistoryHeader::new(CheckDomain::Syscheck, "cpu"),
            total_usage_cores: None,
            if_containers_removed: false,
            removed_containers: Vec::new(),
        }
    }

    /// Flatten the record into a dotted-key document.
    pub fn dotted_map(&self) -> Map<String, Value> {
        let mut m = self.header.dotted_map();
        if let Some(v) = self.total_usage_cores {
            m.insert("total_usage_cores".to_string(), json!(v));
        }
        m.insert("if_containers_removed".to_string(), json!(self.if_containers_removed));
        m.insert("removed_containers".to_string(), json!(self.removed_containers));
        m
    }
}

impl Default for CpuCheckHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// Memory check history record.
#[derive(Debug, Clone)]
pub struct MemoryCheckHistory {
    pub header: HistoryHeader,
    /// Total container resident memory in bytes
    pub total_usage_bytes: Option<u64>,
    /// Whether the remediation removed containers
    pub if_containers_removed: bool,
    /// Identifiers of the removed containers
    pub removed_containers: Vec<String>,
}

impl MemoryCheckHistory {
    pub fn new() -> Self {
        Self {
            header: HistoryHeader::new(CheckDomain::Syscheck, "memory"),
            total_usage_bytes: None,
            if_containers_removed: false,
            removed_containers: Vec::new(),
        }
    }

    /// Flatten the record into a dotted-key document.
    pub fn dotted_map(&self) -> Map<String, Value> {
        let mut m = self.header.dotted_map();
        if let Some(v) = self.total_usage_bytes {
            m.insert("total_usage_bytes".to_string(), json!(v));
        }
        m.insert("if_containers_removed".to_string(), json!(self.if_containers_removed));
        m.insert("removed_containers".to_string(), json!(self.removed_containers));
        m
    }
}

impl Default for MemoryCheckHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// Elasticsearch cluster check history record.
#[derive(Debug, Clone)]
pub struct EsCheckHistory {
    pub header: HistoryHeader,
    /// Cluster health snapshot; the re-probe overwrites the first probe
    pub cluster_health: Option<ClusterHealth>,
    /// Whether the remediation deleted jaeger indices
    pub if_jaeger_index_deleted: bool,
    /// Names of the deleted indices
    pub deleted_jaeger_indices: Vec<String>,
}

impl EsCheckHistory {
    pub fn new() -> Self {
        Self {
            header: HistoryHeader::new(CheckDomain::Srvcheck, "elasticsearch"),
            cluster_health: None,
            if_jaeger_index_deleted: false,
            deleted_jaeger_indices: Vec::new(),
        }
    }

    /// Flatten the record into a dotted-key document. The nested cluster
    /// health view becomes `cluster_health.*` keys.
    pub fn dotted_map(&self) -> Map<String, Value> {
        let mut m = self.header.dotted_map();
        if let Some(health) = &self.cluster_health {
            m.insert(
                "cluster_health.active_primary_shards".to_string(),
                json!(health.active_primary_shards),
            );
            m.insert("cluster_health.active_shards".to_string(), json!(health.active_shards));
            m.insert(
                "cluster_health.unassigned_shards".to_string(),
                json!(health.unassigned_shards),
            );
            m.insert(
                "cluster_health.active_shards_percent".to_string(),
                json!(health.active_shards_percent),
            );
        }
        m.insert("if_jaeger_index_deleted".to_string(), json!(self.if_jaeger_index_deleted));
        m.insert("deleted_jaeger_indices".to_string(), json!(self.deleted_jaeger_indices));
        m
    }
}

impl Default for EsCheckHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// Swarmpit app check history record.
#[derive(Debug, Clone)]
pub struct SwarmpitCheckHistory {
    pub header: HistoryHeader,
    /// Memory usage of the swarmpit app container in bytes
    pub swarmpit_app_memory_usage: Option<u64>,
    /// Whether the app container was restarted
    pub if_swarmpit_app_restarted: bool,
}

impl SwarmpitCheckHistory {
    pub fn new() -> Self {
        Self {
            header: HistoryHeader::new(CheckDomain::Srvcheck, "swarmpit"),
            swarmpit_app_memory_usage: None,
            if_swarmpit_app_restarted: false,
        }
    }

    /// Flatten the record into a dotted-key document.
    pub fn dotted_map(&self) -> Map<String, Value> {
        let mut m = self.header.dotted_map();
        if let Some(v) = self.swarmpit_app_memory_usage {
            m.insert("swarmpit_app_memory_usage".to_string(), json!(v));
        }
        m.insert(
            "if_swarmpit_app_restarted".to_string(),
            json!(self.if_swarmpit_app_restarted),
        );
        m
    }
}

impl Default for SwarmpitCheckHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// Consul registry check history record.
#[derive(Debug, Clone)]
pub struct ConsulCheckHistory {
    pub header: HistoryHeader,
    /// Instance ids registered per namespaced service at probe time
    pub instances_per_service: BTreeMap<String, Vec<String>>,
    /// Whether stale instances were deregistered
    pub if_instance_deregistered: bool,
    /// Whether containers of empty services were restarted
    pub if_container_restarted: bool,
    /// Instance ids successfully deregistered
    pub deregistered_instances: Vec<String>,
    /// Instance ids whose deregistration failed
    pub deregister_failed_instances: Vec<String>,
    /// Docker services whose containers were restarted
    pub restarted_services: Vec<String>,
    /// Docker services whose container restart failed
    pub restart_failed_services: Vec<String>,
}

impl ConsulCheckHistory {
    pub fn new() -> Self {
        Self {
            header: HistoryHeader::new(CheckDomain::Srvcheck, "consul"),
            instances_per_service: BTreeMap::new(),
            if_instance_deregistered: false,
            if_container_restarted: false,
            deregistered_instances: Vec::new(),
            deregister_failed_instances: Vec::new(),
            restarted_services: Vec::new(),
            restart_failed_services: Vec::new(),
        }
    }

    /// Flatten the record into a dotted-key document. The per-service
    /// instance map becomes one `instances_per_service.<name>` key each.
    pub fn dotted_map(&self) -> Map<String, Value> {
        let mut m = self.header.dotted_map();
        for (service, ids) in &self.instances_per_service {
            m.insert(format!("instances_per_service.{}", service), json!(ids));
        }
        m.insert(
            "if_instance_deregistered".to_string(),
            json!(self.if_instance_deregistered),
        );
        m.insert("if_container_restarted".to_string(), json!(self.if_container_restarted));
        m.insert(
            "deregistered_instances".to_string(),
            json!(self.deregistered_instances),
        );
        m.insert(
            "deregister_failed_instances".to_string(),
            json!(self.deregister_failed_instances),
        );
        m.insert("restarted_services".to_string(), json!(self.restarted_services));
        m.insert(
            "restart_failed_services".to_string(),
            json!(self.restart_failed_services),
        );
        m
    }
}

impl Default for ConsulCheckHistory {
    fn default() -> Self {
        Self::new()
    }
}
