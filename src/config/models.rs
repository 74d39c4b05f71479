//! Configuration models with per-field defaults
//!
//! Byte sizes are human-readable strings ("2 GiB", "600 MB"); durations are
//! humantime strings ("5m", "720h").

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Host system check configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyscheckConfig {
    /// Disk check thresholds
    pub disk: DiskCheckConfig,
    /// CPU check thresholds
    pub cpu: CpuCheckConfig,
    /// Memory check thresholds
    pub memory: MemoryCheckConfig,
}

/// Disk check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskCheckConfig {
    /// Remaining capacity below which the disk is considered weak
    pub min_capacity: ByteSize,
    /// Cadence the disk check runs on
    #[serde(with = "humantime_serde")]
    pub check_cycle: Duration,
}

impl Default for DiskCheckConfig {
    fn default() -> Self {
        Self {
            min_capacity: ByteSize::gib(2),
            check_cycle: Duration::from_secs(5 * 60),
        }
    }
}

/// CPU check configuration
///
/// Usage values are in fraction-of-cores: 1.0 means one full core busy,
/// independent of how many cores the host has.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuCheckConfig {
    /// Total usage above which the check reports WARNING (no remediation)
    pub warning_usage: f64,
    /// Total usage above which remediation starts
    pub maximum_usage: f64,
    /// Per-container usage above which a container is a removal candidate
    pub min_usage_to_remove: f64,
    /// Cadence the cpu check runs on
    #[serde(with = "humantime_serde")]
    pub check_cycle: Duration,
}

impl Default for CpuCheckConfig {
    fn default() -> Self {
        Self {
            warning_usage: 1.0,
            maximum_usage: 1.5,
            min_usage_to_remove: 0.5,
            check_cycle: Duration::from_secs(5 * 60),
        }
    }
}

/// Memory check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryCheckConfig {
    /// Total container memory above which the check reports WARNING
    pub warning_usage: ByteSize,
    /// Total container memory above which remediation starts
    pub maximum_usage: ByteSize,
    /// Per-container memory above which a container is a removal candidate
    pub min_usage_to_remove: ByteSize,
    /// Cadence the memory check runs on
    #[serde(with = "humantime_serde")]
    pub check_cycle: Duration,
}

impl Default for MemoryCheckConfig {
    fn default() -> Self {
        Self {
            warning_usage: ByteSize::gib(6),
            maximum_usage: ByteSize::gib(7),
            min_usage_to_remove: ByteSize::gib(1),
            check_cycle: Duration::from_secs(5 * 60),
        }
    }
}

/// Service check configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SrvcheckConfig {
    /// Elasticsearch cluster check thresholds
    pub elasticsearch: EsCheckConfig,
    /// Swarmpit app check thresholds
    pub swarmpit: SwarmpitCheckConfig,
    /// Consul registry check settings
    pub consul: ConsulCheckConfig,
}

/// Elasticsearch cluster check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EsCheckConfig {
    /// Total shard count (active + unassigned) above which the cluster is weak
    pub maximum_shards: u32,
    /// Index pattern whose matches are deletion candidates during remediation
    pub jaeger_index_pattern: String,
    /// Minimum age an index must have reached before it may be deleted
    #[serde(with = "humantime_serde")]
    pub jaeger_index_min_lifecycle: Duration,
    /// Cadence the elasticsearch check runs on
    #[serde(with = "humantime_serde")]
    pub check_cycle: Duration,
}

impl Default for EsCheckConfig {
    fn default() -> Self {
        Self {
            maximum_shards: 900,
            jaeger_index_pattern: "jaeger-*".to_string(),
            jaeger_index_min_lifecycle: Duration::from_secs(720 * 3600),
            check_cycle: Duration::from_secs(12 * 3600),
        }
    }
}

/// Swarmpit app check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmpitCheckConfig {
    /// Swarm service name of the swarmpit app container
    pub app_service_name: String,
    /// Memory usage above which the app container is restarted
    pub app_max_memory: ByteSize,
    /// Cadence the swarmpit check runs on
    #[serde(with = "humantime_serde")]
    pub check_cycle: Duration,
}

impl Default for SwarmpitCheckConfig {
    fn default() -> Self {
        Self {
            app_service_name: "swarmpit_app".to_string(),
            app_max_memory: ByteSize::mb(600),
            check_cycle: Duration::from_secs(6 * 3600),
        }
    }
}

/// Consul registry check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsulCheckConfig {
    /// Bare service names to check; empty means the check is a no-op
    pub check_target_services: Vec<String>,
    /// Prefix prepended to bare names when querying consul
    pub consul_service_namespace: String,
    /// Prefix prepended to bare names when resolving docker services
    pub docker_service_namespace: String,
    /// Deadline for each instance connection probe
    #[serde(with = "humantime_serde")]
    pub ping_timeout: Duration,
    /// Cadence the consul check runs on
    #[serde(with = "humantime_serde")]
    pub check_cycle: Duration,
}

impl Default for ConsulCheckConfig {
    fn default() -> Self {
        Self {
            check_target_services: Vec::new(),
            consul_service_namespace: String::new(),
            docker_service_namespace: String::new(),
            ping_timeout: Duration::from_secs(5),
            check_cycle: Duration::from_secs(60),
        }
    }
}

/// History persistence configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Elasticsearch history backend
    pub elasticsearch: EsStorageConfig,
}

/// Elasticsearch history backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EsStorageConfig {
    /// Base URL of the cluster the history documents are written to
    pub url: String,
    /// Index receiving host system check history
    pub syscheck_index: String,
    /// Index receiving service check history
    pub srvcheck_index: String,
    /// Shard count applied when an index is bootstrapped
    pub index_shards: u32,
    /// Replica count applied when an index is bootstrapped
    pub index_replicas: u32,
    /// Timeout for each request against the history backend
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for EsStorageConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:9200".to_string(),
            syscheck_index: "healthwatch-system-check".to_string(),
            srvcheck_index: "healthwatch-service-check".to_string(),
            index_shards: 2,
            index_replicas: 0,
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Chat alerting configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertingConfig {
    /// Slack webhook settings
    pub slack: SlackConfig,
}

/// Slack webhook settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SlackConfig {
    /// Incoming webhook URL; alarms are disabled when unset
    pub webhook_url: Option<String>,
    /// Channel override
    pub channel: Option<String>,
    /// Username the alarms are posted as
    pub username: Option<String>,
}

/// Consul agent endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsulConfig {
    /// Base URL of the local consul agent
    pub url: String,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8500".to_string(),
        }
    }
}
