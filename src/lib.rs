//! # healthwatch
//!
//! A self-healing health check daemon for a small container-orchestrated
//! fleet. On fixed per-check cadences the daemon probes host disk, container
//! CPU, container memory, an Elasticsearch cluster, a Swarmpit management
//! container and a Consul service registry. Each check is a three-state
//! machine: when a degradation threshold is crossed the check performs a
//! bounded remediation (prune docker, restart a container, delete indices,
//! deregister a stale instance) and re-probes. Every tick persists one
//! immutable history record to Elasticsearch and state transitions emit a
//! chat notification.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use healthwatch::{config::Config, Daemon};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let config = Config::load("config/healthwatch.yaml").await?;
//!     Daemon::new(config).await?.run().await?;
//!     Ok(())
//! }
//! ```

#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod agency;
pub mod check;
pub mod config;
pub mod history;
pub mod utils;

// Re-export main types
pub use config::Config;
pub use utils::error::{HealthError, Result};

use std::sync::Arc;
use tracing::info;

use agency::chat::{ChatAgency, DisabledChat, SlackWebhookChat};
use agency::consul::{ConsulAgency, ConsulHttpAgency};
use agency::docker::{DockerAgency, DockerEngineAgency};
use agency::elasticsearch::{ElasticsearchAgency, EsHttpAgency};
use agency::ping::{GrpcPingAgency, PingAgency};
use agency::system::{DiskSysAgency, SysDiskAgency};
use check::{
    Check, CheckScheduler, ConsulCheck, CpuCheck, DiskCheck, EsClusterCheck, MemoryCheck,
    SwarmpitCheck,
};
use history::{EsHistoryStore, HistoryStore};

/// Name of the daemon, stamped on every history record as the `agent` field.
pub const NAME: &str = env!("CARGO_PKG_NAME");
/// Current version of the daemon.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The assembled daemon: agencies, history stores, checks and scheduler.
pub struct Daemon {
    scheduler: CheckScheduler,
}

impl Daemon {
    /// Wire the configuration into agencies, history repositories and the
    /// six checks. History indices are bootstrapped here, so a broken
    /// Elasticsearch connection fails fast at startup.
    pub async fn new(config: Config) -> Result<Self> {
        info!("initializing {} v{}", NAME, VERSION);

        let es_storage = &config.storage.elasticsearch;

        let chat: Arc<dyn ChatAgency> = match &config.alerting.slack.webhook_url {
            Some(url) => Arc::new(SlackWebhookChat::new(
                url.clone(),
                config.alerting.slack.channel.clone(),
                config.alerting.slack.username.clone(),
            )),
            None => {
                info!("no slack webhook configured, chat alarms are disabled");
                Arc::new(DisabledChat)
            }
        };

        let docker: Arc<dyn DockerAgency> = Arc::new(DockerEngineAgency::new()?);
        let disk: Arc<dyn DiskSysAgency> = Arc::new(SysDiskAgency::new(docker.clone()));
        let elasticsearch: Arc<dyn ElasticsearchAgency> =
            Arc::new(EsHttpAgency::new(&es_storage.url, es_storage.request_timeout)?);
        let consul: Arc<dyn ConsulAgency> = Arc::new(ConsulHttpAgency::new(&config.consul.url)?);
        let ping: Arc<dyn PingAgency> = Arc::new(GrpcPingAgency::new());

        let syscheck_store: Arc<dyn HistoryStore> =
            Arc::new(EsHistoryStore::new(es_storage, &es_storage.syscheck_index).await?);
        let srvcheck_store: Arc<dyn HistoryStore> =
            Arc::new(EsHistoryStore::new(es_storage, &es_storage.srvcheck_index).await?);

        let checks: Vec<Arc<dyn Check>> = vec![
            Arc::new(DiskCheck::new(
                config.syscheck.disk.clone(),
                syscheck_store.clone(),
                chat.clone(),
                disk,
            )),
            Arc::new(CpuCheck::new(
                config.syscheck.cpu.clone(),
                syscheck_store.clone(),
                chat.clone(),
                docker.clone(),
            )),
            Arc::new(MemoryCheck::new(
                config.syscheck.memory.clone(),
                syscheck_store,
                chat.clone(),
                docker.clone(),
            )),
            Arc::new(EsClusterCheck::new(
                config.srvcheck.elasticsearch.clone(),
                srvcheck_store.clone(),
                chat.clone(),
                elasticsearch,
            )),
            Arc::new(SwarmpitCheck::new(
                config.srvcheck.swarmpit.clone(),
                srvcheck_store.clone(),
                chat.clone(),
                docker.clone(),
            )),
            Arc::new(ConsulCheck::new(
                config.srvcheck.consul.clone(),
                srvcheck_store,
                chat,
                consul,
                ping,
                docker,
            )),
        ];

        info!("daemon initialized with {} checks", checks.len());

        Ok(Self {
            scheduler: CheckScheduler::new(checks),
        })
    }

    /// Run the check tasks until the process receives a shutdown signal.
    pub async fn run(self) -> Result<()> {
        info!("starting check scheduler");
        let handles = self.scheduler.spawn_all();

        tokio::signal::ctrl_c().await?;

        info!("shutdown signal received, stopping check tasks");
        for handle in handles {
            handle.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(NAME, env!("CARGO_PKG_NAME"));
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}
