//! Docker Engine agency
//!
//! Narrow contract over the engine API: stats for the resource checks,
//! service-name lookup and forced removal for the remediation paths, and
//! system prune for the disk check.

use std::collections::HashMap;

use bollard::container::{
    ListContainersOptions, PruneContainersOptions, RemoveContainerOptions, Stats, StatsOptions,
};
use bollard::image::PruneImagesOptions;
use bollard::volume::PruneVolumesOptions;
use bollard::Docker;
use futures::StreamExt;

use crate::utils::error::{HealthError, Result};

/// Point-in-time resource usage of one running container.
#[derive(Debug, Clone)]
pub struct ContainerStat {
    /// Container id
    pub id: String,
    /// CPU usage in fraction-of-cores (1.0 = one full core busy)
    pub cpu_cores: f64,
    /// Resident memory in bytes
    pub memory_bytes: u64,
}

/// Container resolved from an orchestrator service name.
#[derive(Debug, Clone)]
pub struct ServiceContainer {
    /// Container id
    pub id: String,
    /// Resident memory in bytes
    pub memory_usage: u64,
}

/// Docker engine operations the checks depend on.
#[async_trait::async_trait]
pub trait DockerAgency: Send + Sync {
    /// Stats of every running container.
    async fn container_stats(&self) -> Result<Vec<ContainerStat>>;

    /// The container currently backing the given swarm service.
    async fn container_for_service(&self, service: &str) -> Result<ServiceContainer>;

    /// Remove a container; with `force` a running container is killed first.
    async fn remove_container(&self, id: &str, force: bool) -> Result<()>;

    /// Prune stopped containers, dangling images and unused volumes;
    /// returns the total reclaimed bytes.
    async fn prune_system(&self) -> Result<u64>;
}

/// Agency backed by the local Docker Engine API.
pub struct DockerEngineAgency {
    docker: Docker,
}

impl DockerEngineAgency {
    /// Connect with the platform defaults (unix socket or named pipe).
    pub fn new() -> Result<Self> {
        Ok(Self {
            docker: Docker::connect_with_local_defaults()?,
        })
    }

    async fn one_shot_stats(&self, id: &str) -> Result<Stats> {
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };
        let mut stream = self.docker.stats(id, Some(options));
        match stream.next().await {
            Some(Ok(stats)) => Ok(stats),
            Some(Err(e)) => Err(e.into()),
            None => Err(HealthError::System(format!(
                "no stats returned for container {}",
                id
            ))),
        }
    }
}

/// CPU usage of one container in fraction-of-cores, computed from the delta
/// between the current and previous engine readings.
fn cpu_cores_from(stats: &Stats) -> f64 {
    let cpu_delta = stats.cpu_stats.cpu_usage.total_usage as f64
        - stats.precpu_stats.cpu_usage.total_usage as f64;
    let system_delta = stats.cpu_stats.system_cpu_usage.unwrap_or(0) as f64
        - stats.precpu_stats.system_cpu_usage.unwrap_or(0) as f64;
    if system_delta <= 0.0 || cpu_delta <= 0.0 {
        return 0.0;
    }
    let online_cpus = stats.cpu_stats.online_cpus.unwrap_or_else(|| {
        stats
            .cpu_stats
            .cpu_usage
            .percpu_usage
            .as_ref()
            .map(|p| p.len() as u64)
            .unwrap_or(1)
    });
    cpu_delta / system_delta * online_cpus as f64
}

fn memory_bytes_from(stats: &Stats) -> u64 {
    stats.memory_stats.usage.unwrap_or(0)
}

#[async_trait::async_trait]
impl DockerAgency for DockerEngineAgency {
    async fn container_stats(&self) -> Result<Vec<ContainerStat>> {
        let options = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;

        let mut out = Vec::with_capacity(containers.len());
        for container in containers {
            let id = match container.id {
                Some(id) => id,
                None => continue,
            };
            let stats = self.one_shot_stats(&id).await?;
            out.push(ContainerStat {
                cpu_cores: cpu_cores_from(&stats),
                memory_bytes: memory_bytes_from(&stats),
                id,
            });
        }
        Ok(out)
    }

    async fn container_for_service(&self, service: &str) -> Result<ServiceContainer> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("com.docker.swarm.service.name={}", service)],
        );
        let options = ListContainersOptions {
            all: false,
            filters,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;

        let id = containers
            .into_iter()
            .find_map(|c| c.id)
            .ok_or_else(|| {
                HealthError::System(format!("no container found for service {}", service))
            })?;
        let stats = self.one_shot_stats(&id).await?;
        Ok(ServiceContainer {
            memory_usage: memory_bytes_from(&stats),
            id,
        })
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }

    async fn prune_system(&self) -> Result<u64> {
        let containers = self
            .docker
            .prune_containers(None::<PruneContainersOptions<String>>)
            .await?;
        let images = self
            .docker
            .prune_images(None::<PruneImagesOptions<String>>)
            .await?;
        let volumes = self
            .docker
            .prune_volumes(None::<PruneVolumesOptions<String>>)
            .await?;

        let reclaimed = containers.space_reclaimed.unwrap_or(0).max(0) as u64
            + images.space_reclaimed.unwrap_or(0).max(0) as u64
            + volumes.space_reclaimed.unwrap_or(0).max(0) as u64;
        Ok(reclaimed)
    }
}
