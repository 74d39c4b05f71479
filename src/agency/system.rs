//! Host disk agency
//!
//! Remaining capacity comes from the host filesystem; reclamation is a
//! docker system prune delegated to the docker agency.

use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use sysinfo::Disks;

use super::docker::DockerAgency;
use crate::utils::error::{HealthError, Result};

/// Disk operations the disk check depends on.
#[async_trait::async_trait]
pub trait DiskSysAgency: Send + Sync {
    /// Remaining capacity of the root filesystem in bytes.
    async fn remaining_disk_capacity(&self) -> Result<u64>;

    /// Prune the docker system and return reclaimed bytes.
    async fn prune_docker_system(&self) -> Result<u64>;
}

/// Agency probing the host with sysinfo and pruning through docker.
pub struct SysDiskAgency {
    disks: Mutex<Disks>,
    docker: Arc<dyn DockerAgency>,
}

impl SysDiskAgency {
    /// Create a new host disk agency.
    pub fn new(docker: Arc<dyn DockerAgency>) -> Self {
        Self {
            disks: Mutex::new(Disks::new_with_refreshed_list()),
            docker,
        }
    }
}

#[async_trait::async_trait]
impl DiskSysAgency for SysDiskAgency {
    async fn remaining_disk_capacity(&self) -> Result<u64> {
        let mut disks = self.disks.lock();
        disks.refresh_list();

        let list = disks.list();
        let disk = list
            .iter()
            .find(|d| d.mount_point() == Path::new("/"))
            .or_else(|| list.first())
            .ok_or_else(|| HealthError::System("no disks visible to the host probe".to_string()))?;
        Ok(disk.available_space())
    }

    async fn prune_docker_system(&self) -> Result<u64> {
        self.docker.prune_system().await
    }
}
