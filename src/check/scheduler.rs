//! Periodic dispatch of check ticks
//!
//! One tokio task per check, each on its own cadence. Checks are
//! independent; a slow remediation in one never delays the others. A tick
//! arriving while the previous one is still remediating is made harmless by
//! the check's own `Recovering` guard.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::Check;

/// Owns the check set and spawns their interval tasks.
pub struct CheckScheduler {
    checks: Vec<Arc<dyn Check>>,
}

impl CheckScheduler {
    /// Create a scheduler over the given checks.
    pub fn new(checks: Vec<Arc<dyn Check>>) -> Self {
        Self { checks }
    }

    /// Spawn one interval task per check. Tasks run until aborted.
    pub fn spawn_all(&self) -> Vec<JoinHandle<()>> {
        self.checks
            .iter()
            .cloned()
            .map(|check| {
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(check.cycle());
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        interval.tick().await;
                        debug!("running {} check", check.name());
                        if let Err(e) = check.run().await {
                            warn!("{} check failed to store history: {}", check.name(), e);
                        }
                    }
                })
            })
            .collect()
    }
}
