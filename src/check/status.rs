//! Per-check status cell

use parking_lot::Mutex;

/// Three-state condition of one check, held in memory for the process
/// lifetime. A restarted daemon always begins at `Healthy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    /// The subsystem passed its last evaluation
    Healthy,
    /// A remediation is in flight; further ticks are guarded off
    Recovering,
    /// Remediation did not help; only re-evaluation happens from here
    Unhealthy,
}

/// Mutex-guarded status shared between ticks of one check.
///
/// Probing and remediating happen outside the lock; only the status reads
/// and transitions go through it.
#[derive(Debug)]
pub struct StatusCell {
    inner: Mutex<CheckStatus>,
}

impl StatusCell {
    /// New cell starting at `Healthy`.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CheckStatus::Healthy),
        }
    }

    /// Current status.
    pub fn get(&self) -> CheckStatus {
        *self.inner.lock()
    }

    /// Overwrite the status.
    pub fn set(&self, status: CheckStatus) {
        *self.inner.lock() = status;
    }

    /// Transition `Healthy` to `Recovering` if and only if the cell is still
    /// `Healthy`. The test and the transition are one atomic step, so at
    /// most one tick can own a remediation at a time.
    pub fn begin_recovery(&self) -> bool {
        let mut guard = self.inner.lock();
        if *guard == CheckStatus::Healthy {
            *guard = CheckStatus::Recovering;
            true
        } else {
            false
        }
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}
