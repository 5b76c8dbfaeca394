//! Resource controller: global caps on concurrency and memory.
//!
//! Three independent gates guard admission:
//! - `tasks` - concurrent plugin executions (default = CPU cores, 1..=32)
//! - `downloads` - concurrent DOWNLOAD-phase executions (default 2)
//! - `memory` - a soft cap on the aggregate resident set of active plugins
//!
//! Permits are acquired in the fixed order task → download → memory and
//! released in reverse, which together with the mutex manager's ordering
//! rules out lock-ordering deadlocks.

use crate::errors::ResourceError;
use crate::plugin::Phase;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

/// Safety upper bound on any single permit wait.
const DEFAULT_PERMIT_TIMEOUT: Duration = Duration::from_secs(3600);

/// How often the memory gate re-checks usage while admissions are blocked.
const MEMORY_POLL: Duration = Duration::from_secs(1);

/// Configured limits.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    pub tasks: usize,
    pub downloads: usize,
    pub memory_mb: u64,
    pub permit_timeout: Duration,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            tasks: cores.clamp(1, 32),
            downloads: 2,
            memory_mb: 8192,
            permit_timeout: DEFAULT_PERMIT_TIMEOUT,
        }
    }
}

impl ResourceLimits {
    pub fn with_tasks(mut self, tasks: usize) -> Self {
        self.tasks = tasks.clamp(1, 32);
        self
    }

    pub fn with_downloads(mut self, downloads: usize) -> Self {
        self.downloads = downloads.max(1);
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.memory_mb = memory_mb;
        self
    }
}

/// Permits held by one admitted plugin execution. Dropping releases them in
/// reverse acquisition order.
#[derive(Debug)]
pub struct AdmissionPermits {
    // Field order matters: drop runs top to bottom, so memory releases
    // first, then download, then task.
    _memory: MemoryReservation,
    _download: Option<OwnedSemaphorePermit>,
    _task: OwnedSemaphorePermit,
}

/// Reservation against the memory gate; returns the estimate on drop.
#[derive(Debug)]
struct MemoryReservation {
    governor: Arc<MemoryGovernor>,
    estimated_mb: u64,
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.governor.release(self.estimated_mb);
    }
}

/// Soft memory gate. Admission blocks while the sum of reservations plus
/// the sampled usage of already-running plugins exceeds the cap.
#[derive(Debug)]
struct MemoryGovernor {
    cap_mb: u64,
    reserved_mb: AtomicU64,
    sampled_mb: AtomicU64,
    freed: Notify,
}

impl MemoryGovernor {
    fn new(cap_mb: u64) -> Self {
        Self {
            cap_mb,
            reserved_mb: AtomicU64::new(0),
            sampled_mb: AtomicU64::new(0),
            freed: Notify::new(),
        }
    }

    fn usage_mb(&self) -> u64 {
        self.reserved_mb
            .load(Ordering::Relaxed)
            .max(self.sampled_mb.load(Ordering::Relaxed))
    }

    async fn admit(self: &Arc<Self>, estimated_mb: u64, timeout: Duration) -> Result<(), ResourceError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let usage = self.usage_mb();
            if usage + estimated_mb <= self.cap_mb || usage == 0 {
                // An over-sized single plugin is admitted when nothing else
                // runs, otherwise it could never start.
                self.reserved_mb.fetch_add(estimated_mb, Ordering::Relaxed);
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ResourceError::PermitTimeout {
                    kind: "memory",
                    timeout_secs: timeout.as_secs(),
                });
            }
            tokio::select! {
                _ = self.freed.notified() => {}
                _ = tokio::time::sleep(MEMORY_POLL) => {}
            }
        }
    }

    fn release(&self, estimated_mb: u64) {
        let _ = self
            .reserved_mb
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(estimated_mb))
            });
        self.freed.notify_waiters();
    }
}

/// Process-wide admission gates.
pub struct ResourceController {
    limits: ResourceLimits,
    tasks: Arc<Semaphore>,
    downloads: Arc<Semaphore>,
    memory: Arc<MemoryGovernor>,
}

impl ResourceController {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            tasks: Arc::new(Semaphore::new(limits.tasks)),
            downloads: Arc::new(Semaphore::new(limits.downloads)),
            memory: Arc::new(MemoryGovernor::new(limits.memory_mb)),
            limits,
        }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Acquire the permits required to run one plugin in `phase`.
    /// Order: task → download (DOWNLOAD phase only) → memory.
    pub async fn admit(
        &self,
        phase: Phase,
        estimated_mb: u64,
    ) -> Result<AdmissionPermits, ResourceError> {
        let timeout = self.limits.permit_timeout;

        let task = acquire_with_timeout(&self.tasks, "task", timeout).await?;
        let download = if phase == Phase::Download {
            Some(acquire_with_timeout(&self.downloads, "download", timeout).await?)
        } else {
            None
        };
        self.memory.admit(estimated_mb, timeout).await?;

        Ok(AdmissionPermits {
            _memory: MemoryReservation {
                governor: self.memory.clone(),
                estimated_mb,
            },
            _download: download,
            _task: task,
        })
    }

    /// Feed the aggregate sampled resident set of all running plugins,
    /// called about once a second by the metrics samplers.
    pub fn update_sampled_memory(&self, total_mb: u64) {
        self.memory.sampled_mb.store(total_mb, Ordering::Relaxed);
        if total_mb <= self.limits.memory_mb {
            self.memory.freed.notify_waiters();
        }
    }

    /// Currently available task permits (diagnostics).
    pub fn available_tasks(&self) -> usize {
        self.tasks.available_permits()
    }
}

async fn acquire_with_timeout(
    semaphore: &Arc<Semaphore>,
    kind: &'static str,
    timeout: Duration,
) -> Result<OwnedSemaphorePermit, ResourceError> {
    match tokio::time::timeout(timeout, semaphore.clone().acquire_owned()).await {
        Ok(Ok(permit)) => Ok(permit),
        Ok(Err(_)) => Err(ResourceError::Closed),
        Err(_) => Err(ResourceError::PermitTimeout {
            kind,
            timeout_secs: timeout.as_secs(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(tasks: usize, downloads: usize, memory_mb: u64) -> ResourceLimits {
        ResourceLimits {
            tasks,
            downloads,
            memory_mb,
            permit_timeout: Duration::from_millis(50),
        }
    }

    #[test]
    fn test_default_limits_clamped() {
        let limits = ResourceLimits::default();
        assert!(limits.tasks >= 1 && limits.tasks <= 32);
        assert_eq!(limits.downloads, 2);
        assert_eq!(ResourceLimits::default().with_tasks(100).tasks, 32);
        assert_eq!(ResourceLimits::default().with_tasks(0).tasks, 1);
    }

    #[tokio::test]
    async fn test_task_permit_exclusion() {
        let controller = ResourceController::new(limits(1, 2, 1024));
        let first = controller.admit(Phase::Execute, 0).await.unwrap();
        assert_eq!(controller.available_tasks(), 0);

        // Second admission must time out while the first permit is held.
        let err = controller.admit(Phase::Execute, 0).await.unwrap_err();
        assert!(matches!(
            err,
            ResourceError::PermitTimeout { kind: "task", .. }
        ));

        drop(first);
        let _second = controller.admit(Phase::Execute, 0).await.unwrap();
    }

    #[tokio::test]
    async fn test_download_permit_only_for_download_phase() {
        let controller = ResourceController::new(limits(4, 1, 1024));
        let _dl = controller.admit(Phase::Download, 0).await.unwrap();

        // EXECUTE admissions ignore the exhausted download gate.
        let _exec = controller.admit(Phase::Execute, 0).await.unwrap();

        // A second DOWNLOAD admission blocks on it.
        let err = controller.admit(Phase::Download, 0).await.unwrap_err();
        assert!(matches!(
            err,
            ResourceError::PermitTimeout {
                kind: "download",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_memory_gate_blocks_over_cap() {
        let controller = ResourceController::new(limits(4, 2, 1000));
        let first = controller.admit(Phase::Execute, 800).await.unwrap();
        let err = controller.admit(Phase::Execute, 400).await.unwrap_err();
        assert!(matches!(
            err,
            ResourceError::PermitTimeout { kind: "memory", .. }
        ));

        drop(first);
        let _second = controller.admit(Phase::Execute, 400).await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_plugin_admitted_when_idle() {
        let controller = ResourceController::new(limits(4, 2, 100));
        // A single plugin estimated above the cap still runs alone.
        let _only = controller.admit(Phase::Execute, 500).await.unwrap();
    }

    #[tokio::test]
    async fn test_sampled_memory_blocks_admission() {
        let controller = ResourceController::new(limits(4, 2, 1000));
        controller.update_sampled_memory(1200);
        let err = controller.admit(Phase::Execute, 100).await.unwrap_err();
        assert!(matches!(
            err,
            ResourceError::PermitTimeout { kind: "memory", .. }
        ));

        controller.update_sampled_memory(300);
        let _ok = controller.admit(Phase::Execute, 100).await.unwrap();
    }
}
