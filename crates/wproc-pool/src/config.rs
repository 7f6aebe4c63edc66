//! Pool configuration.

use wproc_core::env::env_get;
use wproc_runtime::IOCACHE_SIZE;

/// Tunables for [`crate::WorkerPool`].
///
/// ```ignore
/// let cfg = PoolConfig::default().workers(8).horizon(1800);
/// ```
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Workers spawned when `init_workers(0)` is asked for the default.
    pub workers: usize,
    /// Scheduling-queue horizon in seconds; roughly the longest job
    /// timeout expected.
    pub horizon: usize,
    /// Per-worker response cache size in bytes.
    pub iocache_size: usize,
    /// In-flight job slots per worker; 0 derives `(fd limit - 1) / 2`.
    pub max_jobs: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            horizon: 900,
            iocache_size: IOCACHE_SIZE,
            max_jobs: 0,
        }
    }
}

impl PoolConfig {
    /// Defaults overridden by `WPROC_WORKERS` and `WPROC_HORIZON`.
    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            workers: env_get("WPROC_WORKERS", base.workers),
            horizon: env_get("WPROC_HORIZON", base.horizon),
            ..base
        }
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn horizon(mut self, seconds: usize) -> Self {
        self.horizon = seconds;
        self
    }

    pub fn iocache_size(mut self, bytes: usize) -> Self {
        self.iocache_size = bytes;
        self
    }

    pub fn max_jobs(mut self, slots: usize) -> Self {
        self.max_jobs = slots;
        self
    }
}
