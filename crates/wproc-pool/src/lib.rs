//! # wproc-pool: the master side of the worker pool
//!
//! The daemon-facing API: spawn workers, queue checks and
//! notifications, poll for completions. See [`WorkerPool`].
//!
//! ```ignore
//! use wproc_pool::{CheckHandler, CheckResult, PoolConfig, WorkerPool};
//!
//! let mut pool = WorkerPool::new(PoolConfig::from_env(), Box::new(handler))?;
//! pool.init_workers(0)?;
//! pool.run_check(CheckResult::for_host("web01"), "/usr/lib/plugins/check_ping", 30)?;
//! loop {
//!     pool.poll(1000)?;
//! }
//! ```

pub mod config;
pub mod error;
pub mod job;
pub mod pool;

pub use config::PoolConfig;
pub use error::{PoolError, Result};
pub use job::{CheckHandler, CheckResult, JobKind, JobPayload, NotifyJob, Rusage, WorkerJob};
pub use pool::{WorkerPool, WorkerProcess};
