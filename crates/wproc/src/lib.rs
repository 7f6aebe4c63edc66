//! # wproc: worker-pool execution subsystem
//!
//! A monitoring daemon's scheduler must run huge volumes of short-lived
//! external commands (plugin probes, notification scripts) without ever
//! blocking. This crate family does exactly that: long-lived worker
//! processes forked at startup, jobs framed over socketpairs, child
//! output multiplexed by a readiness broker, results delivered back
//! with exit status and rusage.
//!
//! This facade re-exports the public API of the three layers:
//!
//! - [`wproc_core`]: codec, scheduling queue, command splitter
//! - [`wproc_runtime`]: broker, iocache, runcmd, worker loop
//! - [`wproc_pool`]: the daemon-facing pool
//!
//! Typical use goes through [`WorkerPool`]:
//!
//! ```ignore
//! use wproc::{CheckHandler, CheckResult, PoolConfig, WorkerPool};
//!
//! struct Daemon;
//! impl CheckHandler for Daemon {
//!     fn host_check(&mut self, r: CheckResult) { /* update host state */ }
//!     fn service_check(&mut self, r: CheckResult) { /* update service state */ }
//! }
//!
//! let mut pool = WorkerPool::new(PoolConfig::from_env(), Box::new(Daemon))?;
//! pool.init_workers(0)?;
//! pool.run_check(CheckResult::for_host("web01"), "/usr/lib/plugins/check_ping", 30)?;
//! loop {
//!     pool.poll(1000)?; // completions call back from in here
//! }
//! ```

pub use wproc_core::{
    cmdline, env, kvvec, squeue, tv, wlog, CmdFlags, EventHandle, KeyValue, KvBuf, KvVec,
    LogLevel, Squeue, Tv, FRAME_DELIM, KV_SEP, PAIR_SEP,
};
pub use wproc_pool::{
    CheckHandler, CheckResult, JobKind, JobPayload, NotifyJob, PoolConfig, PoolError, Rusage,
    WorkerJob, WorkerPool, WorkerProcess,
};
pub use wproc_runtime::{
    broker, iocache, runcmd, worker, IoBroker, IoCache, Ready, Runcmd, Token, WorkError,
    WorkerHandle,
};
