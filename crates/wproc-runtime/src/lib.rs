//! # wproc-runtime: unix platform layer for the worker pool
//!
//! The syscall-facing half of the subsystem:
//! - [`broker`]: readiness notification (epoll / poll / select)
//! - [`iocache`]: per-descriptor read buffering with frame extraction
//! - [`runcmd`]: fork/pipe/exec child launcher with pid tracking
//! - [`worker`]: the worker process loop and worker spawning
//!
//! Linux-first; the poll backend covers other unixes and a select
//! backend hides behind the `select-backend` feature.

pub mod broker;
pub mod error;
pub mod iocache;
pub mod runcmd;
pub mod worker;

pub use broker::{max_usable_fds, IoBroker, Ready, Token, EV_HUP, EV_READ};
pub use error::{Result, WorkError};
pub use iocache::IoCache;
pub use runcmd::{Runcmd, Spawned};
pub use worker::{spawn_worker, WorkerHandle, IOCACHE_SIZE};
