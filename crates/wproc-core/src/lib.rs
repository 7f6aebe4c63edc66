//! # wproc-core: platform-agnostic building blocks for the worker pool
//!
//! Everything in this crate is pure data-structure code: no syscalls, no
//! file descriptors. The platform-facing half of the subsystem (broker,
//! iocache, runcmd, worker loop) lives in `wproc-runtime`.
//!
//! Modules:
//! - [`kvvec`]: the `key=value\0` wire codec used on the master/worker channel
//! - [`squeue`]: time-bucketed scheduling queue (O(1) add/remove)
//! - [`cmdline`]: shell-like argv tokenizer with shell-fallback flags
//! - [`tv`]: second/microsecond timestamps and their wire format
//! - [`env`]: environment variable parsing helpers
//! - [`wlog`]: leveled stderr log macros

pub mod cmdline;
pub mod env;
pub mod kvvec;
pub mod squeue;
pub mod tv;
pub mod wlog;

pub use cmdline::{split, CmdFlags};
pub use kvvec::{KeyValue, KvBuf, KvVec, FRAME_DELIM, KV_SEP, PAIR_SEP};
pub use squeue::{EventHandle, Squeue};
pub use tv::Tv;
pub use wlog::LogLevel;
