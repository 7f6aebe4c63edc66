//! Job and result types on the master side.

use wproc_core::squeue::EventHandle;
use wproc_core::tv::Tv;

/// What a job is for; rides the wire as the `type` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Check,
    Notify,
}

impl JobKind {
    pub fn code(self) -> i32 {
        match self {
            Self::Check => 0,
            Self::Notify => 1,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Check),
            1 => Some(Self::Notify),
            _ => None,
        }
    }
}

/// Resource accounting decoded from a worker response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rusage {
    pub utime: Tv,
    pub stime: Tv,
    pub minflt: i64,
    pub majflt: i64,
    pub nswap: i64,
    pub inblock: i64,
    pub oublock: i64,
    pub nsignals: i64,
}

/// The accumulator a check response is decoded into before it is handed
/// to the daemon's completion callback.
///
/// `output` is raw bytes: plugin output is captured verbatim. When the
/// child wrote nothing to stdout, stderr is promoted into `output` so
/// the daemon still sees the diagnostics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckResult {
    pub host_name: String,
    pub service_description: Option<String>,
    pub latency: f64,
    pub start_time: Tv,
    pub finish_time: Tv,
    pub early_timeout: bool,
    pub exited_ok: bool,
    pub return_code: i32,
    pub output: Vec<u8>,
    pub rusage: Rusage,
}

impl CheckResult {
    /// Accumulator for a host check.
    pub fn for_host(host_name: &str) -> Self {
        Self {
            host_name: host_name.to_string(),
            ..Self::default()
        }
    }

    /// Accumulator for a service check.
    pub fn for_service(host_name: &str, service_description: &str) -> Self {
        Self {
            host_name: host_name.to_string(),
            service_description: Some(service_description.to_string()),
            ..Self::default()
        }
    }
}

/// Context of a notification job; its result is consumed for logging.
#[derive(Debug, Clone)]
pub struct NotifyJob {
    pub contact: String,
    pub host_name: String,
    pub service_description: Option<String>,
}

/// What a completed job resolves into.
#[derive(Debug)]
pub enum JobPayload {
    Check(CheckResult),
    Notify(NotifyJob),
}

/// One in-flight job, parked in a worker slot until its response lands.
#[derive(Debug)]
pub struct WorkerJob {
    pub id: u64,
    pub kind: JobKind,
    /// Absolute deadline in unix seconds. Advisory in this version.
    pub timeout: i64,
    pub command: String,
    pub payload: JobPayload,
    pub(crate) wakeup: Option<EventHandle>,
}

/// Completion delivery into the daemon. The pool picks the method by
/// whether the accumulator names a service.
pub trait CheckHandler {
    fn host_check(&mut self, result: CheckResult);
    fn service_check(&mut self, result: CheckResult);
}
