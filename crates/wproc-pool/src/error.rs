//! Pool error types.

use std::fmt;

use wproc_runtime::WorkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Rejected configuration (shrinking the pool, zero workers).
    Config(&'static str),
    /// No live worker to dispatch to.
    NoWorkers,
    /// Platform-layer failure.
    Runtime(WorkError),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration: {}", msg),
            Self::NoWorkers => write!(f, "no live workers"),
            Self::Runtime(e) => write!(f, "runtime: {}", e),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<WorkError> for PoolError {
    fn from(e: WorkError) -> Self {
        Self::Runtime(e)
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;
