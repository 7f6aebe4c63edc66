//! Runtime error types.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkError {
    /// Nothing registered with the broker; polling would sleep forever.
    NoFds,
    /// Descriptor out of range or not registered.
    BadFd(i32),
    /// Command line empty or not representable as an argv.
    BadCommand,
    /// No tracked child for this descriptor.
    UnknownChild(i32),
    /// OS error with errno.
    Sys(i32),
}

impl fmt::Display for WorkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoFds => write!(f, "no descriptors registered"),
            Self::BadFd(fd) => write!(f, "bad file descriptor {}", fd),
            Self::BadCommand => write!(f, "unusable command line"),
            Self::UnknownChild(fd) => write!(f, "no child tracked for fd {}", fd),
            Self::Sys(e) => write!(
                f,
                "OS error: errno {} ({})",
                e,
                std::io::Error::from_raw_os_error(*e)
            ),
        }
    }
}

impl std::error::Error for WorkError {}

impl From<nix::errno::Errno> for WorkError {
    fn from(e: nix::errno::Errno) -> Self {
        Self::Sys(e as i32)
    }
}

pub type Result<T> = std::result::Result<T, WorkError>;

/// The calling thread's current errno value.
pub fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

impl WorkError {
    /// Capture errno right after a failed libc call.
    pub fn last_sys() -> Self {
        Self::Sys(last_errno())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_errno() {
        let msg = WorkError::Sys(libc::EPIPE).to_string();
        assert!(msg.contains("errno 32"), "{}", msg);
    }
}
