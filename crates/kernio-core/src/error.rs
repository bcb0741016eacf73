//! kernio error types.

use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// AIO/epoll context creation failed.
    ContextSetup(i32),
    /// io_uring setup failed.
    UringSetup(i32),
    /// The kernel's io_uring lacks a feature the backend depends on.
    UringMissingFeature(&'static str),
    /// The kernel's io_uring lacks a required opcode.
    UringMissingOpcode(u8),
    /// The descriptor was forgotten while a readiness future was pending.
    FdAborted,
    /// The requested backend cannot run on this host.
    Unavailable(&'static str),
    /// OS error with errno.
    Os(i32),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContextSetup(e) => write!(f, "io context setup: errno {}", e),
            Self::UringSetup(e) => write!(f, "io_uring setup: errno {}", e),
            Self::UringMissingFeature(name) => write!(f, "io_uring feature missing: {}", name),
            Self::UringMissingOpcode(op) => write!(f, "io_uring opcode {} not supported", op),
            Self::FdAborted => write!(f, "pollable descriptor aborted"),
            Self::Unavailable(which) => write!(f, "backend unavailable: {}", which),
            Self::Os(e) => write!(f, "OS error: errno {}", e),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Fetch the calling thread's errno.
#[inline]
pub fn errno() -> i32 {
    // Safety: __errno_location is always valid on Linux.
    unsafe { *libc::__errno_location() }
}
