//! Error types for the KCOV device.
//!
//! Every failure reported to a caller is a validation failure: nothing is
//! retried and no partial state is left behind. Internal-consistency
//! violations are not errors, they go through `kcov_verify!`.

use axerrno::LinuxError;

use crate::buffer::BufferError;

/// Result alias for device operations.
pub type KcovResult<T = ()> = Result<T, Error>;

/// Error types for KCOV device operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The process already holds a session, the session is already
    /// tracing, or its buffer has already been configured.
    Busy,
    /// The calling process never opened the device.
    NoSuchDevice,
    /// The calling thread is not the active tracer of any session.
    NoSuchEntry,
    /// The operation needs a buffer and none has been configured.
    NoBuffer,
    /// Unrecognized control request code.
    InvalidArgument,
    /// Mapping offset is unaligned or past the end of the buffer.
    InvalidOffset(u64),
    /// The trace buffer could not be allocated.
    Allocation(BufferError),
}

impl Error {
    /// Translate into the errno reported through the syscall layer.
    pub fn errno(&self) -> LinuxError {
        match self {
            Self::Busy => LinuxError::EBUSY,
            Self::NoSuchDevice => LinuxError::ENXIO,
            Self::NoSuchEntry => LinuxError::ENOENT,
            Self::NoBuffer => LinuxError::ENOBUFS,
            Self::InvalidArgument | Self::InvalidOffset(_) => LinuxError::EINVAL,
            Self::Allocation(BufferError::InvalidSize(_)) => LinuxError::EINVAL,
            Self::Allocation(BufferError::OutOfMemory(_)) => LinuxError::ENOMEM,
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Busy => write!(f, "Device or session busy"),
            Self::NoSuchDevice => write!(f, "Process has not opened the kcov device"),
            Self::NoSuchEntry => write!(f, "Thread is not tracing"),
            Self::NoBuffer => write!(f, "No trace buffer configured"),
            Self::InvalidArgument => write!(f, "Invalid control request"),
            Self::InvalidOffset(off) => write!(f, "Invalid mapping offset: {:#x}", off),
            Self::Allocation(e) => write!(f, "Trace buffer allocation failed: {}", e),
        }
    }
}

impl core::error::Error for Error {}

impl From<BufferError> for Error {
    fn from(e: BufferError) -> Self {
        Self::Allocation(e)
    }
}

impl From<Error> for LinuxError {
    fn from(e: Error) -> Self {
        e.errno()
    }
}

/// Collapse a device result into a syscall return value: `0` on success,
/// negated errno otherwise.
pub fn to_syscall_ret(result: KcovResult) -> isize {
    match result {
        Ok(()) => 0,
        Err(e) => -(e.errno().code() as isize),
    }
}
