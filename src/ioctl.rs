//! KCOV control requests.
//!
//! Request codes use the Linux `_IO`/`_IOW` encoding in the `'c'` space:
//!
//! ```text
//! bits 31..30  direction (0 = none, 1 = write)
//! bits 29..16  argument size
//! bits 15..8   type ('c')
//! bits  7..0   number
//! ```

use crate::error::{Error, KcovResult};

const IOC_NONE: u32 = 0;
const IOC_WRITE: u32 = 1;

const fn ioc(dir: u32, ty: u8, nr: u8, size: usize) -> u32 {
    (dir << 30) | ((size as u32) << 16) | ((ty as u32) << 8) | nr as u32
}

const fn io(ty: u8, nr: u8) -> u32 {
    ioc(IOC_NONE, ty, nr, 0)
}

const fn iow(ty: u8, nr: u8, size: usize) -> u32 {
    ioc(IOC_WRITE, ty, nr, size)
}

/// `ioctl(fd, KCOV_SETBUFSIZE, bytes)`: allocate the trace buffer.
pub const KCOV_SETBUFSIZE: u32 = iow(b'c', 1, core::mem::size_of::<usize>());

/// `ioctl(fd, KCOV_ENABLE)`: make the calling thread the active tracer.
pub const KCOV_ENABLE: u32 = io(b'c', 100);

/// `ioctl(fd, KCOV_DISABLE)`: stop tracing the calling thread.
pub const KCOV_DISABLE: u32 = io(b'c', 101);

/// A decoded control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    /// Allocate a trace buffer of the given size in bytes.
    SetBufferSize(usize),
    /// Start tracing the calling thread.
    Enable,
    /// Stop tracing the calling thread.
    Disable,
}

impl ControlRequest {
    /// Decode a raw request code and its argument word.
    pub fn decode(request: u32, arg: usize) -> KcovResult<Self> {
        match request {
            KCOV_SETBUFSIZE => Ok(Self::SetBufferSize(arg)),
            KCOV_ENABLE => Ok(Self::Enable),
            KCOV_DISABLE => Ok(Self::Disable),
            _ => Err(Error::InvalidArgument),
        }
    }

    /// The raw request code.
    pub fn code(&self) -> u32 {
        match self {
            Self::SetBufferSize(_) => KCOV_SETBUFSIZE,
            Self::Enable => KCOV_ENABLE,
            Self::Disable => KCOV_DISABLE,
        }
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::SetBufferSize(_) => "SETBUFSIZE",
            Self::Enable => "ENABLE",
            Self::Disable => "DISABLE",
        }
    }
}
