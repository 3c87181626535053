//! User mappings of session trace buffers.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use crate::buffer::{KCOV_ENTRY_SIZE, TraceBuffer};
use crate::platform::ProcessId;

/// Page protection requested for a mapping (`PROT_*` bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Protection(u32);

impl Protection {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(1 << 0);
    pub const WRITE: Self = Self(1 << 1);
    pub const EXEC: Self = Self(1 << 2);
    pub const READ_WRITE: Self = Self(Self::READ.0 | Self::WRITE.0);

    /// Build from raw `PROT_*` bits, dropping unknown ones.
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & 0b111)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for Protection {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A region of a process address space backed by a session's trace buffer.
///
/// The region is a view, not an owner: it holds a weak reference, so the
/// buffer is released with its session no matter how many regions exist.
#[derive(Debug, Clone)]
pub struct MappedRegion {
    pid: ProcessId,
    offset: usize,
    len: usize,
    protection: Protection,
    shared: bool,
    buffer: Weak<TraceBuffer>,
}

impl MappedRegion {
    pub(crate) fn new(
        pid: ProcessId,
        buffer: &Arc<TraceBuffer>,
        offset: usize,
        protection: Protection,
        shared: bool,
    ) -> Self {
        Self {
            pid,
            offset,
            len: buffer.len() - offset,
            protection,
            shared,
            buffer: Arc::downgrade(buffer),
        }
    }

    /// Process the region was mapped into.
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// Byte offset into the trace buffer.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Length of the region in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn protection(&self) -> Protection {
        self.protection
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Whether the backing buffer still exists.
    pub fn is_live(&self) -> bool {
        self.buffer.strong_count() > 0
    }

    /// Kernel virtual address the region starts at, while the buffer lives.
    pub fn base_address(&self) -> Option<usize> {
        let buffer = self.buffer.upgrade()?;
        Some(buffer.as_ptr() as usize + self.offset)
    }

    /// Read the log word at `index`, counted from the start of the region.
    pub fn read_word(&self, index: usize) -> Option<u64> {
        index
            .checked_mul(KCOV_ENTRY_SIZE)
            .filter(|bytes| *bytes < self.len)?;
        let buffer = self.buffer.upgrade()?;
        buffer.load_word(self.offset / KCOV_ENTRY_SIZE + index)
    }

    /// Recorded PCs, for regions that start at the log header.
    pub fn pcs(&self) -> Option<Vec<u64>> {
        if self.offset != 0 {
            return None;
        }
        self.buffer.upgrade().map(|b| b.pcs())
    }

    /// Reset the log the way user space does: store 0 into the header.
    pub fn reset(&self) -> bool {
        if self.offset != 0 || !self.protection.contains(Protection::WRITE) {
            return false;
        }
        match self.buffer.upgrade() {
            Some(buffer) => {
                buffer.reset();
                true
            }
            None => false,
        }
    }
}
