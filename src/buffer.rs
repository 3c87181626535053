//! Coverage trace buffer.
//!
//! A trace buffer is a zeroed, page-aligned block of kernel memory that is
//! later mapped into the owning process. It is laid out as an array of
//! 64-bit words:
//!
//! ```text
//! word 0        number of recorded PCs (n)
//! word 1..=n    recorded PCs, in execution order
//! ```
//!
//! The kernel side only ever appends; user space reads the log through its
//! mapping and may reset it by storing 0 into word 0.

use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

/// Granularity of trace buffer allocations and mappings.
pub const PAGE_SIZE: usize = 0x1000;

/// Size of one log word.
pub const KCOV_ENTRY_SIZE: usize = core::mem::size_of::<u64>();

/// Largest buffer a single session may request.
pub const KCOV_MAX_BUFFER_SIZE: usize = 10 * 1024 * 1024;

/// Header word plus at least one PC.
const KCOV_MIN_BUFFER_SIZE: usize = 2 * KCOV_ENTRY_SIZE;

/// Round `size` up to a whole number of pages.
#[inline]
pub const fn page_round_up(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Error types for trace buffer allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    /// Requested size is zero, too small to hold a PC, or too large.
    InvalidSize(usize),
    /// The page allocator could not satisfy the request.
    OutOfMemory(usize),
}

impl core::fmt::Display for BufferError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidSize(size) => write!(f, "Invalid buffer size: {} bytes", size),
            Self::OutOfMemory(size) => write!(f, "Out of memory allocating {} bytes", size),
        }
    }
}

impl core::error::Error for BufferError {}

/// Kernel-owned backing memory of one session's coverage log.
pub struct TraceBuffer {
    base: NonNull<u8>,
    /// Page-rounded size of the allocation.
    len: usize,
    /// Size the session asked for; bounds the usable log.
    requested: usize,
    /// PCs discarded because the log was full.
    dropped: AtomicU64,
}

// The memory is only accessed through `AtomicU64` views.
unsafe impl Send for TraceBuffer {}
unsafe impl Sync for TraceBuffer {}

impl TraceBuffer {
    /// Allocate a zeroed buffer able to hold `size` bytes of log.
    pub fn allocate(size: usize) -> Result<Self, BufferError> {
        if !(KCOV_MIN_BUFFER_SIZE..=KCOV_MAX_BUFFER_SIZE).contains(&size) {
            return Err(BufferError::InvalidSize(size));
        }

        let len = page_round_up(size);
        let base = backend::alloc_pages(len).ok_or(BufferError::OutOfMemory(size))?;

        log::debug!(
            "kcov: allocated trace buffer at {:p} ({} bytes, {} pages)",
            base.as_ptr(),
            len,
            len / PAGE_SIZE
        );

        Ok(Self {
            base,
            len,
            requested: size,
            dropped: AtomicU64::new(0),
        })
    }

    fn words(&self) -> &[AtomicU64] {
        // SAFETY: `base` is page aligned, `len` bytes long and zero-initialized,
        // and lives as long as `self`. AtomicU64 has the layout of u64.
        unsafe {
            core::slice::from_raw_parts(
                self.base.as_ptr() as *const AtomicU64,
                self.len / KCOV_ENTRY_SIZE,
            )
        }
    }

    /// Size of the backing memory in bytes (page rounded).
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; zero-sized buffers are rejected at allocation.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size requested by the session.
    pub fn requested_size(&self) -> usize {
        self.requested
    }

    /// Number of log words, including the header word.
    pub fn entries(&self) -> usize {
        self.requested / KCOV_ENTRY_SIZE
    }

    /// Maximum number of PCs the log can hold.
    pub fn capacity(&self) -> usize {
        self.entries() - 1
    }

    /// Number of PCs currently recorded.
    ///
    /// The header is writable from user space, so it is clamped.
    pub fn count(&self) -> usize {
        let n = self.words()[0].load(Ordering::Acquire) as usize;
        n.min(self.capacity())
    }

    /// Append a PC to the log. Returns false when the log is full.
    ///
    /// Must only be called by the session's active tracer.
    pub fn record_pc(&self, pc: u64) -> bool {
        let words = self.words();
        let idx = words[0].load(Ordering::Relaxed) as usize;
        if idx >= self.capacity() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        words[idx + 1].store(pc, Ordering::Relaxed);
        words[0].store(idx as u64 + 1, Ordering::Release);
        true
    }

    /// Copy out the recorded PCs.
    pub fn pcs(&self) -> Vec<u64> {
        let words = self.words();
        let n = self.count();
        words[1..=n]
            .iter()
            .map(|w| w.load(Ordering::Relaxed))
            .collect()
    }

    /// Read a raw log word, header included.
    pub fn load_word(&self, index: usize) -> Option<u64> {
        self.words().get(index).map(|w| w.load(Ordering::Acquire))
    }

    /// Discard all recorded PCs.
    pub fn reset(&self) {
        self.words()[0].store(0, Ordering::Release);
    }

    /// Number of PCs dropped because the log was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Kernel virtual address of the first byte.
    pub fn as_ptr(&self) -> *const u8 {
        self.base.as_ptr()
    }
}

impl Drop for TraceBuffer {
    fn drop(&mut self) {
        log::debug!(
            "kcov: releasing trace buffer at {:p} ({} bytes)",
            self.base.as_ptr(),
            self.len
        );
        backend::free_pages(self.base, self.len);
    }
}

impl core::fmt::Debug for TraceBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TraceBuffer")
            .field("base", &self.base)
            .field("len", &self.len)
            .field("requested", &self.requested)
            .field("count", &self.count())
            .finish()
    }
}

// =============================================================================
// Page Backends
// =============================================================================

#[cfg(feature = "axalloc")]
mod backend {
    use core::ptr::NonNull;

    use super::PAGE_SIZE;

    pub(super) fn alloc_pages(len: usize) -> Option<NonNull<u8>> {
        let vaddr = axalloc::global_allocator()
            .alloc_pages(len / PAGE_SIZE, PAGE_SIZE, axalloc::UsageKind::Global)
            .ok()?;
        unsafe {
            core::ptr::write_bytes(vaddr as *mut u8, 0, len);
        }
        NonNull::new(vaddr as *mut u8)
    }

    pub(super) fn free_pages(base: NonNull<u8>, len: usize) {
        axalloc::global_allocator().dealloc_pages(
            base.as_ptr() as usize,
            len / PAGE_SIZE,
            axalloc::UsageKind::Global,
        );
    }
}

#[cfg(not(feature = "axalloc"))]
mod backend {
    use alloc::alloc::{Layout, alloc_zeroed, dealloc};
    use core::ptr::NonNull;

    use super::PAGE_SIZE;

    fn layout(len: usize) -> Option<Layout> {
        Layout::from_size_align(len, PAGE_SIZE).ok()
    }

    pub(super) fn alloc_pages(len: usize) -> Option<NonNull<u8>> {
        let layout = layout(len)?;
        NonNull::new(unsafe { alloc_zeroed(layout) })
    }

    pub(super) fn free_pages(base: NonNull<u8>, len: usize) {
        if let Some(layout) = layout(len) {
            unsafe { dealloc(base.as_ptr(), layout) }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
