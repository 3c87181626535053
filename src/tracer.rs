//! Active tracers as seen by the recording path.
//!
//! Coverage callbacks fire on every edge of instrumented code, including code
//! that runs while the device holds its registry or session locks. The
//! recording path therefore never takes a lock: it finds the caller's slot in
//! a fixed open-addressed table and appends to the buffer published there.
//!
//! Writers (`claim`/`release`, called from enable, disable and thread exit)
//! serialize on a small leaf lock. A reader announces itself on the slot's
//! `readers` count before loading the buffer pointer, and `release` waits for
//! that count to drain before dropping its reference.

use alloc::sync::Arc;
use core::fmt;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use spin::Mutex;

use crate::buffer::TraceBuffer;
use crate::error::{Error, KcovResult};
use crate::platform::ThreadId;

/// Maximum number of threads tracing at the same time.
pub const KCOV_MAX_TRACERS: usize = 256;

const EMPTY: u64 = 0;
const TOMBSTONE: u64 = u64::MAX;

/// Slot key of `tid`, or `None` for the two ids reserved as markers.
fn key_of(tid: ThreadId) -> Option<u64> {
    match tid.0.checked_add(1) {
        Some(TOMBSTONE) | None => None,
        key => key,
    }
}

struct TracerSlot {
    key: AtomicU64,
    buffer: AtomicPtr<TraceBuffer>,
    readers: AtomicUsize,
}

impl TracerSlot {
    const fn new() -> Self {
        Self {
            key: AtomicU64::new(EMPTY),
            buffer: AtomicPtr::new(ptr::null_mut()),
            readers: AtomicUsize::new(0),
        }
    }
}

/// Thread id to trace buffer table, readable without locks.
pub struct TracerTable {
    slots: [TracerSlot; KCOV_MAX_TRACERS],
    writer: Mutex<()>,
}

impl TracerTable {
    pub const fn new() -> Self {
        Self {
            slots: [const { TracerSlot::new() }; KCOV_MAX_TRACERS],
            writer: Mutex::new(()),
        }
    }

    /// Slot sequence searched for `key`, starting at its home slot.
    fn chain(&self, key: u64) -> impl Iterator<Item = usize> {
        let home = (key - 1) as usize % KCOV_MAX_TRACERS;
        (0..KCOV_MAX_TRACERS).map(move |i| (home + i) % KCOV_MAX_TRACERS)
    }

    fn find(&self, key: u64) -> Option<usize> {
        for idx in self.chain(key) {
            match self.slots[idx].key.load(Ordering::Acquire) {
                EMPTY => return None,
                k if k == key => return Some(idx),
                _ => {}
            }
        }
        None
    }

    /// Publish `buffer` as the log of `tid`.
    ///
    /// Fails with `Busy` when every slot is taken and with
    /// `InvalidArgument` for the two reserved ids.
    pub fn claim(&self, tid: ThreadId, buffer: &Arc<TraceBuffer>) -> KcovResult {
        let Some(key) = key_of(tid) else {
            return Err(Error::InvalidArgument);
        };
        let _writer = self.writer.lock();
        kcov_verify!(
            self.find(key).is_none(),
            "kcov: {} claimed a tracer slot twice",
            tid
        );

        let free = self.chain(key).find(|idx| {
            matches!(
                self.slots[*idx].key.load(Ordering::Acquire),
                EMPTY | TOMBSTONE
            )
        });
        let Some(idx) = free else {
            warn!(
                "kcov: tracer table full ({} slots), {} not enabled",
                KCOV_MAX_TRACERS, tid
            );
            return Err(Error::Busy);
        };

        let slot = &self.slots[idx];
        let raw = Arc::into_raw(Arc::clone(buffer)) as *mut TraceBuffer;
        slot.buffer.store(raw, Ordering::SeqCst);
        slot.key.store(key, Ordering::SeqCst);
        Ok(())
    }

    /// Withdraw the buffer of `tid`. Returns false if it had none.
    ///
    /// Waits for recorders still using the buffer before dropping it.
    pub fn release(&self, tid: ThreadId) -> bool {
        let Some(key) = key_of(tid) else {
            return false;
        };
        let _writer = self.writer.lock();
        let Some(idx) = self.find(key) else {
            return false;
        };

        let slot = &self.slots[idx];
        let raw = slot.buffer.swap(ptr::null_mut(), Ordering::SeqCst);
        while slot.readers.load(Ordering::SeqCst) != 0 {
            core::hint::spin_loop();
        }

        let next = (idx + 1) % KCOV_MAX_TRACERS;
        if self.slots[next].key.load(Ordering::Acquire) == EMPTY {
            // End of a chain: clear it and the tombstones before it.
            slot.key.store(EMPTY, Ordering::SeqCst);
            let mut prev = (idx + KCOV_MAX_TRACERS - 1) % KCOV_MAX_TRACERS;
            while prev != idx && self.slots[prev].key.load(Ordering::Acquire) == TOMBSTONE {
                self.slots[prev].key.store(EMPTY, Ordering::SeqCst);
                prev = (prev + KCOV_MAX_TRACERS - 1) % KCOV_MAX_TRACERS;
            }
        } else {
            slot.key.store(TOMBSTONE, Ordering::SeqCst);
        }

        if !raw.is_null() {
            // SAFETY: `raw` came from `Arc::into_raw` in `claim`, the slot no
            // longer publishes it and every reader has left.
            drop(unsafe { Arc::from_raw(raw as *const TraceBuffer) });
        }
        true
    }

    /// Run `f` on the buffer of `tid`, if it has one. Takes no lock.
    #[inline]
    pub fn with_buffer<R>(&self, tid: ThreadId, f: impl FnOnce(&TraceBuffer) -> R) -> Option<R> {
        let key = key_of(tid)?;
        let idx = self.find(key)?;
        let slot = &self.slots[idx];

        slot.readers.fetch_add(1, Ordering::SeqCst);
        let raw = slot.buffer.load(Ordering::SeqCst);
        let result = if !raw.is_null() && slot.key.load(Ordering::SeqCst) == key {
            // SAFETY: the pointer was published for `key` and `release`
            // cannot drop it while `readers` is non-zero.
            Some(f(unsafe { &*raw }))
        } else {
            None
        };
        slot.readers.fetch_sub(1, Ordering::SeqCst);
        result
    }

    /// Whether `tid` has a published buffer.
    pub fn contains(&self, tid: ThreadId) -> bool {
        self.with_buffer(tid, |_| ()).is_some()
    }

    /// Number of published buffers.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| !s.buffer.load(Ordering::Acquire).is_null())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TracerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TracerTable {
    fn drop(&mut self) {
        for slot in &mut self.slots {
            let raw = *slot.buffer.get_mut();
            if !raw.is_null() {
                // SAFETY: still owned by the slot; no readers can exist.
                drop(unsafe { Arc::from_raw(raw as *const TraceBuffer) });
            }
        }
    }
}

impl fmt::Debug for TracerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracerTable")
            .field("capacity", &KCOV_MAX_TRACERS)
            .field("len", &self.len())
            .finish()
    }
}
