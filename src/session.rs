//! Per-process coverage tracing sessions.
//!
//! ```text
//!  open()        SETBUFSIZE         ENABLE                DISABLE / thread exit
//! ───────> Opened ─────────> Opened ──────> Tracing ─────────────────────────> Opened
//!                                                     process exit (Opened only)
//!                                            Opened ─────────────────────────> Unused
//! ```
//!
//! All transitions happen with the session lock held.

use alloc::sync::Arc;

use spin::{Mutex, MutexGuard, Once};

use crate::buffer::TraceBuffer;
use crate::error::{Error, KcovResult};
use crate::platform::{ProcessId, ThreadId};

/// Lifecycle state of a session.
///
/// Ordered so that `state >= Tracing` reads as "tracing or beyond".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Destroyed by process teardown; never observed through a registry.
    Unused,
    /// Device opened, not tracing. A buffer may or may not exist.
    Opened,
    /// A buffer exists and one thread is the active tracer.
    Tracing,
}

impl SessionState {
    /// Short label for display.
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Unused => "unused",
            SessionState::Opened => "opened",
            SessionState::Tracing => "tracing",
        }
    }
}

/// Mutable part of a session, guarded by the session lock.
#[derive(Debug)]
pub struct SessionInner {
    state: SessionState,
    tracer: Option<ThreadId>,
    tracing_since_ns: Option<u64>,
}

impl SessionInner {
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn tracer(&self) -> Option<ThreadId> {
        self.tracer
    }

    /// Opened -> Tracing.
    pub(crate) fn begin_tracing(&mut self, tid: ThreadId, now_ns: u64) {
        self.state = SessionState::Tracing;
        self.tracer = Some(tid);
        self.tracing_since_ns = Some(now_ns);
    }

    /// Tracing -> Opened.
    pub(crate) fn end_tracing(&mut self) {
        self.state = SessionState::Opened;
        self.tracer = None;
        self.tracing_since_ns = None;
    }

    /// Opened -> Unused.
    pub(crate) fn retire(&mut self) {
        self.state = SessionState::Unused;
    }
}

/// Guard over a session's mutable state; released on every exit path.
pub type SessionGuard<'a> = MutexGuard<'a, SessionInner>;

/// Coverage tracing context of one process.
#[derive(Debug)]
pub struct Session {
    pid: ProcessId,
    inner: Mutex<SessionInner>,
    /// Set at most once, under the session lock.
    buffer: Once<Arc<TraceBuffer>>,
}

impl Session {
    /// A fresh session for `pid`, in state `Opened` without a buffer.
    pub(crate) fn new(pid: ProcessId) -> Self {
        Self {
            pid,
            inner: Mutex::new(SessionInner {
                state: SessionState::Opened,
                tracer: None,
                tracing_since_ns: None,
            }),
            buffer: Once::new(),
        }
    }

    /// Process that opened the device.
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// Acquire the session lock.
    pub fn lock(&self) -> SessionGuard<'_> {
        self.inner.lock()
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn tracer(&self) -> Option<ThreadId> {
        self.inner.lock().tracer
    }

    /// The trace buffer, once configured.
    pub fn buffer(&self) -> Option<&Arc<TraceBuffer>> {
        self.buffer.get()
    }

    pub fn has_buffer(&self) -> bool {
        self.buffer.is_completed()
    }

    /// Allocate the trace buffer. The caller holds the session lock.
    ///
    /// A configured buffer is never replaced: a second request is `Busy`.
    pub(crate) fn allocate_buffer(
        &self,
        _guard: &SessionGuard<'_>,
        size: usize,
    ) -> KcovResult<&Arc<TraceBuffer>> {
        if self.has_buffer() {
            return Err(Error::Busy);
        }
        self.buffer
            .try_call_once(|| TraceBuffer::allocate(size).map(Arc::new))
            .map_err(Error::from)
    }

    /// Diagnostic snapshot.
    pub fn info(&self) -> SessionInfo {
        let inner = self.inner.lock();
        let buffer = self.buffer.get();
        SessionInfo {
            pid: self.pid,
            state: inner.state,
            buffer_size: buffer.map(|b| b.len()),
            tracer: inner.tracer,
            recorded: buffer.map_or(0, |b| b.count()),
            tracing_since_ns: inner.tracing_since_ns,
        }
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub pid: ProcessId,
    pub state: SessionState,
    /// Page-rounded buffer size, if configured.
    pub buffer_size: Option<usize>,
    pub tracer: Option<ThreadId>,
    /// PCs currently held in the log.
    pub recorded: usize,
    /// When the current tracer was enabled.
    pub tracing_since_ns: Option<u64>,
}
