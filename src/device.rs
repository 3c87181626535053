//! The KCOV character device.
//!
//! Entry points called by the file layer (`open`, `control`/`ioctl`, `map`)
//! and by the task lifecycle (`free_thread`, `free_process`).
//!
//! # Locking
//!
//! The registry lock and the per-session locks are only ever nested as
//! session -> registry. Paths that start from a registry lookup clone the
//! session handle, drop the registry lock, take the session lock and then
//! re-validate against the registry.
//!
//! The recording path (`trace_pc`, reached from every coverage callback) takes
//! neither lock. It only reads the [`TracerTable`], which enable publishes
//! the buffer into and disable or thread exit withdraws it from, both under
//! the session lock. Instrumented code running while a lock is held can
//! therefore record without spinning on it.
//!
//! # Example
//!
//! ```ignore
//! use axkcov::{KcovDevice, Task};
//! use axkcov::ioctl::{KCOV_ENABLE, KCOV_SETBUFSIZE};
//! use axkcov::mmap::Protection;
//!
//! let dev = KcovDevice::global();
//! let task = Task::new(5, 50);
//!
//! let file = dev.open(task.pid)?;
//! dev.control(task, KCOV_SETBUFSIZE, 4096)?;
//! let region = dev.map(file.pid(), 0, Protection::READ_WRITE, true)?;
//! dev.control(task, KCOV_ENABLE, 0)?;
//! ```

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::{Mutex, Once};

use crate::buffer::PAGE_SIZE;
use crate::error::{Error, KcovResult, to_syscall_ret};
use crate::ioctl::ControlRequest;
use crate::mmap::{MappedRegion, Protection};
use crate::platform::{self, ProcessId, Task, ThreadId};
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionGuard, SessionInfo, SessionState};
use crate::stats::{DeviceStats, StatsSnapshot};
use crate::tracer::TracerTable;

/// The device instance used by the kernel.
static DEVICE: Once<KcovDevice> = Once::new();

/// Handle returned by a successful `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KcovFile {
    pid: ProcessId,
}

impl KcovFile {
    /// Process that opened the device.
    pub fn pid(&self) -> ProcessId {
        self.pid
    }
}

/// KCOV coverage tracing device.
#[derive(Debug)]
pub struct KcovDevice {
    registry: Mutex<SessionRegistry>,
    tracers: TracerTable,
    stats: DeviceStats,
}

impl KcovDevice {
    /// Name the device is registered under.
    pub const DEVICE_NAME: &'static str = "kcov";
    /// Device major number.
    pub const MAJOR: u32 = 30;
    /// Device minor number.
    pub const MINOR: u32 = 0;

    /// Create a device with empty registries.
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(SessionRegistry::new()),
            tracers: TracerTable::new(),
            stats: DeviceStats::new(),
        }
    }

    /// Create the kernel-wide device. Idempotent.
    pub fn init_global() -> &'static Self {
        DEVICE.call_once(|| {
            info!(
                "kcov: device '{}' created ({}:{})",
                Self::DEVICE_NAME,
                Self::MAJOR,
                Self::MINOR
            );
            Self::new()
        })
    }

    /// Get the kernel-wide device.
    ///
    /// Panics if `axkcov::init()` has not run.
    pub fn global() -> &'static Self {
        match DEVICE.get() {
            Some(dev) => dev,
            None => panic!("KcovDevice::global() called before init()"),
        }
    }

    /// Try to get the kernel-wide device.
    pub fn try_global() -> Option<&'static Self> {
        DEVICE.get()
    }

    pub fn device_name(&self) -> &'static str {
        Self::DEVICE_NAME
    }

    fn reject<T>(&self, op: &str, who: impl core::fmt::Display, e: Error) -> KcovResult<T> {
        self.stats.record_rejected();
        match e {
            Error::InvalidArgument => warn!("kcov: {} by {} rejected: {}", op, who, e),
            _ => debug!("kcov: {} by {} rejected: {}", op, who, e),
        }
        Err(e)
    }

    // =========================================================================
    // File Operations
    // =========================================================================

    /// Open the device for `pid`, creating its session.
    ///
    /// Fails with `Busy` if `pid` already holds a session.
    pub fn open(&self, pid: ProcessId) -> KcovResult<KcovFile> {
        let created = self.registry.lock().create(pid);
        match created {
            Ok(_) => {
                self.stats.record_open();
                info!("kcov: {} opened /dev/{}", pid, Self::DEVICE_NAME);
                Ok(KcovFile { pid })
            }
            Err(e) => self.reject("open", pid, e),
        }
    }

    /// Handle a control request from `task`.
    ///
    /// The session is found through the calling thread's process, and the
    /// request runs with the session lock held.
    pub fn control(&self, task: Task, request: u32, arg: usize) -> KcovResult {
        let decoded = ControlRequest::decode(request, arg);
        let op = decoded.as_ref().map_or("ioctl", ControlRequest::label);

        let Some(session) = self.registry.lock().session_of(task.pid) else {
            return self.reject(op, task.tid, Error::NoSuchDevice);
        };

        let mut guard = session.lock();
        // Lost a race with process teardown.
        if guard.state() == SessionState::Unused {
            return self.reject(op, task.tid, Error::NoSuchDevice);
        }

        let result = match decoded {
            Ok(ControlRequest::SetBufferSize(size)) => {
                self.set_buffer_size(&session, &guard, size)
            }
            Ok(ControlRequest::Enable) => self.enable(task.tid, &session, &mut guard),
            Ok(ControlRequest::Disable) => self.disable(task.tid, &session, &mut guard),
            Err(e) => Err(e),
        };
        drop(guard);

        match result {
            Ok(()) => Ok(()),
            Err(e) => self.reject(op, task.tid, e),
        }
    }

    /// `control` with the syscall return convention.
    pub fn ioctl(&self, task: Task, request: u32, arg: usize) -> isize {
        to_syscall_ret(self.control(task, request, arg))
    }

    fn set_buffer_size(
        &self,
        session: &Arc<Session>,
        guard: &SessionGuard<'_>,
        size: usize,
    ) -> KcovResult {
        if guard.state() >= SessionState::Tracing {
            return Err(Error::Busy);
        }
        let buffer = session.allocate_buffer(guard, size)?;
        self.stats.record_buffer();
        debug!(
            "kcov: {} configured {} byte buffer ({} PCs)",
            session.pid(),
            buffer.len(),
            buffer.capacity()
        );
        Ok(())
    }

    fn enable(
        &self,
        tid: ThreadId,
        session: &Arc<Session>,
        guard: &mut SessionGuard<'_>,
    ) -> KcovResult {
        if guard.state() >= SessionState::Tracing {
            return Err(Error::Busy);
        }
        let Some(buffer) = session.buffer() else {
            return Err(Error::NoBuffer);
        };
        kcov_verify!(
            guard.state() == SessionState::Opened,
            "kcov: {} enabling session of {} in state {}",
            tid,
            session.pid(),
            guard.state().label()
        );

        self.tracers.claim(tid, buffer)?;
        self.registry.lock().register_tracer(tid, session);
        guard.begin_tracing(tid, platform::time_ns());
        self.stats.record_enable();
        debug!("kcov: {} now tracing for {}", tid, session.pid());
        Ok(())
    }

    fn disable(
        &self,
        tid: ThreadId,
        session: &Arc<Session>,
        guard: &mut SessionGuard<'_>,
    ) -> KcovResult {
        let mut registry = self.registry.lock();
        match registry.traced_by(tid) {
            None => return Err(Error::NoSuchEntry),
            Some(traced) => kcov_verify!(
                Arc::ptr_eq(&traced, session),
                "kcov: {} traces a session of {}, not of {}",
                tid,
                traced.pid(),
                session.pid()
            ),
        }
        kcov_verify!(
            guard.state() == SessionState::Tracing,
            "kcov: {} disabling session of {} in state {}",
            tid,
            session.pid(),
            guard.state().label()
        );

        registry.unregister_tracer(tid, session);
        drop(registry);
        self.tracers.release(tid);
        guard.end_tracing();
        self.stats.record_disable();
        debug!("kcov: {} stopped tracing for {}", tid, session.pid());
        Ok(())
    }

    /// Map the session buffer of `pid` at `offset`.
    ///
    /// Only reachable after `open`, so a missing session is fatal.
    pub fn map(
        &self,
        pid: ProcessId,
        offset: u64,
        protection: Protection,
        shared: bool,
    ) -> KcovResult<MappedRegion> {
        let Some(session) = self.registry.lock().session_of(pid) else {
            kcov_fatal!("kcov: mmap by {} without an open session", pid);
        };
        let Some(buffer) = session.buffer() else {
            return self.reject("mmap", pid, Error::NoBuffer);
        };
        if offset % PAGE_SIZE as u64 != 0 || offset >= buffer.len() as u64 {
            return self.reject("mmap", pid, Error::InvalidOffset(offset));
        }

        let region = MappedRegion::new(pid, buffer, offset as usize, protection, shared);
        debug!(
            "kcov: {} mapped {} bytes at offset {:#x} (prot={:#x}, shared={})",
            pid,
            region.len(),
            offset,
            protection.bits(),
            shared
        );
        Ok(region)
    }

    // =========================================================================
    // Lifecycle Hooks
    // =========================================================================

    /// Thread teardown: stop tracing if `tid` is an active tracer.
    pub fn free_thread(&self, tid: ThreadId) {
        let Some(session) = self.registry.lock().traced_by(tid) else {
            return;
        };

        let mut guard = session.lock();
        // Lost a race with an explicit disable.
        if !self.registry.lock().unregister_tracer(tid, &session) {
            return;
        }
        kcov_verify!(
            guard.state() == SessionState::Tracing,
            "kcov: exiting tracer {} left session of {} in state {}",
            tid,
            session.pid(),
            guard.state().label()
        );
        self.tracers.release(tid);
        guard.end_tracing();
        self.stats.record_tracer_exit();
        debug!("kcov: tracer {} of {} exited", tid, session.pid());
    }

    /// Process teardown: destroy the session of `pid`, if any.
    pub fn free_process(&self, pid: ProcessId) {
        let Some(session) = self.registry.lock().session_of(pid) else {
            return;
        };

        let mut guard = session.lock();
        if guard.state() == SessionState::Unused {
            return;
        }
        kcov_verify!(
            guard.state() == SessionState::Opened,
            "kcov: {} exiting with session in state {}",
            pid,
            guard.state().label()
        );

        let Some(owned) = self.registry.lock().remove_session(&session) else {
            return;
        };
        guard.retire();
        drop(guard);
        drop(owned);

        self.stats.record_release();
        info!("kcov: {} released its session", pid);
    }

    // =========================================================================
    // Edge Recording
    // =========================================================================

    /// Append `pc` to the log of the session `tid` is tracing.
    ///
    /// Returns false if `tid` is not tracing or the log is full. Lock free:
    /// safe to call from code that runs under the device's own locks.
    pub fn trace_pc(&self, tid: ThreadId, pc: u64) -> bool {
        let Some(stored) = self.tracers.with_buffer(tid, |buffer| buffer.record_pc(pc)) else {
            return false;
        };
        self.stats.record_pc(stored);
        stored
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Snapshot of every live session, sorted by pid.
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.registry.lock().sessions();
        sessions.iter().map(|s| s.info()).collect()
    }

    pub fn session_count(&self) -> usize {
        self.registry.lock().session_count()
    }

    pub fn tracer_count(&self) -> usize {
        self.registry.lock().tracer_count()
    }

    /// State of the session owned by `pid`.
    pub fn state_of(&self, pid: ProcessId) -> Option<SessionState> {
        let session = self.registry.lock().session_of(pid)?;
        Some(session.state())
    }

    /// Active tracer of the session owned by `pid`.
    pub fn tracer_of(&self, pid: ProcessId) -> Option<ThreadId> {
        let session = self.registry.lock().session_of(pid)?;
        session.tracer()
    }

    /// Whether `tid` is an active tracer.
    pub fn is_tracing(&self, tid: ThreadId) -> bool {
        self.registry.lock().is_tracing(tid)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }
}

impl Default for KcovDevice {
    fn default() -> Self {
        Self::new()
    }
}
