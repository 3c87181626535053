//! Platform abstraction layer for kernel operations.
//!
//! This module provides an abstraction over the host kernel (monotonic time,
//! identity of the currently running task) so the device can be tested in
//! user space.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::Once;

/// Identity of a process as seen by the host kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u64);

/// Identity of a thread as seen by the host kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {}", self.0)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid {}", self.0)
    }
}

/// A thread together with the process that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Task {
    pub pid: ProcessId,
    pub tid: ThreadId,
}

impl Task {
    pub const fn new(pid: u64, tid: u64) -> Self {
        Self {
            pid: ProcessId(pid),
            tid: ThreadId(tid),
        }
    }
}

/// Platform operations trait.
///
/// Abstracts over kernel-specific operations to enable mock testing.
pub trait PlatformOps {
    /// Whether `current_task` can name tasks without a registered hook.
    const HAS_TASK_SOURCE: bool;

    /// Get current monotonic time in nanoseconds.
    fn time_ns() -> u64;

    /// Get the task currently running on this CPU, if any.
    fn current_task() -> Option<Task>;
}

// =============================================================================
// Real Implementation (kernel environment with axhal)
// =============================================================================

/// Real platform operations using axhal.
#[cfg(all(not(test), feature = "axhal"))]
pub struct RealPlatform;

#[cfg(all(not(test), feature = "axhal"))]
impl PlatformOps for RealPlatform {
    const HAS_TASK_SOURCE: bool = false;

    fn time_ns() -> u64 {
        axhal::time::monotonic_time().as_nanos() as u64
    }

    fn current_task() -> Option<Task> {
        // Task identity is owned by the scheduler, which registers a hook.
        None
    }
}

// =============================================================================
// Mock Implementation (test environment or no axhal)
// =============================================================================

/// Mock time value for testing.
static MOCK_TIME_NS: AtomicU64 = AtomicU64::new(1_000_000_000); // 1 second

/// Mock current process; 0 means "no task".
static MOCK_PID: AtomicU64 = AtomicU64::new(0);

/// Mock current thread.
static MOCK_TID: AtomicU64 = AtomicU64::new(0);

/// Mock platform operations for testing.
#[cfg(any(test, not(feature = "axhal")))]
pub struct MockPlatform;

#[cfg(any(test, not(feature = "axhal")))]
impl PlatformOps for MockPlatform {
    const HAS_TASK_SOURCE: bool = true;

    fn time_ns() -> u64 {
        MOCK_TIME_NS.load(Ordering::Relaxed)
    }

    fn current_task() -> Option<Task> {
        match MOCK_PID.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(Task::new(pid, MOCK_TID.load(Ordering::SeqCst))),
        }
    }
}

/// Set mock time for testing.
pub fn set_mock_time(ns: u64) {
    MOCK_TIME_NS.store(ns, Ordering::Relaxed);
}

/// Advance mock time by given nanoseconds.
pub fn advance_mock_time(ns: u64) {
    MOCK_TIME_NS.fetch_add(ns, Ordering::Relaxed);
}

/// Set the mock current task for testing. A pid of 0 clears it.
pub fn set_mock_task(task: Task) {
    MOCK_TID.store(task.tid.0, Ordering::SeqCst);
    MOCK_PID.store(task.pid.0, Ordering::SeqCst);
}

/// Clear the mock current task.
pub fn clear_mock_task() {
    MOCK_PID.store(0, Ordering::SeqCst);
    MOCK_TID.store(0, Ordering::SeqCst);
}

// =============================================================================
// Platform Type Alias
// =============================================================================

/// The active platform implementation.
///
/// In kernel environment with axhal: RealPlatform (uses axhal)
/// In test environment or without axhal: MockPlatform (uses atomic counters)
#[cfg(all(not(test), feature = "axhal"))]
pub type Platform = RealPlatform;

#[cfg(any(test, not(feature = "axhal")))]
pub type Platform = MockPlatform;

// =============================================================================
// Current Task Hook
// =============================================================================

/// Scheduler-provided lookup of the running task.
static CURRENT_TASK_HOOK: Once<fn() -> Option<Task>> = Once::new();

/// Set once a lifecycle hook has complained about a missing task source.
static NO_TASK_SOURCE_WARNED: AtomicBool = AtomicBool::new(false);

/// Register the host's "who is running" lookup.
///
/// Only the first registration takes effect.
pub fn register_current_task_hook(hook: fn() -> Option<Task>) {
    CURRENT_TASK_HOOK.call_once(|| hook);
}

/// Whether anything can tell the device which task is running.
pub fn has_task_source() -> bool {
    CURRENT_TASK_HOOK.get().is_some() || Platform::HAS_TASK_SOURCE
}

/// Warn, once, that `hook` ran without a way to name the current task.
///
/// Without a task source the lifecycle hooks cannot find the exiting
/// thread or process, so sessions would outlive them silently.
pub(crate) fn warn_no_task_source(hook: &str) {
    if !has_task_source() {
        warn_once(&NO_TASK_SOURCE_WARNED, hook);
    }
}

fn warn_once(flag: &AtomicBool, hook: &str) -> bool {
    if flag.swap(true, Ordering::Relaxed) {
        return false;
    }
    warn!(
        "kcov: {} hook ran with no current-task source; call register_current_task_hook() at boot",
        hook
    );
    true
}

// =============================================================================
// Convenience Functions
// =============================================================================

/// Get current time in nanoseconds.
#[inline]
pub fn time_ns() -> u64 {
    Platform::time_ns()
}

/// Get the currently running task.
///
/// Prefers the registered host hook and falls back to the platform
/// implementation.
pub fn current_task() -> Option<Task> {
    match CURRENT_TASK_HOOK.get() {
        Some(hook) => hook(),
        None => Platform::current_task(),
    }
}

// =============================================================================
// Tests
// =============================================================================
