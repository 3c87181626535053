//! AxVisor KCOV Coverage Device
//!
//! A `/dev/kcov`-style driver that lets a user process collect the kernel
//! code coverage of one of its threads. The process opens the device,
//! sizes a trace buffer, maps it into its address space and then enables
//! tracing for a thread; the compiler-inserted callbacks append PCs to the
//! buffer, which user space reads without further syscalls.
//!
//! # Quick Start
//!
//! ```ignore
//! use axkcov::ioctl::{KCOV_DISABLE, KCOV_ENABLE, KCOV_SETBUFSIZE};
//! use axkcov::mmap::Protection;
//! use axkcov::Task;
//!
//! // Initialize the device (call once during boot)
//! let dev = axkcov::init();
//!
//! // Wire up the scheduler so the lifecycle hooks know who is running
//! axkcov::platform::register_current_task_hook(my_current_task);
//!
//! // What a user process does through open/ioctl/mmap
//! let task = Task::new(5, 50);
//! let file = dev.open(task.pid).unwrap();
//! dev.control(task, KCOV_SETBUFSIZE, 64 * 1024).unwrap();
//! let log = dev.map(file.pid(), 0, Protection::READ_WRITE, true).unwrap();
//! dev.control(task, KCOV_ENABLE, 0).unwrap();
//! // ... syscalls ...
//! dev.control(task, KCOV_DISABLE, 0).unwrap();
//! let pcs = log.pcs().unwrap();
//!
//! // From the task exit paths
//! axkcov::free_thread();
//! axkcov::free_process();
//! ```

#![no_std]

extern crate alloc;

#[macro_use]
extern crate log;

#[macro_use]
mod macros;

// =============================================================================
// Platform Abstraction (for testing support)
// =============================================================================

pub mod platform;

// =============================================================================
// Device Modules
// =============================================================================

pub mod buffer;
pub mod device;
pub mod error;
pub mod ioctl;
pub mod mmap;
pub mod registry;
pub mod session;
pub mod stats;
pub mod tracer;

// Re-export key types for convenience
pub use buffer::{BufferError, TraceBuffer};
pub use device::{KcovDevice, KcovFile};
pub use error::{Error, KcovResult};
pub use ioctl::ControlRequest;
pub use mmap::{MappedRegion, Protection};
pub use platform::{ProcessId, Task, ThreadId};
pub use session::{SessionInfo, SessionState};
pub use stats::StatsSnapshot;

// =============================================================================
// Initialization
// =============================================================================

/// Initialize the kcov device.
///
/// This should be called during kernel boot after the memory allocator is
/// ready. Calling it again returns the same device.
pub fn init() -> &'static KcovDevice {
    info!("Initializing axkcov...");
    info!(
        "  - buffer backend: {}",
        if cfg!(feature = "axalloc") {
            "axalloc pages"
        } else {
            "global allocator"
        }
    );
    let dev = KcovDevice::init_global();
    info!("axkcov initialization complete");
    dev
}

// =============================================================================
// Host Hooks
// =============================================================================

/// Thread exit hook.
///
/// Stops tracing if the exiting (current) thread is an active tracer.
/// No-op otherwise, or before `init()`.
pub fn free_thread() {
    let Some(dev) = KcovDevice::try_global() else {
        return;
    };
    match platform::current_task() {
        Some(task) => dev.free_thread(task.tid),
        None => platform::warn_no_task_source("free_thread"),
    }
}

/// Process exit hook.
///
/// Destroys the current process's session, if it has one. Every thread of
/// the process must have gone through [`free_thread`] first.
pub fn free_process() {
    let Some(dev) = KcovDevice::try_global() else {
        return;
    };
    match platform::current_task() {
        Some(task) => dev.free_process(task.pid),
        None => platform::warn_no_task_source("free_process"),
    }
}

/// Coverage callback entry: record `pc` for the current thread if it traces.
///
/// Takes no lock; see [`KcovDevice::trace_pc`].
#[inline]
pub fn record_pc(pc: u64) -> bool {
    match (KcovDevice::try_global(), platform::current_task()) {
        (Some(dev), Some(task)) => dev.trace_pc(task.tid, pc),
        _ => false,
    }
}
