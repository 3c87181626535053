//! Integration tests for the KCOV device.
//!
//! Tests open/ioctl/mmap dispatch, the session state machine and the
//! lifecycle hooks.

use axkcov::buffer::PAGE_SIZE;
use axkcov::ioctl::{KCOV_DISABLE, KCOV_ENABLE, KCOV_SETBUFSIZE};
use axkcov::{
    BufferError, Error, KcovDevice, Protection, ProcessId, SessionState, Task, ThreadId,
};

fn opened(task: Task) -> KcovDevice {
    let dev = KcovDevice::new();
    dev.open(task.pid).unwrap();
    dev
}

fn tracing(task: Task, size: usize) -> KcovDevice {
    let dev = opened(task);
    dev.control(task, KCOV_SETBUFSIZE, size).unwrap();
    dev.control(task, KCOV_ENABLE, 0).unwrap();
    dev
}

// =============================================================================
// Open Tests
// =============================================================================

#[test]
fn test_open_creates_opened_session() {
    let dev = KcovDevice::new();
    let file = dev.open(ProcessId(5)).unwrap();

    assert_eq!(file.pid(), ProcessId(5));
    assert_eq!(dev.state_of(ProcessId(5)), Some(SessionState::Opened));
    assert_eq!(dev.session_count(), 1);
}

#[test]
fn test_second_open_same_process_is_busy() {
    let dev = KcovDevice::new();
    dev.open(ProcessId(5)).unwrap();

    assert_eq!(dev.open(ProcessId(5)), Err(Error::Busy));
    assert_eq!(dev.session_count(), 1);
}

#[test]
fn test_open_different_processes() {
    let dev = KcovDevice::new();
    dev.open(ProcessId(1)).unwrap();
    dev.open(ProcessId(2)).unwrap();
    assert_eq!(dev.session_count(), 2);
}

#[test]
fn test_reopen_after_process_exit() {
    let dev = KcovDevice::new();
    dev.open(ProcessId(5)).unwrap();
    dev.free_process(ProcessId(5));

    assert!(dev.open(ProcessId(5)).is_ok());
    assert_eq!(dev.state_of(ProcessId(5)), Some(SessionState::Opened));
}

// =============================================================================
// SetBufferSize Tests
// =============================================================================

#[test]
fn test_set_buffer_size() {
    let task = Task::new(1, 10);
    let dev = opened(task);

    assert_eq!(dev.control(task, KCOV_SETBUFSIZE, 4096), Ok(()));
    let info = &dev.list_sessions()[0];
    assert_eq!(info.buffer_size, Some(4096));
    assert_eq!(info.state, SessionState::Opened);
}

#[test]
fn test_set_buffer_size_twice_is_busy() {
    let task = Task::new(1, 10);
    let dev = opened(task);

    dev.control(task, KCOV_SETBUFSIZE, 4096).unwrap();
    assert_eq!(dev.control(task, KCOV_SETBUFSIZE, 8192), Err(Error::Busy));
    assert_eq!(dev.list_sessions()[0].buffer_size, Some(4096));
}

#[test]
fn test_set_buffer_size_while_tracing_is_busy() {
    let task = Task::new(1, 10);
    let dev = tracing(task, 4096);
    assert_eq!(dev.control(task, KCOV_SETBUFSIZE, 4096), Err(Error::Busy));
}

#[test]
fn test_set_buffer_size_invalid() {
    let task = Task::new(1, 10);
    let dev = opened(task);

    assert_eq!(
        dev.control(task, KCOV_SETBUFSIZE, 0),
        Err(Error::Allocation(BufferError::InvalidSize(0)))
    );
    let huge = axkcov::buffer::KCOV_MAX_BUFFER_SIZE + 1;
    assert_eq!(
        dev.control(task, KCOV_SETBUFSIZE, huge),
        Err(Error::Allocation(BufferError::InvalidSize(huge)))
    );

    // No partial state: still Opened, still no buffer, and a valid size works.
    assert_eq!(dev.list_sessions()[0].buffer_size, None);
    assert_eq!(dev.control(task, KCOV_ENABLE, 0), Err(Error::NoBuffer));
    assert_eq!(dev.control(task, KCOV_SETBUFSIZE, 4096), Ok(()));
}

#[test]
fn test_buffer_size_is_page_rounded() {
    let task = Task::new(1, 10);
    let dev = opened(task);
    dev.control(task, KCOV_SETBUFSIZE, 100).unwrap();
    assert_eq!(dev.list_sessions()[0].buffer_size, Some(PAGE_SIZE));
}

// =============================================================================
// Enable / Disable Tests
// =============================================================================

#[test]
fn test_enable_without_buffer_is_no_buffer() {
    let task = Task::new(1, 10);
    let dev = opened(task);

    assert_eq!(dev.control(task, KCOV_ENABLE, 0), Err(Error::NoBuffer));
    assert_eq!(dev.state_of(task.pid), Some(SessionState::Opened));
    assert!(!dev.is_tracing(task.tid));
}

#[test]
fn test_enable_registers_tracer() {
    let task = Task::new(1, 10);
    let dev = tracing(task, 4096);

    assert_eq!(dev.state_of(task.pid), Some(SessionState::Tracing));
    assert_eq!(dev.tracer_of(task.pid), Some(task.tid));
    assert!(dev.is_tracing(task.tid));
    assert_eq!(dev.tracer_count(), 1);
}

#[test]
fn test_enable_twice_is_busy() {
    let task = Task::new(1, 10);
    let dev = tracing(task, 4096);

    assert_eq!(dev.control(task, KCOV_ENABLE, 0), Err(Error::Busy));
    assert_eq!(dev.tracer_count(), 1);
}

#[test]
fn test_enable_from_sibling_thread_while_tracing_is_busy() {
    let task = Task::new(1, 10);
    let sibling = Task::new(1, 11);
    let dev = tracing(task, 4096);

    assert_eq!(dev.control(sibling, KCOV_ENABLE, 0), Err(Error::Busy));
    assert_eq!(dev.tracer_of(task.pid), Some(task.tid));
}

#[test]
fn test_disable_returns_to_opened() {
    let task = Task::new(1, 10);
    let dev = tracing(task, 4096);

    assert_eq!(dev.control(task, KCOV_DISABLE, 0), Ok(()));
    assert_eq!(dev.state_of(task.pid), Some(SessionState::Opened));
    assert_eq!(dev.tracer_of(task.pid), None);
    assert_eq!(dev.tracer_count(), 0);
}

#[test]
fn test_disable_by_non_tracer_is_no_such_entry() {
    let task = Task::new(1, 10);
    let dev = opened(task);
    assert_eq!(dev.control(task, KCOV_DISABLE, 0), Err(Error::NoSuchEntry));

    // A sibling of the active tracer is not the tracer either.
    dev.control(task, KCOV_SETBUFSIZE, 4096).unwrap();
    dev.control(task, KCOV_ENABLE, 0).unwrap();
    let sibling = Task::new(1, 11);
    assert_eq!(dev.control(sibling, KCOV_DISABLE, 0), Err(Error::NoSuchEntry));
    assert_eq!(dev.state_of(task.pid), Some(SessionState::Tracing));
}

#[test]
fn test_reenable_after_disable_other_thread() {
    let first = Task::new(1, 10);
    let second = Task::new(1, 11);
    let dev = tracing(first, 4096);

    dev.control(first, KCOV_DISABLE, 0).unwrap();
    dev.control(second, KCOV_ENABLE, 0).unwrap();

    assert_eq!(dev.tracer_of(first.pid), Some(second.tid));
    assert!(!dev.is_tracing(first.tid));
}

#[test]
fn test_unknown_request_is_invalid_argument() {
    let task = Task::new(1, 10);
    let dev = opened(task);
    assert_eq!(dev.control(task, 0xffff_ffff, 0), Err(Error::InvalidArgument));
}

#[test]
fn test_control_without_open_is_no_such_device() {
    let dev = KcovDevice::new();
    let task = Task::new(9, 90);
    assert_eq!(dev.control(task, KCOV_SETBUFSIZE, 4096), Err(Error::NoSuchDevice));
    assert_eq!(dev.control(task, KCOV_DISABLE, 0), Err(Error::NoSuchDevice));
}

#[test]
fn test_ioctl_returns_negated_errno() {
    let task = Task::new(1, 10);
    let dev = opened(task);

    assert_eq!(dev.ioctl(task, KCOV_SETBUFSIZE, 4096), 0);
    let ret = dev.ioctl(task, KCOV_SETBUFSIZE, 4096);
    assert_eq!(ret, -(Error::Busy.errno().code() as isize));
}

// =============================================================================
// Map Tests
// =============================================================================

#[test]
fn test_map_before_buffer_is_no_buffer() {
    let task = Task::new(1, 10);
    let dev = opened(task);
    assert_eq!(
        dev.map(task.pid, 0, Protection::READ_WRITE, true).unwrap_err(),
        Error::NoBuffer
    );
}

#[test]
fn test_map_size_matches_buffer() {
    let task = Task::new(1, 10);
    let dev = opened(task);
    dev.control(task, KCOV_SETBUFSIZE, 4096).unwrap();
    dev.control(task, KCOV_ENABLE, 0).unwrap();

    let region = dev.map(task.pid, 0, Protection::READ_WRITE, true).unwrap();
    assert_eq!(region.len(), 4096);
    assert_eq!(region.offset(), 0);
    assert_eq!(region.pid(), task.pid);
    assert!(region.is_shared());
    assert_eq!(region.protection(), Protection::READ_WRITE);
}

#[test]
fn test_map_with_offset() {
    let task = Task::new(1, 10);
    let dev = opened(task);
    dev.control(task, KCOV_SETBUFSIZE, 4 * PAGE_SIZE).unwrap();

    let region = dev
        .map(task.pid, PAGE_SIZE as u64, Protection::READ, false)
        .unwrap();
    assert_eq!(region.len(), 3 * PAGE_SIZE);
    assert!(region.pcs().is_none());
}

#[test]
fn test_map_bad_offset() {
    let task = Task::new(1, 10);
    let dev = opened(task);
    dev.control(task, KCOV_SETBUFSIZE, 4096).unwrap();

    assert_eq!(
        dev.map(task.pid, 12, Protection::READ, true).unwrap_err(),
        Error::InvalidOffset(12)
    );
    assert_eq!(
        dev.map(task.pid, 4096, Protection::READ, true).unwrap_err(),
        Error::InvalidOffset(4096)
    );
}

#[test]
#[should_panic]
fn test_map_without_session_is_fatal() {
    let dev = KcovDevice::new();
    let _ = dev.map(ProcessId(77), 0, Protection::READ, true);
}

#[test]
fn test_mapped_log_sees_recorded_pcs() {
    let task = Task::new(1, 10);
    let dev = tracing(task, 4096);
    let region = dev.map(task.pid, 0, Protection::READ_WRITE, true).unwrap();

    assert!(dev.trace_pc(task.tid, 0xffff_0000_0000_1000));
    assert!(dev.trace_pc(task.tid, 0xffff_0000_0000_2000));

    assert_eq!(region.read_word(0), Some(2));
    assert_eq!(
        region.pcs().unwrap(),
        vec![0xffff_0000_0000_1000, 0xffff_0000_0000_2000]
    );

    assert!(region.reset());
    assert_eq!(region.pcs().unwrap(), Vec::<u64>::new());
}

#[test]
fn test_trace_pc_ignores_non_tracers() {
    let task = Task::new(1, 10);
    let dev = tracing(task, 4096);

    assert!(!dev.trace_pc(ThreadId(11), 0x1000));
    dev.control(task, KCOV_DISABLE, 0).unwrap();
    assert!(!dev.trace_pc(task.tid, 0x1000));
    assert_eq!(dev.list_sessions()[0].recorded, 0);
}

#[test]
fn test_trace_pc_full_log_drops() {
    let task = Task::new(1, 10);
    let dev = tracing(task, 3 * 8);

    assert!(dev.trace_pc(task.tid, 1));
    assert!(dev.trace_pc(task.tid, 2));
    assert!(!dev.trace_pc(task.tid, 3));

    let stats = dev.stats();
    assert_eq!(stats.recorded_pcs, 2);
    assert_eq!(stats.dropped_pcs, 1);
}

// =============================================================================
// Lifecycle Hook Tests
// =============================================================================

#[test]
fn test_thread_exit_stops_tracing() {
    let task = Task::new(1, 10);
    let dev = tracing(task, 4096);

    dev.free_thread(task.tid);

    assert!(!dev.is_tracing(task.tid));
    assert_eq!(dev.state_of(task.pid), Some(SessionState::Opened));
    // Session survives thread exit.
    assert_eq!(dev.session_count(), 1);
    assert_eq!(dev.control(task, KCOV_DISABLE, 0), Err(Error::NoSuchEntry));
}

#[test]
fn test_thread_exit_of_non_tracer_is_noop() {
    let task = Task::new(1, 10);
    let dev = tracing(task, 4096);

    dev.free_thread(ThreadId(11));
    dev.free_thread(ThreadId(999));

    assert_eq!(dev.tracer_of(task.pid), Some(task.tid));
}

#[test]
fn test_process_exit_destroys_session() {
    let task = Task::new(1, 10);
    let dev = tracing(task, 4096);
    let region = dev.map(task.pid, 0, Protection::READ_WRITE, true).unwrap();

    dev.free_thread(task.tid);
    dev.free_process(task.pid);

    assert_eq!(dev.session_count(), 0);
    assert_eq!(dev.state_of(task.pid), None);
    assert_eq!(dev.control(task, KCOV_ENABLE, 0), Err(Error::NoSuchDevice));

    // The mapping never kept the buffer alive.
    assert!(!region.is_live());
    assert_eq!(region.base_address(), None);
    assert_eq!(region.read_word(0), None);
}

#[test]
fn test_hooks_without_session_are_noops() {
    let dev = KcovDevice::new();
    dev.free_thread(ThreadId(1));
    dev.free_process(ProcessId(1));
    dev.free_process(ProcessId(1));

    let other = Task::new(2, 20);
    dev.open(other.pid).unwrap();
    dev.free_process(ProcessId(1));
    assert_eq!(dev.session_count(), 1);
}

#[test]
#[should_panic]
fn test_process_exit_while_tracing_is_fatal() {
    let task = Task::new(1, 10);
    let dev = tracing(task, 4096);
    dev.free_process(task.pid);
}

// =============================================================================
// Diagnostics Tests
// =============================================================================

#[test]
fn test_list_sessions_sorted() {
    let dev = KcovDevice::new();
    for pid in [30, 10, 20] {
        dev.open(ProcessId(pid)).unwrap();
    }
    let pids: Vec<_> = dev.list_sessions().iter().map(|s| s.pid.0).collect();
    assert_eq!(pids, vec![10, 20, 30]);
}

#[test]
fn test_stats_follow_lifecycle() {
    let task = Task::new(1, 10);
    let dev = tracing(task, 4096);
    dev.control(task, KCOV_DISABLE, 0).unwrap();
    dev.control(task, KCOV_ENABLE, 0).unwrap();
    dev.free_thread(task.tid);
    dev.free_process(task.pid);
    let _ = dev.open(ProcessId(2));
    let _ = dev.open(ProcessId(2));

    let stats = dev.stats();
    assert_eq!(stats.opens, 2);
    assert_eq!(stats.releases, 1);
    assert_eq!(stats.buffers, 1);
    assert_eq!(stats.enables, 2);
    assert_eq!(stats.disables, 1);
    assert_eq!(stats.tracer_exits, 1);
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.live_sessions(), 1);

    dev.reset_stats();
    assert_eq!(dev.stats().opens, 0);
}
