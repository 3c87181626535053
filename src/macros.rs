//! Internal invariant checks.

/// Report a broken cross-component invariant and halt the current context.
macro_rules! kcov_fatal {
    ($($arg:tt)+) => {{
        log::error!($($arg)+);
        panic!($($arg)+)
    }};
}

/// Check a cross-component invariant of the device.
///
/// A failure means a registry or the session state machine has been
/// corrupted by some other path. Continuing could leak tracing across
/// threads or let a freed buffer be written, so this logs the violation and
/// panics the current execution context.
///
/// ```ignore
/// kcov_verify!(state == SessionState::Opened, "kcov: {} enabling in {:?}", pid, state);
/// ```
macro_rules! kcov_verify {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            kcov_fatal!($($arg)+);
        }
    };
}
