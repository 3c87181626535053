//! Session registries.
//!
//! Two tables make sessions discoverable:
//!
//! - `by_process`: the session each process owns (at most one).
//! - `by_thread`: the session each thread is actively tracing.
//!
//! The registry is the sole owner of every live session. A `by_thread`
//! entry only ever points at a session that is also in `by_process`.
//! The registry itself is not synchronized; the device keeps it behind a
//! lock.

use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::HashMap;

use crate::error::{Error, KcovResult};
use crate::platform::{ProcessId, ThreadId};
use crate::session::Session;

/// Lookup tables for live sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    by_process: HashMap<ProcessId, Arc<Session>>,
    by_thread: HashMap<ThreadId, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            by_process: HashMap::new(),
            by_thread: HashMap::new(),
        }
    }

    /// Create a session for `pid`.
    ///
    /// Fails with `Busy` if the process already owns one.
    pub fn create(&mut self, pid: ProcessId) -> KcovResult<Arc<Session>> {
        if self.by_process.contains_key(&pid) {
            return Err(Error::Busy);
        }
        let session = Arc::new(Session::new(pid));
        self.by_process.insert(pid, session.clone());
        Ok(session)
    }

    /// Session owned by `pid`.
    pub fn session_of(&self, pid: ProcessId) -> Option<Arc<Session>> {
        self.by_process.get(&pid).cloned()
    }

    /// Session `tid` is actively tracing.
    pub fn traced_by(&self, tid: ThreadId) -> Option<Arc<Session>> {
        self.by_thread.get(&tid).cloned()
    }

    /// Remove `session` from `by_process`.
    ///
    /// Returns the registry's handle, or `None` if `pid` has since been
    /// bound to another session (or none).
    pub fn remove_session(&mut self, session: &Arc<Session>) -> Option<Arc<Session>> {
        let pid = session.pid();
        match self.by_process.get(&pid) {
            Some(current) if Arc::ptr_eq(current, session) => {}
            _ => return None,
        }
        kcov_verify!(
            !self.by_thread.values().any(|s| Arc::ptr_eq(s, session)),
            "kcov: removing {} while a thread still traces it",
            pid
        );
        self.by_process.remove(&pid)
    }

    /// Record `tid` as the active tracer of `session`.
    pub fn register_tracer(&mut self, tid: ThreadId, session: &Arc<Session>) {
        kcov_verify!(
            self.by_process
                .get(&session.pid())
                .is_some_and(|s| Arc::ptr_eq(s, session)),
            "kcov: {} enabling tracing on an unregistered session of {}",
            tid,
            session.pid()
        );
        let previous = self.by_thread.insert(tid, session.clone());
        kcov_verify!(
            previous.is_none(),
            "kcov: {} was already tracing a session",
            tid
        );
    }

    /// Drop `tid`'s tracer entry if it points at `session`.
    pub fn unregister_tracer(&mut self, tid: ThreadId, session: &Arc<Session>) -> bool {
        match self.by_thread.get(&tid) {
            Some(current) if Arc::ptr_eq(current, session) => {
                self.by_thread.remove(&tid);
                true
            }
            _ => false,
        }
    }

    /// Whether `tid` is tracing any session.
    pub fn is_tracing(&self, tid: ThreadId) -> bool {
        self.by_thread.contains_key(&tid)
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.by_process.len()
    }

    /// Number of active tracers.
    pub fn tracer_count(&self) -> usize {
        self.by_thread.len()
    }

    /// All live sessions, sorted by pid.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self.by_process.values().cloned().collect();
        sessions.sort_by_key(|s| s.pid());
        sessions
    }
}
