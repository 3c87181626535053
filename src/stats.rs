//! Device-wide counters.
//!
//! Lock-free so they can be bumped from the edge-recording path.

use core::sync::atomic::{AtomicU64, Ordering};

/// Counters for one KCOV device.
#[derive(Debug)]
pub struct DeviceStats {
    opens: AtomicU64,
    releases: AtomicU64,
    buffers: AtomicU64,
    enables: AtomicU64,
    disables: AtomicU64,
    tracer_exits: AtomicU64,
    recorded_pcs: AtomicU64,
    dropped_pcs: AtomicU64,
    rejected: AtomicU64,
}

impl DeviceStats {
    /// Create a zeroed stats instance.
    pub const fn new() -> Self {
        Self {
            opens: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            buffers: AtomicU64::new(0),
            enables: AtomicU64::new(0),
            disables: AtomicU64::new(0),
            tracer_exits: AtomicU64::new(0),
            recorded_pcs: AtomicU64::new(0),
            dropped_pcs: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn record_open(&self) {
        self.opens.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_buffer(&self) {
        self.buffers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_enable(&self) {
        self.enables.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disable(&self) {
        self.disables.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tracer_exit(&self) {
        self.tracer_exits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of one PC append.
    pub fn record_pc(&self, stored: bool) {
        if stored {
            self.recorded_pcs.fetch_add(1, Ordering::Relaxed);
        } else {
            self.dropped_pcs.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current statistics snapshot.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            opens: self.opens.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            buffers: self.buffers.load(Ordering::Relaxed),
            enables: self.enables.load(Ordering::Relaxed),
            disables: self.disables.load(Ordering::Relaxed),
            tracer_exits: self.tracer_exits.load(Ordering::Relaxed),
            recorded_pcs: self.recorded_pcs.load(Ordering::Relaxed),
            dropped_pcs: self.dropped_pcs.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Reset statistics.
    pub fn reset(&self) {
        for counter in [
            &self.opens,
            &self.releases,
            &self.buffers,
            &self.enables,
            &self.disables,
            &self.tracer_exits,
            &self.recorded_pcs,
            &self.dropped_pcs,
            &self.rejected,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for DeviceStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable snapshot of device statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Successful `open` calls.
    pub opens: u64,
    /// Sessions destroyed by process teardown.
    pub releases: u64,
    /// Trace buffers allocated.
    pub buffers: u64,
    /// Successful `KCOV_ENABLE` requests.
    pub enables: u64,
    /// Successful `KCOV_DISABLE` requests.
    pub disables: u64,
    /// Tracers stopped by thread teardown.
    pub tracer_exits: u64,
    /// PCs appended to a log.
    pub recorded_pcs: u64,
    /// PCs lost to a full log.
    pub dropped_pcs: u64,
    /// Requests that failed validation.
    pub rejected: u64,
}

impl StatsSnapshot {
    /// Sessions currently alive according to the counters.
    pub fn live_sessions(&self) -> u64 {
        self.opens.saturating_sub(self.releases)
    }
}
