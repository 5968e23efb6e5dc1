//! Send queue counters
//!
//! Lock-free counters updated on the hot path and read as a snapshot by
//! diagnostics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Running totals for one send queue
#[derive(Debug, Default)]
pub struct DispatchStats {
    /// Items accepted by enqueue
    enqueued: AtomicU64,
    /// Enqueues refused (unreachable destination, shutdown, unknown class)
    rejected: AtomicU64,
    /// Items handed to a send worker
    dispatched: AtomicU64,
    /// Finalize callbacks invoked
    finalized: AtomicU64,
    /// Items completed with ConnectionAborted
    aborted: AtomicU64,
    /// Items completed with Unreachable
    unreachable: AtomicU64,
    /// Sends that returned a transport error
    send_errors: AtomicU64,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_finalized(&self) {
        self.finalized.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_aborted(&self) {
        self.aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unreachable(&self) {
        self.unreachable.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current counter values
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            finalized: self.finalized.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            unreachable: self.unreachable.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`DispatchStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub enqueued: u64,
    pub rejected: u64,
    pub dispatched: u64,
    pub finalized: u64,
    pub aborted: u64,
    pub unreachable: u64,
    pub send_errors: u64,
}

impl StatsSnapshot {
    /// Items accepted but not yet finalized
    ///
    /// Detached rejections are finalized without being enqueued, so the
    /// difference saturates at zero.
    pub const fn outstanding(&self) -> u64 {
        self.enqueued.saturating_sub(self.finalized)
    }
}

/// Queue occupancy of one class at one destination
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassDepth {
    /// Items waiting for window capacity
    pub backlog: usize,
    /// Items admitted and not yet completed
    pub inflight: usize,
}

/// Queue occupancy of one destination
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDepths {
    /// Indexed by class id
    pub classes: Vec<ClassDepth>,
    /// Items in the ready queue
    pub ready: usize,
    /// A send to this destination is outstanding
    pub sending: bool,
}
