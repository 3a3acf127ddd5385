//! Reasons, statistics and cycle summaries for the suspension protocol.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Why the world is being stopped. Carried on the active cycle and in
/// every log line the protocol emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendReason {
    /// A garbage collection pass.
    Gc,
    /// Preparation work before a collection (heap verification, card
    /// table reset).
    GcPrep,
    /// Debugger attach or synchronize.
    Debugger,
    /// Patching compiled code in place.
    CodePatch,
    /// Orderly runtime shutdown.
    Shutdown,
}

impl fmt::Display for SuspendReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SuspendReason::Gc => "gc",
            SuspendReason::GcPrep => "gc-prep",
            SuspendReason::Debugger => "debugger",
            SuspendReason::CodePatch => "code-patch",
            SuspendReason::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Summary of the most recent completed suspension cycle.
#[derive(Debug, Clone)]
pub struct CycleSummary {
    pub reason: SuspendReason,
    /// Time from first pass to all-preemptive.
    pub time_to_stop: Duration,
    pub passes: usize,
    /// Threads that were cooperative when the cycle began.
    pub threads_to_stop: usize,
    pub redirected: usize,
    pub dropped: usize,
}

/// Cumulative counters for the suspension machinery. Updated from the
/// cycle owner only; read from anywhere.
#[derive(Debug, Default)]
pub struct SuspendStats {
    cycles: AtomicUsize,
    passes: AtomicUsize,
    redirections: AtomicUsize,
    failed_redirections: AtomicUsize,
    activations: AtomicUsize,
    dropped_threads: AtomicUsize,
    waits: AtomicUsize,
    wait_timeouts: AtomicUsize,
}

impl SuspendStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_cycle(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_pass(&self) {
        self.passes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_redirection(&self) {
        self.redirections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed_redirection(&self) {
        self.failed_redirections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_activation(&self) {
        self.activations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped_thread(&self) {
        self.dropped_threads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_wait(&self, timed_out: bool) {
        self.waits.fetch_add(1, Ordering::Relaxed);
        if timed_out {
            self.wait_timeouts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> SuspendStatsSnapshot {
        SuspendStatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            passes: self.passes.load(Ordering::Relaxed),
            redirections: self.redirections.load(Ordering::Relaxed),
            failed_redirections: self.failed_redirections.load(Ordering::Relaxed),
            activations: self.activations.load(Ordering::Relaxed),
            dropped_threads: self.dropped_threads.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            wait_timeouts: self.wait_timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`SuspendStats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuspendStatsSnapshot {
    pub cycles: usize,
    pub passes: usize,
    pub redirections: usize,
    pub failed_redirections: usize,
    pub activations: usize,
    pub dropped_threads: usize,
    pub waits: usize,
    pub wait_timeouts: usize,
}
