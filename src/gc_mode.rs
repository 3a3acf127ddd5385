//! Cooperative/preemptive GC-mode transitions and the poll check.
//!
//! A thread in *cooperative* mode may be mid-mutation of GC-visible state;
//! a stop-the-world pass must wait for it to check in. A thread in
//! *preemptive* mode cannot touch the managed heap and the GC proceeds
//! without its cooperation. The transitions here are the only way threads
//! cross that boundary.
//!
//! The poll check is the fast path the JIT emits on method returns and loop
//! back-edges: a single atomic load and a conditional branch, rarely taken.
//!
//! # Examples
//!
//! ```
//! use stopworld::thread::{ThreadKind, ThreadRegistry};
//!
//! let registry = ThreadRegistry::new();
//! let thread = registry.attach(ThreadKind::Mutator);
//!
//! thread.enter_cooperative();
//! loop {
//!     // managed work...
//!     if thread.poll().is_err() {
//!         break; // aborted
//!     }
//!     break;
//! }
//! thread.leave_cooperative();
//! ```

use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::thread;

use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex};

use crate::suspend_state::SuspendState;
use crate::thread::{ManagedThread, ThreadAbort};

/// Reported GC mode of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcMode {
    Cooperative,
    Preemptive,
}

#[derive(Debug)]
struct GateState {
    in_progress: bool,
    driver: Option<thread::ThreadId>,
    generation: u64,
}

/// The process-wide stop-the-world gate.
///
/// `begin` is called by a coordinator after it acquires the registry cycle
/// lock; `release` lets every parked thread proceed. Threads entering
/// cooperative mode while the gate is up wait on it, spin-then-block.
#[derive(Debug)]
pub struct StopTheWorldGate {
    /// Fast-path hint, read before taking the state lock.
    in_progress_hint: AtomicBool,
    state: Mutex<GateState>,
    released: Condvar,
}

impl Default for StopTheWorldGate {
    fn default() -> Self {
        Self::new()
    }
}

impl StopTheWorldGate {
    pub fn new() -> Self {
        Self {
            in_progress_hint: AtomicBool::new(false),
            state: Mutex::new(GateState {
                in_progress: false,
                driver: None,
                generation: 0,
            }),
            released: Condvar::new(),
        }
    }

    /// Raise the gate on behalf of the calling thread.
    pub(crate) fn begin(&self) {
        let mut state = self.state.lock();
        debug_assert!(!state.in_progress, "gate is not re-entrant");
        state.in_progress = true;
        state.driver = Some(thread::current().id());
        self.in_progress_hint.store(true, Ordering::Release);
    }

    /// Drop the gate and release every thread parked on it.
    pub(crate) fn release(&self) {
        let mut state = self.state.lock();
        state.in_progress = false;
        state.driver = None;
        state.generation += 1;
        self.in_progress_hint.store(false, Ordering::Release);
        self.released.notify_all();
    }

    pub fn is_active(&self) -> bool {
        self.in_progress_hint.load(Ordering::Acquire)
    }

    /// Whether the calling thread raised the gate.
    pub fn is_driver(&self) -> bool {
        self.state.lock().driver == Some(thread::current().id())
    }

    /// Block until the current cycle releases. Spins briefly first; most
    /// cycles are short.
    pub(crate) fn wait_released(&self) {
        let backoff = Backoff::new();
        while self.is_active() && !backoff.is_completed() {
            backoff.snooze();
        }

        let mut state = self.state.lock();
        let seen = state.generation;
        while state.in_progress && state.generation == seen {
            self.released.wait(&mut state);
        }
    }
}

/// Branch hint for the poll fast path.
#[inline(always)]
fn unlikely(condition: bool) -> bool {
    #[cold]
    fn cold() {}
    if condition {
        cold()
    }
    condition
}

impl ManagedThread {
    /// Reported GC mode of this thread.
    pub fn gc_mode(&self) -> GcMode {
        if self.is_cooperative() {
            GcMode::Cooperative
        } else {
            GcMode::Preemptive
        }
    }

    /// Switch to cooperative mode, checking in with any stop-the-world in
    /// progress.
    ///
    /// If a cycle is active and the caller is not the thread driving it,
    /// this surrenders the cooperative claim and blocks (spin-then-wait)
    /// until the cycle releases, then retries. Re-entrant calls from the
    /// driving thread are no-ops.
    pub fn enter_cooperative(&self) {
        let shared = self.shared();
        loop {
            self.set_cooperative_flag(true);
            // The flag store must be globally visible before we decide the
            // gate is down, or the coordinator could miss this thread.
            fence(Ordering::SeqCst);

            if shared.gate.is_active() && !shared.gate.is_driver() {
                self.set_cooperative_flag(false);
                shared.signal.pulse();
                shared.gate.wait_released();
                continue;
            }

            if self
                .state()
                .contains(SuspendState::DEBUG_SUSPEND_PENDING)
                && !shared.gate.is_driver()
                && !self.in_forbid_suspend_region()
            {
                self.set_cooperative_flag(false);
                shared.signal.pulse();
                self.park_for_debugger();
                continue;
            }

            return;
        }
    }

    /// Switch to preemptive mode and signal any coordinator waiting for
    /// this thread to reach a safe point.
    ///
    /// If the thread's suspend-pending bit is set for a non-GC reason
    /// (debugger, user suspend), this parks on the per-thread event before
    /// returning control to the caller.
    pub fn leave_cooperative(&self) {
        let shared = self.shared();
        self.set_cooperative_flag(false);

        let observed = self.state().load_opportunistic();
        if shared.gate.is_active() || observed.intersects(SuspendState::TRAP_FLAGS) {
            shared.signal.pulse();
        }

        if observed.contains(SuspendState::DEBUG_SUSPEND_PENDING)
            && !shared.gate.is_driver()
            && !self.in_forbid_suspend_region()
        {
            self.park_for_debugger();
        }
    }

    /// Run `work` in preemptive mode, restoring cooperative mode after.
    /// The idiom for blocking calls made from managed code.
    pub fn preemptive_scope<R>(&self, work: impl FnOnce() -> R) -> R {
        self.leave_cooperative();
        let result = work();
        self.enter_cooperative();
        result
    }

    /// Poll check. Emitted on method returns and loop back-edges; a single
    /// load and branch in the common case.
    ///
    /// Returns `Err` when an abort has been injected into this thread; the
    /// caller is expected to unwind.
    #[inline(always)]
    pub fn poll(&self) -> Result<(), ThreadAbort> {
        let trapped = self.shared().trap_returning.load(Ordering::Relaxed) > 0;
        if unlikely(trapped || self.has_pending_activation()) {
            return self.poll_slow();
        }
        Ok(())
    }

    #[cold]
    fn poll_slow(&self) -> Result<(), ThreadAbort> {
        if self.in_forbid_suspend_region() {
            // Nothing may park or unwind this thread here; pending work is
            // picked up at the first poll after the region exits.
            return Ok(());
        }

        if self.take_activation() {
            // An asynchronous activation was posted for this thread; run
            // the redirect stub as if the resumption point had been
            // rewritten.
            crate::redirector::redirect_stub(self);
        } else if self.is_cooperative() {
            let pending = self.shared().gate.is_active()
                || self
                    .state()
                    .load_opportunistic()
                    .intersects(SuspendState::TRAP_FLAGS);
            if pending && !self.shared().gate.is_driver() {
                // Cross the mode boundary so the pending suspension wins.
                self.leave_cooperative();
                self.enter_cooperative();
            }
        }

        crate::abort::try_deliver(self)
    }
}
