//! Managed-thread records and the global thread registry.
//!
//! Every OS thread that executes managed code is represented by a
//! [`ManagedThread`] created through [`ThreadRegistry::attach`]. The record
//! carries the atomic GC-mode flag, the shared suspend-state bitset, the
//! reusable redirection slot and the abort request state. The registry owns
//! the single serializing cycle lock ("big lock") that a coordinator must
//! hold to run a suspend/resume cycle, and the two global counters the
//! check-on-transition machinery polls.
//!
//! # Examples
//!
//! ```
//! use stopworld::thread::{ThreadKind, ThreadRegistry};
//!
//! let registry = ThreadRegistry::new();
//! let thread = registry.attach(ThreadKind::Mutator);
//! assert!(!thread.is_cooperative());
//!
//! thread.enter_cooperative();
//! assert!(thread.is_cooperative());
//! thread.leave_cooperative();
//!
//! registry.detach(&thread);
//! assert!(registry.threads().is_empty());
//! ```

use std::sync::{
    atomic::{AtomicBool, AtomicIsize, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_utils::atomic::AtomicCell;
use parking_lot::{Condvar, Mutex};

use crate::context::RedirectSlot;
use crate::error::{SuspendError, SuspendResult};
use crate::gc_mode::StopTheWorldGate;
use crate::safepoint_map::CodePosition;
use crate::suspend_state::{AtomicSuspendState, SuspendState};

/// What a registered thread is for, from the coordinator's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadKind {
    /// Runs managed code; the target of every suspension protocol.
    Mutator,
    /// GC-internal worker. Cannot be coerced to run preemptively and is
    /// skipped by suspension passes.
    GcWorker,
    /// Out-of-band helper (debugger coordination, canary). Never runs
    /// managed code.
    Helper,
}

/// Abort severity, carried on the target thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortKind {
    None,
    /// Honors protected/finally and constrained regions.
    Normal,
    /// Delivered at the next poll even inside protected regions; only
    /// forbid-suspend regions still defer it.
    Rude,
}

/// The asynchronous unwind request a managed loop observes from `poll`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadAbort {
    pub kind: AbortKind,
}

impl std::fmt::Display for ThreadAbort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            AbortKind::Rude => write!(f, "rude thread abort"),
            _ => write!(f, "thread abort"),
        }
    }
}

impl std::error::Error for ThreadAbort {}

pub(crate) struct ThreadInner {
    id: u64,
    kind: ThreadKind,
    /// true = cooperative, false = preemptive. Read and written across
    /// threads; transitions are atomic.
    cooperative: AtomicBool,
    pub(crate) state: AtomicSuspendState,
    pub(crate) redirect_slot: RedirectSlot,
    /// Pending asynchronous activation, consumed at the next poll.
    activation: AtomicBool,
    detached: AtomicBool,
    /// Depth of protected/finally and constrained-execution regions; an
    /// abort may not be initiated while nonzero.
    protected_depth: AtomicUsize,
    forbid_depth: AtomicUsize,
    pub(crate) abort_kind: AtomicCell<AbortKind>,
    pub(crate) abort_deadline: AtomicCell<Option<Instant>>,
    pub(crate) abort_completed: AtomicBool,
    /// Valid only while a suspend cycle is active.
    pub(crate) saved_priority: AtomicCell<Option<i32>>,
    /// Stack-crawl-visible markers pushed by the redirect stub.
    crawl_markers: Mutex<Vec<CodePosition>>,
    /// Per-thread suspend event for non-GC suspension (debugger, user
    /// suspend).
    park_lock: Mutex<()>,
    park_cv: Condvar,
    bound_os_thread: Mutex<Option<thread::ThreadId>>,
    pub(crate) shared: Arc<RegistryShared>,
}

/// Handle to a managed thread record. Cheap to clone; all clones refer to
/// the same underlying record.
pub struct ManagedThread {
    pub(crate) inner: Arc<ThreadInner>,
}

impl Clone for ManagedThread {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for ManagedThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedThread")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("cooperative", &self.is_cooperative())
            .field("state", &self.state().load())
            .finish()
    }
}

impl ManagedThread {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn kind(&self) -> ThreadKind {
        self.inner.kind
    }

    pub fn is_cooperative(&self) -> bool {
        self.inner.cooperative.load(Ordering::Acquire)
    }

    /// Relaxed read used inside coordinator retry loops, where the write
    /// buffers were already flushed for the pass.
    pub fn is_cooperative_opportunistic(&self) -> bool {
        self.inner.cooperative.load(Ordering::Relaxed)
    }

    pub(crate) fn set_cooperative_flag(&self, cooperative: bool) {
        self.inner.cooperative.store(cooperative, Ordering::Release);
    }

    pub fn state(&self) -> &AtomicSuspendState {
        &self.inner.state
    }

    pub fn redirect_slot(&self) -> &RedirectSlot {
        &self.inner.redirect_slot
    }

    pub(crate) fn shared(&self) -> &Arc<RegistryShared> {
        &self.inner.shared
    }

    /// Associate this record with the OS thread that runs it. Called once
    /// from the target thread itself.
    pub fn bind_current(&self) {
        *self.inner.bound_os_thread.lock() = Some(thread::current().id());
    }

    /// Whether this record is bound to the calling OS thread.
    pub fn is_current(&self) -> bool {
        *self.inner.bound_os_thread.lock() == Some(thread::current().id())
    }

    pub fn is_detached(&self) -> bool {
        self.inner.detached.load(Ordering::Acquire)
    }

    // --- asynchronous activation -----------------------------------------

    /// Post an asynchronous activation; the thread will run the redirect
    /// stub at its next scheduling opportunity (poll or park exit).
    pub fn post_activation(&self) {
        self.inner.activation.store(true, Ordering::Release);
    }

    pub(crate) fn take_activation(&self) -> bool {
        self.inner.activation.swap(false, Ordering::AcqRel)
    }

    pub fn has_pending_activation(&self) -> bool {
        self.inner.activation.load(Ordering::Acquire)
    }

    // --- regions ----------------------------------------------------------

    /// Enter a region where asynchronous suspension is forbidden. The
    /// coordinators leave the thread running until the guard drops.
    pub fn forbid_suspend(&self) -> ForbidSuspendGuard {
        if self.inner.forbid_depth.fetch_add(1, Ordering::AcqRel) == 0 {
            self.state().insert(SuspendState::FORBID_SUSPEND);
            self.inner.shared.unsafe_spots.fetch_add(1, Ordering::AcqRel);
        }
        ForbidSuspendGuard {
            thread: self.clone(),
        }
    }

    pub fn in_forbid_suspend_region(&self) -> bool {
        self.inner.forbid_depth.load(Ordering::Acquire) > 0
    }

    /// Enter a protected/finally or constrained-execution region. Aborts
    /// are deferred while the guard lives.
    pub fn enter_protected_region(&self) -> ProtectedRegionGuard {
        self.inner.protected_depth.fetch_add(1, Ordering::AcqRel);
        ProtectedRegionGuard {
            thread: self.clone(),
        }
    }

    pub fn in_protected_region(&self) -> bool {
        self.inner.protected_depth.load(Ordering::Acquire) > 0
    }

    // --- crawl markers ----------------------------------------------------

    pub(crate) fn push_crawl_marker(&self, position: CodePosition) {
        self.inner.crawl_markers.lock().push(position);
    }

    pub(crate) fn pop_crawl_marker(&self) {
        self.inner.crawl_markers.lock().pop();
    }

    /// Snapshot of the stack-crawl markers currently visible on this
    /// thread, outermost first.
    pub fn crawl_markers(&self) -> Vec<CodePosition> {
        self.inner.crawl_markers.lock().clone()
    }

    // --- per-thread park event (debugger / user suspend) ------------------

    /// Park until the debugger clears this thread's suspend-pending bit.
    /// Called on the thread itself when it leaves cooperative mode with a
    /// non-GC suspension pending.
    pub(crate) fn park_for_debugger(&self) {
        self.state().insert(SuspendState::SYNC_SUSPENDED);
        let mut guard = self.inner.park_lock.lock();
        while self
            .state()
            .contains(SuspendState::DEBUG_SUSPEND_PENDING)
        {
            self.inner.park_cv.wait(&mut guard);
        }
        drop(guard);
        self.state().remove(SuspendState::SYNC_SUSPENDED);
    }

    /// Wake the thread from its per-thread park, after the pending bit has
    /// been cleared.
    pub(crate) fn unpark_from_debugger(&self) {
        let _guard = self.inner.park_lock.lock();
        self.inner.park_cv.notify_all();
    }

    pub fn is_sync_suspended(&self) -> bool {
        self.state().contains(SuspendState::SYNC_SUSPENDED)
    }

    // --- saved priority (valid only during an active cycle) ---------------

    pub(crate) fn set_saved_priority(&self, previous: Option<i32>) {
        self.inner.saved_priority.store(previous);
    }

    pub(crate) fn take_saved_priority(&self) -> Option<i32> {
        self.inner.saved_priority.take()
    }
}

/// RAII guard for forbid-suspend regions.
pub struct ForbidSuspendGuard {
    thread: ManagedThread,
}

impl Drop for ForbidSuspendGuard {
    fn drop(&mut self) {
        let inner = &self.thread.inner;
        if inner.forbid_depth.fetch_sub(1, Ordering::AcqRel) == 1 {
            inner.state.remove(SuspendState::FORBID_SUSPEND);
            inner.shared.unsafe_spots.fetch_sub(1, Ordering::AcqRel);
            // A sweep may be waiting for this thread to leave the region.
            inner.shared.signal.pulse();
        }
    }
}

/// RAII guard for protected/finally and constrained-execution regions.
pub struct ProtectedRegionGuard {
    thread: ManagedThread,
}

impl Drop for ProtectedRegionGuard {
    fn drop(&mut self) {
        self.thread
            .inner
            .protected_depth
            .fetch_sub(1, Ordering::AcqRel);
    }
}

/// Process-wide waitable event with a generation counter.
///
/// Any thread leaving cooperative mode during a cycle pulses it; the
/// coordinator waits on it instead of busy-polling the thread list.
#[derive(Debug, Default)]
pub struct SuspendSignal {
    generation: Mutex<u64>,
    cv: Condvar,
}

impl SuspendSignal {
    pub fn new() -> Self {
        Self {
            generation: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    pub fn current(&self) -> u64 {
        *self.generation.lock()
    }

    pub fn pulse(&self) {
        let mut generation = self.generation.lock();
        *generation += 1;
        self.cv.notify_all();
    }

    /// Wait until the generation advances past `seen`, or the timeout
    /// elapses. Returns `true` if the signal advanced.
    pub fn wait_past(&self, seen: u64, timeout: Duration) -> bool {
        let mut generation = self.generation.lock();
        if *generation > seen {
            return true;
        }
        let result = self
            .cv
            .wait_while_for(&mut generation, |generation| *generation <= seen, timeout);
        !result.timed_out()
    }
}

/// State shared between the registry and every thread it created: the
/// stop-the-world gate, the suspend signal and the two global counters.
#[derive(Debug)]
pub(crate) struct RegistryShared {
    pub(crate) gate: StopTheWorldGate,
    pub(crate) signal: SuspendSignal,
    /// Threads requiring a trap on return to cooperative mode. Nonzero
    /// turns every poll into a slow path.
    pub(crate) trap_returning: AtomicIsize,
    /// Threads currently at an unsafe-to-suspend place.
    pub(crate) unsafe_spots: AtomicIsize,
}

impl RegistryShared {
    fn new() -> Self {
        Self {
            gate: StopTheWorldGate::new(),
            signal: SuspendSignal::new(),
            trap_returning: AtomicIsize::new(0),
            unsafe_spots: AtomicIsize::new(0),
        }
    }
}

/// Registry of all managed threads ("thread store").
///
/// Owns the serializing cycle lock. Suspension coordinators must acquire it
/// with [`acquire_cycle`](ThreadRegistry::acquire_cycle) before driving a
/// cycle and release it from the same thread.
#[derive(Clone)]
pub struct ThreadRegistry {
    shared: Arc<RegistryShared>,
    threads: Arc<Mutex<Vec<ManagedThread>>>,
    cycle_owner: Arc<Mutex<Option<thread::ThreadId>>>,
    cycle_cv: Arc<Condvar>,
    next_id: Arc<AtomicU64>,
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(RegistryShared::new()),
            threads: Arc::new(Mutex::new(Vec::new())),
            cycle_owner: Arc::new(Mutex::new(None)),
            cycle_cv: Arc::new(Condvar::new()),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a new thread record. Threads start preemptive; they enter
    /// cooperative mode before touching GC-visible state.
    pub fn attach(&self, kind: ThreadKind) -> ManagedThread {
        let thread = ManagedThread {
            inner: Arc::new(ThreadInner {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                kind,
                cooperative: AtomicBool::new(false),
                state: AtomicSuspendState::new(),
                redirect_slot: RedirectSlot::new(),
                activation: AtomicBool::new(false),
                detached: AtomicBool::new(false),
                protected_depth: AtomicUsize::new(0),
                forbid_depth: AtomicUsize::new(0),
                abort_kind: AtomicCell::new(AbortKind::None),
                abort_deadline: AtomicCell::new(None),
                abort_completed: AtomicBool::new(false),
                saved_priority: AtomicCell::new(None),
                crawl_markers: Mutex::new(Vec::new()),
                park_lock: Mutex::new(()),
                park_cv: Condvar::new(),
                bound_os_thread: Mutex::new(None),
                shared: Arc::clone(&self.shared),
            }),
        };
        self.threads.lock().push(thread.clone());
        thread
    }

    /// Remove a thread record at exit/detach. The thread must be
    /// preemptive; a cooperative thread cannot disappear mid-scan.
    pub fn detach(&self, thread: &ManagedThread) {
        thread.inner.detached.store(true, Ordering::Release);
        self.threads
            .lock()
            .retain(|candidate| candidate.id() != thread.id());
        // An active cycle may be counting on this thread; let it re-scan.
        self.shared.signal.pulse();
    }

    /// Snapshot of the registered threads.
    pub fn threads(&self) -> Vec<ManagedThread> {
        self.threads.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.lock().is_empty()
    }

    pub fn get(&self, id: u64) -> Option<ManagedThread> {
        self.threads
            .lock()
            .iter()
            .find(|thread| thread.id() == id)
            .cloned()
    }

    // --- global counters --------------------------------------------------

    pub fn trap_returning_threads(&self) -> isize {
        self.shared.trap_returning.load(Ordering::Acquire)
    }

    pub(crate) fn trap_inc(&self) {
        self.shared.trap_returning.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn trap_dec(&self) {
        let previous = self.shared.trap_returning.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "trap counter underflow");
    }

    pub fn unsafe_spot_threads(&self) -> isize {
        self.shared.unsafe_spots.load(Ordering::Acquire)
    }

    pub fn suspend_signal(&self) -> &SuspendSignal {
        &self.shared.signal
    }

    pub fn gate(&self) -> &StopTheWorldGate {
        &self.shared.gate
    }

    pub(crate) fn shared(&self) -> &Arc<RegistryShared> {
        &self.shared
    }

    // --- cycle lock -------------------------------------------------------

    /// Acquire the serializing cycle lock, blocking while another cycle is
    /// in progress. The caller must not be a suspension target of any
    /// concurrent cycle.
    pub fn acquire_cycle(&self) {
        let me = thread::current().id();
        let mut owner = self.cycle_owner.lock();
        debug_assert!(
            *owner != Some(me),
            "cycle lock is not re-entrant"
        );
        while owner.is_some() {
            self.cycle_cv.wait(&mut owner);
        }
        *owner = Some(me);
    }

    /// Release the cycle lock. Fails (never double-releases) if no cycle
    /// is in progress or a different thread owns it.
    pub fn release_cycle(&self) -> SuspendResult<()> {
        let me = thread::current().id();
        let mut owner = self.cycle_owner.lock();
        if *owner != Some(me) {
            return Err(SuspendError::NotSuspended);
        }
        *owner = None;
        self.cycle_cv.notify_all();
        Ok(())
    }

    /// Whether the calling thread currently owns the cycle lock.
    pub fn owns_cycle(&self) -> bool {
        *self.cycle_owner.lock() == Some(thread::current().id())
    }
}
