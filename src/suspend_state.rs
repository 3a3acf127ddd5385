//! Per-thread suspend-state bits shared by the GC and debugger coordinators.
//!
//! Both coordinators (and the abort controller) compose the same per-thread
//! state word. The bits are written by the target thread and read by the
//! coordinators concurrently, so every mutation goes through atomic
//! compare-and-swap helpers on [`AtomicSuspendState`]; plain stores would let
//! the two coordinators race each other's flags.

use std::sync::atomic::{AtomicU32, Ordering};

bitflags::bitflags! {
    /// Named per-thread suspension flags.
    ///
    /// `SUSPEND_PENDING` and `REDIRECTED` belong to the GC suspension cycle
    /// and are only set/reset while the cycle owner holds the registry lock.
    /// `DEBUG_SUSPEND_PENDING`, `WILL_SYNC` and `SYNC_SUSPENDED` belong to
    /// the debugger protocol. `FORBID_SUSPEND` is owned by the thread itself.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SuspendState: u32 {
        /// The active GC cycle is watching this thread leave cooperative mode.
        const SUSPEND_PENDING       = 1 << 0;
        /// The thread's resumption point was rewritten this cycle; it will
        /// park itself and needs no further suspension attempts.
        const REDIRECTED            = 1 << 1;
        /// The debugger wants this thread synchronized.
        const DEBUG_SUSPEND_PENDING = 1 << 2;
        /// Debugger bookkeeping: the thread has not yet reported in.
        const WILL_SYNC             = 1 << 3;
        /// The thread is parked on its own suspend event.
        const SYNC_SUSPENDED        = 1 << 4;
        /// A stack crawl must run before this thread continues.
        const STACK_CRAWL_NEEDED    = 1 << 5;
        /// The thread is inside a region where asynchronous suspension is
        /// forbidden; coordinators leave it running.
        const FORBID_SUSPEND        = 1 << 6;
        /// An abort has been requested for this thread.
        const ABORT_REQUESTED       = 1 << 7;
        /// The abort is past the point of no return.
        const ABORT_INITIATED       = 1 << 8;
    }
}

impl SuspendState {
    /// Flags owned by the GC suspension cycle. Only the cycle owner
    /// writes or resets these.
    pub const GC_CYCLE_FLAGS: SuspendState =
        SuspendState::SUSPEND_PENDING.union(SuspendState::REDIRECTED);

    /// Flags that force a trap when the thread next returns to
    /// cooperative mode.
    pub const TRAP_FLAGS: SuspendState = SuspendState::SUSPEND_PENDING
        .union(SuspendState::DEBUG_SUSPEND_PENDING)
        .union(SuspendState::ABORT_REQUESTED);
}

/// Atomic wrapper around [`SuspendState`].
///
/// # Examples
///
/// ```
/// use stopworld::suspend_state::{AtomicSuspendState, SuspendState};
///
/// let state = AtomicSuspendState::new();
/// state.insert(SuspendState::SUSPEND_PENDING);
/// assert!(state.load().contains(SuspendState::SUSPEND_PENDING));
/// state.remove(SuspendState::GC_CYCLE_FLAGS);
/// assert!(state.load().is_empty());
/// ```
#[derive(Debug, Default)]
pub struct AtomicSuspendState(AtomicU32);

impl AtomicSuspendState {
    pub fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn load(&self) -> SuspendState {
        SuspendState::from_bits_truncate(self.0.load(Ordering::Acquire))
    }

    /// Relaxed read for opportunistic checks inside retry loops.
    pub fn load_opportunistic(&self) -> SuspendState {
        SuspendState::from_bits_truncate(self.0.load(Ordering::Relaxed))
    }

    pub fn contains(&self, flags: SuspendState) -> bool {
        self.load().contains(flags)
    }

    /// Set `flags`, returning the previous state.
    pub fn insert(&self, flags: SuspendState) -> SuspendState {
        SuspendState::from_bits_truncate(self.0.fetch_or(flags.bits(), Ordering::AcqRel))
    }

    /// Clear `flags`, returning the previous state.
    pub fn remove(&self, flags: SuspendState) -> SuspendState {
        SuspendState::from_bits_truncate(self.0.fetch_and(!flags.bits(), Ordering::AcqRel))
    }

    /// Atomically set `insert` and clear `remove` in one step.
    pub fn replace(&self, insert: SuspendState, remove: SuspendState) -> SuspendState {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let next = (current & !remove.bits()) | insert.bits();
            match self.0.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(prev) => return SuspendState::from_bits_truncate(prev),
                Err(observed) => current = observed,
            }
        }
    }

    /// Set `flags` only if `guard` is absent. Returns `true` on success.
    ///
    /// This is the helper the abort controller uses to move from
    /// `Requested` to `Initiated` exactly once.
    pub fn insert_unless(&self, flags: SuspendState, guard: SuspendState) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current & guard.bits() != 0 {
                return false;
            }
            let next = current | flags.bits();
            match self.0.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Guarded atomic transition: if `require` is fully set and `forbid`
    /// fully absent, set `insert` and clear `remove` in one step.
    /// Returns `true` if the transition happened.
    ///
    /// This is how two parties racing over the same request (say, a
    /// canceller and the delivering thread) decide a single winner.
    pub fn transition(
        &self,
        require: SuspendState,
        forbid: SuspendState,
        insert: SuspendState,
        remove: SuspendState,
    ) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current & require.bits() != require.bits() || current & forbid.bits() != 0 {
                return false;
            }
            let next = (current & !remove.bits()) | insert.bits();
            match self.0.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Clear `flags` only if they are all currently set. Returns `true` if
    /// the transition happened.
    pub fn remove_if_set(&self, flags: SuspendState) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current & flags.bits() != flags.bits() {
                return false;
            }
            let next = current & !flags.bits();
            match self.0.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }
}
