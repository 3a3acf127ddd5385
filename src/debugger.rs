//! Debugger-driven thread synchronization.
//!
//! Structurally the same fixed point as the GC suspension protocol, but
//! with a different shape of lifetime: it is driven by one dedicated,
//! long-lived coordination thread; it keeps a running count of threads
//! still expected to sync so later sweeps re-check only unresolved
//! threads; it never force-suspends an already-preemptive thread (the
//! pending bit parks them on their next cooperative transition instead);
//! and resumption is per-thread, because a debugger may keep a subset of
//! threads suspended indefinitely.
//!
//! Threads inside forbid-suspend regions are left running and only count
//! as synchronized once the region exits.

use std::sync::{
    atomic::{AtomicBool, AtomicIsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config::EngineConfig;
use crate::error::{SuspendError, SuspendResult};
use crate::poker::ThreadPoker;
use crate::suspend_state::SuspendState;
use crate::thread::{ManagedThread, ThreadKind, ThreadRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncStatus {
    /// Still running managed code; the sweep keeps nudging it.
    Pending,
    /// Preemptive or parked; no further attention needed.
    Synced,
}

enum Command {
    Synchronize,
    Shutdown,
}

struct DebuggerInner {
    registry: ThreadRegistry,
    poker: Arc<dyn ThreadPoker>,
    config: EngineConfig,
    /// A start/resume_all pair is in effect.
    attached: AtomicBool,
    /// Threads still expected to sync; -1 mirrors "no sync in progress".
    will_sync: AtomicIsize,
    sync_table: DashMap<u64, SyncStatus>,
}

/// Debugger-facing suspend/sweep/resume entry points.
///
/// Invoked by the external IPC-event dispatcher; only the suspension
/// semantics live here.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use stopworld::test_utils::TestFixture;
///
/// let fixture = TestFixture::new();
/// let debugger = fixture.debugger();
/// debugger.start().unwrap();
/// assert!(debugger.wait_for_sync(Duration::from_millis(100)));
/// debugger.resume_all().unwrap();
/// ```
pub struct DebuggerSuspensionCoordinator {
    inner: Arc<DebuggerInner>,
    commands: flume::Sender<Command>,
}

impl DebuggerSuspensionCoordinator {
    /// Create the coordinator and spawn its dedicated coordination thread.
    pub fn new(
        registry: ThreadRegistry,
        poker: Arc<dyn ThreadPoker>,
        config: EngineConfig,
    ) -> Self {
        let inner = Arc::new(DebuggerInner {
            registry,
            poker,
            config,
            attached: AtomicBool::new(false),
            will_sync: AtomicIsize::new(-1),
            sync_table: DashMap::new(),
        });

        let (commands, receiver) = flume::unbounded();
        let worker_inner = Arc::clone(&inner);
        std::thread::Builder::new()
            .name("debugger-coordination".into())
            .spawn(move || worker_loop(worker_inner, receiver))
            .expect("failed to spawn debugger coordination thread");

        Self { inner, commands }
    }

    /// Begin synchronizing every mutator thread. Returns immediately; the
    /// coordination thread sweeps until convergence.
    pub fn start(&self) -> SuspendResult<()> {
        let inner = &self.inner;
        if inner.attached.swap(true, Ordering::AcqRel) {
            return Err(SuspendError::Registry(
                "debugger suspension already in progress".into(),
            ));
        }

        inner.registry.trap_inc();
        inner.sync_table.clear();
        inner.poker.ops().flush_write_buffers();

        let mut outstanding = 0isize;
        for thread in inner.registry.threads() {
            if thread.kind() != ThreadKind::Mutator {
                continue;
            }
            thread
                .state()
                .insert(SuspendState::DEBUG_SUSPEND_PENDING | SuspendState::WILL_SYNC);
            if thread.is_cooperative() {
                inner.sync_table.insert(thread.id(), SyncStatus::Pending);
                outstanding += 1;
            } else {
                // Already preemptive: counted synced now, parks by itself
                // if it tries to go cooperative.
                thread.state().remove(SuspendState::WILL_SYNC);
                inner.sync_table.insert(thread.id(), SyncStatus::Synced);
            }
        }
        inner.will_sync.store(outstanding, Ordering::Release);

        log::debug!(
            "debugger sync started, {} threads still expected to sync",
            outstanding
        );
        let _ = self.commands.send(Command::Synchronize);
        Ok(())
    }

    /// One sweep over the unresolved threads. Returns `true` once every
    /// thread has synchronized. Normally invoked from the coordination
    /// thread, but callable directly by tests and diagnostics.
    pub fn sweep(&self) -> bool {
        self.inner.sweep_once()
    }

    pub fn is_synchronized(&self) -> bool {
        self.inner.attached.load(Ordering::Acquire)
            && self.inner.will_sync.load(Ordering::Acquire) == 0
    }

    /// Threads still expected to sync, or `None` outside a sync.
    pub fn threads_left_to_sync(&self) -> Option<usize> {
        let count = self.inner.will_sync.load(Ordering::Acquire);
        (count >= 0).then_some(count as usize)
    }

    /// Block until the current sync converges or `timeout` elapses.
    pub fn wait_for_sync(&self, timeout: Duration) -> bool {
        let signal = self.inner.registry.suspend_signal();
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_synchronized() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return self.is_synchronized();
            }
            let seen = signal.current();
            signal.wait_past(seen, (deadline - now).min(self.inner.config.ping_timeout));
        }
    }

    /// Let a single thread run again while the rest stay synchronized.
    pub fn resume_thread(&self, thread: &ManagedThread) -> SuspendResult<()> {
        if !self.inner.attached.load(Ordering::Acquire) {
            return Err(SuspendError::NotSuspended);
        }
        self.inner.release_thread(thread);
        Ok(())
    }

    /// End the debugger suspension and release every thread.
    pub fn resume_all(&self) -> SuspendResult<()> {
        let inner = &self.inner;
        if !inner.attached.swap(false, Ordering::AcqRel) {
            return Err(SuspendError::NotSuspended);
        }

        for thread in inner.registry.threads() {
            inner.release_thread(&thread);
        }
        inner.sync_table.clear();
        inner.will_sync.store(-1, Ordering::Release);
        inner.registry.trap_dec();
        log::debug!("debugger sync ended, all threads released");
        Ok(())
    }
}

impl Drop for DebuggerSuspensionCoordinator {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

impl DebuggerInner {
    fn sweep_once(&self) -> bool {
        if !self.attached.load(Ordering::Acquire) {
            return false;
        }

        let mut outstanding = 0isize;
        for thread in self.registry.threads() {
            if thread.kind() != ThreadKind::Mutator {
                continue;
            }

            // A thread attached after start() joins the sync like the rest.
            if !self.sync_table.contains_key(&thread.id()) {
                thread
                    .state()
                    .insert(SuspendState::DEBUG_SUSPEND_PENDING | SuspendState::WILL_SYNC);
                self.sync_table.insert(thread.id(), SyncStatus::Pending);
            }

            let status = self
                .sync_table
                .get(&thread.id())
                .map(|entry| *entry.value())
                .unwrap_or(SyncStatus::Pending);
            if status == SyncStatus::Synced {
                continue;
            }

            if thread.is_detached() || !thread.is_cooperative() {
                thread.state().remove(SuspendState::WILL_SYNC);
                self.sync_table.insert(thread.id(), SyncStatus::Synced);
                continue;
            }

            if thread.in_forbid_suspend_region() {
                // Left running; counts as unsynced until the region exits.
                outstanding += 1;
                continue;
            }

            self.poker.poke(&thread);
            outstanding += 1;
        }

        self.will_sync.store(outstanding, Ordering::Release);
        outstanding == 0
    }

    fn release_thread(&self, thread: &ManagedThread) {
        thread
            .state()
            .remove(SuspendState::DEBUG_SUSPEND_PENDING | SuspendState::WILL_SYNC);
        self.sync_table.remove(&thread.id());
        thread.unpark_from_debugger();
    }
}

fn worker_loop(inner: Arc<DebuggerInner>, commands: flume::Receiver<Command>) {
    while let Ok(command) = commands.recv() {
        match command {
            Command::Shutdown => break,
            Command::Synchronize => {
                let signal = inner.registry.suspend_signal();
                while inner.attached.load(Ordering::Acquire) {
                    if inner.sweep_once() {
                        // Wake anyone blocked in wait_for_sync.
                        signal.pulse();
                        log::debug!("debugger sync converged");
                        break;
                    }
                    let seen = signal.current();
                    signal.wait_past(seen, inner.config.ping_timeout);
                }
            }
        }
    }
}
