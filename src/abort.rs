//! Asynchronous thread aborts.
//!
//! Aborts ride the same check-on-transition machinery as suspension: a
//! request bumps the registry's trap counter, and the target observes the
//! injected unwind at its next poll rather than through any dedicated
//! signalling. Delivery is deferred while the target sits inside a
//! protected/finally or constrained-execution region; a normal abort that
//! outlives its deadline is escalated to rude.

use std::sync::atomic::Ordering;
use std::time::Instant;

use crate::config::EngineConfig;
use crate::error::{SuspendError, SuspendResult};
use crate::suspend_state::SuspendState;
use crate::thread::{AbortKind, ManagedThread, ThreadAbort, ThreadRegistry};

/// Where an abort request currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortPhase {
    None,
    /// Requested but not yet observed by the target. Cancellable.
    Requested,
    /// The target has observed the abort and is unwinding. Irrevocable.
    Initiated,
    /// The target finished unwinding and acknowledged.
    Completed,
}

/// Requests, cancels and monitors thread aborts.
///
/// # Examples
///
/// ```
/// use stopworld::abort::{AbortPhase, ThreadAbortController};
/// use stopworld::config::EngineConfig;
/// use stopworld::thread::{AbortKind, ThreadKind, ThreadRegistry};
///
/// let registry = ThreadRegistry::new();
/// let controller = ThreadAbortController::new(registry.clone(), EngineConfig::default());
/// let thread = registry.attach(ThreadKind::Mutator);
///
/// controller.request_abort(&thread, AbortKind::Normal).unwrap();
/// assert_eq!(controller.phase(&thread), AbortPhase::Requested);
/// controller.cancel_abort(&thread).unwrap();
/// assert_eq!(controller.phase(&thread), AbortPhase::None);
/// ```
pub struct ThreadAbortController {
    registry: ThreadRegistry,
    config: EngineConfig,
}

impl ThreadAbortController {
    pub fn new(registry: ThreadRegistry, config: EngineConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    /// Ask `thread` to unwind. A repeated request may only escalate the
    /// kind (normal to rude), never downgrade it.
    pub fn request_abort(&self, thread: &ManagedThread, kind: AbortKind) -> SuspendResult<()> {
        if kind == AbortKind::None {
            return Err(SuspendError::Registry(
                "abort kind must be normal or rude".into(),
            ));
        }

        if thread
            .state()
            .contains(SuspendState::ABORT_REQUESTED)
        {
            if kind == AbortKind::Rude {
                thread.inner.abort_kind.store(AbortKind::Rude);
            }
            return Ok(());
        }

        thread.inner.abort_kind.store(kind);
        thread
            .inner
            .abort_deadline
            .store(Some(Instant::now() + self.config.abort_deadline));
        thread.inner.abort_completed.store(false, Ordering::Release);

        // A single winner bumps the trap counter, even if two requesters
        // race here.
        if !thread.state().transition(
            SuspendState::empty(),
            SuspendState::ABORT_REQUESTED | SuspendState::ABORT_INITIATED,
            SuspendState::ABORT_REQUESTED,
            SuspendState::empty(),
        ) {
            return Err(SuspendError::Registry(
                "abort already pending or initiated".into(),
            ));
        }

        // Piggy-back on the suspension trap: the target's next poll takes
        // the slow path and finds the request.
        self.registry.trap_inc();
        // Nudge a target that is parked or between polls.
        thread.post_activation();
        log::debug!("abort requested for thread {} ({:?})", thread.id(), kind);
        Ok(())
    }

    /// Withdraw a pending abort. Allowed up until the target initiates the
    /// unwind.
    pub fn cancel_abort(&self, thread: &ManagedThread) -> SuspendResult<()> {
        // Either this cancellation or the target's delivery wins the
        // request; the loser must not touch the trap counter.
        if !thread.state().transition(
            SuspendState::ABORT_REQUESTED,
            SuspendState::ABORT_INITIATED,
            SuspendState::empty(),
            SuspendState::ABORT_REQUESTED,
        ) {
            return Err(SuspendError::Registry(
                "no cancellable abort pending".into(),
            ));
        }
        thread.inner.abort_kind.store(AbortKind::None);
        thread.inner.abort_deadline.store(None);
        self.registry.trap_dec();
        log::debug!("abort cancelled for thread {}", thread.id());
        Ok(())
    }

    /// Acknowledge that the unwind ran to completion. Called by the target
    /// once its frames are gone.
    pub fn complete_abort(&self, thread: &ManagedThread) {
        let previous = thread
            .state()
            .remove(SuspendState::ABORT_REQUESTED | SuspendState::ABORT_INITIATED);
        if previous.contains(SuspendState::ABORT_REQUESTED)
            && !previous.contains(SuspendState::ABORT_INITIATED)
        {
            // Completed without ever being delivered: give back the trap
            // the request took.
            self.registry.trap_dec();
        }
        thread.inner.abort_kind.store(AbortKind::None);
        thread.inner.abort_deadline.store(None);
        thread.inner.abort_completed.store(true, Ordering::Release);
    }

    pub fn phase(&self, thread: &ManagedThread) -> AbortPhase {
        let state = thread.state().load();
        if state.contains(SuspendState::ABORT_INITIATED) {
            AbortPhase::Initiated
        } else if state.contains(SuspendState::ABORT_REQUESTED) {
            AbortPhase::Requested
        } else if thread.inner.abort_completed.load(Ordering::Acquire) {
            AbortPhase::Completed
        } else {
            AbortPhase::None
        }
    }

    /// Whether the target could observe an abort right now. This is the
    /// stack crawl the controller runs before flipping a thread into the
    /// abort-throwing path: protected/finally frames, forbid-suspend
    /// regions and a live redirect-stub frame make it unsafe.
    pub fn is_abort_safe(&self, thread: &ManagedThread) -> bool {
        !thread.in_protected_region()
            && !thread.in_forbid_suspend_region()
            && !thread
                .state()
                .contains(SuspendState::STACK_CRAWL_NEEDED)
    }

    /// Drive a pending abort until the target initiates it, re-checking at
    /// the configured poll interval. Returns [`SuspendError::AbortDeferred`]
    /// if the target never reached a safe point within `max_wait`.
    pub fn drive(&self, thread: &ManagedThread, max_wait: std::time::Duration) -> SuspendResult<()> {
        let deadline = Instant::now() + max_wait;
        loop {
            match self.phase(thread) {
                AbortPhase::Initiated | AbortPhase::Completed => return Ok(()),
                AbortPhase::None => return Err(SuspendError::Registry("no abort pending".into())),
                AbortPhase::Requested => {}
            }
            if Instant::now() >= deadline {
                return Err(SuspendError::AbortDeferred);
            }
            if !self.is_abort_safe(thread) {
                log::trace!(
                    "abort for thread {} deferred, target is at an unsafe point",
                    thread.id()
                );
            }
            thread.post_activation();
            std::thread::sleep(self.config.abort_poll_interval);
        }
    }
}

/// Poll-side delivery check, called from the slow path on the target
/// thread itself.
///
/// Returns `Err` exactly once per request, at the first poll where the
/// crawl finds no protected frame. A normal abort past its deadline is
/// escalated to rude before delivery.
pub(crate) fn try_deliver(thread: &ManagedThread) -> Result<(), ThreadAbort> {
    let state = thread.state().load_opportunistic();
    if !state.contains(SuspendState::ABORT_REQUESTED)
        || state.contains(SuspendState::ABORT_INITIATED)
    {
        return Ok(());
    }

    // Never deliver inside a forbid-suspend region, whatever the kind.
    if thread.in_forbid_suspend_region() {
        return Ok(());
    }

    let mut kind = thread.inner.abort_kind.load();
    if kind == AbortKind::Normal {
        let expired = thread
            .inner
            .abort_deadline
            .load()
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false);
        if expired {
            log::warn!(
                "normal abort for thread {} missed its deadline, escalating to rude",
                thread.id()
            );
            thread.inner.abort_kind.store(AbortKind::Rude);
            kind = AbortKind::Rude;
        }
    }

    // Normal aborts respect protected/finally and constrained regions;
    // rude aborts tear through them.
    if kind == AbortKind::Normal && thread.in_protected_region() {
        return Ok(());
    }

    if !thread.state().transition(
        SuspendState::ABORT_REQUESTED,
        SuspendState::ABORT_INITIATED,
        SuspendState::ABORT_INITIATED,
        SuspendState::empty(),
    ) {
        return Ok(());
    }

    // The request no longer needs the trap.
    thread
        .shared()
        .trap_returning
        .fetch_sub(1, Ordering::AcqRel);
    log::debug!("abort initiated on thread {} ({:?})", thread.id(), kind);
    Err(ThreadAbort { kind })
}
