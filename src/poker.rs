//! OS suspension primitives and the interchangeable poke strategies.
//!
//! Two strategies exist for moving a cooperative thread toward a safe
//! point, both behind the [`ThreadPoker`] interface and chosen once at
//! startup by capability detection:
//!
//! - [`ActivationPoker`] (primary, portable): posts an asynchronous
//!   activation that the target consumes at its next scheduling
//!   opportunity, invoking the redirect stub voluntarily.
//! - [`SuspendRedirectPoker`] (performance fallback): directly suspends the
//!   target, edits its saved register context to resume at the stub, and
//!   resumes it. Only selected where the OS layer reports safe
//!   arbitrary-thread suspension.
//!
//! The raw OS calls (suspend/resume by handle, context read/write,
//! process-wide write-buffer flush) are abstracted behind [`SuspendOps`] so
//! the redirection state machine is independent of the platform.

use std::sync::Arc;

use crate::context::RegisterContext;
use crate::error::{SuspendError, SuspendResult};
use crate::redirector::{RedirectAttempt, SafepointRedirector};
use crate::thread::ManagedThread;

/// Raw thread-control primitives supplied by the platform layer.
///
/// The contract is weaker than it looks: a "suspended" thread may still be
/// mid-instruction at the hardware level, and a captured context may be
/// reported unsafe to edit (`safe_to_redirect == false`) when the thread
/// was caught mid-syscall or mid-exception-dispatch.
pub trait SuspendOps: Send + Sync {
    /// Whether this platform supports safe arbitrary-thread suspension.
    /// Decides the poke strategy at startup.
    fn supports_suspension(&self) -> bool {
        false
    }

    fn suspend(&self, thread: &ManagedThread) -> SuspendResult<()>;

    fn resume(&self, thread: &ManagedThread);

    fn capture_context(&self, thread: &ManagedThread) -> SuspendResult<RegisterContext>;

    fn apply_context(
        &self,
        thread: &ManagedThread,
        context: &RegisterContext,
    ) -> SuspendResult<()>;

    /// Process-wide write-buffer flush. Run before the first suspension
    /// pass so GC-mode reads are reliable and the trap flag is visible to
    /// every thread.
    fn flush_write_buffers(&self);

    /// Raise the thread to normal priority for the duration of a cycle.
    /// Returns the previous priority if one was saved.
    fn boost_priority(&self, thread: &ManagedThread) -> Option<i32> {
        let _ = thread;
        None
    }

    fn restore_priority(&self, thread: &ManagedThread, priority: i32) {
        let _ = (thread, priority);
    }
}

/// Default platform layer for targets without safe arbitrary-thread
/// suspension. Suspension and context edits are unsupported; the
/// activation strategy carries the protocol.
#[derive(Debug, Default)]
pub struct PortableSuspendOps;

impl PortableSuspendOps {
    pub fn new() -> Self {
        Self
    }
}

impl SuspendOps for PortableSuspendOps {
    fn suspend(&self, _thread: &ManagedThread) -> SuspendResult<()> {
        Err(SuspendError::SuspendFailed)
    }

    fn resume(&self, _thread: &ManagedThread) {}

    fn capture_context(&self, _thread: &ManagedThread) -> SuspendResult<RegisterContext> {
        Err(SuspendError::ContextUnsafe)
    }

    fn apply_context(
        &self,
        _thread: &ManagedThread,
        _context: &RegisterContext,
    ) -> SuspendResult<()> {
        Err(SuspendError::RedirectInstallFailed)
    }

    fn flush_write_buffers(&self) {
        process_write_barrier();
    }
}

/// Force every running CPU to flush its store buffer.
#[cfg(target_os = "linux")]
fn process_write_barrier() {
    // MEMBARRIER_CMD_GLOBAL; falls back to a SeqCst fence where the
    // syscall is unavailable (old kernels, seccomp).
    let ret = unsafe { libc::syscall(libc::SYS_membarrier, 1i32, 0i32, 0i32) };
    if ret < 0 {
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(not(target_os = "linux"))]
fn process_write_barrier() {
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

/// What a single poke attempt achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PokeOutcome {
    /// The thread's resumption point now runs the redirect stub.
    Redirected,
    /// An asynchronous activation was posted; the thread will check in
    /// voluntarily.
    ActivationPosted,
    /// The thread was observed preemptive; nothing to do.
    WentPreemptive,
    /// The thread could not be suspended (likely exiting); drop it from
    /// this pass.
    Dropped,
    /// The attempt failed in a retryable way (context unsafe, not at an
    /// interruptible offset, install failed); retry next pass or wait for
    /// a voluntary check-in.
    Deferred,
}

/// One strategy for nudging a cooperative thread toward a safe point.
pub trait ThreadPoker: Send + Sync {
    fn name(&self) -> &'static str;

    fn poke(&self, thread: &ManagedThread) -> PokeOutcome;

    fn ops(&self) -> &Arc<dyn SuspendOps>;
}

/// Portable strategy: post an activation, let the target invoke the
/// redirect stub at its next scheduling opportunity.
pub struct ActivationPoker {
    ops: Arc<dyn SuspendOps>,
}

impl ActivationPoker {
    pub fn new(ops: Arc<dyn SuspendOps>) -> Self {
        Self { ops }
    }
}

impl ThreadPoker for ActivationPoker {
    fn name(&self) -> &'static str {
        "activation"
    }

    fn poke(&self, thread: &ManagedThread) -> PokeOutcome {
        if !thread.is_cooperative() {
            return PokeOutcome::WentPreemptive;
        }
        thread.post_activation();
        PokeOutcome::ActivationPosted
    }

    fn ops(&self) -> &Arc<dyn SuspendOps> {
        &self.ops
    }
}

/// Direct suspend+edit+resume strategy, for platforms where the OS layer
/// reports safe arbitrary-thread suspension.
pub struct SuspendRedirectPoker {
    redirector: Arc<SafepointRedirector>,
}

impl SuspendRedirectPoker {
    pub fn new(redirector: Arc<SafepointRedirector>) -> Self {
        Self { redirector }
    }

    pub fn redirector(&self) -> &Arc<SafepointRedirector> {
        &self.redirector
    }
}

impl ThreadPoker for SuspendRedirectPoker {
    fn name(&self) -> &'static str {
        "suspend-redirect"
    }

    fn poke(&self, thread: &ManagedThread) -> PokeOutcome {
        match self.redirector.try_redirect(thread) {
            RedirectAttempt::Redirected => PokeOutcome::Redirected,
            RedirectAttempt::WentPreemptive => PokeOutcome::WentPreemptive,
            RedirectAttempt::SuspendFailed => PokeOutcome::Dropped,
            RedirectAttempt::ContextUnsafe
            | RedirectAttempt::NotInterruptible
            | RedirectAttempt::OutsideManagedCode
            | RedirectAttempt::InstallFailed
            | RedirectAttempt::AlreadyInFlight => PokeOutcome::Deferred,
        }
    }

    fn ops(&self) -> &Arc<dyn SuspendOps> {
        self.redirector.ops()
    }
}

/// Pick the poke strategy for this process. Direct suspension is chosen
/// only where the platform layer vouches for it; everything else uses the
/// activation strategy.
pub fn select_poker(redirector: &Arc<SafepointRedirector>) -> Arc<dyn ThreadPoker> {
    if redirector.ops().supports_suspension() {
        log::debug!("thread poke strategy: suspend-redirect");
        Arc::new(SuspendRedirectPoker::new(Arc::clone(redirector)))
    } else {
        log::debug!("thread poke strategy: activation");
        Arc::new(ActivationPoker::new(Arc::clone(redirector.ops())))
    }
}
