//! Safe-point redirection of suspended threads.
//!
//! Given a thread the OS has suspended, the redirector decides whether the
//! thread sits in GC-interruptible code and, if so, rewrites its saved
//! instruction pointer so that it executes [`redirect_stub`] when resumed.
//! The stub parks the thread cooperatively and later resumes the original
//! context, invisibly to the managed program.
//!
//! A single attempt moves through `Suspended -> Verified -> Redirected`,
//! abandoning back to unchanged at any step. Abandonment is cheap and
//! common: the next pass simply retries.

use std::sync::Arc;

use crate::context::RegisterContext;
use crate::poker::SuspendOps;
use crate::safepoint_map::{CodeManager, CodePosition};
use crate::suspend_state::SuspendState;
use crate::thread::ManagedThread;

/// Outcome of one redirection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectAttempt {
    /// The saved context now resumes at the redirect stub.
    Redirected,
    /// The thread left cooperative mode on its own; no redirection needed.
    WentPreemptive,
    /// OS suspension failed; the thread is likely exiting.
    SuspendFailed,
    /// The context was captured mid-syscall or mid-dispatch and must not
    /// be edited. Retry next pass.
    ContextUnsafe,
    /// The thread is in managed code but not at an interruptible offset
    /// (prolog, epilog, or outside the reported ranges).
    NotInterruptible,
    /// The captured position is not in managed code at all.
    OutsideManagedCode,
    /// Writing the edited context back failed; fall back to a voluntary
    /// check-in.
    InstallFailed,
    /// A redirection from an earlier pass is still in flight.
    AlreadyInFlight,
}

/// Installs redirections on suspended threads.
pub struct SafepointRedirector {
    ops: Arc<dyn SuspendOps>,
    code: Arc<dyn CodeManager>,
}

impl SafepointRedirector {
    pub fn new(ops: Arc<dyn SuspendOps>, code: Arc<dyn CodeManager>) -> Self {
        Self { ops, code }
    }

    pub fn ops(&self) -> &Arc<dyn SuspendOps> {
        &self.ops
    }

    /// Whether `position` lies in GC-interruptible code.
    pub fn handled_jit_case(&self, position: CodePosition) -> bool {
        self.code
            .safepoint_query(position.method, position.offset)
            .map(|query| query.gc_safe)
            .unwrap_or(false)
    }

    /// Suspend `thread`, verify it, and redirect it to the stub.
    ///
    /// The target is resumed before this returns, whatever the outcome;
    /// a thread is never left OS-suspended across passes.
    pub fn try_redirect(&self, thread: &ManagedThread) -> RedirectAttempt {
        if self.ops.suspend(thread).is_err() {
            return RedirectAttempt::SuspendFailed;
        }

        // Between our mode check and the OS suspension the thread may have
        // reached a safe point on its own.
        if !thread.is_cooperative() {
            self.ops.resume(thread);
            return RedirectAttempt::WentPreemptive;
        }

        let context = match self.ops.capture_context(thread) {
            Ok(context) => context,
            Err(_) => {
                self.ops.resume(thread);
                return RedirectAttempt::ContextUnsafe;
            }
        };

        if !context.safe_to_redirect {
            self.ops.resume(thread);
            return RedirectAttempt::ContextUnsafe;
        }

        let attempt = self.install(thread, context);
        self.ops.resume(thread);
        attempt
    }

    fn install(&self, thread: &ManagedThread, context: RegisterContext) -> RedirectAttempt {
        let query = match self
            .code
            .safepoint_query(context.position.method, context.position.offset)
        {
            Some(query) => query,
            None => return RedirectAttempt::OutsideManagedCode,
        };
        if !query.gc_safe {
            return RedirectAttempt::NotInterruptible;
        }

        // The slot keeps the original resumption point for the stub; its
        // occupancy is what makes a second in-flight redirection
        // impossible.
        if thread.redirect_slot().occupy(context).is_err() {
            return RedirectAttempt::AlreadyInFlight;
        }

        let redirected = context.redirected_to(CodePosition::redirect_stub());
        if self.ops.apply_context(thread, &redirected).is_err() {
            thread.redirect_slot().take();
            return RedirectAttempt::InstallFailed;
        }

        thread.state().insert(SuspendState::REDIRECTED);
        log::trace!(
            "thread {} redirected at {:?}",
            thread.id(),
            context.position
        );
        RedirectAttempt::Redirected
    }
}

/// The code a redirected (or activated) thread runs at its next scheduling
/// opportunity.
///
/// Executes on the target thread: pushes a stack-crawl-visible marker,
/// leaves cooperative mode (signalling the coordinator), blocks until the
/// active cycle releases, re-enters cooperative mode and hands back the
/// original context to resume from. Returns `None` when the thread was
/// activated without a context rewrite.
pub fn redirect_stub(thread: &ManagedThread) -> Option<RegisterContext> {
    // Crawls that hit this frame must consult the marker, not the
    // rewritten instruction pointer.
    thread.state().insert(SuspendState::STACK_CRAWL_NEEDED);
    thread.push_crawl_marker(CodePosition::redirect_stub());

    thread.leave_cooperative();
    // enter_cooperative parks on the stop-the-world gate until the cycle
    // that trapped us completes.
    thread.enter_cooperative();

    let original = thread.redirect_slot().take();
    thread.state().remove(SuspendState::REDIRECTED);
    thread.pop_crawl_marker();
    thread.state().remove(SuspendState::STACK_CRAWL_NEEDED);
    original
}
