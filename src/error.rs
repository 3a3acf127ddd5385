//! Error types for the suspension engine.

use thiserror::Error;

/// Errors that can occur while driving threads to a safe point.
///
/// None of these unwind across the suspend boundary; coordinators consume
/// them to decide between dropping a thread from the current pass, retrying
/// on the next pass, or falling back to a voluntary check-in.
///
/// # Examples
///
/// ```
/// use stopworld::error::{SuspendError, SuspendResult};
///
/// let err = SuspendError::ContextUnsafe;
/// assert_eq!(err.to_string(), "captured context is unsafe to redirect");
///
/// let failure: SuspendResult<()> = Err(SuspendError::SuspendFailed);
/// assert!(failure.is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SuspendError {
    /// OS-level suspension failed; the thread is most likely exiting.
    /// The coordinator drops it from the current pass and continues.
    #[error("OS suspend failed, thread is likely exiting")]
    SuspendFailed,
    /// The captured register context was taken mid-syscall or mid-exception
    /// dispatch and must not be edited. Retried on the next pass.
    #[error("captured context is unsafe to redirect")]
    ContextUnsafe,
    /// Writing the redirected context back failed. The coordinator falls
    /// back to waiting for a voluntary check-in.
    #[error("failed to install redirected context")]
    RedirectInstallFailed,
    /// A redirection is already in flight for this thread. The reusable
    /// context slot admits at most one.
    #[error("thread already has a live redirection")]
    RedirectionInFlight,
    /// The canary probe did not answer within its timeout. This is a policy
    /// verdict ("locks unavailable"), not a malfunction.
    #[error("canary probe timed out")]
    CanaryTimeout,
    /// The target thread is inside a protected or constrained region and the
    /// abort must be retried later.
    #[error("abort deferred, target is at an unsafe point")]
    AbortDeferred,
    /// The suspension fixed point failed to converge within the configured
    /// deadlock timeout. Fatal in diagnostic builds.
    #[error("suspension did not converge, thread {0} cannot be suspended")]
    DeadlockTimeout(u64),
    /// Resume was called with no suspension in progress, or from a thread
    /// that does not own the current cycle.
    #[error("no suspension in progress")]
    NotSuspended,
    /// The thread registry rejected the operation.
    #[error("thread registry error: {0}")]
    Registry(String),
}

/// Result type for suspension operations.
pub type SuspendResult<T> = Result<T, SuspendError>;
