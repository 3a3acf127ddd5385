//! Saved register contexts and the per-thread redirection slot.
//!
//! Each managed thread owns exactly one reusable context slot. It is filled
//! when a redirection is installed and drained by the redirect stub when the
//! thread resumes; because there is only one slot, a second redirection
//! cannot be installed while one is in flight. The slot is allocated with
//! the thread and reused every cycle; suspension itself never allocates.

use parking_lot::Mutex;

use crate::error::SuspendError;
use crate::safepoint_map::{CodePosition, MethodId};

/// Number of general-purpose register slots captured per context. Sized for
/// the widest supported target.
pub const CONTEXT_REGISTERS: usize = 16;

/// A full register-context snapshot of a suspended thread.
///
/// `safe_to_redirect` is reported by the OS context-read primitive: a
/// capture taken mid-syscall or mid-exception-dispatch must not be edited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterContext {
    /// Where the thread will resume: instruction position in managed code.
    pub position: CodePosition,
    pub stack_pointer: usize,
    pub registers: [usize; CONTEXT_REGISTERS],
    pub safe_to_redirect: bool,
}

impl RegisterContext {
    pub fn at(method: MethodId, offset: u32) -> Self {
        Self {
            position: CodePosition { method, offset },
            stack_pointer: 0,
            registers: [0; CONTEXT_REGISTERS],
            safe_to_redirect: true,
        }
    }

    /// Copy of this context with the resumption point replaced.
    pub fn redirected_to(&self, position: CodePosition) -> Self {
        Self { position, ..*self }
    }
}

/// The reusable redirection slot owned by each managed thread.
///
/// # Examples
///
/// ```
/// use stopworld::context::{RedirectSlot, RegisterContext};
/// use stopworld::safepoint_map::MethodId;
///
/// let slot = RedirectSlot::new();
/// let ctx = RegisterContext::at(MethodId(3), 40);
/// slot.occupy(ctx).unwrap();
/// assert!(slot.occupy(ctx).is_err()); // one redirection in flight, max
/// assert_eq!(slot.take().unwrap().position.offset, 40);
/// assert!(slot.take().is_none());
/// ```
#[derive(Debug, Default)]
pub struct RedirectSlot {
    saved: Mutex<Option<RegisterContext>>,
}

impl RedirectSlot {
    pub fn new() -> Self {
        Self {
            saved: Mutex::new(None),
        }
    }

    /// Store the original context for a redirection being installed.
    /// Fails if a redirection is already in flight.
    pub fn occupy(&self, context: RegisterContext) -> Result<(), SuspendError> {
        let mut saved = self.saved.lock();
        if saved.is_some() {
            return Err(SuspendError::RedirectionInFlight);
        }
        *saved = Some(context);
        Ok(())
    }

    /// Drain the slot. Called by the redirect stub to recover the original
    /// resumption point, and by cycle cleanup to discard a stale install.
    pub fn take(&self) -> Option<RegisterContext> {
        self.saved.lock().take()
    }

    pub fn is_occupied(&self) -> bool {
        self.saved.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_admits_one_redirection_at_a_time() {
        let slot = RedirectSlot::new();
        let ctx = RegisterContext::at(MethodId(1), 8);

        assert!(slot.occupy(ctx).is_ok());
        assert_eq!(
            slot.occupy(ctx).unwrap_err(),
            SuspendError::RedirectionInFlight
        );

        assert!(slot.take().is_some());
        assert!(slot.occupy(ctx).is_ok());
    }

    #[test]
    fn redirected_copy_preserves_everything_but_the_position() {
        let mut ctx = RegisterContext::at(MethodId(2), 100);
        ctx.stack_pointer = 0xbeef;
        ctx.registers[3] = 42;

        let redirected = ctx.redirected_to(CodePosition {
            method: MethodId(9),
            offset: 0,
        });
        assert_eq!(redirected.stack_pointer, 0xbeef);
        assert_eq!(redirected.registers[3], 42);
        assert_eq!(redirected.position.method, MethodId(9));
        assert_eq!(ctx.position.method, MethodId(2));
    }
}
