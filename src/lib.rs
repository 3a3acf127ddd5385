//! Stop-the-world suspension engine for a JIT-compiled managed runtime.
//!
//! Brings every managed thread to a GC-safe (preemptive) state on demand:
//! for garbage collection, debugger synchronization, or code patching.
//! Threads cooperate through explicit poll checks and mode transitions;
//! threads that do not check in promptly are redirected at safe points, by
//! asynchronous activation on portable targets or by direct suspend+edit
//! of their register context where the platform supports it.
//!
//! ## Architecture
//!
//! - [`thread`]: managed-thread records, the registry and its big lock
//! - [`gc_mode`]: cooperative/preemptive transitions and the poll check
//! - [`redirector`] / [`poker`]: safe-point redirection strategies
//! - [`coordinator`]: the GC stop-the-world fixed point
//! - [`debugger`]: the debugger-driven variant of the same protocol
//! - [`abort`]: injected thread aborts riding the same machinery
//! - [`canary`]: deadlock-avoidance probe for helper threads
//!
//! ## Usage
//!
//! ```
//! use stopworld::coordinator::SuspendReason;
//! use stopworld::di::RuntimeContainer;
//! use stopworld::thread::ThreadKind;
//!
//! let container = RuntimeContainer::new();
//! let worker = container.registry().attach(ThreadKind::Mutator);
//!
//! let coordinator = container.coordinator();
//! coordinator.suspend_runtime(SuspendReason::Gc).unwrap();
//! // ... scan roots, move objects ...
//! coordinator.resume_runtime(true).unwrap();
//!
//! container.registry().detach(&worker);
//! ```

pub mod abort;
pub mod canary;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod debugger;
pub mod di;
pub mod error;
pub mod gc_mode;
pub mod poker;
pub mod redirector;
pub mod safepoint_map;
pub mod suspend_state;
pub mod test_utils;
pub mod thread;

pub use abort::{AbortPhase, ThreadAbortController};
pub use canary::LockSafetyCanary;
pub use config::EngineConfig;
pub use coordinator::{SuspendReason, SuspensionCoordinator};
pub use debugger::DebuggerSuspensionCoordinator;
pub use error::{SuspendError, SuspendResult};
pub use gc_mode::GcMode;
pub use thread::{AbortKind, ManagedThread, ThreadAbort, ThreadKind, ThreadRegistry};
