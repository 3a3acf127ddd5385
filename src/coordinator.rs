//! Stop-the-world suspension coordinator.
//!
//! Implements the GC-suspension fixed point: repeatedly suspend, redirect
//! and re-scan all registered threads until none remain in cooperative
//! mode, then hold the world stopped until [`resume_runtime`] releases it.
//!
//! The module is split the same way the protocol is layered:
//! [`core`](self::core) owns the coordinator struct and its wiring,
//! [`protocol`](self::protocol) the suspend/resume fixed point itself, and
//! [`types`](self::types) the reasons, statistics and cycle summaries.

pub mod core;
pub mod protocol;
pub mod types;

#[cfg(test)]
mod tests;

pub use self::core::SuspensionCoordinator;
pub use self::types::{CycleSummary, SuspendReason, SuspendStatsSnapshot};
