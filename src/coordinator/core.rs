//! The coordinator struct and its wiring.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use crossbeam_utils::atomic::AtomicCell;

use crate::config::EngineConfig;
use crate::poker::ThreadPoker;
use crate::thread::ThreadRegistry;

use super::types::{CycleSummary, SuspendReason, SuspendStats, SuspendStatsSnapshot};

/// Drives the stop-the-world fixed point for the GC (and any other caller
/// with a [`SuspendReason`]).
///
/// The coordinator depends on the registry service and the poke strategy
/// through their interfaces; it owns no threads of its own and runs on
/// whichever thread initiates the suspension.
///
/// # Examples
///
/// ```
/// use stopworld::coordinator::SuspendReason;
/// use stopworld::test_utils::TestFixture;
///
/// let fixture = TestFixture::new();
/// fixture.coordinator.suspend_runtime(SuspendReason::Gc).unwrap();
/// assert!(fixture.coordinator.is_suspended());
/// fixture.coordinator.resume_runtime(true).unwrap();
/// assert!(!fixture.coordinator.is_suspended());
/// ```
pub struct SuspensionCoordinator {
    registry: ThreadRegistry,
    poker: Arc<dyn ThreadPoker>,
    config: EngineConfig,
    stats: SuspendStats,
    /// Reason of the cycle in progress, `None` between cycles.
    active_reason: AtomicCell<Option<SuspendReason>>,
    /// Lock-free snapshot of the last completed cycle.
    last_cycle: ArcSwapOption<CycleSummary>,
}

impl SuspensionCoordinator {
    pub fn new(
        registry: ThreadRegistry,
        poker: Arc<dyn ThreadPoker>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            poker,
            config,
            stats: SuspendStats::new(),
            active_reason: AtomicCell::new(None),
            last_cycle: ArcSwapOption::const_empty(),
        }
    }

    pub fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    pub fn poker(&self) -> &Arc<dyn ThreadPoker> {
        &self.poker
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn counters(&self) -> &SuspendStats {
        &self.stats
    }

    /// Whether a suspension cycle is currently holding the world stopped.
    pub fn is_suspended(&self) -> bool {
        self.active_reason.load().is_some()
    }

    pub fn active_reason(&self) -> Option<SuspendReason> {
        self.active_reason.load()
    }

    pub(crate) fn set_active_reason(&self, reason: Option<SuspendReason>) {
        self.active_reason.store(reason);
    }

    pub fn stats(&self) -> SuspendStatsSnapshot {
        self.stats.snapshot()
    }

    /// Summary of the most recent completed cycle, if any.
    pub fn last_cycle(&self) -> Option<CycleSummary> {
        self.last_cycle.load_full().map(|summary| (*summary).clone())
    }

    pub(crate) fn publish_cycle(&self, summary: CycleSummary) {
        self.last_cycle.store(Some(Arc::new(summary)));
    }
}
