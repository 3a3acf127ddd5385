//! The suspend/resume fixed point.

use std::time::Instant;

use crate::error::{SuspendError, SuspendResult};
use crate::poker::PokeOutcome;
use crate::suspend_state::SuspendState;
use crate::thread::{ManagedThread, ThreadKind};

use super::core::SuspensionCoordinator;
use super::types::{CycleSummary, SuspendReason};

struct FixedPointOutcome {
    passes: usize,
    threads_to_stop: usize,
    redirected: usize,
    dropped: usize,
}

impl SuspensionCoordinator {
    /// Stop the world.
    ///
    /// Acquires the registry cycle lock, raises the stop-the-world gate and
    /// drives every registered mutator to preemptive mode. On return, no
    /// registered thread can mutate GC-visible state until
    /// [`resume_runtime`](Self::resume_runtime).
    ///
    /// The calling thread must not be an asynchronous suspension target of
    /// a concurrent cycle; callers that run on managed threads leave
    /// cooperative mode first.
    pub fn suspend_runtime(&self, reason: SuspendReason) -> SuspendResult<()> {
        let registry = self.registry();
        registry.acquire_cycle();

        log::debug!(
            "suspending runtime (reason: {}, threads: {})",
            reason,
            registry.len()
        );

        // Every poll now takes the slow path until resume.
        registry.trap_inc();
        registry.gate().begin();
        self.set_active_reason(Some(reason));

        // If the driver runs on a registered thread at low priority, boost
        // it for the cycle so it is not starved by its own victims.
        let driver = registry.threads().into_iter().find(|t| t.is_current());
        if let Some(driver_thread) = &driver {
            let ops = self.poker().ops();
            if let Some(previous) = ops.boost_priority(driver_thread) {
                driver_thread.set_saved_priority(Some(previous));
            }
        }

        let started = Instant::now();
        let outcome = self.drive_to_fixed_point(driver.as_ref());

        self.counters().record_cycle();
        self.publish_cycle(CycleSummary {
            reason,
            time_to_stop: started.elapsed(),
            passes: outcome.passes,
            threads_to_stop: outcome.threads_to_stop,
            redirected: outcome.redirected,
            dropped: outcome.dropped,
        });

        log::debug!(
            "runtime suspended (reason: {}, passes: {}, stopped: {}, took: {:?})",
            reason,
            outcome.passes,
            outcome.threads_to_stop,
            started.elapsed()
        );
        Ok(())
    }

    /// Let the world run again.
    ///
    /// Clears per-thread cycle state, restores boosted priorities, releases
    /// the parked threads and drops the registry cycle lock. There is no
    /// per-thread OS resume: threads are either already preemptive or
    /// parked on the gate.
    ///
    /// Rejected if no cycle is in progress or the caller does not own it;
    /// the registry lock is never double-released.
    pub fn resume_runtime(&self, finished: bool) -> SuspendResult<()> {
        let registry = self.registry();
        if !registry.owns_cycle() || !self.is_suspended() {
            return Err(SuspendError::NotSuspended);
        }

        let reason = self.active_reason();
        let ops = self.poker().ops();

        for thread in registry.threads() {
            thread.state().remove(SuspendState::GC_CYCLE_FLAGS);
            if let Some(previous) = thread.take_saved_priority() {
                ops.restore_priority(&thread, previous);
            }
        }

        self.set_active_reason(None);
        registry.trap_dec();
        registry.gate().release();
        registry.release_cycle()?;

        log::debug!(
            "runtime resumed (reason: {:?}, gc finished: {})",
            reason,
            finished
        );
        Ok(())
    }

    /// Repeatedly suspend/redirect/re-scan until no registered mutator is
    /// cooperative.
    fn drive_to_fixed_point(&self, driver: Option<&ManagedThread>) -> FixedPointOutcome {
        let registry = self.registry();
        let signal = registry.suspend_signal();
        let ops = self.poker().ops();

        // Reliable mode reads require the other CPUs' store buffers
        // drained, and the trap flag visible to every thread.
        ops.flush_write_buffers();

        // First pass: mark every cooperative mutator as pending. Threads
        // observed preemptive cannot sneak back in; the gate is already up.
        let mut pending: Vec<ManagedThread> = Vec::new();
        for thread in registry.threads() {
            if let Some(driver_thread) = driver {
                if thread.id() == driver_thread.id() {
                    continue;
                }
            }
            if thread.kind() != ThreadKind::Mutator {
                // GC workers and helpers cannot be coerced to run
                // preemptively.
                continue;
            }
            if thread.is_cooperative() {
                thread.state().insert(SuspendState::SUSPEND_PENDING);
                pending.push(thread);
            }
        }

        let threads_to_stop = pending.len();
        let mut redirected = 0usize;
        let mut dropped = 0usize;
        let mut passes = 0usize;
        let mut previous_count = threads_to_stop;
        let mut observe_only = false;
        let multiprocessor = std::thread::available_parallelism()
            .map(|n| n.get() > 1)
            .unwrap_or(true);
        let mut diagnostic_window = Instant::now();

        loop {
            passes += 1;
            self.counters().record_pass();

            let mut count = 0usize;
            for thread in &pending {
                if !thread
                    .state()
                    .load_opportunistic()
                    .contains(SuspendState::SUSPEND_PENDING)
                {
                    continue;
                }

                if thread.is_detached() || !thread.is_cooperative_opportunistic() {
                    // Reached a safe point (or exited) on its own.
                    thread.state().remove(SuspendState::GC_CYCLE_FLAGS);
                    continue;
                }

                count += 1;

                if observe_only {
                    continue;
                }

                if thread
                    .state()
                    .load_opportunistic()
                    .contains(SuspendState::REDIRECTED)
                {
                    // Already redirected this cycle; it will park itself.
                    continue;
                }

                if thread.in_forbid_suspend_region() {
                    // Left running; it checks in when the region exits.
                    continue;
                }

                match self.poker().poke(thread) {
                    PokeOutcome::Redirected => {
                        redirected += 1;
                        self.counters().record_redirection();
                    }
                    PokeOutcome::ActivationPosted => {
                        self.counters().record_activation();
                    }
                    PokeOutcome::WentPreemptive => {
                        thread.state().remove(SuspendState::GC_CYCLE_FLAGS);
                        count -= 1;
                    }
                    PokeOutcome::Dropped => {
                        log::warn!(
                            "could not suspend thread {}, dropping from cycle",
                            thread.id()
                        );
                        thread.state().remove(SuspendState::GC_CYCLE_FLAGS);
                        self.counters().record_dropped_thread();
                        dropped += 1;
                        count -= 1;
                    }
                    PokeOutcome::Deferred => {
                        self.counters().record_failed_redirection();
                    }
                }
            }

            if count == 0 {
                break;
            }

            // After a pass that updated redirections, re-scan while the
            // count keeps dropping; most threads react fast and we avoid
            // the event wait. Re-poking without progress would starve the
            // targets. No point spinning on a uniprocessor.
            let has_progress = previous_count != count;
            previous_count = count;
            if multiprocessor && (has_progress || !observe_only) {
                std::thread::yield_now();
                observe_only = true;
                continue;
            }
            observe_only = false;

            let seen = signal.current();
            let woke = signal.wait_past(seen, self.config().ping_timeout);
            self.counters().record_wait(!woke);

            if !woke && diagnostic_window.elapsed() > self.config().deadlock_timeout {
                let stuck = pending
                    .iter()
                    .find(|thread| {
                        thread.state().contains(SuspendState::SUSPEND_PENDING)
                            && thread.is_cooperative()
                    })
                    .map(|thread| thread.id())
                    .unwrap_or(0);
                log::error!(
                    "suspension has not converged after {:?}; thread {} cannot be suspended",
                    self.config().deadlock_timeout,
                    stuck
                );
                if cfg!(debug_assertions) {
                    // The runtime's correctness depends on being stoppable;
                    // capture the machine state rather than hang silently.
                    panic!("suspension did not converge, thread {stuck} cannot be suspended");
                }
                diagnostic_window = Instant::now();
            }
        }

        FixedPointOutcome {
            passes,
            threads_to_stop,
            redirected,
            dropped,
        }
    }
}
