use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use crate::context::RegisterContext;
use crate::error::SuspendError;
use crate::safepoint_map::MethodId;
use crate::suspend_state::SuspendState;
use crate::test_utils::TestFixture;
use crate::thread::{ManagedThread, ThreadKind};

use super::types::SuspendReason;

/// Spawn an OS thread that runs a cooperative poll loop against `thread`.
/// Returns (stop flag, iteration counter, join handle).
fn spawn_poll_loop(
    thread: &ManagedThread,
) -> (
    Arc<AtomicBool>,
    Arc<AtomicUsize>,
    std::thread::JoinHandle<()>,
) {
    let stop = Arc::new(AtomicBool::new(false));
    let counter = Arc::new(AtomicUsize::new(0));
    let worker = thread.clone();
    let stop_clone = Arc::clone(&stop);
    let counter_clone = Arc::clone(&counter);

    let handle = std::thread::spawn(move || {
        worker.bind_current();
        worker.enter_cooperative();
        while !stop_clone.load(Ordering::Relaxed) {
            counter_clone.fetch_add(1, Ordering::Relaxed);
            if worker.poll().is_err() {
                break;
            }
        }
        worker.leave_cooperative();
    });

    (stop, counter, handle)
}

fn wait_until(deadline: Duration, condition: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        std::thread::yield_now();
    }
    condition()
}

#[test]
fn empty_registry_suspends_immediately() {
    let fixture = TestFixture::new();
    fixture.coordinator.suspend_runtime(SuspendReason::Gc).unwrap();
    assert!(fixture.coordinator.is_suspended());
    assert_eq!(
        fixture.coordinator.active_reason(),
        Some(SuspendReason::Gc)
    );
    fixture.coordinator.resume_runtime(true).unwrap();
    assert!(!fixture.coordinator.is_suspended());

    let summary = fixture.coordinator.last_cycle().unwrap();
    assert_eq!(summary.threads_to_stop, 0);
    assert_eq!(summary.reason, SuspendReason::Gc);
}

#[test]
fn preemptive_threads_cost_nothing_to_stop() {
    let fixture = TestFixture::new();
    let _a = fixture.registry.attach(ThreadKind::Mutator);
    let _b = fixture.registry.attach(ThreadKind::Mutator);
    let gc_worker = fixture.registry.attach(ThreadKind::GcWorker);
    gc_worker.enter_cooperative(); // GC workers are never coerced

    fixture.coordinator.suspend_runtime(SuspendReason::GcPrep).unwrap();
    let summary = fixture.coordinator.last_cycle().unwrap();
    assert_eq!(summary.threads_to_stop, 0);
    fixture.coordinator.resume_runtime(false).unwrap();
    gc_worker.leave_cooperative();
}

#[test]
fn resume_without_suspend_is_rejected() {
    let fixture = TestFixture::new();
    assert_eq!(
        fixture.coordinator.resume_runtime(true),
        Err(SuspendError::NotSuspended)
    );

    // And a second resume after a proper cycle must also be rejected;
    // the registry lock is never double-released.
    fixture.coordinator.suspend_runtime(SuspendReason::Gc).unwrap();
    fixture.coordinator.resume_runtime(true).unwrap();
    assert_eq!(
        fixture.coordinator.resume_runtime(true),
        Err(SuspendError::NotSuspended)
    );
}

#[test]
fn cooperative_poll_loop_is_stopped_and_resumed() {
    let fixture = TestFixture::new();
    let thread = fixture.registry.attach(ThreadKind::Mutator);
    let (stop, counter, handle) = spawn_poll_loop(&thread);

    assert!(wait_until(Duration::from_secs(5), || {
        counter.load(Ordering::Relaxed) > 0
    }));

    fixture.coordinator.suspend_runtime(SuspendReason::Gc).unwrap();
    assert!(!thread.is_cooperative());

    // The world is stopped: the loop must not advance.
    let frozen = counter.load(Ordering::Relaxed);
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(counter.load(Ordering::Relaxed), frozen);

    fixture.coordinator.resume_runtime(true).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        counter.load(Ordering::Relaxed) > frozen
    }));

    stop.store(true, Ordering::Relaxed);
    handle.join().unwrap();
    fixture.registry.detach(&thread);
}

#[test]
fn cycle_state_is_reset_after_resume() {
    let fixture = TestFixture::new();
    let thread = fixture.registry.attach(ThreadKind::Mutator);
    let (stop, counter, handle) = spawn_poll_loop(&thread);
    assert!(wait_until(Duration::from_secs(5), || {
        counter.load(Ordering::Relaxed) > 0
    }));

    fixture.coordinator.suspend_runtime(SuspendReason::CodePatch).unwrap();
    fixture.coordinator.resume_runtime(true).unwrap();

    stop.store(true, Ordering::Relaxed);
    handle.join().unwrap();

    // No cycle flags, no live redirection, no crawl markers left behind.
    assert!(!thread
        .state()
        .load()
        .intersects(SuspendState::GC_CYCLE_FLAGS));
    assert!(!thread.redirect_slot().is_occupied());
    assert!(thread.crawl_markers().is_empty());
    fixture.registry.detach(&thread);
}

#[test]
fn overlapping_cycles_serialize_on_the_registry_lock() {
    let fixture = TestFixture::new();
    let coordinator = Arc::clone(&fixture.coordinator);

    coordinator.suspend_runtime(SuspendReason::Gc).unwrap();

    let second = Arc::clone(&coordinator);
    let second_done = Arc::new(AtomicBool::new(false));
    let second_done_clone = Arc::clone(&second_done);
    let handle = std::thread::spawn(move || {
        second.suspend_runtime(SuspendReason::Debugger).unwrap();
        second_done_clone.store(true, Ordering::Release);
        second.resume_runtime(false).unwrap();
    });

    // The second cycle must block behind the first.
    std::thread::sleep(Duration::from_millis(30));
    assert!(!second_done.load(Ordering::Acquire));

    coordinator.resume_runtime(true).unwrap();
    handle.join().unwrap();
    assert!(second_done.load(Ordering::Acquire));
}

#[test]
fn exiting_threads_are_dropped_from_the_cycle() {
    let fixture = TestFixture::new_virtual();
    let ops = fixture.virtual_ops.as_ref().unwrap();
    let thread = fixture.registry.attach(ThreadKind::Mutator);

    // Cooperative, but the OS reports the thread as unsuspendable (it is
    // exiting). The cycle must drop it and converge anyway.
    thread.enter_cooperative();
    ops.fail_next_suspend(&thread);

    fixture.coordinator.suspend_runtime(SuspendReason::Gc).unwrap();
    let summary = fixture.coordinator.last_cycle().unwrap();
    assert_eq!(summary.threads_to_stop, 1);
    assert_eq!(summary.dropped, 1);
    assert_eq!(fixture.coordinator.stats().dropped_threads, 1);

    fixture.coordinator.resume_runtime(true).unwrap();
    thread.leave_cooperative();
}

#[test]
fn redirected_poll_loop_parks_and_cleans_up() {
    let fixture = TestFixture::new_virtual();
    let ops = fixture.virtual_ops.as_ref().unwrap();
    let thread = fixture.registry.attach(ThreadKind::Mutator);
    ops.program_context(&thread, RegisterContext::at(MethodId(1), 64));

    let (stop, counter, handle) = spawn_poll_loop(&thread);
    assert!(wait_until(Duration::from_secs(5), || {
        counter.load(Ordering::Relaxed) > 0
    }));

    fixture.coordinator.suspend_runtime(SuspendReason::Gc).unwrap();
    assert!(!thread.is_cooperative());
    fixture.coordinator.resume_runtime(true).unwrap();

    // Let the thread drain any installed redirection before stopping it.
    assert!(wait_until(Duration::from_secs(5), || {
        !thread.redirect_slot().is_occupied() && !thread.has_pending_activation()
    }));
    stop.store(true, Ordering::Relaxed);
    handle.join().unwrap();

    // Whether the thread rendezvoused voluntarily or through the redirect
    // stub, nothing of the cycle may survive it.
    assert!(!thread.redirect_slot().is_occupied());
    assert!(!thread.state().load().intersects(SuspendState::GC_CYCLE_FLAGS));
    assert!(thread.crawl_markers().is_empty());
    fixture.registry.detach(&thread);
}

#[test]
fn low_priority_driver_is_boosted_for_the_cycle() {
    let fixture = TestFixture::new_virtual();
    let ops = fixture.virtual_ops.as_ref().unwrap();

    let driver = fixture.registry.attach(ThreadKind::Mutator);
    driver.bind_current();
    ops.set_priority(&driver, -2);

    fixture.coordinator.suspend_runtime(SuspendReason::Gc).unwrap();
    assert_eq!(ops.priority(&driver), 0);

    fixture.coordinator.resume_runtime(true).unwrap();
    assert_eq!(ops.priority(&driver), -2);
    fixture.registry.detach(&driver);
}

#[test]
fn stats_accumulate_across_cycles() {
    let fixture = TestFixture::new();
    for _ in 0..3 {
        fixture.coordinator.suspend_runtime(SuspendReason::Gc).unwrap();
        fixture.coordinator.resume_runtime(true).unwrap();
    }
    let stats = fixture.coordinator.stats();
    assert_eq!(stats.cycles, 3);
    assert!(stats.passes >= 3);
}
