//! Abort injection against running threads.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use stopworld::abort::AbortPhase;
use stopworld::error::SuspendError;
use stopworld::test_utils::TestFixture;
use stopworld::thread::{AbortKind, ThreadKind};

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
fn protected_region_shields_until_exit() {
    let fixture = TestFixture::new();
    let controller = fixture.abort_controller();

    let thread = fixture.registry.attach(ThreadKind::Mutator);
    let worker = thread.clone();
    let in_region = Arc::new(AtomicBool::new(true));
    let in_region_clone = Arc::clone(&in_region);
    let protected_polls = Arc::new(AtomicUsize::new(0));
    let polls_clone = Arc::clone(&protected_polls);
    let aborted_inside_region = Arc::new(AtomicBool::new(false));
    let aborted_inside_clone = Arc::clone(&aborted_inside_region);

    let handle = std::thread::spawn(move || {
        worker.bind_current();
        worker.enter_cooperative();
        {
            let _guard = worker.enter_protected_region();
            while in_region_clone.load(Ordering::Relaxed) {
                polls_clone.fetch_add(1, Ordering::Relaxed);
                if worker.poll().is_err() {
                    aborted_inside_clone.store(true, Ordering::Release);
                    worker.leave_cooperative();
                    return;
                }
            }
        }
        // First poll after the region: the abort lands here.
        loop {
            if worker.poll().is_err() {
                break;
            }
        }
        worker.leave_cooperative();
    });

    assert!(wait_until(Duration::from_secs(5), || {
        protected_polls.load(Ordering::Relaxed) > 0
    }));

    controller
        .request_abort(&thread, AbortKind::Normal)
        .unwrap();

    // Polls inside the region never observe the abort.
    let before = protected_polls.load(Ordering::Relaxed);
    assert!(wait_until(Duration::from_secs(5), || {
        protected_polls.load(Ordering::Relaxed) > before + 100
    }));
    assert_eq!(controller.phase(&thread), AbortPhase::Requested);

    // Leaving the region, the abort is observed immediately.
    in_region.store(false, Ordering::Relaxed);
    handle.join().unwrap();
    assert!(!aborted_inside_region.load(Ordering::Acquire));
    assert_eq!(controller.phase(&thread), AbortPhase::Initiated);

    controller.complete_abort(&thread);
    assert_eq!(controller.phase(&thread), AbortPhase::Completed);
    fixture.registry.detach(&thread);
}

#[test]
fn drive_waits_out_an_unsafe_target() {
    let fixture = TestFixture::new();
    let controller = fixture.abort_controller();

    let thread = fixture.registry.attach(ThreadKind::Mutator);
    let worker = thread.clone();
    let release = Arc::new(AtomicBool::new(false));
    let release_clone = Arc::clone(&release);
    let running = Arc::new(AtomicBool::new(false));
    let running_clone = Arc::clone(&running);

    let handle = std::thread::spawn(move || {
        worker.bind_current();
        worker.enter_cooperative();
        {
            let _guard = worker.enter_protected_region();
            running_clone.store(true, Ordering::Release);
            while !release_clone.load(Ordering::Relaxed) {
                let _ = worker.poll();
            }
        }
        loop {
            if worker.poll().is_err() {
                break;
            }
        }
        worker.leave_cooperative();
    });

    assert!(wait_until(Duration::from_secs(5), || {
        running.load(Ordering::Acquire)
    }));

    controller
        .request_abort(&thread, AbortKind::Normal)
        .unwrap();

    // While the region holds, drive gives up after its bounded wait.
    assert_eq!(
        controller.drive(&thread, Duration::from_millis(50)),
        Err(SuspendError::AbortDeferred)
    );

    release.store(true, Ordering::Relaxed);
    controller.drive(&thread, Duration::from_secs(5)).unwrap();
    handle.join().unwrap();
    fixture.registry.detach(&thread);
}

#[test]
fn aborted_worker_leaves_a_counting_loop() {
    let fixture = TestFixture::new();
    let controller = fixture.abort_controller();

    let thread = fixture.registry.attach(ThreadKind::Mutator);
    let worker = thread.clone();
    let counter = Arc::new(AtomicUsize::new(0));
    let counter_clone = Arc::clone(&counter);

    let handle = std::thread::spawn(move || {
        worker.bind_current();
        worker.enter_cooperative();
        loop {
            counter_clone.fetch_add(1, Ordering::Relaxed);
            if let Err(abort) = worker.poll() {
                worker.leave_cooperative();
                return Some(abort.kind);
            }
        }
    });

    assert!(wait_until(Duration::from_secs(5), || {
        counter.load(Ordering::Relaxed) > 0
    }));

    controller.request_abort(&thread, AbortKind::Normal).unwrap();
    let observed = handle.join().unwrap();
    assert_eq!(observed, Some(AbortKind::Normal));

    // Once unwound, the loop is gone for good.
    let after = counter.load(Ordering::Relaxed);
    std::thread::sleep(Duration::from_millis(10));
    assert_eq!(counter.load(Ordering::Relaxed), after);
    fixture.registry.detach(&thread);
}
