//! GC and debugger suspensions overlapping on the same thread set.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use stopworld::context::RegisterContext;
use stopworld::coordinator::SuspendReason;
use stopworld::error::SuspendError;
use stopworld::safepoint_map::MethodId;
use stopworld::test_utils::TestFixture;
use stopworld::thread::ThreadKind;

#[test]
fn gc_and_debugger_requests_share_the_per_thread_state_safely() {
    let fixture = TestFixture::new();
    let debugger = fixture.debugger();
    let stop = Arc::new(AtomicBool::new(false));

    let mut threads = Vec::new();
    let mut handles = Vec::new();
    for _ in 0..4 {
        let thread = fixture.registry.attach(ThreadKind::Mutator);
        let worker = thread.clone();
        let stop_clone = Arc::clone(&stop);
        handles.push(std::thread::spawn(move || {
            worker.bind_current();
            worker.enter_cooperative();
            while !stop_clone.load(Ordering::Relaxed) {
                if worker.poll().is_err() {
                    break;
                }
            }
            worker.leave_cooperative();
        }));
        threads.push(thread);
    }

    // Debugger synchronizes the set, then a GC cycle runs on top of the
    // parked world, repeatedly.
    for _ in 0..5 {
        debugger.start().unwrap();
        assert!(debugger.wait_for_sync(Duration::from_secs(5)));

        fixture
            .coordinator
            .suspend_runtime(SuspendReason::Gc)
            .unwrap();
        for thread in &threads {
            assert!(!thread.is_cooperative());
            // The structural guarantee: the reusable slot admits at most
            // one redirection at any moment, across both coordinators.
            let occupied = thread.redirect_slot().is_occupied();
            if occupied {
                assert_eq!(
                    thread
                        .redirect_slot()
                        .occupy(RegisterContext::at(MethodId(9), 9))
                        .unwrap_err(),
                    SuspendError::RedirectionInFlight
                );
            }
        }
        fixture.coordinator.resume_runtime(true).unwrap();
        debugger.resume_all().unwrap();
    }

    stop.store(true, Ordering::Relaxed);
    for handle in handles {
        handle.join().unwrap();
    }

    for thread in &threads {
        assert!(!thread.redirect_slot().is_occupied());
        assert!(thread.crawl_markers().is_empty());
        fixture.registry.detach(thread);
    }
}

#[test]
fn concurrent_gc_and_debugger_initiation_never_deadlocks() {
    let fixture = TestFixture::new();
    let debugger = fixture.debugger();
    let stop = Arc::new(AtomicBool::new(false));

    let mut threads = Vec::new();
    let mut handles = Vec::new();
    for _ in 0..4 {
        let thread = fixture.registry.attach(ThreadKind::Mutator);
        let worker = thread.clone();
        let stop_clone = Arc::clone(&stop);
        handles.push(std::thread::spawn(move || {
            worker.bind_current();
            worker.enter_cooperative();
            while !stop_clone.load(Ordering::Relaxed) {
                if worker.poll().is_err() {
                    break;
                }
            }
            worker.leave_cooperative();
        }));
        threads.push(thread);
    }

    // Fire both protocols at once from separate threads.
    let coordinator = Arc::clone(&fixture.coordinator);
    let gc = std::thread::spawn(move || {
        for _ in 0..5 {
            coordinator.suspend_runtime(SuspendReason::Gc).unwrap();
            std::thread::sleep(Duration::from_millis(2));
            coordinator.resume_runtime(true).unwrap();
        }
    });
    let debugger_clone = Arc::clone(&debugger);
    let dbg = std::thread::spawn(move || {
        for _ in 0..5 {
            debugger_clone.start().unwrap();
            debugger_clone.wait_for_sync(Duration::from_secs(5));
            debugger_clone.resume_all().unwrap();
        }
    });

    gc.join().unwrap();
    dbg.join().unwrap();

    stop.store(true, Ordering::Relaxed);
    for handle in handles {
        handle.join().unwrap();
    }
    for thread in &threads {
        fixture.registry.detach(thread);
    }
}

#[test]
fn randomized_mode_churn_survives_repeated_cycles() {
    let fixture = TestFixture::new();
    let stop = Arc::new(AtomicBool::new(false));

    let mut threads = Vec::new();
    let mut handles = Vec::new();
    for seed in 0..4u64 {
        let thread = fixture.registry.attach(ThreadKind::Mutator);
        let worker = thread.clone();
        let stop_clone = Arc::clone(&stop);
        handles.push(std::thread::spawn(move || {
            let mut rng = fastrand::Rng::with_seed(seed);
            worker.bind_current();
            while !stop_clone.load(Ordering::Relaxed) {
                worker.enter_cooperative();
                for _ in 0..rng.usize(1..64) {
                    if worker.poll().is_err() {
                        worker.leave_cooperative();
                        return;
                    }
                    if rng.u8(..) < 8 {
                        let _region = worker.forbid_suspend();
                        std::hint::spin_loop();
                    }
                }
                worker.leave_cooperative();
                if rng.u8(..) < 32 {
                    std::thread::yield_now();
                }
            }
        }));
        threads.push(thread);
    }

    for _ in 0..20 {
        fixture
            .coordinator
            .suspend_runtime(SuspendReason::Gc)
            .unwrap();
        for thread in &threads {
            assert!(!thread.is_cooperative());
        }
        fixture.coordinator.resume_runtime(true).unwrap();
    }

    stop.store(true, Ordering::Relaxed);
    for handle in handles {
        handle.join().unwrap();
    }
    for thread in &threads {
        fixture.registry.detach(thread);
    }
}
