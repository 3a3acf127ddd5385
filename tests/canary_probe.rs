//! Canary verdicts under held and released locks.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use stopworld::canary::LockSafetyCanary;

#[test]
fn permanently_held_lock_always_reports_unavailable_within_timeout() {
    let lock = Arc::new(Mutex::new(()));
    let guard = lock.lock();

    let lock_clone = Arc::clone(&lock);
    let canary = LockSafetyCanary::new(Duration::from_millis(60), move || {
        let _probe = lock_clone.lock();
    });

    for _ in 0..3 {
        canary.clear_cache();
        let started = Instant::now();
        assert!(!canary.check());
        // At or before the timeout, with a modest scheduling allowance.
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    drop(guard);
}

#[test]
fn cache_clear_forces_a_fresh_probe() {
    let probes = Arc::new(AtomicUsize::new(0));
    let gate_open = Arc::new(AtomicBool::new(false));

    let probes_clone = Arc::clone(&probes);
    let gate_clone = Arc::clone(&gate_open);
    let canary = LockSafetyCanary::new(Duration::from_millis(60), move || {
        probes_clone.fetch_add(1, Ordering::SeqCst);
        while !gate_clone.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }
    });

    // First probe wedges on the gate: verdict is "unavailable" and it is
    // served from cache on rapid re-checks.
    assert!(!canary.check());
    assert!(!canary.check());
    assert!(!canary.check());
    assert_eq!(probes.load(Ordering::SeqCst), 1);
    assert_eq!(canary.cached_verdict(), Some(false));

    // Open the gate so the wedged probe drains, then force a re-probe.
    gate_open.store(true, Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(20));
    canary.clear_cache();
    assert_eq!(canary.cached_verdict(), None);

    assert!(canary.check());
    assert!(probes.load(Ordering::SeqCst) >= 2);
    assert_eq!(canary.cached_verdict(), Some(true));
}
