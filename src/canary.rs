//! Deadlock-avoidance canary for out-of-band helper threads.
//!
//! A helper thread that must call into allocator-like routines cannot
//! prove that the locks those routines take are free; a suspended managed
//! thread might hold one. Instead of risking the call itself, the helper
//! delegates a probe to an auxiliary canary thread: if the probe blocks on
//! the real lock, only the canary hangs and the helper learns "locks
//! unavailable" from a timeout.
//!
//! The channel is two monotonically increasing counters. The helper bumps
//! `request` and pings; the canary observes `request` ahead of its
//! last-published `answer`, performs the risky call, then publishes
//! `answer = request`. A verdict is cached until explicitly cleared so
//! rapid checks do not re-probe every time.
//!
//! The canary thread is created lazily on first use and never torn down;
//! its lifetime matches the process by design.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use crossbeam_utils::atomic::AtomicCell;
use parking_lot::{Condvar, Mutex};

/// The risky call the canary performs on the helper's behalf.
pub type CanaryProbe = Arc<dyn Fn() + Send + Sync>;

struct CanaryChannel {
    request: AtomicU64,
    answer: AtomicU64,
    ping_lock: Mutex<()>,
    ping_cv: Condvar,
    answer_lock: Mutex<()>,
    answer_cv: Condvar,
    verdict: AtomicCell<Option<bool>>,
    probe: CanaryProbe,
}

/// Lock-availability probe backed by a lazily started canary thread.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use stopworld::canary::LockSafetyCanary;
///
/// let canary = LockSafetyCanary::new(Duration::from_millis(100), || {
///     // the risky call, e.g. a no-op allocation
/// });
/// assert!(canary.check());
/// assert_eq!(canary.cached_verdict(), Some(true));
/// ```
pub struct LockSafetyCanary {
    channel: Arc<CanaryChannel>,
    timeout: Duration,
    worker_started: AtomicBool,
}

impl LockSafetyCanary {
    pub fn new(timeout: Duration, probe: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            channel: Arc::new(CanaryChannel {
                request: AtomicU64::new(0),
                answer: AtomicU64::new(0),
                ping_lock: Mutex::new(()),
                ping_cv: Condvar::new(),
                answer_lock: Mutex::new(()),
                answer_cv: Condvar::new(),
                verdict: AtomicCell::new(None),
                probe: Arc::new(probe),
            }),
            timeout,
            worker_started: AtomicBool::new(false),
        }
    }

    /// Whether the risky locks are currently available.
    ///
    /// Returns the cached verdict when one exists; otherwise pings the
    /// canary and waits at most one timeout period for the answer counter
    /// to catch up. A timeout caches "unavailable" — a policy outcome,
    /// not an error.
    pub fn check(&self) -> bool {
        if let Some(cached) = self.channel.verdict.load() {
            return cached;
        }

        self.ensure_worker();

        let channel = &self.channel;
        let target = channel.request.fetch_add(1, Ordering::AcqRel) + 1;
        {
            let _guard = channel.ping_lock.lock();
            channel.ping_cv.notify_all();
        }

        let deadline = Instant::now() + self.timeout;
        let mut guard = channel.answer_lock.lock();
        while channel.answer.load(Ordering::Acquire) < target {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            channel.answer_cv.wait_for(&mut guard, deadline - now);
        }
        drop(guard);

        let verdict = channel.answer.load(Ordering::Acquire) >= target;
        if !verdict {
            log::warn!("canary probe timed out; reporting locks unavailable");
        }
        channel.verdict.store(Some(verdict));
        verdict
    }

    /// Forget the cached verdict so the next [`check`](Self::check)
    /// re-probes.
    pub fn clear_cache(&self) {
        self.channel.verdict.store(None);
    }

    pub fn cached_verdict(&self) -> Option<bool> {
        self.channel.verdict.load()
    }

    fn ensure_worker(&self) {
        if self.worker_started.swap(true, Ordering::AcqRel) {
            return;
        }

        let channel = Arc::clone(&self.channel);
        // Deliberately detached: if the probe wedges on a held lock the
        // thread hangs with it, and that is the entire point.
        std::thread::Builder::new()
            .name("lock-canary".into())
            .spawn(move || canary_loop(channel))
            .expect("failed to spawn canary thread");
    }
}

fn canary_loop(channel: Arc<CanaryChannel>) {
    loop {
        {
            let mut guard = channel.ping_lock.lock();
            while channel.request.load(Ordering::Acquire)
                <= channel.answer.load(Ordering::Acquire)
            {
                channel.ping_cv.wait(&mut guard);
            }
        }

        let target = channel.request.load(Ordering::Acquire);
        // May block indefinitely if the real lock is held; the helper's
        // timeout covers for us.
        (channel.probe)();

        channel.answer.store(target, Ordering::Release);
        let _guard = channel.answer_lock.lock();
        channel.answer_cv.notify_all();
    }
}
