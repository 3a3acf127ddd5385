use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use stopworld::coordinator::SuspendReason;
use stopworld::test_utils::TestFixture;
use stopworld::thread::ThreadKind;

fn bench_poll_fast_path(c: &mut Criterion) {
    let fixture = TestFixture::new();
    let thread = fixture.registry.attach(ThreadKind::Mutator);
    thread.enter_cooperative();

    c.bench_function("poll_fast_path", |b| {
        b.iter(|| {
            for _ in 0..1000 {
                std::hint::black_box(thread.poll().is_ok());
            }
        });
    });

    thread.leave_cooperative();
}

fn bench_suspend_resume_empty(c: &mut Criterion) {
    let fixture = TestFixture::new();

    c.bench_function("suspend_resume_no_threads", |b| {
        b.iter(|| {
            fixture
                .coordinator
                .suspend_runtime(SuspendReason::Gc)
                .unwrap();
            fixture.coordinator.resume_runtime(true).unwrap();
        });
    });
}

fn bench_suspend_resume_four_pollers(c: &mut Criterion) {
    let fixture = TestFixture::new();
    let stop = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::new();
    let mut threads = Vec::new();

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

    c.bench_function("suspend_resume_four_pollers", |b| {
        b.iter(|| {
            fixture
                .coordinator
                .suspend_runtime(SuspendReason::Gc)
                .unwrap();
            fixture.coordinator.resume_runtime(true).unwrap();
        });
    });

    stop.store(true, Ordering::Relaxed);
    for handle in handles {
        handle.join().unwrap();
    }
    for thread in &threads {
        fixture.registry.detach(thread);
    }
}

criterion_group!(
    benches,
    bench_poll_fast_path,
    bench_suspend_resume_empty,
    bench_suspend_resume_four_pollers
);
criterion_main!(benches);
