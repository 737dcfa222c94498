//! Benchmark: stop/start cycle cost as the number of registered threads
//! grows, with and without root discovery.

use std::hint::black_box;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use gc_threads::{CollectedRoots, CollectorRuntime, RuntimeConfig};

struct Workers {
    stop: Arc<AtomicBool>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl Workers {
    fn start(runtime: &Arc<CollectorRuntime>, n: usize) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let barrier = Arc::new(Barrier::new(n + 1));
        let handles = (0..n)
            .map(|_| {
                let runtime = Arc::clone(runtime);
                let stop = Arc::clone(&stop);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    runtime.register_current_thread().unwrap();
                    barrier.wait();
                    while !stop.load(Ordering::Acquire) {
                        std::hint::spin_loop();
                    }
                    runtime.unregister_thread().unwrap();
                })
            })
            .collect();
        barrier.wait();
        Self { stop, handles }
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn bench_stop_start(c: &mut Criterion) {
    let mut group = c.benchmark_group("stop_start");
    for threads in [0, 2, 8] {
        let runtime = CollectorRuntime::init(RuntimeConfig::new().parallel_mark(false)).unwrap();
        let _workers = Workers::start(&runtime, threads);
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, _| {
            b.iter(|| {
                let guard = runtime.lock();
                black_box(runtime.stop_world(&guard));
                black_box(runtime.start_world(&guard));
            });
        });
    }
    group.finish();
}

fn bench_collect_roots(c: &mut Criterion) {
    let mut group = c.benchmark_group("collect_roots");
    for threads in [0, 2, 8] {
        let runtime = CollectorRuntime::init(RuntimeConfig::new().parallel_mark(false)).unwrap();
        let _workers = Workers::start(&runtime, threads);
        let mut roots = CollectedRoots::with_capacity(threads + 1, 64 * (threads + 1));
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, _| {
            b.iter(|| {
                roots.ranges.clear();
                roots.registers.clear();
                black_box(runtime.with_world_stopped(|world| world.push_all_stacks(&mut roots)));
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_stop_start, bench_collect_roots);
criterion_main!(benches);
