//! Root discovery against live threads.

#![cfg(any(target_os = "linux", target_os = "android", windows))]

use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use gc_threads::{
    approximate_sp, AllocatorHooks, CollectedRoots, CollectorRuntime, LocalAllocBlob, RegistryMode,
    RootSink, RuntimeConfig, ThreadKey, ThreadRecord,
};

fn serial() -> Arc<CollectorRuntime> {
    CollectorRuntime::init(RuntimeConfig::new().parallel_mark(false)).unwrap()
}

#[test]
fn test_suspended_worker_stack_is_pushed() {
    let runtime = serial();
    let stop = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();
    let worker = {
        let runtime = Arc::clone(&runtime);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            runtime.register_current_thread().unwrap();
            let local = 0xdead_beef_usize;
            tx.send((ThreadKey::current(), ptr::addr_of!(local) as usize)).unwrap();
            while !stop.load(Ordering::Acquire) {
                std::hint::spin_loop();
            }
            std::hint::black_box(&local);
            runtime.unregister_thread().unwrap();
        })
    };
    let (id, addr) = rx.recv().unwrap();

    let mut roots = CollectedRoots::with_capacity(16, 256);
    let bytes = runtime.with_world_stopped(|world| {
        let rec = runtime.registry().lookup(id).unwrap();
        world.runtime().push_stack_for(world.guard(), &rec, &mut roots)
    });
    assert!(bytes > 0);
    assert!(roots.covers(addr));
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "x86"))]
    assert!(!roots.registers.is_empty());

    stop.store(true, Ordering::Release);
    worker.join().unwrap();
}

#[test]
#[cfg(any(target_os = "linux", target_os = "android"))]
fn test_push_all_stacks_sums_every_thread() {
    let runtime = serial();
    let stop = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();
    let workers: Vec<_> = (0..2)
        .map(|_| {
            let runtime = Arc::clone(&runtime);
            let stop = Arc::clone(&stop);
            let tx = tx.clone();
            thread::spawn(move || {
                runtime.register_current_thread().unwrap();
                tx.send(()).unwrap();
                while !stop.load(Ordering::Acquire) {
                    std::hint::spin_loop();
                }
                runtime.unregister_thread().unwrap();
            })
        })
        .collect();
    rx.iter().take(2).for_each(drop);

    let me = ThreadKey::current();
    let mut roots = CollectedRoots::with_capacity(16, 256);
    let (total, others, self_end, here, scanned) = runtime.with_world_stopped(|world| {
        let mut others = 0;
        let mut suspended = 0;
        let mut self_end = 0;
        runtime.registry().for_each(&mut |rec| {
            if rec.id() == me {
                self_end = rec.stack_end();
            } else if let Some(ctx) = rec.context() {
                assert!(ctx.trustworthy);
                others += rec.stack_end() - ctx.sp;
                suspended += 1;
            }
        });
        assert_eq!(suspended, 2);
        let here = approximate_sp();
        let total = world.push_all_stacks(&mut roots);
        (total, others, self_end, here, world.runtime().metrics().bytes_scanned)
    });

    assert_eq!(scanned, total);
    let own = total - others;
    assert!(own >= self_end - here);
    assert!(own < self_end - here + 64 * 1024);

    stop.store(true, Ordering::Release);
    for worker in workers {
        worker.join().unwrap();
    }
}

#[test]
fn test_thread_attached_during_stop_is_rescanned() {
    let runtime = CollectorRuntime::init(RuntimeConfig::new().mode(RegistryMode::Discovery)).unwrap();
    let (tx, rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let mut first = CollectedRoots::with_capacity(16, 256);
    let mut second = CollectedRoots::with_capacity(16, 256);
    let (late, flagged_again) = runtime.with_world_stopped(|world| {
        assert!(!runtime.started_thread_while_stopped());
        let late = {
            let runtime = Arc::clone(&runtime);
            thread::spawn(move || {
                runtime.on_thread_attach();
                let local = 0x5eed_usize;
                tx.send(ptr::addr_of!(local) as usize).unwrap();
                release_rx.recv().unwrap();
                std::hint::black_box(&local);
                runtime.on_thread_detach();
            })
        };
        let addr = rx.recv().unwrap();

        world.push_all_stacks(&mut first);
        assert!(!first.covers(addr));
        assert!(runtime.started_thread_while_stopped());

        assert_eq!(world.suspend_late_arrivals(), 1);
        world.push_all_stacks(&mut second);
        assert!(second.covers(addr));
        (late, runtime.started_thread_while_stopped())
    });
    assert!(!flagged_again);

    release_tx.send(()).unwrap();
    late.join().unwrap();
    assert_eq!(runtime.thread_count(), 1);
}

#[test]
fn test_blocking_worker_scanned_from_saved_sp() {
    let runtime = serial();
    let (tx, rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let worker = {
        let runtime = Arc::clone(&runtime);
        thread::spawn(move || {
            runtime.register_current_thread().unwrap();
            let outer = 7usize;
            let outer_addr = ptr::addr_of!(outer) as usize;
            runtime.do_blocking(|| {
                tx.send((ThreadKey::current(), outer_addr)).unwrap();
                release_rx.recv().unwrap();
            });
            std::hint::black_box(&outer);
            runtime.unregister_thread().unwrap();
        })
    };
    let (id, outer_addr) = rx.recv().unwrap();

    let mut roots = CollectedRoots::with_capacity(16, 256);
    let (bytes, saved, end) = runtime.with_world_stopped(|world| {
        let rec = runtime.registry().lookup(id).unwrap();
        let bytes = world.runtime().push_stack_for(world.guard(), &rec, &mut roots);
        (bytes, rec.stack_ptr(), rec.stack_end())
    });
    assert_eq!(bytes, end - saved);
    assert_eq!(roots.ranges, vec![(saved, end)]);
    assert!(roots.covers(outer_addr));
    // No register snapshot for a thread that was never suspended.
    assert!(roots.registers.is_empty());

    release_tx.send(()).unwrap();
    worker.join().unwrap();
}

#[test]
fn test_gc_active_section_splits_stack() {
    let runtime = serial();
    let stop = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();
    let worker = {
        let runtime = Arc::clone(&runtime);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            runtime.register_current_thread().unwrap();
            let outer = 1usize;
            let outer_addr = ptr::addr_of!(outer) as usize;
            runtime.do_blocking(|| {
                runtime.call_with_gc_active(|| {
                    let inner = 2usize;
                    tx.send((ThreadKey::current(), outer_addr, ptr::addr_of!(inner) as usize))
                        .unwrap();
                    while !stop.load(Ordering::Acquire) {
                        std::hint::spin_loop();
                    }
                    std::hint::black_box(&inner);
                });
            });
            std::hint::black_box(&outer);
            runtime.unregister_thread().unwrap();
        })
    };
    let (id, outer_addr, inner_addr) = rx.recv().unwrap();

    let mut roots = CollectedRoots::with_capacity(16, 256);
    runtime.with_world_stopped(|world| {
        let rec = runtime.registry().lookup(id).unwrap();
        assert!(rec.is_suspended());
        assert!(!rec.traced_stack_sect().is_null());
        world.runtime().push_stack_for(world.guard(), &rec, &mut roots);
    });
    assert_eq!(roots.ranges.len(), 2);
    assert!(roots.covers(inner_addr));
    assert!(roots.covers(outer_addr));
    // The gap between the section and the saved stack pointer is skipped.
    let (_, first_hi) = roots.ranges[0];
    let (second_lo, _) = roots.ranges[1];
    assert!(first_hi <= second_lo);

    stop.store(true, Ordering::Release);
    worker.join().unwrap();
}

#[test]
fn test_thread_structures_reach_hooks() {
    struct Marked(usize);

    struct PushBlob;

    impl AllocatorHooks for PushBlob {
        fn init_thread_local(&self, _record: &ThreadRecord) -> Option<LocalAllocBlob> {
            Some(LocalAllocBlob::new(Marked(0x1000)))
        }

        fn mark_thread_local(&self, blob: &LocalAllocBlob, sink: &mut dyn RootSink) {
            if let Some(marked) = blob.downcast_ref::<Marked>() {
                sink.push_range(marked.0, marked.0 + 8);
            }
        }
    }

    let runtime = CollectorRuntime::init(
        RuntimeConfig::new()
            .parallel_mark(false)
            .hooks(Arc::new(PushBlob)),
    )
    .unwrap();
    let mut roots = CollectedRoots::with_capacity(4, 0);
    runtime.with_world_stopped(|world| world.push_thread_structures(&mut roots));
    assert_eq!(roots.ranges, vec![(0x1000, 0x1008)]);
}

#[test]
fn test_next_stack_walks_every_thread() {
    let runtime = serial();
    let stop = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();
    let worker = {
        let runtime = Arc::clone(&runtime);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            runtime.register_current_thread().unwrap();
            tx.send(()).unwrap();
            while !stop.load(Ordering::Acquire) {
                std::hint::spin_loop();
            }
            runtime.unregister_thread().unwrap();
        })
    };
    rx.recv().unwrap();

    let mut stacks = Vec::with_capacity(4);
    runtime.with_world_stopped(|world| {
        let mut start = 0;
        while let Some((lo, hi)) = world.next_stack(start, gc_threads::ADDR_LIMIT) {
            assert!(lo < hi);
            if stacks.len() < stacks.capacity() {
                stacks.push((lo, hi));
            }
            start = hi;
        }
    });
    assert_eq!(stacks.len(), 2);
    assert!(stacks[0].1 < stacks[1].1);

    stop.store(true, Ordering::Release);
    worker.join().unwrap();
}
