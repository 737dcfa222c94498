//! Parallel mark coordination through the runtime.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use gc_threads::{CollectorRuntime, RuntimeConfig};

#[test]
fn test_passes_use_distinct_participants() {
    let runtime = CollectorRuntime::init(RuntimeConfig::new().markers(4)).unwrap();
    let helpers = runtime.start_mark_threads();
    assert_eq!(helpers, 3);
    assert!(runtime.markers().is_parallel());
    assert_eq!(runtime.markers().helper_threads().len(), 3);

    for _ in 0..50 {
        let seen = Mutex::new(Vec::with_capacity(4));
        runtime.markers().do_parallel_mark(&|i| {
            seen.lock().unwrap().push(i);
        });
        let mut seen = seen.into_inner().unwrap();
        seen.sort_unstable();
        let before = seen.len();
        seen.dedup();
        assert_eq!(seen.len(), before);
        assert_eq!(seen[0], 0);
        assert!(seen.iter().all(|&i| i <= helpers));
    }
    assert!(runtime.markers().mark_no() >= 50);
}

#[test]
fn test_pass_waits_for_every_participant() {
    let runtime = CollectorRuntime::init(RuntimeConfig::new().markers(3)).unwrap();
    runtime.start_mark_threads();
    let running = AtomicUsize::new(0);
    let finished = AtomicUsize::new(0);
    let joined = AtomicUsize::new(0);
    runtime.markers().do_parallel_mark(&|_| {
        joined.fetch_add(1, Ordering::SeqCst);
        running.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(5));
        running.fetch_sub(1, Ordering::SeqCst);
        finished.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(running.load(Ordering::SeqCst), 0);
    assert_eq!(finished.load(Ordering::SeqCst), joined.load(Ordering::SeqCst));
}

#[test]
fn test_wait_for_reclaim_blocks_on_builders() {
    let runtime = CollectorRuntime::init(RuntimeConfig::new().markers(2)).unwrap();
    runtime.start_mark_threads();
    runtime.markers().begin_reclaim();

    let done = Arc::new(AtomicBool::new(false));
    let waiter = {
        let runtime = Arc::clone(&runtime);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            runtime.markers().wait_for_reclaim();
            done.store(true, Ordering::SeqCst);
        })
    };
    thread::sleep(Duration::from_millis(20));
    assert!(!done.load(Ordering::SeqCst));
    runtime.markers().end_reclaim();
    waiter.join().unwrap();
    assert!(done.load(Ordering::SeqCst));
}

#[test]
fn test_disabled_pool_runs_work_on_caller() {
    let runtime = CollectorRuntime::init(RuntimeConfig::new().markers(4)).unwrap();
    runtime.markers().disable("test");
    assert_eq!(runtime.start_mark_threads(), 0);
    assert!(!runtime.markers().is_parallel());

    let calls = AtomicUsize::new(0);
    let caller = thread::current().id();
    runtime.markers().do_parallel_mark(&|i| {
        assert_eq!(i, 0);
        assert_eq!(thread::current().id(), caller);
        calls.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_stop_world_with_helpers_running() {
    let runtime = CollectorRuntime::init(RuntimeConfig::new().markers(3)).unwrap();
    runtime.start_mark_threads();
    // Helpers are not application threads: nothing to suspend.
    let suspended = runtime.with_world_stopped(|world| world.runtime().metrics().threads_suspended);
    assert_eq!(suspended, 0);
    let mut stacks = 0;
    runtime.with_world_stopped(|world| {
        let mut start = 0;
        while let Some((_, hi)) = world.next_stack(start, gc_threads::ADDR_LIMIT) {
            stacks += 1;
            start = hi;
        }
    });
    // The caller plus both helpers.
    assert_eq!(stacks, 3);
}
