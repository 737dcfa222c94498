//! Registration from many threads, in both registry modes.

use std::sync::{Arc, Barrier};
use std::thread;

use gc_threads::{
    CollectorRuntime, RegisterStatus, RegistryError, RegistryMode, RuntimeConfig, StackBase,
    ThreadError,
};

fn register_many(runtime: &Arc<CollectorRuntime>, n: usize) {
    let barrier = Arc::new(Barrier::new(n + 1));
    let done = Arc::new(Barrier::new(n + 1));
    let handles: Vec<_> = (0..n)
        .map(|_| {
            let runtime = Arc::clone(runtime);
            let barrier = Arc::clone(&barrier);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                assert_eq!(runtime.register_current_thread().unwrap(), RegisterStatus::Success);
                assert!(runtime.is_thread_registered());
                barrier.wait();
                done.wait();
                runtime.unregister_thread().unwrap();
                assert!(!runtime.is_thread_registered());
            })
        })
        .collect();

    barrier.wait();
    assert_eq!(runtime.thread_count(), n + 1);
    done.wait();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(runtime.thread_count(), 1);
}

#[test]
fn test_explicit_concurrent_registration() {
    let runtime = CollectorRuntime::init(RuntimeConfig::new().parallel_mark(false)).unwrap();
    register_many(&runtime, 16);
}

#[test]
fn test_discovery_concurrent_registration() {
    let runtime = CollectorRuntime::init(
        RuntimeConfig::new()
            .mode(RegistryMode::Discovery)
            .discovery_capacity(32),
    )
    .unwrap();
    register_many(&runtime, 16);
    // Slots are reused: a second wave fits as well.
    register_many(&runtime, 16);
}

#[test]
fn test_discovery_capacity_exhausted() {
    let runtime = CollectorRuntime::init(
        RuntimeConfig::new()
            .mode(RegistryMode::Discovery)
            .discovery_capacity(1),
    )
    .unwrap();
    let rt = Arc::clone(&runtime);
    let err = thread::spawn(move || rt.register_current_thread())
        .join()
        .unwrap()
        .unwrap_err();
    assert_eq!(err, ThreadError::Registry(RegistryError::Full { capacity: 1 }));
    assert_eq!(runtime.thread_count(), 1);
}

#[test]
fn test_explicit_stack_base_is_recorded() {
    let runtime = CollectorRuntime::init(RuntimeConfig::new().parallel_mark(false)).unwrap();
    let rt = Arc::clone(&runtime);
    thread::spawn(move || {
        let probed = gc_threads::current_stack_base().unwrap();
        let base = StackBase::new(probed.mem_base - 256);
        assert_eq!(rt.register_thread(base).unwrap(), RegisterStatus::Success);
        assert_eq!(rt.get_my_stackbottom().unwrap().mem_base, base.mem_base);
        assert_eq!(rt.register_thread(probed).unwrap(), RegisterStatus::Duplicate);
        // A duplicate leaves the record alone.
        assert_eq!(rt.get_my_stackbottom().unwrap().mem_base, base.mem_base);
        rt.unregister_thread().unwrap();
        assert_eq!(rt.get_my_stackbottom(), Err(ThreadError::NotRegistered));
    })
    .join()
    .unwrap();
}

#[test]
fn test_unregistered_thread_errors() {
    let runtime = CollectorRuntime::init(RuntimeConfig::new().parallel_mark(false)).unwrap();
    let rt = Arc::clone(&runtime);
    thread::spawn(move || {
        assert!(!rt.is_thread_registered());
        assert_eq!(rt.unregister_thread(), Err(ThreadError::NotRegistered));
        // Runs the closure directly.
        assert_eq!(rt.do_blocking(|| 3), 3);
        assert_eq!(rt.call_with_gc_active(|| 4), 4);
    })
    .join()
    .unwrap();
}

#[test]
fn test_thread_ids_are_distinct() {
    let runtime = CollectorRuntime::init(RuntimeConfig::new().parallel_mark(false)).unwrap();
    let barrier = Arc::new(Barrier::new(5));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let rt = Arc::clone(&runtime);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                rt.register_current_thread().unwrap();
                barrier.wait();
                barrier.wait();
                rt.unregister_thread().unwrap();
            })
        })
        .collect();
    barrier.wait();
    let mut ids = Vec::new();
    runtime.for_each_thread(&mut |rec| ids.push(rec.id()));
    ids.sort_by_key(|id| id.0);
    ids.dedup();
    assert_eq!(ids.len(), 5);
    barrier.wait();
    for handle in handles {
        handle.join().unwrap();
    }
}
