//! Stop-the-world behaviour with real threads.
//!
//! Workers spin on an atomic flag instead of blocking or allocating, so a
//! suspended worker never holds a lock the collecting thread needs.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::Duration;

use gc_threads::{CollectedRoots, CollectorRuntime, RegistryMode, RuntimeConfig, ThreadKey};

fn serial() -> Arc<CollectorRuntime> {
    CollectorRuntime::init(RuntimeConfig::new().parallel_mark(false)).unwrap()
}

/// Start `n` registered workers that spin until `stop` is set. Returns
/// once every worker is registered.
fn spinning_workers(
    runtime: &Arc<CollectorRuntime>,
    n: usize,
    stop: &Arc<AtomicBool>,
) -> (Vec<thread::JoinHandle<()>>, Vec<ThreadKey>) {
    let barrier = Arc::new(Barrier::new(n + 1));
    let (tx, rx) = mpsc::channel();
    let handles = (0..n)
        .map(|_| {
            let runtime = Arc::clone(runtime);
            let stop = Arc::clone(stop);
            let barrier = Arc::clone(&barrier);
            let tx = tx.clone();
            thread::spawn(move || {
                runtime.register_current_thread().unwrap();
                tx.send(ThreadKey::current()).unwrap();
                barrier.wait();
                while !stop.load(Ordering::Acquire) {
                    std::hint::spin_loop();
                }
                runtime.unregister_thread().unwrap();
            })
        })
        .collect();
    barrier.wait();
    let ids = rx.iter().take(n).collect();
    (handles, ids)
}

#[test]
fn test_all_workers_suspended_then_resumed() {
    let runtime = serial();
    let stop = Arc::new(AtomicBool::new(false));
    let (handles, ids) = spinning_workers(&runtime, 4, &stop);

    runtime.with_world_stopped(|world| {
        assert!(world.runtime().is_world_stopped());
        for id in &ids {
            let rec = runtime.registry().lookup(*id).unwrap();
            assert!(rec.is_suspended());
            assert!(rec.context().is_some());
        }
    });
    assert!(!runtime.is_world_stopped());

    let metrics = runtime.metrics();
    assert_eq!(metrics.threads_suspended, 4);
    assert_eq!(metrics.collections, 1);
    {
        let _guard = runtime.lock();
        for id in &ids {
            let rec = runtime.registry().lookup(*id).unwrap();
            assert!(!rec.is_suspended());
            assert_eq!(rec.suspend_count(), 1);
            assert_eq!(rec.resume_count(), 1);
        }
    }

    stop.store(true, Ordering::Release);
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(runtime.thread_count(), 1);
}

#[test]
fn test_workers_keep_running_between_stops() {
    let runtime = serial();
    let stop = Arc::new(AtomicBool::new(false));
    let progress = Arc::new(AtomicUsize::new(0));
    let worker = {
        let runtime = Arc::clone(&runtime);
        let stop = Arc::clone(&stop);
        let progress = Arc::clone(&progress);
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            runtime.register_current_thread().unwrap();
            tx.send(()).unwrap();
            while !stop.load(Ordering::Acquire) {
                progress.fetch_add(1, Ordering::Relaxed);
            }
            runtime.unregister_thread().unwrap();
        });
        rx.recv().unwrap();
        handle
    };

    for _ in 0..20 {
        runtime.with_world_stopped(|_| {
            let before = progress.load(Ordering::Relaxed);
            thread::sleep(Duration::from_millis(1));
            // Suspended: no progress while stopped.
            assert_eq!(progress.load(Ordering::Relaxed), before);
        });
        let before = progress.load(Ordering::Relaxed);
        while progress.load(Ordering::Relaxed) == before {
            std::hint::spin_loop();
        }
    }
    assert_eq!(runtime.metrics().collections, 20);

    stop.store(true, Ordering::Release);
    worker.join().unwrap();
}

#[test]
fn test_blocking_thread_is_skipped() {
    let runtime = serial();
    let (ready_tx, ready_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let worker = {
        let runtime = Arc::clone(&runtime);
        thread::spawn(move || {
            runtime.register_current_thread().unwrap();
            let me = ThreadKey::current();
            runtime.do_blocking(|| {
                ready_tx.send(me).unwrap();
                release_rx.recv().unwrap();
            });
            runtime.unregister_thread().unwrap();
        })
    };
    let id = ready_rx.recv().unwrap();

    runtime.with_world_stopped(|_| {
        let rec = runtime.registry().lookup(id).unwrap();
        assert!(rec.is_blocking());
        assert!(!rec.is_suspended());
    });
    let metrics = runtime.metrics();
    assert_eq!(metrics.threads_suspended, 0);
    assert_eq!(metrics.threads_blocking_skipped, 1);

    release_tx.send(()).unwrap();
    worker.join().unwrap();
}

#[test]
fn test_leaving_blocking_waits_for_restart() {
    let runtime = serial();
    let (ready_tx, ready_rx) = mpsc::channel();
    let left = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));
    let worker = {
        let runtime = Arc::clone(&runtime);
        let left = Arc::clone(&left);
        let release = Arc::clone(&release);
        thread::spawn(move || {
            runtime.register_current_thread().unwrap();
            runtime.do_blocking(|| {
                ready_tx.send(()).unwrap();
                while !release.load(Ordering::Acquire) {
                    std::hint::spin_loop();
                }
            });
            left.store(true, Ordering::Release);
            runtime.unregister_thread().unwrap();
        })
    };
    ready_rx.recv().unwrap();

    runtime.with_world_stopped(|_| {
        release.store(true, Ordering::Release);
        thread::sleep(Duration::from_millis(20));
        // The worker is stuck acquiring the allocation lock.
        assert!(!left.load(Ordering::Acquire));
    });
    worker.join().unwrap();
    assert!(left.load(Ordering::Acquire));
}

#[test]
fn test_exited_thread_is_neutralized_and_reclaimed() {
    let runtime = serial();
    let id = {
        let runtime = Arc::clone(&runtime);
        // Registers and exits without unregistering.
        thread::spawn(move || {
            runtime.register_current_thread().unwrap();
            ThreadKey::current()
        })
        .join()
        .unwrap()
    };
    assert_eq!(runtime.thread_count(), 2);

    runtime.with_world_stopped(|_| {
        assert!(runtime.registry().lookup(id).is_none());
    });
    assert_eq!(runtime.thread_count(), 1);
    assert_eq!(runtime.metrics().threads_exited_while_stopping, 1);
}

#[test]
fn test_discovery_mode_stop() {
    let runtime = CollectorRuntime::init(RuntimeConfig::new().mode(RegistryMode::Discovery)).unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let (handles, ids) = spinning_workers(&runtime, 3, &stop);

    runtime.with_world_stopped(|_| {
        for id in &ids {
            assert!(runtime.registry().lookup(*id).unwrap().is_suspended());
        }
    });
    assert_eq!(runtime.metrics().threads_suspended, 3);

    stop.store(true, Ordering::Release);
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(runtime.thread_count(), 1);
}

#[test]
fn test_collect_with_runs_mark_work_once_per_participant() {
    let runtime = CollectorRuntime::init(RuntimeConfig::new().markers(3)).unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let (handles, _) = spinning_workers(&runtime, 2, &stop);

    let calls = AtomicUsize::new(0);
    let mut roots = CollectedRoots::with_capacity(16, 256);
    let bytes = runtime.collect_with(&mut roots, &|_| {
        calls.fetch_add(1, Ordering::SeqCst);
    });
    assert!(bytes > 0);
    // The caller and both workers.
    assert!(roots.ranges.len() >= 3);
    let participants = calls.load(Ordering::SeqCst);
    assert!(participants >= 1);
    assert!(participants <= runtime.markers().helpers() + 1);
    assert_eq!(runtime.metrics().threads_suspended, 2);

    stop.store(true, Ordering::Release);
    for handle in handles {
        handle.join().unwrap();
    }
}
