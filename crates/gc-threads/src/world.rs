//! Stopping and restarting the world.
//!
//! Between the first suspend and the last resume nothing here allocates,
//! frees, or writes to stderr: a suspended thread may hold the lock any of
//! those need. Records of threads found dead are neutralised in place and
//! reclaimed by [`CollectorRuntime::start_world`]; warnings are queued and
//! printed there too.

use std::fmt;
use std::sync::atomic::{fence, Ordering};

use crate::config::RegistryMode;
use crate::fatal;
use crate::marker::MarkGuard;
use crate::metrics::PauseTimer;
use crate::os::SuspendOutcome;
use crate::record::{ThreadKey, ThreadRecord};
use crate::roots::RootSink;
use crate::runtime::CollectorRuntime;
use crate::sync::AllocGuard;

/// A warning raised while the world was stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Deferred {
    /// A thread's stack pointer lay outside its stack.
    StackPointerOutOfRange {
        thread: ThreadKey,
        sp: usize,
        lo: usize,
        hi: usize,
    },
    /// The register context of a suspended thread could not be trusted.
    UntrustedContext { thread: ThreadKey },
}

impl fmt::Display for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::StackPointerOutOfRange { thread, sp, lo, hi } => write!(
                f,
                "Thread stack pointer {sp:#x} out of range, pushing everything \
                 (thread {}, stack {lo:#x}..{hi:#x})",
                thread.0
            ),
            Self::UntrustedContext { thread } => write!(
                f,
                "Stale register context for thread {}, scanning its whole stack",
                thread.0
            ),
        }
    }
}

impl CollectorRuntime {
    /// Queue `warning` while the world is stopped, print it otherwise.
    pub(crate) fn warn_deferred(&self, warning: Deferred) {
        if self.world_stopped.load(Ordering::Acquire) {
            // Full queue: the warning is lost, the metric still counts it.
            let _ = self.deferred.push(warning);
        } else {
            crate::tracing::warn(format_args!("{warning}"));
        }
    }

    fn flush_deferred(&self) {
        while let Some(warning) = self.deferred.pop() {
            crate::tracing::warn(format_args!("{warning}"));
        }
    }

    fn should_suspend(&self, rec: &ThreadRecord, me: ThreadKey) -> bool {
        if rec.stack_end() == 0 || rec.id() == me || rec.is_neutralized() {
            return false;
        }
        !(self.mode() == RegistryMode::Explicit && rec.is_finished())
    }

    /// Suspend every registered thread except the caller.
    ///
    /// Threads inside a blocking bracket are left running. Returns the
    /// number of threads suspended. Aborts if a thread cannot be suspended.
    pub fn stop_world(&self, _guard: &AllocGuard<'_>) -> usize {
        self.assert_holds_lock();
        debug_assert!(
            !self.world_stopped.load(Ordering::Acquire),
            "world stopped twice"
        );
        let mark: Option<MarkGuard<'_>> = self.markers().is_parallel().then(|| self.markers().lock());
        // A flag left by an earlier stop must not force a rescan of this one.
        self.attached_during_stop.store(false, Ordering::SeqCst);
        self.please_stop.store(true, Ordering::SeqCst);
        // Pairs with the fence in `add_thread`: either we see the new
        // record's stack, or it sees `please_stop`.
        fence(Ordering::SeqCst);
        self.world_stopped.store(true, Ordering::Release);

        let (suspended, blocking) = self.suspend_others();
        drop(mark);
        self.metrics.record_stop(suspended, blocking);
        suspended
    }

    /// With the world stopped, suspend threads that registered after
    /// [`Self::stop_world`] went past them. Returns how many were
    /// suspended.
    ///
    /// Call this before repeating root discovery when
    /// [`Self::started_thread_while_stopped`] reports a late attach.
    pub fn suspend_late_arrivals(&self, _guard: &AllocGuard<'_>) -> usize {
        self.assert_holds_lock();
        debug_assert!(self.world_stopped.load(Ordering::Acquire), "world is not stopped");
        let mark: Option<MarkGuard<'_>> = self.markers().is_parallel().then(|| self.markers().lock());
        let (suspended, _) = self.suspend_others();
        drop(mark);
        self.metrics.record_late_suspends(suspended);
        suspended
    }

    /// Suspend every eligible record not already suspended. Returns the
    /// number suspended and the number skipped as blocking.
    fn suspend_others(&self) -> (usize, usize) {
        let me = ThreadKey::current();
        let budget = self.config().suspend_retry_budget;
        let mut suspended = 0;
        let mut blocking = 0;
        self.registry().for_each(&mut |rec| {
            if !self.should_suspend(rec, me) || rec.is_suspended() {
                return;
            }
            if rec.is_blocking() {
                blocking += 1;
                return;
            }
            // Everything touching the record happens while the handle is
            // pinned, so the owner cannot tear it down mid-suspend.
            let stopped = rec.with_live_handle(|handle| {
                match handle.suspend(budget, &|| rec.stack_end() == 0) {
                    Ok(SuspendOutcome::Suspended(ctx)) => {
                        if !ctx.trustworthy {
                            self.warn_deferred(Deferred::UntrustedContext { thread: rec.id() });
                        }
                        rec.note_suspended(ctx);
                        true
                    }
                    Ok(SuspendOutcome::Exited) => {
                        rec.neutralize();
                        self.metrics.record_exited();
                        false
                    }
                    Err(err) => fatal!("Cannot suspend thread {}: {err}", rec.id().0),
                }
            });
            if stopped == Some(true) {
                suspended += 1;
            }
        });
        (suspended, blocking)
    }

    /// Resume every thread suspended by [`Self::stop_world`], then reclaim
    /// records of threads that died meanwhile and print queued warnings.
    ///
    /// Returns the number of threads resumed. Aborts if a resume fails.
    pub fn start_world(&self, _guard: &AllocGuard<'_>) -> usize {
        self.assert_holds_lock();
        let mut resumed = 0;
        self.registry().for_each(&mut |rec| {
            if !rec.is_suspended() {
                return;
            }
            // The record must look running before the thread can run again.
            rec.note_resumed();
            if let Some(Err(err)) = rec.with_handle(crate::os::OsThread::resume) {
                fatal!("Cannot resume thread {}: {err}", rec.id().0);
            }
            resumed += 1;
        });
        self.please_stop.store(false, Ordering::SeqCst);
        self.world_stopped.store(false, Ordering::Release);

        let reclaimed = self.registry().purge_neutralized();
        self.flush_deferred();
        #[cfg(feature = "tracing")]
        {
            let stats = self.metrics.snapshot();
            crate::tracing::internal::log_world_stopped(
                stats.threads_suspended,
                stats.threads_blocking_skipped,
            );
            crate::tracing::internal::log_roots_pushed(stats.bytes_scanned);
            crate::tracing::internal::log_world_started(resumed, reclaimed);
        }
        #[cfg(not(feature = "tracing"))]
        let _ = reclaimed;
        resumed
    }

    /// Whether [`Self::stop_world`] is in effect.
    #[must_use]
    pub fn is_world_stopped(&self) -> bool {
        self.world_stopped.load(Ordering::Acquire)
    }

    /// Whether a thread attached while the world was stopped, clearing the
    /// indication. When true, the roots just gathered may miss that
    /// thread's stack and discovery should be repeated.
    pub fn started_thread_while_stopped(&self) -> bool {
        self.attached_during_stop.swap(false, Ordering::SeqCst)
    }

    /// Lock, stop the world, run `f`, restart the world.
    ///
    /// The world is restarted even if `f` panics.
    pub fn with_world_stopped<R>(&self, f: impl FnOnce(&StoppedWorld<'_>) -> R) -> R {
        let world = StoppedWorld::new(self, self.lock());
        f(&world)
    }

    /// A full collection cycle around the caller's mark work: start the
    /// helpers if needed, stop the world, push every thread's roots to
    /// `sink`, run one mark pass of `work`, restart the world.
    ///
    /// Root discovery is repeated while threads keep attaching during the
    /// stop. Returns the bytes of stack pushed by the last discovery.
    pub fn collect_with(&self, sink: &mut dyn RootSink, work: &(dyn Fn(usize) + Sync)) -> usize {
        if self.config().use_parallel() {
            self.start_mark_threads();
        }
        self.with_world_stopped(|world| {
            let mut bytes = world.push_all_stacks(sink);
            world.push_thread_structures(sink);
            while self.started_thread_while_stopped() {
                world.suspend_late_arrivals();
                bytes = world.push_all_stacks(sink);
            }
            self.markers().do_parallel_mark(work);
            bytes
        })
    }
}

/// The world stopped by [`CollectorRuntime::with_world_stopped`].
///
/// Holds the allocation lock; dropping it restarts the world.
pub struct StoppedWorld<'a> {
    runtime: &'a CollectorRuntime,
    guard: AllocGuard<'a>,
    timer: PauseTimer,
    #[cfg(feature = "tracing")]
    _span: tracing::span::EnteredSpan,
}

impl<'a> StoppedWorld<'a> {
    fn new(runtime: &'a CollectorRuntime, guard: AllocGuard<'a>) -> Self {
        #[cfg(feature = "tracing")]
        let span = crate::tracing::internal::trace_world_stopped(crate::tracing::internal::next_gc_id());
        let timer = PauseTimer::start();
        runtime.stop_world(&guard);
        Self {
            runtime,
            guard,
            timer,
            #[cfg(feature = "tracing")]
            _span: span,
        }
    }

    /// The runtime whose world is stopped.
    #[must_use]
    pub const fn runtime(&self) -> &'a CollectorRuntime {
        self.runtime
    }

    /// The allocation lock held for the duration of the stop.
    #[must_use]
    pub const fn guard(&self) -> &AllocGuard<'a> {
        &self.guard
    }

    /// See [`CollectorRuntime::suspend_late_arrivals`].
    pub fn suspend_late_arrivals(&self) -> usize {
        self.runtime.suspend_late_arrivals(&self.guard)
    }

    /// See [`CollectorRuntime::push_all_stacks`].
    pub fn push_all_stacks(&self, sink: &mut dyn RootSink) -> usize {
        self.runtime.push_all_stacks(&self.guard, sink)
    }

    /// See [`CollectorRuntime::push_thread_structures`].
    pub fn push_thread_structures(&self, sink: &mut dyn RootSink) {
        self.runtime.push_thread_structures(&self.guard, sink);
    }

    /// See [`CollectorRuntime::next_stack`].
    #[must_use]
    pub fn next_stack(&self, start: usize, limit: usize) -> Option<(usize, usize)> {
        self.runtime.next_stack(&self.guard, start, limit)
    }
}

impl Drop for StoppedWorld<'_> {
    fn drop(&mut self) {
        self.runtime.start_world(&self.guard);
        self.runtime.metrics.record_pause(self.timer.elapsed());
    }
}

impl fmt::Debug for StoppedWorld<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoppedWorld")
            .field("suspended", &self.runtime.metrics.snapshot().threads_suspended)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::{Arc, Barrier};

    fn serial() -> Arc<CollectorRuntime> {
        CollectorRuntime::init(RuntimeConfig::new().parallel_mark(false)).unwrap()
    }

    #[test]
    fn test_stop_with_only_self_suspends_nothing() {
        let runtime = serial();
        let suspended = runtime.with_world_stopped(|world| {
            assert!(world.runtime().is_world_stopped());
            runtime.metrics().threads_suspended
        });
        assert_eq!(suspended, 0);
        assert!(!runtime.is_world_stopped());
        assert_eq!(runtime.metrics().collections, 1);
    }

    #[test]
    fn test_registered_worker_is_suspended_and_resumed() {
        let runtime = serial();
        let barrier = Arc::new(Barrier::new(2));
        let done = Arc::new(AtomicBool::new(false));
        let spins = Arc::new(AtomicUsize::new(0));

        let worker = {
            let runtime = Arc::clone(&runtime);
            let barrier = Arc::clone(&barrier);
            let done = Arc::clone(&done);
            let spins = Arc::clone(&spins);
            std::thread::spawn(move || {
                runtime.register_current_thread().unwrap();
                barrier.wait();
                while !done.load(Ordering::Acquire) {
                    spins.fetch_add(1, Ordering::Relaxed);
                    std::hint::spin_loop();
                }
                runtime.unregister_thread().unwrap();
            })
        };
        barrier.wait();

        runtime.with_world_stopped(|_| {
            let before = spins.load(Ordering::Relaxed);
            std::thread::sleep(std::time::Duration::from_millis(20));
            assert_eq!(spins.load(Ordering::Relaxed), before);
            let mut seen = 0;
            runtime.registry().for_each(&mut |rec| {
                if rec.is_suspended() {
                    assert!(rec.context().is_some());
                    seen += 1;
                }
            });
            assert_eq!(seen, 1);
        });
        assert_eq!(runtime.metrics().threads_suspended, 1);

        done.store(true, Ordering::Release);
        worker.join().unwrap();
        assert_eq!(runtime.thread_count(), 1);
    }

    #[test]
    fn test_world_restarts_after_panic() {
        let runtime = serial();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            runtime.with_world_stopped(|_| panic!("collector bug"));
        }));
        assert!(result.is_err());
        assert!(!runtime.is_world_stopped());
        assert!(runtime.try_lock().is_some());
    }

    #[test]
    fn test_deferred_warnings_flush_on_restart() {
        let runtime = serial();
        runtime.with_world_stopped(|_| {
            runtime.warn_deferred(Deferred::UntrustedContext { thread: ThreadKey(7) });
            assert_eq!(runtime.deferred.len(), 1);
        });
        assert!(runtime.deferred.is_empty());
    }

    #[test]
    fn test_attach_flag_is_sticky_until_read() {
        let runtime = serial();
        assert!(!runtime.started_thread_while_stopped());
        runtime.attached_during_stop.store(true, Ordering::SeqCst);
        assert!(runtime.started_thread_while_stopped());
        assert!(!runtime.started_thread_while_stopped());
    }

    #[test]
    fn test_new_stop_clears_stale_attach_flag() {
        let runtime = serial();
        runtime.attached_during_stop.store(true, Ordering::SeqCst);
        let flagged = runtime.with_world_stopped(|_| runtime.started_thread_while_stopped());
        assert!(!flagged);
    }

    #[test]
    fn test_late_suspend_skips_already_suspended() {
        let runtime = serial();
        let barrier = Arc::new(Barrier::new(2));
        let done = Arc::new(AtomicBool::new(false));
        let worker = {
            let runtime = Arc::clone(&runtime);
            let barrier = Arc::clone(&barrier);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                runtime.register_current_thread().unwrap();
                barrier.wait();
                while !done.load(Ordering::Acquire) {
                    std::hint::spin_loop();
                }
                runtime.unregister_thread().unwrap();
            })
        };
        barrier.wait();

        let mut counts = Vec::with_capacity(2);
        let late = runtime.with_world_stopped(|world| {
            let late = world.suspend_late_arrivals();
            runtime.registry().for_each(&mut |rec| {
                if rec.is_suspended() {
                    counts.push(rec.suspend_count());
                }
            });
            late
        });
        assert_eq!(late, 0);
        assert_eq!(counts, vec![1]);
        assert_eq!(runtime.metrics().threads_suspended, 1);

        done.store(true, Ordering::Release);
        worker.join().unwrap();
    }

    #[test]
    fn test_deferred_message_text() {
        let msg = Deferred::StackPointerOutOfRange {
            thread: ThreadKey(3),
            sp: 0x10,
            lo: 0x1000,
            hi: 0x2000,
        }
        .to_string();
        assert!(msg.starts_with("Thread stack pointer 0x10 out of range, pushing everything"));
    }
}
