//! Parallel mark coordination.
//!
//! A fixed pool of helper threads (`GC-marker-1` ..) sleeps on per-helper
//! condition variables until the collecting thread opens a mark pass. A
//! pass is identified by `mark_no`; a helper that falls more than two
//! passes behind resynchronises instead of replaying old passes.
//!
//! The same mutex also counts free-list builders, so a collection can wait
//! for in-flight sweeping to drain before it trusts the mark bits.
//!
//! ```text
//!  primary                       helper i
//!  -------                       --------
//!  lock; help_wanted = true
//!  notify_all_marker   ───────▶  wakes, joins (helper_count += 1)
//!  unlock; work(0)               unlock; work(id)
//!  lock; help_wanted = false     lock; helper_count -= 1
//!  wait helper_count == 0 ◀────  notify on zero
//!  mark_no += 1; unlock
//! ```

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::config::{resolve_markers, MAX_MARKERS};
use crate::fatal;
use crate::stack::{self, ADDR_LIMIT};
use crate::sync::{LockOrder, TrackedGuard, TrackedMutex};

type Work = &'static (dyn Fn(usize) + Sync);

/// State guarded by the mark lock.
#[derive(Default)]
pub struct MarkState {
    mark_no: u64,
    help_wanted: bool,
    helper_count: usize,
    participants: usize,
    builder_count: usize,
    markers_m1: usize,
    work: Option<Work>,
    shutdown: bool,
}

impl MarkState {
    /// Number of the current (or next) mark pass.
    #[must_use]
    pub const fn mark_no(&self) -> u64 {
        self.mark_no
    }

    /// Free-list builders currently running.
    #[must_use]
    pub const fn builder_count(&self) -> usize {
        self.builder_count
    }

    /// Helpers currently working on the pass.
    #[must_use]
    pub const fn helper_count(&self) -> usize {
        self.helper_count
    }
}

/// Guard proving the mark lock is held.
pub type MarkGuard<'a> = TrackedGuard<'a, MarkState>;

/// Per-helper stack information, readable without the lock.
#[derive(Debug)]
pub(crate) struct MarkerSlot {
    pub(crate) sp: AtomicUsize,
    pub(crate) stack_end: AtomicUsize,
    pub(crate) last_stack_min: AtomicUsize,
    pub(crate) thread: AtomicU64,
}

impl MarkerSlot {
    const fn new() -> Self {
        Self {
            sp: AtomicUsize::new(0),
            stack_end: AtomicUsize::new(0),
            last_stack_min: AtomicUsize::new(ADDR_LIMIT),
            thread: AtomicU64::new(0),
        }
    }
}

struct Shared {
    state: TrackedMutex<MarkState>,
    builder_cv: Condvar,
    shared_cv: Condvar,
    helper_cvs: [Condvar; MAX_MARKERS],
    slots: [MarkerSlot; MAX_MARKERS],
}

thread_local! {
    /// `(pool address, helper index)` when this thread is a mark helper.
    static HELPER_OF: Cell<(usize, usize)> = const { Cell::new((0, 0)) };
}

/// The helper pool of one runtime.
pub struct MarkerPool {
    shared: Arc<Shared>,
    requested: AtomicUsize,
    enabled: AtomicBool,
    started: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl MarkerPool {
    /// A pool that will start `markers - 1` helpers when asked, or never if
    /// `enabled` is false.
    pub(crate) fn new(markers: usize, enabled: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: TrackedMutex::new(MarkState::default(), LockOrder::Mark),
                builder_cv: Condvar::new(),
                shared_cv: Condvar::new(),
                helper_cvs: std::array::from_fn(|_| Condvar::new()),
                slots: std::array::from_fn(|_| MarkerSlot::new()),
            }),
            requested: AtomicUsize::new(markers),
            enabled: AtomicBool::new(enabled),
            started: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        }
    }

    fn pool_id(&self) -> usize {
        Arc::as_ptr(&self.shared) as usize
    }

    /// Change the total number of markers. `0` means one per CPU. Ignored
    /// once helpers are running.
    pub fn set_markers_count(&self, markers: usize) {
        if !self.started.load(Ordering::Acquire) {
            self.requested.store(markers, Ordering::Relaxed);
        }
    }

    /// Whether passes will use helpers.
    #[must_use]
    pub fn is_parallel(&self) -> bool {
        self.enabled.load(Ordering::Acquire) && self.helpers() > 0
    }

    /// Helpers successfully started.
    #[must_use]
    pub fn helpers(&self) -> usize {
        self.lock().markers_m1
    }

    /// Start the helper threads once. Returns the number running.
    ///
    /// Must not be called while the world is stopped: spawning a thread
    /// allocates.
    pub fn start(&self) -> usize {
        if !self.enabled.load(Ordering::Acquire) {
            return 0;
        }
        let mut handles = self.handles.lock();
        if self.started.swap(true, Ordering::AcqRel) {
            return handles.len();
        }
        let wanted = resolve_markers(self.requested.load(Ordering::Relaxed)) - 1;
        self.lock().builder_count += wanted;

        for index in 1..=wanted {
            let shared = Arc::clone(&self.shared);
            let pool = self.pool_id();
            let spawned = std::thread::Builder::new()
                .name(format!("GC-marker-{index}"))
                .spawn(move || helper_main(&shared, pool, index));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    crate::tracing::warn(format_args!(
                        "Marker thread {index} creation failed: {err}"
                    ));
                    let mut state = self.lock();
                    state.builder_count -= wanted - handles.len();
                    if state.builder_count == 0 {
                        self.shared.builder_cv.notify_all();
                    }
                    break;
                }
            }
        }

        let started = handles.len();
        {
            let mut state = self.lock();
            state.markers_m1 = started;
            while state.builder_count > 0 {
                state.wait(&self.shared.builder_cv);
            }
        }
        if started == 0 {
            self.disable("no marker thread could be started");
        }
        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_markers_started(started);
        started
    }

    /// Stop using helpers for the rest of the pool's life.
    pub fn disable(&self, reason: &str) {
        if self.enabled.swap(false, Ordering::AcqRel) {
            #[cfg(feature = "tracing")]
            crate::tracing::internal::log_parallel_mark_disabled(reason);
            #[cfg(not(feature = "tracing"))]
            let _ = reason;
        }
    }

    /// Acquire the mark lock.
    pub fn lock(&self) -> MarkGuard<'_> {
        self.shared.state.lock()
    }

    /// Debug-check that the calling thread holds the mark lock.
    pub fn assert_holds_mark_lock(&self) {
        debug_assert!(
            self.shared.state.held_by_current_thread(),
            "mark lock not held by the current thread"
        );
    }

    /// A free-list builder starts. Collections wait for it to finish.
    pub fn begin_reclaim(&self) {
        self.lock().builder_count += 1;
    }

    /// A free-list builder finished.
    pub fn end_reclaim(&self) {
        let mut state = self.lock();
        debug_assert!(state.builder_count > 0, "end_reclaim without begin_reclaim");
        state.builder_count = state.builder_count.saturating_sub(1);
        if state.builder_count == 0 {
            self.notify_all_builder();
        }
    }

    /// Block until no free-list builder is running.
    pub fn wait_for_reclaim(&self) {
        let mut state = self.lock();
        while state.builder_count > 0 {
            self.wait_builder(&mut state);
        }
    }

    /// Wait for a builder event. Callers loop on their own predicate.
    pub fn wait_builder(&self, guard: &mut MarkGuard<'_>) {
        guard.wait(&self.shared.builder_cv);
    }

    /// Wake everything waiting for a builder event.
    pub fn notify_all_builder(&self) {
        self.shared.builder_cv.notify_all();
    }

    /// Wait for a marker event. A helper sleeps on its own condition
    /// variable; any other thread on the shared one.
    pub fn wait_marker(&self, guard: &mut MarkGuard<'_>) {
        let (pool, index) = HELPER_OF.with(Cell::get);
        if pool == self.pool_id() && index > 0 {
            guard.wait(&self.shared.helper_cvs[index - 1]);
        } else {
            guard.wait(&self.shared.shared_cv);
        }
    }

    /// Wake helper `index` (1-based).
    pub fn notify_marker(&self, index: usize) {
        if let Some(cv) = index.checked_sub(1).and_then(|i| self.shared.helper_cvs.get(i)) {
            cv.notify_one();
        }
    }

    /// Wake every helper and every other marker-event waiter.
    pub fn notify_all_marker(&self) {
        notify_all(&self.shared);
    }

    /// Number of the pass the next `do_parallel_mark` will run.
    #[must_use]
    pub fn mark_no(&self) -> u64 {
        self.lock().mark_no
    }

    /// Run one mark pass. `work(i)` is called once on this thread with
    /// `i == 0` and once on each helper that joins, with distinct `i` in
    /// `1..=helpers()`. Returns after every participant has returned.
    ///
    /// With parallel marking off this is just `work(0)`.
    pub fn do_parallel_mark(&self, work: &(dyn Fn(usize) + Sync)) {
        if !self.is_parallel() {
            work(0);
            return;
        }
        // SAFETY: the pass does not end (and this function does not return
        // or unwind) until `helper_count` is zero and the work item cleared,
        // so no helper uses `work` after the borrow ends.
        let erased: Work = unsafe {
            std::mem::transmute::<&(dyn Fn(usize) + Sync), &'static (dyn Fn(usize) + Sync)>(work)
        };

        let mut state = self.lock();
        if state.help_wanted || state.helper_count != 0 {
            drop(state);
            fatal!("Tried to start parallel mark in bad state");
        }
        state.work = Some(erased);
        state.helper_count = 1;
        state.participants = 1;
        state.help_wanted = true;
        drop(state);
        self.notify_all_marker();

        let pass = PassGuard { pool: self };
        work(0);
        drop(pass);
    }

    /// Visit the slot of every running helper.
    pub(crate) fn for_each_stack(&self, f: &mut dyn FnMut(&MarkerSlot)) {
        for slot in &self.shared.slots {
            if slot.stack_end.load(Ordering::Acquire) != 0 {
                f(slot);
            }
        }
    }

    /// Thread ids of the running helpers.
    #[must_use]
    pub fn helper_threads(&self) -> Vec<crate::record::ThreadKey> {
        let mut out = Vec::new();
        self.for_each_stack(&mut |slot| {
            out.push(crate::record::ThreadKey(slot.thread.load(Ordering::Relaxed)));
        });
        out
    }

    pub(crate) fn lock_and_forget(&self) {
        self.shared.state.lock_and_forget();
    }

    /// # Safety
    ///
    /// Pairs with [`Self::lock_and_forget`].
    pub(crate) unsafe fn force_unlock(&self) {
        // SAFETY: forwarded.
        unsafe { self.shared.state.force_unlock() };
    }

    /// In a forked child: the helpers did not survive the fork. Forget them
    /// without touching their (now meaningless) join handles.
    pub(crate) fn forget_helpers(&self) {
        self.enabled.store(false, Ordering::Release);
        for handle in std::mem::take(&mut *self.handles.lock()) {
            std::mem::forget(handle);
        }
        let mut state = self.lock();
        state.markers_m1 = 0;
        state.helper_count = 0;
        state.help_wanted = false;
        state.work = None;
        for slot in &self.shared.slots {
            slot.stack_end.store(0, Ordering::Release);
        }
    }

    /// Stop and join every helper.
    pub fn shutdown(&self) {
        let handles = std::mem::take(&mut *self.handles.lock());
        if handles.is_empty() {
            return;
        }
        self.lock().shutdown = true;
        self.notify_all_marker();
        for handle in handles {
            let name = handle.thread().name().map(str::to_owned);
            if handle.join().is_err() {
                crate::tracing::warn(format_args!(
                    "mark helper {} panicked",
                    name.as_deref().unwrap_or("<unnamed>")
                ));
            }
        }
    }
}

impl Drop for MarkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for MarkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkerPool")
            .field("enabled", &self.enabled.load(Ordering::Relaxed))
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Closes a pass even if the primary's work unwinds.
struct PassGuard<'a> {
    pool: &'a MarkerPool,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.pool.lock();
        state.helper_count -= 1;
        state.help_wanted = false;
        while state.helper_count > 0 {
            self.pool.wait_marker(&mut state);
        }
        state.work = None;
        state.mark_no += 1;
        drop(state);
        self.pool.notify_all_marker();
    }
}

fn notify_all(shared: &Shared) {
    for cv in &shared.helper_cvs {
        cv.notify_all();
    }
    shared.shared_cv.notify_all();
}

fn helper_main(shared: &Shared, pool: usize, index: usize) {
    HELPER_OF.with(|h| h.set((pool, index)));
    let slot = &shared.slots[index];
    slot.sp.store(stack::approximate_sp(), Ordering::Relaxed);
    slot.thread.store(crate::record::ThreadKey::current().0, Ordering::Relaxed);
    if let Ok(base) = stack::current_stack_base() {
        slot.stack_end.store(base.mem_base, Ordering::Release);
    }

    let cv = &shared.helper_cvs[index - 1];
    let mut state = shared.state.lock();
    state.builder_count -= 1;
    if state.builder_count == 0 {
        shared.builder_cv.notify_all();
    }
    let mut my_mark_no = state.mark_no;

    loop {
        if my_mark_no < state.mark_no || my_mark_no > state.mark_no + 2 {
            my_mark_no = state.mark_no;
        }
        while !state.shutdown
            && (state.mark_no < my_mark_no || (!state.help_wanted && state.mark_no == my_mark_no))
        {
            state.wait(cv);
        }
        if state.shutdown {
            break;
        }
        let id = state.participants;
        if state.mark_no != my_mark_no || id > state.markers_m1 {
            my_mark_no += 1;
            continue;
        }
        let Some(work) = state.work else {
            my_mark_no += 1;
            continue;
        };
        state.participants += 1;
        state.helper_count += 1;

        let outcome = state.unlocked(|| catch_unwind(AssertUnwindSafe(|| work(id))));
        if outcome.is_err() {
            drop(state);
            fatal!("mark helper {index} panicked");
        }

        state.helper_count -= 1;
        if state.helper_count == 0 {
            drop(state);
            notify_all(shared);
            state = shared.state.lock();
        }
        my_mark_no += 1;
    }
    slot.stack_end.store(0, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_serial_pass_runs_once_on_caller() {
        let pool = MarkerPool::new(4, false);
        let calls = AtomicU32::new(0);
        pool.do_parallel_mark(&|id| {
            assert_eq!(id, 0);
            calls.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(pool.start(), 0);
    }

    #[test]
    fn test_helpers_start_and_join_passes() {
        let pool = MarkerPool::new(3, true);
        assert_eq!(pool.start(), 2);
        assert_eq!(pool.start(), 2);
        assert!(pool.is_parallel());

        for pass in 0..5 {
            assert_eq!(pool.mark_no(), pass);
            let seen = Mutex::new(Vec::new());
            pool.do_parallel_mark(&|id| seen.lock().push(id));
            let mut seen = seen.into_inner();
            seen.sort_unstable();
            seen.dedup();
            assert_eq!(seen[0], 0);
            assert!(seen.iter().all(|&id| id <= 2));
        }
        pool.shutdown();
        assert!(pool.handles.lock().is_empty());
        assert!(pool.helper_threads().is_empty());
        pool.shutdown();
    }

    #[test]
    fn test_reclaim_counts() {
        let pool = Arc::new(MarkerPool::new(1, false));
        pool.begin_reclaim();
        pool.begin_reclaim();
        let waiter = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || pool.wait_for_reclaim())
        };
        pool.end_reclaim();
        pool.end_reclaim();
        waiter.join().unwrap();
        assert_eq!(pool.lock().builder_count(), 0);
    }

    #[test]
    fn test_set_markers_after_start_is_ignored() {
        let pool = MarkerPool::new(2, true);
        assert_eq!(pool.start(), 1);
        pool.set_markers_count(8);
        assert_eq!(pool.helpers(), 1);
    }

    #[test]
    fn test_helper_stacks_are_visible() {
        let pool = MarkerPool::new(2, true);
        pool.start();
        let mut stacks = 0;
        pool.for_each_stack(&mut |slot| {
            assert!(slot.sp.load(Ordering::Relaxed) < slot.stack_end.load(Ordering::Relaxed));
            stacks += 1;
        });
        assert_eq!(stacks, 1);
        let helpers = pool.helper_threads();
        assert_eq!(helpers.len(), 1);
        assert_ne!(helpers[0], crate::record::ThreadKey::current());
    }
}
