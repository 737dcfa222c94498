//! # Lock Ordering Discipline
//!
//! The thread layer uses exactly two blocking locks:
//!
//! | Level | Lock         | Protects                                              |
//! |-------|--------------|-------------------------------------------------------|
//! | 1     | `Allocation` | explicit registry, record flags, stack-probe cache     |
//! | 2     | `Mark`       | marker pool state, builder and marker signalling       |
//!
//! The allocation lock is always taken first. Taking the allocation lock
//! while holding the mark lock can deadlock against a collector that stops
//! the world (which holds allocation and then waits for mark), so it is
//! forbidden. Neither lock is re-entrant.
//!
//! ## Validation
//!
//! Debug builds keep a per-thread stack of held lock levels and panic with
//! `"Lock ordering violation"` when a lock is requested at a level not
//! strictly above every level already held. Debug builds also record the
//! identity of the current holder of each [`TrackedMutex`] so code can
//! assert that it owns the lock it relies on.
//!
//! ```ignore
//! let alloc = runtime.lock();          // level 1
//! let mark = runtime.markers().lock(); // level 2, fine
//! drop(mark);
//! drop(alloc);
//!
//! let mark = runtime.markers().lock();
//! let alloc = runtime.lock();          // panics in debug builds
//! ```

use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

const MAX_LOCK_DEPTH: usize = 4;

thread_local!(static HELD_LEVELS: RefCell<Vec<u8>> = RefCell::new(Vec::with_capacity(MAX_LOCK_DEPTH)));

/// Lock order tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockOrder {
    /// The allocation lock (level 1).
    Allocation = 1,
    /// The mark lock (level 2).
    Mark = 2,
}

impl LockOrder {
    /// The acquisition level of this lock.
    #[must_use]
    pub const fn level(self) -> u8 {
        self as u8
    }
}

/// Validate lock acquisition order in debug builds.
///
/// # Panics
///
/// Panics in debug builds if `tag` is not above every lock already held by
/// the calling thread.
#[inline]
#[cfg(debug_assertions)]
pub fn validate_lock_order(tag: LockOrder) {
    let highest = highest_held_level();
    debug_assert!(
        tag.level() > highest,
        "Lock ordering violation: {tag:?} (level {}) requested while holding a level {highest} lock",
        tag.level(),
    );
}

#[inline]
#[cfg(not(debug_assertions))]
pub const fn validate_lock_order(_tag: LockOrder) {}

/// Highest lock level held by the current thread, 0 when none.
#[must_use]
pub fn highest_held_level() -> u8 {
    HELD_LEVELS
        .try_with(|held| held.borrow().iter().copied().max().unwrap_or(0))
        .unwrap_or(0)
}

/// RAII record of a held lock level.
///
/// Created before blocking on the underlying mutex, so an ordering bug
/// panics instead of deadlocking.
#[must_use]
pub struct LockGuard {
    _tag: LockOrder,
}

impl LockGuard {
    /// Validate and push `tag` onto the current thread's held-lock stack.
    #[must_use = "LockGuard must be held for the duration of the critical section"]
    pub fn new(tag: LockOrder) -> Self {
        #[cfg(debug_assertions)]
        {
            validate_lock_order(tag);
            let _ = HELD_LEVELS.try_with(|held| held.borrow_mut().push(tag.level()));
        }
        Self { _tag: tag }
    }
}

#[cfg(debug_assertions)]
impl Drop for LockGuard {
    fn drop(&mut self) {
        let level = self._tag.level();
        let _ = HELD_LEVELS.try_with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|&l| l == level) {
                held.remove(pos);
            }
        });
    }
}

static NEXT_HOLDER_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local!(static HOLDER_TOKEN: u64 = NEXT_HOLDER_TOKEN.fetch_add(1, Ordering::Relaxed));

#[cfg_attr(not(debug_assertions), allow(dead_code))]
fn holder_token() -> u64 {
    HOLDER_TOKEN.try_with(|t| *t).unwrap_or(u64::MAX)
}

/// A `parking_lot` mutex with a lock-order tag and, in debug builds, a
/// record of which thread holds it.
pub struct TrackedMutex<T> {
    inner: Mutex<T>,
    order: LockOrder,
    #[cfg(debug_assertions)]
    holder: AtomicU64,
}

impl<T> TrackedMutex<T> {
    /// Create an unlocked mutex at the given level.
    pub const fn new(value: T, order: LockOrder) -> Self {
        Self {
            inner: Mutex::new(value),
            order,
            #[cfg(debug_assertions)]
            holder: AtomicU64::new(0),
        }
    }

    /// Acquire the lock, blocking until it is available.
    pub fn lock(&self) -> TrackedGuard<'_, T> {
        let order = LockGuard::new(self.order);
        let guard = self.inner.lock();
        self.set_holder();
        TrackedGuard {
            owner: self,
            guard,
            _order: order,
        }
    }

    /// Acquire the lock if it is free.
    pub fn try_lock(&self) -> Option<TrackedGuard<'_, T>> {
        let order = LockGuard::new(self.order);
        let guard = self.inner.try_lock()?;
        self.set_holder();
        Some(TrackedGuard {
            owner: self,
            guard,
            _order: order,
        })
    }

    /// Whether the calling thread holds the lock. Always true in release
    /// builds, where the holder is not tracked; use only in assertions.
    #[must_use]
    pub fn held_by_current_thread(&self) -> bool {
        #[cfg(debug_assertions)]
        {
            self.holder.load(Ordering::Relaxed) == holder_token()
        }
        #[cfg(not(debug_assertions))]
        {
            true
        }
    }

    /// Whether any thread holds the lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// Acquire the lock and leave it held with no guard. Bypasses order
    /// tracking. Paired with [`Self::force_unlock`] across a `fork`.
    pub(crate) fn lock_and_forget(&self) {
        std::mem::forget(self.inner.lock());
        self.set_holder();
    }

    /// Release a lock taken by [`Self::lock_and_forget`].
    ///
    /// # Safety
    ///
    /// The lock must be held through `lock_and_forget`, by this thread or by
    /// the thread this process was forked from.
    pub(crate) unsafe fn force_unlock(&self) {
        self.clear_holder();
        // SAFETY: the caller guarantees the lock is held with no guard.
        unsafe { self.inner.force_unlock() };
    }

    fn set_holder(&self) {
        #[cfg(debug_assertions)]
        self.holder.store(holder_token(), Ordering::Relaxed);
    }

    fn clear_holder(&self) {
        #[cfg(debug_assertions)]
        self.holder.store(0, Ordering::Relaxed);
    }
}

/// Guard for a [`TrackedMutex`].
pub struct TrackedGuard<'a, T> {
    owner: &'a TrackedMutex<T>,
    guard: MutexGuard<'a, T>,
    _order: LockGuard,
}

impl<T> TrackedGuard<'_, T> {
    /// Block on `cv`, releasing the lock while waiting. Callers must recheck
    /// their predicate afterwards: wakeups may be spurious.
    pub fn wait(&mut self, cv: &Condvar) {
        self.owner.clear_holder();
        cv.wait(&mut self.guard);
        self.owner.set_holder();
    }

    /// Like [`Self::wait`] with a timeout. Returns true if it timed out.
    pub fn wait_for(&mut self, cv: &Condvar, timeout: Duration) -> bool {
        self.owner.clear_holder();
        let timed_out = cv.wait_for(&mut self.guard, timeout).timed_out();
        self.owner.set_holder();
        timed_out
    }

    /// Release the lock while running `f`, then take it back.
    pub fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.owner.clear_holder();
        let r = MutexGuard::unlocked(&mut self.guard, f);
        self.owner.set_holder();
        r
    }
}

impl<T> Drop for TrackedGuard<'_, T> {
    fn drop(&mut self) {
        self.owner.clear_holder();
    }
}

impl<T> Deref for TrackedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for TrackedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

/// The allocation lock.
pub type AllocLock = TrackedMutex<()>;

/// Proof that the caller holds the allocation lock.
pub type AllocGuard<'a> = TrackedGuard<'a, ()>;
