//! Per-thread records.

use std::any::Any;
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicPtr, AtomicU16, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::arch::SuspendedContext;
use crate::os::OsThread;
use crate::registry::RecordKey;
use crate::stack::{StackBase, StackSection, ADDR_LIMIT};

/// Platform identifier of a thread. `0` never names a live thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ThreadKey(pub u64);

impl ThreadKey {
    /// The "no thread" key.
    pub const NONE: Self = Self(0);

    /// Key of the calling thread.
    #[must_use]
    pub fn current() -> Self {
        crate::os::current_thread_key()
    }

    /// Whether this is [`Self::NONE`].
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Status bits of a [`ThreadRecord`].
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ThreadFlags(u8);

impl ThreadFlags {
    /// Stopped by the current stop-the-world.
    pub const SUSPENDED: Self = Self(1 << 0);
    /// Inside a blocking bracket; not to be suspended.
    pub const DO_BLOCKING: Self = Self(1 << 1);
    /// The thread function returned; the record awaits a join or detach.
    pub const FINISHED: Self = Self(1 << 2);
    /// Nobody will join the thread.
    pub const DETACHED: Self = Self(1 << 3);
    /// The thread exited during a stop; the record is reclaimed at restart.
    pub const NEUTRALIZED: Self = Self(1 << 4);

    /// No bits.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Whether every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any bit of `other` is set.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Both sets of bits.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for ThreadFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Debug for ThreadFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(ThreadFlags, &str); 5] = [
            (ThreadFlags::SUSPENDED, "SUSPENDED"),
            (ThreadFlags::DO_BLOCKING, "DO_BLOCKING"),
            (ThreadFlags::FINISHED, "FINISHED"),
            (ThreadFlags::DETACHED, "DETACHED"),
            (ThreadFlags::NEUTRALIZED, "NEUTRALIZED"),
        ];
        let mut set = f.debug_set();
        for (flag, name) in NAMES {
            if self.contains(flag) {
                set.entry(&format_args!("{name}"));
            }
        }
        set.finish()
    }
}

/// Thread-local allocator state, opaque to this crate.
pub struct LocalAllocBlob(Box<dyn Any + Send>);

impl LocalAllocBlob {
    /// Wrap allocator state.
    pub fn new<T: Any + Send>(state: T) -> Self {
        Self(Box::new(state))
    }

    /// Borrow the state as `T`.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    /// Mutably borrow the state as `T`.
    pub fn downcast_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.0.downcast_mut()
    }
}

impl fmt::Debug for LocalAllocBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalAllocBlob").finish_non_exhaustive()
    }
}

/// Everything the collector knows about one thread.
///
/// Fields read by stop-the-world and root discovery are atomics so the
/// lock-free registry can publish them. The mutexes are only taken by a
/// thread holding the allocation lock, so a suspended thread never holds
/// one of them.
///
/// The OS handle is guarded by a pin count instead of a lock: a thread
/// tearing down its own record may be suspended at any point, and a lock
/// it held would stall the collector.
pub struct ThreadRecord {
    id: AtomicU64,
    generation: AtomicU32,
    slot: AtomicU32,
    handle: UnsafeCell<Option<OsThread>>,
    handle_pins: AtomicUsize,
    stack_end: AtomicUsize,
    reg_base: AtomicUsize,
    initial_stack_base: AtomicUsize,
    last_stack_min: AtomicUsize,
    stack_ptr: AtomicUsize,
    context: Mutex<Option<SuspendedContext>>,
    traced_stack_sect: AtomicPtr<StackSection>,
    flags: AtomicU8,
    secondary_id: AtomicU64,
    finalizer_nested: AtomicU8,
    finalizer_skipped: AtomicU16,
    local_alloc: Mutex<Option<LocalAllocBlob>>,
    suspend_count: AtomicU64,
    resume_count: AtomicU64,
}

impl ThreadRecord {
    pub(crate) const fn vacant() -> Self {
        Self {
            id: AtomicU64::new(0),
            generation: AtomicU32::new(0),
            slot: AtomicU32::new(0),
            handle: UnsafeCell::new(None),
            handle_pins: AtomicUsize::new(0),
            stack_end: AtomicUsize::new(0),
            reg_base: AtomicUsize::new(0),
            initial_stack_base: AtomicUsize::new(0),
            last_stack_min: AtomicUsize::new(ADDR_LIMIT),
            stack_ptr: AtomicUsize::new(0),
            context: Mutex::new(None),
            traced_stack_sect: AtomicPtr::new(std::ptr::null_mut()),
            flags: AtomicU8::new(0),
            secondary_id: AtomicU64::new(0),
            finalizer_nested: AtomicU8::new(0),
            finalizer_skipped: AtomicU16::new(0),
            local_alloc: Mutex::new(None),
            suspend_count: AtomicU64::new(0),
            resume_count: AtomicU64::new(0),
        }
    }

    /// Fill a vacant record. The stack base is published before the id, so
    /// a lock-free reader that matches the id also sees the stack.
    pub(crate) fn init(
        &self,
        id: ThreadKey,
        base: StackBase,
        handle: OsThread,
        key: RecordKey,
    ) {
        self.generation.store(key.generation, Ordering::Relaxed);
        self.slot.store(key.index, Ordering::Relaxed);
        // SAFETY: the record is vacant: `stack_end` is zero, so no pinned
        // reader looks at the handle, and it is published below.
        unsafe { *self.handle.get() = Some(handle) };
        self.flags.store(0, Ordering::Relaxed);
        self.secondary_id.store(0, Ordering::Relaxed);
        self.stack_ptr.store(0, Ordering::Relaxed);
        self.traced_stack_sect.store(std::ptr::null_mut(), Ordering::Relaxed);
        self.finalizer_nested.store(0, Ordering::Relaxed);
        self.finalizer_skipped.store(0, Ordering::Relaxed);
        self.last_stack_min.store(ADDR_LIMIT, Ordering::Relaxed);
        self.reg_base.store(base.reg_base, Ordering::Relaxed);
        self.initial_stack_base.store(base.mem_base, Ordering::Relaxed);
        self.stack_end.store(base.mem_base, Ordering::Release);
        self.id.store(id.0, Ordering::Release);
    }

    /// Return the record to vacancy. `stack_end` goes first so stop-the-world
    /// and root discovery stop looking at the record before anything else
    /// changes. Returns the handle so the caller decides when it is closed.
    pub(crate) fn clear(&self) -> Option<OsThread> {
        self.stack_end.store(0, Ordering::SeqCst);
        let backoff = crossbeam::utils::Backoff::new();
        while self.handle_pins.load(Ordering::SeqCst) != 0 {
            backoff.snooze();
        }
        self.id.store(0, Ordering::Release);
        self.flags.store(0, Ordering::Release);
        *self.context.lock() = None;
        self.local_alloc.lock().take();
        // SAFETY: `stack_end` is zero and no pins remain, so nobody else
        // can be reading the handle.
        unsafe { (*self.handle.get()).take() }
    }

    /// Mark the record of a thread found dead during a stop. Makes no
    /// allocation and frees nothing.
    pub(crate) fn neutralize(&self) {
        self.stack_end.store(0, Ordering::Release);
        self.set_flags(ThreadFlags::NEUTRALIZED);
    }

    /// Platform id of the thread.
    #[must_use]
    pub fn id(&self) -> ThreadKey {
        ThreadKey(self.id.load(Ordering::Acquire))
    }

    /// Identity of this incarnation of the record.
    #[must_use]
    pub fn key(&self) -> RecordKey {
        RecordKey {
            index: self.slot.load(Ordering::Relaxed),
            generation: self.generation.load(Ordering::Relaxed),
        }
    }

    /// Stack base, `0` once the record is being torn down.
    #[must_use]
    pub fn stack_end(&self) -> usize {
        self.stack_end.load(Ordering::Acquire)
    }

    pub(crate) fn set_stack_end(&self, end: usize) {
        self.stack_end.store(end, Ordering::Release);
    }

    /// Both stack bases.
    #[must_use]
    pub fn stack_base(&self) -> StackBase {
        StackBase {
            mem_base: self.stack_end(),
            reg_base: self.reg_base.load(Ordering::Relaxed),
        }
    }

    /// Stack base recorded at registration.
    #[must_use]
    pub fn initial_stack_base(&self) -> usize {
        self.initial_stack_base.load(Ordering::Relaxed)
    }

    /// Replace the stack base after registration (re-registration of a
    /// finished thread or an explicit override).
    pub(crate) fn record_stack_base(&self, base: StackBase) {
        self.reg_base.store(base.reg_base, Ordering::Relaxed);
        self.last_stack_min.store(ADDR_LIMIT, Ordering::Relaxed);
        self.stack_end.store(base.mem_base, Ordering::Release);
    }

    /// Cached stack minimum, [`ADDR_LIMIT`] when unknown.
    #[must_use]
    pub fn last_stack_min(&self) -> usize {
        self.last_stack_min.load(Ordering::Relaxed)
    }

    pub(crate) fn set_last_stack_min(&self, min: usize) {
        self.last_stack_min.store(min, Ordering::Relaxed);
    }

    /// Stack pointer saved on entry to the blocking bracket.
    #[must_use]
    pub fn stack_ptr(&self) -> usize {
        self.stack_ptr.load(Ordering::Acquire)
    }

    pub(crate) fn set_stack_ptr(&self, sp: usize) {
        self.stack_ptr.store(sp, Ordering::Release);
    }

    /// Innermost traced stack section.
    #[must_use]
    pub fn traced_stack_sect(&self) -> *const StackSection {
        self.traced_stack_sect.load(Ordering::Acquire)
    }

    pub(crate) fn set_traced_stack_sect(&self, sect: *const StackSection) {
        self.traced_stack_sect.store(sect.cast_mut(), Ordering::Release);
    }

    /// Current flags.
    #[must_use]
    pub fn flags(&self) -> ThreadFlags {
        ThreadFlags(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn set_flags(&self, flags: ThreadFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn clear_flags(&self, flags: ThreadFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Whether the thread is stopped by the current stop-the-world.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.flags().contains(ThreadFlags::SUSPENDED)
    }

    /// Whether the thread is inside a blocking bracket.
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        self.flags().contains(ThreadFlags::DO_BLOCKING)
    }

    /// Whether the thread function has returned.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.flags().contains(ThreadFlags::FINISHED)
    }

    /// Whether nobody will join the thread.
    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.flags().contains(ThreadFlags::DETACHED)
    }

    /// Whether the record belongs to a thread that died during a stop.
    #[must_use]
    pub fn is_neutralized(&self) -> bool {
        self.flags().contains(ThreadFlags::NEUTRALIZED)
    }

    /// Higher-level handle id, `0` if none.
    #[must_use]
    pub fn secondary_id(&self) -> u64 {
        self.secondary_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_secondary_id(&self, id: u64) {
        self.secondary_id.store(id, Ordering::Release);
    }

    /// Register state saved by the current stop, if suspended.
    #[must_use]
    pub fn context(&self) -> Option<SuspendedContext> {
        *self.context.lock()
    }

    pub(crate) fn set_context(&self, ctx: Option<SuspendedContext>) {
        *self.context.lock() = ctx;
    }

    /// Run `f` on the OS handle of a record that still has a stack.
    /// Returns `None` if the record is being torn down.
    pub(crate) fn with_live_handle<R>(&self, f: impl FnOnce(&OsThread) -> R) -> Option<R> {
        self.handle_pins.fetch_add(1, Ordering::SeqCst);
        let out = if self.stack_end.load(Ordering::SeqCst) == 0 {
            None
        } else {
            // SAFETY: pinned while `stack_end` is non-zero: `clear` cannot
            // take the handle until the pin is released.
            unsafe { (*self.handle.get()).as_ref().map(f) }
        };
        self.handle_pins.fetch_sub(1, Ordering::SeqCst);
        out
    }

    /// Run `f` on the OS handle of a record whose thread cannot be
    /// clearing it: it is suspended, or the caller holds the allocation
    /// lock in explicit mode.
    pub(crate) fn with_handle<R>(&self, f: impl FnOnce(&OsThread) -> R) -> Option<R> {
        self.handle_pins.fetch_add(1, Ordering::SeqCst);
        // SAFETY: pinned; see the caller contract above.
        let out = unsafe { (*self.handle.get()).as_ref().map(f) };
        self.handle_pins.fetch_sub(1, Ordering::SeqCst);
        out
    }

    /// Give the record a new owner (fork child rebinding), keeping its
    /// generation. `index` is where the registry now stores it. The old
    /// handle is returned for the caller to drop.
    pub(crate) fn rebind(&self, index: u32, id: ThreadKey, handle: OsThread) -> Option<OsThread> {
        // SAFETY: only called in a freshly forked child, which has a single
        // thread.
        let old = unsafe { (*self.handle.get()).replace(handle) };
        self.slot.store(index, Ordering::Relaxed);
        self.id.store(id.0, Ordering::Release);
        old
    }

    /// Thread-local allocator state. Taken only under the allocation lock.
    pub(crate) fn local_alloc(&self) -> parking_lot::MutexGuard<'_, Option<LocalAllocBlob>> {
        self.local_alloc.lock()
    }

    pub(crate) fn finalizer_nested(&self) -> &AtomicU8 {
        &self.finalizer_nested
    }

    pub(crate) fn finalizer_skipped(&self) -> &AtomicU16 {
        &self.finalizer_skipped
    }

    /// Times this record was suspended.
    #[must_use]
    pub fn suspend_count(&self) -> u64 {
        self.suspend_count.load(Ordering::Relaxed)
    }

    /// Times this record was resumed.
    #[must_use]
    pub fn resume_count(&self) -> u64 {
        self.resume_count.load(Ordering::Relaxed)
    }

    pub(crate) fn note_suspended(&self, ctx: SuspendedContext) {
        self.set_context(Some(ctx));
        self.set_flags(ThreadFlags::SUSPENDED);
        self.suspend_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_resumed(&self) {
        self.clear_flags(ThreadFlags::SUSPENDED);
        self.set_context(None);
        self.resume_count.fetch_add(1, Ordering::Relaxed);
    }
}

// SAFETY: the only non-Sync field is the handle cell, whose accesses are
// serialised by the pin protocol above.
unsafe impl Sync for ThreadRecord {}

impl fmt::Debug for ThreadRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadRecord")
            .field("id", &self.id())
            .field("key", &self.key())
            .field("stack_end", &format_args!("{:#x}", self.stack_end()))
            .field("flags", &self.flags())
            .finish_non_exhaustive()
    }
}
