//! Thread lifecycle integration: spawning, joining and detaching, the
//! blocking bracket, stack-bottom overrides, discovery notifications, fork
//! handling and the finalizer nesting counters.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::arch::spill_callee_saved;
use crate::config::RegistryMode;
use crate::error::ThreadError;
use crate::fatal;
use crate::record::{LocalAllocBlob, ThreadFlags, ThreadKey, ThreadRecord};
use crate::roots::RootSink;
use crate::runtime::{CollectorRuntime, RegisterStatus, Registering};
use crate::stack::{self, approximate_sp, StackBase, StackSection};
use crate::sync::AllocGuard;

/// Thread-local allocator state, owned by the collector's allocator and
/// carried opaquely in each record.
///
/// Every method is called with the allocation lock held; `mark_thread_local`
/// also runs with the world stopped.
pub trait AllocatorHooks: Send + Sync {
    /// State for a newly registered thread (explicit mode only).
    fn init_thread_local(&self, _record: &ThreadRecord) -> Option<LocalAllocBlob> {
        None
    }

    /// The thread is leaving; release its state.
    fn destroy_thread_local(&self, blob: LocalAllocBlob) {
        drop(blob);
    }

    /// Push whatever in `blob` may reference the heap.
    fn mark_thread_local(&self, _blob: &LocalAllocBlob, _sink: &mut dyn RootSink) {}
}

/// Hooks for a collector without thread-local allocation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl AllocatorHooks for NoopHooks {}

/// Owned permission to join a thread started by [`CollectorRuntime::spawn`].
///
/// Dropping the handle detaches the thread.
#[derive(Debug)]
pub struct GcJoinHandle<T> {
    inner: Option<JoinHandle<T>>,
    runtime: Arc<CollectorRuntime>,
    ticket: u64,
    detach: Arc<AtomicBool>,
}

impl<T> GcJoinHandle<T> {
    /// Wait for the thread and reclaim its record.
    ///
    /// # Errors
    ///
    /// The thread's panic payload if it panicked.
    pub fn join(mut self) -> std::thread::Result<T> {
        let Some(inner) = self.inner.take() else {
            unreachable!("join handle consumed twice")
        };
        let result = inner.join();
        if self.runtime.mode() == RegistryMode::Explicit {
            let _guard = self.runtime.lock();
            if let Some(rec) = self.runtime.registry().lookup_secondary(self.ticket) {
                if rec.is_finished() {
                    let key = rec.key();
                    drop(rec);
                    self.runtime.registry().delete_key(key);
                }
            }
        }
        result
    }

    /// Let the thread run on; its record is reclaimed as soon as it
    /// finishes.
    pub fn detach(self) {
        drop(self);
    }

    /// The underlying standard handle's thread.
    ///
    /// # Panics
    ///
    /// Never: the handle is only consumed by `join` and `detach`.
    #[must_use]
    pub fn thread(&self) -> &std::thread::Thread {
        match &self.inner {
            Some(inner) => inner.thread(),
            None => unreachable!("join handle already consumed"),
        }
    }

    /// Whether the thread has finished running its closure.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner.as_ref().is_none_or(JoinHandle::is_finished)
    }

    fn detach_record(&self) {
        if self.runtime.mode() != RegistryMode::Explicit {
            return;
        }
        let _guard = self.runtime.lock();
        self.detach.store(true, Ordering::Release);
        let Some(rec) = self.runtime.registry().lookup_secondary(self.ticket) else {
            return;
        };
        if rec.is_finished() {
            let key = rec.key();
            drop(rec);
            self.runtime.registry().delete_key(key);
        } else {
            rec.set_flags(ThreadFlags::DETACHED);
        }
    }
}

impl<T> Drop for GcJoinHandle<T> {
    fn drop(&mut self) {
        if self.inner.is_some() {
            self.detach_record();
        }
    }
}

/// Retires the spawned thread's record when its closure returns or
/// unwinds.
struct SpawnExit<'a> {
    runtime: &'a CollectorRuntime,
}

impl Drop for SpawnExit<'_> {
    fn drop(&mut self) {
        if self.runtime.mode() == RegistryMode::Discovery {
            self.runtime.on_thread_detach();
            return;
        }
        let guard = self.runtime.lock();
        if let Some(rec) = self.runtime.current_record() {
            // Already unregistered by the closure itself.
            if !rec.is_finished() {
                self.runtime.retire(&guard, rec);
            }
        }
    }
}

/// Puts the thread back into its blocking bracket after
/// `call_with_gc_active`, also on unwind.
struct Reblock<'a> {
    runtime: &'a CollectorRuntime,
    section: &'a StackSection,
}

impl Drop for Reblock<'_> {
    fn drop(&mut self) {
        let _guard = self.runtime.lock();
        if let Some(rec) = self.runtime.current_record() {
            debug_assert!(!rec.is_blocking());
            rec.set_traced_stack_sect(self.section.prev);
            rec.set_stack_ptr(self.section.saved_stack_ptr);
            rec.set_flags(ThreadFlags::DO_BLOCKING);
        }
    }
}

/// Leaves the blocking bracket, also on unwind.
struct Unblock<'a> {
    runtime: &'a CollectorRuntime,
}

impl Drop for Unblock<'_> {
    fn drop(&mut self) {
        let _guard = self.runtime.lock();
        if let Some(rec) = self.runtime.current_record() {
            rec.clear_flags(ThreadFlags::DO_BLOCKING);
        }
    }
}

impl CollectorRuntime {
    /// Remove `rec` (the caller's) or mark it finished, after releasing its
    /// thread-local state. Detached records are freed at once.
    pub(crate) fn retire(&self, _guard: &AllocGuard<'_>, rec: crate::registry::RecordRef<'_>) -> bool {
        let blob = rec.local_alloc().take();
        if let Some(blob) = blob {
            self.hooks().destroy_thread_local(blob);
        }
        if rec.is_detached() {
            let key = rec.key();
            drop(rec);
            self.registry().delete_key(key);
            true
        } else {
            rec.set_flags(ThreadFlags::FINISHED);
            false
        }
    }

    /// Start a thread that is registered for its whole life.
    ///
    /// # Errors
    ///
    /// The OS could not create the thread.
    pub fn spawn<F, T>(self: &Arc<Self>, f: F) -> io::Result<GcJoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.spawn_with(None, false, f)
    }

    /// [`Self::spawn`] with a thread name, optionally detached from the
    /// start.
    ///
    /// The child registers itself before running `f`. A child that cannot
    /// register panics without running `f`; the panic surfaces through
    /// [`GcJoinHandle::join`].
    ///
    /// # Errors
    ///
    /// The OS could not create the thread.
    pub fn spawn_with<F, T>(
        self: &Arc<Self>,
        name: Option<String>,
        detached: bool,
        f: F,
    ) -> io::Result<GcJoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let ticket = self.next_spawn_ticket.fetch_add(1, Ordering::Relaxed);
        let detach = Arc::new(AtomicBool::new(detached));
        let runtime = Arc::clone(self);
        let child_detach = Arc::clone(&detach);

        let mut builder = std::thread::Builder::new();
        if let Some(name) = name {
            builder = builder.name(name);
        }
        let spawned = builder.spawn(move || {
            if let Err(err) = runtime.register_spawned(ticket, &child_detach) {
                panic!("failed to register spawned thread: {err}");
            }
            let _exit = SpawnExit { runtime: &runtime };
            f()
        });

        Ok(GcJoinHandle {
            inner: Some(spawned?),
            runtime: Arc::clone(self),
            ticket,
            detach,
        })
    }

    fn register_spawned(&self, ticket: u64, detach: &AtomicBool) -> Result<(), ThreadError> {
        if self.mode() == RegistryMode::Discovery {
            self.on_thread_attach();
            return Ok(());
        }
        let base = stack::current_stack_base().map_err(|e| ThreadError::StackBase(e.to_string()))?;
        let _registering = Registering::enter();
        let _guard = self.lock();
        let rec = self.add_thread(ThreadKey::current(), base)?;
        rec.set_secondary_id(ticket);
        if detach.load(Ordering::Acquire) {
            rec.set_flags(ThreadFlags::DETACHED);
        }
        Ok(())
    }

    /// Run `f` with the calling thread marked as blocking: collections
    /// neither suspend it nor scan the part of its stack `f` uses, so `f`
    /// must not touch collected memory.
    ///
    /// An unregistered caller just runs `f`.
    pub fn do_blocking<R>(&self, f: impl FnOnce() -> R) -> R {
        // Callee-saved registers may hold pointers; spill them into this
        // frame, which stays inside the scanned part of the stack.
        let spilled = spill_callee_saved();
        let out = self.do_blocking_inner(f);
        std::hint::black_box(&spilled);
        out
    }

    /// The recorded stack pointer lies in this frame, so everything `f`
    /// pushes is below it.
    #[inline(never)]
    fn do_blocking_inner<R>(&self, f: impl FnOnce() -> R) -> R {
        let entered = {
            let _guard = self.lock();
            match self.current_record() {
                Some(rec) => {
                    debug_assert!(!rec.is_blocking(), "do_blocking entered twice");
                    rec.set_stack_ptr(approximate_sp());
                    rec.set_flags(ThreadFlags::DO_BLOCKING);
                    true
                }
                None => false,
            }
        };
        if !entered {
            return f();
        }
        let _unblock = Unblock { runtime: self };
        f()
    }

    /// From inside [`Self::do_blocking`], run `f` with the thread active
    /// again. The stack between the two calls stays unscanned; the stack
    /// `f` uses is scanned.
    ///
    /// Outside a blocking bracket this just runs `f` (after raising the
    /// recorded stack base if this frame lies above it).
    pub fn call_with_gc_active<R>(&self, f: impl FnOnce() -> R) -> R {
        let guard = self.lock();
        let Some(rec) = self.current_record() else {
            drop(guard);
            return f();
        };
        let section = StackSection {
            saved_stack_ptr: rec.stack_ptr(),
            prev: rec.traced_stack_sect(),
        };
        if rec.stack_end() < section.addr() {
            rec.set_stack_end(section.addr());
        }
        if !rec.is_blocking() {
            drop(rec);
            drop(guard);
            return f();
        }
        rec.set_traced_stack_sect(&section);
        rec.clear_flags(ThreadFlags::DO_BLOCKING);
        drop(rec);
        drop(guard);

        let _reblock = Reblock {
            runtime: self,
            section: &section,
        };
        f()
    }

    /// Replace the stack base of `target` (the caller when `None`) and
    /// forget its cached stack minimum.
    ///
    /// # Errors
    ///
    /// [`ThreadError::NotRegistered`] if `target` is `None` and the caller
    /// has no record.
    pub fn set_stackbottom(
        &self,
        _guard: &AllocGuard<'_>,
        target: Option<&ThreadRecord>,
        base: StackBase,
    ) -> Result<(), ThreadError> {
        match target {
            Some(rec) => rec.record_stack_base(base),
            None => self
                .current_record()
                .ok_or(ThreadError::NotRegistered)?
                .record_stack_base(base),
        }
        self.prober.invalidate();
        Ok(())
    }

    /// The stack base recorded for the calling thread.
    ///
    /// # Errors
    ///
    /// [`ThreadError::NotRegistered`] if the caller has no record.
    pub fn get_my_stackbottom(&self) -> Result<StackBase, ThreadError> {
        let _guard = self.lock();
        self.current_record()
            .map(|rec| rec.stack_base())
            .ok_or(ThreadError::NotRegistered)
    }

    /// Discovery mode: the calling thread has just started. Never blocks.
    /// Aborts if the registry is full, since nobody could handle the error.
    pub fn on_thread_attach(&self) -> RegisterStatus {
        debug_assert_eq!(self.mode(), RegistryMode::Discovery);
        let status = {
            let _registering = Registering::enter();
            self.register_current_thread()
        };
        match status {
            Ok(status) => status,
            Err(err) => fatal!("Cannot register attached thread: {err}"),
        }
    }

    /// Discovery mode: the calling thread is exiting. Never blocks.
    pub fn on_thread_detach(&self) -> bool {
        let removed = self.registry().delete(ThreadKey::current());
        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_thread_unregistered(ThreadKey::current().0, removed);
        removed
    }

    /// Discovery mode: the process is going away. Drops every record.
    pub fn on_process_detach(&self) -> usize {
        self.registry().clear()
    }

    /// Decide whether the calling thread may run finalizers now. Returns
    /// the new nesting level, or `None` when this nested invocation should
    /// be skipped: at nesting level `n` only one call in `2^n` proceeds.
    #[must_use]
    pub fn check_finalizer_nested(&self, _guard: &AllocGuard<'_>) -> Option<u8> {
        let rec = self.current_record()?;
        let nested = rec.finalizer_nested().load(Ordering::Relaxed);
        if nested != 0 {
            let skipped = rec.finalizer_skipped().fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            let threshold = 1u32.checked_shl(u32::from(nested)).unwrap_or(u32::MAX);
            if u32::from(skipped) < threshold {
                return None;
            }
            rec.finalizer_skipped().store(0, Ordering::Relaxed);
        }
        let level = nested.saturating_add(1);
        rec.finalizer_nested().store(level, Ordering::Relaxed);
        Some(level)
    }

    /// The calling thread finished running finalizers.
    pub fn reset_finalizer_nested(&self, _guard: &AllocGuard<'_>) {
        if let Some(rec) = self.current_record() {
            rec.finalizer_nested().store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(unix)]
mod fork {
    use std::io;
    use std::sync::OnceLock;

    use crossbeam::atomic::AtomicCell;

    use crate::os::{refresh_thread_key, OsThread};
    use crate::record::ThreadKey;
    use crate::registry::RecordKey;
    use crate::runtime::CollectorRuntime;

    static FORK_RUNTIME: OnceLock<&'static CollectorRuntime> = OnceLock::new();
    static FORKING: AtomicCell<Option<RecordKey>> = AtomicCell::new(None);

    impl CollectorRuntime {
        /// Before `fork`: take every lock the child will need, so none is
        /// held by a thread that does not exist in the child.
        pub fn fork_prepare(&self) {
            self.alloc_lock().lock_and_forget();
            FORKING.store(self.current_record().map(|rec| rec.key()));
            if self.markers().is_parallel() {
                self.markers().wait_for_reclaim();
            }
            self.markers().lock_and_forget();
        }

        /// After `fork`, in the parent.
        pub fn fork_parent(&self) {
            FORKING.store(None);
            // SAFETY: both locks were taken by `fork_prepare` on this thread.
            unsafe {
                self.markers().force_unlock();
                self.alloc_lock().force_unlock();
            }
        }

        /// After `fork`, in the child: only the forking thread survives.
        /// Drop every other record and rebind the survivor to the child's
        /// thread.
        pub fn fork_child(&self) {
            // SAFETY: taken by `fork_prepare` in the parent; the child's only
            // thread is the one that took it.
            unsafe { self.markers().force_unlock() };
            self.markers().forget_helpers();
            refresh_thread_key();

            match FORKING.swap(None) {
                Some(key) => {
                    self.registry().retain_only(key);
                    match OsThread::current() {
                        Ok(handle) => {
                            self.registry().rebind(key, ThreadKey::current(), handle);
                        }
                        Err(_) => {
                            self.registry().clear();
                        }
                    }
                }
                None => {
                    self.registry().clear();
                }
            }
            self.please_stop.store(false, std::sync::atomic::Ordering::SeqCst);
            self.prober.invalidate();
            // SAFETY: as above, for the allocation lock.
            unsafe { self.alloc_lock().force_unlock() };
        }
    }

    extern "C" fn prepare() {
        if let Some(runtime) = FORK_RUNTIME.get() {
            runtime.fork_prepare();
        }
    }

    extern "C" fn parent() {
        if let Some(runtime) = FORK_RUNTIME.get() {
            runtime.fork_parent();
        }
    }

    extern "C" fn child() {
        if let Some(runtime) = FORK_RUNTIME.get() {
            runtime.fork_child();
        }
    }

    /// Run the fork handlers of `runtime` around every `fork` in the
    /// process. Only one runtime can be installed.
    ///
    /// # Errors
    ///
    /// Another runtime is already installed, or `pthread_atfork` failed.
    pub fn install_fork_handlers(runtime: &'static CollectorRuntime) -> io::Result<()> {
        if FORK_RUNTIME.set(runtime).is_err() {
            if FORK_RUNTIME.get().is_some_and(|r| std::ptr::eq(*r, runtime)) {
                return Ok(());
            }
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "fork handlers are installed for another runtime",
            ));
        }
        // SAFETY: the handlers are plain functions valid for the life of
        // the process.
        let rc = unsafe {
            libc::pthread_atfork(
                Some(prepare as unsafe extern "C" fn()),
                Some(parent as unsafe extern "C" fn()),
                Some(child as unsafe extern "C" fn()),
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(rc))
        }
    }
}

#[cfg(unix)]
pub use self::fork::install_fork_handlers;
