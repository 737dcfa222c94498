//! The collector runtime: one context object owning every piece of
//! process-wide thread state.

use std::cell::Cell;
use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use crate::config::{RegistryMode, RuntimeConfig};
use crate::error::{RegistryError, ThreadError};
use crate::lifecycle::AllocatorHooks;
use crate::marker::MarkerPool;
use crate::metrics::{GlobalMetrics, WorldMetrics};
use crate::os::OsThread;
use crate::record::{ThreadFlags, ThreadKey, ThreadRecord};
use crate::registry::{self, RecordRef, ThreadRegistry};
use crate::stack::{self, StackBase, StackProber};
use crate::sync::{AllocGuard, AllocLock, LockOrder};
use crate::world::Deferred;

/// Warnings raised while the world is stopped, kept until it restarts.
const DEFERRED_CAPACITY: usize = 64;

thread_local!(static REGISTERING: Cell<u32> = const { Cell::new(0) });

/// Marks the calling thread as registering itself until dropped. Root
/// discovery run from such a thread tolerates not finding its record.
pub(crate) struct Registering(());

impl Registering {
    pub(crate) fn enter() -> Self {
        REGISTERING.with(|depth| depth.set(depth.get() + 1));
        Self(())
    }

    /// Whether the calling thread is inside a registration.
    pub(crate) fn in_progress() -> bool {
        REGISTERING.with(|depth| depth.get() > 0)
    }
}

impl Drop for Registering {
    fn drop(&mut self) {
        REGISTERING.with(|depth| depth.set(depth.get() - 1));
    }
}

/// Outcome of a registration request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterStatus {
    /// The thread is now registered.
    Success,
    /// The thread was already registered and running; nothing changed.
    Duplicate,
}

impl RegisterStatus {
    /// Treat [`Self::Duplicate`] as an error.
    ///
    /// # Errors
    ///
    /// [`ThreadError::AlreadyRegistered`] for a duplicate.
    pub const fn require_new(self) -> Result<(), ThreadError> {
        match self {
            Self::Success => Ok(()),
            Self::Duplicate => Err(ThreadError::AlreadyRegistered),
        }
    }
}

/// Thread registry, stop-the-world state and mark helpers of one collector.
///
/// Created once with [`CollectorRuntime::init`], which registers the
/// calling thread. Collaborators get at everything through this object
/// instead of through globals.
///
/// ```no_run
/// use gc_threads::{CollectedRoots, CollectorRuntime, RuntimeConfig};
///
/// let runtime = CollectorRuntime::init(RuntimeConfig::new()).unwrap();
/// assert!(runtime.is_thread_registered());
/// let mut roots = CollectedRoots::with_capacity(16, 256);
/// runtime.with_world_stopped(|world| world.push_all_stacks(&mut roots));
/// assert!(roots.bytes() > 0);
/// ```
pub struct CollectorRuntime {
    config: RuntimeConfig,
    alloc_lock: AllocLock,
    registry: Box<dyn ThreadRegistry>,
    markers: MarkerPool,
    pub(crate) prober: StackProber,
    pub(crate) metrics: GlobalMetrics,
    pub(crate) deferred: ArrayQueue<Deferred>,
    pub(crate) please_stop: AtomicBool,
    pub(crate) attached_during_stop: AtomicBool,
    pub(crate) world_stopped: AtomicBool,
    pub(crate) next_spawn_ticket: AtomicU64,
}

impl CollectorRuntime {
    /// Build a runtime and register the calling thread with it.
    ///
    /// # Errors
    ///
    /// Fails if the calling thread's stack cannot be located or registered.
    pub fn init(config: RuntimeConfig) -> Result<Arc<Self>, ThreadError> {
        let registry = registry::for_mode(config.mode, config.discovery_capacity, config.max_threads);
        let markers = MarkerPool::new(config.effective_markers(), config.use_parallel());
        let runtime = Arc::new(Self {
            config,
            alloc_lock: AllocLock::new((), LockOrder::Allocation),
            registry,
            markers,
            prober: StackProber::new(),
            metrics: GlobalMetrics::default(),
            deferred: ArrayQueue::new(DEFERRED_CAPACITY),
            please_stop: AtomicBool::new(false),
            attached_during_stop: AtomicBool::new(false),
            world_stopped: AtomicBool::new(false),
            next_spawn_ticket: AtomicU64::new(1),
        });
        runtime.register_current_thread()?;
        Ok(runtime)
    }

    /// The configuration the runtime was built with.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// How threads are tracked.
    #[must_use]
    pub const fn mode(&self) -> RegistryMode {
        self.config.mode
    }

    pub(crate) fn hooks(&self) -> &dyn AllocatorHooks {
        &*self.config.hooks
    }

    /// Acquire the allocation lock.
    pub fn lock(&self) -> AllocGuard<'_> {
        self.alloc_lock.lock()
    }

    /// Acquire the allocation lock if it is free.
    pub fn try_lock(&self) -> Option<AllocGuard<'_>> {
        self.alloc_lock.try_lock()
    }

    /// Acquire the allocation lock once no collection is in progress.
    ///
    /// There is no incremental collection, so a collection never outlives
    /// the allocation lock and this is [`Self::lock`].
    pub fn wait_for_gc_completion(&self) -> AllocGuard<'_> {
        self.lock()
    }

    pub(crate) fn alloc_lock(&self) -> &AllocLock {
        &self.alloc_lock
    }

    pub(crate) fn assert_holds_lock(&self) {
        debug_assert!(
            self.alloc_lock.held_by_current_thread(),
            "allocation lock not held by the current thread"
        );
    }

    /// The thread registry.
    #[must_use]
    pub fn registry(&self) -> &dyn ThreadRegistry {
        &*self.registry
    }

    /// The mark helper pool.
    #[must_use]
    pub const fn markers(&self) -> &MarkerPool {
        &self.markers
    }

    /// Start the mark helpers if parallel marking is allowed. Must not be
    /// called with the world stopped.
    pub fn start_mark_threads(&self) -> usize {
        debug_assert!(!self.world_stopped.load(Ordering::Acquire));
        self.markers.start()
    }

    /// Statistics collected so far.
    #[must_use]
    pub fn metrics(&self) -> WorldMetrics {
        self.metrics.snapshot()
    }

    /// The calling thread's record, looked up the way the mode allows:
    /// lock-free in discovery mode, under the allocation lock otherwise.
    pub(crate) fn current_record(&self) -> Option<RecordRef<'_>> {
        self.registry.lookup(ThreadKey::current())
    }

    /// Register the calling thread with an explicit stack base.
    ///
    /// # Errors
    ///
    /// Registry exhaustion or a failure to obtain an OS handle.
    pub fn register_thread(&self, base: StackBase) -> Result<RegisterStatus, ThreadError> {
        let me = ThreadKey::current();
        if self.mode() == RegistryMode::Discovery {
            if self.registry.lookup(me).is_some() {
                return Ok(RegisterStatus::Duplicate);
            }
            self.add_thread(me, base)?;
            return Ok(RegisterStatus::Success);
        }

        let _guard = self.lock();
        if let Some(rec) = self.registry.lookup(me) {
            if !rec.is_finished() {
                return Ok(RegisterStatus::Duplicate);
            }
            // A finished record of a dead thread whose id the OS reused
            // stays with its joiner.
            if rec.with_handle(|h| !h.has_exited()).unwrap_or(false) {
                rec.record_stack_base(base);
                rec.clear_flags(ThreadFlags::FINISHED);
                return Ok(RegisterStatus::Success);
            }
        }
        let rec = self.add_thread(me, base)?;
        // Nobody joins a thread that registered itself.
        rec.set_flags(ThreadFlags::DETACHED);
        Ok(RegisterStatus::Success)
    }

    /// Register the calling thread, locating its stack base.
    ///
    /// # Errors
    ///
    /// As [`Self::register_thread`], plus [`ThreadError::StackBase`].
    pub fn register_current_thread(&self) -> Result<RegisterStatus, ThreadError> {
        let base = stack::current_stack_base().map_err(|e| ThreadError::StackBase(e.to_string()))?;
        self.register_thread(base)
    }

    /// Create a record for `me`. Explicit mode: the caller holds the
    /// allocation lock.
    pub(crate) fn add_thread(&self, me: ThreadKey, base: StackBase) -> Result<RecordRef<'_>, ThreadError> {
        let handle = OsThread::current().map_err(|e| RegistryError::Handle(e.to_string()))?;
        let rec = self.registry.register(me, base, handle)?;
        // Pairs with the fence in `stop_world`.
        fence(Ordering::SeqCst);
        if self.please_stop.load(Ordering::SeqCst) {
            self.attached_during_stop.store(true, Ordering::SeqCst);
        }
        if self.mode() == RegistryMode::Explicit {
            if let Some(blob) = self.hooks().init_thread_local(&rec) {
                *rec.local_alloc() = Some(blob);
            }
        }
        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_thread_registered(me.0, self.mode());
        Ok(rec)
    }

    /// Unregister the calling thread.
    ///
    /// A thread registered through [`Self::register_thread`] is detached,
    /// so its record is freed at once. A thread started by
    /// [`Self::spawn`] keeps a finished record until joined.
    ///
    /// # Errors
    ///
    /// [`ThreadError::NotRegistered`] if the thread has no record.
    pub fn unregister_thread(&self) -> Result<(), ThreadError> {
        let me = ThreadKey::current();
        if self.mode() == RegistryMode::Discovery {
            if !self.registry.delete(me) {
                return Err(ThreadError::NotRegistered);
            }
            #[cfg(feature = "tracing")]
            crate::tracing::internal::log_thread_unregistered(me.0, true);
            return Ok(());
        }

        let guard = self.lock();
        let rec = self
            .registry
            .lookup(me)
            .filter(|rec| !rec.is_finished())
            .ok_or(ThreadError::NotRegistered)?;
        let reclaimed = self.retire(&guard, rec);
        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_thread_unregistered(me.0, reclaimed);
        #[cfg(not(feature = "tracing"))]
        let _ = reclaimed;
        Ok(())
    }

    /// Whether the calling thread has a live record.
    #[must_use]
    pub fn is_thread_registered(&self) -> bool {
        if self.mode() == RegistryMode::Discovery {
            return self.current_record().is_some();
        }
        let _guard = self.lock();
        self.current_record().is_some_and(|rec| !rec.is_finished())
    }

    /// Number of records with a published stack.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        if self.mode() == RegistryMode::Discovery {
            return self.registry.active_count();
        }
        let _guard = self.lock();
        self.registry.active_count()
    }

    /// Visit every record while holding the allocation lock.
    pub fn for_each_thread(&self, f: &mut dyn FnMut(&ThreadRecord)) {
        let _guard = self.lock();
        self.registry.for_each(&mut |rec| {
            if rec.stack_end() != 0 {
                f(rec);
            }
        });
    }
}

impl std::fmt::Debug for CollectorRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorRuntime")
            .field("config", &self.config)
            .field("markers", &self.markers)
            .field("world_stopped", &self.world_stopped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
