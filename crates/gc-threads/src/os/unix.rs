//! Signal-based suspension.
//!
//! POSIX cannot stop another thread directly, so each registered thread
//! carries a small handshake cell. The suspender marks the cell pending and
//! sends `SIG_SUSPEND`; the handler snapshots the interrupted registers into
//! the cell, publishes `SUSPENDED` and parks in `sigsuspend` until the cell
//! leaves that state and `SIG_RESUME` arrives. The handler never allocates,
//! never locks and preserves `errno`.

use std::cell::{Cell, UnsafeCell};
use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crossbeam::utils::Backoff;

use super::SuspendOutcome;
use crate::arch::{NativeRegisters, SuspendedContext};
use crate::error::SuspendError;
use crate::record::ThreadKey;

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        const SIG_SUSPEND: libc::c_int = libc::SIGPWR;
        const SIG_RESUME: libc::c_int = libc::SIGXCPU;
    } else {
        const SIG_SUSPEND: libc::c_int = libc::SIGUSR1;
        const SIG_RESUME: libc::c_int = libc::SIGUSR2;
    }
}

const RUNNING: u8 = 0;
const SUSPEND_PENDING: u8 = 1;
const SUSPENDED: u8 = 2;
const RESUME_PENDING: u8 = 3;

/// Spins between two checks for a vanished target.
const EXIT_POLL_INTERVAL: u32 = 64;

struct SuspendSync {
    state: AtomicU8,
    regs: UnsafeCell<NativeRegisters>,
    handler_sp: AtomicUsize,
}

// SAFETY: `regs` is written only by the owning thread's handler before it
// publishes SUSPENDED, and read only by a suspender that observed SUSPENDED.
unsafe impl Sync for SuspendSync {}

impl SuspendSync {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(RUNNING),
            regs: UnsafeCell::new(NativeRegisters::default()),
            handler_sp: AtomicUsize::new(0),
        }
    }
}

struct SyncOwner(Arc<SuspendSync>);

impl SyncOwner {
    fn new() -> Self {
        let sync = Arc::new(SuspendSync::new());
        CURRENT_SYNC.with(|cur| cur.set(Arc::as_ptr(&sync)));
        Self(sync)
    }
}

impl Drop for SyncOwner {
    fn drop(&mut self) {
        let _ = CURRENT_SYNC.try_with(|cur| cur.set(ptr::null()));
    }
}

thread_local! {
    // Read from the signal handler; const-initialised and without a
    // destructor, so access never allocates or registers anything.
    static CURRENT_SYNC: Cell<*const SuspendSync> = const { Cell::new(ptr::null()) };
    static SYNC_OWNER: SyncOwner = SyncOwner::new();
    static CACHED_KEY: Cell<u64> = const { Cell::new(0) };
}

/// Identifier of the calling thread.
pub(crate) fn current_thread_key() -> ThreadKey {
    let cached = CACHED_KEY.try_with(Cell::get).unwrap_or(0);
    if cached != 0 {
        return ThreadKey(cached);
    }
    let key = raw_thread_key();
    let _ = CACHED_KEY.try_with(|c| c.set(key));
    ThreadKey(key)
}

/// Forget the cached key. A forked child keeps the parent's thread-locals
/// but not its thread id.
pub(crate) fn refresh_thread_key() {
    let _ = CACHED_KEY.try_with(|c| c.set(0));
}

#[cfg(any(target_os = "linux", target_os = "android"))]
#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
fn gettid() -> libc::pid_t {
    // SAFETY: gettid has no preconditions.
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
#[allow(clippy::cast_sign_loss)]
fn raw_thread_key() -> u64 {
    gettid() as u64
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn raw_thread_key() -> u64 {
    // SAFETY: pthread_self has no preconditions.
    unsafe { libc::pthread_self() as usize as u64 }
}

/// Restores `errno` on drop, so a handler is invisible to the code it
/// interrupted.
struct ErrnoGuard(libc::c_int);

impl ErrnoGuard {
    fn save() -> Self {
        // SAFETY: errno_location returns this thread's errno slot.
        Self(unsafe { *errno_location() })
    }
}

impl Drop for ErrnoGuard {
    fn drop(&mut self) {
        // SAFETY: as above.
        unsafe { *errno_location() = self.0 };
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        unsafe fn errno_location() -> *mut libc::c_int {
            unsafe { libc::__errno_location() }
        }
    } else if #[cfg(any(target_os = "android", target_os = "netbsd", target_os = "openbsd"))] {
        unsafe fn errno_location() -> *mut libc::c_int {
            unsafe { libc::__errno() }
        }
    } else {
        unsafe fn errno_location() -> *mut libc::c_int {
            unsafe { libc::__error() }
        }
    }
}

#[cfg(target_os = "linux")]
unsafe fn capture(uc: *mut libc::c_void) -> NativeRegisters {
    if uc.is_null() {
        return NativeRegisters::default();
    }
    // SAFETY: the kernel passes a ucontext_t as the third argument.
    unsafe { crate::arch::from_ucontext(uc.cast::<libc::ucontext_t>()) }
}

// Register state lives in the signal frame below the handler's stack
// pointer, which is scanned anyway.
#[cfg(not(target_os = "linux"))]
unsafe fn capture(_uc: *mut libc::c_void) -> NativeRegisters {
    NativeRegisters::default()
}

extern "C" fn suspend_handler(_sig: libc::c_int, _info: *mut libc::siginfo_t, uc: *mut libc::c_void) {
    let _errno = ErrnoGuard::save();
    let sync = CURRENT_SYNC.with(Cell::get);
    if sync.is_null() {
        return;
    }
    // SAFETY: the owner clears the pointer before dropping its Arc, and the
    // owner's destructor runs on this same thread.
    let sync = unsafe { &*sync };
    if sync.state.load(Ordering::Acquire) != SUSPEND_PENDING {
        return;
    }

    let marker = 0usize;
    let sp = std::hint::black_box(ptr::addr_of!(marker)) as usize;
    // SAFETY: only this handler writes `regs`, and only before SUSPENDED.
    unsafe { *sync.regs.get() = capture(uc) };
    sync.handler_sp.store(sp, Ordering::Relaxed);
    sync.state.store(SUSPENDED, Ordering::Release);

    // SAFETY: plain signal-set manipulation on a local.
    unsafe {
        let mut wait_mask: libc::sigset_t = mem::zeroed();
        libc::sigfillset(&raw mut wait_mask);
        libc::sigdelset(&raw mut wait_mask, SIG_RESUME);
        while sync.state.load(Ordering::Acquire) == SUSPENDED {
            libc::sigsuspend(&raw const wait_mask);
        }
    }
    sync.state.store(RUNNING, Ordering::Release);
}

extern "C" fn resume_handler(_sig: libc::c_int, _info: *mut libc::siginfo_t, _uc: *mut libc::c_void) {}

static HANDLERS: OnceLock<Result<(), i32>> = OnceLock::new();

fn install_handlers() -> io::Result<()> {
    let installed = HANDLERS.get_or_init(|| {
        // SAFETY: both handlers are async-signal-safe.
        unsafe {
            install(SIG_SUSPEND, suspend_handler as libc::sighandler_t)?;
            install(SIG_RESUME, resume_handler as libc::sighandler_t)
        }
    });
    (*installed).map_err(io::Error::from_raw_os_error)
}

unsafe fn install(sig: libc::c_int, handler: libc::sighandler_t) -> Result<(), i32> {
    // SAFETY: a zeroed sigaction is a valid starting point.
    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    action.sa_sigaction = handler;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
    // Everything stays blocked while a handler runs; in particular
    // SIG_RESUME stays pending until sigsuspend unblocks it.
    unsafe {
        libc::sigfillset(&raw mut action.sa_mask);
        if libc::sigaction(sig, &raw const action, ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL));
        }
    }
    Ok(())
}

/// Handle to a registered thread.
///
/// Holds a reference to the thread's handshake cell; the cell outlives the
/// thread if the handle does.
pub struct OsThread {
    #[cfg_attr(any(target_os = "linux", target_os = "android"), allow(dead_code))]
    pthread: libc::pthread_t,
    #[cfg(any(target_os = "linux", target_os = "android"))]
    tid: libc::pid_t,
    sync: Arc<SuspendSync>,
}

// SAFETY: pthread_t is an opaque identifier; it is only passed back to
// pthread functions, never dereferenced.
unsafe impl Send for OsThread {}
// SAFETY: as above; all mutable state is atomic.
unsafe impl Sync for OsThread {}

impl std::fmt::Debug for OsThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OsThread")
            .field("key", &self.key())
            .field("state", &self.sync.state.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl OsThread {
    /// Handle to the calling thread. Installs the suspend handlers on first
    /// use.
    ///
    /// # Errors
    ///
    /// Fails if the handlers cannot be installed or the thread is already
    /// tearing down its thread-locals.
    pub fn current() -> io::Result<Self> {
        install_handlers()?;
        let sync = SYNC_OWNER
            .try_with(|owner| Arc::clone(&owner.0))
            .map_err(|_| io::Error::other("thread-local storage already destroyed"))?;
        Ok(Self {
            // SAFETY: pthread_self has no preconditions.
            pthread: unsafe { libc::pthread_self() },
            #[cfg(any(target_os = "linux", target_os = "android"))]
            tid: gettid(),
            sync,
        })
    }

    /// Key of the thread this handle refers to.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn key(&self) -> ThreadKey {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            ThreadKey(self.tid as u64)
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            ThreadKey(self.pthread as usize as u64)
        }
    }

    /// Whether the thread has terminated or is past the point of running
    /// user code.
    #[must_use]
    pub fn has_exited(&self) -> bool {
        if Arc::strong_count(&self.sync) == 1 {
            return true;
        }
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            matches!(self.signal(0), Err(e) if e.raw_os_error() == Some(libc::ESRCH))
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            false
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn signal(&self, sig: libc::c_int) -> io::Result<()> {
        // SAFETY: tgkill on our own process only.
        let rc = unsafe { libc::syscall(libc::SYS_tgkill, libc::getpid(), self.tid, sig) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn signal(&self, sig: libc::c_int) -> io::Result<()> {
        // SAFETY: the thread is alive; `has_exited` was checked by the caller
        // and the handshake cell keeps it from being recycled unnoticed.
        let rc = unsafe { libc::pthread_kill(self.pthread, sig) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(rc))
        }
    }

    /// Stop the thread and capture its registers.
    ///
    /// `abandoned` is polled while waiting; returning true (the record was
    /// torn down under us) ends the wait with [`SuspendOutcome::Exited`].
    /// Makes no allocation and takes no lock.
    ///
    /// # Errors
    ///
    /// [`SuspendError::RetriesExhausted`] once `budget` attempts pass without
    /// an acknowledgement, [`SuspendError::Os`] if the signal cannot be sent.
    pub fn suspend(
        &self,
        budget: u32,
        abandoned: &dyn Fn() -> bool,
    ) -> Result<SuspendOutcome, SuspendError> {
        if self.has_exited() {
            return Ok(SuspendOutcome::Exited);
        }
        let prev = self.sync.state.swap(SUSPEND_PENDING, Ordering::AcqRel);
        debug_assert_eq!(prev, RUNNING, "thread suspended twice");

        let mut attempts = 0u32;
        loop {
            match self.signal(SIG_SUSPEND) {
                Ok(()) => break,
                Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {
                    self.sync.state.store(RUNNING, Ordering::Release);
                    return Ok(SuspendOutcome::Exited);
                }
                Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => {
                    attempts = attempts.saturating_add(1);
                    if attempts >= budget {
                        self.sync.state.store(RUNNING, Ordering::Release);
                        return Err(SuspendError::RetriesExhausted { attempts });
                    }
                    std::thread::yield_now();
                }
                Err(e) => {
                    self.sync.state.store(RUNNING, Ordering::Release);
                    return Err(e.into());
                }
            }
        }

        let backoff = Backoff::new();
        while self.sync.state.load(Ordering::Acquire) != SUSPENDED {
            attempts = attempts.saturating_add(1);
            let gave_up = attempts >= budget;
            if gave_up || (attempts % EXIT_POLL_INTERVAL == 0 && (abandoned() || self.has_exited())) {
                // A late handler sees RUNNING and returns at once. If the
                // handler won the race the thread is stopped after all.
                if self
                    .sync
                    .state
                    .compare_exchange(SUSPEND_PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return if gave_up {
                        Err(SuspendError::RetriesExhausted { attempts })
                    } else {
                        Ok(SuspendOutcome::Exited)
                    };
                }
                break;
            }
            if backoff.is_completed() {
                std::thread::yield_now();
            } else {
                backoff.snooze();
            }
        }

        // SAFETY: SUSPENDED was observed with Acquire; the handler wrote
        // `regs` before its Release store.
        let regs = unsafe { *self.sync.regs.get() };
        let handler_sp = self.sync.handler_sp.load(Ordering::Relaxed);
        let interrupted = crate::arch::RegisterSnapshot::stack_pointer(&regs);
        let sp = if interrupted == 0 || handler_sp < interrupted {
            handler_sp
        } else {
            interrupted
        };
        Ok(SuspendOutcome::Suspended(SuspendedContext {
            regs,
            sp,
            trustworthy: true,
        }))
    }

    /// Let a suspended thread continue and wait until it has left the
    /// handler. A thread that is not suspended is left alone.
    ///
    /// # Errors
    ///
    /// [`SuspendError::Os`] if the wake-up signal cannot be sent.
    pub fn resume(&self) -> Result<(), SuspendError> {
        if self
            .sync
            .state
            .compare_exchange(SUSPENDED, RESUME_PENDING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        match self.signal(SIG_RESUME) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {
                self.sync.state.store(RUNNING, Ordering::Release);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
        let backoff = Backoff::new();
        while self.sync.state.load(Ordering::Acquire) == RESUME_PENDING {
            if backoff.is_completed() {
                std::thread::yield_now();
            } else {
                backoff.snooze();
            }
        }
        Ok(())
    }
}
