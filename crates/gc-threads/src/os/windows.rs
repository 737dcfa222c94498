use std::io;
use std::mem;

use windows_sys::Win32::Foundation::{
    CloseHandle, DuplicateHandle, DUPLICATE_SAME_ACCESS, FALSE, HANDLE,
};
use windows_sys::Win32::System::Diagnostics::Debug::{GetThreadContext, CONTEXT};
use windows_sys::Win32::System::Threading::{
    GetCurrentProcess, GetCurrentThread, GetCurrentThreadId, GetExitCodeThread, ResumeThread,
    Sleep, SuspendThread,
};

use super::SuspendOutcome;
use crate::arch::{self, SuspendedContext};
use crate::error::SuspendError;
use crate::record::ThreadKey;

const STILL_ACTIVE: u32 = 259;

/// Ask the kernel to report whether the context may be stale (WoW64 and
/// threads suspended inside a system call).
const CONTEXT_EXCEPTION_REQUEST: u32 = 0x4000_0000;
const CONTEXT_EXCEPTION_REPORTING: u32 = 0x8000_0000;
const CONTEXT_EXCEPTION_ACTIVE: u32 = 0x0800_0000;
const CONTEXT_SERVICE_ACTIVE: u32 = 0x1000_0000;

const SUSPEND_FAILED: u32 = u32::MAX;

pub(crate) fn current_thread_key() -> ThreadKey {
    // SAFETY: no preconditions.
    ThreadKey(u64::from(unsafe { GetCurrentThreadId() }))
}

/// A duplicated thread handle, closed on drop.
#[derive(Debug)]
pub struct OsThread {
    handle: HANDLE,
    id: u32,
}

// SAFETY: a real (duplicated) thread handle may be used from any thread.
unsafe impl Send for OsThread {}
// SAFETY: as above.
unsafe impl Sync for OsThread {}

impl OsThread {
    /// Duplicate the calling thread's pseudo-handle into a real one.
    ///
    /// # Errors
    ///
    /// Fails if `DuplicateHandle` does.
    pub fn current() -> io::Result<Self> {
        let mut handle: HANDLE = std::ptr::null_mut();
        // SAFETY: duplicating our own pseudo-handles into our own process.
        let ok = unsafe {
            let process = GetCurrentProcess();
            DuplicateHandle(
                process,
                GetCurrentThread(),
                process,
                &raw mut handle,
                0,
                FALSE,
                DUPLICATE_SAME_ACCESS,
            )
        };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            handle,
            // SAFETY: no preconditions.
            id: unsafe { GetCurrentThreadId() },
        })
    }

    /// Key of the thread this handle refers to.
    #[must_use]
    pub fn key(&self) -> ThreadKey {
        ThreadKey(u64::from(self.id))
    }

    /// Whether the thread has terminated.
    #[must_use]
    pub fn has_exited(&self) -> bool {
        let mut code = 0u32;
        // SAFETY: the handle is owned and open.
        let ok = unsafe { GetExitCodeThread(self.handle, &raw mut code) };
        ok != 0 && code != STILL_ACTIVE
    }

    /// Suspend the thread and fetch its context.
    ///
    /// `SuspendThread` may succeed while `GetThreadContext` fails (for
    /// example when the thread is in the middle of being created or torn
    /// down); then the thread is resumed and the whole step retried.
    ///
    /// # Errors
    ///
    /// [`SuspendError::RetriesExhausted`] after `budget` attempts,
    /// [`SuspendError::Os`] if a resume in the retry path fails.
    pub fn suspend(
        &self,
        budget: u32,
        abandoned: &dyn Fn() -> bool,
    ) -> Result<SuspendOutcome, SuspendError> {
        let mut attempts = 0u32;
        loop {
            if self.has_exited() || abandoned() {
                return Ok(SuspendOutcome::Exited);
            }
            // SAFETY: the handle is owned and open.
            if unsafe { SuspendThread(self.handle) } != SUSPEND_FAILED {
                // SAFETY: CONTEXT is plain data; zero is a valid value.
                let mut ctx: CONTEXT = unsafe { mem::zeroed() };
                ctx.ContextFlags = arch::CONTEXT_FLAGS | CONTEXT_EXCEPTION_REQUEST;
                // SAFETY: the thread is suspended and `ctx` is aligned.
                if unsafe { GetThreadContext(self.handle, &raw mut ctx) } != 0 {
                    let regs = arch::from_context(&ctx);
                    let mut context = SuspendedContext::from_registers(regs);
                    context.trustworthy = context_is_trustworthy(ctx.ContextFlags);
                    return Ok(SuspendOutcome::Suspended(context));
                }
                // SAFETY: we suspended it above.
                if unsafe { ResumeThread(self.handle) } == SUSPEND_FAILED {
                    return Err(io::Error::last_os_error().into());
                }
            }
            attempts = attempts.saturating_add(1);
            if attempts >= budget {
                return Err(SuspendError::RetriesExhausted { attempts });
            }
            if attempts > 1 {
                // SAFETY: no preconditions.
                unsafe { Sleep(0) };
            }
        }
    }

    /// Undo one successful [`Self::suspend`].
    ///
    /// # Errors
    ///
    /// [`SuspendError::Os`] if `ResumeThread` fails.
    pub fn resume(&self) -> Result<(), SuspendError> {
        // SAFETY: the handle is owned and open.
        if unsafe { ResumeThread(self.handle) } == SUSPEND_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }
}

impl Drop for OsThread {
    fn drop(&mut self) {
        // SAFETY: the handle was duplicated for us and is closed once.
        unsafe { CloseHandle(self.handle) };
    }
}

const fn context_is_trustworthy(flags: u32) -> bool {
    flags & CONTEXT_EXCEPTION_REPORTING == 0
        || flags & (CONTEXT_EXCEPTION_ACTIVE | CONTEXT_SERVICE_ACTIVE) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trustworthiness_flags() {
        assert!(context_is_trustworthy(0));
        assert!(context_is_trustworthy(CONTEXT_EXCEPTION_REPORTING));
        assert!(!context_is_trustworthy(
            CONTEXT_EXCEPTION_REPORTING | CONTEXT_SERVICE_ACTIVE
        ));
        assert!(!context_is_trustworthy(
            CONTEXT_EXCEPTION_REPORTING | CONTEXT_EXCEPTION_ACTIVE
        ));
    }

    #[test]
    fn test_exited_thread_is_detected() {
        let handle = std::thread::spawn(|| OsThread::current().unwrap())
            .join()
            .unwrap();
        assert!(handle.has_exited());
    }
}
