//! OS thread handles and the suspend/resume primitives.
//!
//! An [`OsThread`] is obtained by a thread for itself and then owned by
//! exactly one registry record; dropping it releases whatever the platform
//! needed to keep the thread addressable.

use crate::arch::SuspendedContext;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use self::unix::OsThread;
        pub(crate) use self::unix::{current_thread_key, refresh_thread_key};
    } else if #[cfg(windows)] {
        mod windows;
        pub use self::windows::OsThread;
        pub(crate) use self::windows::current_thread_key;
    } else {
        compile_error!("gc-threads supports unix and windows targets only");
    }
}

/// Result of trying to stop one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendOutcome {
    /// The thread is stopped; its state is attached.
    Suspended(SuspendedContext),
    /// The thread had already terminated.
    Exited,
}
