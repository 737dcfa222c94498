//! Error types and the fatal-abort path.
//!
//! Resource exhaustion and misuse come back as `Result`s. Consistency
//! violations (a collecting thread missing from the registry, a thread that
//! cannot be suspended or resumed) go through [`fatal!`], which aborts: a
//! collector that continues past them would scan garbage or lose roots.

use thiserror::Error;

/// Failures adding a record to a registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Every slot of the table (or the configured record limit) is in use.
    #[error("thread registry is full ({capacity} records)")]
    Full {
        /// The exhausted capacity.
        capacity: usize,
    },
    /// The allocator could not supply memory for a new record.
    #[error("out of memory allocating a thread record")]
    OutOfMemory,
    /// The OS refused to hand out a handle for the thread.
    #[error("failed to obtain thread handle: {0}")]
    Handle(String),
}

/// Failures of the thread-facing API.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ThreadError {
    /// The calling thread has no record.
    #[error("thread is not registered")]
    NotRegistered,
    /// The calling thread already has a live record.
    #[error("thread is already registered")]
    AlreadyRegistered,
    /// The registry could not take the thread.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// The bounds of the current stack could not be determined.
    #[error("cannot determine stack base: {0}")]
    StackBase(String),
}

/// Failures of the OS suspend/resume primitives.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SuspendError {
    /// The suspend request kept failing transiently until the retry
    /// budget ran out.
    #[error("thread could not be suspended after {attempts} attempts")]
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
    },
    /// The OS reported a hard failure.
    #[error("os error: {0}")]
    Os(String),
}

impl From<std::io::Error> for SuspendError {
    fn from(err: std::io::Error) -> Self {
        Self::Os(err.to_string())
    }
}

/// Report an unrecoverable inconsistency and abort the process.
#[macro_export]
#[doc(hidden)]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::error::abort_with(::std::format_args!($($arg)*))
    };
}

#[doc(hidden)]
#[cold]
#[inline(never)]
pub fn abort_with(args: std::fmt::Arguments<'_>) -> ! {
    #[cfg(feature = "tracing")]
    tracing::error!("{}", args);
    eprintln!("[GC] FATAL: {args}");
    std::process::abort()
}
