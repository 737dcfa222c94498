//! Thread-layer tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! spans and events for registration, world stops and parallel marking.
//! Events describing a stop are emitted after the world restarts: a
//! subscriber may allocate or lock, and a suspended thread may hold either.
//! Warnings are always printed; with the feature they are also emitted as
//! `tracing` events.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{span, Level};

    use crate::config::RegistryMode;

    /// Identifier correlating every event of one stop-the-world cycle.
    ///
    /// Monotonically increasing, starting at 1.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate the next unique cycle id.
    pub fn next_gc_id() -> GcId {
        GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Span covering a whole stopped-world section.
    pub fn trace_world_stopped(gc_id: GcId) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_world_stopped", gc_id = gc_id.0).entered()
    }

    /// A thread was added to the registry.
    pub fn log_thread_registered(thread_id: u64, mode: RegistryMode) {
        tracing::debug!(thread_id, mode = ?mode, "thread_registered");
    }

    /// A thread left the registry (or was marked finished).
    pub fn log_thread_unregistered(thread_id: u64, reclaimed: bool) {
        tracing::debug!(thread_id, reclaimed, "thread_unregistered");
    }

    /// Summary of a completed stop.
    pub fn log_world_stopped(suspended: usize, blocking_skipped: usize) {
        tracing::debug!(suspended, blocking_skipped, "world_stopped");
    }

    /// Summary of a completed restart.
    pub fn log_world_started(resumed: usize, reclaimed: usize) {
        tracing::debug!(resumed, reclaimed, "world_started");
    }

    /// Stack bytes pushed by the last root discovery of a stop.
    pub fn log_roots_pushed(bytes: usize) {
        tracing::debug!(bytes, "roots_pushed");
    }

    /// Helper threads came up.
    pub fn log_markers_started(helpers: usize) {
        tracing::debug!(helpers, "markers_started");
    }

    /// Parallel marking was switched off for good.
    pub fn log_parallel_mark_disabled(reason: &str) {
        tracing::info!(reason, "parallel_mark_disabled");
    }
}

#[cfg(not(feature = "tracing"))]
pub mod internal {
    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    /// Stub function when tracing is disabled.
    pub const fn next_gc_id() -> GcId {
        GcId(0)
    }
}

pub use internal::GcId;

/// Print a collector warning.
///
/// Must not be called while other threads are suspended: writing to stderr
/// may need a lock one of them holds.
pub(crate) fn warn(args: std::fmt::Arguments<'_>) {
    #[cfg(feature = "tracing")]
    tracing::warn!("{}", args);
    eprintln!("[GC] {args}");
}
