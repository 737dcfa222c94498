//! Runtime configuration.
//!
//! A [`RuntimeConfig`] is consumed once by
//! [`CollectorRuntime::init`](crate::CollectorRuntime::init); the registry
//! mode in particular can never change afterwards.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::lifecycle::{AllocatorHooks, NoopHooks};

/// Upper bound on the number of markers, the primary thread included.
pub const MAX_MARKERS: usize = 16;

/// Default capacity of the lock-free discovery table.
pub const MAX_DISCOVERY_THREADS: usize = 512;

/// Default number of attempts to suspend a single thread before giving up.
pub const MAX_SUSPEND_RETRIES: u32 = 1_000_000;

/// How the runtime learns about threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistryMode {
    /// Threads register and unregister themselves; the registry is a
    /// chained hash table guarded by the allocation lock.
    #[default]
    Explicit,
    /// Threads are reported by process-wide attach/detach notifications,
    /// which may arrive where blocking is unsafe; the registry is a
    /// fixed-size lock-free table.
    Discovery,
}

/// Configuration for a [`CollectorRuntime`](crate::CollectorRuntime).
///
/// # Example
///
/// ```
/// use gc_threads::{RegistryMode, RuntimeConfig};
///
/// let config = RuntimeConfig::new()
///     .mode(RegistryMode::Explicit)
///     .markers(4)
///     .max_threads(Some(64));
/// assert_eq!(config.effective_markers(), 4);
/// ```
#[derive(Clone)]
pub struct RuntimeConfig {
    pub(crate) mode: RegistryMode,
    pub(crate) markers: usize,
    pub(crate) parallel_mark: bool,
    pub(crate) discovery_capacity: usize,
    pub(crate) max_threads: Option<usize>,
    pub(crate) suspend_retry_budget: u32,
    pub(crate) hooks: Arc<dyn AllocatorHooks>,
}

impl RuntimeConfig {
    /// Explicit registration, automatic marker count, parallel marking on.
    #[must_use]
    pub fn new() -> Self {
        Self {
            mode: RegistryMode::Explicit,
            markers: 0,
            parallel_mark: true,
            discovery_capacity: MAX_DISCOVERY_THREADS,
            max_threads: None,
            suspend_retry_budget: MAX_SUSPEND_RETRIES,
            hooks: Arc::new(NoopHooks),
        }
    }

    /// Select the registry mode.
    #[must_use]
    pub const fn mode(mut self, mode: RegistryMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the total number of markers (primary included). `0` picks the
    /// number of available CPUs. Values above [`MAX_MARKERS`] are clamped.
    #[must_use]
    pub const fn markers(mut self, markers: usize) -> Self {
        self.markers = markers;
        self
    }

    /// Allow or forbid parallel marking.
    #[must_use]
    pub const fn parallel_mark(mut self, enabled: bool) -> Self {
        self.parallel_mark = enabled;
        self
    }

    /// Capacity of the discovery table.
    #[must_use]
    pub const fn discovery_capacity(mut self, capacity: usize) -> Self {
        self.discovery_capacity = capacity;
        self
    }

    /// Limit the number of records the explicit registry will hold.
    #[must_use]
    pub const fn max_threads(mut self, limit: Option<usize>) -> Self {
        self.max_threads = limit;
        self
    }

    /// Attempts allowed per thread before suspension is declared hung.
    #[must_use]
    pub const fn suspend_retry_budget(mut self, budget: u32) -> Self {
        self.suspend_retry_budget = budget;
        self
    }

    /// Install thread-local allocation hooks.
    #[must_use]
    pub fn hooks(mut self, hooks: Arc<dyn AllocatorHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// The registry mode this configuration selects.
    #[must_use]
    pub const fn registry_mode(&self) -> RegistryMode {
        self.mode
    }

    /// Total markers after resolving `0` and clamping.
    #[must_use]
    pub fn effective_markers(&self) -> usize {
        resolve_markers(self.markers)
    }

    /// Whether a helper pool should ever be started.
    #[must_use]
    pub fn use_parallel(&self) -> bool {
        self.parallel_mark
            && self.mode == RegistryMode::Explicit
            && self.effective_markers() > 1
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("mode", &self.mode)
            .field("markers", &self.markers)
            .field("parallel_mark", &self.parallel_mark)
            .field("discovery_capacity", &self.discovery_capacity)
            .field("max_threads", &self.max_threads)
            .field("suspend_retry_budget", &self.suspend_retry_budget)
            .finish_non_exhaustive()
    }
}

/// Resolve a requested marker count: `0` means one per CPU.
pub(crate) fn resolve_markers(requested: usize) -> usize {
    let n = if requested == 0 {
        available_parallelism()
    } else {
        requested
    };
    n.clamp(1, MAX_MARKERS)
}

fn available_parallelism() -> usize {
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.registry_mode(), RegistryMode::Explicit);
        assert_eq!(config.discovery_capacity, MAX_DISCOVERY_THREADS);
        assert_eq!(config.suspend_retry_budget, MAX_SUSPEND_RETRIES);
        assert!(config.effective_markers() >= 1);
    }

    #[test]
    fn test_markers_are_clamped() {
        assert_eq!(RuntimeConfig::new().markers(1000).effective_markers(), MAX_MARKERS);
        assert_eq!(RuntimeConfig::new().markers(3).effective_markers(), 3);
    }

    #[test]
    fn test_discovery_mode_never_runs_parallel() {
        let config = RuntimeConfig::new().mode(RegistryMode::Discovery).markers(8);
        assert!(!config.use_parallel());
    }

    #[test]
    fn test_single_marker_is_not_parallel() {
        assert!(!RuntimeConfig::new().markers(1).use_parallel());
        assert!(RuntimeConfig::new().markers(2).use_parallel());
        assert!(!RuntimeConfig::new().markers(2).parallel_mark(false).use_parallel());
    }
}
