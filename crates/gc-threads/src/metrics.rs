//! Stop-the-world metrics and statistics.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Snapshot of the runtime's world-stop statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorldMetrics {
    /// Completed stop/start cycles.
    pub collections: u64,
    /// Threads suspended by the most recent stop.
    pub threads_suspended: usize,
    /// Threads skipped by the most recent stop because they were inside a
    /// blocking bracket.
    pub threads_blocking_skipped: usize,
    /// Records found to belong to exited threads during stops, in total.
    pub threads_exited_while_stopping: u64,
    /// Bytes of stack reported by the most recent root discovery.
    pub bytes_scanned: usize,
    /// Stack pointers found outside their thread's stack, in total.
    pub stack_warnings: u64,
    /// OS address-space queries issued while probing stack minimums.
    pub region_queries: u64,
    /// Duration of the most recent stopped-world section.
    pub last_pause: Duration,
    /// Sum of all stopped-world sections.
    pub total_pause: Duration,
}

/// Atomic backing store for [`WorldMetrics`].
#[derive(Debug, Default)]
pub(crate) struct GlobalMetrics {
    collections: AtomicU64,
    threads_suspended: AtomicUsize,
    threads_blocking_skipped: AtomicUsize,
    threads_exited: AtomicU64,
    bytes_scanned: AtomicUsize,
    stack_warnings: AtomicU64,
    region_queries: AtomicU64,
    last_pause_nanos: AtomicU64,
    total_pause_nanos: AtomicU64,
}

impl GlobalMetrics {
    pub(crate) fn record_stop(&self, suspended: usize, blocking_skipped: usize) {
        self.threads_suspended.store(suspended, Ordering::Relaxed);
        self.threads_blocking_skipped
            .store(blocking_skipped, Ordering::Relaxed);
    }

    pub(crate) fn record_late_suspends(&self, suspended: usize) {
        self.threads_suspended.fetch_add(suspended, Ordering::Relaxed);
    }

    pub(crate) fn record_exited(&self) {
        self.threads_exited.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_scan(&self, bytes: usize) {
        self.bytes_scanned.store(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_stack_warning(&self) {
        self.stack_warnings.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_region_query(&self) {
        self.region_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_pause(&self, pause: Duration) {
        let nanos = u64::try_from(pause.as_nanos()).unwrap_or(u64::MAX);
        self.collections.fetch_add(1, Ordering::Relaxed);
        self.last_pause_nanos.store(nanos, Ordering::Relaxed);
        self.total_pause_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    pub(crate) fn region_queries(&self) -> u64 {
        self.region_queries.load(Ordering::Relaxed)
    }

    pub(crate) fn snapshot(&self) -> WorldMetrics {
        WorldMetrics {
            collections: self.collections.load(Ordering::Relaxed),
            threads_suspended: self.threads_suspended.load(Ordering::Relaxed),
            threads_blocking_skipped: self.threads_blocking_skipped.load(Ordering::Relaxed),
            threads_exited_while_stopping: self.threads_exited.load(Ordering::Relaxed),
            bytes_scanned: self.bytes_scanned.load(Ordering::Relaxed),
            stack_warnings: self.stack_warnings.load(Ordering::Relaxed),
            region_queries: self.region_queries.load(Ordering::Relaxed),
            last_pause: Duration::from_nanos(self.last_pause_nanos.load(Ordering::Relaxed)),
            total_pause: Duration::from_nanos(self.total_pause_nanos.load(Ordering::Relaxed)),
        }
    }
}

/// Measures one stopped-world section.
///
/// ```ignore
/// let timer = PauseTimer::start();
/// // ... stop, scan, mark, restart ...
/// metrics.record_pause(timer.elapsed());
/// ```
#[derive(Debug, Clone, Copy)]
pub(crate) struct PauseTimer {
    started: Instant,
}

impl PauseTimer {
    pub(crate) fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub(crate) fn elapsed(self) -> Duration {
        self.started.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_starts_at_zero() {
        let metrics = GlobalMetrics::default();
        assert_eq!(metrics.snapshot(), WorldMetrics::default());
    }

    #[test]
    fn test_pause_accumulates() {
        let metrics = GlobalMetrics::default();
        metrics.record_pause(Duration::from_millis(2));
        metrics.record_pause(Duration::from_millis(3));
        let snap = metrics.snapshot();
        assert_eq!(snap.collections, 2);
        assert_eq!(snap.last_pause, Duration::from_millis(3));
        assert_eq!(snap.total_pause, Duration::from_millis(5));
    }

    #[test]
    fn test_stop_overwrites_last_values() {
        let metrics = GlobalMetrics::default();
        metrics.record_stop(3, 1);
        metrics.record_stop(2, 0);
        let snap = metrics.snapshot();
        assert_eq!(snap.threads_suspended, 2);
        assert_eq!(snap.threads_blocking_skipped, 0);
    }
}
