//! Thread registry, stop-the-world protocol and conservative stack root
//! discovery for garbage collectors.
//!
//! `gc-threads` is the layer of a conservative collector that knows about
//! threads. It tracks every application thread, stops them all to take a
//! consistent snapshot, reports each thread's stack and registers as
//! conservative roots, and runs a pool of helper threads for parallel
//! marking. The heap, the allocator and the marking algorithm itself live
//! elsewhere and talk to this crate through [`RootSink`],
//! [`AllocatorHooks`] and the work closure of
//! [`MarkerPool::do_parallel_mark`].
//!
//! # Registry modes
//!
//! - [`RegistryMode::Explicit`]: threads register themselves (or are started
//!   through [`CollectorRuntime::spawn`]) and every registry mutation
//!   happens under the allocation lock.
//! - [`RegistryMode::Discovery`]: the platform reports thread attach and
//!   detach, possibly in contexts that must not block. The registry is a
//!   lock-free slot array and parallel marking is unavailable.
//!
//! # Quick Start
//!
//! ```no_run
//! use gc_threads::{CollectedRoots, CollectorRuntime, RuntimeConfig};
//!
//! let runtime = CollectorRuntime::init(RuntimeConfig::new()).unwrap();
//!
//! let worker = runtime.spawn(|| {
//!     // Allocates from the collected heap.
//! }).unwrap();
//!
//! // Pushing must not allocate while other threads are stopped.
//! let mut roots = CollectedRoots::with_capacity(64, 1024);
//! let bytes = runtime.collect_with(&mut roots, &|_participant| {
//!     // Mark from `roots`.
//! });
//! assert!(bytes > 0);
//! worker.join().unwrap();
//! ```
//!
//! # Blocking calls
//!
//! A thread about to block for a long time can let collections proceed
//! without it:
//!
//! ```no_run
//! # use gc_threads::{CollectorRuntime, RuntimeConfig};
//! # let runtime = CollectorRuntime::init(RuntimeConfig::new()).unwrap();
//! let line = runtime.do_blocking(|| {
//!     let mut line = String::new();
//!     std::io::stdin().read_line(&mut line).map(|_| line)
//! });
//! ```
//!
//! Code inside [`CollectorRuntime::do_blocking`] must not touch collected
//! memory unless it re-enters through
//! [`CollectorRuntime::call_with_gc_active`].

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod arch;
mod config;
pub mod error;
mod lifecycle;
mod marker;
mod metrics;
mod os;
mod record;
pub mod registry;
mod roots;
mod runtime;
mod stack;
pub mod sync;
pub mod tracing;
mod world;

pub use arch::{NativeRegisters, RegisterSnapshot, SuspendedContext};
pub use config::{RegistryMode, RuntimeConfig, MAX_DISCOVERY_THREADS, MAX_MARKERS, MAX_SUSPEND_RETRIES};
pub use error::{RegistryError, SuspendError, ThreadError};
#[cfg(unix)]
pub use lifecycle::install_fork_handlers;
pub use lifecycle::{AllocatorHooks, GcJoinHandle, NoopHooks};
pub use marker::{MarkGuard, MarkState, MarkerPool};
pub use metrics::WorldMetrics;
pub use os::{OsThread, SuspendOutcome};
pub use record::{LocalAllocBlob, ThreadFlags, ThreadKey, ThreadRecord};
pub use registry::{RecordKey, RecordRef, ThreadRegistry};
pub use roots::{CollectedRoots, RootSink};
pub use runtime::{CollectorRuntime, RegisterStatus};
pub use stack::{
    approximate_sp, current_stack_base, current_stack_bounds, StackBase, StackBounds, StackSection,
    ADDR_LIMIT,
};
pub use world::StoppedWorld;
