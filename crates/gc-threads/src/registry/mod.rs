//! Thread registries.
//!
//! Two implementations of [`ThreadRegistry`], chosen once per runtime by
//! [`RegistryMode`]:
//!
//! - [`LockedHashRegistry`] backs explicit registration. Every mutation
//!   happens under the allocation lock; the table's own mutex only makes
//!   that visible to the type system.
//! - [`LockFreeDiscoveryRegistry`] backs discovery mode, where attach and
//!   detach notifications may arrive in contexts that must not block. Slots
//!   are claimed by test-and-set and published with release stores.
//!
//! Records carry a generation so a [`RecordKey`] held across a deletion can
//! never act on the slot's next occupant.

mod discovery;
mod hashed;

use std::ops::Deref;
use std::sync::Arc;

pub use self::discovery::LockFreeDiscoveryRegistry;
pub use self::hashed::LockedHashRegistry;

use crate::config::RegistryMode;
use crate::error::RegistryError;
use crate::os::OsThread;
use crate::record::{ThreadKey, ThreadRecord};
use crate::stack::StackBase;

/// Identity of one incarnation of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordKey {
    /// Slot (discovery) or bucket (explicit) of the record.
    pub index: u32,
    /// Registry-wide incarnation number, never `0` for a live record.
    pub generation: u32,
}

/// A record handed out by a registry.
#[derive(Debug, Clone)]
pub enum RecordRef<'r> {
    /// A record stored inside the registry itself.
    Slot(&'r ThreadRecord),
    /// A heap record, kept alive while referenced.
    Owned(Arc<ThreadRecord>),
}

impl Deref for RecordRef<'_> {
    type Target = ThreadRecord;

    fn deref(&self) -> &ThreadRecord {
        match self {
            Self::Slot(rec) => rec,
            Self::Owned(rec) => rec,
        }
    }
}

/// Storage for [`ThreadRecord`]s.
///
/// `for_each` visits every record that is (or is becoming) in use; callers
/// skip records with `stack_end() == 0`. It must not be re-entered with a
/// mutating call on the same registry.
pub trait ThreadRegistry: Send + Sync {
    /// Which mode this registry serves.
    fn mode(&self) -> RegistryMode;

    /// Hard limit on simultaneous records, if any.
    fn capacity(&self) -> Option<usize>;

    /// Add a record for `id`, taking ownership of `handle`.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Full`] or [`RegistryError::OutOfMemory`]; the handle
    /// is dropped in that case.
    fn register(
        &self,
        id: ThreadKey,
        base: StackBase,
        handle: OsThread,
    ) -> Result<RecordRef<'_>, RegistryError>;

    /// The live record for `id`.
    fn lookup(&self, id: ThreadKey) -> Option<RecordRef<'_>>;

    /// The live record whose secondary id is `secondary`.
    fn lookup_secondary(&self, secondary: u64) -> Option<RecordRef<'_>>;

    /// Remove the record for `id`, closing its handle. Returns whether one
    /// was found.
    fn delete(&self, id: ThreadKey) -> bool;

    /// Remove the record with this exact identity.
    fn delete_key(&self, key: RecordKey) -> bool;

    /// Hand the record with identity `key` to thread `id` and its OS
    /// handle, so later lookups of `id` find it. Used in a forked child,
    /// where the surviving thread has a new id. Returns whether the record
    /// was found.
    fn rebind(&self, key: RecordKey, id: ThreadKey, handle: OsThread) -> bool;

    /// Visit every in-use record.
    fn for_each(&self, f: &mut dyn FnMut(&ThreadRecord));

    /// Records with a published stack that are not awaiting reclamation.
    fn active_count(&self) -> usize;

    /// Free every neutralised record. Returns how many were freed.
    fn purge_neutralized(&self) -> usize;

    /// Remove every record except `keep`. Returns how many were removed.
    fn retain_only(&self, keep: RecordKey) -> usize;

    /// Remove every record. Returns how many were removed.
    fn clear(&self) -> usize;
}

/// Build the registry a configuration asks for.
pub(crate) fn for_mode(
    mode: RegistryMode,
    discovery_capacity: usize,
    max_threads: Option<usize>,
) -> Box<dyn ThreadRegistry> {
    match mode {
        RegistryMode::Explicit => Box::new(LockedHashRegistry::new(max_threads)),
        RegistryMode::Discovery => Box::new(LockFreeDiscoveryRegistry::new(discovery_capacity)),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Register the calling thread under a made-up id.
    pub(crate) fn register_fake(
        registry: &dyn ThreadRegistry,
        id: u64,
        base: usize,
    ) -> Result<RecordKey, RegistryError> {
        let handle = OsThread::current().map_err(|e| RegistryError::Handle(e.to_string()))?;
        registry
            .register(ThreadKey(id), StackBase::new(base), handle)
            .map(|rec| rec.key())
    }

    /// Behaviour both registries share.
    pub(crate) fn exercise(registry: &dyn ThreadRegistry) {
        let a = register_fake(registry, 11, 0x1000).unwrap();
        let b = register_fake(registry, 12, 0x2000).unwrap();
        assert_ne!(a.generation, b.generation);
        assert_eq!(registry.active_count(), 2);
        assert_eq!(registry.lookup(ThreadKey(11)).unwrap().stack_end(), 0x1000);
        assert!(registry.lookup(ThreadKey(13)).is_none());

        registry.lookup(ThreadKey(12)).unwrap().set_secondary_id(99);
        assert_eq!(registry.lookup_secondary(99).unwrap().id(), ThreadKey(12));

        assert!(registry.delete(ThreadKey(11)));
        assert!(!registry.delete(ThreadKey(11)));
        assert!(!registry.delete_key(a));
        assert!(registry.lookup(ThreadKey(11)).is_none());

        let c = register_fake(registry, 11, 0x3000).unwrap();
        assert_ne!(a, c);
        assert!(!registry.delete_key(a));
        assert!(registry.delete_key(c));

        let mut seen = 0;
        registry.for_each(&mut |rec| {
            if rec.stack_end() != 0 {
                seen += 1;
            }
        });
        assert_eq!(seen, 1);

        registry.lookup(ThreadKey(12)).unwrap().neutralize();
        assert!(registry.lookup(ThreadKey(12)).is_none());
        assert_eq!(registry.active_count(), 0);
        assert_eq!(registry.purge_neutralized(), 1);
        assert_eq!(registry.purge_neutralized(), 0);

        let moved = register_fake(registry, 31, 0x7000).unwrap();
        let handle = OsThread::current().unwrap();
        assert!(registry.rebind(moved, ThreadKey(31 + 257), handle));
        assert!(registry.lookup(ThreadKey(31)).is_none());
        let rebound = registry.lookup(ThreadKey(31 + 257)).unwrap();
        assert_eq!(rebound.stack_end(), 0x7000);
        assert_eq!(rebound.key().generation, moved.generation);
        assert!(registry.delete_key(rebound.key()));
        drop(rebound);
        assert!(!registry.rebind(moved, ThreadKey(40), OsThread::current().unwrap()));

        let keep = register_fake(registry, 21, 0x4000).unwrap();
        register_fake(registry, 22, 0x5000).unwrap();
        register_fake(registry, 23, 0x6000).unwrap();
        assert_eq!(registry.retain_only(keep), 2);
        assert_eq!(registry.active_count(), 1);
        assert_eq!(registry.clear(), 1);
        assert_eq!(registry.active_count(), 0);
    }
}
