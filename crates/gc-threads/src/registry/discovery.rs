use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use super::{RecordKey, RecordRef, ThreadRegistry};
use crate::config::RegistryMode;
use crate::error::RegistryError;
use crate::os::OsThread;
use crate::record::{ThreadKey, ThreadRecord};
use crate::stack::StackBase;

struct Slot {
    in_use: AtomicBool,
    record: ThreadRecord,
}

/// Fixed-size table for threads reported by attach/detach notifications.
///
/// Registration and deletion never block. Readers iterate only up to the
/// high-water mark, which only grows.
pub struct LockFreeDiscoveryRegistry {
    slots: Box<[Slot]>,
    high_water: AtomicUsize,
    next_generation: AtomicU32,
}

impl LockFreeDiscoveryRegistry {
    /// A table of `capacity` slots.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                in_use: AtomicBool::new(false),
                record: ThreadRecord::vacant(),
            })
            .collect();
        Self {
            slots,
            high_water: AtomicUsize::new(0),
            next_generation: AtomicU32::new(1),
        }
    }

    fn live_slots(&self) -> &[Slot] {
        let n = self.high_water.load(Ordering::Acquire).min(self.slots.len());
        &self.slots[..n]
    }

    fn generation(&self) -> u32 {
        loop {
            let g = self.next_generation.fetch_add(1, Ordering::Relaxed);
            if g != 0 {
                return g;
            }
        }
    }

    fn find(&self, pred: impl Fn(&ThreadRecord) -> bool) -> Option<&Slot> {
        self.live_slots().iter().find(|slot| {
            slot.in_use.load(Ordering::Acquire)
                && !slot.record.is_neutralized()
                && pred(&slot.record)
        })
    }

    fn release(slot: &Slot) {
        drop(slot.record.clear());
        slot.in_use.store(false, Ordering::Release);
    }
}

impl ThreadRegistry for LockFreeDiscoveryRegistry {
    fn mode(&self) -> RegistryMode {
        RegistryMode::Discovery
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.slots.len())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn register(
        &self,
        id: ThreadKey,
        base: StackBase,
        handle: OsThread,
    ) -> Result<RecordRef<'_>, RegistryError> {
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.in_use.load(Ordering::Relaxed) || slot.in_use.swap(true, Ordering::AcqRel) {
                continue;
            }
            self.high_water.fetch_max(index + 1, Ordering::AcqRel);
            let key = RecordKey {
                index: index as u32,
                generation: self.generation(),
            };
            slot.record.init(id, base, handle, key);
            return Ok(RecordRef::Slot(&slot.record));
        }
        Err(RegistryError::Full {
            capacity: self.slots.len(),
        })
    }

    fn lookup(&self, id: ThreadKey) -> Option<RecordRef<'_>> {
        if id.is_none() {
            return None;
        }
        self.find(|rec| rec.id() == id)
            .map(|slot| RecordRef::Slot(&slot.record))
    }

    fn lookup_secondary(&self, secondary: u64) -> Option<RecordRef<'_>> {
        if secondary == 0 {
            return None;
        }
        self.find(|rec| rec.secondary_id() == secondary)
            .map(|slot| RecordRef::Slot(&slot.record))
    }

    fn delete(&self, id: ThreadKey) -> bool {
        if id.is_none() {
            return false;
        }
        match self.find(|rec| rec.id() == id) {
            Some(slot) => {
                Self::release(slot);
                true
            }
            None => false,
        }
    }

    fn delete_key(&self, key: RecordKey) -> bool {
        let Some(slot) = self.live_slots().get(key.index as usize) else {
            return false;
        };
        if !slot.in_use.load(Ordering::Acquire) || slot.record.key() != key {
            return false;
        }
        Self::release(slot);
        true
    }

    fn rebind(&self, key: RecordKey, id: ThreadKey, handle: OsThread) -> bool {
        let Some(slot) = self.live_slots().get(key.index as usize) else {
            return false;
        };
        if !slot.in_use.load(Ordering::Acquire)
            || slot.record.key() != key
            || slot.record.stack_end() == 0
        {
            return false;
        }
        drop(slot.record.rebind(key.index, id, handle));
        true
    }

    fn for_each(&self, f: &mut dyn FnMut(&ThreadRecord)) {
        for slot in self.live_slots() {
            if slot.in_use.load(Ordering::Acquire) {
                f(&slot.record);
            }
        }
    }

    fn active_count(&self) -> usize {
        self.live_slots()
            .iter()
            .filter(|slot| {
                slot.in_use.load(Ordering::Acquire)
                    && slot.record.stack_end() != 0
                    && !slot.record.is_neutralized()
            })
            .count()
    }

    fn purge_neutralized(&self) -> usize {
        let mut purged = 0;
        for slot in self.live_slots() {
            if slot.in_use.load(Ordering::Acquire) && slot.record.is_neutralized() {
                Self::release(slot);
                purged += 1;
            }
        }
        purged
    }

    fn retain_only(&self, keep: RecordKey) -> usize {
        let mut removed = 0;
        for slot in self.live_slots() {
            if slot.in_use.load(Ordering::Acquire) && slot.record.key() != keep {
                Self::release(slot);
                removed += 1;
            }
        }
        removed
    }

    fn clear(&self) -> usize {
        let mut removed = 0;
        for slot in self.live_slots() {
            if slot.in_use.load(Ordering::Acquire) {
                Self::release(slot);
                removed += 1;
            }
        }
        removed
    }
}

impl std::fmt::Debug for LockFreeDiscoveryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockFreeDiscoveryRegistry")
            .field("capacity", &self.slots.len())
            .field("high_water", &self.high_water.load(Ordering::Relaxed))
            .field("active", &self.active_count())
            .finish()
    }
}
