use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{RecordKey, RecordRef, ThreadRegistry};
use crate::config::RegistryMode;
use crate::error::RegistryError;
use crate::os::OsThread;
use crate::record::{ThreadKey, ThreadRecord};
use crate::stack::StackBase;

const THREAD_TABLE_SZ: usize = 256;

#[derive(Clone)]
enum Entry {
    /// The record stored inline in the registry.
    First,
    Heap(Arc<ThreadRecord>),
}

/// Chained hash table for explicitly registered threads.
///
/// Callers hold the allocation lock around every call. The first record
/// ever registered lives inline and is never freed, so the primordial
/// thread can register even when the allocator cannot serve it.
pub struct LockedHashRegistry {
    first: ThreadRecord,
    first_used: AtomicBool,
    buckets: Mutex<Vec<Vec<Entry>>>,
    limit: Option<usize>,
    live: AtomicUsize,
    next_generation: AtomicU32,
}

#[allow(clippy::cast_possible_truncation)]
const fn bucket_of(id: ThreadKey) -> usize {
    (id.0 % THREAD_TABLE_SZ as u64) as usize
}

impl LockedHashRegistry {
    /// An empty table holding at most `limit` records.
    #[must_use]
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            first: ThreadRecord::vacant(),
            first_used: AtomicBool::new(false),
            buckets: Mutex::new(vec![Vec::new(); THREAD_TABLE_SZ]),
            limit,
            live: AtomicUsize::new(0),
            next_generation: AtomicU32::new(1),
        }
    }

    fn record<'a>(&'a self, entry: &'a Entry) -> &'a ThreadRecord {
        match entry {
            Entry::First => &self.first,
            Entry::Heap(rec) => rec,
        }
    }

    fn to_ref(&self, entry: &Entry) -> RecordRef<'_> {
        match entry {
            Entry::First => RecordRef::Slot(&self.first),
            Entry::Heap(rec) => RecordRef::Owned(Arc::clone(rec)),
        }
    }

    fn generation(&self) -> u32 {
        loop {
            let g = self.next_generation.fetch_add(1, Ordering::Relaxed);
            if g != 0 {
                return g;
            }
        }
    }

    fn find_ref(&self, pred: impl Fn(&ThreadRecord) -> bool) -> Option<RecordRef<'_>> {
        let buckets = self.buckets.lock();
        buckets
            .iter()
            .flatten()
            .find(|e| {
                let rec = self.record(e);
                !rec.is_neutralized() && pred(rec)
            })
            .map(|e| self.to_ref(e))
    }

    /// Unlink every entry matching `pred` and clear its record. Handles
    /// and heap records are dropped after the table lock is released.
    fn remove_where(&self, pred: impl Fn(&ThreadRecord) -> bool, only_first: bool) -> usize {
        let mut doomed: Vec<Entry> = Vec::new();
        {
            let mut buckets = self.buckets.lock();
            'outer: for bucket in buckets.iter_mut() {
                let mut i = 0;
                while i < bucket.len() {
                    if pred(self.record(&bucket[i])) {
                        doomed.push(bucket.remove(i));
                        if only_first {
                            break 'outer;
                        }
                    } else {
                        i += 1;
                    }
                }
            }
        }
        let removed = doomed.len();
        for entry in doomed {
            drop(self.record(&entry).clear());
        }
        self.live.fetch_sub(removed, Ordering::Relaxed);
        removed
    }
}

impl ThreadRegistry for LockedHashRegistry {
    fn mode(&self) -> RegistryMode {
        RegistryMode::Explicit
    }

    fn capacity(&self) -> Option<usize> {
        self.limit
    }

    #[allow(clippy::cast_possible_truncation)]
    fn register(
        &self,
        id: ThreadKey,
        base: StackBase,
        handle: OsThread,
    ) -> Result<RecordRef<'_>, RegistryError> {
        if let Some(limit) = self.limit {
            if self.live.load(Ordering::Relaxed) >= limit {
                return Err(RegistryError::Full { capacity: limit });
            }
        }
        let index = bucket_of(id);
        let mut buckets = self.buckets.lock();
        let bucket = &mut buckets[index];
        bucket
            .try_reserve(1)
            .map_err(|_| RegistryError::OutOfMemory)?;
        let entry = if self.first_used.swap(true, Ordering::AcqRel) {
            Entry::Heap(Arc::new(ThreadRecord::vacant()))
        } else {
            Entry::First
        };
        let key = RecordKey {
            index: index as u32,
            generation: self.generation(),
        };
        self.record(&entry).init(id, base, handle, key);
        let out = self.to_ref(&entry);
        bucket.insert(0, entry);
        self.live.fetch_add(1, Ordering::Relaxed);
        Ok(out)
    }

    fn lookup(&self, id: ThreadKey) -> Option<RecordRef<'_>> {
        if id.is_none() {
            return None;
        }
        let buckets = self.buckets.lock();
        buckets[bucket_of(id)]
            .iter()
            .find(|e| {
                let rec = self.record(e);
                rec.id() == id && !rec.is_neutralized()
            })
            .map(|e| self.to_ref(e))
    }

    fn lookup_secondary(&self, secondary: u64) -> Option<RecordRef<'_>> {
        if secondary == 0 {
            return None;
        }
        self.find_ref(|rec| rec.secondary_id() == secondary)
    }

    fn delete(&self, id: ThreadKey) -> bool {
        if id.is_none() {
            return false;
        }
        self.remove_where(|rec| rec.id() == id && !rec.is_neutralized(), true) == 1
    }

    fn delete_key(&self, key: RecordKey) -> bool {
        self.remove_where(|rec| rec.key() == key && rec.stack_end() != 0, true) == 1
    }

    #[allow(clippy::cast_possible_truncation)]
    fn rebind(&self, key: RecordKey, id: ThreadKey, handle: OsThread) -> bool {
        let old = {
            let mut buckets = self.buckets.lock();
            let found = buckets.iter().enumerate().find_map(|(b, bucket)| {
                bucket
                    .iter()
                    .position(|e| {
                        let rec = self.record(e);
                        rec.key() == key && rec.stack_end() != 0
                    })
                    .map(|i| (b, i))
            });
            let Some((from, i)) = found else {
                return false;
            };
            let entry = buckets[from].remove(i);
            let to = bucket_of(id);
            let old = self.record(&entry).rebind(to as u32, id, handle);
            buckets[to].insert(0, entry);
            old
        };
        drop(old);
        true
    }

    fn for_each(&self, f: &mut dyn FnMut(&ThreadRecord)) {
        let buckets = self.buckets.lock();
        for entry in buckets.iter().flatten() {
            f(self.record(entry));
        }
    }

    fn active_count(&self) -> usize {
        let buckets = self.buckets.lock();
        buckets
            .iter()
            .flatten()
            .filter(|e| {
                let rec = self.record(e);
                rec.stack_end() != 0 && !rec.is_neutralized() && !rec.is_finished()
            })
            .count()
    }

    fn purge_neutralized(&self) -> usize {
        self.remove_where(ThreadRecord::is_neutralized, false)
    }

    fn retain_only(&self, keep: RecordKey) -> usize {
        self.remove_where(|rec| rec.key() != keep, false)
    }

    fn clear(&self) -> usize {
        self.remove_where(|_| true, false)
    }
}

impl std::fmt::Debug for LockedHashRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedHashRegistry")
            .field("limit", &self.limit)
            .field("live", &self.live.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
