//! Conservative root discovery.
//!
//! For each registered thread the collector needs a range of stack to scan
//! and, for threads it interrupted, the registers they were holding. The
//! lower bound of a stack is found by probing the address space and cached
//! per record, so a steady-state collection costs no system calls.

use std::ptr;

use crate::arch::{spill_callee_saved, RegisterSnapshot};
use crate::config::RegistryMode;
use crate::fatal;
use crate::record::{ThreadKey, ThreadRecord};
use crate::runtime::{CollectorRuntime, Registering};
use crate::stack::{approximate_sp, StackSection, ADDR_LIMIT};
use crate::sync::AllocGuard;
use crate::world::Deferred;

/// Receiver of conservative roots.
///
/// Implementations run while other threads are suspended and should not
/// allocate or take locks those threads might hold.
pub trait RootSink {
    /// Every aligned word in `[lo, hi)` may be a pointer.
    fn push_range(&mut self, lo: usize, hi: usize);

    /// Each value may be a pointer.
    fn push_registers(&mut self, regs: &[usize]);
}

/// A [`RootSink`] that records what it is given.
///
/// Reserve capacity with [`CollectedRoots::with_capacity`] before stopping
/// the world.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectedRoots {
    /// Ranges in push order.
    pub ranges: Vec<(usize, usize)>,
    /// Register values in push order.
    pub registers: Vec<usize>,
}

impl CollectedRoots {
    /// Room for `ranges` ranges and `registers` register values.
    #[must_use]
    pub fn with_capacity(ranges: usize, registers: usize) -> Self {
        Self {
            ranges: Vec::with_capacity(ranges),
            registers: Vec::with_capacity(registers),
        }
    }

    /// Whether some pushed range covers `addr`.
    #[must_use]
    pub fn covers(&self, addr: usize) -> bool {
        self.ranges.iter().any(|&(lo, hi)| lo <= addr && addr < hi)
    }

    /// Total bytes in the pushed ranges.
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.ranges.iter().map(|&(lo, hi)| hi - lo).sum()
    }
}

impl RootSink for CollectedRoots {
    fn push_range(&mut self, lo: usize, hi: usize) {
        self.ranges.push((lo, hi));
    }

    fn push_registers(&mut self, regs: &[usize]) {
        self.registers.extend_from_slice(regs);
    }
}

/// Push `[lo, hi)` minus the inactive gaps recorded by `sect`.
///
/// Each section marks a frame where the thread left a blocking bracket;
/// the stack between the section and its saved stack pointer belongs to
/// the blocking call and is skipped.
pub(crate) fn push_all_stack_sections(
    mut lo: usize,
    hi: usize,
    mut sect: *const StackSection,
    sink: &mut dyn RootSink,
) {
    while !sect.is_null() {
        // SAFETY: sections live in frames of `call_with_gc_active` on a
        // thread that is either the caller or stopped, so the frame is
        // still there.
        let section = unsafe { &*sect };
        if lo < section.addr() {
            sink.push_range(lo, section.addr());
        }
        lo = section.saved_stack_ptr;
        sect = section.prev;
    }
    if lo < hi {
        sink.push_range(lo, hi);
    }
}

impl CollectorRuntime {
    fn is_scannable(&self, rec: &ThreadRecord) -> bool {
        rec.stack_end() != 0
            && !rec.is_neutralized()
            && !(self.mode() == RegistryMode::Explicit && rec.is_finished())
    }

    /// Lowest address of `rec`'s stack worth scanning given its current
    /// stack pointer `sp`, refining and caching the record's last known
    /// minimum.
    fn stack_min_for(&self, rec: &ThreadRecord, sp: usize, is_self: bool) -> usize {
        let end = rec.stack_end();
        let sect = rec.traced_stack_sect();
        let mut last = rec.last_stack_min();

        if last == ADDR_LIMIT {
            let from = if sect.is_null() {
                end.saturating_sub(1)
            } else {
                sect as usize
            };
            return match self.prober.stack_min(from, &self.metrics) {
                Some(min) => {
                    rec.set_last_stack_min(min);
                    min
                }
                None => sp.min(end),
            };
        }

        if !sect.is_null() && last > sect as usize {
            last = sect as usize;
            rec.set_last_stack_min(last);
        }
        if sp < end && sp >= last {
            return last;
        }

        let probe_at = if is_self && sp < last { sp } else { last };
        let min = match self.prober.may_be_in_stack(probe_at, &self.metrics) {
            Some(region) if sp < region.base || sp >= end => {
                self.prober.stack_min(last, &self.metrics).unwrap_or(region.base)
            }
            Some(region) => region.base,
            None => match self.prober.stack_min(end.saturating_sub(1), &self.metrics) {
                Some(min) => min,
                None => return sp.min(last),
            },
        };
        rec.set_last_stack_min(min);
        min
    }

    /// Refine and cache the lower bound of `rec`'s stack for stack pointer
    /// `sp`.
    ///
    /// A second call without the stack having grown returns the same bound
    /// and makes no address-space query.
    pub fn discover_stack_min(&self, _guard: &AllocGuard<'_>, rec: &ThreadRecord, sp: usize) -> usize {
        self.stack_min_for(rec, sp, rec.id() == ThreadKey::current())
    }

    /// Push the stack and registers of one thread. Returns the bytes of
    /// stack between its stack pointer and its base.
    ///
    /// A thread that is neither the caller, blocking, nor suspended is
    /// running and cannot be scanned; it contributes nothing.
    pub fn push_stack_for(&self, _guard: &AllocGuard<'_>, rec: &ThreadRecord, sink: &mut dyn RootSink) -> usize {
        self.push_stack(rec, ThreadKey::current(), sink)
    }

    fn push_stack(&self, rec: &ThreadRecord, me: ThreadKey, sink: &mut dyn RootSink) -> usize {
        let end = rec.stack_end();
        if end == 0 {
            return 0;
        }
        let is_self = rec.id() == me;
        let mut trusted = true;
        let mut sp = if is_self {
            debug_assert!(!rec.is_blocking(), "collecting thread is inside a blocking bracket");
            let regs = spill_callee_saved();
            sink.push_registers(&regs);
            approximate_sp()
        } else if rec.is_blocking() {
            rec.stack_ptr()
        } else if let Some(ctx) = rec.context().filter(|_| rec.is_suspended()) {
            sink.push_registers(ctx.regs.registers());
            trusted = ctx.trustworthy;
            ctx.sp
        } else {
            return 0;
        };

        let stack_min = self.stack_min_for(rec, sp, is_self);
        if !trusted {
            // The context may be stale: scan the whole committed stack.
            sp = stack_min;
        }

        if sp >= stack_min && sp < end {
            push_all_stack_sections(sp, end, rec.traced_stack_sect(), sink);
        } else {
            // A stopped thread may sit on the untouched guard page just
            // below the known minimum.
            let page = sys_mem::page_size();
            if is_self || sp >= end || sp.saturating_add(page) < stack_min {
                self.metrics.record_stack_warning();
                self.warn_deferred(Deferred::StackPointerOutOfRange {
                    thread: rec.id(),
                    sp,
                    lo: stack_min,
                    hi: end,
                });
            }
            if stack_min < end {
                sink.push_range(stack_min, end);
            }
        }
        end.saturating_sub(sp)
    }

    /// Push the stacks of every registered thread. Returns the total bytes
    /// of stack in use.
    ///
    /// Exact while the world is stopped; with the world running only the
    /// caller's and blocking threads' stacks are pushed. Aborts if the
    /// caller is not registered, unless a thread is being created.
    pub fn push_all_stacks(&self, _guard: &AllocGuard<'_>, sink: &mut dyn RootSink) -> usize {
        self.assert_holds_lock();
        let me = ThreadKey::current();
        let mut found_me = false;
        let mut total = 0usize;
        self.registry().for_each(&mut |rec| {
            if !self.is_scannable(rec) {
                return;
            }
            if rec.id() == me {
                found_me = true;
            }
            total = total.saturating_add(self.push_stack(rec, me, sink));
        });
        if !found_me && !Registering::in_progress() {
            fatal!("Collecting from unknown thread");
        }
        self.metrics.record_scan(total);
        total
    }

    /// Hand every thread's local allocation state to the allocator hooks
    /// for marking.
    pub fn push_thread_structures(&self, _guard: &AllocGuard<'_>, sink: &mut dyn RootSink) {
        self.assert_holds_lock();
        let hooks = self.hooks();
        self.registry().for_each(&mut |rec| {
            if !self.is_scannable(rec) {
                return;
            }
            if let Some(blob) = rec.local_alloc().as_ref() {
                hooks.mark_thread_local(blob, sink);
            }
        });
    }

    /// The thread or marker stack with the lowest base above `start`, as
    /// `(lo, hi)`: `hi` is the base and `lo` the best known lower bound.
    ///
    /// Returns `None` when no stack lies above `start`. When the stack's
    /// base is above `limit` and the memory at `limit` cannot belong to a
    /// stack, `lo` is [`ADDR_LIMIT`].
    pub fn next_stack(&self, _guard: &AllocGuard<'_>, start: usize, limit: usize) -> Option<(usize, usize)> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Owner {
            Record(crate::registry::RecordKey),
            Marker(usize),
        }

        let mut best: Option<(usize, usize, Owner)> = None;
        let mut consider = |base: usize, last: usize, owner: Owner| {
            if base > start && best.is_none_or(|(current, _, _)| base < current) {
                best = Some((base, last, owner));
            }
        };
        self.registry().for_each(&mut |rec| {
            if !rec.is_neutralized() {
                consider(rec.stack_end(), rec.last_stack_min(), Owner::Record(rec.key()));
            }
        });
        self.markers().for_each_stack(&mut |slot| {
            consider(
                slot.stack_end.load(std::sync::atomic::Ordering::Acquire),
                slot.last_stack_min.load(std::sync::atomic::Ordering::Relaxed),
                Owner::Marker(ptr::from_ref(slot) as usize),
            );
        });

        let (hi, last, owner) = best?;
        if hi > limit && self.prober.may_be_in_stack(limit, &self.metrics).is_none() {
            return Some((ADDR_LIMIT, hi));
        }

        let from = if last != ADDR_LIMIT && self.prober.may_be_in_stack(last, &self.metrics).is_some() {
            last
        } else {
            hi - 1
        };
        let Some(lo) = self.prober.stack_min(from, &self.metrics) else {
            return Some((if last == ADDR_LIMIT { hi } else { last }, hi));
        };

        match owner {
            Owner::Record(key) => self.registry().for_each(&mut |rec| {
                if rec.key() == key && rec.stack_end() == hi {
                    rec.set_last_stack_min(lo);
                }
            }),
            Owner::Marker(addr) => self.markers().for_each_stack(&mut |slot| {
                if ptr::from_ref(slot) as usize == addr {
                    slot.last_stack_min.store(lo, std::sync::atomic::Ordering::Relaxed);
                }
            }),
        }
        Some((lo, hi))
    }
}
