//! Stack geometry.
//!
//! All stacks grow downward: a thread's stack occupies
//! `[stack_min, stack_end)` and its live part is `[sp, stack_end)`.

use std::io;

use parking_lot::Mutex;
use sys_mem::Region;

use crate::metrics::GlobalMetrics;

/// Sentinel for "no stack minimum known yet".
pub const ADDR_LIMIT: usize = usize::MAX;

/// Where a thread's stack (and register backing store, if any) begins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackBase {
    /// Highest address of the stack, exclusive.
    pub mem_base: usize,
    /// Base of a separate register stack, `0` where there is none.
    pub reg_base: usize,
}

impl StackBase {
    /// A base with no register stack.
    #[must_use]
    pub const fn new(mem_base: usize) -> Self {
        Self {
            mem_base,
            reg_base: 0,
        }
    }
}

/// Bounds of a thread's stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    /// The bottom of the stack (highest address).
    pub bottom: usize,
    /// The top of the stack (lowest address), `0` if the platform does not
    /// say.
    pub top: usize,
}

/// Retrieve the stack bounds for the current thread.
///
/// # Errors
///
/// Fails where the platform has no way to report them.
#[cfg(target_os = "linux")]
pub fn current_stack_bounds() -> io::Result<StackBounds> {
    use libc::{
        pthread_attr_destroy, pthread_attr_getstack, pthread_attr_t, pthread_getattr_np,
        pthread_self,
    };

    // SAFETY: the attribute object is initialised by pthread_getattr_np and
    // destroyed on every path after that.
    unsafe {
        let mut attr: pthread_attr_t = std::mem::zeroed();
        let ret = pthread_getattr_np(pthread_self(), &raw mut attr);
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret));
        }

        let mut stackaddr: *mut libc::c_void = std::ptr::null_mut();
        let mut stacksize: libc::size_t = 0;
        let ret = pthread_attr_getstack(&raw const attr, &raw mut stackaddr, &raw mut stacksize);
        pthread_attr_destroy(&raw mut attr);
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret));
        }

        let top = stackaddr as usize;
        Ok(StackBounds {
            bottom: top + stacksize,
            top,
        })
    }
}

/// Retrieve the stack bounds for the current thread.
///
/// # Errors
///
/// Never fails on this platform.
#[cfg(target_vendor = "apple")]
pub fn current_stack_bounds() -> io::Result<StackBounds> {
    // SAFETY: querying our own thread.
    unsafe {
        let me = libc::pthread_self();
        let bottom = libc::pthread_get_stackaddr_np(me) as usize;
        let size = libc::pthread_get_stacksize_np(me);
        Ok(StackBounds {
            bottom,
            top: bottom - size,
        })
    }
}

/// Retrieve the stack bounds for the current thread.
///
/// # Errors
///
/// Never fails on this platform.
#[cfg(windows)]
pub fn current_stack_bounds() -> io::Result<StackBounds> {
    use windows_sys::Win32::System::Threading::GetCurrentThreadStackLimits;

    let mut low = 0usize;
    let mut high = 0usize;
    // SAFETY: both out-pointers are valid.
    unsafe { GetCurrentThreadStackLimits(&raw mut low, &raw mut high) };
    Ok(StackBounds {
        bottom: high,
        top: low,
    })
}

/// Retrieve the stack bounds for the current thread.
///
/// # Errors
///
/// Always fails: the platform offers no query.
#[cfg(not(any(target_os = "linux", target_vendor = "apple", windows)))]
pub fn current_stack_bounds() -> io::Result<StackBounds> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "stack bounds retrieval is not implemented for this platform",
    ))
}

/// Base of the calling thread's stack.
///
/// # Errors
///
/// Propagates [`current_stack_bounds`] failures.
pub fn current_stack_base() -> io::Result<StackBase> {
    current_stack_bounds().map(|b| StackBase::new(b.bottom))
}

/// An address inside the caller's frame.
///
/// Inlined so the local lives in the caller's frame, not in a frame of its
/// own that is already popped when the value is used.
#[inline(always)]
#[must_use]
pub fn approximate_sp() -> usize {
    let marker = 0u8;
    std::hint::black_box(std::ptr::addr_of!(marker)) as usize
}

/// A marker left on the stack of a blocking thread that has re-entered
/// collector-visible code.
///
/// The stack between the frame holding the marker and `saved_stack_ptr`
/// belongs to the blocking code and is not scanned.
#[derive(Debug)]
#[repr(C)]
pub struct StackSection {
    /// Stack pointer saved when the thread entered its blocking bracket.
    pub saved_stack_ptr: usize,
    /// Enclosing section, or null.
    pub prev: *const StackSection,
}

impl StackSection {
    /// Address of the section itself; scanning of the inner part stops here.
    #[must_use]
    pub fn addr(&self) -> usize {
        std::ptr::from_ref(self) as usize
    }
}

/// Walks the address space to find stack minimums, remembering the last
/// answer.
///
/// Only used under the allocation lock; the mutex is uncontended and only
/// makes the cache `Sync`.
#[derive(Debug, Default)]
pub(crate) struct StackProber {
    cache: Mutex<ProbeCache>,
}

#[derive(Debug, Default)]
struct ProbeCache {
    address: usize,
    region: Option<Region>,
}

impl StackProber {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn query(cache: &mut ProbeCache, addr: usize, metrics: &GlobalMetrics) -> Option<Region> {
        if cache.address == addr {
            if let Some(region) = cache.region {
                return Some(region);
            }
        }
        metrics.record_region_query();
        match sys_mem::query_region(addr) {
            Ok(region) => {
                cache.address = addr;
                cache.region = Some(region);
                Some(region)
            }
            Err(_) => {
                cache.region = None;
                None
            }
        }
    }

    /// Lowest address of the run of read-write regions ending at the
    /// region that contains `s`. `None` if the OS cannot be asked.
    pub(crate) fn stack_min(&self, s: usize, metrics: &GlobalMetrics) -> Option<usize> {
        let mut cache = self.cache.lock();
        let mut region = Self::query(&mut cache, s, metrics)?;
        loop {
            let bottom = region.base;
            if bottom == 0 {
                return Some(0);
            }
            match Self::query(&mut cache, bottom - 1, metrics) {
                Some(below) if below.is_read_write() && !below.guard => region = below,
                _ => return Some(bottom),
            }
        }
    }

    /// The region containing `s`, if it is committed read-write memory that
    /// could be part of a stack.
    pub(crate) fn may_be_in_stack(&self, s: usize, metrics: &GlobalMetrics) -> Option<Region> {
        let mut cache = self.cache.lock();
        Self::query(&mut cache, s, metrics).filter(|r| r.is_read_write() && !r.guard)
    }

    /// Forget the cached answer. Needed when mappings may have changed
    /// behind our back (after fork, or when a stack base is replaced).
    pub(crate) fn invalidate(&self) {
        let mut cache = self.cache.lock();
        cache.address = 0;
        cache.region = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(any(target_os = "linux", target_vendor = "apple", windows))]
    fn test_current_stack_contains_local() {
        let bounds = current_stack_bounds().unwrap();
        let sp = approximate_sp();
        assert!(sp < bounds.bottom);
        assert!(sp >= bounds.top);
    }

    #[test]
    #[cfg(any(target_os = "linux", windows))]
    fn test_stack_min_is_below_sp() {
        let metrics = GlobalMetrics::default();
        let prober = StackProber::new();
        let base = current_stack_base().unwrap();
        let sp = approximate_sp();
        let min = prober.stack_min(base.mem_base, &metrics).unwrap();
        assert!(min <= sp);
        assert!(metrics.region_queries() >= 2);
    }

    #[test]
    #[cfg(any(target_os = "linux", windows))]
    fn test_repeat_query_hits_cache() {
        let metrics = GlobalMetrics::default();
        let prober = StackProber::new();
        let sp = approximate_sp();
        assert!(prober.may_be_in_stack(sp, &metrics).is_some());
        let before = metrics.region_queries();
        assert!(prober.may_be_in_stack(sp, &metrics).is_some());
        assert_eq!(metrics.region_queries(), before);
        prober.invalidate();
        assert!(prober.may_be_in_stack(sp, &metrics).is_some());
        assert_eq!(metrics.region_queries(), before + 1);
    }

    #[test]
    #[cfg(any(target_os = "linux", windows))]
    fn test_probe_stops_at_guard_page() {
        let page = sys_mem::page_size();
        let map = sys_mem::MmapOptions::new().len(4 * page).map_anon().unwrap();
        map.protect_none(0, page).unwrap();
        let start = map.ptr() as usize;
        let top = start + 4 * page - 1;

        let metrics = GlobalMetrics::default();
        let prober = StackProber::new();
        assert_eq!(prober.stack_min(top, &metrics), Some(start + page));
        assert!(prober.may_be_in_stack(start, &metrics).is_none());
        assert!(prober.may_be_in_stack(top, &metrics).is_some());
    }

    #[test]
    fn test_section_addr() {
        let sect = StackSection {
            saved_stack_ptr: 0x1000,
            prev: std::ptr::null(),
        };
        assert_eq!(sect.addr(), std::ptr::addr_of!(sect) as usize);
    }
}
