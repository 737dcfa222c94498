//! Low-level virtual memory primitives.
//!
//! Two concerns live here: asking the OS what it knows about the region of
//! address space containing a given address (used to find where a thread
//! stack ends), and creating anonymous mappings whose pages can be made
//! inaccessible (used to build stack-like fixtures with guard pages).

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is the system page size.
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// A run of virtual address space `[base, end)` with uniform attributes.
///
/// Free (unmapped) gaps are reported as regions too, so callers can walk
/// the address space downward one region at a time regardless of whether
/// the next region down is mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// Lowest address of the region.
    pub base: usize,
    /// One past the highest address of the region.
    pub end: usize,
    /// Whether the pages are backed (committed / mapped).
    pub committed: bool,
    /// Whether the pages may be read.
    pub readable: bool,
    /// Whether the pages may be written.
    pub writable: bool,
    /// Whether the pages are a guard area (mapped but inaccessible, or
    /// carrying an explicit guard attribute).
    pub guard: bool,
}

impl Region {
    /// A gap in the address space with nothing mapped.
    #[must_use]
    pub const fn free(base: usize, end: usize) -> Self {
        Self {
            base,
            end,
            committed: false,
            readable: false,
            writable: false,
            guard: false,
        }
    }

    /// Returns true if `addr` lies within `[base, end)`.
    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end
    }

    /// Returns true for committed, readable and writable non-guard memory,
    /// i.e. memory that may belong to a live thread stack.
    #[must_use]
    pub const fn is_read_write(&self) -> bool {
        self.committed && self.readable && self.writable && !self.guard
    }

    /// Length of the region in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.end - self.base
    }

    /// Returns true for a zero-length region.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end == self.base
    }
}

/// Describe the region of the current process' address space containing
/// `addr`.
///
/// # Errors
///
/// Returns an error if the platform query fails or the platform offers no
/// way to inspect the address space.
pub fn query_region(addr: usize) -> io::Result<Region> {
    os::query_region(addr)
}

/// An anonymous read/write memory mapping.
///
/// The region is automatically unmapped when this handle is dropped.
pub struct Mmap {
    inner: os::MmapInner,
}

impl Mmap {
    /// Returns a pointer to the start of the memory mapping.
    #[must_use]
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the memory mapping in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if the mapping is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Address one past the end of the mapping.
    #[must_use]
    pub fn end_addr(&self) -> usize {
        self.ptr() as usize + self.len()
    }

    /// Revoke all access to `len` bytes starting `offset` bytes into the
    /// mapping, turning them into a guard area.
    ///
    /// # Errors
    ///
    /// Fails if the range is not page aligned, lies outside the mapping, or
    /// the OS rejects the protection change.
    pub fn protect_none(&self, offset: usize, len: usize) -> io::Result<()> {
        let page = page_size();
        if offset % page != 0 || len % page != 0 || offset + len > self.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "guard range must be page aligned and inside the mapping",
            ));
        }
        // SAFETY: the range was checked to lie inside our own mapping.
        unsafe { self.inner.protect_none(offset, len) }
    }
}

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

/// Configuration for creating a memory mapping.
#[derive(Debug, Clone, Default)]
pub struct MmapOptions {
    len: usize,
    populate: bool,
}

impl MmapOptions {
    /// Creates a new `MmapOptions` with length 0.
    /// You must set a length before mapping.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            len: 0,
            populate: false,
        }
    }

    /// Sets the length of the mapping in bytes.
    #[must_use]
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Sets whether to pre-populate (prefault) the page tables.
    ///
    /// On Linux, this adds `MAP_POPULATE`.
    #[must_use]
    pub const fn populate(mut self, populate: bool) -> Self {
        self.populate = populate;
        self
    }

    /// Creates an anonymous read/write memory map.
    ///
    /// # Errors
    ///
    /// Fails if the length is zero or the OS refuses the mapping.
    pub fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }
        let inner = os::MmapInner::map_anon(self.len, self.populate)?;
        Ok(Mmap { inner })
    }
}
