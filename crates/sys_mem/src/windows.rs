use std::io::{self, Error};
use std::mem;
use std::ptr;

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, VirtualProtect, VirtualQuery, MEMORY_BASIC_INFORMATION, MEM_COMMIT,
    MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READWRITE, PAGE_GUARD, PAGE_NOACCESS, PAGE_READONLY,
    PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

use crate::Region;

/// Returns the system allocation granularity.
///
/// On Windows, `VirtualAlloc` address must be aligned to this value (typically 64KB),
/// which is often larger than the page size (typically 4KB).
pub fn allocation_granularity() -> usize {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        match info.dwAllocationGranularity as usize {
            0 => 65536,
            gran => gran,
        }
    }
}

pub fn page_size() -> usize {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        match info.dwPageSize as usize {
            0 => 4096,
            size => size,
        }
    }
}

/// `VirtualQuery` the page containing `addr`.
pub fn query_region(addr: usize) -> io::Result<Region> {
    let mut info: MEMORY_BASIC_INFORMATION = unsafe { mem::zeroed() };
    // SAFETY: VirtualQuery only reads our own address space bookkeeping.
    let written = unsafe {
        VirtualQuery(
            addr as *const std::ffi::c_void,
            &mut info,
            mem::size_of::<MEMORY_BASIC_INFORMATION>(),
        )
    };
    if written == 0 {
        return Err(Error::last_os_error());
    }
    let base = info.BaseAddress as usize;
    let writable = info.Protect & (PAGE_READWRITE | PAGE_EXECUTE_READWRITE) != 0;
    Ok(Region {
        base,
        end: base.saturating_add(info.RegionSize),
        committed: info.State == MEM_COMMIT,
        readable: writable || info.Protect & PAGE_READONLY != 0,
        writable,
        guard: info.Protect & PAGE_GUARD != 0 || info.Protect & PAGE_NOACCESS != 0,
    })
}

pub struct MmapInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
}

impl MmapInner {
    pub fn map_anon(len: usize, _populate: bool) -> io::Result<Self> {
        // SAFETY: a fresh reservation with no address hint.
        let ptr = unsafe { VirtualAlloc(ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
        if ptr.is_null() {
            return Err(Error::last_os_error());
        }
        Ok(Self { ptr, len })
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    /// # Safety
    ///
    /// `[offset, offset + len)` must lie inside the mapping and be page
    /// aligned, and nothing may access those pages afterwards.
    pub unsafe fn protect_none(&self, offset: usize, len: usize) -> io::Result<()> {
        let mut old = 0;
        // SAFETY: the caller guarantees the range is ours and aligned.
        let ok = unsafe {
            VirtualProtect(
                self.ptr.cast::<u8>().add(offset).cast(),
                len,
                PAGE_NOACCESS,
                &mut old,
            )
        };
        if ok == 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                // MEM_RELEASE requires dwSize to be 0
                VirtualFree(self.ptr, 0, MEM_RELEASE);
            }
        }
    }
}

unsafe impl Send for MmapInner {}
unsafe impl Sync for MmapInner {}
