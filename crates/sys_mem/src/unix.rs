use std::io::{self, Error};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::Region;

#[cfg(any(target_os = "linux", target_os = "android"))]
const MAP_POPULATE: libc::c_int = libc::MAP_POPULATE;

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const MAP_POPULATE: libc::c_int = 0;

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            #[allow(clippy::cast_sign_loss)]
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

/// Look `addr` up in `/proc/self/maps`.
///
/// Reads the file through a fixed stack buffer: callers may run while other
/// threads are suspended, so this must not allocate.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn query_region(addr: usize) -> io::Result<Region> {
    const MAPS_PATH: &std::ffi::CStr = c"/proc/self/maps";

    struct Fd(libc::c_int);

    impl Drop for Fd {
        fn drop(&mut self) {
            // SAFETY: the descriptor was opened below and is closed once.
            unsafe { libc::close(self.0) };
        }
    }

    // SAFETY: a valid NUL-terminated path and plain flags.
    let fd = unsafe { libc::open(MAPS_PATH.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(Error::last_os_error());
    }
    let fd = Fd(fd);

    let mut scan = MapsScan::new(addr);
    let mut buf = [0u8; 4096];
    let mut filled = 0;
    // Set while discarding the tail of a line longer than the buffer.
    let mut skipping = false;
    loop {
        // SAFETY: writes at most `buf.len() - filled` bytes into `buf`.
        let n = unsafe {
            libc::read(
                fd.0,
                buf.as_mut_ptr().add(filled).cast(),
                buf.len() - filled,
            )
        };
        if n < 0 {
            let err = Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if n == 0 {
            break;
        }
        filled += usize::try_from(n).unwrap_or(0);

        let mut start = 0;
        while let Some(pos) = buf[start..filled].iter().position(|&b| b == b'\n') {
            if !skipping {
                if let Some(region) = scan.feed(&buf[start..start + pos]) {
                    return Ok(region);
                }
            }
            skipping = false;
            start += pos + 1;
        }
        if start == 0 && filled == buf.len() {
            // No newline in a full buffer: the range and permissions are
            // at the front, so parse what we have and drop the rest.
            if !skipping {
                if let Some(region) = scan.feed(&buf[..filled]) {
                    return Ok(region);
                }
            }
            skipping = true;
            filled = 0;
            continue;
        }
        buf.copy_within(start..filled, 0);
        filled -= start;
    }
    if filled > 0 && !skipping {
        if let Some(region) = scan.feed(&buf[..filled]) {
            return Ok(region);
        }
    }
    Ok(scan.finish())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn query_region(_addr: usize) -> io::Result<Region> {
    Err(Error::new(
        io::ErrorKind::Unsupported,
        "address space queries are not supported on this platform",
    ))
}

/// Incremental search of a maps listing, one line at a time.
///
/// Entries are sorted by address; gaps between them come back as free
/// regions.
#[cfg_attr(not(any(target_os = "linux", target_os = "android")), allow(dead_code))]
struct MapsScan {
    addr: usize,
    prev_end: usize,
}

#[cfg_attr(not(any(target_os = "linux", target_os = "android")), allow(dead_code))]
impl MapsScan {
    const fn new(addr: usize) -> Self {
        Self { addr, prev_end: 0 }
    }

    /// Consume one line. Returns the answer once it is known.
    fn feed(&mut self, line: &[u8]) -> Option<Region> {
        let (start, end, perms) = parse_maps_line(line)?;
        if self.addr < start {
            return Some(Region::free(self.prev_end, start));
        }
        if self.addr < end {
            let readable = perms.first() == Some(&b'r');
            let writable = perms.get(1) == Some(&b'w');
            let executable = perms.get(2) == Some(&b'x');
            return Some(Region {
                base: start,
                end,
                committed: true,
                readable,
                writable,
                guard: !readable && !writable && !executable,
            });
        }
        self.prev_end = end;
        None
    }

    /// The answer when every line was consumed without a match.
    const fn finish(self) -> Region {
        Region::free(self.prev_end, usize::MAX)
    }
}

/// Find the region containing `addr` in a `/proc/<pid>/maps` listing.
#[cfg(test)]
pub(crate) fn region_in_maps(maps: &str, addr: usize) -> Region {
    let mut scan = MapsScan::new(addr);
    for line in maps.lines() {
        if let Some(region) = scan.feed(line.as_bytes()) {
            return region;
        }
    }
    scan.finish()
}

#[cfg_attr(not(any(target_os = "linux", target_os = "android")), allow(dead_code))]
fn parse_maps_line(line: &[u8]) -> Option<(usize, usize, &[u8])> {
    let mut fields = line
        .split(u8::is_ascii_whitespace)
        .filter(|field| !field.is_empty());
    let range = fields.next()?;
    let perms = fields.next()?;
    let dash = range.iter().position(|&b| b == b'-')?;
    let lo = parse_hex(&range[..dash])?;
    let hi = parse_hex(&range[dash + 1..])?;
    Some((lo, hi, perms))
}

#[cfg_attr(not(any(target_os = "linux", target_os = "android")), allow(dead_code))]
fn parse_hex(digits: &[u8]) -> Option<usize> {
    usize::from_str_radix(std::str::from_utf8(digits).ok()?, 16).ok()
}

pub struct MmapInner {
    ptr: *mut libc::c_void,
    len: usize,
}

impl MmapInner {
    pub fn map_anon(len: usize, populate: bool) -> io::Result<Self> {
        let populate = if populate { MAP_POPULATE } else { 0 };
        let flags = libc::MAP_PRIVATE | libc::MAP_ANON | populate;
        let prot = libc::PROT_READ | libc::PROT_WRITE;

        // SAFETY: a fresh anonymous mapping with no address hint cannot
        // alias any existing memory.
        let ptr = unsafe { libc::mmap(ptr::null_mut(), len, prot, flags, -1, 0) };
        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }
        Ok(Self { ptr, len })
    }

    pub fn ptr(&self) -> *mut u8 {
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
        // SAFETY: the caller guarantees the range is ours and aligned.
        let rc = unsafe { libc::mprotect(self.ptr.cast::<u8>().add(offset).cast(), len, libc::PROT_NONE) };
        if rc != 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}

unsafe impl Send for MmapInner {}
unsafe impl Sync for MmapInner {}
