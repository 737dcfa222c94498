//! Fallback for targets without a register map (and for Miri).
//!
//! Suspended threads report only a stack pointer. Their registers are
//! assumed to be saved on the stack by whatever suspended them.

use super::RegisterSnapshot;

/// Nothing to spill.
pub const CALLEE_SAVED: usize = 0;

/// Snapshot carrying only the stack pointer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    sp: usize,
}

impl Registers {
    /// Build a snapshot from a stack pointer.
    #[must_use]
    pub const fn new(sp: usize) -> Self {
        Self { sp }
    }
}

impl RegisterSnapshot for Registers {
    const COUNT: usize = 0;

    fn registers(&self) -> &[usize] {
        &[]
    }

    fn stack_pointer(&self) -> usize {
        self.sp
    }
}

#[inline(always)]
pub(crate) fn read_callee_saved() -> [usize; CALLEE_SAVED] {
    // Optimization barrier only.
    std::hint::black_box([])
}

/// # Safety
///
/// `_uc` is not read.
#[cfg(target_os = "linux")]
pub(crate) const unsafe fn from_ucontext(_uc: *const libc::ucontext_t) -> Registers {
    Registers::new(0)
}
