use super::RegisterSnapshot;

/// `x0` to `x28`, the frame pointer and the link register.
const PUSHED: usize = 31;

/// `x19` to `x29`.
pub const CALLEE_SAVED: usize = 11;

/// AArch64 register snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registers {
    regs: [usize; PUSHED],
    sp: usize,
}

impl Default for Registers {
    fn default() -> Self {
        Self {
            regs: [0; PUSHED],
            sp: 0,
        }
    }
}

impl Registers {
    /// Build a snapshot from raw values.
    #[must_use]
    pub const fn new(regs: [usize; PUSHED], sp: usize) -> Self {
        Self { regs, sp }
    }
}

impl RegisterSnapshot for Registers {
    const COUNT: usize = PUSHED;

    fn registers(&self) -> &[usize] {
        &self.regs
    }

    fn stack_pointer(&self) -> usize {
        self.sp
    }
}

/// # Safety
///
/// `uc` must point to the `ucontext_t` the kernel passed to a signal handler.
#[cfg(target_os = "linux")]
#[allow(clippy::cast_possible_truncation)]
pub(crate) unsafe fn from_ucontext(uc: *const libc::ucontext_t) -> Registers {
    // SAFETY: the caller guarantees `uc` is a live signal context.
    let mcontext = unsafe { &(*uc).uc_mcontext };
    let mut regs = [0usize; PUSHED];
    for (dst, src) in regs.iter_mut().zip(mcontext.regs.iter()) {
        *dst = *src as usize;
    }
    Registers {
        regs,
        sp: mcontext.sp as usize,
    }
}

/// `CONTEXT_ARM64 | CONTEXT_CONTROL | CONTEXT_INTEGER`.
#[cfg(windows)]
pub(crate) const CONTEXT_FLAGS: u32 = 0x0040_0000 | 0x1 | 0x2;

#[cfg(windows)]
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn from_context(
    ctx: &windows_sys::Win32::System::Diagnostics::Debug::CONTEXT,
) -> Registers {
    // SAFETY: both union views cover the same 31 integer registers.
    let x = unsafe { ctx.Anonymous.X };
    let mut regs = [0usize; PUSHED];
    for (dst, src) in regs.iter_mut().zip(x.iter()) {
        *dst = *src as usize;
    }
    Registers {
        regs,
        sp: ctx.Sp as usize,
    }
}

#[inline(always)]
pub(crate) fn read_callee_saved() -> [usize; CALLEE_SAVED] {
    let mut regs = [0usize; CALLEE_SAVED];
    // SAFETY: only copies registers into outputs.
    unsafe {
        std::arch::asm!(
            "mov {0}, x19",
            "mov {1}, x20",
            "mov {2}, x21",
            "mov {3}, x22",
            "mov {4}, x23",
            "mov {5}, x24",
            "mov {6}, x25",
            "mov {7}, x26",
            "mov {8}, x27",
            "mov {9}, x28",
            "mov {10}, x29",
            out(reg) regs[0],
            out(reg) regs[1],
            out(reg) regs[2],
            out(reg) regs[3],
            out(reg) regs[4],
            out(reg) regs[5],
            out(reg) regs[6],
            out(reg) regs[7],
            out(reg) regs[8],
            out(reg) regs[9],
            out(reg) regs[10],
            options(nomem, nostack, preserves_flags),
        );
    }
    regs
}
