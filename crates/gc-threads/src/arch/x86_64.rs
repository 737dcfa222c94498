use super::RegisterSnapshot;

/// General-purpose registers other than `rsp`.
const PUSHED: usize = 15;

/// `rbx`, `rbp`, `r12` to `r15`.
pub const CALLEE_SAVED: usize = 6;

/// x86-64 register snapshot.
///
/// Order: `rax rcx rdx rbx rbp rsi rdi r8 .. r15`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    regs: [usize; PUSHED],
    sp: usize,
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

/// Extract the interrupted registers from a signal frame.
///
/// # Safety
///
/// `uc` must point to the `ucontext_t` the kernel passed to a signal handler.
#[cfg(target_os = "linux")]
#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
pub(crate) unsafe fn from_ucontext(uc: *const libc::ucontext_t) -> Registers {
    // SAFETY: the caller guarantees `uc` is a live signal context.
    let gregs = unsafe { &(*uc).uc_mcontext.gregs };
    let r = |i: libc::c_int| gregs[i as usize] as usize;
    Registers {
        regs: [
            r(libc::REG_RAX),
            r(libc::REG_RCX),
            r(libc::REG_RDX),
            r(libc::REG_RBX),
            r(libc::REG_RBP),
            r(libc::REG_RSI),
            r(libc::REG_RDI),
            r(libc::REG_R8),
            r(libc::REG_R9),
            r(libc::REG_R10),
            r(libc::REG_R11),
            r(libc::REG_R12),
            r(libc::REG_R13),
            r(libc::REG_R14),
            r(libc::REG_R15),
        ],
        sp: r(libc::REG_RSP),
    }
}

/// `CONTEXT_AMD64 | CONTEXT_CONTROL | CONTEXT_INTEGER`.
#[cfg(windows)]
pub(crate) const CONTEXT_FLAGS: u32 = 0x0010_0000 | 0x1 | 0x2;

#[cfg(windows)]
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn from_context(
    ctx: &windows_sys::Win32::System::Diagnostics::Debug::CONTEXT,
) -> Registers {
    Registers {
        regs: [
            ctx.Rax as usize,
            ctx.Rcx as usize,
            ctx.Rdx as usize,
            ctx.Rbx as usize,
            ctx.Rbp as usize,
            ctx.Rsi as usize,
            ctx.Rdi as usize,
            ctx.R8 as usize,
            ctx.R9 as usize,
            ctx.R10 as usize,
            ctx.R11 as usize,
            ctx.R12 as usize,
            ctx.R13 as usize,
            ctx.R14 as usize,
            ctx.R15 as usize,
        ],
        sp: ctx.Rsp as usize,
    }
}

#[inline(always)]
pub(crate) fn read_callee_saved() -> [usize; CALLEE_SAVED] {
    let mut regs = [0usize; CALLEE_SAVED];
    // SAFETY: only copies registers into outputs.
    unsafe {
        std::arch::asm!(
            "mov {0}, rbx",
            "mov {1}, rbp",
            "mov {2}, r12",
            "mov {3}, r13",
            "mov {4}, r14",
            "mov {5}, r15",
            out(reg) regs[0],
            out(reg) regs[1],
            out(reg) regs[2],
            out(reg) regs[3],
            out(reg) regs[4],
            out(reg) regs[5],
            options(nomem, nostack, preserves_flags),
        );
    }
    regs
}
