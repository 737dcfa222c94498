use super::RegisterSnapshot;

/// Order: `edi esi ebx edx ecx eax ebp`.
const PUSHED: usize = 7;

/// `ebx`, `esi`, `edi`, `ebp`.
pub const CALLEE_SAVED: usize = 4;

/// 32-bit x86 register snapshot.
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

/// # Safety
///
/// `uc` must point to the `ucontext_t` the kernel passed to a signal handler.
#[cfg(target_os = "linux")]
#[allow(clippy::cast_sign_loss)]
pub(crate) unsafe fn from_ucontext(uc: *const libc::ucontext_t) -> Registers {
    // SAFETY: the caller guarantees `uc` is a live signal context.
    let gregs = unsafe { &(*uc).uc_mcontext.gregs };
    let r = |i: libc::c_int| gregs[i as usize] as usize;
    Registers {
        regs: [
            r(libc::REG_EDI),
            r(libc::REG_ESI),
            r(libc::REG_EBX),
            r(libc::REG_EDX),
            r(libc::REG_ECX),
            r(libc::REG_EAX),
            r(libc::REG_EBP),
        ],
        sp: r(libc::REG_ESP),
    }
}

/// `CONTEXT_i386 | CONTEXT_CONTROL | CONTEXT_INTEGER`.
#[cfg(windows)]
pub(crate) const CONTEXT_FLAGS: u32 = 0x0001_0000 | 0x1 | 0x2;

#[cfg(windows)]
pub(crate) fn from_context(
    ctx: &windows_sys::Win32::System::Diagnostics::Debug::CONTEXT,
) -> Registers {
    Registers {
        regs: [
            ctx.Edi as usize,
            ctx.Esi as usize,
            ctx.Ebx as usize,
            ctx.Edx as usize,
            ctx.Ecx as usize,
            ctx.Eax as usize,
            ctx.Ebp as usize,
        ],
        sp: ctx.Esp as usize,
    }
}

#[inline(always)]
pub(crate) fn read_callee_saved() -> [usize; CALLEE_SAVED] {
    let mut regs = [0usize; CALLEE_SAVED];
    // SAFETY: only copies registers into outputs.
    unsafe {
        std::arch::asm!(
            "mov {0}, ebx",
            "mov {1}, esi",
            "mov {2}, edi",
            "mov {3}, ebp",
            out(reg) regs[0],
            out(reg) regs[1],
            out(reg) regs[2],
            out(reg) regs[3],
            options(nomem, nostack, preserves_flags),
        );
    }
    regs
}
