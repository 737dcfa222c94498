//! Register snapshots of suspended threads.
//!
//! Each supported instruction set gets one module describing which
//! general-purpose registers may hold heap pointers and where the stack
//! pointer lives, both in a Linux `ucontext_t` and in a Windows `CONTEXT`.
//! The rest of the crate only sees the [`RegisterSnapshot`] interface.

/// Register state captured from a stopped thread.
pub trait RegisterSnapshot: Copy + Default + Send + Sync + 'static {
    /// Number of register values [`Self::registers`] yields.
    const COUNT: usize;

    /// Every register that could hold a pointer, in a fixed per-ISA order.
    fn registers(&self) -> &[usize];

    /// Stack pointer at the moment the thread was stopped.
    fn stack_pointer(&self) -> usize;
}

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86_64", not(miri)))] {
        mod x86_64;
        pub use self::x86_64::Registers as NativeRegisters;
        pub(crate) use self::x86_64::*;
    } else if #[cfg(all(target_arch = "aarch64", not(miri)))] {
        mod aarch64;
        pub use self::aarch64::Registers as NativeRegisters;
        pub(crate) use self::aarch64::*;
    } else if #[cfg(all(target_arch = "x86", not(miri)))] {
        mod x86;
        pub use self::x86::Registers as NativeRegisters;
        pub(crate) use self::x86::*;
    } else {
        mod generic;
        pub use self::generic::Registers as NativeRegisters;
        pub(crate) use self::generic::*;
    }
}

/// What stop-the-world learned about a suspended thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SuspendedContext {
    /// Registers of the interrupted code.
    pub regs: NativeRegisters,
    /// Lowest address known to be in use by the thread. Usually the
    /// interrupted stack pointer; below it when the suspension itself
    /// pushed a frame that holds register state.
    pub sp: usize,
    /// False when the platform warned that the context may be stale, in
    /// which case the whole committed stack must be scanned.
    pub trustworthy: bool,
}

impl SuspendedContext {
    /// A context whose scan starts at the interrupted stack pointer.
    #[must_use]
    pub fn from_registers(regs: NativeRegisters) -> Self {
        Self {
            regs,
            sp: regs.stack_pointer(),
            trustworthy: true,
        }
    }
}

/// Read the callee-saved registers of the calling frame into an array.
///
/// Anything only held in a register by a caller up the stack is saved by
/// the time we run, except what sits in callee-saved registers; those are
/// copied out here so the collecting thread's own roots are not missed.
#[inline(never)]
pub(crate) fn spill_callee_saved() -> [usize; CALLEE_SAVED] {
    let regs = read_callee_saved();
    std::hint::black_box(&regs);
    regs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_count_matches_slice() {
        let regs = NativeRegisters::default();
        assert_eq!(regs.registers().len(), NativeRegisters::COUNT);
    }

    #[test]
    fn test_context_defaults_to_stack_pointer() {
        let ctx = SuspendedContext::from_registers(NativeRegisters::default());
        assert_eq!(ctx.sp, 0);
        assert!(ctx.trustworthy);
    }

    #[test]
    fn test_spill_yields_fixed_width() {
        assert_eq!(spill_callee_saved().len(), CALLEE_SAVED);
    }
}
