//! Saved CPU context for cooperative switching.
//!
//! The field order is a contract with the context-switch assembly in the
//! kernel crate; the offsets are pinned by compile-time asserts below.

/// Kernel code segment selector.
pub const KERNEL_CS: u16 = 0x08;
/// Kernel data segment selector.
pub const KERNEL_SS: u16 = 0x10;

/// Initial RFLAGS for a new thread: IF set plus the always-one bit.
pub const RFLAGS_IF: u64 = 0x202;

/// Callee-saved register state of a suspended thread.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CpuContext {
    /// Stack pointer.
    pub rsp: u64,
    /// Frame pointer.
    pub rbp: u64,
    /// Callee-saved general registers.
    pub rbx: u64,
    /// Callee-saved.
    pub r12: u64,
    /// Callee-saved.
    pub r13: u64,
    /// Callee-saved.
    pub r14: u64,
    /// Callee-saved.
    pub r15: u64,
    /// Resume address.
    pub rip: u64,
    /// Saved flags; restored on switch-in, so IF comes back per thread.
    pub rflags: u64,
    /// Code segment selector (same ring for every kernel thread).
    pub cs: u16,
    /// Stack segment selector.
    pub ss: u16,
}

// Offsets the assembly in muon-kernel relies on.
muon_core::static_assert!(core::mem::offset_of!(CpuContext, rsp) == 0x00);
muon_core::static_assert!(core::mem::offset_of!(CpuContext, rbp) == 0x08);
muon_core::static_assert!(core::mem::offset_of!(CpuContext, rbx) == 0x10);
muon_core::static_assert!(core::mem::offset_of!(CpuContext, r12) == 0x18);
muon_core::static_assert!(core::mem::offset_of!(CpuContext, r13) == 0x20);
muon_core::static_assert!(core::mem::offset_of!(CpuContext, r14) == 0x28);
muon_core::static_assert!(core::mem::offset_of!(CpuContext, r15) == 0x30);
muon_core::static_assert!(core::mem::offset_of!(CpuContext, rip) == 0x38);
muon_core::static_assert!(core::mem::offset_of!(CpuContext, rflags) == 0x40);

impl CpuContext {
    /// An all-zero context.
    pub const fn zeroed() -> Self {
        Self {
            rsp: 0,
            rbp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: 0,
            rflags: 0,
            cs: 0,
            ss: 0,
        }
    }

    /// Builds the initial context of a new thread.
    ///
    /// The stack pointer is aligned down to 16 bytes at the top of the
    /// stack, execution starts at `entry` (the thread trampoline), and the
    /// saved flags have interrupts enabled.
    pub fn for_new_thread(stack_top: u64, entry: u64) -> Self {
        Self {
            rsp: stack_top & !0xF,
            rip: entry,
            rflags: RFLAGS_IF,
            cs: KERNEL_CS,
            ss: KERNEL_SS,
            ..Self::zeroed()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_thread_context_is_aligned_with_interrupts_on() {
        let ctx = CpuContext::for_new_thread(0x8000_000F, 0x1234);
        assert_eq!(ctx.rsp % 16, 0);
        assert_eq!(ctx.rsp, 0x8000_0000);
        assert_eq!(ctx.rip, 0x1234);
        assert_eq!(ctx.rflags & 0x200, 0x200, "IF must be set");
        assert_eq!(ctx.cs, KERNEL_CS);
        assert_eq!(ctx.ss, KERNEL_SS);
    }
}
