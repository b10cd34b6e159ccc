//! Architecture support.
//!
//! Interrupt control and the halt instructions compile to no-ops on hosted
//! builds so the scheduler glue stays host-checkable; the real instructions
//! only exist on the bare-metal target.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

/// Interrupt-flag control.
pub mod interrupts {
    /// Enables maskable interrupts.
    #[inline]
    pub fn enable() {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        // SAFETY: Plain sti; the IDT is installed before any thread runs.
        unsafe {
            core::arch::asm!("sti", options(nomem, nostack));
        }
    }

    /// Disables maskable interrupts.
    #[inline]
    pub fn disable() {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        // SAFETY: Plain cli.
        unsafe {
            core::arch::asm!("cli", options(nomem, nostack));
        }
    }

    /// Runs a closure with interrupts disabled, re-enabling afterwards.
    ///
    /// Muon is single-CPU and every kernel thread runs with interrupts
    /// enabled, so unconditional re-enable is correct outside interrupt
    /// handlers (which never call this).
    pub fn without<R>(f: impl FnOnce() -> R) -> R {
        disable();
        let result = f();
        enable();
        result
    }
}

/// Waits for the next interrupt (no-op on hosted builds).
#[inline]
pub fn halt_once() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // SAFETY: hlt resumes on the next interrupt.
    unsafe {
        core::arch::asm!("hlt", options(nomem, nostack));
    }
}

/// Parks the CPU forever.
pub fn halt_forever() -> ! {
    loop {
        halt_once();
        core::hint::spin_loop();
    }
}
