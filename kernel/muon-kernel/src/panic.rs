//! Kernel panic handler: report and halt.

use core::panic::PanicInfo;

use crate::arch;

#[panic_handler]
fn panic(info: &PanicInfo<'_>) -> ! {
    arch::interrupts::disable();

    // Write straight to the UART; the logger's lock may be held by the
    // panicking context.
    #[cfg(target_arch = "x86_64")]
    {
        use core::fmt::Write as _;
        use muon_drivers::uart16550::{COM1, Uart16550};

        let mut w = crate::log::SerialWriter(Uart16550::new(COM1));
        let _ = write!(w, "\n!!! KERNEL PANIC !!!\n{info}\n");
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = info;

    arch::halt_forever()
}
