//! Hardware drivers: legacy port I/O, the 16550 UART used by the logger,
//! port-CAM PCI enumeration, and the e1000 network controller.
//!
//! Register and descriptor manipulation is plain volatile memory access, so
//! the e1000 ring logic is exercised on the host against a fake MMIO block;
//! only PCI probing and port I/O are x86-specific.

#![cfg_attr(not(test), no_std)]

pub mod e1000;
#[cfg(target_arch = "x86_64")]
pub mod pci;
#[cfg(target_arch = "x86_64")]
pub mod port;
#[cfg(target_arch = "x86_64")]
pub mod uart16550;
