//! Boot-info abstraction and the kernel init sequence.
//!
//! The UEFI loader is out of tree; it exits boot services, builds a memory
//! map, and calls [`kernel_init`] with something implementing [`BootInfo`].

use crate::{fs, log, mm, net, sched};

/// What a memory-map region is good for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegionKind {
    /// Conventional memory, free for the PMM.
    Usable,
    /// Anything else: firmware, MMIO, loader allocations.
    Reserved,
}

/// One region of the boot memory map.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    /// Physical start address, page-aligned.
    pub start: u64,
    /// Length in 4 KiB pages.
    pub pages: u64,
    /// Usability.
    pub kind: MemoryRegionKind,
}

/// Loader-supplied boot information.
pub trait BootInfo {
    /// Iterates the physical memory map.
    fn memory_map(&self) -> impl Iterator<Item = MemoryRegion>;
}

/// Brings the core up: logging, memory, scheduler, filesystem, network.
///
/// On return the kernel heap and all subsystem globals are live; the caller
/// (the boot flow) spawns its initial threads and enters the scheduler via
/// [`sched::enter`].
pub fn kernel_init(boot_info: &impl BootInfo) {
    log::init_early_serial();
    muon_core::kinfo!("muon {} booting", crate::config::VERSION);

    mm::init(boot_info);
    log::init_logger();
    sched::init();
    fs::init();
    net::init();

    muon_core::kinfo!("muon: core services up");
}
