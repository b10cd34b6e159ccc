//! Network bring-up and the NIC interrupt entry point.

use alloc::sync::Arc;

use muon_core::sync::SpinLock;
use muon_net::NetStack;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use muon_drivers::e1000::E1000Nic;

/// The per-interface stack; `None` when no NIC was found.
static NET: SpinLock<Option<NetStack>> = SpinLock::new(None);

/// The NIC itself, kept separately so the interrupt handler can acknowledge
/// causes without going through the stack.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
static NIC: SpinLock<Option<Arc<E1000Nic>>> = SpinLock::new(None);

/// Probes for an e1000, brings it up, and builds the protocol stack.
pub fn init() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        use muon_drivers::e1000::{E1000_DEVICE_IDS, INTEL_VENDOR};
        use muon_drivers::pci;

        // SAFETY: Ring 0; the port-CAM registers are ours alone.
        let Some(addr) = (unsafe { pci::find_device(INTEL_VENDOR, &E1000_DEVICE_IDS) }) else {
            muon_core::kwarn!("net: no e1000 found, networking disabled");
            return;
        };
        // SAFETY: As above.
        let bar0 = unsafe {
            pci::enable_bus_mastering(addr);
            pci::read_bar0(addr)
        };

        // SAFETY: BAR0 is the device's MMIO window (identity-mapped) and
        // the PMM hands out exclusively-owned frames.
        match unsafe { E1000Nic::new(bar0 as *mut u8, crate::mm::dma_alloc_frame) } {
            Ok(nic) => {
                let nic = Arc::new(nic);
                muon_core::kinfo!("net: e1000 at {addr}, mmio {bar0:#x}");
                *NIC.lock() = Some(nic.clone());
                *NET.lock() = Some(NetStack::new(nic));
            }
            Err(e) => muon_core::kerr!("net: e1000 init failed: {e}"),
        }
    }
}

/// Installs a stack over an already-initialised device (tests, alternate
/// drivers).
pub fn init_with_device(device: Arc<dyn muon_net::device::NetDevice>) {
    *NET.lock() = Some(NetStack::new(device));
}

/// Runs a closure on the stack; `None` when networking is down.
pub fn with_net<R>(f: impl FnOnce(&mut NetStack) -> R) -> Option<R> {
    crate::arch::interrupts::without(|| {
        let mut net = NET.lock();
        net.as_mut().map(f)
    })
}

/// NIC interrupt entry point: acknowledge the cause, then drain the RX ring
/// through the stack. `try_lock` keeps interrupt context deadlock-free —
/// when a polling loop already holds the stack it will drain the ring
/// itself.
pub fn nic_interrupt() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    if let Some(nic) = NIC.try_lock() {
        if let Some(nic) = nic.as_ref() {
            let _ = nic.acknowledge_interrupt();
        }
    }

    if let Some(mut net) = NET.try_lock() {
        if let Some(stack) = net.as_mut() {
            stack.poll();
        }
    }
}
