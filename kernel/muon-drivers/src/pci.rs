//! Legacy port-CAM PCI configuration access and device scanning.

use crate::port::{inl, outl};

const CONFIG_ADDRESS: u16 = 0xCF8;
const CONFIG_DATA: u16 = 0xCFC;

/// PCI command register offset.
const REG_COMMAND: u8 = 0x04;
/// Command bit: respond to memory space accesses.
const CMD_MEMORY_SPACE: u32 = 1 << 1;
/// Command bit: allow the device to master the bus (DMA).
const CMD_BUS_MASTER: u32 = 1 << 2;
/// BAR0 register offset.
const REG_BAR0: u8 = 0x10;

/// A device's location on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciAddress {
    /// Bus number.
    pub bus: u8,
    /// Device number (0–31).
    pub device: u8,
    /// Function number (0–7).
    pub function: u8,
}

impl core::fmt::Display for PciAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

fn config_address(addr: PciAddress, offset: u8) -> u32 {
    0x8000_0000
        | (u32::from(addr.bus) << 16)
        | (u32::from(addr.device) << 11)
        | (u32::from(addr.function) << 8)
        | u32::from(offset & 0xFC)
}

/// Reads a 32-bit configuration register.
///
/// # Safety
///
/// Ring 0 only; the address/data port pair is a global hardware resource.
pub unsafe fn config_read32(addr: PciAddress, offset: u8) -> u32 {
    // SAFETY: Caller contract.
    unsafe {
        outl(CONFIG_ADDRESS, config_address(addr, offset));
        inl(CONFIG_DATA)
    }
}

/// Writes a 32-bit configuration register.
///
/// # Safety
///
/// Same as [`config_read32`].
pub unsafe fn config_write32(addr: PciAddress, offset: u8, value: u32) {
    // SAFETY: Caller contract.
    unsafe {
        outl(CONFIG_ADDRESS, config_address(addr, offset));
        outl(CONFIG_DATA, value);
    }
}

/// Scans every bus/device/function for a vendor and one of several device
/// ids. Returns the first match.
///
/// # Safety
///
/// Ring 0 only.
pub unsafe fn find_device(vendor: u16, device_ids: &[u16]) -> Option<PciAddress> {
    for bus in 0..=255u8 {
        for device in 0..32u8 {
            for function in 0..8u8 {
                let addr = PciAddress {
                    bus,
                    device,
                    function,
                };
                // SAFETY: Forwarded caller contract.
                let id = unsafe { config_read32(addr, 0x00) };
                if id == 0xFFFF_FFFF {
                    continue;
                }
                let found_vendor = (id & 0xFFFF) as u16;
                let found_device = (id >> 16) as u16;
                if found_vendor == vendor && device_ids.contains(&found_device) {
                    return Some(addr);
                }
            }
        }
    }
    None
}

/// Reads BAR0 as an MMIO base (low flag bits masked off).
///
/// # Safety
///
/// Ring 0 only.
pub unsafe fn read_bar0(addr: PciAddress) -> u64 {
    // SAFETY: Forwarded caller contract.
    let bar = unsafe { config_read32(addr, REG_BAR0) };
    u64::from(bar & 0xFFFF_FFF0)
}

/// Sets memory-space decode and bus mastering in the command register.
///
/// # Safety
///
/// Ring 0 only.
pub unsafe fn enable_bus_mastering(addr: PciAddress) {
    // SAFETY: Forwarded caller contract.
    unsafe {
        let command = config_read32(addr, REG_COMMAND);
        config_write32(
            addr,
            REG_COMMAND,
            command | CMD_MEMORY_SPACE | CMD_BUS_MASTER,
        );
    }
}
