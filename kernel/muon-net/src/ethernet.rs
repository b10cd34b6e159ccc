//! Ethernet framing and the upward dispatch on EtherType.

use alloc::vec::Vec;

use crate::NetError;
use crate::stack::NetStack;
use crate::types::MacAddr;

/// EtherType for ARP.
pub const ETHERTYPE_ARP: u16 = 0x0806;
/// EtherType for IPv4.
pub const ETHERTYPE_IPV4: u16 = 0x0800;

/// Ethernet header length: two MACs plus the EtherType.
pub const HEADER_LEN: usize = 14;

/// A parsed Ethernet frame borrowing its payload.
#[derive(Debug)]
pub struct Frame<'a> {
    /// Destination MAC.
    pub dst: MacAddr,
    /// Source MAC.
    pub src: MacAddr,
    /// EtherType in host order.
    pub ethertype: u16,
    /// Everything after the header.
    pub payload: &'a [u8],
}

/// Serialises a frame.
pub fn build_frame(dst: MacAddr, src: MacAddr, ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(dst.as_bytes());
    frame.extend_from_slice(src.as_bytes());
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Parses a frame; `None` when shorter than the header.
pub fn parse(data: &[u8]) -> Option<Frame<'_>> {
    if data.len() < HEADER_LEN {
        return None;
    }
    let mut dst = [0u8; 6];
    let mut src = [0u8; 6];
    dst.copy_from_slice(&data[0..6]);
    src.copy_from_slice(&data[6..12]);
    Some(Frame {
        dst: MacAddr(dst),
        src: MacAddr(src),
        ethertype: u16::from_be_bytes([data[12], data[13]]),
        payload: &data[HEADER_LEN..],
    })
}

impl NetStack {
    /// Wraps a payload in an Ethernet frame from our MAC and transmits it.
    ///
    /// # Errors
    ///
    /// Device transmit failures.
    pub fn send_frame(
        &mut self,
        dst: MacAddr,
        ethertype: u16,
        payload: &[u8],
    ) -> Result<(), NetError> {
        let frame = build_frame(dst, self.config.mac, ethertype, payload);
        self.device.transmit(&frame)
    }

    /// Runs one received frame up the dispatch tree.
    ///
    /// Unknown EtherTypes are dropped.
    pub fn handle_frame(&mut self, data: &[u8]) {
        let Some(frame) = parse(data) else { return };
        match frame.ethertype {
            ETHERTYPE_ARP => self.handle_arp(frame.payload),
            ETHERTYPE_IPV4 => self.handle_ipv4(frame.payload),
            other => {
                muon_core::ktrace!("net: dropping frame with ethertype {other:#06x}");
            }
        }
    }
}
