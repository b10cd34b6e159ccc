//! IPv4: header construction, input validation, and routing.

use alloc::vec::Vec;

use crate::NetError;
use crate::checksum::internet_checksum;
use crate::ethernet::ETHERTYPE_IPV4;
use crate::icmp;
use crate::stack::NetStack;
use crate::types::{Ipv4Addr, MacAddr};

/// IP protocol number for ICMP.
pub const PROTO_ICMP: u8 = 1;
/// IP protocol number for TCP.
pub const PROTO_TCP: u8 = 6;
/// IP protocol number for UDP.
pub const PROTO_UDP: u8 = 17;

/// Minimum header length (IHL = 5).
pub const HEADER_LEN: usize = 20;

/// Outgoing time-to-live.
const TTL: u8 = 64;

/// A parsed IPv4 packet borrowing its payload.
#[derive(Debug)]
pub struct Packet<'a> {
    /// Source address.
    pub src: Ipv4Addr,
    /// Destination address.
    pub dst: Ipv4Addr,
    /// Protocol number.
    pub protocol: u8,
    /// Payload after the (possibly option-bearing) header.
    pub payload: &'a [u8],
}

/// Builds a 20-byte header. The checksum is computed last, over the header
/// only.
pub fn build_header(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    payload_len: usize,
    ident: u16,
) -> [u8; HEADER_LEN] {
    let mut h = [0u8; HEADER_LEN];
    h[0] = 0x45; // version 4, IHL 5
    let total = (HEADER_LEN + payload_len) as u16;
    h[2..4].copy_from_slice(&total.to_be_bytes());
    h[4..6].copy_from_slice(&ident.to_be_bytes());
    h[8] = TTL;
    h[9] = protocol;
    h[12..16].copy_from_slice(src.as_bytes());
    h[16..20].copy_from_slice(dst.as_bytes());
    let csum = internet_checksum(&h);
    h[10..12].copy_from_slice(&csum.to_be_bytes());
    h
}

/// Parses and validates a packet. Returns `None` for anything with a bad
/// version or IHL, or truncated lengths.
pub fn parse(data: &[u8]) -> Option<Packet<'_>> {
    if data.len() < HEADER_LEN {
        return None;
    }
    let version = data[0] >> 4;
    let ihl = (data[0] & 0x0F) as usize * 4;
    if version != 4 || ihl < HEADER_LEN || data.len() < ihl {
        return None;
    }
    let total = u16::from_be_bytes([data[2], data[3]]) as usize;
    if total < ihl || total > data.len() {
        return None;
    }
    Some(Packet {
        src: Ipv4Addr([data[12], data[13], data[14], data[15]]),
        dst: Ipv4Addr([data[16], data[17], data[18], data[19]]),
        protocol: data[9],
        payload: &data[ihl..total],
    })
}

impl NetStack {
    /// Sends a payload to `dst` under the given protocol.
    ///
    /// Packets to our own address loop back without touching the wire (with
    /// the ICMP echo-request conversion so self-pings work). Broadcast goes
    /// straight to the broadcast MAC; everything else resolves the next hop
    /// — the destination itself when on-link, the gateway otherwise.
    ///
    /// # Errors
    ///
    /// [`NetError::NotConfigured`] before configuration (broadcast is
    /// allowed, for DHCP), ARP timeouts, and device failures.
    pub fn send_ipv4(
        &mut self,
        dst: Ipv4Addr,
        protocol: u8,
        payload: &[u8],
    ) -> Result<(), NetError> {
        // Loopback path.
        if self.config.configured && dst == self.config.ip {
            self.deliver_loopback(protocol, payload);
            return Ok(());
        }

        let dst_mac = if dst == Ipv4Addr::BROADCAST {
            MacAddr::BROADCAST
        } else {
            if !self.config.configured {
                return Err(NetError::NotConfigured);
            }
            let next_hop = if self.config.is_local(dst) {
                dst
            } else {
                self.config.gateway
            };
            self.arp_resolve(next_hop)?
        };

        let ident = self.next_ident();
        let header = build_header(self.config.ip, dst, protocol, payload.len(), ident);
        let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
        packet.extend_from_slice(&header);
        packet.extend_from_slice(payload);
        self.send_frame(dst_mac, ETHERTYPE_IPV4, &packet)
    }

    /// Local delivery for packets addressed to ourselves.
    fn deliver_loopback(&mut self, protocol: u8, payload: &[u8]) {
        let own = self.config.ip;
        if protocol == PROTO_ICMP {
            // Convert an echo request into the reply the sender expects.
            if let Some(reply) = icmp::loopback_convert(payload) {
                self.handle_icmp(own, &reply);
                return;
            }
        }
        self.dispatch_protocol(own, own, protocol, payload);
    }

    /// Validates and dispatches a received IPv4 packet.
    pub(crate) fn handle_ipv4(&mut self, data: &[u8]) {
        let Some(packet) = parse(data) else { return };

        // Drop traffic that is neither for us nor broadcast.
        if self.config.configured
            && packet.dst != self.config.ip
            && packet.dst != Ipv4Addr::BROADCAST
        {
            return;
        }

        self.dispatch_protocol(packet.src, packet.dst, packet.protocol, packet.payload);
    }

    /// Protocol demultiplexer shared by the receive and loopback paths.
    fn dispatch_protocol(&mut self, src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload: &[u8]) {
        match protocol {
            PROTO_ICMP => self.handle_icmp(src, payload),
            PROTO_UDP => self.handle_udp(src, dst, payload),
            PROTO_TCP => self.handle_tcp(src, payload),
            other => {
                muon_core::ktrace!("ipv4: dropping protocol {other}");
            }
        }
    }
}
