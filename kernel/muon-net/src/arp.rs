//! ARP: IPv4-to-MAC resolution with a fixed-size LRU cache.

use muon_core::time;
use planck_noalloc::vec::ArrayVec;

use crate::NetError;
use crate::ethernet::ETHERTYPE_ARP;
use crate::stack::NetStack;
use crate::types::{Ipv4Addr, MacAddr};

/// Cache capacity; the oldest entry is evicted when full.
pub const ARP_CACHE_SIZE: usize = 16;

/// Ticks to wait per resolution attempt.
const ARP_WAIT_TICKS: u64 = 500;
/// Resolution attempts before giving up.
const ARP_ATTEMPTS: usize = 3;
/// Hard cap on poll iterations per attempt, in case ticks stall.
const ARP_POLL_CAP: usize = 100_000;

const ARP_HTYPE_ETHERNET: u16 = 1;
const ARP_PTYPE_IPV4: u16 = 0x0800;
/// ARP request operation.
pub const ARP_OP_REQUEST: u16 = 1;
/// ARP reply operation.
pub const ARP_OP_REPLY: u16 = 2;

/// Wire size of an Ethernet/IPv4 ARP packet.
pub const ARP_PACKET_LEN: usize = 28;

#[derive(Debug, Clone, Copy)]
struct ArpEntry {
    ip: Ipv4Addr,
    mac: MacAddr,
    /// Tick of insertion or last hit; the LRU victim has the lowest value.
    stamp: u64,
}

/// Fixed-size LRU cache of resolved addresses. At most one entry per IPv4.
pub struct ArpCache {
    entries: ArrayVec<ArpEntry, ARP_CACHE_SIZE>,
}

impl Default for ArpCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ArpCache {
    /// An empty cache.
    pub const fn new() -> Self {
        Self {
            entries: ArrayVec::new(),
        }
    }

    /// Looks up a MAC, refreshing the entry's LRU stamp on a hit.
    pub fn lookup(&mut self, ip: Ipv4Addr) -> Option<MacAddr> {
        let entry = self.entries.iter_mut().find(|e| e.ip == ip)?;
        entry.stamp = time::ticks();
        Some(entry.mac)
    }

    /// Inserts or refreshes a mapping, evicting the oldest entry when full.
    pub fn insert(&mut self, ip: Ipv4Addr, mac: MacAddr) {
        let stamp = time::ticks();
        if let Some(entry) = self.entries.iter_mut().find(|e| e.ip == ip) {
            entry.mac = mac;
            entry.stamp = stamp;
            return;
        }
        if self.entries.is_full() {
            let victim = self
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.stamp)
                .map(|(i, _)| i);
            if let Some(i) = victim {
                self.entries.swap_remove(i);
            }
        }
        self.entries.push(ArpEntry { ip, mac, stamp });
    }

    /// Snapshot of all mappings, for the `arp` command.
    pub fn entries(&self) -> impl Iterator<Item = (Ipv4Addr, MacAddr)> + '_ {
        self.entries.iter().map(|e| (e.ip, e.mac))
    }

    /// Number of cached mappings.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Serialises an ARP packet.
pub fn build_packet(
    op: u16,
    sender_mac: MacAddr,
    sender_ip: Ipv4Addr,
    target_mac: MacAddr,
    target_ip: Ipv4Addr,
) -> [u8; ARP_PACKET_LEN] {
    let mut p = [0u8; ARP_PACKET_LEN];
    p[0..2].copy_from_slice(&ARP_HTYPE_ETHERNET.to_be_bytes());
    p[2..4].copy_from_slice(&ARP_PTYPE_IPV4.to_be_bytes());
    p[4] = 6; // hardware address length
    p[5] = 4; // protocol address length
    p[6..8].copy_from_slice(&op.to_be_bytes());
    p[8..14].copy_from_slice(sender_mac.as_bytes());
    p[14..18].copy_from_slice(sender_ip.as_bytes());
    p[18..24].copy_from_slice(target_mac.as_bytes());
    p[24..28].copy_from_slice(target_ip.as_bytes());
    p
}

impl NetStack {
    /// Broadcasts an ARP request for `target`.
    pub(crate) fn send_arp_request(&mut self, target: Ipv4Addr) -> Result<(), NetError> {
        let packet = build_packet(
            ARP_OP_REQUEST,
            self.config.mac,
            self.config.ip,
            MacAddr::ZERO,
            target,
        );
        self.send_frame(MacAddr::BROADCAST, ETHERTYPE_ARP, &packet)
    }

    /// Resolves an IPv4 address to a MAC.
    ///
    /// Cache hits return immediately; otherwise up to three broadcast
    /// requests are sent, each followed by a bounded poll for the reply.
    ///
    /// # Errors
    ///
    /// [`NetError::Timeout`] when every attempt goes unanswered.
    pub fn arp_resolve(&mut self, ip: Ipv4Addr) -> Result<MacAddr, NetError> {
        if ip == Ipv4Addr::BROADCAST {
            return Ok(MacAddr::BROADCAST);
        }
        if let Some(mac) = self.arp.lookup(ip) {
            return Ok(mac);
        }

        for _ in 0..ARP_ATTEMPTS {
            self.send_arp_request(ip)?;
            let deadline = time::ticks() + ARP_WAIT_TICKS;
            for _ in 0..ARP_POLL_CAP {
                self.poll();
                if let Some(mac) = self.arp.lookup(ip) {
                    return Ok(mac);
                }
                if time::ticks() >= deadline {
                    break;
                }
            }
        }

        muon_core::kwarn!("arp: no reply for {ip}");
        Err(NetError::Timeout)
    }

    /// Handles a received ARP packet: learn the sender, answer requests
    /// directed at our address.
    pub(crate) fn handle_arp(&mut self, data: &[u8]) {
        if data.len() < ARP_PACKET_LEN {
            return;
        }
        let htype = u16::from_be_bytes([data[0], data[1]]);
        let ptype = u16::from_be_bytes([data[2], data[3]]);
        if htype != ARP_HTYPE_ETHERNET || ptype != ARP_PTYPE_IPV4 {
            return;
        }
        let op = u16::from_be_bytes([data[6], data[7]]);
        let sender_mac = MacAddr([data[8], data[9], data[10], data[11], data[12], data[13]]);
        let sender_ip = Ipv4Addr([data[14], data[15], data[16], data[17]]);
        let target_ip = Ipv4Addr([data[24], data[25], data[26], data[27]]);

        // Learn from every ARP we see, request or reply.
        self.arp.insert(sender_ip, sender_mac);

        if op == ARP_OP_REQUEST && self.config.configured && target_ip == self.config.ip {
            let reply = build_packet(
                ARP_OP_REPLY,
                self.config.mac,
                self.config.ip,
                sender_mac,
                sender_ip,
            );
            let _ = self.send_frame(sender_mac, ETHERTYPE_ARP, &reply);
        }
    }
}
