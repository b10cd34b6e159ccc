//! The network stack object.
//!
//! One `NetStack` per interface (the kernel has exactly one). Owns every
//! piece of per-interface state so the protocol layers can be exercised as
//! ordinary methods, with the kernel holding the instance behind a lock.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::arp::ArpCache;
use crate::device::NetDevice;
use crate::dhcp::DhcpClient;
use crate::dns::DnsClient;
use crate::icmp::EchoReply;
use crate::tcp::SocketTable;
use crate::types::{Ipv4Addr, NetConfig};
use crate::udp::UdpHandlers;

/// Default DNS server used until DHCP supplies one.
pub const DEFAULT_DNS_SERVER: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

/// Per-interface protocol stack state.
pub struct NetStack {
    pub(crate) device: Arc<dyn NetDevice>,
    pub(crate) config: NetConfig,
    pub(crate) arp: ArpCache,
    pub(crate) udp_handlers: UdpHandlers,
    pub(crate) sockets: SocketTable,
    pub(crate) dns_server: Ipv4Addr,
    pub(crate) dhcp: DhcpClient,
    pub(crate) dns: DnsClient,
    /// Most recent ICMP echo reply, consumed by `ping`.
    pub(crate) last_echo: Option<EchoReply>,
    /// IPv4 identification counter.
    pub(crate) ip_ident: u16,
    /// Next ephemeral TCP port.
    pub(crate) next_ephemeral: u16,
    /// Initial-sequence-number counter.
    pub(crate) isn: u32,
}

impl NetStack {
    /// Builds a stack over a device; the interface starts unconfigured with
    /// the device's MAC.
    pub fn new(device: Arc<dyn NetDevice>) -> Self {
        let mac = device.mac();
        muon_core::kinfo!("net: interface up, mac {}", mac);
        Self {
            device,
            config: NetConfig::new(mac),
            arp: ArpCache::new(),
            udp_handlers: UdpHandlers::new(),
            sockets: SocketTable::new(),
            dns_server: DEFAULT_DNS_SERVER,
            dhcp: DhcpClient::new(),
            dns: DnsClient::new(),
            last_echo: None,
            ip_ident: 1,
            next_ephemeral: 49152,
            isn: 0x0001_0000,
        }
    }

    /// Current interface configuration.
    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    /// Applies a static IPv4 configuration and marks the interface up.
    pub fn set_config(&mut self, ip: Ipv4Addr, netmask: Ipv4Addr, gateway: Ipv4Addr) {
        self.config.ip = ip;
        self.config.netmask = netmask;
        self.config.gateway = gateway;
        self.config.configured = true;
        muon_core::kinfo!("net: configured ip={ip} mask={netmask} gw={gateway}");
    }

    /// The ARP cache, for the `arp` listing command.
    pub fn arp_cache(&self) -> &ArpCache {
        &self.arp
    }

    /// The DNS server queries go to.
    pub fn dns_server(&self) -> Ipv4Addr {
        self.dns_server
    }

    /// Overrides the DNS server.
    pub fn set_dns_server(&mut self, server: Ipv4Addr) {
        self.dns_server = server;
    }

    /// Drains the device and runs every pending frame up the stack.
    ///
    /// Called from the NIC interrupt path and from the bounded spin-polls.
    pub fn poll(&mut self) {
        let device = self.device.clone();
        let mut frames: Vec<Vec<u8>> = Vec::new();
        device.poll(&mut |frame| frames.push(frame.to_vec()));
        for frame in frames {
            self.handle_frame(&frame);
        }
    }

    /// Allocates the next IPv4 identification value.
    pub(crate) fn next_ident(&mut self) -> u16 {
        let id = self.ip_ident;
        self.ip_ident = self.ip_ident.wrapping_add(1);
        id
    }

    /// Allocates an ephemeral TCP port.
    pub(crate) fn ephemeral_port(&mut self) -> u16 {
        let port = self.next_ephemeral;
        self.next_ephemeral = if self.next_ephemeral == u16::MAX {
            49152
        } else {
            self.next_ephemeral + 1
        };
        port
    }
}
