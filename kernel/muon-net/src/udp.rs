//! UDP: datagram framing and the per-port handler registry.

use alloc::vec::Vec;

use planck_noalloc::vec::ArrayVec;

use crate::NetError;
use crate::dhcp::DHCP_CLIENT_PORT;
use crate::dns::DNS_CLIENT_PORT;
use crate::ipv4::PROTO_UDP;
use crate::stack::NetStack;
use crate::types::Ipv4Addr;

/// UDP header length.
pub const HEADER_LEN: usize = 8;

/// Maximum user port handlers.
pub const MAX_UDP_HANDLERS: usize = 8;

/// A user datagram handler: `(source ip, source port, payload)`.
pub type UdpHandler = fn(Ipv4Addr, u16, &[u8]);

/// Registry of user handlers, keyed by local port.
pub struct UdpHandlers {
    entries: ArrayVec<(u16, UdpHandler), MAX_UDP_HANDLERS>,
}

impl Default for UdpHandlers {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpHandlers {
    /// An empty registry.
    pub const fn new() -> Self {
        Self {
            entries: ArrayVec::new(),
        }
    }

    fn find(&self, port: u16) -> Option<UdpHandler> {
        self.entries
            .iter()
            .find(|(p, _)| *p == port)
            .map(|(_, h)| *h)
    }
}

/// Builds a UDP header. The checksum is left zero (unused over IPv4).
pub fn build_header(src_port: u16, dst_port: u16, payload_len: usize) -> [u8; HEADER_LEN] {
    let mut h = [0u8; HEADER_LEN];
    h[0..2].copy_from_slice(&src_port.to_be_bytes());
    h[2..4].copy_from_slice(&dst_port.to_be_bytes());
    let length = (HEADER_LEN + payload_len) as u16;
    h[4..6].copy_from_slice(&length.to_be_bytes());
    h
}

impl NetStack {
    /// Registers a handler for datagrams arriving on `port`.
    ///
    /// # Errors
    ///
    /// [`NetError::TableFull`] past [`MAX_UDP_HANDLERS`],
    /// [`NetError::InvalidArgument`] if the port already has a handler.
    pub fn udp_bind(&mut self, port: u16, handler: UdpHandler) -> Result<(), NetError> {
        if self.udp_handlers.find(port).is_some() {
            return Err(NetError::InvalidArgument);
        }
        self.udp_handlers
            .entries
            .try_push((port, handler))
            .map_err(|_| NetError::TableFull)
    }

    /// Removes the handler for `port`, if any.
    pub fn udp_unbind(&mut self, port: u16) {
        if let Some(idx) = self
            .udp_handlers
            .entries
            .iter()
            .position(|(p, _)| *p == port)
        {
            self.udp_handlers.entries.swap_remove(idx);
        }
    }

    /// Sends a datagram.
    ///
    /// # Errors
    ///
    /// IPv4 send-path errors.
    pub fn udp_send(
        &mut self,
        dst_ip: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        payload: &[u8],
    ) -> Result<(), NetError> {
        let mut datagram = Vec::with_capacity(HEADER_LEN + payload.len());
        datagram.extend_from_slice(&build_header(src_port, dst_port, payload.len()));
        datagram.extend_from_slice(payload);
        self.send_ipv4(dst_ip, PROTO_UDP, &datagram)
    }

    /// Dispatches a received datagram by destination port.
    ///
    /// The DHCP and DNS client ports route to the built-in clients;
    /// everything else goes to the user registry or is dropped.
    pub(crate) fn handle_udp(&mut self, src_ip: Ipv4Addr, _dst_ip: Ipv4Addr, data: &[u8]) {
        if data.len() < HEADER_LEN {
            return;
        }
        let src_port = u16::from_be_bytes([data[0], data[1]]);
        let dst_port = u16::from_be_bytes([data[2], data[3]]);
        let length = u16::from_be_bytes([data[4], data[5]]) as usize;
        if length < HEADER_LEN || length > data.len() {
            return;
        }
        let payload = &data[HEADER_LEN..length];

        match dst_port {
            DHCP_CLIENT_PORT => self.dhcp_input(payload),
            DNS_CLIENT_PORT => self.dns_input(src_ip, payload),
            port => {
                if let Some(handler) = self.udp_handlers.find(port) {
                    handler(src_ip, src_port, payload);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test::TestDevice;
    use crate::ethernet::{self, ETHERTYPE_IPV4};
    use crate::ipv4;
    use crate::types::MacAddr;
    use alloc::sync::Arc;
    use std::sync::Mutex;

    fn configured_stack() -> (NetStack, Arc<TestDevice>) {
        let dev = Arc::new(TestDevice::new());
        let mut stack = NetStack::new(dev.clone());
        stack.set_config(
            Ipv4Addr::new(10, 0, 2, 15),
            Ipv4Addr::new(255, 255, 255, 0),
            Ipv4Addr::new(10, 0, 2, 2),
        );
        (stack, dev)
    }

    fn datagram_frame(stack: &NetStack, src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let src_ip = Ipv4Addr::new(10, 0, 2, 7);
        let mut segment = build_header(src_port, dst_port, payload.len()).to_vec();
        segment.extend_from_slice(payload);
        let mut packet =
            ipv4::build_header(src_ip, stack.config.ip, PROTO_UDP, segment.len(), 1).to_vec();
        packet.extend_from_slice(&segment);
        ethernet::build_frame(stack.config.mac, MacAddr([7; 6]), ETHERTYPE_IPV4, &packet)
    }

    static RECEIVED: Mutex<Vec<(Ipv4Addr, u16, Vec<u8>)>> = Mutex::new(Vec::new());

    fn record_handler(src: Ipv4Addr, src_port: u16, payload: &[u8]) {
        RECEIVED.lock().unwrap().push((src, src_port, payload.to_vec()));
    }

    #[test]
    fn bound_port_receives_its_datagrams() {
        let (mut stack, _dev) = configured_stack();
        RECEIVED.lock().unwrap().clear();
        stack.udp_bind(7000, record_handler).unwrap();

        let frame = datagram_frame(&stack, 5555, 7000, b"hello udp");
        stack.handle_frame(&frame);

        let got = RECEIVED.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, Ipv4Addr::new(10, 0, 2, 7));
        assert_eq!(got[0].1, 5555);
        assert_eq!(got[0].2, b"hello udp");
    }

    #[test]
    fn unbound_ports_drop_silently() {
        let (mut stack, dev) = configured_stack();
        let frame = datagram_frame(&stack, 5555, 7001, b"nobody home");
        stack.handle_frame(&frame);
        assert_eq!(dev.sent_count(), 0);
    }

    #[test]
    fn registry_rejects_duplicates_and_fills_up() {
        let (mut stack, _dev) = configured_stack();
        fn nop(_: Ipv4Addr, _: u16, _: &[u8]) {}

        for port in 0..MAX_UDP_HANDLERS as u16 {
            stack.udp_bind(9000 + port, nop).unwrap();
        }
        assert_eq!(stack.udp_bind(9999, nop), Err(NetError::TableFull));
        assert_eq!(stack.udp_bind(9000, nop), Err(NetError::InvalidArgument));

        stack.udp_unbind(9000);
        assert!(stack.udp_bind(9999, nop).is_ok());
    }

    #[test]
    fn sent_datagrams_carry_ports_and_length() {
        let (mut stack, dev) = configured_stack();
        let peer = Ipv4Addr::new(10, 0, 2, 7);
        stack.arp.insert(peer, MacAddr([7; 6]));

        stack.udp_send(peer, 1234, 5678, b"data").unwrap();
        let sent = dev.sent();
        assert_eq!(sent.len(), 1);

        let ip = ipv4::parse(ethernet::parse(&sent[0]).unwrap().payload).unwrap();
        assert_eq!(ip.protocol, PROTO_UDP);
        let udp = ip.payload;
        assert_eq!(u16::from_be_bytes([udp[0], udp[1]]), 1234);
        assert_eq!(u16::from_be_bytes([udp[2], udp[3]]), 5678);
        assert_eq!(u16::from_be_bytes([udp[4], udp[5]]) as usize, HEADER_LEN + 4);
        assert_eq!(&udp[HEADER_LEN..], b"data");
    }

    #[test]
    fn truncated_headers_are_dropped() {
        let (mut stack, dev) = configured_stack();
        let frame = datagram_frame(&stack, 1, 2, b"");
        // Chop the UDP header in half.
        let short = &frame[..frame.len() - HEADER_LEN + 3];
        stack.handle_frame(short);
        assert_eq!(dev.sent_count(), 0);
    }
}
