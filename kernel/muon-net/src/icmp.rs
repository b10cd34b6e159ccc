//! ICMP echo: answering pings and sending our own.

use alloc::vec::Vec;

use muon_core::time;

use crate::NetError;
use crate::checksum::internet_checksum;
use crate::ipv4::PROTO_ICMP;
use crate::stack::NetStack;
use crate::types::Ipv4Addr;

/// ICMP type for an echo request.
pub const TYPE_ECHO_REQUEST: u8 = 8;
/// ICMP type for an echo reply.
pub const TYPE_ECHO_REPLY: u8 = 0;

/// Header length: type, code, checksum, identifier, sequence.
pub const HEADER_LEN: usize = 8;

/// Default payload carried by our own pings.
const PING_PAYLOAD: &[u8] = b"muon ping";

/// Hard cap on poll iterations while waiting for a reply.
const PING_POLL_CAP: usize = 100_000;

/// A received echo reply, kept for the ping caller to match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoReply {
    /// Replying host.
    pub from: Ipv4Addr,
    /// Echoed identifier.
    pub ident: u16,
    /// Echoed sequence number.
    pub seq: u16,
    /// Echoed payload.
    pub payload: Vec<u8>,
}

/// Builds an echo message with a valid checksum.
pub fn build_echo(icmp_type: u8, ident: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(HEADER_LEN + payload.len());
    msg.push(icmp_type);
    msg.push(0); // code
    msg.extend_from_slice(&[0, 0]); // checksum placeholder
    msg.extend_from_slice(&ident.to_be_bytes());
    msg.extend_from_slice(&seq.to_be_bytes());
    msg.extend_from_slice(payload);
    let csum = internet_checksum(&msg);
    msg[2..4].copy_from_slice(&csum.to_be_bytes());
    msg
}

/// Loopback helper: converts an echo request into the matching reply, as if
/// the network had answered. Returns `None` for anything else.
pub(crate) fn loopback_convert(request: &[u8]) -> Option<Vec<u8>> {
    if request.len() < HEADER_LEN || request[0] != TYPE_ECHO_REQUEST {
        return None;
    }
    let ident = u16::from_be_bytes([request[4], request[5]]);
    let seq = u16::from_be_bytes([request[6], request[7]]);
    Some(build_echo(TYPE_ECHO_REPLY, ident, seq, &request[HEADER_LEN..]))
}

impl NetStack {
    /// Handles a received ICMP message.
    ///
    /// Echo requests are answered with an identical-id/seq/payload reply;
    /// echo replies are surfaced to the pending [`ping`](Self::ping).
    pub(crate) fn handle_icmp(&mut self, src: Ipv4Addr, data: &[u8]) {
        if data.len() < HEADER_LEN {
            return;
        }
        if internet_checksum(data) != 0 {
            muon_core::ktrace!("icmp: bad checksum from {src}");
            return;
        }
        let ident = u16::from_be_bytes([data[4], data[5]]);
        let seq = u16::from_be_bytes([data[6], data[7]]);

        match data[0] {
            TYPE_ECHO_REQUEST => {
                let reply = build_echo(TYPE_ECHO_REPLY, ident, seq, &data[HEADER_LEN..]);
                let _ = self.send_ipv4(src, PROTO_ICMP, &reply);
            }
            TYPE_ECHO_REPLY => {
                self.last_echo = Some(EchoReply {
                    from: src,
                    ident,
                    seq,
                    payload: data[HEADER_LEN..].to_vec(),
                });
            }
            _ => {}
        }
    }

    /// Pings `dst` and waits for the matching reply.
    ///
    /// # Errors
    ///
    /// [`NetError::Timeout`] when no matching reply arrives within
    /// `timeout_ticks`, plus send-path errors.
    pub fn ping(
        &mut self,
        dst: Ipv4Addr,
        ident: u16,
        seq: u16,
        timeout_ticks: u64,
    ) -> Result<EchoReply, NetError> {
        self.last_echo = None;
        let request = build_echo(TYPE_ECHO_REQUEST, ident, seq, PING_PAYLOAD);
        self.send_ipv4(dst, PROTO_ICMP, &request)?;

        let deadline = time::ticks() + timeout_ticks;
        for _ in 0..PING_POLL_CAP {
            if let Some(reply) = self.last_echo.take() {
                if reply.ident == ident && reply.seq == seq {
                    return Ok(reply);
                }
                // Stale reply from an earlier ping; keep waiting.
            }
            if time::ticks() >= deadline {
                break;
            }
            self.poll();
        }
        Err(NetError::Timeout)
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

    #[test]
    fn ping_self_loops_back_without_wire_frames() {
        let (mut stack, dev) = configured_stack();
        let reply = stack.ping(stack.config.ip, 0x77, 3, 100).unwrap();
        assert_eq!(reply.ident, 0x77);
        assert_eq!(reply.seq, 3);
        assert_eq!(reply.payload, b"muon ping");
        assert_eq!(dev.sent_count(), 0, "loopback must not touch the wire");
    }

    #[test]
    fn echo_requests_get_exactly_one_matching_reply() {
        let (mut stack, dev) = configured_stack();
        let peer_ip = Ipv4Addr::new(10, 0, 2, 7);
        let peer_mac = MacAddr([9; 6]);
        stack.arp.insert(peer_ip, peer_mac);

        let echo = build_echo(TYPE_ECHO_REQUEST, 0xBEEF, 42, b"abcdef");
        let mut packet = ipv4::build_header(peer_ip, stack.config.ip, PROTO_ICMP, echo.len(), 7)
            .to_vec();
        packet.extend_from_slice(&echo);
        let frame = ethernet::build_frame(stack.config.mac, peer_mac, ETHERTYPE_IPV4, &packet);
        stack.handle_frame(&frame);

        let sent = dev.sent();
        assert_eq!(sent.len(), 1);

        // The reply goes back to the asker, with identical id/seq/payload
        // and a checksum that verifies.
        let eth = ethernet::parse(&sent[0]).unwrap();
        assert_eq!(eth.dst, peer_mac);
        let ip = ipv4::parse(eth.payload).unwrap();
        assert_eq!(ip.dst, peer_ip);
        assert_eq!(ip.protocol, PROTO_ICMP);
        let reply = ip.payload;
        assert_eq!(reply[0], TYPE_ECHO_REPLY);
        assert_eq!(internet_checksum(reply), 0);
        assert_eq!(&reply[4..6], &0xBEEFu16.to_be_bytes());
        assert_eq!(&reply[6..8], &42u16.to_be_bytes());
        assert_eq!(&reply[HEADER_LEN..], b"abcdef");
    }

    #[test]
    fn corrupted_echo_requests_are_dropped() {
        let (mut stack, dev) = configured_stack();
        let peer_ip = Ipv4Addr::new(10, 0, 2, 7);
        stack.arp.insert(peer_ip, MacAddr([9; 6]));

        let mut echo = build_echo(TYPE_ECHO_REQUEST, 1, 1, b"x");
        echo[2] ^= 0xFF; // break the checksum
        let mut packet = ipv4::build_header(peer_ip, stack.config.ip, PROTO_ICMP, echo.len(), 7)
            .to_vec();
        packet.extend_from_slice(&echo);
        let frame =
            ethernet::build_frame(stack.config.mac, MacAddr([9; 6]), ETHERTYPE_IPV4, &packet);
        stack.handle_frame(&frame);
        assert_eq!(dev.sent_count(), 0);
    }

    #[test]
    fn ping_to_silent_host_times_out() {
        let (mut stack, _dev) = configured_stack();
        let peer = Ipv4Addr::new(10, 0, 2, 30);
        stack.arp.insert(peer, MacAddr([3; 6]));
        assert_eq!(stack.ping(peer, 1, 1, 50), Err(NetError::Timeout));
    }
}
