//! DHCP client: Discover → Offer → Request → Ack, then apply the lease.

use alloc::vec::Vec;

use muon_core::time;

use crate::NetError;
use crate::stack::NetStack;
use crate::types::{Ipv4Addr, MacAddr};

/// Server-side UDP port.
pub const DHCP_SERVER_PORT: u16 = 67;
/// Client-side UDP port.
pub const DHCP_CLIENT_PORT: u16 = 68;

/// BOOTP fixed header length, before the cookie.
const BOOTP_LEN: usize = 236;
/// DHCP magic cookie.
const MAGIC_COOKIE: u32 = 0x6382_5363;

/// Option: subnet mask.
const OPT_SUBNET_MASK: u8 = 1;
/// Option: router.
const OPT_ROUTER: u8 = 3;
/// Option: DNS servers.
const OPT_DNS: u8 = 6;
/// Option: requested IP address.
const OPT_REQUESTED_IP: u8 = 50;
/// Option: message type.
const OPT_MSG_TYPE: u8 = 53;
/// Option: server identifier.
const OPT_SERVER_ID: u8 = 54;
/// Option: parameter request list.
const OPT_PARAM_LIST: u8 = 55;
/// Option list terminator.
const OPT_END: u8 = 0xFF;

/// Message type: DHCPDISCOVER.
pub const MSG_DISCOVER: u8 = 1;
/// Message type: DHCPOFFER.
pub const MSG_OFFER: u8 = 2;
/// Message type: DHCPREQUEST.
pub const MSG_REQUEST: u8 = 3;
/// Message type: DHCPACK.
pub const MSG_ACK: u8 = 5;

/// Hard cap on poll iterations per wait phase.
const DHCP_POLL_CAP: usize = 100_000;

/// Client state machine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpState {
    /// Nothing in flight.
    Idle,
    /// DHCPDISCOVER broadcast, waiting for an offer.
    DiscoverSent,
    /// Offer recorded, ready to request.
    OfferReceived,
    /// DHCPREQUEST sent, waiting for the ack.
    RequestSent,
    /// Lease applied to the interface.
    Bound,
}

/// DHCP client state.
pub struct DhcpClient {
    pub(crate) state: DhcpState,
    xid: u32,
    offered_ip: Ipv4Addr,
    subnet_mask: Ipv4Addr,
    router: Ipv4Addr,
    dns: Option<Ipv4Addr>,
    server_id: Ipv4Addr,
}

impl Default for DhcpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DhcpClient {
    /// An idle client.
    pub const fn new() -> Self {
        Self {
            state: DhcpState::Idle,
            xid: 0,
            offered_ip: Ipv4Addr::ZERO,
            subnet_mask: Ipv4Addr::ZERO,
            router: Ipv4Addr::ZERO,
            dns: None,
            server_id: Ipv4Addr::ZERO,
        }
    }
}

/// Builds the BOOTP header common to both client messages.
fn bootp_header(xid: u32, mac: MacAddr) -> Vec<u8> {
    let mut p = Vec::with_capacity(BOOTP_LEN + 64);
    p.push(1); // op: BOOTREQUEST
    p.push(1); // htype: Ethernet
    p.push(6); // hlen
    p.push(0); // hops
    p.extend_from_slice(&xid.to_be_bytes());
    p.extend_from_slice(&[0, 0]); // secs
    p.extend_from_slice(&0x8000u16.to_be_bytes()); // flags: broadcast reply
    p.extend_from_slice(&[0; 16]); // ciaddr, yiaddr, siaddr, giaddr
    p.extend_from_slice(mac.as_bytes());
    p.extend_from_slice(&[0; 10]); // chaddr padding
    p.extend_from_slice(&[0; 64]); // sname
    p.extend_from_slice(&[0; 128]); // file
    debug_assert_eq!(p.len(), BOOTP_LEN);
    p.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    p
}

/// Builds a DHCPDISCOVER.
pub fn build_discover(xid: u32, mac: MacAddr) -> Vec<u8> {
    let mut p = bootp_header(xid, mac);
    p.extend_from_slice(&[OPT_MSG_TYPE, 1, MSG_DISCOVER]);
    p.extend_from_slice(&[OPT_PARAM_LIST, 3, OPT_SUBNET_MASK, OPT_ROUTER, OPT_DNS]);
    p.push(OPT_END);
    p
}

/// Builds a DHCPREQUEST for the offered address.
pub fn build_request(xid: u32, mac: MacAddr, requested: Ipv4Addr, server: Ipv4Addr) -> Vec<u8> {
    let mut p = bootp_header(xid, mac);
    p.extend_from_slice(&[OPT_MSG_TYPE, 1, MSG_REQUEST]);
    let mut opt = |code: u8, ip: Ipv4Addr| {
        p.extend_from_slice(&[code, 4]);
        p.extend_from_slice(ip.as_bytes());
    };
    opt(OPT_REQUESTED_IP, requested);
    opt(OPT_SERVER_ID, server);
    p.push(OPT_END);
    p
}

/// A parsed server reply.
struct Reply {
    msg_type: u8,
    your_ip: Ipv4Addr,
    subnet_mask: Option<Ipv4Addr>,
    router: Option<Ipv4Addr>,
    dns: Option<Ipv4Addr>,
    server_id: Option<Ipv4Addr>,
}

/// Parses a BOOTREPLY with our transaction id. Returns `None` for anything
/// else.
fn parse_reply(data: &[u8], xid: u32) -> Option<Reply> {
    if data.len() < BOOTP_LEN + 5 || data[0] != 2 {
        return None;
    }
    if u32::from_be_bytes([data[4], data[5], data[6], data[7]]) != xid {
        return None;
    }
    if u32::from_be_bytes([
        data[BOOTP_LEN],
        data[BOOTP_LEN + 1],
        data[BOOTP_LEN + 2],
        data[BOOTP_LEN + 3],
    ]) != MAGIC_COOKIE
    {
        return None;
    }

    let mut reply = Reply {
        msg_type: 0,
        your_ip: Ipv4Addr([data[16], data[17], data[18], data[19]]),
        subnet_mask: None,
        router: None,
        dns: None,
        server_id: None,
    };

    let mut i = BOOTP_LEN + 4;
    while i < data.len() {
        let code = data[i];
        if code == 0 {
            i += 1;
            continue;
        }
        if code == OPT_END {
            break;
        }
        if i + 1 >= data.len() {
            break;
        }
        let len = data[i + 1] as usize;
        let value = data.get(i + 2..i + 2 + len)?;
        let as_ip = || {
            (len >= 4).then(|| Ipv4Addr([value[0], value[1], value[2], value[3]]))
        };
        match code {
            OPT_MSG_TYPE if len == 1 => reply.msg_type = value[0],
            OPT_SUBNET_MASK => reply.subnet_mask = as_ip(),
            OPT_ROUTER => reply.router = as_ip(),
            OPT_DNS => reply.dns = as_ip(),
            OPT_SERVER_ID => reply.server_id = as_ip(),
            _ => {}
        }
        i += 2 + len;
    }

    (reply.msg_type != 0).then_some(reply)
}

impl NetStack {
    /// Runs the full DHCP exchange and applies the resulting lease.
    ///
    /// # Errors
    ///
    /// [`NetError::Timeout`] when the server never offers or never acks,
    /// plus send-path errors.
    pub fn dhcp_configure(&mut self, timeout_ticks: u64) -> Result<(), NetError> {
        let xid = (time::ticks() as u32) | 1;
        self.dhcp = DhcpClient::new();
        self.dhcp.xid = xid;
        self.dhcp.state = DhcpState::DiscoverSent;

        let discover = build_discover(xid, self.config.mac);
        self.udp_send(
            Ipv4Addr::BROADCAST,
            DHCP_CLIENT_PORT,
            DHCP_SERVER_PORT,
            &discover,
        )?;
        muon_core::kinfo!("dhcp: discover sent (xid {xid:#010x})");

        let deadline = time::ticks() + timeout_ticks;
        self.dhcp_wait(deadline, DhcpState::OfferReceived)?;

        let request = build_request(
            xid,
            self.config.mac,
            self.dhcp.offered_ip,
            self.dhcp.server_id,
        );
        self.udp_send(
            Ipv4Addr::BROADCAST,
            DHCP_CLIENT_PORT,
            DHCP_SERVER_PORT,
            &request,
        )?;
        self.dhcp.state = DhcpState::RequestSent;

        self.dhcp_wait(deadline, DhcpState::Bound)?;
        muon_core::kinfo!("dhcp: bound to {}", self.config.ip);
        Ok(())
    }

    /// Polls until the client reaches `target` or the deadline passes.
    fn dhcp_wait(&mut self, deadline: u64, target: DhcpState) -> Result<(), NetError> {
        for _ in 0..DHCP_POLL_CAP {
            self.poll();
            if self.dhcp.state == target {
                return Ok(());
            }
            if time::ticks() >= deadline {
                break;
            }
        }
        Err(NetError::Timeout)
    }

    /// Handles a datagram arriving on the DHCP client port.
    pub(crate) fn dhcp_input(&mut self, payload: &[u8]) {
        let Some(reply) = parse_reply(payload, self.dhcp.xid) else {
            return;
        };

        match (self.dhcp.state, reply.msg_type) {
            (DhcpState::DiscoverSent, MSG_OFFER) => {
                self.dhcp.offered_ip = reply.your_ip;
                self.dhcp.subnet_mask = reply.subnet_mask.unwrap_or(Ipv4Addr::new(255, 255, 255, 0));
                self.dhcp.router = reply.router.unwrap_or(Ipv4Addr::ZERO);
                self.dhcp.dns = reply.dns;
                self.dhcp.server_id = reply.server_id.unwrap_or(Ipv4Addr::ZERO);
                self.dhcp.state = DhcpState::OfferReceived;
            }
            (DhcpState::RequestSent, MSG_ACK) => {
                let (ip, mask, router) = (
                    self.dhcp.offered_ip,
                    self.dhcp.subnet_mask,
                    self.dhcp.router,
                );
                self.set_config(ip, mask, router);
                if let Some(dns) = self.dhcp.dns {
                    self.set_dns_server(dns);
                }
                self.dhcp.state = DhcpState::Bound;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test::TestDevice;
    use crate::device::NetDevice;
    use crate::ethernet::{self, ETHERTYPE_IPV4};
    use crate::ipv4::{self, PROTO_UDP};
    use crate::udp;
    use alloc::boxed::Box;
    use alloc::sync::Arc;

    const OFFERED: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 15);
    const MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);
    const ROUTER: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 2);
    const DNS: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 3);
    const SERVER_ID: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 2);

    /// Builds the server's offer/ack frame in reply to a client message.
    fn server_reply(msg_type: u8, xid: u32, client_mac: crate::types::MacAddr) -> Vec<u8> {
        let mut p = Vec::new();
        p.push(2); // BOOTREPLY
        p.push(1);
        p.push(6);
        p.push(0);
        p.extend_from_slice(&xid.to_be_bytes());
        p.extend_from_slice(&[0; 4]); // secs, flags
        p.extend_from_slice(&[0; 4]); // ciaddr
        p.extend_from_slice(OFFERED.as_bytes()); // yiaddr
        p.extend_from_slice(&[0; 8]); // siaddr, giaddr
        p.extend_from_slice(client_mac.as_bytes());
        p.extend_from_slice(&[0; 10]);
        p.extend_from_slice(&[0; 192]); // sname + file
        p.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        p.extend_from_slice(&[OPT_MSG_TYPE, 1, msg_type]);
        p.extend_from_slice(&[OPT_SUBNET_MASK, 4]);
        p.extend_from_slice(MASK.as_bytes());
        p.extend_from_slice(&[OPT_ROUTER, 4]);
        p.extend_from_slice(ROUTER.as_bytes());
        p.extend_from_slice(&[OPT_DNS, 4]);
        p.extend_from_slice(DNS.as_bytes());
        p.extend_from_slice(&[OPT_SERVER_ID, 4]);
        p.extend_from_slice(SERVER_ID.as_bytes());
        p.push(OPT_END);

        let mut datagram = udp::build_header(DHCP_SERVER_PORT, DHCP_CLIENT_PORT, p.len()).to_vec();
        datagram.extend_from_slice(&p);
        let mut packet = ipv4::build_header(
            SERVER_ID,
            Ipv4Addr::BROADCAST,
            PROTO_UDP,
            datagram.len(),
            3,
        )
        .to_vec();
        packet.extend_from_slice(&datagram);
        ethernet::build_frame(
            crate::types::MacAddr::BROADCAST,
            crate::types::MacAddr([0xDC; 6]),
            ETHERTYPE_IPV4,
            &packet,
        )
    }

    /// Parses the DHCP message type out of a transmitted client frame.
    fn sent_msg_type(frame: &[u8]) -> Option<(u8, u32)> {
        let ip = ipv4::parse(ethernet::parse(frame)?.payload)?;
        if ip.protocol != PROTO_UDP {
            return None;
        }
        let payload = &ip.payload[udp::HEADER_LEN..];
        let xid = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
        let mut i = BOOTP_LEN + 4;
        while i + 2 < payload.len() {
            if payload[i] == OPT_MSG_TYPE {
                return Some((payload[i + 2], xid));
            }
            if payload[i] == OPT_END {
                break;
            }
            i += 2 + payload[i + 1] as usize;
        }
        None
    }

    #[test]
    fn full_exchange_configures_the_interface() {
        let dev = Arc::new(TestDevice::new());
        let mac = dev.mac();
        dev.set_responder(Box::new(move |frame| {
            match sent_msg_type(frame) {
                Some((MSG_DISCOVER, xid)) => alloc::vec![server_reply(MSG_OFFER, xid, mac)],
                Some((MSG_REQUEST, xid)) => alloc::vec![server_reply(MSG_ACK, xid, mac)],
                _ => Vec::new(),
            }
        }));

        let mut stack = NetStack::new(dev.clone());
        assert!(!stack.config().configured);
        stack.dhcp_configure(1000).unwrap();

        let cfg = stack.config();
        assert!(cfg.configured);
        assert_eq!(cfg.ip, OFFERED);
        assert_eq!(cfg.netmask, MASK);
        assert_eq!(cfg.gateway, ROUTER);
        assert_eq!(stack.dns_server(), DNS);
        assert_eq!(stack.dhcp.state, DhcpState::Bound);

        // Exactly two client messages: discover, then request.
        let sent = dev.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent_msg_type(&sent[0]).unwrap().0, MSG_DISCOVER);
        assert_eq!(sent_msg_type(&sent[1]).unwrap().0, MSG_REQUEST);
    }

    #[test]
    fn silent_network_times_out() {
        let dev = Arc::new(TestDevice::new());
        let mut stack = NetStack::new(dev);
        assert_eq!(stack.dhcp_configure(50), Err(NetError::Timeout));
        assert!(!stack.config().configured);
    }

    #[test]
    fn replies_with_the_wrong_xid_are_ignored() {
        let dev = Arc::new(TestDevice::new());
        let mac = dev.mac();
        dev.set_responder(Box::new(move |frame| {
            match sent_msg_type(frame) {
                Some((MSG_DISCOVER, xid)) => {
                    alloc::vec![server_reply(MSG_OFFER, xid ^ 0xFFFF, mac)]
                }
                _ => Vec::new(),
            }
        }));

        let mut stack = NetStack::new(dev);
        assert_eq!(stack.dhcp_configure(50), Err(NetError::Timeout));
    }

    #[test]
    fn discover_and_request_are_wire_correct() {
        let mac = crate::types::MacAddr([2, 4, 6, 8, 10, 12]);
        let discover = build_discover(0x1234, mac);
        assert_eq!(discover[0], 1, "BOOTREQUEST");
        assert_eq!(&discover[28..34], mac.as_bytes());
        assert_eq!(
            u32::from_be_bytes([
                discover[BOOTP_LEN],
                discover[BOOTP_LEN + 1],
                discover[BOOTP_LEN + 2],
                discover[BOOTP_LEN + 3]
            ]),
            MAGIC_COOKIE
        );

        let request = build_request(0x1234, mac, OFFERED, SERVER_ID);
        let reply = parse_reply(&request, 0x1234);
        assert!(reply.is_none(), "a request is not a reply");
    }
}
