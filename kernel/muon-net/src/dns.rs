//! DNS client: A-record resolution with a fixed client port.

use alloc::vec::Vec;

use muon_core::time;

use crate::NetError;
use crate::stack::NetStack;
use crate::types::Ipv4Addr;

/// Server-side UDP port.
pub const DNS_SERVER_PORT: u16 = 53;
/// Our fixed client port; replies arriving here route to the client.
pub const DNS_CLIENT_PORT: u16 = 51342;

/// DNS header length.
pub const HEADER_LEN: usize = 12;

/// Query flags: recursion desired.
const FLAGS_RD: u16 = 0x0100;

/// A-record type and IN class.
const QTYPE_A: u16 = 1;
const QCLASS_IN: u16 = 1;

/// Ticks to wait per retry.
const DNS_WAIT_TICKS: u64 = 2000;
/// Number of retries before giving up.
const DNS_RETRIES: usize = 3;
/// Hard cap on poll iterations per retry.
const DNS_POLL_CAP: usize = 100_000;

/// DNS client state.
pub struct DnsClient {
    pending_id: u16,
    answer: Option<(u16, Ipv4Addr)>,
    next_id: u16,
}

impl Default for DnsClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsClient {
    /// An idle client.
    pub const fn new() -> Self {
        Self {
            pending_id: 0,
            answer: None,
            next_id: 1,
        }
    }
}

/// Builds an A query for `host` in label-length form.
pub fn build_query(id: u16, host: &str) -> Vec<u8> {
    let mut q = Vec::with_capacity(HEADER_LEN + host.len() + 6);
    q.extend_from_slice(&id.to_be_bytes());
    q.extend_from_slice(&FLAGS_RD.to_be_bytes());
    q.extend_from_slice(&1u16.to_be_bytes()); // qdcount
    q.extend_from_slice(&[0; 6]); // ancount, nscount, arcount

    for label in host.split('.').filter(|l| !l.is_empty()) {
        q.push(label.len() as u8);
        q.extend_from_slice(label.as_bytes());
    }
    q.push(0);
    q.extend_from_slice(&QTYPE_A.to_be_bytes());
    q.extend_from_slice(&QCLASS_IN.to_be_bytes());
    q
}

/// Steps over an encoded name, following nothing: a compression pointer
/// (high two bits set) ends the name in two bytes.
fn skip_name(data: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let len = *data.get(pos)?;
        if len & 0xC0 == 0xC0 {
            return Some(pos + 2);
        }
        if len == 0 {
            return Some(pos + 1);
        }
        pos += 1 + len as usize;
    }
}

/// Extracts the first A answer from a response matching `id`.
pub fn parse_response(data: &[u8], id: u16) -> Option<Ipv4Addr> {
    if data.len() < HEADER_LEN {
        return None;
    }
    if u16::from_be_bytes([data[0], data[1]]) != id {
        return None;
    }
    let qdcount = u16::from_be_bytes([data[4], data[5]]);
    let ancount = u16::from_be_bytes([data[6], data[7]]);

    // Skip the echoed question section.
    let mut pos = HEADER_LEN;
    for _ in 0..qdcount {
        pos = skip_name(data, pos)?;
        pos += 4; // qtype + qclass
    }

    for _ in 0..ancount {
        pos = skip_name(data, pos)?;
        let rtype = u16::from_be_bytes([*data.get(pos)?, *data.get(pos + 1)?]);
        let rdlength = u16::from_be_bytes([*data.get(pos + 8)?, *data.get(pos + 9)?]) as usize;
        pos += 10; // type, class, ttl, rdlength
        let rdata = data.get(pos..pos + rdlength)?;
        if rtype == QTYPE_A && rdlength == 4 {
            return Some(Ipv4Addr([rdata[0], rdata[1], rdata[2], rdata[3]]));
        }
        pos += rdlength;
    }
    None
}

impl NetStack {
    /// Resolves a host name to an IPv4 address.
    ///
    /// Dotted-quad strings short-circuit without any traffic. Otherwise the
    /// query goes to the configured DNS server with up to three retries.
    ///
    /// # Errors
    ///
    /// [`NetError::NotConfigured`] before DHCP or manual configuration,
    /// [`NetError::Timeout`] when every retry goes unanswered, plus
    /// send-path errors.
    pub fn dns_resolve(&mut self, host: &str) -> Result<Ipv4Addr, NetError> {
        if let Some(ip) = Ipv4Addr::parse(host) {
            return Ok(ip);
        }
        if !self.config.configured {
            return Err(NetError::NotConfigured);
        }

        let server = self.dns_server;
        for _ in 0..DNS_RETRIES {
            let id = self.dns.next_id;
            self.dns.next_id = self.dns.next_id.wrapping_add(1).max(1);
            self.dns.pending_id = id;
            self.dns.answer = None;

            let query = build_query(id, host);
            self.udp_send(server, DNS_CLIENT_PORT, DNS_SERVER_PORT, &query)?;

            let deadline = time::ticks() + DNS_WAIT_TICKS;
            for _ in 0..DNS_POLL_CAP {
                self.poll();
                if let Some((answer_id, ip)) = self.dns.answer {
                    if answer_id == id {
                        muon_core::kdebug!("dns: {host} -> {ip}");
                        return Ok(ip);
                    }
                }
                if time::ticks() >= deadline {
                    break;
                }
            }
        }

        muon_core::kwarn!("dns: no answer for {host}");
        Err(NetError::Timeout)
    }

    /// Handles a datagram arriving on the DNS client port.
    pub(crate) fn dns_input(&mut self, _src: Ipv4Addr, payload: &[u8]) {
        let id = self.dns.pending_id;
        if let Some(ip) = parse_response(payload, id) {
            self.dns.answer = Some((id, ip));
        }
    }
}
