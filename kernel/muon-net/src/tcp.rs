//! TCP: client-side connections over a fixed socket table.
//!
//! Happy-path implementation for interactive fetches: three-way handshake,
//! PSH/ACK data in both directions, and a simplified close. Re-ordering,
//! retransmission, and windowing are not implemented; the canonical state
//! set is kept so the rest of the machine reads like the RFC 793 diagram.
//! `TIME_WAIT` is never entered — a closing socket goes straight back to
//! `Closed` and its slot is freed.

use alloc::vec::Vec;

use bitflags::bitflags;
use muon_core::time;

use crate::NetError;
use crate::checksum::pseudo_checksum;
use crate::ipv4::PROTO_TCP;
use crate::stack::NetStack;
use crate::types::Ipv4Addr;

/// Size of the socket table.
pub const MAX_SOCKETS: usize = 16;

/// TCP header length without options.
pub const HEADER_LEN: usize = 20;

/// Advertised receive window.
pub const WINDOW: u16 = 8192;

/// Per-socket receive buffer cap.
pub const RX_BUFFER_LIMIT: usize = 16 * 1024;

/// Default ticks to wait in `connect`.
pub const CONNECT_TIMEOUT_TICKS: u64 = 5000;

/// Ticks to wait for the close exchange.
const CLOSE_TIMEOUT_TICKS: u64 = 2000;

/// Hard cap on poll iterations inside the spin loops.
const TCP_POLL_CAP: usize = 100_000;

bitflags! {
    /// TCP header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TcpFlags: u8 {
        /// No more data from sender.
        const FIN = 0x01;
        /// Synchronize sequence numbers.
        const SYN = 0x02;
        /// Reset the connection.
        const RST = 0x04;
        /// Push buffered data to the application.
        const PSH = 0x08;
        /// Acknowledgment field is significant.
        const ACK = 0x10;
        /// Urgent pointer is significant.
        const URG = 0x20;
    }
}

/// Canonical TCP connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    /// No connection.
    Closed,
    /// Passive open (unused by this client-side stack).
    Listen,
    /// SYN sent, waiting for SYN|ACK.
    SynSent,
    /// SYN received (unused by this client-side stack).
    SynRcvd,
    /// Data may flow.
    Established,
    /// We sent FIN, waiting for its ACK.
    FinWait1,
    /// Our FIN is acknowledged, waiting for the peer's FIN.
    FinWait2,
    /// Peer sent FIN first (collapsed; see module docs).
    CloseWait,
    /// Simultaneous close (unused).
    Closing,
    /// Waiting for the final ACK of our FIN.
    LastAck,
    /// Quarantine after close (never entered; kept for the canonical set).
    TimeWait,
}

/// Handle into the socket table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketHandle(pub(crate) usize);

/// One connection's state.
pub(crate) struct TcpSocket {
    local_port: u16,
    remote_ip: Ipv4Addr,
    remote_port: u16,
    /// Next sequence number we will send.
    seq: u32,
    /// Next sequence number we expect from the peer.
    ack: u32,
    state: TcpState,
    rx_buf: Vec<u8>,
    peer_closed: bool,
}

/// Fixed table of sockets.
pub struct SocketTable {
    slots: [Option<TcpSocket>; MAX_SOCKETS],
}

impl Default for SocketTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketTable {
    /// An empty table.
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; MAX_SOCKETS],
        }
    }

    fn get(&self, h: SocketHandle) -> Option<&TcpSocket> {
        self.slots.get(h.0).and_then(Option::as_ref)
    }

    fn get_mut(&mut self, h: SocketHandle) -> Option<&mut TcpSocket> {
        self.slots.get_mut(h.0).and_then(Option::as_mut)
    }
}

/// A parsed TCP segment borrowing its payload.
#[derive(Debug)]
pub struct Segment<'a> {
    /// Source port.
    pub src_port: u16,
    /// Destination port.
    pub dst_port: u16,
    /// Sequence number.
    pub seq: u32,
    /// Acknowledgment number.
    pub ack: u32,
    /// Header flags.
    pub flags: TcpFlags,
    /// Segment payload.
    pub payload: &'a [u8],
}

/// Serialises a segment with the pseudo-header checksum filled in.
pub fn build_segment(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    payload: &[u8],
) -> Vec<u8> {
    let mut seg = Vec::with_capacity(HEADER_LEN + payload.len());
    seg.extend_from_slice(&src_port.to_be_bytes());
    seg.extend_from_slice(&dst_port.to_be_bytes());
    seg.extend_from_slice(&seq.to_be_bytes());
    seg.extend_from_slice(&ack.to_be_bytes());
    seg.push((HEADER_LEN as u8 / 4) << 4); // data offset, no options
    seg.push(flags.bits());
    seg.extend_from_slice(&WINDOW.to_be_bytes());
    seg.extend_from_slice(&[0, 0]); // checksum placeholder
    seg.extend_from_slice(&[0, 0]); // urgent pointer
    seg.extend_from_slice(payload);
    let csum = pseudo_checksum(src_ip, dst_ip, PROTO_TCP, &seg);
    seg[16..18].copy_from_slice(&csum.to_be_bytes());
    seg
}

/// Parses a segment, honouring the data offset.
pub fn parse_segment(data: &[u8]) -> Option<Segment<'_>> {
    if data.len() < HEADER_LEN {
        return None;
    }
    let offset = ((data[12] >> 4) as usize) * 4;
    if offset < HEADER_LEN || offset > data.len() {
        return None;
    }
    Some(Segment {
        src_port: u16::from_be_bytes([data[0], data[1]]),
        dst_port: u16::from_be_bytes([data[2], data[3]]),
        seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        flags: TcpFlags::from_bits_truncate(data[13]),
        payload: &data[offset..],
    })
}

/// A reply the receive path decided to send once the socket borrow ends.
struct PendingReply {
    remote_ip: Ipv4Addr,
    local_port: u16,
    remote_port: u16,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
}

impl NetStack {
    /// Allocates a socket in the `Closed` state.
    ///
    /// # Errors
    ///
    /// [`NetError::TableFull`] when all sockets are in use.
    pub fn tcp_open(&mut self) -> Result<SocketHandle, NetError> {
        let idx = self
            .sockets
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(NetError::TableFull)?;
        self.sockets.slots[idx] = Some(TcpSocket {
            local_port: 0,
            remote_ip: Ipv4Addr::ZERO,
            remote_port: 0,
            seq: 0,
            ack: 0,
            state: TcpState::Closed,
            rx_buf: Vec::new(),
            peer_closed: false,
        });
        Ok(SocketHandle(idx))
    }

    /// Connects to `(ip, port)`: sends SYN, waits for SYN|ACK, answers with
    /// the final ACK.
    ///
    /// # Errors
    ///
    /// [`NetError::InvalidArgument`] for a bad handle or non-`Closed`
    /// socket, [`NetError::Timeout`] when the handshake never completes
    /// (the socket returns to `Closed`), plus send-path errors.
    pub fn tcp_connect(
        &mut self,
        h: SocketHandle,
        ip: Ipv4Addr,
        port: u16,
        timeout_ticks: u64,
    ) -> Result<(), NetError> {
        let local_port = self.ephemeral_port();
        self.isn = self.isn.wrapping_add(0x0001_0000);
        let isn = self.isn;

        let sock = self
            .sockets
            .get_mut(h)
            .ok_or(NetError::InvalidArgument)?;
        if sock.state != TcpState::Closed {
            return Err(NetError::InvalidArgument);
        }
        sock.local_port = local_port;
        sock.remote_ip = ip;
        sock.remote_port = port;
        sock.seq = isn.wrapping_add(1); // SYN consumes one sequence number
        sock.state = TcpState::SynSent;

        let syn = build_segment(
            self.config.ip,
            ip,
            local_port,
            port,
            isn,
            0,
            TcpFlags::SYN,
            &[],
        );
        self.send_ipv4(ip, PROTO_TCP, &syn)?;

        let deadline = time::ticks() + timeout_ticks;
        for _ in 0..TCP_POLL_CAP {
            self.poll();
            match self.sockets.get(h).map(|s| s.state) {
                Some(TcpState::Established) => return Ok(()),
                Some(TcpState::Closed) => break, // peer reset
                _ => {}
            }
            if time::ticks() >= deadline {
                break;
            }
        }

        if let Some(sock) = self.sockets.get_mut(h) {
            sock.state = TcpState::Closed;
        }
        Err(NetError::Timeout)
    }

    /// Sends data on an established connection.
    ///
    /// # Errors
    ///
    /// [`NetError::NotConnected`] unless the socket is `Established`, plus
    /// send-path errors.
    pub fn tcp_send(&mut self, h: SocketHandle, data: &[u8]) -> Result<(), NetError> {
        let sock = self.sockets.get(h).ok_or(NetError::InvalidArgument)?;
        if sock.state != TcpState::Established {
            return Err(NetError::NotConnected);
        }
        let (remote_ip, local_port, remote_port, seq, ack) = (
            sock.remote_ip,
            sock.local_port,
            sock.remote_port,
            sock.seq,
            sock.ack,
        );

        let segment = build_segment(
            self.config.ip,
            remote_ip,
            local_port,
            remote_port,
            seq,
            ack,
            TcpFlags::PSH | TcpFlags::ACK,
            data,
        );
        self.send_ipv4(remote_ip, PROTO_TCP, &segment)?;

        if let Some(sock) = self.sockets.get_mut(h) {
            sock.seq = sock.seq.wrapping_add(data.len() as u32);
        }
        Ok(())
    }

    /// Drains received bytes into `buf`; returns the count (0 when the
    /// buffer is empty).
    ///
    /// # Errors
    ///
    /// [`NetError::InvalidArgument`] for a bad handle.
    pub fn tcp_recv(&mut self, h: SocketHandle, buf: &mut [u8]) -> Result<usize, NetError> {
        let sock = self.sockets.get_mut(h).ok_or(NetError::InvalidArgument)?;
        let n = buf.len().min(sock.rx_buf.len());
        buf[..n].copy_from_slice(&sock.rx_buf[..n]);
        sock.rx_buf.drain(..n);
        Ok(n)
    }

    /// Current state of a socket.
    pub fn tcp_state(&self, h: SocketHandle) -> Option<TcpState> {
        self.sockets.get(h).map(|s| s.state)
    }

    /// Whether the peer has sent FIN.
    pub fn tcp_peer_closed(&self, h: SocketHandle) -> bool {
        self.sockets.get(h).is_some_and(|s| s.peer_closed)
    }

    /// Closes a connection and frees the slot.
    ///
    /// From `Established` this sends FIN|ACK and polls for the peer to
    /// finish the exchange; from `LastAck` (the peer closed first) it sends
    /// our FIN and waits for the final ACK. The slot is freed even when the
    /// exchange times out.
    ///
    /// # Errors
    ///
    /// [`NetError::InvalidArgument`] for a bad handle.
    pub fn tcp_close(&mut self, h: SocketHandle) -> Result<(), NetError> {
        let sock = self.sockets.get(h).ok_or(NetError::InvalidArgument)?;
        let fin_needed = matches!(sock.state, TcpState::Established | TcpState::LastAck);

        if fin_needed {
            let (remote_ip, local_port, remote_port, seq, ack) = (
                sock.remote_ip,
                sock.local_port,
                sock.remote_port,
                sock.seq,
                sock.ack,
            );
            let fin = build_segment(
                self.config.ip,
                remote_ip,
                local_port,
                remote_port,
                seq,
                ack,
                TcpFlags::FIN | TcpFlags::ACK,
                &[],
            );
            let _ = self.send_ipv4(remote_ip, PROTO_TCP, &fin);

            if let Some(sock) = self.sockets.get_mut(h) {
                sock.seq = sock.seq.wrapping_add(1); // FIN consumes one
                sock.state = if sock.state == TcpState::Established {
                    TcpState::FinWait1
                } else {
                    TcpState::LastAck
                };
            }

            let deadline = time::ticks() + CLOSE_TIMEOUT_TICKS;
            for _ in 0..TCP_POLL_CAP {
                self.poll();
                if self.sockets.get(h).map(|s| s.state) == Some(TcpState::Closed) {
                    break;
                }
                if time::ticks() >= deadline {
                    break;
                }
            }
        }

        self.sockets.slots[h.0] = None;
        Ok(())
    }

    /// Matches a received segment to a socket and advances its state.
    pub(crate) fn handle_tcp(&mut self, src_ip: Ipv4Addr, data: &[u8]) {
        let Some(seg) = parse_segment(data) else { return };

        let Some(idx) = self.sockets.slots.iter().position(|s| {
            s.as_ref().is_some_and(|s| {
                s.local_port == seg.dst_port
                    && s.remote_ip == src_ip
                    && s.remote_port == seg.src_port
            })
        }) else {
            return;
        };

        let reply = {
            let Some(sock) = self.sockets.slots[idx].as_mut() else {
                return;
            };
            advance_state(sock, &seg)
        };

        if let Some(r) = reply {
            let segment = build_segment(
                self.config.ip,
                r.remote_ip,
                r.local_port,
                r.remote_port,
                r.seq,
                r.ack,
                r.flags,
                &[],
            );
            let _ = self.send_ipv4(r.remote_ip, PROTO_TCP, &segment);
        }
    }
}

/// The receive-path state machine. Mutates the socket and returns the
/// control segment to send back, if any.
fn advance_state(sock: &mut TcpSocket, seg: &Segment<'_>) -> Option<PendingReply> {
    let reply = |sock: &TcpSocket, flags: TcpFlags| PendingReply {
        remote_ip: sock.remote_ip,
        local_port: sock.local_port,
        remote_port: sock.remote_port,
        seq: sock.seq,
        ack: sock.ack,
        flags,
    };

    if seg.flags.contains(TcpFlags::RST) {
        sock.state = TcpState::Closed;
        sock.peer_closed = true;
        return None;
    }

    match sock.state {
        TcpState::SynSent => {
            if seg.flags.contains(TcpFlags::SYN | TcpFlags::ACK) {
                sock.ack = seg.seq.wrapping_add(1);
                sock.state = TcpState::Established;
                return Some(reply(sock, TcpFlags::ACK));
            }
            None
        }
        TcpState::Established => {
            let mut want_ack = false;
            if !seg.payload.is_empty() {
                let room = RX_BUFFER_LIMIT - sock.rx_buf.len().min(RX_BUFFER_LIMIT);
                let take = seg.payload.len().min(room);
                sock.rx_buf.extend_from_slice(&seg.payload[..take]);
                sock.ack = seg.seq.wrapping_add(seg.payload.len() as u32);
                want_ack = true;
            }
            if seg.flags.contains(TcpFlags::FIN) {
                sock.ack = sock.ack.wrapping_add(1);
                sock.peer_closed = true;
                sock.state = TcpState::LastAck;
                return Some(reply(sock, TcpFlags::ACK));
            }
            want_ack.then(|| reply(sock, TcpFlags::ACK))
        }
        TcpState::FinWait1 => {
            if seg.flags.contains(TcpFlags::FIN) {
                sock.ack = sock.ack.wrapping_add(1);
                sock.state = TcpState::Closed;
                sock.peer_closed = true;
                return Some(reply(sock, TcpFlags::ACK));
            }
            if seg.flags.contains(TcpFlags::ACK) {
                sock.state = TcpState::FinWait2;
            }
            None
        }
        TcpState::FinWait2 => {
            if !seg.payload.is_empty() {
                // Late data while closing: accept and ack so the peer can
                // finish sending before its FIN.
                let room = RX_BUFFER_LIMIT - sock.rx_buf.len().min(RX_BUFFER_LIMIT);
                let take = seg.payload.len().min(room);
                sock.rx_buf.extend_from_slice(&seg.payload[..take]);
                sock.ack = seg.seq.wrapping_add(seg.payload.len() as u32);
            }
            if seg.flags.contains(TcpFlags::FIN) {
                sock.ack = sock.ack.wrapping_add(1);
                sock.state = TcpState::Closed;
                sock.peer_closed = true;
                return Some(reply(sock, TcpFlags::ACK));
            }
            None
        }
        TcpState::LastAck => {
            if seg.flags.contains(TcpFlags::ACK) {
                sock.state = TcpState::Closed;
            }
            None
        }
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod testpeer {
    //! A scripted TCP server driven from the test device's responder hook.

    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use std::sync::Mutex;

    use super::{Segment, TcpFlags, build_segment, parse_segment};
    use crate::device::test::Responder;
    use crate::ethernet::{self, ETHERTYPE_IPV4};
    use crate::ipv4::{self, PROTO_TCP};

    /// What the peer has observed so far.
    #[derive(Default)]
    pub struct PeerLog {
        /// Reassembled application bytes received from the client.
        pub received: Vec<u8>,
        /// Whether the client's FIN arrived.
        pub got_fin: bool,
    }

    /// Configuration for the scripted server.
    pub struct TcpPeer {
        /// Bytes to send back after the first data from the client.
        pub canned_response: Option<Vec<u8>>,
        /// Send FIN right after the canned response (Connection: close).
        pub close_after_response: bool,
        /// Observations, shared with the test.
        pub log: Arc<Mutex<PeerLog>>,
    }

    impl TcpPeer {
        /// A peer that answers the handshake and acks data.
        pub fn new() -> Self {
            Self {
                canned_response: None,
                close_after_response: false,
                log: Arc::new(Mutex::new(PeerLog::default())),
            }
        }

        /// Builds the responder closure for
        /// [`TestDevice::set_responder`](crate::device::test::TestDevice::set_responder).
        pub fn into_responder(self) -> Responder {
            let log = self.log;
            let canned = self.canned_response;
            let close_after = self.close_after_response;
            let mut server_seq: u32 = 1000;
            let mut responded = false;

            Box::new(move |frame: &[u8]| {
                let Some(eth) = ethernet::parse(frame) else {
                    return Vec::new();
                };
                if eth.ethertype != ETHERTYPE_IPV4 {
                    return Vec::new();
                }
                let Some(ip) = ipv4::parse(eth.payload) else {
                    return Vec::new();
                };
                if ip.protocol != PROTO_TCP {
                    return Vec::new();
                }
                let Some(seg) = parse_segment(ip.payload) else {
                    return Vec::new();
                };
                let Segment {
                    src_port,
                    dst_port,
                    seq,
                    ack: _,
                    flags,
                    payload,
                } = seg;

                let send = |seq_out: u32, ack_out: u32, flags_out: TcpFlags, data: &[u8]| {
                    let tcp = build_segment(
                        ip.dst, ip.src, dst_port, src_port, seq_out, ack_out, flags_out, data,
                    );
                    let mut packet =
                        ipv4::build_header(ip.dst, ip.src, PROTO_TCP, tcp.len(), 99).to_vec();
                    packet.extend_from_slice(&tcp);
                    ethernet::build_frame(eth.src, eth.dst, ETHERTYPE_IPV4, &packet)
                };

                let mut replies = Vec::new();

                if flags.contains(TcpFlags::SYN) {
                    replies.push(send(
                        server_seq,
                        seq.wrapping_add(1),
                        TcpFlags::SYN | TcpFlags::ACK,
                        &[],
                    ));
                    server_seq = server_seq.wrapping_add(1);
                } else if flags.contains(TcpFlags::FIN) {
                    log.lock().unwrap().got_fin = true;
                    let ack = seq.wrapping_add(payload.len() as u32).wrapping_add(1);
                    replies.push(send(server_seq, ack, TcpFlags::ACK, &[]));
                    // Follow with our own FIN so the client can finish.
                    replies.push(send(server_seq, ack, TcpFlags::FIN | TcpFlags::ACK, &[]));
                    server_seq = server_seq.wrapping_add(1);
                } else if !payload.is_empty() {
                    log.lock().unwrap().received.extend_from_slice(payload);
                    let ack = seq.wrapping_add(payload.len() as u32);
                    replies.push(send(server_seq, ack, TcpFlags::ACK, &[]));
                    if !responded {
                        if let Some(body) = &canned {
                            replies.push(send(
                                server_seq,
                                ack,
                                TcpFlags::PSH | TcpFlags::ACK,
                                body,
                            ));
                            server_seq = server_seq.wrapping_add(body.len() as u32);
                            if close_after {
                                replies.push(send(
                                    server_seq,
                                    ack,
                                    TcpFlags::FIN | TcpFlags::ACK,
                                    &[],
                                ));
                                server_seq = server_seq.wrapping_add(1);
                            }
                            responded = true;
                        }
                    }
                }
                replies
            })
        }
    }
}
