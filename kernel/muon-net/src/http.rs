//! Minimal HTTP/1.x client: GET over a single connection.

use alloc::string::String;
use alloc::vec::Vec;

use muon_core::time;

use crate::NetError;
use crate::stack::NetStack;
use crate::tcp::CONNECT_TIMEOUT_TICKS;

/// User-Agent header value.
pub const USER_AGENT: &str = "muon/0.1";

/// Receive buffer cap.
pub const RECV_LIMIT: usize = 16 * 1024;

/// Give up when no new data arrives for this many ticks.
const IDLE_TIMEOUT_TICKS: u64 = 10_000;

/// Hard cap on poll iterations while receiving.
const HTTP_POLL_CAP: usize = 200_000;

/// A fetched response, split at the first blank line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status line and headers, as received.
    pub headers: String,
    /// Everything after the first `\r\n\r\n`.
    pub body: Vec<u8>,
}

/// Splits a URL into `(host, port, path)`.
///
/// Only plain `http` is supported; the port defaults to 80 and the path to
/// `/`.
pub fn parse_url(url: &str) -> Result<(&str, u16, &str), NetError> {
    let rest = if let Some(rest) = url.strip_prefix("http://") {
        rest
    } else if url.contains("://") {
        return Err(NetError::Unsupported);
    } else {
        url
    };

    let (host_port, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };

    let (host, port) = match host_port.split_once(':') {
        Some((h, p)) => {
            let port: u16 = p.parse().map_err(|_| NetError::InvalidArgument)?;
            (h, port)
        }
        None => (host_port, 80),
    };

    if host.is_empty() {
        return Err(NetError::InvalidArgument);
    }
    Ok((host, port, path))
}

/// Builds the request text.
///
/// Postcondition (asserted): the request ends with an empty line and
/// contains no NUL bytes.
pub fn build_request(host: &str, path: &str) -> String {
    let request = alloc::format!(
        "GET {path} HTTP/1.1\r\nHost: {host}\r\nUser-Agent: {USER_AGENT}\r\nAccept: */*\r\nConnection: close\r\n\r\n"
    );
    debug_assert!(request.ends_with("\r\n\r\n"));
    debug_assert!(!request.contains('\0'));
    request
}

/// Finds the header/body separator.
fn find_blank_line(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

impl NetStack {
    /// Fetches a URL and returns the response split into headers and body.
    ///
    /// Resolution, connection, and the bounded receive loop all run inline;
    /// receiving stops when the peer closes, the buffer cap is reached, or
    /// no data arrives for a while.
    ///
    /// # Errors
    ///
    /// URL, DNS, and TCP errors; [`NetError::ProtocolError`] when the
    /// response never contains a header terminator.
    pub fn http_get(&mut self, url: &str) -> Result<HttpResponse, NetError> {
        let (host, port, path) = parse_url(url)?;
        let ip = self.dns_resolve(host)?;

        let sock = self.tcp_open()?;
        if let Err(e) = self.tcp_connect(sock, ip, port, CONNECT_TIMEOUT_TICKS) {
            let _ = self.tcp_close(sock);
            return Err(e);
        }

        let request = build_request(host, path);
        if let Err(e) = self.tcp_send(sock, request.as_bytes()) {
            let _ = self.tcp_close(sock);
            return Err(e);
        }

        let mut response: Vec<u8> = Vec::new();
        let mut last_data = time::ticks();
        for _ in 0..HTTP_POLL_CAP {
            self.poll();

            let mut chunk = [0u8; 512];
            let n = self.tcp_recv(sock, &mut chunk).unwrap_or(0);
            if n > 0 {
                let room = RECV_LIMIT - response.len();
                response.extend_from_slice(&chunk[..n.min(room)]);
                last_data = time::ticks();
                if response.len() >= RECV_LIMIT {
                    break;
                }
                continue;
            }

            if self.tcp_peer_closed(sock) {
                break;
            }
            if time::ticks().saturating_sub(last_data) >= IDLE_TIMEOUT_TICKS {
                muon_core::kwarn!("http: receive idle timeout from {host}");
                break;
            }
        }
        let _ = self.tcp_close(sock);

        let Some(idx) = find_blank_line(&response) else {
            return Err(NetError::ProtocolError);
        };
        let headers = String::from_utf8_lossy(&response[..idx]).into_owned();
        let body = response[idx + 4..].to_vec();
        Ok(HttpResponse { headers, body })
    }
}
