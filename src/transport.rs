use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::debug;

use crate::dns_message::{same_name, DNSMessage};

const MAX_UDP_RESPONSE_SIZE: usize = 4096;

/// Longest wait for one exchange; longer timeouts are cut down to this.
const MAX_TIMEOUT: Duration = Duration::from_secs(86_400);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cannot locate DNS server {server}: {source}")]
    Lookup { server: String, source: io::Error },
    #[error("no address found for DNS server {0}")]
    NoAddress(String),
    #[error("no response from {0} within {1:?}")]
    Timeout(SocketAddr, Duration),
    #[error("exchange with {addr} failed: {source}")]
    Io { addr: SocketAddr, source: io::Error },
}

/// Sends one encoded request to a DNS server and returns the raw reply.
pub trait Exchange {
    fn exchange(
        &self,
        server: &str,
        port: u16,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Bytes, TransportError>;
}

/// Plain DNS over UDP, repeated over TCP when the UDP answer comes back
/// truncated.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetTransport;

impl Exchange for NetTransport {
    fn exchange(
        &self,
        server: &str,
        port: u16,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Bytes, TransportError> {
        let addr = locate(server, port)?;
        let timeout = timeout.min(MAX_TIMEOUT);
        let deadline = Instant::now() + timeout;

        let response = udp_exchange(addr, request, deadline, timeout)?;
        if !is_truncated(&response) {
            return Ok(response);
        }

        debug!(%addr, "UDP answer truncated, retrying over TCP");
        tcp_exchange(addr, request, deadline, timeout)
    }
}

/// Socket address of the server. Names go through the system lookup,
/// IPv4 results preferred.
fn locate(server: &str, port: u16) -> Result<SocketAddr, TransportError> {
    let addrs = (server, port)
        .to_socket_addrs()
        .map_err(|source| TransportError::Lookup {
            server: server.to_string(),
            source,
        })?
        .collect::<Vec<_>>();

    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| TransportError::NoAddress(server.to_string()))
}

fn remaining(
    deadline: Instant,
    addr: SocketAddr,
    timeout: Duration,
) -> Result<Duration, TransportError> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return Err(TransportError::Timeout(addr, timeout));
    }
    Ok(left)
}

fn io_error(addr: SocketAddr, timeout: Duration, source: io::Error) -> TransportError {
    match source.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            TransportError::Timeout(addr, timeout)
        }
        _ => TransportError::Io { addr, source },
    }
}

fn udp_exchange(
    addr: SocketAddr,
    request: &[u8],
    deadline: Instant,
    timeout: Duration,
) -> Result<Bytes, TransportError> {
    let local = if addr.is_ipv4() {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    };
    let err = |e| io_error(addr, timeout, e);

    let socket = UdpSocket::bind(local).map_err(err)?;
    socket.connect(addr).map_err(err)?;
    socket.send(request).map_err(err)?;

    let mut buf = vec![0u8; MAX_UDP_RESPONSE_SIZE];
    loop {
        socket
            .set_read_timeout(Some(remaining(deadline, addr, timeout)?))
            .map_err(err)?;
        let size = socket.recv(&mut buf).map_err(err)?;

        if answers_request(request, &buf[..size]) {
            return Ok(Bytes::copy_from_slice(&buf[..size]));
        }
        debug!(%addr, size, "ignoring datagram that does not answer our query");
    }
}

fn tcp_exchange(
    addr: SocketAddr,
    request: &[u8],
    deadline: Instant,
    timeout: Duration,
) -> Result<Bytes, TransportError> {
    let err = |e| io_error(addr, timeout, e);

    let mut stream =
        TcpStream::connect_timeout(&addr, remaining(deadline, addr, timeout)?).map_err(err)?;
    stream
        .set_write_timeout(Some(remaining(deadline, addr, timeout)?))
        .map_err(err)?;

    let mut framed = BytesMut::with_capacity(request.len() + 2);
    framed.put_u16(request.len() as u16);
    framed.extend_from_slice(request);
    stream.write_all(&framed).map_err(err)?;

    stream
        .set_read_timeout(Some(remaining(deadline, addr, timeout)?))
        .map_err(err)?;
    let mut len = [0u8; 2];
    stream.read_exact(&mut len).map_err(err)?;
    let mut response = vec![0u8; u16::from_be_bytes(len) as usize];
    stream.read_exact(&mut response).map_err(err)?;

    if !answers_request(request, &response) {
        return Err(TransportError::Io {
            addr,
            source: io::Error::new(io::ErrorKind::InvalidData, "reply does not match query"),
        });
    }

    Ok(Bytes::from(response))
}

fn is_truncated(response: &[u8]) -> bool {
    matches!(response.get(2), Some(b) if b & 0b0000_0010 != 0)
}

/// A reply answers a request when it is a response with the same ID and
/// the same question.
fn answers_request(request: &[u8], response: &[u8]) -> bool {
    let (Ok(req), Ok(resp)) = (DNSMessage::parse(request), DNSMessage::parse(response)) else {
        return false;
    };

    resp.id == req.id
        && resp.flags.qr == 1
        && match (req.queries.first(), resp.queries.first()) {
            (Some(q), Some(r)) => q.qtype == r.qtype && same_name(&q.name, &r.name),
            // some servers drop the question from error replies
            (Some(_), None) => resp.flags.rcode != 0,
            _ => false,
        }
}
