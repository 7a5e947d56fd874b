use std::io;
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::address::is_literal_ipv4;
use crate::dns_message::RRType;
use crate::resolver::{Query, Resolve, ResolutionConfig, ResolutionOutcome};

#[derive(Debug, Error)]
pub enum ProbeFailure {
    #[error("could not resolve DNS server {server}: {reason}")]
    ResolutionFailed { server: String, reason: String },
    #[error("address/netmask is invalid: {0}")]
    InvalidAddress(String),
    #[error("connection to DNS server {0} timed out")]
    Timeout(SocketAddr),
    #[error("unknown host or FQDN/IP address unreachable: {addr}: {source}")]
    Unreachable { addr: SocketAddr, source: io::Error },
}

/// The address the probe connected to, or why it could not.
pub type ProbeResult = Result<SocketAddr, ProbeFailure>;

/// Checks that `server` accepts TCP connections on `port` within
/// `timeout`. A server given by name is first resolved through itself.
///
/// Never terminates the process; the caller decides what a failure means.
pub fn probe<R: Resolve>(
    resolver: &R,
    server: &str,
    port: u16,
    timeout: Duration,
) -> ProbeResult {
    let host = if is_literal_ipv4(server) {
        server.to_string()
    } else {
        bootstrap(resolver, server, port, timeout)?
    };

    let ip: IpAddr = host
        .parse()
        .map_err(|_| ProbeFailure::InvalidAddress(host.clone()))?;
    let addr = SocketAddr::new(ip, port);

    match TcpStream::connect_timeout(&addr, timeout) {
        Ok(stream) => {
            drop(stream);
            debug!(%addr, "DNS server port is open");
            Ok(addr)
        }
        Err(source) => Err(connect_failure(addr, source)),
    }
}

fn connect_failure(addr: SocketAddr, source: io::Error) -> ProbeFailure {
    match source.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ProbeFailure::Timeout(addr),
        _ => ProbeFailure::Unreachable { addr, source },
    }
}

// Resolve the server's own name by asking that same server for its A record.
fn bootstrap<R: Resolve>(
    resolver: &R,
    server: &str,
    port: u16,
    timeout: Duration,
) -> Result<String, ProbeFailure> {
    let config = ResolutionConfig {
        server: server.to_string(),
        port,
        timeout,
        record_type: RRType::A,
    };

    let failed = |reason: String| ProbeFailure::ResolutionFailed {
        server: server.to_string(),
        reason,
    };

    match resolver.resolve(&Query::new(server, &config)) {
        Ok(ResolutionOutcome::Answer(address)) => {
            debug!(%server, %address, "resolved DNS server name");
            Ok(address)
        }
        Ok(empty) => Err(failed(empty.to_string())),
        Err(e) => Err(failed(e.to_string())),
    }
}
