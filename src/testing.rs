//! In-memory zone and a loopback DNS server built on it, for tests.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use crate::dns_message::{name_labels, put_name, DNSMessage, Flags, RCode, RRType, Record};
use crate::transport::{Exchange, TransportError};

#[derive(Debug, Clone)]
enum Data {
    Addr(Ipv4Addr),
    Alias(String),
    Text(String),
}

impl Data {
    fn rtype(&self) -> RRType {
        match self {
            Data::Addr(_) => RRType::A,
            Data::Alias(_) => RRType::CNAME,
            Data::Text(_) => RRType::TXT,
        }
    }

    fn rdata(&self) -> Vec<u8> {
        match self {
            Data::Addr(ip) => ip.octets().to_vec(),
            Data::Alias(target) => {
                let mut buf = BytesMut::new();
                put_name(&name_labels(target).unwrap_or_default(), &mut buf);
                buf.to_vec()
            }
            Data::Text(text) => {
                let mut buf = BytesMut::new();
                buf.put_u8(text.len() as u8);
                buf.extend_from_slice(text.as_bytes());
                buf.to_vec()
            }
        }
    }
}

fn key(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// Answers queries the way a recursive server would for a tiny zone:
/// unknown names get NXDOMAIN, alias chains are followed for non-CNAME
/// questions.
#[derive(Debug, Clone, Default)]
pub struct Zone {
    records: HashMap<String, Vec<Data>>,
    rcode: Option<u8>,
    silent: bool,
    truncating: bool,
    asked: Arc<Mutex<Vec<(String, RRType)>>>,
}

impl Zone {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn addr(mut self, name: &str, ip: Ipv4Addr) -> Self {
        self.records.entry(key(name)).or_default().push(Data::Addr(ip));
        self
    }

    pub fn alias(mut self, name: &str, target: &str) -> Self {
        self.records
            .entry(key(name))
            .or_default()
            .push(Data::Alias(target.to_string()));
        self
    }

    pub fn text(mut self, name: &str, text: &str) -> Self {
        self.records
            .entry(key(name))
            .or_default()
            .push(Data::Text(text.to_string()));
        self
    }

    /// Every answer carries this rcode and nothing else.
    pub fn failing(mut self, rcode: RCode) -> Self {
        self.rcode = Some(rcode as u8);
        self
    }

    /// Never answers.
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    /// UDP answers come back empty with the TC bit set.
    pub fn truncating(mut self) -> Self {
        self.truncating = true;
        self
    }

    /// Questions received so far.
    pub fn asked(&self) -> Vec<(String, RRType)> {
        self.asked.lock().map(|a| a.clone()).unwrap_or_default()
    }

    pub fn answer(&self, request: &[u8]) -> Option<Bytes> {
        self.reply(request, false)
    }

    fn udp_answer(&self, request: &[u8]) -> Option<Bytes> {
        self.reply(request, self.truncating)
    }

    fn reply(&self, request: &[u8], truncated: bool) -> Option<Bytes> {
        let query = DNSMessage::parse(request).ok()?;
        let question = query.queries.first()?;
        let qtype = RRType::from_code(question.qtype);
        let domain = question.domain();

        if let Ok(mut asked) = self.asked.lock() {
            asked.push((key(&domain), qtype));
        }
        if self.silent {
            return None;
        }

        let mut rcode = self.rcode.unwrap_or(RCode::OK as u8);
        let mut found: Vec<(String, RRType, Vec<u8>)> = Vec::new();

        if self.rcode.is_none() {
            let mut owner = key(&domain);
            for _ in 0..8 {
                let Some(data) = self.records.get(&owner) else {
                    if found.is_empty() {
                        rcode = RCode::NameError as u8;
                    }
                    break;
                };

                let matching = data.iter().filter(|d| d.rtype() == qtype).collect::<Vec<_>>();
                if !matching.is_empty() {
                    for d in matching {
                        found.push((owner.clone(), qtype, d.rdata()));
                    }
                    break;
                }

                let alias = data.iter().find_map(|d| match d {
                    Data::Alias(target) => Some((d, target)),
                    _ => None,
                });
                match alias {
                    Some((d, target)) => {
                        found.push((owner.clone(), RRType::CNAME, d.rdata()));
                        owner = key(target);
                    }
                    None => break,
                }
            }
        }

        if truncated {
            found.clear();
        }
        let answers = found
            .iter()
            .map(|(owner, rtype, rdata)| {
                Record::new(name_labels(owner).unwrap_or_default(), *rtype, 60, rdata)
            })
            .collect();
        let flags = Flags {
            qr: 1,
            ra: 1,
            tc: truncated as u8,
            rcode,
            ..query.flags
        };

        Some(DNSMessage::new(query.id, flags, query.queries.clone(), answers).to_bytes())
    }
}

impl Exchange for Zone {
    fn exchange(
        &self,
        server: &str,
        port: u16,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Bytes, TransportError> {
        self.answer(request).ok_or_else(|| {
            let ip = server.parse().unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
            TransportError::Timeout(SocketAddr::new(ip, port), timeout)
        })
    }
}

/// Serves a [`Zone`] on 127.0.0.1, UDP and TCP on the same port.
pub struct MockDnsServer {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
}

impl MockDnsServer {
    pub fn start(zone: Zone) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(Duration::from_millis(50)))?;

        let stop = Arc::new(AtomicBool::new(false));

        let udp_zone = zone.clone();
        let udp_stop = stop.clone();
        thread::spawn(move || {
            let mut buf = [0; 512];
            while !udp_stop.load(Ordering::Relaxed) {
                if let Ok((size, peer)) = socket.recv_from(&mut buf) {
                    if let Some(response) = udp_zone.udp_answer(&buf[..size]) {
                        let _ = socket.send_to(&response, peer);
                    }
                }
            }
        });

        let tcp_stop = stop.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                if tcp_stop.load(Ordering::Relaxed) {
                    break;
                }
                if let Ok(stream) = stream {
                    serve_tcp(&zone, stream);
                }
            }
        });

        Ok(Self { addr, stop })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

// Reachability probes connect and hang up without sending anything.
fn serve_tcp(zone: &Zone, mut stream: TcpStream) {
    let _ = stream.set_read_timeout(Some(Duration::from_millis(200)));
    let mut len = [0u8; 2];
    if stream.read_exact(&mut len).is_err() {
        return;
    }
    let mut request = vec![0u8; u16::from_be_bytes(len) as usize];
    if stream.read_exact(&mut request).is_err() {
        return;
    }
    if let Some(response) = zone.answer(&request) {
        let mut framed = BytesMut::with_capacity(response.len() + 2);
        framed.put_u16(response.len() as u16);
        framed.extend_from_slice(&response);
        let _ = stream.write_all(&framed);
    }
}

impl Drop for MockDnsServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        // wake the accept loop
        let _ = TcpStream::connect(self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zone_follows_aliases() -> anyhow::Result<()> {
        let zone = Zone::new()
            .alias("a.example", "b.example")
            .addr("b.example", Ipv4Addr::new(10, 0, 0, 9));

        let request = DNSMessage::query(3, "a.example", RRType::A)?.to_bytes();
        let response = zone.answer(&request).expect("answer");
        let msg = DNSMessage::parse(&response)?;

        assert_eq!(msg.id, 3);
        assert_eq!(msg.answers.len(), 2);
        assert_eq!(msg.answers[0].rtype, RRType::CNAME.code());
        assert_eq!(msg.answers[1].rdata, &[10, 0, 0, 9]);

        Ok(())
    }

    #[test]
    fn test_mock_server_responds() -> anyhow::Result<()> {
        let server = MockDnsServer::start(Zone::new().addr("a.example", Ipv4Addr::LOCALHOST))?;

        let client = UdpSocket::bind("127.0.0.1:0")?;
        client.set_read_timeout(Some(Duration::from_secs(2)))?;
        let request = DNSMessage::query(9, "a.example", RRType::A)?.to_bytes();
        client.send_to(&request, ("127.0.0.1", server.port()))?;

        let mut buf = [0; 512];
        let (size, _) = client.recv_from(&mut buf)?;
        let msg = DNSMessage::parse(&buf[..size])?;
        assert_eq!(msg.id, 9);
        assert_eq!(msg.answers.len(), 1);

        Ok(())
    }
}
