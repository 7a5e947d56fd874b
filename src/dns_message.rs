use std::fmt::{self, Write as _};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};
use nom::{
    combinator::map,
    error::ErrorKind,
    multi::{length_data, many0, many_m_n},
    number::complete::{be_u16, be_u32, be_u8},
    sequence::tuple,
    IResult,
};
use thiserror::Error;

use nom::bits::complete::take;

/*
                                1  1  1  1  1  1
  0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
|                      ID                       |
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
|QR|   Opcode  |AA|TC|RD|RA|   Z    |   RCODE   |
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
|                    QDCOUNT                    |
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
|                    ANCOUNT                    |
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
|                    NSCOUNT                    |
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
|                    ARCOUNT                    |
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
 */

pub const DNS_HDR_SIZE: usize = 12;

const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 255;
// compression pointers followed while reading a single name
const MAX_POINTER_HOPS: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed DNS message ({0:?})")]
    Malformed(ErrorKind),
    #[error("invalid domain name {0:?}")]
    InvalidName(String),
    #[error("unknown record type {0:?}")]
    UnknownRecordType(String),
    #[error("rdata does not fit a {0} record")]
    BadRdata(RRType),
}

impl<'a> From<nom::Err<nom::error::Error<&'a [u8]>>> for CodecError {
    fn from(err: nom::Err<nom::error::Error<&'a [u8]>>) -> Self {
        match err {
            nom::Err::Incomplete(_) => CodecError::Malformed(ErrorKind::Eof),
            nom::Err::Error(e) | nom::Err::Failure(e) => CodecError::Malformed(e.code),
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Flags {
    pub qr: u8,
    pub opcode: u8,
    pub aa: u8,
    pub tc: u8,
    pub rd: u8,
    pub ra: u8,
    pub rcode: u8,
}

impl Flags {
    /// Flags of an outgoing standard query with recursion desired.
    pub fn query() -> Self {
        Flags {
            opcode: OpCode::QUERY as u8,
            rd: 1,
            ..Default::default()
        }
    }

    pub fn compress_u16(&self) -> u16 {
        let flags_h: u8 =
            (self.qr << 7) | (self.opcode << 3) | (self.aa << 2) | (self.tc << 1) | self.rd;
        let flags_l: u8 = (self.ra << 7) | (self.rcode);

        (flags_h as u16) << 8 | (flags_l as u16)
    }

    fn parse_flags(input: (&[u8], usize)) -> nom::IResult<(&[u8], usize), Flags> {
        map(
            tuple((
                take(1u8),
                take(4u8),
                take(1u8),
                take(1u8),
                take(1u8),
                take(1u8),
                take(3u8),
                take(4u8),
            )),
            |(qr, opcode, aa, tc, rd, ra, _, rcode): (u8, u8, u8, u8, u8, u8, u8, u8)| Flags {
                qr,
                opcode,
                aa,
                tc,
                rd,
                ra,
                rcode,
            },
        )(input)
    }
}

#[repr(u8)]
pub enum OpCode {
    QUERY = 0,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub enum RCode {
    OK = 0,
    FmtError = 1,
    ServerFailure = 2,
    NameError = 3,
    NotImplemted = 4,
    Refused = 5,
}

impl RCode {
    pub fn describe(code: u8) -> &'static str {
        match code {
            0 => "NOERROR",
            1 => "FORMERR",
            2 => "SERVFAIL",
            3 => "NXDOMAIN",
            4 => "NOTIMP",
            5 => "REFUSED",
            _ => "unassigned rcode",
        }
    }
}

#[repr(u16)]
pub enum RRClass {
    IN = 1, // the Internet
}

/// Resource record types the probe knows how to ask for and print.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RRType {
    A,
    NS,
    CNAME,
    SOA,
    PTR,
    MX,
    TXT,
    AAAA,
    SRV,
    CAA,
    Other(u16),
}

impl RRType {
    pub fn code(self) -> u16 {
        match self {
            RRType::A => 1,
            RRType::NS => 2,
            RRType::CNAME => 5,
            RRType::SOA => 6,
            RRType::PTR => 12,
            RRType::MX => 15,
            RRType::TXT => 16,
            RRType::AAAA => 28,
            RRType::SRV => 33,
            RRType::CAA => 257,
            RRType::Other(code) => code,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            1 => RRType::A,
            2 => RRType::NS,
            5 => RRType::CNAME,
            6 => RRType::SOA,
            12 => RRType::PTR,
            15 => RRType::MX,
            16 => RRType::TXT,
            28 => RRType::AAAA,
            33 => RRType::SRV,
            257 => RRType::CAA,
            other => RRType::Other(other),
        }
    }
}

impl FromStr for RRType {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let rtype = match upper.as_str() {
            "A" => RRType::A,
            "NS" => RRType::NS,
            "CNAME" => RRType::CNAME,
            "SOA" => RRType::SOA,
            "PTR" => RRType::PTR,
            "MX" => RRType::MX,
            "TXT" => RRType::TXT,
            "AAAA" => RRType::AAAA,
            "SRV" => RRType::SRV,
            "CAA" => RRType::CAA,
            generic => generic
                .strip_prefix("TYPE")
                .and_then(|n| n.parse::<u16>().ok())
                .map(RRType::from_code)
                .ok_or_else(|| CodecError::UnknownRecordType(s.to_string()))?,
        };
        Ok(rtype)
    }
}

impl fmt::Display for RRType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RRType::Other(code) => write!(f, "TYPE{code}"),
            known => write!(f, "{known:?}"),
        }
    }
}

/// Reads a possibly compressed name starting at `input`. Pointers are
/// resolved against `msg`, the whole message `input` was sliced from.
pub fn parse_name<'a>(
    msg: &'a [u8],
    input: &'a [u8],
    hops: usize,
) -> IResult<&'a [u8], Vec<&'a [u8]>> {
    let mut labels = Vec::new();
    let mut rest = input;

    loop {
        let (after_len, len) = be_u8(rest)?;
        match len {
            0 => return Ok((after_len, labels)),
            l if l & 0b1100_0000 == 0b1100_0000 => {
                let (after_ptr, low) = be_u8(after_len)?;
                let offset = (((l & 0b0011_1111) as usize) << 8) | low as usize;
                if hops >= MAX_POINTER_HOPS || offset >= msg.len() {
                    return Err(nom::Err::Failure(nom::error::Error::new(
                        rest,
                        ErrorKind::Verify,
                    )));
                }
                let (_, tail) = parse_name(msg, &msg[offset..], hops + 1)?;
                labels.extend(tail);
                return Ok((after_ptr, labels));
            }
            l if l & 0b1100_0000 != 0 => {
                return Err(nom::Err::Failure(nom::error::Error::new(
                    rest,
                    ErrorKind::Tag,
                )));
            }
            _ => {
                let (after_label, label) = length_data(be_u8)(rest)?;
                labels.push(label);
                rest = after_label;
            }
        }
    }
}

fn name<'a>(msg: &'a [u8]) -> impl FnMut(&'a [u8]) -> IResult<&'a [u8], Vec<&'a [u8]>> {
    move |input| parse_name(msg, input, 0)
}

/// Splits a textual domain into wire labels. A trailing dot is accepted.
pub fn name_labels(domain: &str) -> Result<Vec<&[u8]>, CodecError> {
    let trimmed = domain.strip_suffix('.').unwrap_or(domain);
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let labels = trimmed
        .split('.')
        .map(|l| {
            if l.is_empty() || l.len() > MAX_LABEL_LEN {
                Err(CodecError::InvalidName(domain.to_string()))
            } else {
                Ok(l.as_bytes())
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    let wire_len: usize = labels.iter().map(|l| l.len() + 1).sum::<usize>() + 1;
    if wire_len > MAX_NAME_LEN {
        return Err(CodecError::InvalidName(domain.to_string()));
    }

    Ok(labels)
}

pub fn put_name(labels: &[&[u8]], buf: &mut BytesMut) {
    labels.iter().for_each(|&l| {
        buf.put_u8(l.len() as u8);
        buf.extend_from_slice(l);
    });
    buf.put_u8(0);
}

/// Absolute presentation form, `www.example.com.`; the root is `.`.
pub fn fqdn(labels: &[&[u8]]) -> String {
    if labels.is_empty() {
        return ".".to_string();
    }
    labels.iter().fold(String::new(), |mut out, l| {
        out.push_str(&String::from_utf8_lossy(l));
        out.push('.');
        out
    })
}

pub fn same_name(a: &[&[u8]], b: &[&[u8]]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.eq_ignore_ascii_case(y))
}

#[derive(Debug)]
pub struct DNSMessage<'a> {
    pub id: u16,
    pub flags: Flags,
    pub nscount: u16,
    pub arcount: u16,
    pub queries: Vec<Question<'a>>,
    pub answers: Vec<Record<'a>>,
    raw: &'a [u8],
}

impl<'a> DNSMessage<'a> {
    pub fn new(
        id: u16,
        flags: Flags,
        queries: Vec<Question<'a>>,
        answers: Vec<Record<'a>>,
    ) -> Self {
        DNSMessage {
            id,
            flags,
            nscount: 0,
            arcount: 0,
            queries,
            answers,
            raw: &[],
        }
    }

    /// A single-question recursive query.
    pub fn query(id: u16, domain: &'a str, rtype: RRType) -> Result<Self, CodecError> {
        let question = Question::new(domain, rtype)?;
        Ok(Self::new(id, Flags::query(), vec![question], vec![]))
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf: BytesMut = BytesMut::with_capacity(DNS_HDR_SIZE);

        buf.put_u16(self.id);
        buf.put_u16(self.flags.compress_u16());
        buf.put_u16(self.queries.len() as u16);
        buf.put_u16(self.answers.len() as u16);
        buf.put_u16(self.nscount);
        buf.put_u16(self.arcount);

        for q in self.queries.iter() {
            q.to_bytes(&mut buf);
        }

        for a in self.answers.iter() {
            a.to_bytes(&mut buf);
        }

        buf.freeze()
    }

    /// Decodes header, question and answer sections. Authority and
    /// additional records are left unread.
    pub fn parse(buf: &'a [u8]) -> Result<Self, CodecError> {
        let (_, msg) = Self::from_bytes(buf)?;
        Ok(msg)
    }

    pub fn from_bytes(buf: &'a [u8]) -> nom::IResult<&'a [u8], Self> {
        let (rest, (id, flags, qdcount, ancount, nscount, arcount)) = tuple((
            be_u16,
            nom::bits::bits(Flags::parse_flags),
            be_u16,
            be_u16,
            be_u16,
            be_u16,
        ))(buf)?;

        let (rest, queries) = Question::from_bytes(buf, rest, qdcount as usize)?;
        let (rest, answers) = Record::from_bytes(buf, rest, ancount as usize)?;

        Ok((
            rest,
            DNSMessage {
                id,
                flags,
                nscount,
                arcount,
                queries,
                answers,
                raw: buf,
            },
        ))
    }

    /// First answer of type `rtype` for the question name, following any
    /// CNAME records the server included for that name.
    pub fn first_answer(&self, rtype: RRType) -> Option<&Record<'a>> {
        let question = self.queries.first()?;
        let mut owner = question.name.clone();

        for _ in 0..=self.answers.len() {
            if let Some(record) = self
                .answers
                .iter()
                .find(|r| r.rtype == rtype.code() && same_name(&r.name, &owner))
            {
                return Some(record);
            }

            let alias = self
                .answers
                .iter()
                .find(|r| r.rtype == RRType::CNAME.code() && same_name(&r.name, &owner))?;
            owner = parse_name(self.raw, alias.rdata, 0).ok()?.1;
        }

        None
    }

    /// Presentation text of a record taken from this message.
    pub fn record_text(&self, record: &Record<'a>) -> Result<String, CodecError> {
        render_rdata(self.raw, RRType::from_code(record.rtype), record.rdata)
    }
}

/*
                                1  1  1  1  1  1
  0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
/                     QNAME                     /
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
|                     QTYPE                     |
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
|                     QCLASS                    |
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
*/
#[derive(Debug, Clone)]
pub struct Question<'a> {
    pub name: Vec<&'a [u8]>,
    pub qtype: u16,
    pub qclass: u16,
}

impl<'a> Question<'a> {
    pub fn new(domain: &'a str, rtype: RRType) -> Result<Self, CodecError> {
        Ok(Question {
            name: name_labels(domain)?,
            qtype: rtype.code(),
            qclass: RRClass::IN as u16,
        })
    }

    pub fn from_bytes(
        msg: &'a [u8],
        buf: &'a [u8],
        n: usize,
    ) -> nom::IResult<&'a [u8], Vec<Self>> {
        many_m_n(
            n,
            n,
            map(
                tuple((name(msg), be_u16, be_u16)),
                |(labels, qtype, qclass)| Question {
                    name: labels,
                    qtype,
                    qclass,
                },
            ),
        )(buf)
    }

    pub fn to_bytes(&self, buf: &mut BytesMut) {
        put_name(&self.name, buf);
        buf.put_u16(self.qtype);
        buf.put_u16(self.qclass);
    }

    #[cfg(test)]
    pub fn domain(&self) -> String {
        self.name
            .iter()
            .map(|l| String::from_utf8_lossy(l))
            .collect::<Vec<_>>()
            .join(".")
    }
}

/*
  0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
/                      NAME                     /
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
|                      TYPE                     |
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
|                     CLASS                     |
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
|                      TTL                      |
|                                               |
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
|                   RDLENGTH                    |
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--|
/                     RDATA                     /
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
*/
#[derive(Debug, Clone)]
pub struct Record<'a> {
    pub name: Vec<&'a [u8]>,
    pub rtype: u16,
    pub rclass: u16,
    pub ttl: u32,
    pub rdata: &'a [u8],
}

impl<'a> Record<'a> {
    #[cfg(test)]
    pub fn new(name: Vec<&'a [u8]>, rtype: RRType, ttl: u32, rdata: &'a [u8]) -> Self {
        Record {
            name,
            rtype: rtype.code(),
            rclass: RRClass::IN as u16,
            ttl,
            rdata,
        }
    }

    pub fn from_bytes(
        msg: &'a [u8],
        buf: &'a [u8],
        n: usize,
    ) -> nom::IResult<&'a [u8], Vec<Self>> {
        many_m_n(
            n,
            n,
            map(
                tuple((name(msg), be_u16, be_u16, be_u32, length_data(be_u16))),
                |(labels, rtype, rclass, ttl, rdata)| Record {
                    name: labels,
                    rtype,
                    rclass,
                    ttl,
                    rdata,
                },
            ),
        )(buf)
    }

    pub fn to_bytes(&self, buf: &mut BytesMut) {
        put_name(&self.name, buf);
        buf.put_u16(self.rtype);
        buf.put_u16(self.rclass);
        buf.put_u32(self.ttl);
        buf.put_u16(self.rdata.len() as u16);
        buf.extend_from_slice(self.rdata);
    }
}

fn quoted(text: &[u8]) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for &b in text {
        match b {
            b'"' | b'\\' => {
                out.push('\\');
                out.push(b as char);
            }
            0x20..=0x7e => out.push(b as char),
            _ => {
                let _ = write!(out, "\\{b:03}");
            }
        }
    }
    out.push('"');
    out
}

fn render_rdata<'a>(
    msg: &'a [u8],
    rtype: RRType,
    rdata: &'a [u8],
) -> Result<String, CodecError> {
    let bad = || CodecError::BadRdata(rtype);

    let text = match rtype {
        RRType::A => {
            let octets: [u8; 4] = rdata.try_into().map_err(|_| bad())?;
            Ipv4Addr::from(octets).to_string()
        }
        RRType::AAAA => {
            let octets: [u8; 16] = rdata.try_into().map_err(|_| bad())?;
            Ipv6Addr::from(octets).to_string()
        }
        RRType::CNAME | RRType::NS | RRType::PTR => fqdn(&parse_name(msg, rdata, 0)?.1),
        RRType::MX => {
            let (_, (preference, exchange)) = tuple((be_u16, name(msg)))(rdata)?;
            format!("{preference} {}", fqdn(&exchange))
        }
        RRType::TXT => {
            let (_, strings) = many0(length_data(be_u8))(rdata)?;
            strings
                .into_iter()
                .map(quoted)
                .collect::<Vec<_>>()
                .join(" ")
        }
        RRType::SOA => {
            let (_, (mname, rname, serial, refresh, retry, expire, minimum)) = tuple((
                name(msg),
                name(msg),
                be_u32,
                be_u32,
                be_u32,
                be_u32,
                be_u32,
            ))(rdata)?;
            format!(
                "{} {} {serial} {refresh} {retry} {expire} {minimum}",
                fqdn(&mname),
                fqdn(&rname)
            )
        }
        RRType::SRV => {
            let (_, (priority, weight, port, target)) =
                tuple((be_u16, be_u16, be_u16, name(msg)))(rdata)?;
            format!("{priority} {weight} {port} {}", fqdn(&target))
        }
        RRType::CAA => {
            let (_, (flags, tag, value)) =
                tuple((be_u8, length_data(be_u8), nom::combinator::rest))(rdata)?;
            format!(
                "{flags} {} {}",
                String::from_utf8_lossy(tag),
                quoted(value)
            )
        }
        RRType::Other(_) => {
            let hex = rdata.iter().fold(String::new(), |mut out, b| {
                let _ = write!(out, "{b:02x}");
                out
            });
            if hex.is_empty() {
                "\\# 0".to_string()
            } else {
                format!("\\# {} {hex}", rdata.len())
            }
        }
    };

    Ok(text)
}
