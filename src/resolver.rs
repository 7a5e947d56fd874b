use std::fmt;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::debug;

use crate::dns_message::{CodecError, DNSMessage, RCode, RRType};
use crate::transport::{Exchange, NetTransport, TransportError};

/// Where and how to ask. Built once per invocation and handed to every
/// query, never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionConfig {
    pub server: String,
    pub port: u16,
    pub timeout: Duration,
    pub record_type: RRType,
}

#[derive(Debug, Clone, Copy)]
pub struct Query<'a> {
    pub name: &'a str,
    pub config: &'a ResolutionConfig,
}

impl<'a> Query<'a> {
    pub fn new(name: &'a str, config: &'a ResolutionConfig) -> Self {
        Query { name, config }
    }
}

/// DNS-level result of one query. At most one record survives: the first
/// matching one in the answer section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionOutcome {
    Answer(String),
    NoData,
    NameNotFound,
}

impl ResolutionOutcome {
    /// The answer text, `None` for the empty outcomes.
    pub fn answer(&self) -> Option<&str> {
        match self {
            ResolutionOutcome::Answer(text) => Some(text),
            ResolutionOutcome::NoData | ResolutionOutcome::NameNotFound => None,
        }
    }
}

impl fmt::Display for ResolutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionOutcome::Answer(text) => f.write_str(text),
            ResolutionOutcome::NoData => f.write_str("no record of the requested type"),
            ResolutionOutcome::NameNotFound => f.write_str("name does not exist"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("cannot build query: {0}")]
    Encode(CodecError),
    #[error("malformed response: {0}")]
    Malformed(CodecError),
    #[error("server answered {}", RCode::describe(*.0))]
    ServerFailure(u8),
}

pub trait Resolve {
    fn resolve(&self, query: &Query<'_>) -> Result<ResolutionOutcome, ResolveError>;
}

/// Stub resolver talking to exactly the server named in the query's
/// config.
pub struct DNSClient<T = NetTransport> {
    transport: T,
}

impl<T: Exchange> DNSClient<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    fn lookup(
        &self,
        name: &str,
        rtype: RRType,
        config: &ResolutionConfig,
    ) -> Result<ResolutionOutcome, ResolveError> {
        let id: u16 = rand::thread_rng().gen();
        let request = DNSMessage::query(id, name, rtype)
            .map_err(ResolveError::Encode)?
            .to_bytes();

        debug!(
            server = %config.server,
            port = config.port,
            %name,
            %rtype,
            "sending query"
        );
        let response =
            self.transport
                .exchange(&config.server, config.port, &request, config.timeout)?;
        let msg = DNSMessage::parse(&response).map_err(ResolveError::Malformed)?;

        let rcode = msg.flags.rcode;
        if rcode == RCode::NameError as u8 {
            return Ok(ResolutionOutcome::NameNotFound);
        }
        if rcode != RCode::OK as u8 {
            return Err(ResolveError::ServerFailure(rcode));
        }

        match msg.first_answer(rtype) {
            Some(record) => {
                let text = msg.record_text(record).map_err(ResolveError::Malformed)?;
                debug!(%name, %rtype, answers = msg.answers.len(), %text, "answer received");
                Ok(ResolutionOutcome::Answer(text))
            }
            None => Ok(ResolutionOutcome::NoData),
        }
    }
}

impl<T: Exchange> Resolve for DNSClient<T> {
    fn resolve(&self, query: &Query<'_>) -> Result<ResolutionOutcome, ResolveError> {
        let rtype = query.config.record_type;
        let outcome = self.lookup(query.name, rtype, query.config)?;

        // a name at the end of an alias chain has no CNAME of its own, only
        // an address
        if outcome == ResolutionOutcome::NoData && rtype == RRType::CNAME {
            debug!(name = %query.name, "no CNAME record, asking for A instead");
            return self.lookup(query.name, RRType::A, query.config);
        }

        Ok(outcome)
    }
}
