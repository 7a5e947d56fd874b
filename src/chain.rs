use thiserror::Error;
use tracing::{debug, warn};

use crate::address::is_literal_ipv4;
use crate::dns_message::RRType;
use crate::resolver::{Query, Resolve, ResolutionConfig, ResolutionOutcome};

/// Aliases followed before a chain is declared broken.
pub const MAX_HOPS: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainFailure {
    #[error("{name} resolved to nothing ({outcome})")]
    Empty {
        name: String,
        outcome: ResolutionOutcome,
    },
    #[error("query for {name} failed: {reason}")]
    Query { name: String, reason: String },
    #[error("no address after {0} aliases")]
    HopLimit(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainState {
    Resolving(String),
    Terminal(String),
    Failed(ChainFailure),
}

impl ChainState {
    /// Next state after asking about `name` and getting `outcome`.
    pub fn step(name: &str, outcome: ResolutionOutcome) -> ChainState {
        match outcome {
            ResolutionOutcome::Answer(text) if is_literal_ipv4(&text) => {
                ChainState::Terminal(text)
            }
            ResolutionOutcome::Answer(text) if !text.is_empty() => ChainState::Resolving(text),
            outcome => ChainState::Failed(ChainFailure::Empty {
                name: name.to_string(),
                outcome,
            }),
        }
    }
}

/// How a walk ended, plus every value seen on the way for the debug echo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainWalk {
    pub state: ChainState,
    pub hops: usize,
    pub trail: Vec<String>,
}

impl ChainWalk {
    pub fn terminal(&self) -> Option<&str> {
        match &self.state {
            ChainState::Terminal(address) => Some(address),
            _ => None,
        }
    }
}

pub struct ChainWalker {
    max_hops: usize,
}

impl Default for ChainWalker {
    fn default() -> Self {
        Self { max_hops: MAX_HOPS }
    }
}

impl ChainWalker {
    /// Follows CNAMEs from `name` until an IPv4 literal, an empty answer,
    /// or the hop limit. Every hop is a CNAME query against `config`'s
    /// server.
    pub fn walk<R: Resolve>(
        &self,
        resolver: &R,
        name: &str,
        config: &ResolutionConfig,
    ) -> ChainWalk {
        let config = ResolutionConfig {
            record_type: RRType::CNAME,
            ..config.clone()
        };
        let mut state = ChainState::Resolving(name.to_string());
        let mut hops = 0;
        let mut trail = Vec::new();

        while let ChainState::Resolving(current) = &state {
            if hops == self.max_hops {
                warn!(%name, hops, "alias chain too long, giving up");
                state = ChainState::Failed(ChainFailure::HopLimit(hops));
                break;
            }
            hops += 1;

            let next = match resolver.resolve(&Query::new(current, &config)) {
                Ok(outcome) => ChainState::step(current, outcome),
                Err(e) => {
                    warn!(name = %current, error = %e, "alias chain query failed");
                    ChainState::Failed(ChainFailure::Query {
                        name: current.clone(),
                        reason: e.to_string(),
                    })
                }
            };

            match &next {
                ChainState::Resolving(value) | ChainState::Terminal(value) => {
                    debug!(hop = hops, from = %current, to = %value, "alias hop");
                    trail.push(value.clone());
                }
                ChainState::Failed(failure) => debug!(hop = hops, %failure, "alias chain broken"),
            }
            state = next;
        }

        ChainWalk { state, hops, trail }
    }
}
