use std::io::{self, Write};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chain::ChainWalker;
use dns_message::RRType;
use probe::{probe, ProbeFailure};
use report::{ServiceStatus, StatusLine, Technology};
use resolver::{DNSClient, Query, Resolve, ResolutionConfig};
use transport::NetTransport;

mod address;
mod chain;
mod dns_message;
mod probe;
mod report;
mod resolver;
#[cfg(test)]
mod testing;
mod transport;

const EXIT_UNREACHABLE: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "dns-probe")]
#[command(version)]
#[command(about = "Checks that a DNS server answers for a name and prints a monitoring status line")]
struct Cli {
    /// DNS server FQDN or IP address
    #[arg(short, long)]
    server: String,

    /// Record to check
    #[arg(short = 'q', long, visible_alias = "query")]
    querry: String,

    /// DNS server port
    #[arg(short, long, default_value_t = 53, value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,

    /// Query timeout in seconds
    #[arg(short, long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..=86_400))]
    timeout: u64,

    /// Record type (A, CNAME, MX, TXT, ...)
    #[arg(short, long, default_value = "A")]
    record: RRType,

    /// Site label for the status line
    #[arg(long)]
    site: Option<String>,

    /// Environment label for the status line
    #[arg(long)]
    env: Option<String>,

    /// Discipline label for the status line
    #[arg(long)]
    discipline: Option<String>,

    /// Technology behind the record
    #[arg(long, value_enum, default_value_t = Technology::Dns)]
    tech: Technology,

    /// Echo every answer before the status line
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn resolution_config(&self) -> ResolutionConfig {
        ResolutionConfig {
            server: self.server.clone(),
            port: self.port,
            timeout: Duration::from_secs(self.timeout),
            record_type: self.record,
        }
    }

    fn status_line(&self, status: ServiceStatus) -> StatusLine<'_> {
        StatusLine {
            domain: &self.querry,
            site: self.site.as_deref(),
            environment: self.env.as_deref(),
            discipline: self.discipline.as_deref(),
            technology: self.tech,
            status,
        }
    }
}

fn init_logging(debug: bool) {
    let default_directive = if debug { "dns_probe=debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .with_level(true)
        .init();
}

/// Probes the server, resolves the query and writes the status line.
/// A failed probe comes back as a [`ProbeFailure`] error and nothing is
/// written.
fn run<R: Resolve>(cli: &Cli, resolver: &R, out: &mut impl Write) -> Result<ServiceStatus> {
    let config = cli.resolution_config();

    let addr = probe(resolver, &cli.server, cli.port, config.timeout)?;
    info!(server = %cli.server, %addr, "DNS server reachable");

    let up = if config.record_type == RRType::CNAME {
        let walk = ChainWalker::default().walk(resolver, &cli.querry, &config);
        info!(query = %cli.querry, hops = walk.hops, state = ?walk.state, "alias chain walked");
        if cli.debug {
            for value in &walk.trail {
                writeln!(out, "{value}").context("failed to write debug output")?;
            }
        }
        walk.terminal().is_some()
    } else {
        let answer = match resolver.resolve(&Query::new(&cli.querry, &config)) {
            Ok(outcome) => outcome.answer().map(str::to_string),
            Err(e) => {
                warn!(query = %cli.querry, error = %e, "query failed");
                None
            }
        };
        if cli.debug {
            writeln!(out, "{}", answer.as_deref().unwrap_or_default())
                .context("failed to write debug output")?;
        }
        answer.is_some_and(|a| !a.is_empty())
    };

    let status = ServiceStatus::from(up);
    writeln!(out, "{}", cli.status_line(status)).context("failed to write status line")?;

    Ok(status)
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let resolver = DNSClient::new(NetTransport);
    let mut stdout = io::stdout().lock();

    match run(&cli, &resolver, &mut stdout) {
        Ok(_) => Ok(ExitCode::SUCCESS),
        Err(e) => match e.downcast_ref::<ProbeFailure>() {
            Some(failure) => {
                eprintln!("{failure}");
                Ok(ExitCode::from(EXIT_UNREACHABLE))
            }
            None => Err(e),
        },
    }
}
