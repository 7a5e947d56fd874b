use std::fmt;

use clap::ValueEnum;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Technology {
    #[default]
    Dns,
    F5,
}

impl fmt::Display for Technology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Technology::Dns => f.write_str("dns"),
            Technology::F5 => f.write_str("f5"),
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Down = 0,
    Up = 1,
}

impl From<bool> for ServiceStatus {
    fn from(up: bool) -> Self {
        if up {
            ServiceStatus::Up
        } else {
            ServiceStatus::Down
        }
    }
}

/// One monitoring line:
/// `dns_domain,domain="<query>",site="<site>",environment=<env>,discipline=<discipline>,technology=<tech> service_status=<0|1>`
///
/// Labels that were not given print as `None`.
#[derive(Debug, Clone)]
pub struct StatusLine<'a> {
    pub domain: &'a str,
    pub site: Option<&'a str>,
    pub environment: Option<&'a str>,
    pub discipline: Option<&'a str>,
    pub technology: Technology,
    pub status: ServiceStatus,
}

fn label(value: Option<&str>) -> &str {
    value.unwrap_or("None")
}

impl fmt::Display for StatusLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dns_domain,domain=\"{}\",site=\"{}\",environment={},discipline={},technology={} service_status={}",
            self.domain,
            label(self.site),
            label(self.environment),
            label(self.discipline),
            self.technology,
            self.status as u8,
        )
    }
}
