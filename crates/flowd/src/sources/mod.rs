//! Flow record producers.
//!
//! Exactly one producer feeds the bus. The polling producers drive a
//! [`ConnectionTracker`](crate::tracker::ConnectionTracker) over a snapshot
//! source; the others accept records pushed by external tools.

pub mod listener;
#[cfg(unix)]
pub mod pipe;

pub use listener::FireflyListener;
#[cfg(unix)]
pub use pipe::NpApiPipe;

use crate::error::FlowError;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// procfs connection table, static identifiers
    Netstat,
    /// `ss` with extended TCP statistics
    Netlink,
    /// procfs with pool-drawn identifiers
    Iperf,
    /// fireflies received from other hosts
    Firefly,
    /// named pipe fed by local tools
    NpApi,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Netstat => "netstat",
            SourceKind::Netlink => "netlink",
            SourceKind::Iperf => "iperf",
            SourceKind::Firefly => "firefly",
            SourceKind::NpApi => "np-api",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "netstat" => Ok(SourceKind::Netstat),
            "netlink" => Ok(SourceKind::Netlink),
            "iperf" => Ok(SourceKind::Iperf),
            "firefly" => Ok(SourceKind::Firefly),
            "np-api" | "npapi" => Ok(SourceKind::NpApi),
            other => Err(FlowError::Configuration(format!("unknown source '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_kind_parse() {
        assert_eq!("np_api".parse::<SourceKind>().unwrap(), SourceKind::NpApi);
        assert_eq!("NETLINK".parse::<SourceKind>().unwrap(), SourceKind::Netlink);
        assert!("conntrack".parse::<SourceKind>().is_err());
        assert_eq!(SourceKind::NpApi.to_string(), "np-api");
    }
}
