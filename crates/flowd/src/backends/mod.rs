//! Flow record consumers.
//!
//! Every backend owns a private [`Subscription`](crate::bus::Subscription)
//! and runs as its own task until the bus closes or the service cancels.

#[cfg(all(target_os = "linux", feature = "ebpf"))]
pub mod ebpf;
pub mod firefly;
pub mod flowlabel;
pub mod prometheus;

pub use firefly::{FireflyBackend, FireflyEncoder, SourceOverrides};
pub use flowlabel::{FlowLabelEncoder, MarkingTable, MemoryMarkingTable};
pub use prometheus::PrometheusBackend;

use crate::error::FlowError;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Bounded wait on a subscription between housekeeping passes
pub const RECV_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    FlowLabel,
    Firefly,
    Prometheus,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::FlowLabel => "flow-label",
            BackendKind::Firefly => "firefly",
            BackendKind::Prometheus => "prometheus",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "flow-label" | "flowlabel" | "ebpf" => Ok(BackendKind::FlowLabel),
            "firefly" | "udp-firefly" => Ok(BackendKind::Firefly),
            "prometheus" | "metrics" => Ok(BackendKind::Prometheus),
            other => Err(FlowError::Configuration(format!("unknown backend '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("flow-label".parse::<BackendKind>().unwrap(), BackendKind::FlowLabel);
        assert_eq!("udp_firefly".parse::<BackendKind>().unwrap(), BackendKind::Firefly);
        assert_eq!(" Prometheus ".parse::<BackendKind>().unwrap(), BackendKind::Prometheus);
        assert!(matches!(
            "syslog".parse::<BackendKind>(),
            Err(FlowError::Configuration(_))
        ));
        assert_eq!(BackendKind::FlowLabel.to_string(), "flow-label");
    }
}
