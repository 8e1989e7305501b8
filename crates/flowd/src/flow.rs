//! Flow lifecycle records and the values they carry.
//!
//! A [`FlowRecord`] is built once by a producer and never mutated after it
//! is published. Construction goes through the per-state constructors so
//! that `end_time` can only ever be present on an `end` record.

use crate::error::{FlowError, FlowResult};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

// ============================================================================
// Lifecycle state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowState {
    Start,
    End,
    /// Connection that existed before the producer started
    Ongoing,
    Update,
}

impl FlowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowState::Start => "start",
            FlowState::End => "end",
            FlowState::Ongoing => "ongoing",
            FlowState::Update => "update",
        }
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlowState {
    type Err = FlowError;

    fn from_str(s: &str) -> FlowResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(FlowState::Start),
            "end" => Ok(FlowState::End),
            "ongoing" => Ok(FlowState::Ongoing),
            "update" => Ok(FlowState::Update),
            other => Err(FlowError::MalformedInput(format!(
                "unknown flow state '{}'",
                other
            ))),
        }
    }
}

// ============================================================================
// Connection key
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = FlowError;

    fn from_str(s: &str) -> FlowResult<Self> {
        if s.trim().eq_ignore_ascii_case("tcp") {
            Ok(Protocol::Tcp)
        } else {
            Err(FlowError::MalformedInput(format!(
                "unsupported protocol '{}'",
                s
            )))
        }
    }
}

/// (protocol, src_ip, src_port, dst_ip, dst_port)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey {
    pub protocol: Protocol,
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn tcp(src: SocketAddr, dst: SocketAddr) -> Self {
        Self {
            protocol: Protocol::Tcp,
            src_ip: src.ip(),
            src_port: src.port(),
            dst_ip: dst.ip(),
            dst_port: dst.port(),
        }
    }

    pub fn src(&self) -> SocketAddr {
        SocketAddr::new(self.src_ip, self.src_port)
    }

    pub fn dst(&self) -> SocketAddr {
        SocketAddr::new(self.dst_ip, self.dst_port)
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.protocol, self.src(), self.dst())
    }
}

// ============================================================================
// Experiment / activity identifiers
// ============================================================================

/// Either a registry name or an already resolved numeric id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    Name(String),
    Id(u32),
}

impl Identifier {
    pub fn name(name: impl Into<String>) -> Self {
        Identifier::Name(name.into())
    }

    /// Numeric text becomes an id, anything else stays a name.
    pub fn from_text(s: &str) -> Self {
        let s = s.trim();
        match s.parse::<u32>() {
            Ok(id) => Identifier::Id(id),
            Err(_) => Identifier::Name(s.to_string()),
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Name(name) => f.write_str(name),
            Identifier::Id(id) => write!(f, "{}", id),
        }
    }
}

impl FromStr for Identifier {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Identifier::from_text(s))
    }
}

impl From<u32> for Identifier {
    fn from(id: u32) -> Self {
        Identifier::Id(id)
    }
}

impl From<&str> for Identifier {
    fn from(name: &str) -> Self {
        Identifier::Name(name.to_string())
    }
}

// ============================================================================
// OS-level connection status
// ============================================================================

/// Normalised TCP socket state.
///
/// Accepts the upper-case procfs names, the lower-case kernel diagnostic
/// names and the abbreviations printed by `ss`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpStatus {
    Established,
    SynSent,
    SynRecv,
    FinWait1,
    FinWait2,
    TimeWait,
    Close,
    CloseWait,
    LastAck,
    Listen,
    Closing,
    Unknown,
}

impl TcpStatus {
    /// States after which no further `start` makes sense for the connection
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TcpStatus::TimeWait
                | TcpStatus::LastAck
                | TcpStatus::FinWait1
                | TcpStatus::FinWait2
                | TcpStatus::Closing
                | TcpStatus::CloseWait
                | TcpStatus::Close
        )
    }

    /// Map the numeric state used by `/proc/net/tcp`
    pub fn from_proc(code: u8) -> Self {
        match code {
            0x01 => TcpStatus::Established,
            0x02 => TcpStatus::SynSent,
            0x03 => TcpStatus::SynRecv,
            0x04 => TcpStatus::FinWait1,
            0x05 => TcpStatus::FinWait2,
            0x06 => TcpStatus::TimeWait,
            0x07 => TcpStatus::Close,
            0x08 => TcpStatus::CloseWait,
            0x09 => TcpStatus::LastAck,
            0x0A => TcpStatus::Listen,
            0x0B => TcpStatus::Closing,
            _ => TcpStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TcpStatus::Established => "ESTABLISHED",
            TcpStatus::SynSent => "SYN_SENT",
            TcpStatus::SynRecv => "SYN_RECV",
            TcpStatus::FinWait1 => "FIN_WAIT1",
            TcpStatus::FinWait2 => "FIN_WAIT2",
            TcpStatus::TimeWait => "TIME_WAIT",
            TcpStatus::Close => "CLOSED",
            TcpStatus::CloseWait => "CLOSE_WAIT",
            TcpStatus::LastAck => "LAST_ACK",
            TcpStatus::Listen => "LISTEN",
            TcpStatus::Closing => "CLOSING",
            TcpStatus::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for TcpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TcpStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s.trim().to_ascii_uppercase().replace('-', "_");
        Ok(match norm.as_str() {
            "ESTABLISHED" | "ESTAB" => TcpStatus::Established,
            "SYN_SENT" => TcpStatus::SynSent,
            "SYN_RECV" | "SYN_RECEIVED" => TcpStatus::SynRecv,
            "FIN_WAIT1" | "FIN_WAIT_1" => TcpStatus::FinWait1,
            "FIN_WAIT2" | "FIN_WAIT_2" => TcpStatus::FinWait2,
            "TIME_WAIT" => TcpStatus::TimeWait,
            "CLOSE" | "CLOSED" => TcpStatus::Close,
            "CLOSE_WAIT" => TcpStatus::CloseWait,
            "LAST_ACK" => TcpStatus::LastAck,
            "LISTEN" | "LISTENING" => TcpStatus::Listen,
            "CLOSING" => TcpStatus::Closing,
            _ => TcpStatus::Unknown,
        })
    }
}

// ============================================================================
// Extended transport statistics
// ============================================================================

/// Per-connection TCP statistics snapshot from kernel diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TcpStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtt: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtt_var: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwnd: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrans: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snd_wscale: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rcv_wscale: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cong_algo: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub opts: Vec<String>,
    /// Remaining numeric counters (bytes_sent, segs_out, ...)
    #[serde(default, flatten)]
    pub counters: BTreeMap<String, f64>,
}

impl TcpStats {
    /// Numeric values suitable for gauges, keyed by metric suffix.
    pub fn gauges(&self) -> Vec<(String, f64)> {
        let mut out = Vec::with_capacity(self.counters.len() + 6);
        let named = [
            ("rtt", self.rtt),
            ("rtt_var", self.rtt_var),
            ("cwnd", self.cwnd.map(|v| v as f64)),
            ("retrans", self.retrans.map(|v| v as f64)),
            ("snd_wscale", self.snd_wscale.map(f64::from)),
            ("rcv_wscale", self.rcv_wscale.map(f64::from)),
        ];
        for (name, value) in named {
            if let Some(v) = value {
                out.push((name.to_string(), v));
            }
        }
        out.extend(self.counters.iter().map(|(k, v)| (k.clone(), *v)));
        out
    }
}

// ============================================================================
// FlowRecord
// ============================================================================

/// One lifecycle event for one flow.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowRecord {
    state: FlowState,
    key: FlowKey,
    experiment: Identifier,
    activity: Option<Identifier>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    extended_stats: Option<TcpStats>,
}

impl FlowRecord {
    pub fn start(
        key: FlowKey,
        experiment: Identifier,
        activity: Option<Identifier>,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            state: FlowState::Start,
            key,
            experiment,
            activity,
            start_time: Some(start_time),
            end_time: None,
            extended_stats: None,
        }
    }

    /// `start_time` is absent when the flow was seen only after it began.
    pub fn end(
        key: FlowKey,
        experiment: Identifier,
        activity: Option<Identifier>,
        start_time: Option<DateTime<Utc>>,
        end_time: DateTime<Utc>,
    ) -> Self {
        Self {
            state: FlowState::End,
            key,
            experiment,
            activity,
            start_time,
            end_time: Some(end_time),
            extended_stats: None,
        }
    }

    pub fn ongoing(key: FlowKey, experiment: Identifier, activity: Option<Identifier>) -> Self {
        Self {
            state: FlowState::Ongoing,
            key,
            experiment,
            activity,
            start_time: None,
            end_time: None,
            extended_stats: None,
        }
    }

    /// Build from an externally supplied descriptor, enforcing that only
    /// `end` records carry an end time.
    pub fn from_parts(
        state: FlowState,
        key: FlowKey,
        experiment: Identifier,
        activity: Option<Identifier>,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> FlowResult<Self> {
        if end_time.is_some() && state != FlowState::End {
            return Err(FlowError::MalformedInput(format!(
                "end time on a '{}' record for {}",
                state, key
            )));
        }
        Ok(Self {
            state,
            key,
            experiment,
            activity,
            start_time,
            end_time,
            extended_stats: None,
        })
    }

    pub fn with_stats(mut self, stats: Option<TcpStats>) -> Self {
        self.extended_stats = stats;
        self
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    pub fn experiment(&self) -> &Identifier {
        &self.experiment
    }

    pub fn activity(&self) -> Option<&Identifier> {
        self.activity.as_ref()
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn extended_stats(&self) -> Option<&TcpStats> {
        self.extended_stats.as_ref()
    }
}

impl fmt::Display for FlowRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} exp={}", self.state, self.key, self.experiment)?;
        match &self.activity {
            Some(act) => write!(f, " act={}", act)?,
            None => f.write_str(" act=-")?,
        }
        if let Some(ts) = &self.start_time {
            write!(f, " start={}", format_timestamp(ts))?;
        }
        if let Some(ts) = &self.end_time {
            write!(f, " end={}", format_timestamp(ts))?;
        }
        Ok(())
    }
}

// ============================================================================
// Timestamps
// ============================================================================

/// ISO-8601 UTC with microseconds and an explicit `+00:00` offset.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
}

/// Parse an ISO-8601 timestamp; a missing offset is taken as UTC.
pub fn parse_timestamp(s: &str) -> FlowResult<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| FlowError::MalformedInput(format!("bad timestamp '{}': {}", s, e)))
}
