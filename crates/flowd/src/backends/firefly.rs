//! Firefly UDP telemetry.
//!
//! A firefly is a syslog (RFC 5424) line whose message is a JSON document
//! describing one flow-lifecycle event:
//!
//! ```text
//! <134>1 2024-05-01T10:00:00.000000+00:00 host flowd - firefly-json - {"version":1,...}
//! ```
//!
//! It is sent to the flow's own destination on [`DEFAULT_FIREFLY_PORT`] and,
//! when configured, to a collector as well. Delivery is fire-and-forget.

use super::RECV_TIMEOUT;
use crate::bus::{Recv, Subscription};
use crate::discovery::IpConfig;
use crate::error::{FlowError, FlowResult};
use crate::flow::{
    format_timestamp, parse_timestamp, FlowKey, FlowRecord, FlowState, Identifier, TcpStats,
};
use crate::metrics::Metrics;
use crate::registry::Registry;
use crate::socket::DualStackSocket;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_FIREFLY_PORT: u16 = 10514;

/// local0.informational
const SYSLOG_PRIORITY: u8 = (16 << 3) | 6;
const SYSLOG_VERSION: u8 = 1;
const SYSLOG_APP_NAME: &str = "flowd";
pub const SYSLOG_MSGID: &str = "firefly-json";
/// Fields before the JSON document: priority+version, timestamp, host,
/// app, procid, msgid, structured data
pub const HEADER_FIELDS: usize = 7;

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Firefly {
    pub version: u8,
    pub flow_lifecycle: Lifecycle,
    pub flow_id: FlowId,
    pub context: Context,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netlink: Option<TcpStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Lifecycle {
    pub state: FlowState,
    pub current_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FlowId {
    pub afi: String,
    pub src_ip: String,
    pub dst_ip: String,
    pub protocol: String,
    pub src_port: u16,
    pub dst_port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Context {
    pub experiment_id: u32,
    pub activity_id: u32,
    #[serde(default)]
    pub application: String,
}

impl Firefly {
    /// Convert a received firefly back into a lifecycle record.
    pub fn into_record(self) -> FlowResult<FlowRecord> {
        let flow = self.flow_id;
        if !flow.protocol.eq_ignore_ascii_case("tcp") {
            return Err(FlowError::MalformedInput(format!(
                "unsupported protocol '{}'",
                flow.protocol
            )));
        }
        let parse_ip = |s: &str| -> FlowResult<IpAddr> {
            s.parse()
                .map_err(|_| FlowError::MalformedInput(format!("bad address '{}'", s)))
        };
        let key = FlowKey::tcp(
            SocketAddr::new(parse_ip(&flow.src_ip)?, flow.src_port),
            SocketAddr::new(parse_ip(&flow.dst_ip)?, flow.dst_port),
        );

        let lifecycle = self.flow_lifecycle;
        let start_time = lifecycle.start_time.as_deref().map(parse_timestamp).transpose()?;
        let end_time = lifecycle.end_time.as_deref().map(parse_timestamp).transpose()?;
        if lifecycle.state == FlowState::End && end_time.is_none() {
            return Err(FlowError::MalformedInput(format!("end record for {} without end-time", key)));
        }

        let activity = match self.context.activity_id {
            0 => None,
            id => Some(Identifier::Id(id)),
        };
        Ok(FlowRecord::from_parts(
            lifecycle.state,
            key,
            Identifier::Id(self.context.experiment_id),
            activity,
            start_time,
            end_time,
        )?
        .with_stats(self.netlink))
    }
}

/// Split a datagram into header and firefly document.
pub fn parse_datagram(payload: &str) -> FlowResult<Firefly> {
    if !payload.contains(SYSLOG_MSGID) {
        return Err(FlowError::MalformedInput("not a firefly".to_string()));
    }
    let fields: Vec<&str> = payload.split(' ').collect();
    if fields.len() <= HEADER_FIELDS {
        return Err(FlowError::MalformedInput(format!(
            "firefly header has {} fields",
            fields.len()
        )));
    }
    let json = fields[HEADER_FIELDS..].join(" ");
    serde_json::from_str(&json)
        .map_err(|e| FlowError::MalformedInput(format!("firefly json: {}", e)))
}

// ============================================================================
// Encoder
// ============================================================================

/// Statically configured source addresses, one per family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceOverrides {
    pub ip4: Option<Ipv4Addr>,
    pub ip6: Option<Ipv6Addr>,
}

/// Renders records as firefly datagrams.
pub struct FireflyEncoder {
    hostname: String,
    application: String,
    registry: Arc<Registry>,
    ip_config: Option<IpConfig>,
    overrides: SourceOverrides,
}

impl FireflyEncoder {
    pub fn new(registry: Arc<Registry>) -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "-".to_string());
        Self {
            hostname,
            application: format!("flowd v{}", env!("CARGO_PKG_VERSION")),
            registry,
            ip_config: None,
            overrides: SourceOverrides::default(),
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn with_ip_config(mut self, ip_config: Option<IpConfig>) -> Self {
        self.ip_config = ip_config;
        self
    }

    pub fn with_overrides(mut self, overrides: SourceOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Build the JSON document for `record` at time `now`.
    pub fn firefly(&self, record: &FlowRecord, now: DateTime<Utc>) -> FlowResult<Firefly> {
        let (experiment_id, activity_id) = self.registry.resolve(record)?;
        let key = record.key();
        let dst = key.dst_ip.to_string();
        let ipv6 = dst.contains(':');

        let (start_time, end_time) = match record.state() {
            FlowState::Start => (record.start_time(), None),
            FlowState::End => (record.start_time(), record.end_time()),
            FlowState::Ongoing | FlowState::Update => (None, None),
        };

        Ok(Firefly {
            version: 1,
            flow_lifecycle: Lifecycle {
                state: record.state(),
                current_time: format_timestamp(&now),
                start_time: start_time.as_ref().map(format_timestamp),
                end_time: end_time.as_ref().map(format_timestamp),
            },
            flow_id: FlowId {
                afi: if ipv6 { "ipv6" } else { "ipv4" }.to_string(),
                src_ip: self.source_ip(key.src_ip, ipv6).to_string(),
                dst_ip: dst,
                protocol: key.protocol.as_str().to_string(),
                src_port: key.src_port,
                dst_port: key.dst_port,
            },
            context: Context {
                experiment_id: u32::from(experiment_id),
                activity_id: u32::from(activity_id),
                application: self.application.clone(),
            },
            netlink: record.extended_stats().cloned(),
        })
    }

    /// Full datagram payload: syslog header followed by the JSON document.
    pub fn render(&self, record: &FlowRecord, now: DateTime<Utc>) -> FlowResult<String> {
        let firefly = self.firefly(record, now)?;
        let json = serde_json::to_string(&firefly)
            .map_err(|e| FlowError::Delivery(format!("firefly encoding failed: {}", e)))?;
        Ok(format!(
            "<{}>{} {} {} {} - {} - {}",
            SYSLOG_PRIORITY,
            SYSLOG_VERSION,
            format_timestamp(&now),
            self.hostname,
            SYSLOG_APP_NAME,
            SYSLOG_MSGID,
            json
        ))
    }

    /// Static override, then discovered public address, then the observed one.
    fn source_ip(&self, observed: IpAddr, ipv6: bool) -> IpAddr {
        let configured = if ipv6 {
            self.overrides.ip6.map(IpAddr::V6)
        } else {
            self.overrides.ip4.map(IpAddr::V4)
        };
        let discovered = self.ip_config.and_then(|c| {
            if ipv6 {
                c.pub_ip6.map(IpAddr::V6)
            } else {
                c.pub_ip4.map(IpAddr::V4)
            }
        });
        configured.or(discovered).unwrap_or(observed)
    }
}

// ============================================================================
// Backend
// ============================================================================

/// Encoder plus dual-stack sender.
pub struct FireflyBackend {
    encoder: FireflyEncoder,
    socket: DualStackSocket,
    port: u16,
    collector: Option<SocketAddr>,
    metrics: Option<Arc<Metrics>>,
}

impl FireflyBackend {
    pub fn new(encoder: FireflyEncoder, socket: DualStackSocket, port: u16) -> Self {
        Self {
            encoder,
            socket,
            port,
            collector: None,
            metrics: None,
        }
    }

    /// Additional IPv4 collector that receives every firefly.
    pub fn with_collector(mut self, collector: Option<SocketAddr>) -> Self {
        self.collector = collector;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Encode and send one record to its destination and the collector.
    pub async fn deliver(&self, record: &FlowRecord) -> FlowResult<()> {
        let payload = self.encoder.render(record, Utc::now())?;
        debug!("{}", payload);

        let target = SocketAddr::new(record.key().dst_ip, self.port);
        self.socket.send_to(payload.as_bytes(), target).await?;
        if let Some(collector) = self.collector {
            self.socket.send_to_v4(payload.as_bytes(), collector).await?;
        }
        Ok(())
    }

    pub async fn run(self, mut subscription: Subscription, cancel: CancellationToken) -> FlowResult<()> {
        info!(
            "Firefly backend started (port {}, collector {:?}, ipv6 {})",
            self.port,
            self.collector,
            self.socket.has_ipv6()
        );
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let record = match subscription.recv_timeout(RECV_TIMEOUT).await {
                Recv::Record(record) => record,
                Recv::Idle => continue,
                Recv::Closed => break,
            };
            match self.deliver(&record).await {
                Ok(()) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.inc_fireflies_sent();
                    }
                }
                Err(e) => {
                    warn!("Firefly for {} not sent: {}", record, e);
                    if let Some(metrics) = &self.metrics {
                        metrics.inc_firefly_failures();
                    }
                }
            }
        }

        let dropped = subscription.drain();
        info!("Firefly backend stopped ({} queued records dropped)", dropped);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use chrono::TimeZone;
    use tokio::net::UdpSocket;

    fn registry() -> Arc<Registry> {
        let mut reg = Registry::new();
        reg.insert_experiment("atlas", 16);
        reg.insert_activity(16, "production", 14);
        Arc::new(reg)
    }

    fn encoder() -> FireflyEncoder {
        FireflyEncoder::new(registry()).with_hostname("node1.example.org")
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    fn start_record(src: &str, dst: &str) -> FlowRecord {
        FlowRecord::start(
            FlowKey::tcp(src.parse().unwrap(), dst.parse().unwrap()),
            "atlas".into(),
            Some("production".into()),
            now(),
        )
    }

    fn json_body(payload: &str) -> serde_json::Value {
        let json = payload.splitn(HEADER_FIELDS + 1, ' ').last().unwrap();
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_start_firefly() {
        let record = start_record("[2001:db8::5]:51000", "[2001:db8::1]:443");
        let payload = encoder().render(&record, now()).unwrap();

        assert!(payload.starts_with(
            "<134>1 2024-05-01T10:00:00.000000+00:00 node1.example.org flowd - firefly-json - {"
        ));
        let body = json_body(&payload);
        assert_eq!(body["version"], 1);
        assert_eq!(body["flow-id"]["afi"], "ipv6");
        assert_eq!(body["flow-id"]["dst-ip"], "2001:db8::1");
        assert_eq!(body["flow-id"]["dst-port"], 443);
        assert_eq!(body["flow-id"]["protocol"], "tcp");
        assert_eq!(body["context"]["experiment-id"], 16);
        assert_eq!(body["context"]["activity-id"], 14);
        assert_eq!(
            body["context"]["application"],
            format!("flowd v{}", env!("CARGO_PKG_VERSION"))
        );
        assert_eq!(body["flow-lifecycle"]["state"], "start");
        assert_eq!(
            body["flow-lifecycle"]["start-time"],
            "2024-05-01T10:00:00.000000+00:00"
        );
        assert!(body["flow-lifecycle"].get("end-time").is_none());
        assert!(body.get("netlink").is_none());
    }

    #[test]
    fn test_end_firefly_times() {
        let key = FlowKey::tcp(
            "10.0.0.5:51000".parse().unwrap(),
            "203.0.113.7:443".parse().unwrap(),
        );
        let end = now() + chrono::Duration::seconds(30);
        let record = FlowRecord::end(key, "atlas".into(), None, Some(now()), end);
        let body = json_body(&encoder().render(&record, end).unwrap());

        assert_eq!(body["flow-id"]["afi"], "ipv4");
        assert_eq!(body["context"]["activity-id"], 0);
        assert_eq!(body["flow-lifecycle"]["state"], "end");
        assert_eq!(
            body["flow-lifecycle"]["start-time"],
            "2024-05-01T10:00:00.000000+00:00"
        );
        assert_eq!(
            body["flow-lifecycle"]["end-time"],
            "2024-05-01T10:00:30.000000+00:00"
        );
    }

    #[test]
    fn test_source_ip_precedence() {
        let record = start_record("10.0.0.5:51000", "203.0.113.7:443");
        let ip_config = IpConfig {
            pub_ip4: Some(Ipv4Addr::new(192, 0, 2, 1)),
            ..Default::default()
        };

        let observed = encoder().firefly(&record, now()).unwrap();
        assert_eq!(observed.flow_id.src_ip, "10.0.0.5");

        let discovered = encoder()
            .with_ip_config(Some(ip_config))
            .firefly(&record, now())
            .unwrap();
        assert_eq!(discovered.flow_id.src_ip, "192.0.2.1");

        let configured = encoder()
            .with_ip_config(Some(ip_config))
            .with_overrides(SourceOverrides {
                ip4: Some(Ipv4Addr::new(198, 51, 100, 1)),
                ip6: Some("2001:db8::99".parse().unwrap()),
            })
            .firefly(&record, now())
            .unwrap();
        assert_eq!(configured.flow_id.src_ip, "198.51.100.1");

        // Keyed on the destination family
        let v6 = start_record("[2001:db8::5]:51000", "[2001:db8::1]:443");
        let firefly = encoder().with_ip_config(Some(ip_config)).firefly(&v6, now()).unwrap();
        assert_eq!(firefly.flow_id.src_ip, "2001:db8::5");
    }

    #[test]
    fn test_unknown_experiment_fails() {
        let key = FlowKey::tcp(
            "[2001:db8::5]:51000".parse().unwrap(),
            "[2001:db8::1]:443".parse().unwrap(),
        );
        let record = FlowRecord::start(key, "unknown".into(), None, now());
        assert!(matches!(
            encoder().render(&record, now()),
            Err(FlowError::IdentifierResolution { .. })
        ));
    }

    #[test]
    fn test_stats_included() {
        let stats = TcpStats {
            rtt: Some(0.5),
            cwnd: Some(10),
            ..Default::default()
        };
        let record = start_record("10.0.0.5:51000", "203.0.113.7:443").with_stats(Some(stats));
        let body = json_body(&encoder().render(&record, now()).unwrap());
        assert_eq!(body["netlink"]["rtt"], 0.5);
        assert_eq!(body["netlink"]["cwnd"], 10);
    }

    #[test]
    fn test_parse_datagram_into_record() {
        let record = start_record("[2001:db8::5]:51000", "[2001:db8::1]:443");
        let payload = encoder().render(&record, now()).unwrap();

        let parsed = parse_datagram(&payload).unwrap().into_record().unwrap();
        assert_eq!(parsed.state(), FlowState::Start);
        assert_eq!(parsed.key(), record.key());
        assert_eq!(parsed.experiment(), &Identifier::Id(16));
        assert_eq!(parsed.activity(), Some(&Identifier::Id(14)));
        assert_eq!(parsed.start_time(), Some(now()));
        assert_eq!(parsed.end_time(), None);
    }

    #[test]
    fn test_parse_datagram_rejects_garbage() {
        assert!(parse_datagram("hello world").is_err());
        assert!(parse_datagram("<134>1 firefly-json {}").is_err());
        assert!(matches!(
            parse_datagram("<134>1 ts host flowd - firefly-json - {not json"),
            Err(FlowError::MalformedInput(_))
        ));
    }

    #[tokio::test]
    async fn test_deliver_to_destination_and_collector() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let collector = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();

        let backend = FireflyBackend::new(encoder(), DualStackSocket::bind().await.unwrap(), port)
            .with_collector(Some(collector.local_addr().unwrap()));
        let record = start_record("127.0.0.1:51000", "127.0.0.1:443");
        backend.deliver(&record).await.unwrap();

        let mut buf = [0u8; 2048];
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        let first = String::from_utf8_lossy(&buf[..n]).into_owned();
        let (n, _) = collector.recv_from(&mut buf).await.unwrap();
        let second = String::from_utf8_lossy(&buf[..n]).into_owned();

        assert_eq!(first, second);
        assert_eq!(json_body(&first)["flow-id"]["src-port"], 51000);
    }

    #[tokio::test]
    async fn test_run_counts_failures_and_continues() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();
        let metrics = Metrics::new();
        let backend = FireflyBackend::new(encoder(), DualStackSocket::bind().await.unwrap(), port)
            .with_metrics(metrics.clone());

        let bus = EventBus::new();
        let sub = bus.register();
        let key = FlowKey::tcp(
            "127.0.0.1:1".parse().unwrap(),
            "127.0.0.1:2".parse().unwrap(),
        );
        bus.publish(FlowRecord::start(key, "unknown".into(), None, now()));
        bus.publish(start_record("127.0.0.1:51000", "127.0.0.1:443"));
        bus.close();

        backend.run(sub, CancellationToken::new()).await.unwrap();

        let mut buf = [0u8; 2048];
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).contains("\"src-port\":51000"));
        assert_eq!(metrics.fireflies_sent.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert_eq!(metrics.firefly_failures.load(std::sync::atomic::Ordering::Relaxed), 1);
    }
}
