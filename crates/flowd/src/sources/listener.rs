//! Firefly receiver: republishes fireflies sent by other hosts.

use crate::backends::firefly::parse_datagram;
use crate::bus::EventBus;
use crate::error::FlowResult;
use crate::flow::FlowRecord;
use crate::metrics::Metrics;
use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

const MAX_DATAGRAM: usize = 65535;

pub struct FireflyListener {
    socket: UdpSocket,
    metrics: Option<Arc<Metrics>>,
}

impl FireflyListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("Failed to bind firefly listener on {}", addr))?;
        Ok(Self {
            socket,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn run(self, bus: EventBus, cancel: CancellationToken) {
        info!("Firefly listener on {:?}", self.socket.local_addr().ok());
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("Firefly listener receive failed: {}", e);
                        continue;
                    }
                },
            };

            match decode(&buf[..n]) {
                Ok(record) => {
                    debug!("--> {} (from {})", record, peer);
                    bus.publish(record);
                }
                Err(e) => {
                    warn!("Dropping datagram from {}: {}", peer, e);
                    if let Some(metrics) = &self.metrics {
                        metrics.inc_malformed_records();
                    }
                }
            }
        }
        info!("Firefly listener stopped");
    }
}

fn decode(payload: &[u8]) -> FlowResult<FlowRecord> {
    let text = String::from_utf8_lossy(payload);
    parse_datagram(text.trim_end())?.into_record()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::firefly::FireflyEncoder;
    use crate::bus::Recv;
    use crate::flow::{FlowKey, FlowState, Identifier};
    use crate::registry::Registry;
    use chrono::Utc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_listener_republishes_fireflies() {
        let metrics = Metrics::new();
        let listener = FireflyListener::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap()
            .with_metrics(metrics.clone());
        let addr = listener.local_addr().unwrap();

        let bus = EventBus::new();
        let mut sub = bus.register();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(listener.run(bus.clone(), cancel.clone()));

        let mut registry = Registry::new();
        registry.insert_experiment("atlas", 16);
        let encoder = FireflyEncoder::new(Arc::new(registry));
        let key = FlowKey::tcp(
            "[2001:db8::5]:51000".parse().unwrap(),
            "[2001:db8::1]:443".parse().unwrap(),
        );
        let now = Utc::now();
        let payload = encoder
            .render(&FlowRecord::end(key, "atlas".into(), None, Some(now), now), now)
            .unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"garbage", addr).await.unwrap();
        sender.send_to(payload.as_bytes(), addr).await.unwrap();

        let record = match sub.recv_timeout(Duration::from_secs(5)).await {
            Recv::Record(record) => record,
            other => panic!("expected a record, got {:?}", other),
        };
        assert_eq!(record.state(), FlowState::End);
        assert_eq!(record.key(), &key);
        assert_eq!(record.experiment(), &Identifier::Id(16));
        assert!(record.end_time().is_some());
        assert_eq!(
            metrics
                .malformed_records
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );

        cancel.cancel();
        task.await.unwrap();
    }

    #[test]
    fn test_decode_rejects_non_tcp() {
        let payload = "<134>1 ts host flowd - firefly-json - {\"version\":1,\
            \"flow-lifecycle\":{\"state\":\"start\",\"current-time\":\"2024-05-01T10:00:00+00:00\"},\
            \"flow-id\":{\"afi\":\"ipv4\",\"src-ip\":\"10.0.0.5\",\"dst-ip\":\"203.0.113.7\",\
            \"protocol\":\"udp\",\"src-port\":1,\"dst-port\":2},\
            \"context\":{\"experiment-id\":16,\"activity-id\":0}}";
        assert!(decode(payload.as_bytes()).is_err());

        let tcp = payload.replace("\"udp\"", "\"tcp\"");
        let record = decode(tcp.as_bytes()).unwrap();
        assert_eq!(record.state(), FlowState::Start);
        assert_eq!(record.activity(), None);
    }
}
