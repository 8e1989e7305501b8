//! Per-flow gauges for the metrics endpoint.
//!
//! Keeps a cache of active flows (added on `start`/`ongoing`, removed on
//! `end`) and renders `flow_tcp_<stat>` gauges into [`Metrics`]. When the
//! producer does not attach statistics, the cache is refreshed from a
//! snapshot source while the subscription is idle.

use super::RECV_TIMEOUT;
use crate::bus::{Recv, Subscription};
use crate::error::FlowResult;
use crate::flow::{FlowKey, FlowRecord, FlowState, TcpStats};
use crate::metrics::{render_flow_gauges, FlowSample, Metrics};
use crate::registry::Registry;
use crate::snapshot::SnapshotSource;
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
struct CachedFlow {
    exp_id: u16,
    activity_id: u8,
    stats: Option<TcpStats>,
}

pub struct PrometheusBackend {
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
    flows: BTreeMap<FlowKey, CachedFlow>,
    refresher: Option<Box<dyn SnapshotSource>>,
    refresh_interval: Duration,
    last_refresh: Option<Instant>,
}

impl PrometheusBackend {
    pub fn new(registry: Arc<Registry>, metrics: Arc<Metrics>) -> Self {
        Self {
            registry,
            metrics,
            flows: BTreeMap::new(),
            refresher: None,
            refresh_interval: Duration::from_secs(30),
            last_refresh: None,
        }
    }

    /// Refresh statistics from `source` at most once per `interval`.
    pub fn with_refresher(mut self, source: Box<dyn SnapshotSource>, interval: Duration) -> Self {
        self.refresher = Some(source);
        self.refresh_interval = interval;
        self
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Update the cache from one record.
    pub fn handle(&mut self, record: &FlowRecord) -> FlowResult<()> {
        let key = *record.key();
        match record.state() {
            FlowState::End => {
                self.flows.remove(&key);
            }
            FlowState::Start | FlowState::Ongoing => {
                let (exp_id, activity_id) = self.registry.resolve(record)?;
                self.flows.insert(
                    key,
                    CachedFlow {
                        exp_id,
                        activity_id,
                        stats: record.extended_stats().cloned(),
                    },
                );
            }
            FlowState::Update => {
                if let (Some(flow), Some(stats)) = (self.flows.get_mut(&key), record.extended_stats()) {
                    flow.stats = Some(stats.clone());
                }
            }
        }
        Ok(())
    }

    /// Pull fresh statistics for cached flows. Returns the number updated.
    pub async fn refresh(&mut self) -> usize {
        let Some(source) = self.refresher.as_mut() else {
            return 0;
        };
        if self.flows.is_empty() {
            return 0;
        }
        let entries = match source.poll().await {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Statistics refresh failed: {}", e);
                return 0;
            }
        };

        let mut updated = 0;
        for entry in entries {
            if let (Some(flow), Some(stats)) = (self.flows.get_mut(&entry.key), entry.stats) {
                flow.stats = Some(stats);
                updated += 1;
            }
        }
        updated
    }

    /// Render the cache into the metrics registry.
    pub fn publish(&self) {
        let samples: Vec<FlowSample> = self
            .flows
            .iter()
            .filter_map(|(key, flow)| {
                let stats = flow.stats.as_ref()?;
                Some(FlowSample {
                    src: key.src_ip.to_string(),
                    dst: key.dst_ip.to_string(),
                    exp_id: flow.exp_id,
                    activity_id: flow.activity_id,
                    values: stats.gauges(),
                })
            })
            .collect();
        self.metrics.set_flow_gauges(render_flow_gauges(&samples));
    }

    fn refresh_due(&self) -> bool {
        self.refresher.is_some()
            && self
                .last_refresh
                .map_or(true, |at| at.elapsed() >= self.refresh_interval)
    }

    pub async fn run(mut self, mut subscription: Subscription, cancel: CancellationToken) -> FlowResult<()> {
        info!(
            "Prometheus backend started (statistics refresh {})",
            if self.refresher.is_some() { "on" } else { "off" }
        );
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match subscription.recv_timeout(RECV_TIMEOUT).await {
                Recv::Record(record) => {
                    if let Err(e) = self.handle(&record) {
                        warn!("Skipping {}: {}", record, e);
                    }
                }
                Recv::Idle => {
                    if self.refresh_due() {
                        let updated = self.refresh().await;
                        debug!("Refreshed statistics of {} flows", updated);
                        self.last_refresh = Some(Instant::now());
                    }
                }
                Recv::Closed => break,
            }
            self.publish();
        }

        self.flows.clear();
        self.publish();
        let dropped = subscription.drain();
        info!("Prometheus backend stopped ({} queued records dropped)", dropped);
        Ok(())
    }
}
