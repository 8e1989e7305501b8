use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Prometheus-compatible daemon metrics.
///
/// Counters are bumped by the producer and the backends; the per-flow
/// gauge section is rendered by the prometheus backend and stored here so
/// the HTTP endpoint can serve both in one response.
pub struct Metrics {
    // === Producer ===
    pub flows_started: AtomicU64,
    pub flows_ended: AtomicU64,
    pub flows_ongoing: AtomicU64,
    /// Connections currently held by the tracker
    pub tracked_connections: AtomicU64,
    pub snapshot_failures: AtomicU64,
    /// Externally supplied records that could not be used
    pub malformed_records: AtomicU64,

    // === Backends ===
    pub fireflies_sent: AtomicU64,
    pub firefly_failures: AtomicU64,
    pub labels_installed: AtomicU64,
    pub labels_released: AtomicU64,

    flow_gauges: Mutex<String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new_inner()
    }
}

impl Metrics {
    fn new_inner() -> Self {
        Self {
            flows_started: AtomicU64::new(0),
            flows_ended: AtomicU64::new(0),
            flows_ongoing: AtomicU64::new(0),
            tracked_connections: AtomicU64::new(0),
            snapshot_failures: AtomicU64::new(0),
            malformed_records: AtomicU64::new(0),
            fireflies_sent: AtomicU64::new(0),
            firefly_failures: AtomicU64::new(0),
            labels_installed: AtomicU64::new(0),
            labels_released: AtomicU64::new(0),
            flow_gauges: Mutex::new(String::new()),
        }
    }

    pub fn new() -> Arc<Self> {
        Arc::new(Self::new_inner())
    }

    pub fn inc_flows_started(&self) {
        self.flows_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_flows_ended(&self) {
        self.flows_ended.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_flows_ongoing(&self) {
        self.flows_ongoing.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_tracked_connections(&self, count: u64) {
        self.tracked_connections.store(count, Ordering::Relaxed);
    }

    pub fn inc_snapshot_failures(&self) {
        self.snapshot_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_malformed_records(&self) {
        self.malformed_records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_fireflies_sent(&self) {
        self.fireflies_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_firefly_failures(&self) {
        self.firefly_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_labels_installed(&self) {
        self.labels_installed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_labels_released(&self) {
        self.labels_released.fetch_add(1, Ordering::Relaxed);
    }

    /// Replace the rendered per-flow gauge section.
    pub fn set_flow_gauges(&self, rendered: String) {
        let mut gauges = self.flow_gauges.lock().unwrap_or_else(|p| p.into_inner());
        *gauges = rendered;
    }

    /// Format metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut out = format!(
            "# HELP flowd_flows_started_total Flow start events produced\n\
             # TYPE flowd_flows_started_total counter\n\
             flowd_flows_started_total {}\n\
             # HELP flowd_flows_ended_total Flow end events produced\n\
             # TYPE flowd_flows_ended_total counter\n\
             flowd_flows_ended_total {}\n\
             # HELP flowd_flows_ongoing_total Pre-existing flows announced\n\
             # TYPE flowd_flows_ongoing_total counter\n\
             flowd_flows_ongoing_total {}\n\
             # HELP flowd_tracked_connections Connections held by the tracker\n\
             # TYPE flowd_tracked_connections gauge\n\
             flowd_tracked_connections {}\n\
             # HELP flowd_snapshot_failures_total Failed connection snapshots\n\
             # TYPE flowd_snapshot_failures_total counter\n\
             flowd_snapshot_failures_total {}\n\
             # HELP flowd_malformed_records_total Records skipped as malformed\n\
             # TYPE flowd_malformed_records_total counter\n\
             flowd_malformed_records_total {}\n\
             # HELP flowd_fireflies_sent_total Firefly datagrams sent\n\
             # TYPE flowd_fireflies_sent_total counter\n\
             flowd_fireflies_sent_total {}\n\
             # HELP flowd_firefly_failures_total Firefly encode or send failures\n\
             # TYPE flowd_firefly_failures_total counter\n\
             flowd_firefly_failures_total {}\n\
             # HELP flowd_labels_installed_total Flow labels written to the marking table\n\
             # TYPE flowd_labels_installed_total counter\n\
             flowd_labels_installed_total {}\n\
             # HELP flowd_labels_released_total Flow labels scheduled for deletion\n\
             # TYPE flowd_labels_released_total counter\n\
             flowd_labels_released_total {}\n",
            self.flows_started.load(Ordering::Relaxed),
            self.flows_ended.load(Ordering::Relaxed),
            self.flows_ongoing.load(Ordering::Relaxed),
            self.tracked_connections.load(Ordering::Relaxed),
            self.snapshot_failures.load(Ordering::Relaxed),
            self.malformed_records.load(Ordering::Relaxed),
            self.fireflies_sent.load(Ordering::Relaxed),
            self.firefly_failures.load(Ordering::Relaxed),
            self.labels_installed.load(Ordering::Relaxed),
            self.labels_released.load(Ordering::Relaxed),
        );
        let gauges = self.flow_gauges.lock().unwrap_or_else(|p| p.into_inner());
        out.push_str(&gauges);
        out
    }
}

/// One labelled sample of a per-flow gauge.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowSample {
    pub src: String,
    pub dst: String,
    pub exp_id: u16,
    pub activity_id: u8,
    pub values: Vec<(String, f64)>,
}

/// Render `flow_tcp_<stat>` gauge families, one family per statistic.
pub fn render_flow_gauges(samples: &[FlowSample]) -> String {
    let mut families: std::collections::BTreeMap<&str, Vec<(&FlowSample, f64)>> =
        std::collections::BTreeMap::new();
    for sample in samples {
        for (name, value) in &sample.values {
            families
                .entry(name.as_str())
                .or_default()
                .push((sample, *value));
        }
    }

    let mut out = String::new();
    for (name, rows) in families {
        let metric = format!("flow_tcp_{}", sanitize(name));
        let _ = writeln!(out, "# TYPE {} gauge", metric);
        for (sample, value) in rows {
            let _ = writeln!(
                out,
                "{}{{src=\"{}\",dst=\"{}\",exp_id=\"{}\",activity_id=\"{}\"}} {}",
                metric, sample.src, sample.dst, sample.exp_id, sample.activity_id, value
            );
        }
    }
    out
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
