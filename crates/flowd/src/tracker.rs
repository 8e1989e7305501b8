//! Connection state tracker.
//!
//! Turns repeated point-in-time connection snapshots into a lifecycle event
//! stream: one `start` when a connection is first seen ESTABLISHED, one
//! `end` when it reaches a terminal state or disappears.
//!
//! ## Rules
//! - The first successful snapshot only registers what already exists.
//!   Those connections never get a `start` because their real start time is
//!   unknown; in [`TrackerMode::AnnouncePreexisting`] each gets a single
//!   `ongoing` instead.
//! - A connection that vanishes between polls gets a synthesized `end` if,
//!   and only if, a `start` (or `ongoing`) was emitted and no `end` yet.
//! - Listening sockets and internal destinations are ignored.
//! - Emitted timestamps never go backwards.

use crate::bus::EventBus;
use crate::error::{FlowError, FlowResult};
use crate::flow::{FlowKey, FlowRecord, FlowState, Identifier, TcpStats, TcpStatus};
use crate::metrics::Metrics;
use crate::net::InternalNetworks;
use crate::snapshot::{ConnectionEntry, SnapshotSource};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// (experiment, activity) pairs used for synthetic traffic
pub const DEFAULT_IDENTIFIER_POOL: &[(u32, u32)] = &[
    (2, 9),
    (2, 19),
    (3, 3),
    (3, 4),
    (4, 3),
    (4, 4),
    (5, 10),
    (5, 14),
];

/// How connections found by the first snapshot are reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackerMode {
    /// Silently registered, never reported
    #[default]
    Strict,
    /// Reported once as `ongoing`, and as `end` when they close
    AnnouncePreexisting,
}

/// Where a new connection's identifiers come from.
#[derive(Debug, Clone, PartialEq)]
pub enum IdentifierPolicy {
    Static {
        experiment: Identifier,
        activity: Option<Identifier>,
    },
    /// Drawn at connection start and held for the connection's lifetime
    Pool(IdentifierPool),
}

impl IdentifierPolicy {
    pub fn pool(pairs: Vec<(u32, u32)>) -> FlowResult<Self> {
        IdentifierPool::new(pairs).map(IdentifierPolicy::Pool)
    }
}

/// Non-empty set of (experiment, activity) pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentifierPool(Vec<(u32, u32)>);

impl IdentifierPool {
    pub fn new(pairs: Vec<(u32, u32)>) -> FlowResult<Self> {
        if pairs.is_empty() {
            return Err(FlowError::Configuration(
                "identifier pool must not be empty".to_string(),
            ));
        }
        Ok(Self(pairs))
    }

    pub fn pairs(&self) -> &[(u32, u32)] {
        &self.0
    }

    fn draw<R: Rng>(&self, rng: &mut R) -> (u32, u32) {
        self.0[rng.gen_range(0..self.0.len())]
    }
}

#[derive(Debug, Clone)]
struct TrackedConnection {
    status: TcpStatus,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    announced: bool,
    experiment: Identifier,
    activity: Option<Identifier>,
    stats: Option<TcpStats>,
}

impl TrackedConnection {
    fn reported(&self) -> bool {
        self.start_time.is_some() || self.announced
    }
}

/// Snapshot differ. Owns all per-connection state.
pub struct ConnectionTracker {
    internal: InternalNetworks,
    mode: TrackerMode,
    policy: IdentifierPolicy,
    tracked: HashMap<FlowKey, TrackedConnection>,
    initialized: bool,
    last_now: Option<DateTime<Utc>>,
    rng: StdRng,
    metrics: Option<Arc<Metrics>>,
}

impl ConnectionTracker {
    pub fn new(internal: InternalNetworks, mode: TrackerMode, policy: IdentifierPolicy) -> Self {
        Self {
            internal,
            mode,
            policy,
            tracked: HashMap::new(),
            initialized: false,
            last_now: None,
            rng: StdRng::from_entropy(),
            metrics: None,
        }
    }

    /// Fixed seed for reproducible pool draws
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn tracked_len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn assign_identifiers(&mut self) -> (Identifier, Option<Identifier>) {
        match &self.policy {
            IdentifierPolicy::Static {
                experiment,
                activity,
            } => (experiment.clone(), activity.clone()),
            IdentifierPolicy::Pool(pool) => {
                let (exp, act) = pool.draw(&mut self.rng);
                (Identifier::Id(exp), Some(Identifier::Id(act)))
            }
        }
    }

    fn is_of_interest(&self, entry: &ConnectionEntry) -> bool {
        entry.status != TcpStatus::Listen && !self.internal.is_internal(&entry.key.dst_ip)
    }

    /// Diff one snapshot against the tracked set and return the events it
    /// produces, in key order.
    pub fn apply(
        &mut self,
        snapshot: Vec<ConnectionEntry>,
        now: DateTime<Utc>,
    ) -> Vec<FlowRecord> {
        let now = match self.last_now {
            Some(last) if now < last => last,
            _ => now,
        };
        self.last_now = Some(now);

        let current: BTreeMap<FlowKey, ConnectionEntry> = snapshot
            .into_iter()
            .filter(|entry| self.is_of_interest(entry))
            .map(|entry| (entry.key, entry))
            .collect();

        let events = if self.initialized {
            self.steady_state(current, now)
        } else {
            self.initialized = true;
            self.initialization_pass(current)
        };

        if let Some(metrics) = &self.metrics {
            metrics.set_tracked_connections(self.tracked.len() as u64);
        }
        events
    }

    fn initialization_pass(&mut self, current: BTreeMap<FlowKey, ConnectionEntry>) -> Vec<FlowRecord> {
        let mut events = Vec::new();
        for (key, entry) in current {
            if entry.status != TcpStatus::Established {
                continue;
            }
            let (experiment, activity) = self.assign_identifiers();
            let announced = self.mode == TrackerMode::AnnouncePreexisting;
            if announced {
                events.push(
                    FlowRecord::ongoing(key, experiment.clone(), activity.clone())
                        .with_stats(entry.stats.clone()),
                );
            }
            self.tracked.insert(
                key,
                TrackedConnection {
                    status: entry.status,
                    start_time: None,
                    end_time: None,
                    announced,
                    experiment,
                    activity,
                    stats: entry.stats,
                },
            );
        }
        info!(
            "Tracker initialised with {} existing connections",
            self.tracked.len()
        );
        events
    }

    fn steady_state(
        &mut self,
        current: BTreeMap<FlowKey, ConnectionEntry>,
        now: DateTime<Utc>,
    ) -> Vec<FlowRecord> {
        let mut events = Vec::new();

        for (key, entry) in &current {
            if !self.tracked.contains_key(key) {
                if entry.status != TcpStatus::Established {
                    continue;
                }
                let (experiment, activity) = self.assign_identifiers();
                events.push(
                    FlowRecord::start(*key, experiment.clone(), activity.clone(), now)
                        .with_stats(entry.stats.clone()),
                );
                self.tracked.insert(
                    *key,
                    TrackedConnection {
                        status: entry.status,
                        start_time: Some(now),
                        end_time: None,
                        announced: false,
                        experiment,
                        activity,
                        stats: entry.stats.clone(),
                    },
                );
                continue;
            }

            if let Some(conn) = self.tracked.get_mut(key) {
                if conn.status != entry.status {
                    debug!("{}: {} -> {}", key, conn.status, entry.status);
                    conn.status = entry.status;
                }
                if entry.stats.is_some() {
                    conn.stats = entry.stats.clone();
                }
                if entry.status.is_terminal() && conn.end_time.is_none() && conn.reported() {
                    conn.end_time = Some(now);
                    events.push(end_record(key, conn, now));
                }
            }
        }

        // Closed and reaped between polls without a terminal state observed
        let vanished: Vec<FlowKey> = self
            .tracked
            .keys()
            .filter(|key| !current.contains_key(key))
            .copied()
            .collect();
        let mut vanished_events = Vec::new();
        for key in vanished {
            if let Some(conn) = self.tracked.remove(&key) {
                if conn.reported() && conn.end_time.is_none() {
                    vanished_events.push(end_record(&key, &conn, now));
                }
            }
        }
        vanished_events.sort_by(|a, b| a.key().cmp(b.key()));
        events.extend(vanished_events);
        events
    }

    fn count(&self, record: &FlowRecord) {
        if let Some(metrics) = &self.metrics {
            match record.state() {
                FlowState::Start => metrics.inc_flows_started(),
                FlowState::End => metrics.inc_flows_ended(),
                FlowState::Ongoing => metrics.inc_flows_ongoing(),
                FlowState::Update => {}
            }
        }
    }

    /// Poll `source` every `interval` until `cancel` fires, publishing every
    /// event on `bus`. A failed snapshot leaves the tracked set untouched.
    pub async fn run<S: SnapshotSource>(
        mut self,
        mut source: S,
        bus: EventBus,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        info!(
            "Tracker started: source={}, interval={:?}, mode={:?}",
            source.name(),
            interval,
            self.mode
        );
        while !cancel.is_cancelled() {
            let polled = tokio::select! {
                _ = cancel.cancelled() => break,
                polled = source.poll() => polled,
            };
            match polled {
                Ok(snapshot) => {
                    for record in self.apply(snapshot, Utc::now()) {
                        debug!("--> {}", record);
                        self.count(&record);
                        bus.publish(record);
                    }
                }
                Err(e) => {
                    warn!("{} snapshot failed: {}", source.name(), e);
                    if let Some(metrics) = &self.metrics {
                        metrics.inc_snapshot_failures();
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!(
            "Tracker stopped with {} connections tracked",
            self.tracked.len()
        );
    }
}

fn end_record(key: &FlowKey, conn: &TrackedConnection, now: DateTime<Utc>) -> FlowRecord {
    FlowRecord::end(
        *key,
        conn.experiment.clone(),
        conn.activity.clone(),
        conn.start_time,
        now,
    )
    .with_stats(conn.stats.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::VecDeque;

    fn key(src_port: u16) -> FlowKey {
        FlowKey::tcp(
            format!("10.0.0.5:{}", src_port).parse().unwrap(),
            "203.0.113.7:443".parse().unwrap(),
        )
    }

    fn entry(src_port: u16, status: TcpStatus) -> ConnectionEntry {
        ConnectionEntry::new(key(src_port), status)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn static_tracker(mode: TrackerMode) -> ConnectionTracker {
        ConnectionTracker::new(
            InternalNetworks::default(),
            mode,
            IdentifierPolicy::Static {
                experiment: Identifier::Id(16),
                activity: Some(Identifier::Id(14)),
            },
        )
    }

    #[test]
    fn test_preexisting_connection_is_silent() {
        let mut tracker = static_tracker(TrackerMode::Strict);
        let snap = vec![entry(51000, TcpStatus::Established)];

        assert!(tracker.apply(snap.clone(), at(0)).is_empty());
        assert_eq!(tracker.tracked_len(), 1);
        assert!(tracker.apply(snap, at(30)).is_empty());
        // Vanishes without ever having started
        assert!(tracker.apply(vec![], at(60)).is_empty());
        assert_eq!(tracker.tracked_len(), 0);
    }

    #[test]
    fn test_start_then_end() {
        let mut tracker = static_tracker(TrackerMode::Strict);
        assert!(tracker.apply(vec![], at(0)).is_empty());

        let events = tracker.apply(vec![entry(51001, TcpStatus::Established)], at(30));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].state(), FlowState::Start);
        assert_eq!(events[0].start_time(), Some(at(30)));
        assert_eq!(events[0].end_time(), None);
        assert_eq!(events[0].experiment(), &Identifier::Id(16));

        let events = tracker.apply(vec![entry(51001, TcpStatus::TimeWait)], at(60));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].state(), FlowState::End);
        assert_eq!(events[0].start_time(), Some(at(30)));
        assert_eq!(events[0].end_time(), Some(at(60)));

        assert!(tracker
            .apply(vec![entry(51001, TcpStatus::TimeWait)], at(90))
            .is_empty());
        // Reaped after the end was already reported
        assert!(tracker.apply(vec![], at(120)).is_empty());
        assert_eq!(tracker.tracked_len(), 0);
    }

    #[test]
    fn test_vanished_connection_gets_synthesized_end() {
        let mut tracker = static_tracker(TrackerMode::Strict);
        tracker.apply(vec![], at(0));
        tracker.apply(vec![entry(51002, TcpStatus::Established)], at(30));

        let events = tracker.apply(vec![], at(60));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].state(), FlowState::End);
        assert_eq!(events[0].end_time(), Some(at(60)));
        assert_eq!(tracker.tracked_len(), 0);
    }

    #[test]
    fn test_idempotent_on_unchanged_snapshot() {
        let mut tracker = static_tracker(TrackerMode::Strict);
        tracker.apply(vec![], at(0));
        let snap = vec![
            entry(51000, TcpStatus::Established),
            entry(51001, TcpStatus::Established),
        ];
        assert_eq!(tracker.apply(snap.clone(), at(30)).len(), 2);
        for i in 2..10 {
            assert!(tracker.apply(snap.clone(), at(30 * i)).is_empty());
        }
    }

    #[test]
    fn test_non_established_new_connection_is_ignored() {
        let mut tracker = static_tracker(TrackerMode::Strict);
        tracker.apply(vec![], at(0));
        assert!(tracker
            .apply(vec![entry(51003, TcpStatus::SynSent)], at(30))
            .is_empty());
        assert!(tracker
            .apply(vec![entry(51003, TcpStatus::TimeWait)], at(60))
            .is_empty());
        assert_eq!(tracker.tracked_len(), 0);
    }

    #[test]
    fn test_filters_listen_and_internal() {
        let internal = InternalNetworks::parse(&["198.51.100.0/24"]).unwrap();
        let mut tracker = ConnectionTracker::new(
            internal,
            TrackerMode::Strict,
            IdentifierPolicy::Static {
                experiment: Identifier::Id(1),
                activity: None,
            },
        );
        tracker.apply(vec![], at(0));

        let private = ConnectionEntry::new(
            FlowKey::tcp(
                "10.0.0.5:40000".parse().unwrap(),
                "192.168.1.10:443".parse().unwrap(),
            ),
            TcpStatus::Established,
        );
        let configured = ConnectionEntry::new(
            FlowKey::tcp(
                "10.0.0.5:40001".parse().unwrap(),
                "198.51.100.9:443".parse().unwrap(),
            ),
            TcpStatus::Established,
        );
        let listen = entry(22, TcpStatus::Listen);
        let events = tracker.apply(vec![private, configured, listen], at(30));
        assert!(events.is_empty());
        assert_eq!(tracker.tracked_len(), 0);
    }

    #[test]
    fn test_announce_preexisting() {
        let mut tracker = static_tracker(TrackerMode::AnnouncePreexisting);
        let snap = vec![
            entry(51000, TcpStatus::Established),
            entry(51001, TcpStatus::TimeWait),
        ];
        let events = tracker.apply(snap.clone(), at(0));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].state(), FlowState::Ongoing);
        assert_eq!(events[0].start_time(), None);

        // Never a start for the announced connection
        assert!(tracker.apply(snap, at(30)).is_empty());

        let events = tracker.apply(vec![entry(51000, TcpStatus::CloseWait)], at(60));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].state(), FlowState::End);
        assert_eq!(events[0].start_time(), None);
        assert!(tracker.apply(vec![], at(90)).is_empty());
    }

    #[test]
    fn test_pool_identifiers_held_for_lifetime() {
        let mut tracker = ConnectionTracker::new(
            InternalNetworks::default(),
            TrackerMode::Strict,
            IdentifierPolicy::pool(DEFAULT_IDENTIFIER_POOL.to_vec()).unwrap(),
        )
        .with_seed(7);
        tracker.apply(vec![], at(0));

        let ports: Vec<u16> = (52000..52020).collect();
        let snap: Vec<_> = ports
            .iter()
            .map(|p| entry(*p, TcpStatus::Established))
            .collect();
        let starts = tracker.apply(snap, at(30));
        assert_eq!(starts.len(), ports.len());
        let ends = tracker.apply(vec![], at(60));
        assert_eq!(ends.len(), ports.len());

        for (start, end) in starts.iter().zip(ends.iter()) {
            assert_eq!(start.key(), end.key());
            assert_eq!(start.experiment(), end.experiment());
            assert_eq!(start.activity(), end.activity());
            let pair = match (start.experiment(), start.activity()) {
                (Identifier::Id(e), Some(Identifier::Id(a))) => (*e, *a),
                other => panic!("unexpected identifiers {:?}", other),
            };
            assert!(DEFAULT_IDENTIFIER_POOL.contains(&pair));
        }

        assert!(IdentifierPolicy::pool(vec![]).is_err());
    }

    #[test]
    fn test_identifier_pool_rejects_empty_and_draws_members() {
        assert!(IdentifierPool::new(Vec::new()).is_err());

        let pool = IdentifierPool::new(vec![(3, 4)]).unwrap();
        assert_eq!(pool.pairs(), &[(3, 4)]);
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..8 {
            assert_eq!(pool.draw(&mut rng), (3, 4));
        }
    }

    #[test]
    fn test_timestamps_never_go_backwards() {
        let mut tracker = static_tracker(TrackerMode::Strict);
        tracker.apply(vec![], at(100));
        let start = tracker.apply(vec![entry(51004, TcpStatus::Established)], at(50));
        assert_eq!(start[0].start_time(), Some(at(100)));
        let end = tracker.apply(vec![entry(51004, TcpStatus::Close)], at(10));
        assert_eq!(end[0].end_time(), Some(at(100)));
    }

    #[test]
    fn test_stats_refreshed_and_attached() {
        let mut tracker = static_tracker(TrackerMode::Strict);
        tracker.apply(vec![], at(0));

        let with_rtt = |rtt: f64, status| {
            entry(51005, status).with_stats(TcpStats {
                rtt: Some(rtt),
                ..Default::default()
            })
        };
        let start = tracker.apply(vec![with_rtt(1.0, TcpStatus::Established)], at(30));
        assert_eq!(start[0].extended_stats().unwrap().rtt, Some(1.0));

        tracker.apply(vec![with_rtt(2.0, TcpStatus::Established)], at(60));
        let end = tracker.apply(vec![], at(90));
        assert_eq!(end[0].extended_stats().unwrap().rtt, Some(2.0));
    }

    /// Snapshots served from a script; `None` simulates a failed query.
    struct ScriptedSource(VecDeque<Option<Vec<ConnectionEntry>>>);

    #[async_trait]
    impl SnapshotSource for ScriptedSource {
        async fn poll(&mut self) -> FlowResult<Vec<ConnectionEntry>> {
            match self.0.pop_front() {
                Some(Some(snap)) => Ok(snap),
                Some(None) => Err(FlowError::TransientQuery("scripted failure".into())),
                None => Ok(Vec::new()),
            }
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    #[tokio::test]
    async fn test_run_publishes_and_survives_failures() {
        let bus = EventBus::new();
        let mut sub = bus.register();
        let metrics = Metrics::new();
        let cancel = CancellationToken::new();

        let open = vec![entry(51006, TcpStatus::Established)];
        let source = ScriptedSource(VecDeque::from(vec![
            Some(vec![]),
            Some(open.clone()),
            None,
            Some(open.clone()),
            Some(vec![entry(51006, TcpStatus::FinWait1)]),
        ]));

        let tracker = static_tracker(TrackerMode::Strict).with_metrics(Arc::clone(&metrics));
        let handle = tokio::spawn(tracker.run(
            source,
            bus.clone(),
            Duration::from_millis(1),
            cancel.clone(),
        ));

        let start = sub.recv().await.unwrap();
        assert_eq!(start.state(), FlowState::Start);
        let end = sub.recv().await.unwrap();
        assert_eq!(end.state(), FlowState::End);
        assert_eq!(end.key(), start.key());

        cancel.cancel();
        handle.await.unwrap();
        assert!(sub.try_recv().is_none());
        assert_eq!(
            metrics
                .snapshot_failures
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
        assert_eq!(
            metrics.flows_started.load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }
}
