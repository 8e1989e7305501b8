//! In-process fan-out of flow records.
//!
//! ## Design
//! - One unbounded channel per subscriber, created by [`EventBus::register`]
//! - [`EventBus::publish`] clones the record into every channel registered
//!   at that moment; later registrations never see earlier records
//! - Per-subscriber order equals publish order (FIFO channels)
//! - Subscribers that dropped their [`Subscription`] are pruned on publish
//!
//! Backends must register before the producer starts, otherwise they miss
//! whatever was published in between.

use crate::flow::FlowRecord;
use log::{debug, warn};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

#[derive(Default)]
struct BusInner {
    subscribers: Vec<(u64, UnboundedSender<FlowRecord>)>,
    next_id: u64,
    closed: bool,
}

/// Cloneable handle to the shared bus.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        // A panic while holding the lock leaves the subscriber list intact
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create a new subscription. On a closed bus the subscription is
    /// returned already closed.
    pub fn register(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        if !inner.closed {
            inner.subscribers.push((id, tx));
        }
        debug!("Bus: registered subscriber {}", id);
        Subscription { id, rx }
    }

    /// Deliver `record` to every current subscriber. Returns how many
    /// subscribers received it.
    pub fn publish(&self, record: FlowRecord) -> usize {
        let mut inner = self.lock();
        if inner.closed {
            warn!("Bus closed, dropping {}", record);
            return 0;
        }
        inner.subscribers.retain(|(id, tx)| {
            let alive = tx.send(record.clone()).is_ok();
            if !alive {
                debug!("Bus: subscriber {} went away", id);
            }
            alive
        });
        inner.subscribers.len()
    }

    /// Stop delivery and close every subscription. Records already queued
    /// stay readable until each subscriber observes the close. Safe to call
    /// more than once.
    pub fn close(&self) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        let count = inner.subscribers.len();
        inner.subscribers.clear();
        debug!("Bus: closed {} subscriptions", count);
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

/// Outcome of a bounded wait on a subscription
#[derive(Debug)]
pub enum Recv {
    Record(FlowRecord),
    /// Nothing arrived before the timeout
    Idle,
    /// Bus closed and the queue is empty
    Closed,
}

/// Private receiving end owned by one backend.
pub struct Subscription {
    id: u64,
    rx: UnboundedReceiver<FlowRecord>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<FlowRecord> {
        self.rx.recv().await
    }

    /// Wait up to `timeout` for the next record.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Recv {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(record)) => Recv::Record(record),
            Ok(None) => Recv::Closed,
            Err(_) => Recv::Idle,
        }
    }

    pub fn try_recv(&mut self) -> Option<FlowRecord> {
        self.rx.try_recv().ok()
    }

    /// Discard whatever is queued without waiting. Each dropped record is
    /// logged so it can be reconstructed.
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        loop {
            match self.rx.try_recv() {
                Ok(record) => {
                    debug!("Subscriber {} discarding {}", self.id, record);
                    drained += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        self.rx.close();
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowKey, Identifier};
    use chrono::Utc;

    fn record(port: u16) -> FlowRecord {
        let key = FlowKey::tcp(
            format!("10.0.0.5:{}", port).parse().unwrap(),
            "[2001:db8::1]:443".parse().unwrap(),
        );
        FlowRecord::start(key, Identifier::Id(1), None, Utc::now())
    }

    #[tokio::test]
    async fn test_fan_out_in_order() {
        let bus = EventBus::new();
        let mut subs: Vec<_> = (0..3).map(|_| bus.register()).collect();

        let first = record(51000);
        let second = record(51001);
        assert_eq!(bus.publish(first.clone()), 3);
        assert_eq!(bus.publish(second.clone()), 3);

        for sub in subs.iter_mut() {
            assert_eq!(sub.recv().await, Some(first.clone()));
            assert_eq!(sub.recv().await, Some(second.clone()));
            assert!(sub.try_recv().is_none());
        }
    }

    #[tokio::test]
    async fn test_late_registration_misses_earlier_records() {
        let bus = EventBus::new();
        let mut early = bus.register();
        bus.publish(record(51000));

        let mut late = bus.register();
        bus.publish(record(51001));

        assert_eq!(early.recv().await.unwrap().key().src_port, 51000);
        assert_eq!(early.recv().await.unwrap().key().src_port, 51001);
        assert_eq!(late.recv().await.unwrap().key().src_port, 51001);
        assert!(late.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let bus = EventBus::new();
        let mut keep = bus.register();
        let gone = bus.register();
        drop(gone);

        assert_eq!(bus.publish(record(51000)), 1);
        assert_eq!(bus.subscriber_count(), 1);
        assert!(keep.try_recv().is_some());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let bus = EventBus::new();
        let mut sub = bus.register();
        bus.publish(record(51000));

        bus.close();
        bus.close();
        assert!(bus.is_closed());
        assert_eq!(bus.publish(record(51001)), 0);

        // Queued record is still delivered, then the close is observed
        assert!(matches!(
            sub.recv_timeout(Duration::from_millis(50)).await,
            Recv::Record(_)
        ));
        assert!(matches!(
            sub.recv_timeout(Duration::from_millis(50)).await,
            Recv::Closed
        ));

        let mut after = bus.register();
        assert!(after.recv().await.is_none());
        assert_eq!(after.drain(), 0);
    }

    #[tokio::test]
    async fn test_idle_and_drain() {
        let bus = EventBus::new();
        let mut sub = bus.register();
        assert!(matches!(
            sub.recv_timeout(Duration::from_millis(10)).await,
            Recv::Idle
        ));

        bus.publish(record(51000));
        bus.publish(record(51001));
        assert_eq!(sub.drain(), 2);
        assert_eq!(sub.drain(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_publisher() {
        let bus = EventBus::new();
        let mut sub = bus.register();
        let producer = bus.clone();
        let handle = tokio::spawn(async move {
            for port in 0..100u16 {
                producer.publish(record(40000 + port));
            }
        });
        for port in 0..100u16 {
            assert_eq!(sub.recv().await.unwrap().key().src_port, 40000 + port);
        }
        handle.await.unwrap();
    }
}
