//! Point-in-time connection snapshots.
//!
//! A [`SnapshotSource`] lists the TCP connections currently known to the
//! operating system. Two sources exist:
//! - [`ProcNetSource`] reads `/proc/net/tcp` and `/proc/net/tcp6`
//! - [`SsSource`] runs `ss -tinH` and attaches per-connection statistics

mod procfs;
mod ss;

pub use procfs::{parse_proc_net, ProcNetSource};
pub use ss::{parse_ss, SsSource};

use crate::error::FlowResult;
use async_trait::async_trait;
use crate::flow::{FlowKey, TcpStats, TcpStatus};

/// One connection as reported by a snapshot source.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionEntry {
    pub key: FlowKey,
    pub status: TcpStatus,
    pub stats: Option<TcpStats>,
}

impl ConnectionEntry {
    pub fn new(key: FlowKey, status: TcpStatus) -> Self {
        Self {
            key,
            status,
            stats: None,
        }
    }

    pub fn with_stats(mut self, stats: TcpStats) -> Self {
        self.stats = Some(stats);
        self
    }
}

/// Anything that can list current connections.
///
/// Failures are reported as [`FlowError::TransientQuery`](crate::FlowError)
/// and retried by the caller on the next poll.
#[async_trait]
pub trait SnapshotSource: Send {
    async fn poll(&mut self) -> FlowResult<Vec<ConnectionEntry>>;

    /// Short name for logging
    fn name(&self) -> &'static str;
}

#[async_trait]
impl<S: SnapshotSource + ?Sized> SnapshotSource for Box<S> {
    async fn poll(&mut self) -> FlowResult<Vec<ConnectionEntry>> {
        (**self).poll().await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}
