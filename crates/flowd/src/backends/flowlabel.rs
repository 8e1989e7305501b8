//! IPv6 flow-label marking.
//!
//! ## Label layout (20 bits, most significant first)
//! ```text
//!  19 18 | 17 ............ 9 | 8 | 7 ....... 2 | 1 0
//!  rand  | experiment (rev.) | r | activity    | rand
//! ```
//! The experiment id is stored bit-reversed: bit 0 of the id lands in
//! bit 17 of the label and bit 8 in bit 9. The five random bits spread
//! flows over ECMP paths.
//!
//! The encoder keeps a marking table keyed by (dst hi64, dst lo64, dport,
//! sport). Entries are added on `start` and flagged for deletion on `end`;
//! the classifier removes flagged entries when it next sees a matching
//! packet.

use super::RECV_TIMEOUT;
use crate::bus::{Recv, Subscription};
use crate::error::{FlowError, FlowResult};
use crate::flow::{FlowRecord, FlowState};
use crate::metrics::Metrics;
use crate::registry::{Registry, MAX_ACTIVITY_ID, MAX_EXPERIMENT_ID};
use flowd_common::{FourTuple, FLOW_LABEL_MASK};
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const EXPERIMENT_BITS: u32 = 9;
const EXPERIMENT_SHIFT: u32 = 9;
const ACTIVITY_SHIFT: u32 = 2;

/// Pack identifiers and five bits of entropy into a flow label.
///
/// Entropy bits 4..3 fill label bits 19..18, bit 2 fills label bit 8 and
/// bits 1..0 fill label bits 1..0.
pub fn pack_flow_label(experiment: u16, activity: u8, entropy: u8) -> FlowResult<u32> {
    if u32::from(experiment) > MAX_EXPERIMENT_ID {
        return Err(FlowError::experiment(experiment));
    }
    if u32::from(activity) > MAX_ACTIVITY_ID {
        return Err(FlowError::activity(activity));
    }
    let entropy = u32::from(entropy);
    let reversed = u32::from(experiment).reverse_bits() >> (32 - EXPERIMENT_BITS);

    let label = ((entropy >> 3) & 0b11) << 18
        | reversed << EXPERIMENT_SHIFT
        | ((entropy >> 2) & 0b1) << 8
        | u32::from(activity) << ACTIVITY_SHIFT
        | (entropy & 0b11);
    Ok(label & FLOW_LABEL_MASK)
}

/// Pack with random entropy.
pub fn flow_label<R: Rng>(experiment: u16, activity: u8, rng: &mut R) -> FlowResult<u32> {
    pack_flow_label(experiment, activity, rng.gen::<u8>() & 0x1F)
}

/// Recover the experiment id from label bits 17..9
pub fn experiment_from_label(label: u32) -> u16 {
    let field = (label >> EXPERIMENT_SHIFT) & 0x1FF;
    (field.reverse_bits() >> (32 - EXPERIMENT_BITS)) as u16
}

/// Recover the activity id from label bits 7..2
pub fn activity_from_label(label: u32) -> u8 {
    ((label >> ACTIVITY_SHIFT) & 0x3F) as u8
}

/// Marking-table key for a record. Only IPv6 destinations can be marked.
pub fn marking_key(record: &FlowRecord) -> FlowResult<FourTuple> {
    let key = record.key();
    match key.dst_ip {
        IpAddr::V6(dst) => Ok(FourTuple::from_octets(
            dst.octets(),
            key.dst_port,
            key.src_port,
        )),
        IpAddr::V4(_) => Err(FlowError::MalformedInput(format!(
            "flow label needs an IPv6 destination: {}",
            record
        ))),
    }
}

// ============================================================================
// Marking table
// ============================================================================

/// The classifier's lookup table plus its attachment to interfaces.
pub trait MarkingTable: Send {
    fn insert(&mut self, key: FourTuple, label: u32) -> FlowResult<()>;

    /// Flag `key`; the classifier drops it on the next matching packet.
    fn mark_for_deletion(&mut self, key: FourTuple) -> FlowResult<()>;

    /// Remove the classifier from every interface. Must be idempotent.
    fn detach_all(&mut self);
}

/// Table held in process memory. Mirrors the classifier's two-phase delete.
#[derive(Debug, Default)]
pub struct MemoryMarkingTable {
    labels: HashMap<FourTuple, u32>,
    to_be_deleted: HashSet<FourTuple>,
    attached: bool,
}

impl MemoryMarkingTable {
    pub fn new() -> Self {
        Self {
            attached: true,
            ..Default::default()
        }
    }

    pub fn label(&self, key: &FourTuple) -> Option<u32> {
        self.labels.get(key).copied()
    }

    pub fn is_pending_deletion(&self, key: &FourTuple) -> bool {
        self.to_be_deleted.contains(key)
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// What the classifier does for a packet matching `key`.
    pub fn packet(&mut self, key: &FourTuple) -> Option<u32> {
        if self.to_be_deleted.remove(key) {
            self.labels.remove(key);
            return None;
        }
        self.label(key)
    }
}

impl MarkingTable for MemoryMarkingTable {
    fn insert(&mut self, key: FourTuple, label: u32) -> FlowResult<()> {
        self.to_be_deleted.remove(&key);
        self.labels.insert(key, label);
        Ok(())
    }

    fn mark_for_deletion(&mut self, key: FourTuple) -> FlowResult<()> {
        self.to_be_deleted.insert(key);
        Ok(())
    }

    fn detach_all(&mut self) {
        self.attached = false;
    }
}

// ============================================================================
// Encoder
// ============================================================================

/// Consumes flow records and programs the marking table.
pub struct FlowLabelEncoder<T: MarkingTable> {
    table: T,
    registry: Arc<Registry>,
    /// Keys this encoder labelled and has not yet released
    installed: HashSet<FourTuple>,
    rng: StdRng,
    metrics: Option<Arc<Metrics>>,
}

impl<T: MarkingTable> FlowLabelEncoder<T> {
    pub fn new(table: T, registry: Arc<Registry>) -> Self {
        Self {
            table,
            registry,
            installed: HashSet::new(),
            rng: StdRng::from_entropy(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn table(&self) -> &T {
        &self.table
    }

    /// Apply one record. An identifier that cannot be resolved deprograms
    /// the classifier before the error is returned.
    pub fn handle(&mut self, record: &FlowRecord) -> FlowResult<()> {
        match record.state() {
            FlowState::Start => {
                let key = marking_key(record)?;
                let (exp, act) = match self.registry.resolve(record) {
                    Ok(ids) => ids,
                    Err(e) => {
                        error!("Unable to resolve identifiers for {}: {}", record, e);
                        self.table.detach_all();
                        return Err(e);
                    }
                };
                let label = flow_label(exp, act, &mut self.rng)?;
                self.table.insert(key, label)?;
                self.installed.insert(key);
                debug!("Flow label {:#07x} set for {}", label, record);
                if let Some(metrics) = &self.metrics {
                    metrics.inc_labels_installed();
                }
            }
            FlowState::End => {
                let key = marking_key(record)?;
                // Unmatched flags would never be cleared by the classifier
                if !self.installed.contains(&key) {
                    debug!("No flow label installed for {}", record);
                    return Ok(());
                }
                self.table.mark_for_deletion(key)?;
                self.installed.remove(&key);
                debug!("Flow label released for {}", record);
                if let Some(metrics) = &self.metrics {
                    metrics.inc_labels_released();
                }
            }
            FlowState::Ongoing | FlowState::Update => {
                debug!("Ignoring {}", record);
            }
        }
        Ok(())
    }

    /// Consume `subscription` until cancelled or closed. The classifier is
    /// detached on every exit path.
    pub async fn run(
        mut self,
        mut subscription: Subscription,
        cancel: CancellationToken,
    ) -> FlowResult<()> {
        info!("Flow label backend started");
        let result = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }
            let record = match subscription.recv_timeout(RECV_TIMEOUT).await {
                Recv::Record(record) => record,
                Recv::Idle => continue,
                Recv::Closed => break Ok(()),
            };
            match self.handle(&record) {
                Ok(()) => {}
                Err(e) if e.is_fatal() => break Err(e),
                Err(e) => {
                    warn!("Skipping {}: {}", record, e);
                    if let (FlowError::MalformedInput(_), Some(metrics)) = (&e, &self.metrics) {
                        metrics.inc_malformed_records();
                    }
                }
            }
        };

        self.table.detach_all();
        let dropped = subscription.drain();
        info!("Flow label backend stopped ({} queued records dropped)", dropped);
        result
    }
}
