//! tc classifier marking table (Linux).
//!
//! ## Design
//! - The classifier object is loaded from disk with aya
//! - One egress attachment per interface, behind a clsact qdisc
//! - Stale attachments left by a previous run are removed first
//! - Detached on every exit path: explicit `detach_all` and on drop

use super::flowlabel::MarkingTable;
use crate::error::{FlowError, FlowResult};
use crate::net::parse_if_inet6;
use anyhow::{Context, Result};
use aya::maps::{HashMap, MapData};
use aya::programs::tc::{self, SchedClassifierLinkId};
use aya::programs::{SchedClassifier, TcAttachType};
use aya::Ebpf;
use flowd_common::{FourTuple, CLASSIFIER_NAME, FLOW_LABEL_MAP, TO_BE_DELETED_MAP};
use log::{debug, info, warn};
use std::path::Path;

/// Interfaces carrying a global IPv6 address.
pub fn detect_interfaces() -> Result<Vec<String>> {
    let content = std::fs::read_to_string("/proc/net/if_inet6")
        .context("Failed to read /proc/net/if_inet6")?;
    Ok(parse_if_inet6(&content))
}

/// Marking table backed by the classifier's BPF maps.
pub struct TcMarkingTable {
    ebpf: Ebpf,
    labels: HashMap<MapData, FourTuple, u32>,
    to_be_deleted: HashMap<MapData, FourTuple, u32>,
    links: Vec<(String, SchedClassifierLinkId)>,
}

impl TcMarkingTable {
    /// Load the classifier from `object` and attach it to `interfaces`.
    pub fn load(object: &Path, interfaces: &[String]) -> Result<Self> {
        if interfaces.is_empty() {
            anyhow::bail!("No interface to attach the flow label classifier to");
        }

        info!("Loading flow label classifier from {:?}", object);
        let mut ebpf = Ebpf::load_file(object)
            .with_context(|| format!("Failed to load eBPF object {:?}", object))?;

        let labels = ebpf
            .take_map(FLOW_LABEL_MAP)
            .with_context(|| format!("{} map not found", FLOW_LABEL_MAP))?;
        let labels = HashMap::try_from(labels).context("Failed to open flow label map")?;
        let to_be_deleted = ebpf
            .take_map(TO_BE_DELETED_MAP)
            .with_context(|| format!("{} map not found", TO_BE_DELETED_MAP))?;
        let to_be_deleted =
            HashMap::try_from(to_be_deleted).context("Failed to open deletion map")?;

        let program: &mut SchedClassifier = ebpf
            .program_mut(CLASSIFIER_NAME)
            .with_context(|| format!("{} program not found", CLASSIFIER_NAME))?
            .try_into()
            .context("Failed to cast to tc classifier")?;
        program
            .load()
            .context("Failed to load classifier into kernel")?;

        let mut links = Vec::with_capacity(interfaces.len());
        for iface in interfaces {
            // Already present when another program or a previous run uses it
            if let Err(e) = tc::qdisc_add_clsact(iface) {
                debug!("clsact on {}: {}", iface, e);
            }
            if tc::qdisc_detach_program(iface, TcAttachType::Egress, CLASSIFIER_NAME).is_ok() {
                warn!("Removed stale flow label classifier from {}", iface);
            }
            match program.attach(iface, TcAttachType::Egress) {
                Ok(link) => {
                    info!("Flow label classifier attached to {} (egress)", iface);
                    links.push((iface.clone(), link));
                }
                Err(e) => {
                    // Undo what was attached so far before giving up
                    for (attached, link) in links.drain(..) {
                        if let Err(e) = program.detach(link) {
                            warn!("Failed to detach classifier from {}: {}", attached, e);
                        }
                    }
                    return Err(e).with_context(|| format!("Failed to attach classifier to {}", iface));
                }
            }
        }

        Ok(Self {
            ebpf,
            labels,
            to_be_deleted,
            links,
        })
    }

    pub fn attached_interfaces(&self) -> Vec<&str> {
        self.links.iter().map(|(iface, _)| iface.as_str()).collect()
    }
}

impl MarkingTable for TcMarkingTable {
    fn insert(&mut self, key: FourTuple, label: u32) -> FlowResult<()> {
        // A reused tuple may still be flagged from its previous flow
        let _ = self.to_be_deleted.remove(&key);
        self.labels
            .insert(key, label, 0)
            .map_err(|e| FlowError::Delivery(format!("flow label map insert: {}", e)))
    }

    fn mark_for_deletion(&mut self, key: FourTuple) -> FlowResult<()> {
        self.to_be_deleted
            .insert(key, 1, 0)
            .map_err(|e| FlowError::Delivery(format!("deletion map insert: {}", e)))
    }

    fn detach_all(&mut self) {
        if self.links.is_empty() {
            return;
        }
        let program: Option<&mut SchedClassifier> = self
            .ebpf
            .program_mut(CLASSIFIER_NAME)
            .and_then(|p| p.try_into().ok());
        let Some(program) = program else {
            warn!("{} program missing, cannot detach", CLASSIFIER_NAME);
            self.links.clear();
            return;
        };
        for (iface, link) in self.links.drain(..) {
            match program.detach(link) {
                Ok(()) => info!("Flow label classifier detached from {}", iface),
                Err(e) => warn!("Failed to detach classifier from {}: {}", iface, e),
            }
        }
    }
}

impl Drop for TcMarkingTable {
    fn drop(&mut self) {
        self.detach_all();
    }
}
