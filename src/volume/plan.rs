//! Pure reconciliation decisions for `AlcubVolume` records.

use crate::crd::AlcubVolume;
use kube::ResourceExt;
use std::net::IpAddr;
use tracing::warn;

/// Cached attachment facts about a node, learned from the records it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub storage_ip: IpAddr,
    pub peer_nodes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryMutation {
    /// Drop the volume-protection finalizer so a pending delete completes.
    ReleaseFinalizer,
    BindUuid { uuid: String, name: String },
    /// Forget `uuid` if it is still bound to `name`.
    ReleaseUuid { uuid: String, name: String },
    RecordNode { node: String, info: NodeInfo },
}

/// Decide what a single observed record means for the registry.
///
/// `known` is the cache entry currently held for the record's node, if any.
pub fn plan(record: &AlcubVolume, known: Option<&NodeInfo>) -> Vec<RegistryMutation> {
    if record.is_deleting() {
        if !record.is_deletable() {
            return Vec::new();
        }
        let mut mutations = Vec::new();
        if record.has_finalizer() {
            mutations.push(RegistryMutation::ReleaseFinalizer);
        }
        if !record.spec.uuid.is_empty() {
            mutations.push(RegistryMutation::ReleaseUuid {
                uuid: record.spec.uuid.clone(),
                name: record.name_any(),
            });
        }
        return mutations;
    }

    let mut mutations = Vec::new();
    if !record.spec.uuid.is_empty() {
        mutations.push(RegistryMutation::BindUuid {
            uuid: record.spec.uuid.clone(),
            name: record.name_any(),
        });
    }

    let status = record.current_status();
    if status.node.is_empty() || status.storage_ip.is_empty() {
        return mutations;
    }
    let storage_ip = match status.storage_ip.parse::<IpAddr>() {
        Ok(ip) => ip,
        Err(e) => {
            warn!("Record {} has unparseable storage ip {:?}: {}", record.name_any(), status.storage_ip, e);
            return mutations;
        }
    };
    let info = NodeInfo { storage_ip, peer_nodes: status.peer_nodes };
    if known != Some(&info) {
        mutations.push(RegistryMutation::RecordNode { node: status.node, info });
    }
    mutations
}
