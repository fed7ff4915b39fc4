//! The `AlcubVolume` custom resource: one record per provisioned volume.
//!
//! The resource is cluster scoped and its schema is installed from
//! `deploy/alcubvolume-crd.yaml`. Status is a plain field (no status
//! subresource), so a single replace persists spec and status together.

use kube::{CustomResource, ResourceExt};
use serde::{Deserialize, Serialize};

/// Finalizer guarding a record until its attachment fields are cleared.
pub const VOLUME_FINALIZER: &str = "alcub.csi.io/volume-protection";

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[kube(
    group = "alcub.csi.io",
    version = "v1beta1",
    kind = "AlcubVolume",
    plural = "alcubvolumes",
    status = "AlcubVolumeStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct AlcubVolumeSpec {
    /// Volume id handed to the container orchestrator. Never changes.
    pub uuid: String,
    /// Requested size in bytes.
    pub capacity: i64,
    /// StorageClass the backend parameters were resolved from.
    pub storage_class: String,
    pub pool: String,
    pub image: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlcubVolumeStatus {
    /// Node currently holding the device, empty when detached.
    pub node: String,
    /// Node that held the device before the last hand-off.
    pub prev_node: String,
    pub device_path: String,
    pub storage_ip: String,
    /// Backend endpoints of the attaching node's cluster, in failover order.
    pub peer_nodes: Vec<String>,
}

impl AlcubVolumeStatus {
    pub fn is_detached(&self) -> bool {
        self.node.is_empty() && self.prev_node.is_empty() && self.device_path.is_empty()
    }
}

impl AlcubVolume {
    pub fn with_spec(name: &str, spec: AlcubVolumeSpec) -> Self {
        let mut volume = AlcubVolume::new(name, spec);
        volume.metadata.finalizers = Some(vec![VOLUME_FINALIZER.to_string()]);
        volume
    }

    /// Status with defaults filled in.
    pub fn current_status(&self) -> AlcubVolumeStatus {
        self.status.clone().unwrap_or_default()
    }

    pub fn current_node(&self) -> &str {
        self.status.as_ref().map(|s| s.node.as_str()).unwrap_or_default()
    }

    /// A record may be removed only once nothing references its device.
    pub fn is_deletable(&self) -> bool {
        self.status.as_ref().is_none_or(AlcubVolumeStatus::is_detached)
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == VOLUME_FINALIZER)
    }
}
