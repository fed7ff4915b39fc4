//! Node-side attach/detach admission.
//!
//! A volume has at most one holder. Attach is split into an admission step
//! that talks to the backend ([`NodeAttachService::pre_mount_valid`]) and a
//! commit that persists the new holder with a compare-and-swap on the record
//! ([`NodeAttachService::commit_attach`]). Status is only written after the
//! backend call succeeded, and before anything is mounted.

mod holder;

pub use holder::{HolderHealth, NodeLabelHealth};
#[cfg(any(test, feature = "mockall"))]
pub use holder::MockHolderHealth;

use crate::backend::DeviceBackend;
use crate::crd::{AlcubVolume, AlcubVolumeStatus};
use crate::error::{Error, Result};
use crate::volume::VolumeRegistry;
use kube::ResourceExt;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Admission result for an attach; carries what the commit and the rollback need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachPlan {
    pub volume: String,
    pub pool: String,
    pub image: String,
    /// Holder observed at admission time, empty when the volume was free.
    pub holder: String,
    pub device_path: String,
    pub peer_nodes: Vec<String>,
    /// Status before this attach, restored by a rollback.
    pub previous: AlcubVolumeStatus,
}

#[derive(Debug)]
pub enum AttachOutcome {
    Attached,
    Failed(Error),
}

#[derive(Debug)]
pub struct AttachResult {
    pub outcome: AttachOutcome,
    pub device_path: String,
    pub needs_rollback: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetachPlan {
    Detach { volume: String, pool: String, image: String },
    /// Nothing holds the volume; a retried detach.
    AlreadyDetached,
}

pub struct NodeAttachService {
    node: String,
    storage_ip: IpAddr,
    registry: Arc<VolumeRegistry>,
    devices: Arc<dyn DeviceBackend>,
    holders: Arc<dyn HolderHealth>,
}

impl NodeAttachService {
    pub fn new(
        node: impl Into<String>,
        storage_ip: IpAddr,
        registry: Arc<VolumeRegistry>,
        devices: Arc<dyn DeviceBackend>,
        holders: Arc<dyn HolderHealth>,
    ) -> Self {
        Self { node: node.into(), storage_ip, registry, devices, holders }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn registry(&self) -> &Arc<VolumeRegistry> {
        &self.registry
    }

    pub async fn pre_mount_valid(&self, record: &AlcubVolume) -> Result<AttachPlan> {
        let name = record.name_any();
        let (pool, image) = (&record.spec.pool, &record.spec.image);
        if pool.is_empty() || image.is_empty() {
            return Err(Error::InvalidArgument(format!("volume {} has no backend image", name)));
        }

        if !self.devices.image_clean(&self.node, pool, image).await? {
            return Err(Error::NotReady(format!("image {}/{} is in transition", pool, image)));
        }

        let status = record.current_status();
        let holder = status.node.clone();
        if !holder.is_empty() && holder != self.node {
            if !self.holders.is_fenced(&holder).await? {
                return Err(Error::Occupied { volume: name, node: holder });
            }
            info!("Taking over volume {} from fenced node {}", name, holder);
        }

        let peer_nodes = self.devices.peer_urls(&self.node).await?;
        let device_path = self.devices.connect(&self.node, pool, image).await?;
        if device_path.is_empty() {
            return Err(Error::Backend(format!("connect of {}/{} returned no device", pool, image)));
        }
        debug!("Connected {}/{} at {}", pool, image, device_path);

        Ok(AttachPlan {
            volume: name,
            pool: pool.clone(),
            image: image.clone(),
            holder,
            device_path,
            peer_nodes,
            previous: status,
        })
    }

    /// Persist this node as the holder. A failed commit asks for a rollback.
    pub async fn commit_attach(&self, plan: &AttachPlan) -> AttachResult {
        let result = self
            .registry
            .update_with(&plan.volume, |record| {
                let mut status = record.current_status();
                if !status.node.is_empty() && status.node != plan.holder && status.node != self.node {
                    return Err(Error::Occupied { volume: plan.volume.clone(), node: status.node });
                }
                if !status.node.is_empty() && status.node != self.node {
                    status.prev_node = std::mem::take(&mut status.node);
                }
                status.node = self.node.clone();
                status.device_path = plan.device_path.clone();
                status.storage_ip = self.storage_ip.to_string();
                status.peer_nodes = plan.peer_nodes.clone();
                record.status = Some(status);
                Ok(())
            })
            .await;

        match result {
            Ok(_) => {
                info!("Volume {} attached to {} at {}", plan.volume, self.node, plan.device_path);
                AttachResult {
                    outcome: AttachOutcome::Attached,
                    device_path: plan.device_path.clone(),
                    needs_rollback: false,
                }
            }
            Err(e) => AttachResult {
                outcome: AttachOutcome::Failed(e),
                device_path: plan.device_path.clone(),
                needs_rollback: plan.holder != self.node,
            },
        }
    }

    /// Best-effort undo of an attach this node started.
    pub async fn rollback_attach(&self, plan: &AttachPlan) {
        if plan.holder == self.node {
            // Re-publish of a device already in use here.
            return;
        }
        if let Err(e) = self.devices.disconnect(&self.node, &plan.pool, &plan.image).await {
            warn!("Rollback disconnect of {}/{} failed: {}", plan.pool, plan.image, e);
        }
        let restored = self
            .registry
            .update_with(&plan.volume, |record| {
                let status = record.current_status();
                if status.node == self.node && status.device_path == plan.device_path {
                    record.status = Some(plan.previous.clone());
                }
                Ok(())
            })
            .await;
        if let Err(e) = restored {
            if !e.is_not_found() {
                warn!("Rollback of {} status failed: {}", plan.volume, e);
            }
        }
    }

    /// Admission, connect and commit in order; returns the device path.
    pub async fn attach(&self, record: &AlcubVolume) -> Result<String> {
        let plan = self.pre_mount_valid(record).await?;
        let result = self.commit_attach(&plan).await;
        if result.needs_rollback {
            self.rollback_attach(&plan).await;
        }
        match result.outcome {
            AttachOutcome::Attached => Ok(result.device_path),
            AttachOutcome::Failed(e) => Err(e),
        }
    }

    pub fn pre_unmount_valid(&self, record: &AlcubVolume) -> Result<DetachPlan> {
        let status = record.current_status();
        if status.node.is_empty() {
            return Ok(DetachPlan::AlreadyDetached);
        }
        if status.node != self.node {
            return Err(Error::Occupied { volume: record.name_any(), node: status.node });
        }
        Ok(DetachPlan::Detach {
            volume: record.name_any(),
            pool: record.spec.pool.clone(),
            image: record.spec.image.clone(),
        })
    }

    pub async fn commit_detach(&self, plan: &DetachPlan) -> Result<()> {
        let DetachPlan::Detach { volume, pool, image } = plan else {
            return Ok(());
        };
        self.devices.disconnect(&self.node, pool, image).await?;
        self.registry
            .update_with(volume, |record| {
                let status = record.current_status();
                if !status.node.is_empty() && status.node != self.node {
                    return Err(Error::Occupied { volume: volume.clone(), node: status.node });
                }
                record.status = Some(AlcubVolumeStatus::default());
                Ok(())
            })
            .await?;
        info!("Volume {} detached from {}", volume, self.node);
        Ok(())
    }

    pub async fn detach(&self, record: &AlcubVolume) -> Result<()> {
        let plan = self.pre_unmount_valid(record)?;
        self.commit_detach(&plan).await
    }
}
