//! Controller-side volume provisioning and node fencing.

use crate::backend::{DeviceBackend, ImageBackend, fence_entity};
use crate::crd::AlcubVolumeSpec;
use crate::error::{Error, Result};
use crate::volume::VolumeRegistry;
use async_trait::async_trait;
#[cfg(any(test, feature = "mockall"))]
use mockall::automock;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// StorageClass parameter naming the class backend options come from.
pub const STORAGE_CLASS_PARAM: &str = "scname";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Mount,
    Block,
}

#[derive(Debug, Clone, Default)]
pub struct VolumeRequest {
    pub name: String,
    pub capacity_bytes: i64,
    pub access: Vec<AccessKind>,
    /// Clone or snapshot restore was requested.
    pub has_content_source: bool,
    pub parameters: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeDescriptor {
    pub volume_id: String,
    pub capacity_bytes: i64,
    pub context: BTreeMap<String, String>,
}

impl VolumeDescriptor {
    fn from_spec(spec: &AlcubVolumeSpec) -> Self {
        let context = BTreeMap::from([
            ("pool".to_string(), spec.pool.clone()),
            ("image".to_string(), spec.image.clone()),
            ("storageClass".to_string(), spec.storage_class.clone()),
        ]);
        Self { volume_id: spec.uuid.clone(), capacity_bytes: spec.capacity, context }
    }
}

/// Node isolation used by the health watcher.
///
/// Both calls may be delivered more than once and must not compound.
#[cfg_attr(any(test, feature = "mockall"), automock)]
#[async_trait]
pub trait Fencer: Send + Sync {
    /// Isolate `node`; returns the blacklist entity in effect when `add_fence` is set.
    async fn stop_node(&self, node: &str, add_fence: bool) -> Result<Option<String>>;
    /// Undo [`Fencer::stop_node`]. `entity` is the blacklist entry recorded at fencing time.
    async fn start_node(&self, node: &str, remove_fence: bool, entity: Option<String>) -> Result<()>;
}

pub struct ControllerService {
    registry: Arc<VolumeRegistry>,
    images: Arc<dyn ImageBackend>,
    devices: Arc<dyn DeviceBackend>,
    /// node -> blacklist entity this controller has applied.
    fenced: RwLock<HashMap<String, String>>,
}

impl ControllerService {
    pub fn new(
        registry: Arc<VolumeRegistry>,
        images: Arc<dyn ImageBackend>,
        devices: Arc<dyn DeviceBackend>,
    ) -> Self {
        Self { registry, images, devices, fenced: RwLock::new(HashMap::new()) }
    }

    pub async fn create_volume(&self, req: VolumeRequest) -> Result<VolumeDescriptor> {
        if req.name.is_empty() {
            return Err(Error::InvalidArgument("volume name is required".to_string()));
        }
        if !req.access.contains(&AccessKind::Mount) {
            return Err(Error::InvalidArgument("only filesystem volumes are supported".to_string()));
        }
        if req.has_content_source {
            return Err(Error::InvalidArgument(
                "creating volumes from snapshots or clones is not supported".to_string(),
            ));
        }

        if let Some(existing) = self.registry.find_by_name(&req.name).await? {
            if existing.spec.capacity != req.capacity_bytes {
                return Err(Error::AlreadyExists {
                    kind: "volume".to_string(),
                    name: format!(
                        "{} with capacity {} (requested {})",
                        req.name, existing.spec.capacity, req.capacity_bytes
                    ),
                });
            }
            debug!("Volume {} already provisioned as {}", req.name, existing.spec.uuid);
            return Ok(VolumeDescriptor::from_spec(&existing.spec));
        }

        let storage_class = req
            .parameters
            .get(STORAGE_CLASS_PARAM)
            .filter(|sc| !sc.is_empty())
            .ok_or_else(|| {
                Error::InvalidArgument(format!("parameter {:?} is required", STORAGE_CLASS_PARAM))
            })?
            .clone();

        let uuid = Uuid::new_v4().to_string();
        let image = self.images.create_image(&storage_class, &req.name, req.capacity_bytes).await?;
        let spec = AlcubVolumeSpec {
            uuid,
            capacity: req.capacity_bytes,
            storage_class: storage_class.clone(),
            pool: image.pool,
            image: image.image,
        };

        if let Err(e) = self.registry.create(&req.name, spec.clone()).await {
            if let Err(cleanup) = self.images.delete_image(&storage_class, &spec.image).await {
                warn!("Failed to remove orphaned image {}/{}: {}", spec.pool, spec.image, cleanup);
            }
            return Err(e);
        }

        info!("Provisioned volume {} as {} ({} bytes)", req.name, spec.uuid, spec.capacity);
        Ok(VolumeDescriptor::from_spec(&spec))
    }

    pub async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        let record = match self.registry.get_by_uuid(volume_id).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => {
                debug!("Volume {} already deleted", volume_id);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let name = kube::ResourceExt::name_any(&record);

        if !record.is_deletable() {
            return Err(Error::Conflict {
                name,
                reason: format!("volume is attached to {:?}", record.current_node()),
            });
        }

        self.images.delete_image(&record.spec.storage_class, &record.spec.image).await?;
        self.registry.delete(&name).await?;
        info!("Deleted volume {} ({})", name, volume_id);
        Ok(())
    }

    fn applied_fence(&self, node: &str) -> Option<String> {
        self.fenced.read().unwrap_or_else(|p| p.into_inner()).get(node).cloned()
    }

    fn remember_fence(&self, node: &str, entity: Option<String>) {
        let mut fenced = self.fenced.write().unwrap_or_else(|p| p.into_inner());
        match entity {
            Some(entity) => fenced.insert(node.to_string(), entity),
            None => fenced.remove(node),
        };
    }
}

#[async_trait]
impl Fencer for ControllerService {
    async fn stop_node(&self, node: &str, add_fence: bool) -> Result<Option<String>> {
        let info = self.registry.node_info(node).ok_or_else(|| Error::not_found("node info", node))?;

        let mut applied = None;
        if add_fence {
            let entity = fence_entity(info.storage_ip);
            if self.applied_fence(node).as_deref() == Some(entity.as_str()) {
                debug!("Node {} already fenced as {}", node, entity);
            } else {
                self.images.add_fence(&entity).await?;
                self.remember_fence(node, Some(entity.clone()));
            }
            applied = Some(entity);
        }

        let mut errors = Vec::new();
        for url in info.peer_nodes.iter().filter(|u| !u.is_empty()) {
            match self.devices.fail_node(url, node).await {
                Ok(()) => {
                    info!("Backend {} acknowledged failure of node {}", url, node);
                    return Ok(applied);
                }
                Err(e) => {
                    warn!("Backend {} rejected failure of node {}: {}", url, node, e);
                    errors.push(format!("{}: {}", url, e));
                }
            }
        }

        if errors.is_empty() {
            return Err(Error::Backend(format!("no backend endpoint known for node {}", node)));
        }
        Err(Error::Backend(format!("node_fail for {} failed everywhere: {}", node, errors.join("; "))))
    }

    async fn start_node(&self, node: &str, remove_fence: bool, entity: Option<String>) -> Result<()> {
        if remove_fence {
            // Nothing is cached for a node that no longer holds a volume.
            let entity = entity
                .or_else(|| self.applied_fence(node))
                .or_else(|| self.registry.node_info(node).map(|info| fence_entity(info.storage_ip)));
            match entity {
                Some(entity) => {
                    self.images.remove_fence(&entity).await?;
                    self.remember_fence(node, None);
                }
                None => warn!("No blacklist entry known for node {}, leaving removal to the operator", node),
            }
        }

        let node_url = self.devices.node_url(node).await?;
        let mut targets = Vec::new();
        self.registry
            .for_each(|record| {
                let status = record.current_status();
                let held = status.node == node || status.prev_node == node;
                if held && status.peer_nodes.contains(&node_url) {
                    targets.push((record.spec.pool.clone(), record.spec.image.clone()));
                }
            })
            .await?;

        let mut errors = Vec::new();
        for (pool, image) in &targets {
            if let Err(e) = self.devices.dev_stop(&node_url, pool, image).await {
                warn!("Failed to reset {}/{} on {}: {}", pool, image, node, e);
                errors.push(format!("{}/{}: {}", pool, image, e));
            }
        }
        if !errors.is_empty() {
            return Err(Error::Backend(format!(
                "dev_stop failed on {}: {}",
                node,
                errors.join("; ")
            )));
        }
        info!("Node {} recovered, reset {} devices", node, targets.len());
        Ok(())
    }
}
