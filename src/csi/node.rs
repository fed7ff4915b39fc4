use crate::attach::{AttachOutcome, NodeAttachService};
use crate::csi::metrics::CsiMetrics;
use crate::csi::mounter::Mounter;
use crate::csi::proto::{
    NodeExpandVolumeRequest, NodeExpandVolumeResponse, NodeGetCapabilitiesRequest,
    NodeGetCapabilitiesResponse, NodeGetInfoRequest, NodeGetInfoResponse,
    NodeGetVolumeStatsRequest, NodeGetVolumeStatsResponse, NodePublishVolumeRequest,
    NodePublishVolumeResponse, NodeStageVolumeRequest, NodeStageVolumeResponse,
    NodeUnpublishVolumeRequest, NodeUnpublishVolumeResponse, NodeUnstageVolumeRequest,
    NodeUnstageVolumeResponse, Topology, node_server::Node, volume_capability::AccessType,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

/// Topology segment naming the node a volume is reachable from.
pub const TOPOLOGY_KEY: &str = "topology.alcub.csi.io/node";

/// Node Service implementation
///
/// Publish connects the backend device, records the attachment and then
/// formats and mounts it at the target path. Unpublish reverses that order.
#[derive(Clone)]
pub struct CsiNode {
    attach: Arc<NodeAttachService>,
    mounter: Arc<dyn Mounter>,
    max_volumes_per_node: i64,
    metrics: Option<Arc<CsiMetrics>>,
}

impl CsiNode {
    pub fn new(attach: Arc<NodeAttachService>, mounter: Arc<dyn Mounter>, max_volumes_per_node: i64) -> Self {
        Self { attach, mounter, max_volumes_per_node, metrics: None }
    }

    pub fn with_metrics(mut self, metrics: Arc<CsiMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn observe<T>(&self, method: &str, started: Instant, result: &Result<T, Status>) {
        if let Some(metrics) = &self.metrics {
            metrics.record_operation(method, started.elapsed().as_secs_f64(), result.is_ok());
        }
    }

    async fn publish(&self, req: NodePublishVolumeRequest) -> Result<(), Status> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID missing in request"));
        }
        if req.target_path.is_empty() {
            return Err(Status::invalid_argument("Target path missing in request"));
        }
        let capability =
            req.volume_capability.ok_or_else(|| Status::invalid_argument("Volume capability missing in request"))?;
        let Some(AccessType::Mount(mount)) = capability.access_type else {
            return Err(Status::invalid_argument("Only mount access type is supported"));
        };

        let record = self.attach.registry().get_by_uuid(&req.volume_id).await?;
        let target = Path::new(&req.target_path);

        if self.mounter.is_mount_point(target).await? {
            debug!("{} is already mounted", req.target_path);
            return Ok(());
        }

        let plan = self.attach.pre_mount_valid(&record).await?;
        let attached = self.attach.commit_attach(&plan).await;
        if attached.needs_rollback {
            self.attach.rollback_attach(&plan).await;
        }
        if let AttachOutcome::Failed(e) = attached.outcome {
            return Err(e.into());
        }

        let mut options = mount.mount_flags;
        if req.readonly {
            options.push("ro".to_string());
        }
        if let Err(status) = self.mount(&attached.device_path, target, &mount.fs_type, &options).await {
            warn!("Mounting volume {} at {} failed, releasing device", req.volume_id, req.target_path);
            self.attach.rollback_attach(&plan).await;
            return Err(status);
        }
        info!("Published volume {} at {}", req.volume_id, req.target_path);
        Ok(())
    }

    async fn mount(&self, device: &str, target: &Path, fs_type: &str, options: &[String]) -> Result<(), Status> {
        tokio::fs::create_dir_all(target)
            .await
            .map_err(|e| Status::internal(format!("Failed to create target directory: {}", e)))?;
        self.mounter.format_and_mount(device, target, fs_type, options).await?;
        Ok(())
    }

    async fn unpublish(&self, req: NodeUnpublishVolumeRequest) -> Result<(), Status> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID missing in request"));
        }
        if req.target_path.is_empty() {
            return Err(Status::invalid_argument("Target path missing in request"));
        }

        let record = self.attach.registry().get_by_uuid(&req.volume_id).await?;
        let plan = self.attach.pre_unmount_valid(&record)?;
        let target = Path::new(&req.target_path);

        if self.mounter.is_mount_point(target).await? {
            self.mounter.unmount(target).await?;
        }
        match tokio::fs::remove_dir_all(target).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Status::internal(format!("Failed to remove target path: {}", e))),
        }

        self.attach.commit_detach(&plan).await?;
        info!("Unpublished volume {} from {}", req.volume_id, req.target_path);
        Ok(())
    }
}

#[tonic::async_trait]
impl Node for CsiNode {
    async fn node_stage_volume(
        &self,
        request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID missing in request"));
        }
        if req.staging_target_path.is_empty() {
            return Err(Status::invalid_argument("Staging target path missing in request"));
        }
        if req.volume_capability.is_none() {
            return Err(Status::invalid_argument("Volume capability missing in request"));
        }
        Ok(Response::new(NodeStageVolumeResponse {}))
    }

    async fn node_unstage_volume(
        &self,
        request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID missing in request"));
        }
        if req.staging_target_path.is_empty() {
            return Err(Status::invalid_argument("Staging target path missing in request"));
        }
        Ok(Response::new(NodeUnstageVolumeResponse {}))
    }

    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let started = Instant::now();
        let result = self.publish(request.into_inner()).await;
        self.observe("NodePublishVolume", started, &result);
        result.map(|()| Response::new(NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let started = Instant::now();
        let result = self.unpublish(request.into_inner()).await;
        self.observe("NodeUnpublishVolume", started, &result);
        result.map(|()| Response::new(NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_volume_stats(
        &self,
        _request: Request<NodeGetVolumeStatsRequest>,
    ) -> Result<Response<NodeGetVolumeStatsResponse>, Status> {
        Err(Status::unimplemented("Volume stats are not supported"))
    }

    async fn node_expand_volume(
        &self,
        _request: Request<NodeExpandVolumeRequest>,
    ) -> Result<Response<NodeExpandVolumeResponse>, Status> {
        Err(Status::unimplemented("Volume expansion is not supported"))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        use crate::csi::proto::node_service_capability::{Rpc, rpc::Type};

        let capabilities = vec![crate::csi::proto::NodeServiceCapability {
            r#type: Some(crate::csi::proto::node_service_capability::Type::Rpc(Rpc {
                r#type: Type::StageUnstageVolume as i32,
            })),
        }];

        Ok(Response::new(NodeGetCapabilitiesResponse { capabilities }))
    }

    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        let node = self.attach.node().to_string();
        Ok(Response::new(NodeGetInfoResponse {
            node_id: node.clone(),
            max_volumes_per_node: self.max_volumes_per_node,
            accessible_topology: Some(Topology {
                segments: HashMap::from([(TOPOLOGY_KEY.to_string(), node)]),
            }),
        }))
    }
}
