use crate::controller::{AccessKind, ControllerService, VolumeRequest};
use crate::csi::metrics::CsiMetrics;
use crate::csi::proto::{
    ControllerExpandVolumeRequest, ControllerExpandVolumeResponse,
    ControllerGetCapabilitiesRequest, ControllerGetCapabilitiesResponse,
    ControllerGetVolumeRequest, ControllerGetVolumeResponse, ControllerPublishVolumeRequest,
    ControllerPublishVolumeResponse, ControllerServiceCapability, ControllerUnpublishVolumeRequest,
    ControllerUnpublishVolumeResponse, CreateSnapshotRequest, CreateSnapshotResponse,
    CreateVolumeRequest, CreateVolumeResponse, DeleteSnapshotRequest, DeleteSnapshotResponse,
    DeleteVolumeRequest, DeleteVolumeResponse, GetCapacityRequest, GetCapacityResponse,
    ListSnapshotsRequest, ListSnapshotsResponse, ListVolumesRequest, ListVolumesResponse,
    ValidateVolumeCapabilitiesRequest, ValidateVolumeCapabilitiesResponse, Volume,
    VolumeCapability, controller_server::Controller, volume_capability::AccessType,
};
use std::sync::Arc;
use std::time::Instant;
use tonic::{Request, Response, Status};
use tracing::debug;

/// gRPC adapter for [`ControllerService`].
#[derive(Clone)]
pub struct CsiController {
    service: Arc<ControllerService>,
    metrics: Option<Arc<CsiMetrics>>,
}

impl CsiController {
    pub fn new(service: Arc<ControllerService>) -> Self {
        Self { service, metrics: None }
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

    async fn create(&self, req: CreateVolumeRequest) -> Result<CreateVolumeResponse, Status> {
        if req.name.is_empty() {
            return Err(Status::invalid_argument("Name missing in request"));
        }
        if req.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument("Volume capabilities missing in request"));
        }

        let capacity_bytes = req.capacity_range.as_ref().map(|r| r.required_bytes).unwrap_or(0);
        let topology = req
            .accessibility_requirements
            .as_ref()
            .map(|a| if a.requisite.is_empty() { a.preferred.clone() } else { a.requisite.clone() })
            .unwrap_or_default();

        let volume = self
            .service
            .create_volume(VolumeRequest {
                name: req.name,
                capacity_bytes,
                access: access_kinds(&req.volume_capabilities),
                has_content_source: req.volume_content_source.is_some(),
                parameters: req.parameters.clone(),
            })
            .await?;

        let mut volume_context = req.parameters;
        volume_context.extend(volume.context);
        Ok(CreateVolumeResponse {
            volume: Some(Volume {
                capacity_bytes: volume.capacity_bytes,
                volume_id: volume.volume_id,
                volume_context,
                content_source: None,
                accessible_topology: topology,
            }),
        })
    }
}

fn access_kinds(capabilities: &[VolumeCapability]) -> Vec<AccessKind> {
    capabilities
        .iter()
        .filter_map(|c| match c.access_type {
            Some(AccessType::Mount(_)) => Some(AccessKind::Mount),
            Some(AccessType::Block(_)) => Some(AccessKind::Block),
            None => None,
        })
        .collect()
}

#[tonic::async_trait]
impl Controller for CsiController {
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        let started = Instant::now();
        let req = request.into_inner();
        debug!("CreateVolume {} ({:?})", req.name, req.capacity_range);

        let result = self.create(req).await;
        self.observe("CreateVolume", started, &result);
        result.map(Response::new)
    }

    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        let started = Instant::now();
        let req = request.into_inner();

        let result = if req.volume_id.is_empty() {
            Err(Status::invalid_argument("Volume ID missing in request"))
        } else {
            self.service.delete_volume(&req.volume_id).await.map_err(Status::from)
        };
        self.observe("DeleteVolume", started, &result);
        result.map(|()| Response::new(DeleteVolumeResponse {}))
    }

    async fn controller_publish_volume(
        &self,
        _request: Request<ControllerPublishVolumeRequest>,
    ) -> Result<Response<ControllerPublishVolumeResponse>, Status> {
        Err(Status::unimplemented("Attachment is handled by the node plugin"))
    }

    async fn controller_unpublish_volume(
        &self,
        _request: Request<ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<ControllerUnpublishVolumeResponse>, Status> {
        Err(Status::unimplemented("Attachment is handled by the node plugin"))
    }

    async fn validate_volume_capabilities(
        &self,
        _request: Request<ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<ValidateVolumeCapabilitiesResponse>, Status> {
        Err(Status::unimplemented("ValidateVolumeCapabilities is not supported"))
    }

    async fn list_volumes(
        &self,
        _request: Request<ListVolumesRequest>,
    ) -> Result<Response<ListVolumesResponse>, Status> {
        Err(Status::unimplemented("ListVolumes is not supported"))
    }

    async fn get_capacity(
        &self,
        _request: Request<GetCapacityRequest>,
    ) -> Result<Response<GetCapacityResponse>, Status> {
        Err(Status::unimplemented("GetCapacity is not supported"))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<ControllerGetCapabilitiesResponse>, Status> {
        use crate::csi::proto::controller_service_capability::{Rpc, Type, rpc};

        let capabilities = vec![ControllerServiceCapability {
            r#type: Some(Type::Rpc(Rpc { r#type: rpc::Type::CreateDeleteVolume as i32 })),
        }];

        Ok(Response::new(ControllerGetCapabilitiesResponse { capabilities }))
    }

    async fn create_snapshot(
        &self,
        _request: Request<CreateSnapshotRequest>,
    ) -> Result<Response<CreateSnapshotResponse>, Status> {
        Err(Status::unimplemented("Snapshots are not supported"))
    }

    async fn delete_snapshot(
        &self,
        _request: Request<DeleteSnapshotRequest>,
    ) -> Result<Response<DeleteSnapshotResponse>, Status> {
        Err(Status::unimplemented("Snapshots are not supported"))
    }

    async fn list_snapshots(
        &self,
        _request: Request<ListSnapshotsRequest>,
    ) -> Result<Response<ListSnapshotsResponse>, Status> {
        Err(Status::unimplemented("Snapshots are not supported"))
    }

    async fn controller_expand_volume(
        &self,
        _request: Request<ControllerExpandVolumeRequest>,
    ) -> Result<Response<ControllerExpandVolumeResponse>, Status> {
        Err(Status::unimplemented("Volume expansion is not supported"))
    }

    async fn controller_get_volume(
        &self,
        _request: Request<ControllerGetVolumeRequest>,
    ) -> Result<Response<ControllerGetVolumeResponse>, Status> {
        Err(Status::unimplemented("ControllerGetVolume is not supported"))
    }
}
