use crate::csi::proto::{
    GetPluginCapabilitiesRequest, GetPluginCapabilitiesResponse, GetPluginInfoRequest,
    GetPluginInfoResponse, PluginCapability, ProbeRequest, ProbeResponse,
    identity_server::Identity,
};
use tonic::{Request, Response, Status};

const PLUGIN_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Identity Service implementation
///
/// Reports the driver name and that a controller service is available.
#[derive(Debug, Clone)]
pub struct IdentityService {
    name: String,
    version: String,
}

impl IdentityService {
    pub fn new(driver_name: impl Into<String>) -> Self {
        Self { name: driver_name.into(), version: PLUGIN_VERSION.to_string() }
    }
}

#[tonic::async_trait]
impl Identity for IdentityService {
    async fn get_plugin_info(
        &self,
        _request: Request<GetPluginInfoRequest>,
    ) -> Result<Response<GetPluginInfoResponse>, Status> {
        Ok(Response::new(GetPluginInfoResponse {
            name: self.name.clone(),
            vendor_version: self.version.clone(),
            manifest: Default::default(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<GetPluginCapabilitiesRequest>,
    ) -> Result<Response<GetPluginCapabilitiesResponse>, Status> {
        use crate::csi::proto::plugin_capability::{Service, service::Type};

        let capabilities = [Type::ControllerService, Type::VolumeAccessibilityConstraints]
            .into_iter()
            .map(|t| PluginCapability {
                r#type: Some(crate::csi::proto::plugin_capability::Type::Service(Service {
                    r#type: t as i32,
                })),
            })
            .collect();

        Ok(Response::new(GetPluginCapabilitiesResponse { capabilities }))
    }

    async fn probe(
        &self,
        _request: Request<ProbeRequest>,
    ) -> Result<Response<ProbeResponse>, Status> {
        Ok(Response::new(ProbeResponse { ready: Some(true) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_plugin_info() {
        let service = IdentityService::new("alcub.csi.es.io");
        let request = Request::new(GetPluginInfoRequest {});

        let response = service.get_plugin_info(request).await.unwrap();
        let info = response.into_inner();

        assert_eq!(info.name, "alcub.csi.es.io");
        assert_eq!(info.vendor_version, PLUGIN_VERSION);
    }

    #[tokio::test]
    async fn test_get_plugin_capabilities() {
        let service = IdentityService::new("alcub.csi.es.io");
        let request = Request::new(GetPluginCapabilitiesRequest {});

        let response = service.get_plugin_capabilities(request).await.unwrap();
        let caps = response.into_inner();

        assert_eq!(caps.capabilities.len(), 2);
    }

    #[tokio::test]
    async fn test_probe() {
        let service = IdentityService::new("alcub.csi.es.io");
        let request = Request::new(ProbeRequest {});

        let response = service.probe(request).await.unwrap();
        let probe = response.into_inner();

        assert_eq!(probe.ready, Some(true));
    }
}
