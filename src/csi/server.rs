use crate::csi::proto::{
    controller_server::ControllerServer, identity_server::IdentityServer, node_server::NodeServer,
};
use crate::csi::{CsiController, CsiNode, IdentityService};
use anyhow::{Context, Result};
use std::path::Path;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tower_http::trace::TraceLayer;

/// Bind the `unix://` endpoint, replacing a stale socket file.
fn bind(endpoint: &str) -> Result<UnixListenerStream> {
    let path = endpoint.strip_prefix("unix://").context("Address must start with unix://")?;
    let path = Path::new(path);

    if path.exists() {
        std::fs::remove_file(path).context("Failed to remove existing socket")?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create socket directory")?;
    }

    let uds = tokio::net::UnixListener::bind(path).context("Failed to bind Unix socket")?;
    Ok(UnixListenerStream::new(uds))
}

/// Serve identity and controller services
pub async fn serve_controller(identity: IdentityService, controller: CsiController, endpoint: &str) -> Result<()> {
    let incoming = bind(endpoint)?;
    tracing::info!("CSI Controller listening on {}", endpoint);

    Server::builder()
        .layer(TraceLayer::new_for_grpc())
        .add_service(IdentityServer::new(identity))
        .add_service(ControllerServer::new(controller))
        .serve_with_incoming(incoming)
        .await
        .context("gRPC server error")
}

/// Serve identity and node services
pub async fn serve_node(identity: IdentityService, node: CsiNode, endpoint: &str) -> Result<()> {
    let incoming = bind(endpoint)?;
    tracing::info!("CSI Node listening on {}", endpoint);

    Server::builder()
        .layer(TraceLayer::new_for_grpc())
        .add_service(IdentityServer::new(identity))
        .add_service(NodeServer::new(node))
        .serve_with_incoming(incoming)
        .await
        .context("gRPC server error")
}
