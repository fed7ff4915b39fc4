//! Clients for the storage backend.
//!
//! Two collaborators sit behind traits so the controller and node services
//! can be exercised with mocks:
//! - [`DeviceBackend`]: the Alcubierre device API (JSON over HTTP) that
//!   connects images to nodes and is told about node failures.
//! - [`ImageBackend`]: RBD image lifecycle and OSD blacklisting, driven
//!   through the `rbd`/`ceph` command line tools.

pub mod api;
pub mod exec;
pub mod rbd;

pub use api::{AlcubApi, RadosUrlResolver, UrlResolver};
pub use exec::{CommandRunner, SystemRunner};
pub use rbd::{ImageOptions, KubeParamsSource, ParamsSource, RbdImages};

use crate::error::Result;
use async_trait::async_trait;
#[cfg(any(test, feature = "mockall"))]
use mockall::automock;
use std::net::IpAddr;

/// Where a created image lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub pool: String,
    pub image: String,
}

#[cfg_attr(any(test, feature = "mockall"), automock)]
#[async_trait]
pub trait DeviceBackend: Send + Sync {
    /// Connect `pool/image` on `node`; returns the local device path.
    async fn connect(&self, node: &str, pool: &str, image: &str) -> Result<String>;
    async fn disconnect(&self, node: &str, pool: &str, image: &str) -> Result<()>;
    /// Whether the image is free of in-flight transitions.
    async fn image_clean(&self, node: &str, pool: &str, image: &str) -> Result<bool>;
    /// Backend endpoints serving `node`'s cluster, its own endpoint last.
    async fn peer_urls(&self, node: &str) -> Result<Vec<String>>;
    /// Base endpoint of the backend running on `node`.
    async fn node_url(&self, node: &str) -> Result<String>;
    /// Tell the backend reachable at `url` that `node` has failed.
    async fn fail_node(&self, url: &str, node: &str) -> Result<()>;
    /// Stop the device for `pool/image` on the backend at `url`.
    async fn dev_stop(&self, url: &str, pool: &str, image: &str) -> Result<()>;
}

#[cfg_attr(any(test, feature = "mockall"), automock)]
#[async_trait]
pub trait ImageBackend: Send + Sync {
    /// Create an image of at least `bytes` using the named StorageClass.
    async fn create_image(&self, storage_class: &str, name: &str, bytes: i64) -> Result<ImageRef>;
    async fn delete_image(&self, storage_class: &str, image: &str) -> Result<()>;
    async fn add_fence(&self, entity: &str) -> Result<()>;
    async fn remove_fence(&self, entity: &str) -> Result<()>;
}

/// Blacklist entity covering every client on `ip`.
pub fn fence_entity(ip: IpAddr) -> String {
    format!("{}:0/0", ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fence_entity() {
        assert_eq!(fence_entity("10.1.2.3".parse().unwrap()), "10.1.2.3:0/0");
        assert_eq!(fence_entity("fd00::1".parse().unwrap()), "fd00::1:0/0");
    }
}
