//! Persistence seam for Kubernetes objects.
//!
//! Everything that reads or writes a `AlcubVolume` or a `Node` goes through
//! [`ResourceStore`], so the registry and the health watcher run unchanged
//! against the API server ([`KubeStore`]) or an in-process map ([`MemoryStore`]).

mod kube_store;
mod memory;
mod retry;

pub use kube_store::KubeStore;
pub use memory::MemoryStore;
pub use retry::{RETRY_STEPS, delete_on_conflict, retry_on_conflict};

use crate::error::Result;
use async_trait::async_trait;
use kube::Resource;

/// Minimal CRUD surface with optimistic concurrency.
///
/// `replace` and `delete` fail with `Error::VersionConflict` when the
/// caller's resource version is stale.
#[async_trait]
pub trait ResourceStore<K>: Send + Sync
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<Option<K>>;
    async fn list(&self) -> Result<Vec<K>>;
    async fn create(&self, obj: &K) -> Result<K>;
    async fn replace(&self, obj: &K) -> Result<K>;
    async fn delete(&self, name: &str, resource_version: Option<&str>) -> Result<()>;
}

pub(crate) fn kind_of<K: Resource<DynamicType = ()>>() -> String {
    K::kind(&()).into_owned()
}
