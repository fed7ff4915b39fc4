use super::{ResourceStore, kind_of};
use crate::error::{Error, Result};
use async_trait::async_trait;
use kube::api::{DeleteParams, ListParams, PostParams, Preconditions};
use kube::{Api, Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;

/// [`ResourceStore`] backed by the Kubernetes API for cluster-scoped kinds.
#[derive(Clone)]
pub struct KubeStore<K> {
    api: Api<K>,
}

impl<K> KubeStore<K>
where
    K: Resource<DynamicType = ()> + Clone,
{
    pub fn new(client: Client) -> Self {
        Self { api: Api::all(client) }
    }

    pub fn api(&self) -> Api<K> {
        self.api.clone()
    }
}

fn map_write_error<K: Resource<DynamicType = ()>>(name: &str, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => Error::not_found(kind_of::<K>(), name),
        kube::Error::Api(ae) if ae.code == 409 => Error::VersionConflict(name.to_string()),
        e => Error::Kube(e),
    }
}

#[async_trait]
impl<K> ResourceStore<K> for KubeStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Serialize + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<Option<K>> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn list(&self) -> Result<Vec<K>> {
        Ok(self.api.list(&ListParams::default()).await?.items)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        self.api.create(&PostParams::default(), obj).await.map_err(|e| match e {
            kube::Error::Api(ae) if ae.code == 409 => Error::already_exists(kind_of::<K>(), name),
            e => Error::Kube(e),
        })
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        self.api
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| map_write_error::<K>(&name, e))
    }

    async fn delete(&self, name: &str, resource_version: Option<&str>) -> Result<()> {
        let params = DeleteParams {
            preconditions: resource_version.map(|rv| Preconditions {
                resource_version: Some(rv.to_string()),
                uid: None,
            }),
            ..DeleteParams::default()
        };
        self.api.delete(name, &params).await.map_err(|e| map_write_error::<K>(name, e))?;
        Ok(())
    }
}
