use super::{ResourceStore, kind_of};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// In-process [`ResourceStore`] that mimics the API server semantics the
/// crate depends on: monotonically increasing resource versions, stale-write
/// rejection, and finalizer-gated deletion.
pub struct MemoryStore<K> {
    inner: Mutex<Inner<K>>,
}

struct Inner<K> {
    objects: BTreeMap<String, K>,
    version: u64,
}

impl<K> Inner<K> {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        Self { inner: Mutex::new(Inner { objects: BTreeMap::new(), version: 0 }) }
    }
}

impl<K> MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with existing objects, as if they had been created earlier.
    pub fn with_objects(objects: impl IntoIterator<Item = K>) -> Self {
        let store = Self::new();
        {
            let mut inner = store.lock();
            for mut obj in objects {
                let version = inner.next_version();
                obj.meta_mut().resource_version = Some(version);
                inner.objects.insert(obj.name_any(), obj);
            }
        }
        store
    }

    /// Current copy of an object, bypassing the async trait.
    pub fn snapshot(&self, name: &str) -> Option<K> {
        self.lock().objects.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<K>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn now() -> Option<Time> {
    let stamp = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    serde_json::from_value(serde_json::Value::String(stamp)).ok()
}

#[async_trait]
impl<K> ResourceStore<K> for MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<Option<K>> {
        Ok(self.snapshot(name))
    }

    async fn list(&self) -> Result<Vec<K>> {
        Ok(self.lock().objects.values().cloned().collect())
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let mut inner = self.lock();
        if inner.objects.contains_key(&name) {
            return Err(Error::already_exists(kind_of::<K>(), name));
        }
        let mut created = obj.clone();
        created.meta_mut().resource_version = Some(inner.next_version());
        created.meta_mut().deletion_timestamp = None;
        inner.objects.insert(name, created.clone());
        Ok(created)
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let mut inner = self.lock();
        let Some(stored) = inner.objects.get(&name) else {
            return Err(Error::not_found(kind_of::<K>(), name));
        };
        if stored.meta().resource_version != obj.meta().resource_version {
            return Err(Error::VersionConflict(name));
        }

        let deletion_timestamp = stored.meta().deletion_timestamp.clone();
        let mut updated = obj.clone();
        updated.meta_mut().deletion_timestamp = deletion_timestamp;
        updated.meta_mut().resource_version = Some(inner.next_version());

        if updated.meta().deletion_timestamp.is_some() && updated.finalizers().is_empty() {
            inner.objects.remove(&name);
        } else {
            inner.objects.insert(name, updated.clone());
        }
        Ok(updated)
    }

    async fn delete(&self, name: &str, resource_version: Option<&str>) -> Result<()> {
        let mut inner = self.lock();
        let Some(stored) = inner.objects.get(name) else {
            return Err(Error::not_found(kind_of::<K>(), name));
        };
        if resource_version.is_some_and(|rv| stored.meta().resource_version.as_deref() != Some(rv)) {
            return Err(Error::VersionConflict(name.to_string()));
        }

        if stored.finalizers().is_empty() {
            inner.objects.remove(name);
            return Ok(());
        }
        if stored.meta().deletion_timestamp.is_none() {
            let mut marked = stored.clone();
            marked.meta_mut().deletion_timestamp = now();
            marked.meta_mut().resource_version = Some(inner.next_version());
            inner.objects.insert(name.to_string(), marked);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Node;
    use kube::api::ObjectMeta;

    fn node(name: &str) -> Node {
        Node { metadata: ObjectMeta { name: Some(name.to_string()), ..Default::default() }, ..Default::default() }
    }

    #[tokio::test]
    async fn test_create_assigns_version_and_rejects_duplicates() {
        let store = MemoryStore::new();
        let created = store.create(&node("a")).await.unwrap();
        assert!(created.metadata.resource_version.is_some());

        let err = store.create(&node("a")).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_replace_rejects_stale_version() {
        let store = MemoryStore::with_objects(vec![node("a")]);
        let first = store.get("a").await.unwrap().unwrap();
        let mut second = first.clone();

        store.replace(&first).await.unwrap();
        second.metadata.labels = Some([("x".to_string(), "y".to_string())].into());
        let err = store.replace(&second).await.unwrap_err();
        assert!(matches!(err, Error::VersionConflict(_)));
    }

    #[tokio::test]
    async fn test_delete_waits_for_finalizers() {
        let mut n = node("a");
        n.metadata.finalizers = Some(vec!["guard".to_string()]);
        let store = MemoryStore::with_objects(vec![n]);

        store.delete("a", None).await.unwrap();
        let mut marked = store.get("a").await.unwrap().unwrap();
        assert!(marked.metadata.deletion_timestamp.is_some());

        marked.metadata.finalizers = None;
        store.replace(&marked).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_delete_precondition() {
        let store = MemoryStore::with_objects(vec![node("a")]);
        let err = store.delete("a", Some("999")).await.unwrap_err();
        assert!(matches!(err, Error::VersionConflict(_)));

        let err = store.delete("missing", None).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
