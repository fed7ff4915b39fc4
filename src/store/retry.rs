use super::{ResourceStore, kind_of};
use crate::error::{Error, Result};
use kube::Resource;
use std::time::Duration;
use tracing::debug;

/// Attempts per read-modify-write before giving up.
pub const RETRY_STEPS: usize = 5;
const RETRY_PAUSE: Duration = Duration::from_millis(10);

/// Fetch `name`, apply `mutate`, write it back; repeat on version conflicts.
///
/// `mutate` sees the freshest copy on every attempt and may abort the whole
/// operation by returning an error.
pub async fn retry_on_conflict<K, S, F>(store: &S, name: &str, mut mutate: F) -> Result<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
    S: ResourceStore<K> + ?Sized,
    F: FnMut(&mut K) -> Result<()> + Send,
{
    for attempt in 1..=RETRY_STEPS {
        let mut obj =
            store.get(name).await?.ok_or_else(|| Error::not_found(kind_of::<K>(), name))?;
        mutate(&mut obj)?;
        match store.replace(&obj).await {
            Ok(updated) => return Ok(updated),
            Err(Error::VersionConflict(_)) => {
                debug!("Version conflict writing {} (attempt {})", name, attempt);
                tokio::time::sleep(RETRY_PAUSE).await;
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::RetriesExhausted(name.to_string()))
}

/// Delete `name` with a resource-version precondition, re-running `check`
/// against the freshest copy on every attempt. A missing object is success.
pub async fn delete_on_conflict<K, S, F>(store: &S, name: &str, check: F) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
    S: ResourceStore<K> + ?Sized,
    F: Fn(&K) -> Result<()> + Send + Sync,
{
    for attempt in 1..=RETRY_STEPS {
        let Some(obj) = store.get(name).await? else {
            return Ok(());
        };
        check(&obj)?;
        match store.delete(name, obj.meta().resource_version.as_deref()).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_not_found() => return Ok(()),
            Err(Error::VersionConflict(_)) => {
                debug!("Version conflict deleting {} (attempt {})", name, attempt);
                tokio::time::sleep(RETRY_PAUSE).await;
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::RetriesExhausted(name.to_string()))
}
