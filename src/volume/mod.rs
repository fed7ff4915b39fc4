//! Volume registry: authoritative `AlcubVolume` records plus the in-memory
//! uuid reservation and node cache derived from them.

mod plan;
mod watch;

pub use plan::{NodeInfo, RegistryMutation, plan};
pub use watch::run;

use crate::crd::{AlcubVolume, AlcubVolumeSpec, AlcubVolumeStatus, VOLUME_FINALIZER};
use crate::error::{Error, Result};
use crate::store::{ResourceStore, delete_on_conflict, retry_on_conflict};
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

const KIND: &str = "AlcubVolume";

pub struct VolumeRegistry {
    store: Arc<dyn ResourceStore<AlcubVolume>>,
    uuids: RwLock<HashMap<String, String>>,
    nodes: RwLock<HashMap<String, NodeInfo>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn ensure_deletable(record: &AlcubVolume) -> Result<()> {
    if record.is_deletable() {
        return Ok(());
    }
    let status = record.current_status();
    Err(Error::Conflict {
        name: record.name_any(),
        reason: format!(
            "still attached (node={:?}, prevNode={:?}, devicePath={:?})",
            status.node, status.prev_node, status.device_path
        ),
    })
}

impl VolumeRegistry {
    pub fn new(store: Arc<dyn ResourceStore<AlcubVolume>>) -> Self {
        Self { store, uuids: RwLock::new(HashMap::new()), nodes: RwLock::new(HashMap::new()) }
    }

    /// Reserve `uuid` for `name`. Re-binding the same pair is a no-op.
    pub fn bind_uuid(&self, uuid: &str, name: &str) -> Result<()> {
        let mut uuids = write(&self.uuids);
        match uuids.get(uuid) {
            Some(existing) if existing == name => Ok(()),
            Some(existing) => {
                Err(Error::AlreadyBound { uuid: uuid.to_string(), existing: existing.clone() })
            }
            None => {
                uuids.insert(uuid.to_string(), name.to_string());
                Ok(())
            }
        }
    }

    pub fn release_uuid(&self, uuid: &str) {
        write(&self.uuids).remove(uuid);
    }

    fn name_for_uuid(&self, uuid: &str) -> Option<String> {
        read(&self.uuids).get(uuid).cloned()
    }

    /// Owned copy of what is known about `node`.
    pub fn node_info(&self, node: &str) -> Option<NodeInfo> {
        read(&self.nodes).get(node).cloned()
    }

    /// Create the record for `name`, holding the uuid reservation only if the
    /// record is actually persisted.
    pub async fn create(&self, name: &str, spec: AlcubVolumeSpec) -> Result<AlcubVolume> {
        let uuid = spec.uuid.clone();
        self.bind_uuid(&uuid, name)?;

        match self.store.create(&AlcubVolume::with_spec(name, spec)).await {
            Ok(record) => {
                info!("Created volume record {} (uuid {})", name, uuid);
                Ok(record)
            }
            Err(e) => {
                self.release_uuid(&uuid);
                Err(e)
            }
        }
    }

    /// Delete `name` once nothing references its device.
    ///
    /// The record lingers until reconciliation drops the finalizer; the uuid
    /// reservation is released immediately.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let record = self.get_by_name(name).await?;
        ensure_deletable(&record)?;
        delete_on_conflict(self.store.as_ref(), name, ensure_deletable).await?;
        self.release_uuid(&record.spec.uuid);
        info!("Deleted volume record {}", name);
        Ok(())
    }

    pub async fn get_by_uuid(&self, uuid: &str) -> Result<AlcubVolume> {
        let name = self.name_for_uuid(uuid).ok_or_else(|| Error::not_found("volume uuid", uuid))?;
        self.get_by_name(&name).await
    }

    pub async fn get_by_name(&self, name: &str) -> Result<AlcubVolume> {
        self.find_by_name(name).await?.ok_or_else(|| Error::not_found(KIND, name))
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<AlcubVolume>> {
        self.store.get(name).await
    }

    /// Replace spec and/or status wholesale; `None` leaves a part untouched.
    pub async fn update(
        &self,
        name: &str,
        spec: Option<AlcubVolumeSpec>,
        status: Option<AlcubVolumeStatus>,
    ) -> Result<AlcubVolume> {
        self.update_with(name, |record| {
            if let Some(spec) = &spec {
                record.spec = spec.clone();
            }
            if let Some(status) = &status {
                record.status = Some(status.clone());
            }
            Ok(())
        })
        .await
    }

    /// Read-modify-write with `mutate` re-applied to the freshest copy.
    pub async fn update_with<F>(&self, name: &str, mutate: F) -> Result<AlcubVolume>
    where
        F: FnMut(&mut AlcubVolume) -> Result<()> + Send,
    {
        retry_on_conflict(self.store.as_ref(), name, mutate).await
    }

    pub async fn list(&self) -> Result<Vec<AlcubVolume>> {
        self.store.list().await
    }

    pub async fn for_each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&AlcubVolume),
    {
        for record in self.store.list().await? {
            f(&record);
        }
        Ok(())
    }

    /// Bring caches in line with one observed record.
    pub async fn reconcile(&self, record: &AlcubVolume) -> Result<()> {
        let name = record.name_any();
        let known = record.status.as_ref().and_then(|s| self.node_info(&s.node));
        for mutation in plan(record, known.as_ref()) {
            self.apply(&name, mutation).await?;
        }
        Ok(())
    }

    async fn apply(&self, name: &str, mutation: RegistryMutation) -> Result<()> {
        match mutation {
            RegistryMutation::ReleaseFinalizer => {
                let result = self
                    .update_with(name, |record| {
                        ensure_deletable(record)?;
                        record.finalizers_mut().retain(|f| f != VOLUME_FINALIZER);
                        Ok(())
                    })
                    .await;
                match result {
                    Ok(_) => info!("Released finalizer on {}", name),
                    Err(e) if e.is_not_found() => debug!("Record {} already gone", name),
                    Err(e) => return Err(e),
                }
            }
            RegistryMutation::BindUuid { uuid, name } => {
                if let Err(e) = self.bind_uuid(&uuid, &name) {
                    warn!("Cannot index record {}: {}", name, e);
                }
            }
            RegistryMutation::ReleaseUuid { uuid, name } => {
                let mut uuids = write(&self.uuids);
                if uuids.get(&uuid) == Some(&name) {
                    uuids.remove(&uuid);
                    debug!("Released uuid {} of deleted record {}", uuid, name);
                }
            }
            RegistryMutation::RecordNode { node, info } => {
                debug!("Node {} storage ip {} peers {:?}", node, info.storage_ip, info.peer_nodes);
                write(&self.nodes).insert(node, info);
            }
        }
        Ok(())
    }

    /// Reconcile every stored record once; used before serving requests.
    pub async fn warm(&self) -> Result<usize> {
        let records = self.store.list().await?;
        for record in &records {
            self.reconcile(record).await?;
        }
        info!("Volume registry warmed with {} records", records.len());
        Ok(records.len())
    }
}
