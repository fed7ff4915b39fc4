use super::VolumeRegistry;
use crate::crd::AlcubVolume;
use crate::error::{Error, Result};
use futures::StreamExt;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Api, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

/// Drive [`VolumeRegistry::reconcile`] from a watch on all `AlcubVolume`s.
pub async fn run(registry: Arc<VolumeRegistry>, api: Api<AlcubVolume>) {
    Controller::new(api, Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, registry)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("Reconciled volume {}", obj.name),
                Err(e) => warn!("Volume reconcile error: {}", e),
            }
        })
        .await;
}

#[instrument(skip(record, registry), fields(volume = %record.name_any()))]
async fn reconcile(record: Arc<AlcubVolume>, registry: Arc<VolumeRegistry>) -> Result<Action> {
    registry.reconcile(&record).await?;
    Ok(Action::await_change())
}

fn error_policy(record: Arc<AlcubVolume>, err: &Error, _registry: Arc<VolumeRegistry>) -> Action {
    error!("Reconciliation error for volume {}: {}", record.name_any(), err);
    if err.is_retriable() {
        Action::requeue(Duration::from_secs(5))
    } else {
        Action::requeue(Duration::from_secs(60))
    }
}
