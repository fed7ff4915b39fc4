use super::NodeHealthWatcher;
use crate::error::{Error, Result};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Api, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

/// Drive [`NodeHealthWatcher::reconcile`] from a watch on all `Node`s.
pub async fn run(watcher: Arc<NodeHealthWatcher>, api: Api<Node>) {
    Controller::new(api, Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, watcher)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("Reconciled node {}", obj.name),
                Err(e) => warn!("Node reconcile error: {}", e),
            }
        })
        .await;
}

#[instrument(skip(node, watcher), fields(node = %node.name_any()))]
async fn reconcile(node: Arc<Node>, watcher: Arc<NodeHealthWatcher>) -> Result<Action> {
    watcher.reconcile(&node).await?;
    // Taints can change without a label edit from us; re-check periodically.
    Ok(Action::requeue(Duration::from_secs(300)))
}

fn error_policy(node: Arc<Node>, err: &Error, _watcher: Arc<NodeHealthWatcher>) -> Action {
    error!("Reconciliation error for node {}: {}", node.name_any(), err);
    if err.is_retriable() || err.is_not_found() {
        Action::requeue(Duration::from_secs(10))
    } else {
        Action::requeue(Duration::from_secs(60))
    }
}
