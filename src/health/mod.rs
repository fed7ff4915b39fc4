//! Node health reconciliation: readiness labelling and fencing.
//!
//! Each observed `Node` is turned into a [`NodeView`]; the pure functions in
//! [`decide`] say which labels to change and whether to fence. The watcher
//! calls the [`Fencer`] and then writes all label changes in one
//! read-modify-write.

mod decide;
mod labels;
mod watch;

pub use decide::{
    FENCE_ENTITY_ANNOTATION, FENCED_AT_ANNOTATION, FencingAction, NodeMutation, NodeView, UNREACHABLE_TAINT,
    apply_mutations, eligibility_mutations, fenced_mutations, fencing_action, unfenced_mutations,
};
pub use labels::{HealthLabels, LabelPair, NODE_NAME_TEMPLATE};
pub use watch::run;

use crate::controller::Fencer;
use crate::csi::metrics::CsiMetrics;
use crate::error::Result;
use crate::store::{ResourceStore, retry_on_conflict};
use chrono::Utc;
use k8s_openapi::api::core::v1::Node;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct NodeHealthWatcher {
    store: Arc<dyn ResourceStore<Node>>,
    fencer: Arc<dyn Fencer>,
    labels: HealthLabels,
    metrics: Option<Arc<CsiMetrics>>,
}

impl NodeHealthWatcher {
    pub fn new(store: Arc<dyn ResourceStore<Node>>, fencer: Arc<dyn Fencer>, labels: HealthLabels) -> Self {
        Self { store, fencer, labels, metrics: None }
    }

    pub fn with_metrics(mut self, metrics: Arc<CsiMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn record(&self, action: &str, success: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_fencing(action, success);
        }
    }

    /// Evaluate one observed node. A failed fencing call is returned after the
    /// eligibility changes have been written, so the reconcile is retried.
    pub async fn reconcile(&self, node: &Node) -> Result<()> {
        if node.metadata.deletion_timestamp.is_some() {
            debug!("Node is being deleted, skipping");
            return Ok(());
        }
        let view = NodeView::from_node(node);
        let mut mutations = eligibility_mutations(&view, &self.labels);
        let mut fencing_error = None;

        match fencing_action(&view, &self.labels) {
            FencingAction::Stop { add_fence } => {
                let result = self.fencer.stop_node(&view.name, add_fence).await;
                self.record("stop", result.is_ok());
                match result {
                    Ok(entity) => {
                        info!("Fenced node {} (blacklist: {:?})", view.name, entity);
                        mutations.extend(fenced_mutations(&self.labels, Utc::now(), entity.as_deref()));
                    }
                    Err(e) => {
                        warn!("Failed to fence node {}: {}", view.name, e);
                        fencing_error = Some(e);
                    }
                }
            }
            FencingAction::Start { remove_fence } => {
                let result = self.fencer.start_node(&view.name, remove_fence, view.fence_entity.clone()).await;
                self.record("start", result.is_ok());
                match result {
                    Ok(()) => {
                        info!("Unfenced node {} (blacklist: {})", view.name, remove_fence);
                        mutations.extend(unfenced_mutations(&self.labels));
                    }
                    Err(e) => {
                        warn!("Failed to unfence node {}: {}", view.name, e);
                        fencing_error = Some(e);
                    }
                }
            }
            FencingAction::None => {}
        }

        if !mutations.is_empty() {
            debug!("Applying {:?} to node {}", mutations, view.name);
            retry_on_conflict(self.store.as_ref(), &view.name, |node| {
                apply_mutations(node, &mutations);
                Ok(())
            })
            .await?;
        }

        fencing_error.map_or(Ok(()), Err)
    }
}
