//! Pure node health decisions. Nothing here performs I/O.

use super::labels::HealthLabels;
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use std::collections::BTreeMap;

pub const UNREACHABLE_TAINT: &str = "node.kubernetes.io/unreachable";
const NO_EXECUTE: &str = "NoExecute";

/// When the watcher fenced the node, RFC 3339.
pub const FENCED_AT_ANNOTATION: &str = "alcub.csi.io/fenced-at";

/// Blacklist entity applied while fencing, removed again on recovery.
pub const FENCE_ENTITY_ANNOTATION: &str = "alcub.csi.io/fence-entity";

/// The parts of a `Node` the decisions look at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeView {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub unreachable: bool,
    pub unschedulable: bool,
    /// Blacklist entity recorded when the node was fenced.
    pub fence_entity: Option<String>,
}

impl NodeView {
    pub fn from_node(node: &Node) -> Self {
        let spec = node.spec.as_ref();
        let unreachable = spec
            .and_then(|s| s.taints.as_ref())
            .is_some_and(|taints| {
                taints.iter().any(|t| t.key == UNREACHABLE_TAINT && t.effect == NO_EXECUTE)
            });
        Self {
            name: node.name_any(),
            labels: node.labels().clone(),
            unreachable,
            unschedulable: spec.and_then(|s| s.unschedulable).unwrap_or(false),
            fence_entity: node.annotations().get(FENCE_ENTITY_ANNOTATION).filter(|e| !e.is_empty()).cloned(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        !self.unreachable && !self.unschedulable
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeMutation {
    SetLabel { key: String, value: String },
    RemoveLabel { key: String },
    SetAnnotation { key: String, value: String },
    RemoveAnnotation { key: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FencingAction {
    Stop { add_fence: bool },
    Start { remove_fence: bool },
    None,
}

/// Keep the readiness label in step with eligibility.
pub fn eligibility_mutations(view: &NodeView, labels: &HealthLabels) -> Vec<NodeMutation> {
    let eligible = labels.eligibility.render(&view.name).is_set(&view.labels);
    let ready = labels.readiness.is_set(&view.labels);
    match (eligible, ready) {
        (true, false) => vec![NodeMutation::SetLabel {
            key: labels.readiness.key.clone(),
            value: labels.readiness.value.clone(),
        }],
        (false, _) if view.labels.contains_key(&labels.readiness.key) => {
            vec![NodeMutation::RemoveLabel { key: labels.readiness.key.clone() }]
        }
        _ => Vec::new(),
    }
}

pub fn fencing_action(view: &NodeView, labels: &HealthLabels) -> FencingAction {
    let maintenance = labels.maintenance.is_set(&view.labels);
    let fenced = labels.fenced.is_set(&view.labels);
    let own_fence = !labels.ha_managed.as_ref().is_some_and(|ha| ha.is_set(&view.labels));

    if !view.is_healthy() && maintenance && !fenced {
        return FencingAction::Stop { add_fence: own_fence };
    }
    if fenced && view.is_healthy() && !maintenance && !view.unreachable {
        return FencingAction::Start { remove_fence: own_fence };
    }
    FencingAction::None
}

pub fn fenced_mutations(labels: &HealthLabels, at: DateTime<Utc>, entity: Option<&str>) -> Vec<NodeMutation> {
    let mut mutations = vec![
        NodeMutation::SetLabel { key: labels.fenced.key.clone(), value: labels.fenced.value.clone() },
        NodeMutation::SetAnnotation {
            key: FENCED_AT_ANNOTATION.to_string(),
            value: at.to_rfc3339_opts(SecondsFormat::Secs, true),
        },
    ];
    if let Some(entity) = entity {
        mutations.push(NodeMutation::SetAnnotation {
            key: FENCE_ENTITY_ANNOTATION.to_string(),
            value: entity.to_string(),
        });
    }
    mutations
}

pub fn unfenced_mutations(labels: &HealthLabels) -> Vec<NodeMutation> {
    vec![
        NodeMutation::RemoveLabel { key: labels.fenced.key.clone() },
        NodeMutation::RemoveAnnotation { key: FENCED_AT_ANNOTATION.to_string() },
        NodeMutation::RemoveAnnotation { key: FENCE_ENTITY_ANNOTATION.to_string() },
    ]
}

pub fn apply_mutations(node: &mut Node, mutations: &[NodeMutation]) {
    for mutation in mutations {
        match mutation {
            NodeMutation::SetLabel { key, value } => {
                node.labels_mut().insert(key.clone(), value.clone());
            }
            NodeMutation::RemoveLabel { key } => {
                node.labels_mut().remove(key);
            }
            NodeMutation::SetAnnotation { key, value } => {
                node.annotations_mut().insert(key.clone(), value.clone());
            }
            NodeMutation::RemoveAnnotation { key } => {
                node.annotations_mut().remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::labels::LabelPair;
    use k8s_openapi::api::core::v1::{NodeSpec, Taint};
    use proptest::prelude::*;

    fn health_labels() -> HealthLabels {
        HealthLabels {
            eligibility: LabelPair::new("alcubierre-%N", "enable"),
            readiness: LabelPair::new("csi-alcub", "enable"),
            maintenance: LabelPair::new("alcub.csi.io/maintenance", "true"),
            fenced: LabelPair::new("csi-alcub-maintain", "true"),
            ha_managed: Some(LabelPair::new("hostha-maintain", "true")),
        }
    }

    fn view(unreachable: bool, unschedulable: bool, labels: &[(&str, &str)]) -> NodeView {
        NodeView {
            name: "worker-1".to_string(),
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            unreachable,
            unschedulable,
            fence_entity: None,
        }
    }

    #[test]
    fn test_view_from_node() {
        let mut node = Node::default();
        node.metadata.name = Some("worker-1".to_string());
        node.spec = Some(NodeSpec {
            taints: Some(vec![
                Taint { key: UNREACHABLE_TAINT.to_string(), effect: "NoSchedule".to_string(), ..Default::default() },
                Taint { key: "dedicated".to_string(), effect: NO_EXECUTE.to_string(), ..Default::default() },
            ]),
            ..Default::default()
        });
        let v = NodeView::from_node(&node);
        assert!(!v.unreachable, "only the NoExecute unreachable taint counts");
        assert!(v.is_healthy());

        node.spec.as_mut().unwrap().taints.as_mut().unwrap().push(Taint {
            key: UNREACHABLE_TAINT.to_string(),
            effect: NO_EXECUTE.to_string(),
            ..Default::default()
        });
        node.spec.as_mut().unwrap().unschedulable = Some(true);
        let v = NodeView::from_node(&node);
        assert!(v.unreachable && v.unschedulable);
        assert_eq!(v.name, "worker-1");
    }

    #[test]
    fn test_eligibility_uses_node_name_template() {
        let labels = health_labels();
        let eligible = view(false, false, &[("alcubierre-worker-1", "enable")]);
        assert_eq!(
            eligibility_mutations(&eligible, &labels),
            vec![NodeMutation::SetLabel { key: "csi-alcub".to_string(), value: "enable".to_string() }]
        );

        let other_node = view(false, false, &[("alcubierre-worker-2", "enable"), ("csi-alcub", "enable")]);
        assert_eq!(
            eligibility_mutations(&other_node, &labels),
            vec![NodeMutation::RemoveLabel { key: "csi-alcub".to_string() }]
        );

        let settled = view(false, false, &[("alcubierre-worker-1", "enable"), ("csi-alcub", "enable")]);
        assert!(eligibility_mutations(&settled, &labels).is_empty());
        assert!(eligibility_mutations(&view(false, false, &[]), &labels).is_empty());
    }

    #[test]
    fn test_unhealthy_without_maintenance_never_fences() {
        let labels = health_labels();
        assert_eq!(fencing_action(&view(true, false, &[]), &labels), FencingAction::None);
        assert_eq!(fencing_action(&view(false, true, &[]), &labels), FencingAction::None);
    }

    #[test]
    fn test_stop_and_start() {
        let labels = health_labels();
        let down = view(true, false, &[("alcub.csi.io/maintenance", "true")]);
        assert_eq!(fencing_action(&down, &labels), FencingAction::Stop { add_fence: true });

        let fenced = view(true, false, &[("alcub.csi.io/maintenance", "true"), ("csi-alcub-maintain", "true")]);
        assert_eq!(fencing_action(&fenced, &labels), FencingAction::None);

        let back_under_maintenance =
            view(false, false, &[("alcub.csi.io/maintenance", "true"), ("csi-alcub-maintain", "true")]);
        assert_eq!(fencing_action(&back_under_maintenance, &labels), FencingAction::None);

        let recovered = view(false, false, &[("csi-alcub-maintain", "true")]);
        assert_eq!(fencing_action(&recovered, &labels), FencingAction::Start { remove_fence: true });
    }

    #[test]
    fn test_ha_managed_nodes_keep_external_fence() {
        let labels = health_labels();
        let down = view(true, false, &[("alcub.csi.io/maintenance", "true"), ("hostha-maintain", "true")]);
        assert_eq!(fencing_action(&down, &labels), FencingAction::Stop { add_fence: false });
        let up = view(false, false, &[("csi-alcub-maintain", "true"), ("hostha-maintain", "true")]);
        assert_eq!(fencing_action(&up, &labels), FencingAction::Start { remove_fence: false });
    }

    #[test]
    fn test_apply_mutations() {
        let labels = health_labels();
        let at = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z").unwrap().with_timezone(&Utc);
        let mut node = Node::default();

        apply_mutations(&mut node, &fenced_mutations(&labels, at, Some("10.0.0.5:0/0")));
        assert_eq!(node.labels().get("csi-alcub-maintain").map(String::as_str), Some("true"));
        assert_eq!(
            node.annotations().get(FENCED_AT_ANNOTATION).map(String::as_str),
            Some("2024-05-01T10:00:00Z")
        );
        assert_eq!(NodeView::from_node(&node).fence_entity.as_deref(), Some("10.0.0.5:0/0"));

        apply_mutations(&mut node, &unfenced_mutations(&labels));
        assert!(node.labels().is_empty());
        assert!(node.annotations().is_empty());
    }

    proptest! {
        #[test]
        fn prop_fencing_decision_table(
            unreachable in any::<bool>(),
            unschedulable in any::<bool>(),
            maintenance in any::<bool>(),
            fenced in any::<bool>(),
            ha in any::<bool>(),
        ) {
            let labels = health_labels();
            let mut pairs = Vec::new();
            if maintenance { pairs.push(("alcub.csi.io/maintenance", "true")); }
            if fenced { pairs.push(("csi-alcub-maintain", "true")); }
            if ha { pairs.push(("hostha-maintain", "true")); }
            let v = view(unreachable, unschedulable, &pairs);
            let healthy = !unreachable && !unschedulable;

            match fencing_action(&v, &labels) {
                FencingAction::Stop { add_fence } => {
                    prop_assert!(!healthy && maintenance && !fenced);
                    prop_assert_eq!(add_fence, !ha);
                }
                FencingAction::Start { remove_fence } => {
                    prop_assert!(fenced && healthy && !maintenance);
                    prop_assert_eq!(remove_fence, !ha);
                }
                FencingAction::None => {
                    prop_assert!(!(!healthy && maintenance && !fenced));
                    prop_assert!(!(fenced && healthy && !maintenance));
                }
            }

            // Applying the outcome of a decision settles the node.
            let mut after = v.clone();
            match fencing_action(&v, &labels) {
                FencingAction::Stop { .. } => { after.labels.insert("csi-alcub-maintain".into(), "true".into()); }
                FencingAction::Start { .. } => { after.labels.remove("csi-alcub-maintain"); }
                FencingAction::None => {}
            }
            prop_assert_eq!(fencing_action(&after, &labels), FencingAction::None);
        }
    }
}
