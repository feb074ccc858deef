//! # Node Placement
//!
//! Merges the placement configured on the managed resource into the pod
//! templates of deployments (infra placement) and daemonsets (workloads
//! placement). Selectors already present on the template win; tolerations
//! and affinity terms are appended.

use crate::constants::{NODE_OS_LABEL, NODE_OS_LINUX};
use crate::crd::NodePlacement;
use k8s_openapi::api::core::v1::{
    Affinity, NodeAffinity, PodAffinity, PodAntiAffinity, PodSpec,
};

/// Merge `placement` into `pod_spec`
///
/// The OS selector is defaulted to linux even without a placement.
pub fn inject_placement(pod_spec: &mut PodSpec, placement: Option<&NodePlacement>) {
    let mut selector = placement
        .and_then(|p| p.node_selector.clone())
        .unwrap_or_default();
    selector
        .entry(NODE_OS_LABEL.to_string())
        .or_insert_with(|| NODE_OS_LINUX.to_string());

    let pod_selector = pod_spec.node_selector.get_or_insert_with(Default::default);
    for (key, value) in selector {
        pod_selector.entry(key).or_insert(value);
    }

    let Some(placement) = placement else {
        return;
    };

    if let Some(affinity) = &placement.affinity {
        match pod_spec.affinity.as_mut() {
            None => pod_spec.affinity = Some(affinity.clone()),
            Some(existing) => merge_affinity(existing, affinity),
        }
    }

    if let Some(tolerations) = placement.tolerations.as_ref().filter(|t| !t.is_empty()) {
        pod_spec
            .tolerations
            .get_or_insert_with(Vec::new)
            .extend(tolerations.iter().cloned());
    }
}

fn merge_affinity(existing: &mut Affinity, extra: &Affinity) {
    if let Some(node) = &extra.node_affinity {
        match existing.node_affinity.as_mut() {
            None => existing.node_affinity = Some(node.clone()),
            Some(current) => merge_node_affinity(current, node),
        }
    }
    if let Some(pod) = &extra.pod_affinity {
        match existing.pod_affinity.as_mut() {
            None => existing.pod_affinity = Some(pod.clone()),
            Some(current) => merge_pod_affinity(current, pod),
        }
    }
    if let Some(anti) = &extra.pod_anti_affinity {
        match existing.pod_anti_affinity.as_mut() {
            None => existing.pod_anti_affinity = Some(anti.clone()),
            Some(current) => merge_pod_anti_affinity(current, anti),
        }
    }
}

fn merge_node_affinity(current: &mut NodeAffinity, extra: &NodeAffinity) {
    if let Some(required) = &extra.required_during_scheduling_ignored_during_execution {
        match current
            .required_during_scheduling_ignored_during_execution
            .as_mut()
        {
            None => {
                current.required_during_scheduling_ignored_during_execution =
                    Some(required.clone());
            }
            Some(selector) => selector
                .node_selector_terms
                .extend(required.node_selector_terms.iter().cloned()),
        }
    }
    append(
        &mut current.preferred_during_scheduling_ignored_during_execution,
        &extra.preferred_during_scheduling_ignored_during_execution,
    );
}

fn merge_pod_affinity(current: &mut PodAffinity, extra: &PodAffinity) {
    append(
        &mut current.required_during_scheduling_ignored_during_execution,
        &extra.required_during_scheduling_ignored_during_execution,
    );
    append(
        &mut current.preferred_during_scheduling_ignored_during_execution,
        &extra.preferred_during_scheduling_ignored_during_execution,
    );
}

fn merge_pod_anti_affinity(current: &mut PodAntiAffinity, extra: &PodAntiAffinity) {
    append(
        &mut current.required_during_scheduling_ignored_during_execution,
        &extra.required_during_scheduling_ignored_during_execution,
    );
    append(
        &mut current.preferred_during_scheduling_ignored_during_execution,
        &extra.preferred_during_scheduling_ignored_during_execution,
    );
}

fn append<T: Clone>(target: &mut Option<Vec<T>>, extra: &Option<Vec<T>>) {
    if let Some(extra) = extra.as_ref().filter(|e| !e.is_empty()) {
        target.get_or_insert_with(Vec::new).extend(extra.iter().cloned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, Toleration,
    };
    use std::collections::BTreeMap;

    fn term(key: &str) -> NodeSelectorTerm {
        NodeSelectorTerm {
            match_expressions: Some(vec![NodeSelectorRequirement {
                key: key.to_string(),
                operator: "Exists".to_string(),
                values: None,
            }]),
            ..NodeSelectorTerm::default()
        }
    }

    fn required(keys: &[&str]) -> Affinity {
        Affinity {
            node_affinity: Some(NodeAffinity {
                required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                    node_selector_terms: keys.iter().map(|k| term(k)).collect(),
                }),
                ..NodeAffinity::default()
            }),
            ..Affinity::default()
        }
    }

    #[test]
    fn test_defaults_linux_selector() {
        let mut spec = PodSpec::default();
        inject_placement(&mut spec, None);
        assert_eq!(
            spec.node_selector.unwrap().get(NODE_OS_LABEL).map(String::as_str),
            Some(NODE_OS_LINUX)
        );
    }

    #[test]
    fn test_pod_selector_wins() {
        let mut spec = PodSpec {
            node_selector: Some(BTreeMap::from([("zone".to_string(), "a".to_string())])),
            ..PodSpec::default()
        };
        let placement = NodePlacement {
            node_selector: Some(BTreeMap::from([
                ("zone".to_string(), "b".to_string()),
                ("tier".to_string(), "infra".to_string()),
            ])),
            ..NodePlacement::default()
        };
        inject_placement(&mut spec, Some(&placement));
        let selector = spec.node_selector.unwrap();
        assert_eq!(selector["zone"], "a");
        assert_eq!(selector["tier"], "infra");
        assert_eq!(selector[NODE_OS_LABEL], NODE_OS_LINUX);
    }

    #[test]
    fn test_tolerations_and_affinity_are_appended() {
        let toleration = |key: &str| Toleration {
            key: Some(key.to_string()),
            operator: Some("Exists".to_string()),
            ..Toleration::default()
        };
        let mut spec = PodSpec {
            tolerations: Some(vec![toleration("existing")]),
            affinity: Some(required(&["existing"])),
            ..PodSpec::default()
        };
        let placement = NodePlacement {
            tolerations: Some(vec![toleration("added")]),
            affinity: Some(required(&["added"])),
            ..NodePlacement::default()
        };
        inject_placement(&mut spec, Some(&placement));

        assert_eq!(spec.tolerations.unwrap().len(), 2);
        let terms = spec
            .affinity
            .unwrap()
            .node_affinity
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .unwrap()
            .node_selector_terms;
        assert_eq!(terms, vec![term("existing"), term("added")]);
    }

    #[test]
    fn test_affinity_copied_when_absent() {
        let mut spec = PodSpec::default();
        let placement = NodePlacement {
            affinity: Some(required(&["gpu"])),
            ..NodePlacement::default()
        };
        inject_placement(&mut spec, Some(&placement));
        assert_eq!(spec.affinity, Some(required(&["gpu"])));
    }
}
