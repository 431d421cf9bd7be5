//! Placement filtering: which nodes may host a pod at all.

use std::collections::HashMap;

use pkg_types::node::{Node, NodeStatus, Taint};
use pkg_types::pack::RuntimeTag;
use pkg_types::pod::{Pod, TaintEffect, Toleration, TolerationOperator};

/// All feasibility conditions in one place. Resource fit is part of
/// feasibility; preemption planning separately asks "would this node work
/// if resources were freed" via [`feasible_ignoring_resources`].
pub fn feasible(node: &Node, pod: &Pod, tag: RuntimeTag) -> bool {
    feasible_ignoring_resources(node, pod, tag) && node.fits(&pod.requests)
}

pub fn feasible_ignoring_resources(node: &Node, pod: &Pod, tag: RuntimeTag) -> bool {
    if node.status != NodeStatus::Online || node.unschedulable {
        return false;
    }
    if !tag.compatible_with(node.runtime_kind) {
        return false;
    }
    if !selector_matches(&pod.node_selector, &node.labels) {
        return false;
    }
    taints_tolerated(&node.taints, &pod.tolerations)
}

/// Every selector entry must be present on the node with the same value.
fn selector_matches(selector: &HashMap<String, String>, labels: &HashMap<String, String>) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.get(k).is_some_and(|nv| nv == v))
}

/// A NoSchedule taint must be matched by a toleration; PreferNoSchedule is
/// a soft preference and never rejects.
fn taints_tolerated(taints: &[Taint], tolerations: &[Toleration]) -> bool {
    taints.iter().all(|taint| {
        let tolerated = tolerations.iter().any(|t| {
            if t.key != taint.key {
                return false;
            }
            match t.operator {
                TolerationOperator::Exists => true,
                TolerationOperator::Equal => t.value == taint.value,
            }
        });
        tolerated || taint.effect != TaintEffect::NoSchedule
    })
}

pub fn filter_nodes<'a>(nodes: &'a [Node], pod: &Pod, tag: RuntimeTag) -> Vec<&'a Node> {
    nodes.iter().filter(|n| feasible(n, pod, tag)).collect()
}
