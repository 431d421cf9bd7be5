//! Preemption planning.
//!
//! When filtering leaves no candidate purely because of resources, find the
//! node where evicting the cheapest set of lower-priority pods frees enough
//! room. Nodes compare by (eviction count, summed evicted priority, node
//! id); victims within a node are taken lowest priority first, then by pod
//! id, so planning is deterministic.

use uuid::Uuid;

use pkg_types::node::Node;
use pkg_types::pack::RuntimeTag;
use pkg_types::pod::{Pod, PodStatus};

use crate::filter;

#[derive(Debug, Clone)]
pub struct PreemptionPlan {
    pub node_id: Uuid,
    pub victims: Vec<Pod>,
}

pub fn plan(
    nodes: &[Node],
    pod: &Pod,
    tag: RuntimeTag,
    pods_on_node: impl Fn(Uuid) -> Vec<Pod>,
) -> Option<PreemptionPlan> {
    let mut best: Option<(usize, i64, Uuid, Vec<Pod>)> = None;

    for node in nodes {
        if !filter::feasible_ignoring_resources(node, pod, tag) {
            continue;
        }
        let Some(victims) = victims_for(node, pod, pods_on_node(node.id)) else {
            continue;
        };
        let count = victims.len();
        let priority_sum: i64 = victims.iter().map(|v| v.priority).sum();
        let candidate = (count, priority_sum, node.id, victims);
        let better = match &best {
            None => true,
            Some((c, p, id, _)) => (count, priority_sum, node.id) < (*c, *p, *id),
        };
        if better {
            best = Some(candidate);
        }
    }

    best.map(|(_, _, node_id, victims)| PreemptionPlan { node_id, victims })
}

/// The minimal prefix of evictable pods (lowest priority first) that frees
/// enough of every dimension. `None` when even evicting all of them would
/// not fit.
fn victims_for(node: &Node, pod: &Pod, mut candidates: Vec<Pod>) -> Option<Vec<Pod>> {
    candidates.retain(|p| {
        p.priority < pod.priority
            && matches!(
                p.status,
                PodStatus::Scheduled | PodStatus::Starting | PodStatus::Running
            )
    });
    candidates.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));

    let mut freed_cpu = 0u64;
    let mut freed_mem = 0u64;
    let mut freed_pods = 0u32;
    let mut victims = Vec::new();

    let enough = |freed_cpu: u64, freed_mem: u64, freed_pods: u32| {
        let free_cpu = node
            .allocatable
            .cpu_millis
            .saturating_sub(node.allocated.cpu_millis.saturating_sub(freed_cpu));
        let free_mem = node
            .allocatable
            .memory_bytes
            .saturating_sub(node.allocated.memory_bytes.saturating_sub(freed_mem));
        let used_slots = node.allocated.pods.saturating_sub(freed_pods);
        pod.requests.cpu_millis <= free_cpu
            && pod.requests.memory_bytes <= free_mem
            && used_slots < node.allocatable.pods
    };

    if enough(0, 0, 0) {
        // Resources already fit; preemption is not the obstacle here.
        return Some(Vec::new());
    }
    for victim in candidates {
        freed_cpu += victim.requests.cpu_millis;
        freed_mem += victim.requests.memory_bytes;
        freed_pods += 1;
        victims.push(victim);
        if enough(freed_cpu, freed_mem, freed_pods) {
            return Some(victims);
        }
    }
    None
}
