//! Scoring of feasible candidates. Ties always break on node id so a given
//! cluster state yields one placement.

use serde::{Deserialize, Serialize};

use pkg_types::node::Node;
use pkg_types::pod::Pod;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PlacementPolicy {
    /// Fewest pods on the node wins.
    #[default]
    Spread,
    /// Highest post-placement utilization wins.
    BinPack,
}

impl std::str::FromStr for PlacementPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spread" => Ok(PlacementPolicy::Spread),
            "binpack" => Ok(PlacementPolicy::BinPack),
            other => Err(format!("unknown placement policy '{other}'")),
        }
    }
}

pub fn pick<'a>(candidates: &[&'a Node], pod: &Pod, policy: PlacementPolicy) -> Option<&'a Node> {
    candidates
        .iter()
        .copied()
        .min_by(|a, b| match policy {
            PlacementPolicy::Spread => a
                .allocated
                .pods
                .cmp(&b.allocated.pods)
                .then_with(|| a.id.cmp(&b.id)),
            PlacementPolicy::BinPack => b
                .utilization_after(&pod.requests)
                .partial_cmp(&a.utilization_after(&pod.requests))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id)),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support::{make_node, make_pod};
    use pkg_types::node::RuntimeKind;

    #[test]
    fn spread_prefers_the_emptiest_node() {
        let mut loaded = make_node("loaded", RuntimeKind::Node);
        loaded.allocated.pods = 5;
        let empty = make_node("empty", RuntimeKind::Node);
        let pod = make_pod(100, 100);

        let candidates = vec![&loaded, &empty];
        let chosen = pick(&candidates, &pod, PlacementPolicy::Spread).unwrap();
        assert_eq!(chosen.name, "empty");
    }

    #[test]
    fn binpack_prefers_the_fullest_node() {
        let mut loaded = make_node("loaded", RuntimeKind::Node);
        loaded.allocated.cpu_millis = 3000;
        loaded.allocated.memory_bytes = 3 << 28;
        loaded.allocated.pods = 5;
        let empty = make_node("empty", RuntimeKind::Node);
        let pod = make_pod(100, 100);

        let candidates = vec![&empty, &loaded];
        let chosen = pick(&candidates, &pod, PlacementPolicy::BinPack).unwrap();
        assert_eq!(chosen.name, "loaded");
    }

    #[test]
    fn ties_break_on_node_id() {
        let a = make_node("a", RuntimeKind::Node);
        let b = make_node("b", RuntimeKind::Node);
        let pod = make_pod(100, 100);
        let expected = if a.id < b.id { a.id } else { b.id };

        let candidates = vec![&a, &b];
        let chosen = pick(&candidates, &pod, PlacementPolicy::Spread).unwrap();
        assert_eq!(chosen.id, expected);

        // Same outcome regardless of candidate order.
        let candidates = vec![&b, &a];
        let chosen = pick(&candidates, &pod, PlacementPolicy::Spread).unwrap();
        assert_eq!(chosen.id, expected);
    }

    #[test]
    fn empty_candidates_yield_none() {
        let pod = make_pod(100, 100);
        assert!(pick(&[], &pod, PlacementPolicy::Spread).is_none());
    }
}
