//! Pod scheduler: admission of pending pods onto nodes.
//!
//! Placement runs filter → score → atomic commit; the commit re-checks
//! resources inside the state store's lock and the whole attempt retries a
//! bounded number of times when it loses the race. Preemption (when
//! enabled) evicts lower-priority pods to make room, and rollback moves a
//! live pod across pack versions in place.

pub mod filter;
pub mod preempt;
pub mod score;

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pkg_constants::scheduling::{MAX_SCHEDULING_ATTEMPTS, PLACEMENT_COMMIT_RETRIES};
use pkg_gateway::Gateway;
use pkg_metrics::{MetricsRegistry, well_known};
use pkg_state::StateStore;
use pkg_state::watch::{ChangeKind, EntityRef};
use pkg_types::error::Error;
use pkg_types::pod::{Pod, PodStatus, PodTransition};

pub use score::PlacementPolicy;

#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    pub policy: PlacementPolicy,
    pub preemption: bool,
}

pub struct Scheduler {
    store: Arc<StateStore>,
    gateway: Arc<Gateway>,
    metrics: Arc<MetricsRegistry>,
    config: SchedulerConfig,
    cancel: CancellationToken,
}

/// What became of one placement attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Placed(Uuid),
    /// Retryable failure was recorded on the pod; try again next tick.
    Deferred,
    /// The attempt budget ran out and the pod was failed.
    GaveUp,
}

impl Scheduler {
    pub fn new(
        store: Arc<StateStore>,
        gateway: Arc<Gateway>,
        config: SchedulerConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            gateway,
            metrics,
            config,
            cancel: CancellationToken::new(),
        })
    }

    /// Event-driven placement of pending pods: a new pod tries immediately,
    /// a new or updated node retries everything still pending.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            info!(policy = ?scheduler.config.policy, preemption = scheduler.config.preemption, "scheduler started");
            let mut events = scheduler.store.subscribe();
            loop {
                tokio::select! {
                    _ = scheduler.cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) if event.kind == ChangeKind::Put => match event.entity {
                            EntityRef::Pod(pod_id) => {
                                if scheduler
                                    .store
                                    .get_pod(pod_id)
                                    .is_some_and(|p| p.status == PodStatus::Pending)
                                {
                                    let _ = scheduler.place_or_record(pod_id).await;
                                }
                            }
                            EntityRef::Node(_) => scheduler.place_all_pending().await,
                            _ => {}
                        },
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                            scheduler.place_all_pending().await;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    async fn place_all_pending(&self) {
        for pod in self.store.pending_pods_by_priority() {
            let _ = self.place_or_record(pod.id).await;
        }
    }

    /// Place a pending pod, or book the failure against its attempt budget.
    pub async fn place_or_record(&self, pod_id: Uuid) -> Result<Placement, Error> {
        match self.place_pod(pod_id).await {
            Ok(node_id) => Ok(Placement::Placed(node_id)),
            Err(e) if e.is_retryable() => {
                let attempts = self.store.record_unscheduled(pod_id, e.code()).await?;
                if attempts >= MAX_SCHEDULING_ATTEMPTS {
                    self.metrics.counter_inc(well_known::PODS_UNSCHEDULABLE);
                    self.store
                        .transition_pod(pod_id, PodTransition::Fail, Some("UNSCHEDULABLE"))
                        .await?;
                    warn!(pod = %pod_id, attempts, "pod failed after exhausting placement attempts");
                    return Ok(Placement::GaveUp);
                }
                debug!(pod = %pod_id, attempts, error = %e, "placement deferred");
                Ok(Placement::Deferred)
            }
            Err(e) => Err(e),
        }
    }

    /// One full placement: filter, score, commit (bounded retries), with
    /// preemption as the fallback when resources are the only obstacle.
    pub async fn place_pod(&self, pod_id: Uuid) -> Result<Uuid, Error> {
        let pod = self
            .store
            .get_pod(pod_id)
            .ok_or(Error::PodNotFound(pod_id))?;
        if pod.status != PodStatus::Pending {
            return Err(Error::InvalidState(format!(
                "pod {pod_id} is {}, placement needs pending",
                pod.status
            )));
        }
        let pack = self
            .store
            .get_pack(pod.pack_id)
            .ok_or_else(|| Error::PackNotFound(pod.pack_id.to_string()))?;

        for attempt in 0..PLACEMENT_COMMIT_RETRIES {
            let nodes = self.store.schedulable_nodes();
            let candidates = filter::filter_nodes(&nodes, &pod, pack.runtime_tag);

            let chosen = match score::pick(&candidates, &pod, self.config.policy) {
                Some(node) => node.id,
                None => {
                    // Resources may be the only obstacle; preemption can fix
                    // that, nothing can fix the rest.
                    let resource_starved = nodes
                        .iter()
                        .any(|n| filter::feasible_ignoring_resources(n, &pod, pack.runtime_tag));
                    if resource_starved && self.config.preemption {
                        match self.preempt_for(&pod, pack.runtime_tag, &nodes).await? {
                            Some(node_id) => node_id,
                            None => {
                                return Err(Error::NoCompatibleNodes(format!(
                                    "no node can host pod {pod_id}, even with preemption"
                                )));
                            }
                        }
                    } else if resource_starved {
                        return Err(Error::NoCompatibleNodes(format!(
                            "no node has room for pod {pod_id}"
                        )));
                    } else {
                        return Err(Error::NoCompatibleNodes(format!(
                            "no node passes filters for pod {pod_id}"
                        )));
                    }
                }
            };

            match self.store.schedule_pod(pod_id, chosen).await {
                Ok(_) => {
                    self.metrics.counter_inc(well_known::PODS_SCHEDULED);
                    return Ok(chosen);
                }
                Err(Error::InsufficientResources(node)) => {
                    debug!(pod = %pod_id, %node, attempt, "lost the commit race, retrying");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::NoCompatibleNodes(format!(
            "pod {pod_id} lost the commit race {PLACEMENT_COMMIT_RETRIES} times"
        )))
    }

    /// Evict the planned victims and return the freed node.
    async fn preempt_for(
        &self,
        pod: &Pod,
        tag: pkg_types::pack::RuntimeTag,
        nodes: &[pkg_types::node::Node],
    ) -> Result<Option<Uuid>, Error> {
        let Some(plan) = preempt::plan(nodes, pod, tag, |node_id| self.store.pods_on_node(node_id))
        else {
            return Ok(None);
        };
        info!(
            pod = %pod.id,
            node = %plan.node_id,
            victims = plan.victims.len(),
            "preempting lower-priority pods"
        );
        for victim in &plan.victims {
            let node_id = victim.node_id;
            self.store
                .transition_pod(
                    victim.id,
                    PodTransition::Evict,
                    Some(&format!("preempted by pod {} (priority {})", pod.id, pod.priority)),
                )
                .await?;
            self.metrics.counter_inc(well_known::PODS_PREEMPTED);
            if let Some(node_id) = node_id {
                if let Err(e) = self.gateway.stop_pod(node_id, victim.id, "PREEMPTED", true) {
                    debug!(victim = %victim.id, error = %e, "stop command not delivered");
                }
            }
        }
        Ok(Some(plan.node_id))
    }

    /// In-place version swap; validation lives in the state store.
    pub async fn rollback(&self, pod_id: Uuid, target_version: &str) -> Result<Pod, Error> {
        self.store.rollback_pod(pod_id, target_version).await
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use chrono::Utc;
    use pkg_types::node::{Node, NodeAllocated, NodeCapacity, NodeStatus, RuntimeKind};
    use pkg_types::pod::{Pod, PodStatus, ResourceRequests};
    use std::collections::HashMap;
    use uuid::Uuid;

    pub fn make_node(name: &str, runtime_kind: RuntimeKind) -> Node {
        Node {
            id: Uuid::new_v4(),
            name: name.to_string(),
            runtime_kind,
            capability_tags: vec![],
            allocatable: NodeCapacity {
                cpu_millis: 4000,
                memory_bytes: 8 << 30,
                pods: 10,
                storage_bytes: 0,
            },
            allocated: NodeAllocated::default(),
            labels: HashMap::new(),
            taints: vec![],
            status: NodeStatus::Online,
            registered_at: Utc::now(),
            last_heartbeat: Utc::now(),
            unschedulable: false,
        }
    }

    pub fn make_pod(cpu_millis: u64, memory_bytes: u64) -> Pod {
        Pod {
            id: Uuid::new_v4(),
            pack_id: Uuid::new_v4(),
            pack_version: "1.0.0".to_string(),
            namespace: "default".to_string(),
            node_id: None,
            status: PodStatus::Pending,
            priority: 0,
            priority_class: None,
            requests: ResourceRequests {
                cpu_millis,
                memory_bytes,
            },
            limits: ResourceRequests::default(),
            labels: HashMap::new(),
            tolerations: vec![],
            node_selector: HashMap::new(),
            env: HashMap::new(),
            created_by: "test".to_string(),
            status_message: None,
            scheduling_attempts: 0,
            created_at: Utc::now(),
            scheduled_at: None,
            started_at: None,
            stopped_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_gateway::GatewayConfig;
    use pkg_gateway::auth::StaticTokenVerifier;
    use pkg_types::node::{NodeCapacity, RegisterNodeInput, RuntimeKind, Taint};
    use pkg_types::pack::{PackSpec, RuntimeTag};
    use pkg_types::pod::{
        PodSpec, ResourceRequests, TaintEffect, Toleration, TolerationOperator,
    };
    use pkg_types::priority::PriorityClass;
    use std::collections::HashMap;

    fn harness(config: SchedulerConfig) -> (Arc<StateStore>, Arc<Scheduler>) {
        let store = Arc::new(StateStore::in_memory());
        let metrics = Arc::new(MetricsRegistry::with_well_known());
        let gateway = Gateway::new(
            store.clone(),
            Arc::new(StaticTokenVerifier::new("t")),
            GatewayConfig::default(),
            metrics.clone(),
        );
        let scheduler = Scheduler::new(store.clone(), gateway, config, metrics);
        (store, scheduler)
    }

    fn node_input(name: &str, cpu: u64, mem: u64, pods: u32) -> RegisterNodeInput {
        RegisterNodeInput {
            name: name.to_string(),
            runtime_kind: RuntimeKind::Node,
            capability_tags: vec![],
            allocatable: NodeCapacity {
                cpu_millis: cpu,
                memory_bytes: mem,
                pods,
                storage_bytes: 0,
            },
            labels: HashMap::new(),
            taints: vec![],
        }
    }

    fn pack_spec(name: &str, tag: RuntimeTag) -> PackSpec {
        PackSpec {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            runtime_tag: tag,
            owner_id: "test".into(),
            bundle_url: None,
            bundle_bytes: Some(b"exports.main = () => {}".to_vec()),
            metadata: Default::default(),
        }
    }

    fn pod_spec(pack_id: Uuid, cpu: u64, mem: u64) -> PodSpec {
        PodSpec {
            pack_id,
            namespace: "default".into(),
            priority_class: None,
            requests: ResourceRequests {
                cpu_millis: cpu,
                memory_bytes: mem,
            },
            limits: ResourceRequests::default(),
            labels: HashMap::new(),
            tolerations: vec![],
            node_selector: HashMap::new(),
            env: HashMap::new(),
            created_by: "test".into(),
        }
    }

    #[tokio::test]
    async fn basic_placement() {
        let (store, scheduler) = harness(SchedulerConfig::default());
        let pack = store
            .register_pack(pack_spec("p", RuntimeTag::Node))
            .await
            .unwrap();
        let node = store
            .add_node(node_input("na", 1000, 1024, 10))
            .await
            .unwrap();
        let pod = store.create_pod(pod_spec(pack.id, 200, 256)).await.unwrap();

        let placed = scheduler.place_pod(pod.id).await.unwrap();
        assert_eq!(placed, node.id);

        let pod = store.get_pod(pod.id).unwrap();
        assert_eq!(pod.status, PodStatus::Scheduled);
        assert_eq!(pod.node_id, Some(node.id));
        let node = store.get_node(node.id).unwrap();
        assert_eq!(node.allocated.cpu_millis, 200);
        assert_eq!(node.allocated.memory_bytes, 256);
        assert_eq!(node.allocated.pods, 1);
    }

    #[tokio::test]
    async fn taint_rejection_and_toleration() {
        let (store, scheduler) = harness(SchedulerConfig::default());
        let pack = store
            .register_pack(pack_spec("p", RuntimeTag::Node))
            .await
            .unwrap();
        let mut input = node_input("na", 1000, 1024, 10);
        input.taints.push(Taint {
            key: "gpu".into(),
            value: "true".into(),
            effect: TaintEffect::NoSchedule,
        });
        store.add_node(input).await.unwrap();

        let pod = store.create_pod(pod_spec(pack.id, 200, 256)).await.unwrap();
        let err = scheduler.place_pod(pod.id).await.unwrap_err();
        assert_eq!(err.code(), "NO_COMPATIBLE_NODES");

        let mut spec = pod_spec(pack.id, 200, 256);
        spec.tolerations.push(Toleration {
            key: "gpu".into(),
            operator: TolerationOperator::Equal,
            value: "true".into(),
            effect: TaintEffect::NoSchedule,
        });
        let tolerant = store.create_pod(spec).await.unwrap();
        scheduler.place_pod(tolerant.id).await.unwrap();
        assert_eq!(
            store.get_pod(tolerant.id).unwrap().status,
            PodStatus::Scheduled
        );
    }

    #[tokio::test]
    async fn preemption_evicts_lower_priority() {
        let (store, scheduler) = harness(SchedulerConfig {
            policy: PlacementPolicy::Spread,
            preemption: true,
        });
        let pack = store
            .register_pack(pack_spec("p", RuntimeTag::Node))
            .await
            .unwrap();
        let node = store.add_node(node_input("na", 500, 512, 10)).await.unwrap();
        store
            .set_priority_class(PriorityClass {
                name: "low".into(),
                value: 100,
                global_default: false,
            })
            .await
            .unwrap();
        store
            .set_priority_class(PriorityClass {
                name: "high".into(),
                value: 1000,
                global_default: false,
            })
            .await
            .unwrap();

        let mut spec = pod_spec(pack.id, 400, 400);
        spec.priority_class = Some("low".into());
        let low = store.create_pod(spec).await.unwrap();
        scheduler.place_pod(low.id).await.unwrap();

        let mut spec = pod_spec(pack.id, 400, 400);
        spec.priority_class = Some("high".into());
        let high = store.create_pod(spec).await.unwrap();
        scheduler.place_pod(high.id).await.unwrap();

        let low = store.get_pod(low.id).unwrap();
        assert_eq!(low.status, PodStatus::Evicted);
        let high = store.get_pod(high.id).unwrap();
        assert_eq!(high.status, PodStatus::Scheduled);
        let node = store.get_node(node.id).unwrap();
        assert_eq!(node.allocated.cpu_millis, 400);
        assert_eq!(node.allocated.pods, 1);
    }

    #[tokio::test]
    async fn preemption_disabled_rejects() {
        let (store, scheduler) = harness(SchedulerConfig::default());
        let pack = store
            .register_pack(pack_spec("p", RuntimeTag::Node))
            .await
            .unwrap();
        store.add_node(node_input("na", 500, 512, 10)).await.unwrap();
        store
            .set_priority_class(PriorityClass {
                name: "high".into(),
                value: 1000,
                global_default: false,
            })
            .await
            .unwrap();

        let low = store.create_pod(pod_spec(pack.id, 400, 400)).await.unwrap();
        scheduler.place_pod(low.id).await.unwrap();

        let mut spec = pod_spec(pack.id, 400, 400);
        spec.priority_class = Some("high".into());
        let high = store.create_pod(spec).await.unwrap();
        let err = scheduler.place_pod(high.id).await.unwrap_err();
        assert_eq!(err.code(), "NO_COMPATIBLE_NODES");
        assert_eq!(store.get_pod(low.id).unwrap().status, PodStatus::Scheduled);
    }

    #[tokio::test]
    async fn runtime_mismatch_is_no_compatible_nodes() {
        let (store, scheduler) = harness(SchedulerConfig::default());
        let pack = store
            .register_pack(pack_spec("browser-only", RuntimeTag::Browser))
            .await
            .unwrap();
        store.add_node(node_input("na", 1000, 1024, 10)).await.unwrap();

        let pod = store.create_pod(pod_spec(pack.id, 100, 100)).await.unwrap();
        let err = scheduler.place_pod(pod.id).await.unwrap_err();
        assert_eq!(err.code(), "NO_COMPATIBLE_NODES");
    }

    #[tokio::test]
    async fn spread_and_binpack_differ() {
        // Spread: the emptier node wins.
        let (store, scheduler) = harness(SchedulerConfig::default());
        let pack = store
            .register_pack(pack_spec("p", RuntimeTag::Node))
            .await
            .unwrap();
        let a = store.add_node(node_input("a", 1000, 1024, 10)).await.unwrap();
        let b = store.add_node(node_input("b", 1000, 1024, 10)).await.unwrap();
        let filler = store.create_pod(pod_spec(pack.id, 500, 512)).await.unwrap();
        store.schedule_pod(filler.id, a.id).await.unwrap();
        let pod = store.create_pod(pod_spec(pack.id, 100, 100)).await.unwrap();
        assert_eq!(scheduler.place_pod(pod.id).await.unwrap(), b.id);

        // BinPack: the fuller node wins.
        let (store, scheduler) = harness(SchedulerConfig {
            policy: PlacementPolicy::BinPack,
            preemption: false,
        });
        let pack = store
            .register_pack(pack_spec("p", RuntimeTag::Node))
            .await
            .unwrap();
        let a = store.add_node(node_input("a", 1000, 1024, 10)).await.unwrap();
        store.add_node(node_input("b", 1000, 1024, 10)).await.unwrap();
        let filler = store.create_pod(pod_spec(pack.id, 500, 512)).await.unwrap();
        store.schedule_pod(filler.id, a.id).await.unwrap();
        let pod = store.create_pod(pod_spec(pack.id, 100, 100)).await.unwrap();
        assert_eq!(scheduler.place_pod(pod.id).await.unwrap(), a.id);
    }

    #[tokio::test]
    async fn attempt_budget_fails_the_pod() {
        let (store, scheduler) = harness(SchedulerConfig::default());
        let pack = store
            .register_pack(pack_spec("p", RuntimeTag::Node))
            .await
            .unwrap();
        // No nodes at all: every attempt defers until the budget is gone.
        let pod = store.create_pod(pod_spec(pack.id, 100, 100)).await.unwrap();

        for _ in 0..MAX_SCHEDULING_ATTEMPTS - 1 {
            assert_eq!(
                scheduler.place_or_record(pod.id).await.unwrap(),
                Placement::Deferred
            );
        }
        assert_eq!(
            scheduler.place_or_record(pod.id).await.unwrap(),
            Placement::GaveUp
        );

        let pod = store.get_pod(pod.id).unwrap();
        assert_eq!(pod.status, PodStatus::Failed);
        assert_eq!(pod.status_message.as_deref(), Some("UNSCHEDULABLE"));
        let unscheduled = store
            .pod_history(pod.id)
            .iter()
            .filter(|h| h.action == pkg_types::history::HistoryAction::Unscheduled)
            .count();
        assert_eq!(unscheduled as u32, MAX_SCHEDULING_ATTEMPTS);
    }
}
