//! Node-loss eviction.
//!
//! Pods on a node that went `offline` or `draining` are transitioned to
//! `evicted` so the deployment reconciler replaces them on its next tick.
//! Node events trigger an immediate pass on top of the periodic one.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pkg_gateway::Gateway;
use pkg_state::StateStore;
use pkg_state::watch::EntityRef;
use pkg_types::error::Error;
use pkg_types::node::NodeStatus;
use pkg_types::pod::PodTransition;

pub struct EvictionController {
    store: Arc<StateStore>,
    gateway: Arc<Gateway>,
    check_interval: Duration,
    cancel: CancellationToken,
}

impl EvictionController {
    pub fn new(store: Arc<StateStore>, gateway: Arc<Gateway>) -> Arc<Self> {
        Arc::new(Self {
            store,
            gateway,
            check_interval: Duration::from_secs(30),
            cancel: CancellationToken::new(),
        })
    }

    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            info!(
                interval_secs = controller.check_interval.as_secs(),
                "eviction controller started"
            );
            let mut events = controller.store.subscribe();
            let mut interval = tokio::time::interval(controller.check_interval);
            loop {
                tokio::select! {
                    _ = controller.cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = controller.reconcile().await {
                            warn!(error = %e, "eviction pass failed");
                        }
                    }
                    result = events.recv() => {
                        match result {
                            Ok(event) if matches!(event.entity, EntityRef::Node(_)) => {
                                while events.try_recv().is_ok() {}
                                if let Err(e) = controller.reconcile().await {
                                    warn!(error = %e, "eviction pass failed");
                                }
                                while events.try_recv().is_ok() {}
                                interval.reset();
                            }
                            Ok(_) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                                if let Err(e) = controller.reconcile().await {
                                    warn!(error = %e, "eviction pass failed");
                                }
                                interval.reset();
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// One pass: evict every live pod sitting on a lost or draining node.
    pub async fn reconcile(&self) -> Result<(), Error> {
        for node in self.store.nodes() {
            let reason = match node.status {
                NodeStatus::Offline => "NODE_LOST",
                NodeStatus::Draining => "NODE_DRAINING",
                _ => continue,
            };
            for pod in self.store.pods_on_node(node.id) {
                if pod.status.is_terminal() {
                    continue;
                }
                info!(pod = %pod.id, node = %node.name, reason, "evicting pod from lost node");
                self.store
                    .transition_pod(pod.id, PodTransition::Evict, Some(reason))
                    .await?;
                // A draining node is still attached and can wind the pod
                // down gracefully; an offline one is unreachable.
                if node.status == NodeStatus::Draining {
                    if let Err(e) = self.gateway.stop_pod(node.id, pod.id, reason, true) {
                        tracing::debug!(pod = %pod.id, error = %e, "stop not delivered");
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_gateway::GatewayConfig;
    use pkg_gateway::auth::StaticTokenVerifier;
    use pkg_metrics::MetricsRegistry;
    use pkg_types::node::{NodeCapacity, RegisterNodeInput, RuntimeKind};
    use pkg_types::pack::{PackSpec, RuntimeTag};
    use pkg_types::pod::{PodSpec, PodStatus};
    use std::collections::HashMap;

    async fn seeded() -> (Arc<StateStore>, Arc<EvictionController>, uuid::Uuid, uuid::Uuid) {
        let store = Arc::new(StateStore::in_memory());
        let gateway = Gateway::new(
            store.clone(),
            Arc::new(StaticTokenVerifier::new("t")),
            GatewayConfig::default(),
            Arc::new(MetricsRegistry::with_well_known()),
        );
        let controller = EvictionController::new(store.clone(), gateway);

        let pack = store
            .register_pack(PackSpec {
                name: "p".into(),
                version: "1.0.0".into(),
                runtime_tag: RuntimeTag::Node,
                owner_id: "test".into(),
                bundle_url: None,
                bundle_bytes: Some(vec![1]),
                metadata: Default::default(),
            })
            .await
            .unwrap();
        let node = store
            .add_node(RegisterNodeInput {
                name: "na".into(),
                runtime_kind: RuntimeKind::Node,
                capability_tags: vec![],
                allocatable: NodeCapacity {
                    cpu_millis: 1000,
                    memory_bytes: 1024,
                    pods: 10,
                    storage_bytes: 0,
                },
                labels: HashMap::new(),
                taints: vec![],
            })
            .await
            .unwrap();
        let pod = store
            .create_pod(PodSpec {
                pack_id: pack.id,
                namespace: "default".into(),
                priority_class: None,
                requests: Default::default(),
                limits: Default::default(),
                labels: HashMap::new(),
                tolerations: vec![],
                node_selector: HashMap::new(),
                env: HashMap::new(),
                created_by: "test".into(),
            })
            .await
            .unwrap();
        store.schedule_pod(pod.id, node.id).await.unwrap();
        (store, controller, node.id, pod.id)
    }

    #[tokio::test]
    async fn offline_node_loses_its_pods() {
        let (store, controller, node_id, pod_id) = seeded().await;
        store
            .set_node_status(node_id, NodeStatus::Offline)
            .await
            .unwrap();

        controller.reconcile().await.unwrap();

        let pod = store.get_pod(pod_id).unwrap();
        assert_eq!(pod.status, PodStatus::Evicted);
        assert_eq!(pod.status_message.as_deref(), Some("NODE_LOST"));
        assert_eq!(store.get_node(node_id).unwrap().allocated.pods, 0);
    }

    #[tokio::test]
    async fn draining_node_is_emptied() {
        let (store, controller, node_id, pod_id) = seeded().await;
        store.drain_node(node_id).await.unwrap();

        controller.reconcile().await.unwrap();

        let pod = store.get_pod(pod_id).unwrap();
        assert_eq!(pod.status, PodStatus::Evicted);
        assert_eq!(pod.status_message.as_deref(), Some("NODE_DRAINING"));
    }

    #[tokio::test]
    async fn healthy_nodes_are_untouched() {
        let (store, controller, _node_id, pod_id) = seeded().await;
        controller.reconcile().await.unwrap();
        assert_eq!(store.get_pod(pod_id).unwrap().status, PodStatus::Scheduled);
    }
}
