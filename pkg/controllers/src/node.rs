//! Node heartbeat health.
//!
//! A node missing heartbeats for two ping intervals turns `unhealthy`; for
//! four, `offline`. Recovery back to `online` happens in the state store
//! when a heartbeat or reconnect arrives.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pkg_constants::channel::{NODE_OFFLINE_FACTOR, NODE_UNHEALTHY_FACTOR, PING_INTERVAL_SECS};
use pkg_state::StateStore;
use pkg_types::node::NodeStatus;

pub struct NodeHealthController {
    store: Arc<StateStore>,
    check_interval: Duration,
    unhealthy_after: Duration,
    offline_after: Duration,
    cancel: CancellationToken,
}

impl NodeHealthController {
    pub fn new(store: Arc<StateStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            check_interval: Duration::from_secs(PING_INTERVAL_SECS / 2),
            unhealthy_after: Duration::from_secs(PING_INTERVAL_SECS * NODE_UNHEALTHY_FACTOR),
            offline_after: Duration::from_secs(PING_INTERVAL_SECS * NODE_OFFLINE_FACTOR),
            cancel: CancellationToken::new(),
        })
    }

    /// Override the liveness thresholds (tests, fast clusters).
    pub fn with_thresholds(
        store: Arc<StateStore>,
        check_interval: Duration,
        unhealthy_after: Duration,
        offline_after: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            check_interval,
            unhealthy_after,
            offline_after,
            cancel: CancellationToken::new(),
        })
    }

    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            info!(
                interval_secs = controller.check_interval.as_secs(),
                "node health controller started"
            );
            let mut interval = tokio::time::interval(controller.check_interval);
            loop {
                tokio::select! {
                    _ = controller.cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = controller.reconcile().await {
                            warn!(error = %e, "node health pass failed");
                        }
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// One pass: downgrade nodes whose heartbeats went quiet.
    pub async fn reconcile(&self) -> Result<(), pkg_types::error::Error> {
        let now = Utc::now();
        for node in self.store.nodes() {
            let age = now
                .signed_duration_since(node.last_heartbeat)
                .to_std()
                .unwrap_or_default();

            let target = if age >= self.offline_after {
                Some(NodeStatus::Offline)
            } else if age >= self.unhealthy_after && node.status == NodeStatus::Online {
                Some(NodeStatus::Unhealthy)
            } else {
                None
            };

            if let Some(target) = target {
                if node.status != target && node.status != NodeStatus::Draining {
                    info!(
                        node = %node.name,
                        from = %node.status,
                        to = %target,
                        silent_secs = age.as_secs(),
                        "node heartbeat stale"
                    );
                    self.store.set_node_status(node.id, target).await?;
                }
            }
        }
        Ok(())
    }
}
