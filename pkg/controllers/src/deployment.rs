//! Deployment reconciler: drives each service's observed pods toward its
//! desired replica count and target version, every tick.
//!
//! Observed pods are matched by pack *name* across versions. Daemon-mode
//! services (replicas = 0) want exactly one pod per compatible schedulable
//! node. Version changes converge by bounded rolling replacement under
//! `max_surge` / `max_unavailable`; old pods stop only while the running
//! count stays above `desired - max_unavailable`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pkg_bundle::BundleResolver;
use pkg_constants::scheduling::RECONCILE_INTERVAL_SECS;
use pkg_gateway::Gateway;
use pkg_metrics::{MetricsRegistry, well_known};
use pkg_scheduler::Scheduler;
use pkg_state::StateStore;
use pkg_types::error::Error;
use pkg_types::node::Node;
use pkg_types::pack::Pack;
use pkg_types::pod::{Pod, PodSpec, PodStatus, PodTransition};
use pkg_types::protocol::{DeployPack, DeployPayload};
use pkg_types::service::{Service, ServiceStatus};

pub struct DeploymentReconciler {
    store: Arc<StateStore>,
    scheduler: Arc<Scheduler>,
    gateway: Arc<Gateway>,
    bundles: Arc<BundleResolver>,
    metrics: Arc<MetricsRegistry>,
    interval: Duration,
    cancel: CancellationToken,
    /// Deploy commands sent for pods still in `scheduled`; cleared once the
    /// node reports progress (or the pod leaves `scheduled` any other way).
    in_flight: Mutex<HashSet<Uuid>>,
}

impl DeploymentReconciler {
    pub fn new(
        store: Arc<StateStore>,
        scheduler: Arc<Scheduler>,
        gateway: Arc<Gateway>,
        bundles: Arc<BundleResolver>,
        metrics: Arc<MetricsRegistry>,
    ) -> Arc<Self> {
        Self::with_interval(
            store,
            scheduler,
            gateway,
            bundles,
            metrics,
            Duration::from_secs(RECONCILE_INTERVAL_SECS),
        )
    }

    pub fn with_interval(
        store: Arc<StateStore>,
        scheduler: Arc<Scheduler>,
        gateway: Arc<Gateway>,
        bundles: Arc<BundleResolver>,
        metrics: Arc<MetricsRegistry>,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            scheduler,
            gateway,
            bundles,
            metrics,
            interval,
            cancel: CancellationToken::new(),
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let reconciler = self.clone();
        tokio::spawn(async move {
            info!(
                interval_secs = reconciler.interval.as_secs(),
                "deployment reconciler started"
            );
            let mut interval = tokio::time::interval(reconciler.interval);
            loop {
                tokio::select! {
                    _ = reconciler.cancel.cancelled() => break,
                    _ = interval.tick() => {
                        // A stop() lands at the next yield inside the tick.
                        tokio::select! {
                            _ = reconciler.cancel.cancelled() => break,
                            _ = reconciler.reconcile_once() => {}
                        }
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// One full pass over all services.
    pub async fn reconcile_once(&self) {
        self.metrics.counter_inc(well_known::RECONCILE_TICKS);
        {
            let store = &self.store;
            self.in_flight
                .lock()
                .unwrap()
                .retain(|id| store.get_pod(*id).is_some_and(|p| p.status == PodStatus::Scheduled));
        }
        for service in self.store.services() {
            let outcome = match service.status {
                ServiceStatus::Paused => continue,
                ServiceStatus::Deleting => self.teardown_service(&service).await,
                ServiceStatus::Active | ServiceStatus::Scaling => {
                    self.reconcile_service(&service).await
                }
            };
            if let Err(e) = outcome {
                warn!(service = %service.name, error = %e, "reconcile failed");
            }
        }
    }

    async fn reconcile_service(&self, service: &Service) -> Result<(), Error> {
        let Some(pack) = self.store.get_pack(service.pack_id) else {
            return Err(Error::PackNotFound(service.pack_id.to_string()));
        };
        let live = self.store.live_pods_of_pack(&pack.name);

        // Placement retries and deploys apply to every mode.
        for pod in &live {
            match pod.status {
                PodStatus::Pending => {
                    let _ = self.scheduler.place_or_record(pod.id).await;
                }
                PodStatus::Scheduled => self.deploy_if_needed(pod).await,
                _ => {}
            }
        }

        if service.replicas == 0 {
            self.reconcile_daemon(service, &pack, &live).await?;
        } else {
            self.reconcile_replicas(service, &live).await?;
        }

        // Observed counters and convergence, from a fresh read.
        let live = self.store.live_pods_of_pack(&pack.name);
        let desired = self.desired_count(service, &pack);
        let running = live.iter().filter(|p| p.status == PodStatus::Running).count() as u32;
        let updated = live
            .iter()
            .filter(|p| p.pack_version == service.pack_version)
            .count() as u32;
        let updated_running = live
            .iter()
            .filter(|p| {
                p.pack_version == service.pack_version && p.status == PodStatus::Running
            })
            .count() as u32;
        self.store
            .update_service_observed(service.id, running, running, updated)
            .await?;
        if service.status == ServiceStatus::Scaling
            && updated_running == desired as u32
            && live.len() == desired
        {
            self.store
                .set_service_status(service.id, ServiceStatus::Active)
                .await?;
        }
        Ok(())
    }

    fn desired_count(&self, service: &Service, pack: &Pack) -> usize {
        if service.replicas > 0 {
            service.replicas as usize
        } else {
            self.compatible_nodes(pack).len()
        }
    }

    fn compatible_nodes(&self, pack: &Pack) -> Vec<Node> {
        self.store
            .schedulable_nodes()
            .into_iter()
            .filter(|n| pack.runtime_tag.compatible_with(n.runtime_kind))
            .collect()
    }

    // ─── Fixed replica count ──────────────────────────────────────────────

    async fn reconcile_replicas(&self, service: &Service, live: &[Pod]) -> Result<(), Error> {
        let desired = service.replicas as usize;
        let up: Vec<&Pod> = live
            .iter()
            .filter(|p| p.pack_version == service.pack_version)
            .collect();
        let old: Vec<&Pod> = live
            .iter()
            .filter(|p| p.pack_version != service.pack_version)
            .collect();

        if !old.is_empty() {
            return self.rolling_replace(service, live, &up, &old).await;
        }

        if live.len() < desired {
            let missing = desired - live.len();
            debug!(service = %service.name, missing, "scaling up");
            for _ in 0..missing {
                let pod = self.store.create_pod(self.pod_spec(service)).await?;
                let _ = self.scheduler.place_or_record(pod.id).await;
            }
        } else if live.len() > desired {
            let excess = live.len() - desired;
            debug!(service = %service.name, excess, "scaling down");
            let mut victims: Vec<&Pod> = live.iter().collect();
            sort_victims(&mut victims, &service.pack_version);
            for pod in victims.into_iter().take(excess) {
                self.wind_down(pod, "SCALE_DOWN").await?;
            }
        }
        Ok(())
    }

    /// Bounded rolling replacement toward the target version: surge new
    /// pods up to `desired + max_surge` total, stop old ones only while the
    /// running count stays at or above `desired - max_unavailable`.
    async fn rolling_replace(
        &self,
        service: &Service,
        live: &[Pod],
        up: &[&Pod],
        old: &[&Pod],
    ) -> Result<(), Error> {
        let desired = service.replicas as usize;
        let running_total = live.iter().filter(|p| p.status == PodStatus::Running).count();

        let surge_room = (desired + service.max_surge as usize).saturating_sub(live.len());
        let need_new = desired.saturating_sub(up.len());
        for _ in 0..surge_room.min(need_new) {
            let pod = self.store.create_pod(self.pod_spec(service)).await?;
            let _ = self.scheduler.place_or_record(pod.id).await;
        }

        let min_running = desired.saturating_sub(service.max_unavailable as usize);
        let mut budget = running_total.saturating_sub(min_running);

        let mut victims: Vec<&Pod> = old.to_vec();
        sort_victims(&mut victims, &service.pack_version);
        for pod in victims {
            match pod.status {
                // Stopping a pod that never ran costs no availability.
                PodStatus::Pending | PodStatus::Scheduled => {
                    self.wind_down(pod, "VERSION_SUPERSEDED").await?;
                }
                PodStatus::Running if budget > 0 => {
                    budget -= 1;
                    self.wind_down(pod, "VERSION_SUPERSEDED").await?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    // ─── Daemon mode ──────────────────────────────────────────────────────

    /// One replica per compatible schedulable node; nodes are claimed by
    /// direct placement so two daemon pods never share one.
    async fn reconcile_daemon(
        &self,
        service: &Service,
        pack: &Pack,
        live: &[Pod],
    ) -> Result<(), Error> {
        let nodes = self.compatible_nodes(pack);
        let eligible: HashSet<Uuid> = nodes.iter().map(|n| n.id).collect();

        let mut seen: HashMap<Uuid, &Pod> = HashMap::new();
        for pod in live {
            let Some(node_id) = pod.node_id else { continue };
            if seen.contains_key(&node_id) {
                // Duplicate on one node: keep the first, wind down the rest.
                self.wind_down(pod, "DUPLICATE_DAEMON").await?;
            } else {
                seen.insert(node_id, pod);
            }
            if !eligible.contains(&node_id) {
                self.wind_down(pod, "NODE_INELIGIBLE").await?;
            }
        }

        // Out-of-date daemon pods restart in place on their node.
        for (_, pod) in seen.iter() {
            if pod.pack_version != service.pack_version
                && pod.status == PodStatus::Running
            {
                self.wind_down(pod, "VERSION_SUPERSEDED").await?;
            }
        }

        for node in &nodes {
            if seen.contains_key(&node.id) {
                continue;
            }
            let pod = self.store.create_pod(self.pod_spec(service)).await?;
            match self.store.schedule_pod(pod.id, node.id).await {
                Ok(_) => {}
                Err(e) if e.is_retryable() => {
                    let _ = self.store.record_unscheduled(pod.id, e.code()).await;
                }
                Err(e) => {
                    warn!(node = %node.name, error = %e, "daemon placement failed");
                    let _ = self.store.record_unscheduled(pod.id, e.code()).await;
                }
            }
        }
        Ok(())
    }

    // ─── Shared helpers ───────────────────────────────────────────────────

    fn pod_spec(&self, service: &Service) -> PodSpec {
        PodSpec {
            pack_id: service.pack_id,
            namespace: service.namespace.clone(),
            priority_class: service.template.priority_class.clone(),
            requests: service.template.requests.clone(),
            limits: service.template.limits.clone(),
            labels: service.template.labels.clone(),
            tolerations: service.template.tolerations.clone(),
            node_selector: service.template.node_selector.clone(),
            env: service.template.env.clone(),
            created_by: owner_marker(service),
        }
    }

    /// Ship the bundle and deploy command for a freshly scheduled pod,
    /// unless one is already on the wire.
    async fn deploy_if_needed(&self, pod: &Pod) {
        if self.in_flight.lock().unwrap().contains(&pod.id) {
            return;
        }
        let Some(node_id) = pod.node_id else { return };
        let Some(pack) = self.store.get_pack(pod.pack_id) else {
            warn!(pod = %pod.id, "scheduled pod references a missing pack");
            return;
        };
        let bytes = match self.bundles.resolve(&pack).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(pod = %pod.id, error = %e, "bundle unresolved, retrying next tick");
                return;
            }
        };

        let mut env = pack.metadata.default_env.clone();
        env.extend(pod.env.clone());
        let payload = DeployPayload {
            pod_id: pod.id,
            pack: DeployPack::with_bytes(pack.id, pack.version.clone(), &bytes, pack.metadata.clone()),
            env,
            timeout_secs: pack.metadata.timeout_secs,
        };
        match self.gateway.deploy_pod(node_id, payload).await {
            Ok(()) => {
                self.in_flight.lock().unwrap().insert(pod.id);
            }
            Err(e) => debug!(pod = %pod.id, error = %e, "deploy not delivered, retrying next tick"),
        }
    }

    /// Take a pod out of service. Pods that never reached a node are
    /// finished locally; live ones get a graceful stop on their node.
    async fn wind_down(&self, pod: &Pod, reason: &str) -> Result<(), Error> {
        match pod.status {
            PodStatus::Pending => {
                self.store.delete_pod(pod.id).await?;
            }
            PodStatus::Scheduled if !self.in_flight.lock().unwrap().contains(&pod.id) => {
                // Never deployed; nothing will report back.
                self.store
                    .transition_pod(pod.id, PodTransition::Stop, Some(reason))
                    .await?;
                self.store
                    .transition_pod(pod.id, PodTransition::Stopped, Some(reason))
                    .await?;
            }
            PodStatus::Scheduled | PodStatus::Starting | PodStatus::Running => {
                let node_id = pod.node_id;
                self.store
                    .transition_pod(pod.id, PodTransition::Stop, Some(reason))
                    .await?;
                if let Some(node_id) = node_id {
                    if let Err(e) = self.gateway.stop_pod(node_id, pod.id, reason, true) {
                        debug!(pod = %pod.id, error = %e, "stop not delivered");
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Cascade a deleting service: wind down its pods, then remove it.
    async fn teardown_service(&self, service: &Service) -> Result<(), Error> {
        let marker = owner_marker(service);
        let mut remaining = 0usize;
        for pod in self.store.pods() {
            if pod.created_by != marker {
                continue;
            }
            if pod.status.is_terminal() {
                self.store.delete_pod(pod.id).await?;
            } else {
                remaining += 1;
                self.wind_down(&pod, "SERVICE_DELETED").await?;
            }
        }
        if remaining == 0 {
            info!(service = %service.name, "service removed");
            self.store.remove_service(service.id).await?;
        }
        Ok(())
    }
}

fn owner_marker(service: &Service) -> String {
    format!("service:{}/{}", service.namespace, service.name)
}

/// Scale-down preference: out-of-date first, then lowest priority, then
/// youngest.
fn sort_victims(victims: &mut [&Pod], target_version: &str) {
    victims.sort_by(|a, b| {
        let a_up = a.pack_version == target_version;
        let b_up = b.pack_version == target_version;
        a_up.cmp(&b_up)
            .then_with(|| a.priority.cmp(&b.priority))
            .then_with(|| b.created_at.cmp(&a.created_at))
    });
}
