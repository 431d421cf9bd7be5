//! The authoritative in-memory cluster state store.
//!
//! Every mutation validates its invariants under one exclusive lock, then
//! (after the lock is released) notifies the event log and flushes the
//! touched entities to the record store. Reads clone consistent snapshots
//! under a shared lock.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use pkg_constants::scheduling::POD_HISTORY_CAP;
use pkg_constants::state::EVENT_LOG_CAP;
use pkg_types::error::Error;
use pkg_types::history::{HistoryAction, PodHistoryEntry};
use pkg_types::namespace::{LimitRange, Namespace, NamespacePhase, QuotaUsage, ResourceQuota};
use pkg_types::node::{NodeAllocated, NodeStatus, RegisterNodeInput};
use pkg_types::node::Node;
use pkg_types::pack::{Pack, PackSpec};
use pkg_types::pod::{Pod, PodSpec, PodStatus, PodTransition};
use pkg_types::priority::PriorityClass;
use pkg_types::service::{Service, ServiceSpec, ServiceStatus};
use pkg_types::validate::{validate_labels, validate_name, validate_version};

use crate::record::RecordStore;
use crate::watch::{ChangeKind, EntityRef, EventLog, StateEvent};

struct ClusterState {
    nodes: HashMap<Uuid, Node>,
    node_names: HashMap<String, Uuid>,
    packs: HashMap<Uuid, Pack>,
    pack_versions: HashMap<(String, String), Uuid>,
    pods: HashMap<Uuid, Pod>,
    pods_by_node: HashMap<Uuid, HashSet<Uuid>>,
    services: HashMap<Uuid, Service>,
    service_names: HashMap<(String, String), Uuid>,
    namespaces: HashMap<String, Namespace>,
    priority_classes: HashMap<String, PriorityClass>,
    history: HashMap<Uuid, Vec<PodHistoryEntry>>,
}

impl ClusterState {
    fn empty() -> Self {
        let mut namespaces = HashMap::new();
        namespaces.insert(
            "default".to_string(),
            Namespace {
                name: "default".to_string(),
                phase: NamespacePhase::Active,
                quota: None,
                limit_range: None,
                usage: QuotaUsage::default(),
            },
        );
        Self {
            nodes: HashMap::new(),
            node_names: HashMap::new(),
            packs: HashMap::new(),
            pack_versions: HashMap::new(),
            pods: HashMap::new(),
            pods_by_node: HashMap::new(),
            services: HashMap::new(),
            service_names: HashMap::new(),
            namespaces,
            priority_classes: HashMap::new(),
            history: HashMap::new(),
        }
    }

    fn push_history(&mut self, entry: PodHistoryEntry) {
        let entries = self.history.entry(entry.pod_id).or_default();
        entries.push(entry);
        if entries.len() > POD_HISTORY_CAP {
            let excess = entries.len() - POD_HISTORY_CAP;
            entries.drain(..excess);
        }
    }

    /// Detach a pod from its node and hand its resources back. The caller
    /// already holds the write lock.
    fn release_pod(&mut self, pod_id: Uuid, node_id: Uuid, pod_requests_cpu: u64, mem: u64) {
        if let Some(set) = self.pods_by_node.get_mut(&node_id) {
            set.remove(&pod_id);
        }
        if let Some(node) = self.nodes.get_mut(&node_id) {
            node.allocated.cpu_millis = node.allocated.cpu_millis.saturating_sub(pod_requests_cpu);
            node.allocated.memory_bytes = node.allocated.memory_bytes.saturating_sub(mem);
            node.allocated.pods = node.allocated.pods.saturating_sub(1);
        }
    }

    fn release_namespace_usage(&mut self, namespace: &str, cpu: u64, mem: u64) {
        if let Some(ns) = self.namespaces.get_mut(namespace) {
            ns.usage.pods = ns.usage.pods.saturating_sub(1);
            ns.usage.cpu_millis = ns.usage.cpu_millis.saturating_sub(cpu);
            ns.usage.memory_bytes = ns.usage.memory_bytes.saturating_sub(mem);
        }
    }
}

enum Flush {
    Put(EntityRef, Vec<u8>),
    Delete(EntityRef),
}

impl Flush {
    fn put<T: serde::Serialize>(entity: EntityRef, value: &T) -> Flush {
        // Entities are plain data; serialization cannot fail in practice.
        let bytes = serde_json::to_vec(value).unwrap_or_default();
        Flush::Put(entity, bytes)
    }
}

/// See module docs. Cheap to clone behind [`Arc`]; every collaborator holds
/// `Arc<StateStore>` and entity ids, never entity references.
pub struct StateStore {
    inner: RwLock<ClusterState>,
    events: EventLog,
    record: Arc<dyn RecordStore>,
}

impl StateStore {
    pub fn new(record: Arc<dyn RecordStore>) -> Self {
        Self {
            inner: RwLock::new(ClusterState::empty()),
            events: EventLog::new(EVENT_LOG_CAP),
            record,
        }
    }

    /// A store flushing to a throwaway in-memory record store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(crate::record::MemoryRecordStore::new()))
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    pub fn event_log(&self) -> &EventLog {
        &self.events
    }

    fn read(&self) -> RwLockReadGuard<'_, ClusterState> {
        self.inner.read().unwrap()
    }

    fn write(&self) -> RwLockWriteGuard<'_, ClusterState> {
        self.inner.write().unwrap()
    }

    /// Notify observers and flush to the record store. Runs strictly after
    /// the state lock is released; record-store failures are logged, not
    /// surfaced — memory is authoritative.
    async fn commit(&self, flushes: Vec<Flush>) {
        for flush in flushes {
            match flush {
                Flush::Put(entity, bytes) => {
                    self.events.emit(ChangeKind::Put, entity.clone()).await;
                    if let Err(e) = self.record.put(&entity.record_key(), &bytes).await {
                        tracing::warn!(error = %e, "record store flush failed");
                    }
                }
                Flush::Delete(entity) => {
                    self.events.emit(ChangeKind::Delete, entity.clone()).await;
                    if let Err(e) = self.record.delete(&entity.record_key()).await {
                        tracing::warn!(error = %e, "record store delete failed");
                    }
                }
            }
        }
    }

    /// Rebuild in-memory state from the record store. Node allocation,
    /// per-node pod sets, and namespace usage are recomputed from live pods
    /// rather than trusted from disk.
    pub async fn load(&self) -> Result<(), Error> {
        use pkg_constants::state::*;
        let mut state = ClusterState::empty();

        for (_, bytes) in self.record.list_prefix(NODE_PREFIX).await? {
            if let Ok(mut node) = serde_json::from_slice::<Node>(&bytes) {
                node.allocated = NodeAllocated::default();
                state.node_names.insert(node.name.clone(), node.id);
                state.nodes.insert(node.id, node);
            }
        }
        for (_, bytes) in self.record.list_prefix(PACK_PREFIX).await? {
            if let Ok(pack) = serde_json::from_slice::<Pack>(&bytes) {
                state
                    .pack_versions
                    .insert((pack.name.clone(), pack.version.clone()), pack.id);
                state.packs.insert(pack.id, pack);
            }
        }
        for (_, bytes) in self.record.list_prefix(NAMESPACE_PREFIX).await? {
            if let Ok(mut ns) = serde_json::from_slice::<Namespace>(&bytes) {
                ns.usage = QuotaUsage::default();
                state.namespaces.insert(ns.name.clone(), ns);
            }
        }
        for (_, bytes) in self.record.list_prefix(PRIORITY_CLASS_PREFIX).await? {
            if let Ok(pc) = serde_json::from_slice::<PriorityClass>(&bytes) {
                state.priority_classes.insert(pc.name.clone(), pc);
            }
        }
        for (_, bytes) in self.record.list_prefix(SERVICE_PREFIX).await? {
            if let Ok(service) = serde_json::from_slice::<Service>(&bytes) {
                state
                    .service_names
                    .insert((service.namespace.clone(), service.name.clone()), service.id);
                state.services.insert(service.id, service);
            }
        }
        for (_, bytes) in self.record.list_prefix(POD_PREFIX).await? {
            if let Ok(pod) = serde_json::from_slice::<Pod>(&bytes) {
                if !pod.status.is_terminal() {
                    if let Some(ns) = state.namespaces.get_mut(&pod.namespace) {
                        ns.usage.pods += 1;
                        ns.usage.cpu_millis += pod.requests.cpu_millis;
                        ns.usage.memory_bytes += pod.requests.memory_bytes;
                    }
                    if let Some(node_id) = pod.node_id {
                        if let Some(node) = state.nodes.get_mut(&node_id) {
                            node.allocated.cpu_millis += pod.requests.cpu_millis;
                            node.allocated.memory_bytes += pod.requests.memory_bytes;
                            node.allocated.pods += 1;
                            state.pods_by_node.entry(node_id).or_default().insert(pod.id);
                        }
                    }
                }
                state.pods.insert(pod.id, pod);
            }
        }

        let counts = (
            state.nodes.len(),
            state.pods.len(),
            state.services.len(),
            state.packs.len(),
        );
        *self.write() = state;
        tracing::info!(
            nodes = counts.0,
            pods = counts.1,
            services = counts.2,
            packs = counts.3,
            "state recovered from record store"
        );
        Ok(())
    }

    pub async fn close(&self) {
        if let Err(e) = self.record.close().await {
            tracing::warn!(error = %e, "record store close failed");
        }
    }

    // ─── Nodes ─────────────────────────────────────────────────────────────

    pub async fn add_node(&self, spec: RegisterNodeInput) -> Result<Node, Error> {
        validate_name(&spec.name)?;
        validate_labels(&spec.labels)?;
        let node = {
            let mut state = self.write();
            if state.node_names.contains_key(&spec.name) {
                return Err(Error::NameTaken(spec.name));
            }
            let now = Utc::now();
            let node = Node {
                id: Uuid::new_v4(),
                name: spec.name,
                runtime_kind: spec.runtime_kind,
                capability_tags: spec.capability_tags,
                allocatable: spec.allocatable,
                allocated: NodeAllocated::default(),
                labels: spec.labels,
                taints: spec.taints,
                status: NodeStatus::Online,
                registered_at: now,
                last_heartbeat: now,
                unschedulable: false,
            };
            state.node_names.insert(node.name.clone(), node.id);
            state.nodes.insert(node.id, node.clone());
            node
        };
        self.commit(vec![Flush::put(EntityRef::Node(node.id), &node)])
            .await;
        tracing::info!(node = %node.name, id = %node.id, runtime = %node.runtime_kind, "node registered");
        Ok(node)
    }

    /// A known node re-attached: refresh liveness instead of creating a
    /// duplicate entity.
    pub async fn reconnect_node(&self, node_id: Uuid) -> Result<Node, Error> {
        let node = {
            let mut state = self.write();
            let node = state
                .nodes
                .get_mut(&node_id)
                .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;
            node.last_heartbeat = Utc::now();
            node.status = NodeStatus::Online;
            node.clone()
        };
        self.commit(vec![Flush::put(EntityRef::Node(node.id), &node)])
            .await;
        Ok(node)
    }

    pub async fn process_heartbeat(
        &self,
        node_id: Uuid,
        reported: NodeAllocated,
        timestamp: DateTime<Utc>,
    ) -> Result<Node, Error> {
        let node = {
            let mut state = self.write();
            let node = state
                .nodes
                .get_mut(&node_id)
                .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;
            node.last_heartbeat = timestamp;
            if node.status == NodeStatus::Unhealthy {
                node.status = NodeStatus::Online;
            }
            if reported != node.allocated {
                tracing::debug!(
                    node = %node.name,
                    reported_pods = reported.pods,
                    accounted_pods = node.allocated.pods,
                    "node self-reported allocation diverges from accounting"
                );
            }
            node.clone()
        };
        self.commit(vec![Flush::put(EntityRef::Node(node.id), &node)])
            .await;
        Ok(node)
    }

    pub async fn set_node_status(&self, node_id: Uuid, status: NodeStatus) -> Result<Node, Error> {
        let node = {
            let mut state = self.write();
            let node = state
                .nodes
                .get_mut(&node_id)
                .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;
            node.status = status;
            node.clone()
        };
        self.commit(vec![Flush::put(EntityRef::Node(node.id), &node)])
            .await;
        Ok(node)
    }

    pub async fn drain_node(&self, node_id: Uuid) -> Result<Node, Error> {
        let node = {
            let mut state = self.write();
            let node = state
                .nodes
                .get_mut(&node_id)
                .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;
            node.unschedulable = true;
            node.status = NodeStatus::Draining;
            node.clone()
        };
        self.commit(vec![Flush::put(EntityRef::Node(node.id), &node)])
            .await;
        tracing::info!(node = %node.name, "node draining");
        Ok(node)
    }

    pub async fn uncordon_node(&self, node_id: Uuid) -> Result<Node, Error> {
        let node = {
            let mut state = self.write();
            let node = state
                .nodes
                .get_mut(&node_id)
                .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;
            node.unschedulable = false;
            node.status = NodeStatus::Online;
            node.clone()
        };
        self.commit(vec![Flush::put(EntityRef::Node(node.id), &node)])
            .await;
        Ok(node)
    }

    pub async fn delete_node(&self, node_id: Uuid) -> Result<(), Error> {
        {
            let mut state = self.write();
            let node = state
                .nodes
                .get(&node_id)
                .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;
            let referenced = state
                .pods_by_node
                .get(&node_id)
                .is_some_and(|set| !set.is_empty());
            if referenced {
                return Err(Error::InvalidState(format!(
                    "node {} still has pods assigned",
                    node.name
                )));
            }
            let name = node.name.clone();
            state.nodes.remove(&node_id);
            state.node_names.remove(&name);
            state.pods_by_node.remove(&node_id);
        }
        self.commit(vec![Flush::Delete(EntityRef::Node(node_id))]).await;
        Ok(())
    }

    // ─── Packs ─────────────────────────────────────────────────────────────

    pub async fn register_pack(&self, spec: PackSpec) -> Result<Pack, Error> {
        validate_name(&spec.name)?;
        validate_version(&spec.version)?;
        let pack = {
            let mut state = self.write();
            let key = (spec.name.clone(), spec.version.clone());
            if state.pack_versions.contains_key(&key) {
                return Err(Error::VersionExists {
                    name: spec.name,
                    version: spec.version,
                });
            }
            let pack = Pack {
                id: Uuid::new_v4(),
                name: spec.name,
                version: spec.version,
                runtime_tag: spec.runtime_tag,
                owner_id: spec.owner_id,
                bundle_url: spec.bundle_url,
                bundle_bytes: spec.bundle_bytes,
                metadata: spec.metadata,
                created_at: Utc::now(),
            };
            state.pack_versions.insert(key, pack.id);
            state.packs.insert(pack.id, pack.clone());
            pack
        };
        self.commit(vec![Flush::put(EntityRef::Pack(pack.id), &pack)])
            .await;
        tracing::info!(pack = %pack.name, version = %pack.version, "pack registered");
        Ok(pack)
    }

    /// Packs are immutable after registration except their descriptive
    /// metadata.
    pub async fn update_pack_metadata(
        &self,
        pack_id: Uuid,
        metadata: pkg_types::pack::PackMetadata,
    ) -> Result<Pack, Error> {
        let pack = {
            let mut state = self.write();
            let pack = state
                .packs
                .get_mut(&pack_id)
                .ok_or_else(|| Error::PackNotFound(pack_id.to_string()))?;
            pack.metadata = metadata;
            pack.clone()
        };
        self.commit(vec![Flush::put(EntityRef::Pack(pack.id), &pack)])
            .await;
        Ok(pack)
    }

    pub async fn delete_pack(&self, pack_id: Uuid) -> Result<(), Error> {
        {
            let mut state = self.write();
            let pack = state
                .packs
                .get(&pack_id)
                .ok_or_else(|| Error::PackNotFound(pack_id.to_string()))?;
            let referenced = state
                .pods
                .values()
                .any(|p| p.pack_id == pack_id && p.pack_version == pack.version);
            if referenced {
                return Err(Error::InvalidState(format!(
                    "pack {}@{} is referenced by pods",
                    pack.name, pack.version
                )));
            }
            let key = (pack.name.clone(), pack.version.clone());
            state.pack_versions.remove(&key);
            state.packs.remove(&pack_id);
        }
        self.commit(vec![Flush::Delete(EntityRef::Pack(pack_id))]).await;
        Ok(())
    }

    // ─── Namespaces & priority classes ─────────────────────────────────────

    pub async fn create_namespace(
        &self,
        name: String,
        quota: Option<ResourceQuota>,
        limit_range: Option<LimitRange>,
    ) -> Result<Namespace, Error> {
        validate_name(&name)?;
        let ns = {
            let mut state = self.write();
            if state.namespaces.contains_key(&name) {
                return Err(Error::NameTaken(name));
            }
            let ns = Namespace {
                name: name.clone(),
                phase: NamespacePhase::Active,
                quota,
                limit_range,
                usage: QuotaUsage::default(),
            };
            state.namespaces.insert(name, ns.clone());
            ns
        };
        self.commit(vec![Flush::put(EntityRef::Namespace(ns.name.clone()), &ns)])
            .await;
        Ok(ns)
    }

    pub async fn delete_namespace(&self, name: &str) -> Result<(), Error> {
        {
            let mut state = self.write();
            if Namespace::is_reserved(name) {
                return Err(Error::Validation(format!(
                    "namespace '{name}' is reserved and cannot be deleted"
                )));
            }
            if !state.namespaces.contains_key(name) {
                return Err(Error::NamespaceMissing(name.to_string()));
            }
            let occupied = state.pods.values().any(|p| p.namespace == name);
            if occupied {
                return Err(Error::InvalidState(format!(
                    "namespace '{name}' still contains pods"
                )));
            }
            state.namespaces.remove(name);
        }
        self.commit(vec![Flush::Delete(EntityRef::Namespace(name.to_string()))])
            .await;
        Ok(())
    }

    pub async fn set_priority_class(&self, class: PriorityClass) -> Result<PriorityClass, Error> {
        validate_name(&class.name)?;
        {
            let mut state = self.write();
            state
                .priority_classes
                .insert(class.name.clone(), class.clone());
        }
        self.commit(vec![Flush::put(
            EntityRef::PriorityClass(class.name.clone()),
            &class,
        )])
        .await;
        Ok(class)
    }

    // ─── Pods ──────────────────────────────────────────────────────────────

    pub async fn create_pod(&self, spec: PodSpec) -> Result<Pod, Error> {
        validate_labels(&spec.labels)?;
        let (pod, ns) = {
            let mut state = self.write();
            let pack = state
                .packs
                .get(&spec.pack_id)
                .ok_or_else(|| Error::PackNotFound(spec.pack_id.to_string()))?;
            let pack_version = pack.version.clone();
            let ns = state
                .namespaces
                .get(&spec.namespace)
                .ok_or_else(|| Error::NamespaceMissing(spec.namespace.clone()))?;

            // Limit-range defaults fill unset requests before the quota check.
            let mut requests = spec.requests.clone();
            if let Some(lr) = &ns.limit_range {
                if requests.cpu_millis == 0 {
                    requests.cpu_millis = lr.default_cpu_millis.unwrap_or(0);
                }
                if requests.memory_bytes == 0 {
                    requests.memory_bytes = lr.default_memory_bytes.unwrap_or(0);
                }
            }

            if let Some(quota) = &ns.quota {
                if let Some(max) = quota.max_pods {
                    if ns.usage.pods + 1 > max {
                        return Err(Error::QuotaExceeded {
                            namespace: spec.namespace,
                            detail: format!("pod count would exceed {max}"),
                        });
                    }
                }
                if let Some(max) = quota.max_cpu_millis {
                    if ns.usage.cpu_millis + requests.cpu_millis > max {
                        return Err(Error::QuotaExceeded {
                            namespace: spec.namespace,
                            detail: format!("cpu would exceed {max} millis"),
                        });
                    }
                }
                if let Some(max) = quota.max_memory_bytes {
                    if ns.usage.memory_bytes + requests.memory_bytes > max {
                        return Err(Error::QuotaExceeded {
                            namespace: spec.namespace,
                            detail: format!("memory would exceed {max} bytes"),
                        });
                    }
                }
            }

            // Missing class resolves to 0; a global default applies when the
            // pod names none.
            let priority = match &spec.priority_class {
                Some(name) => state.priority_classes.get(name).map(|c| c.value).unwrap_or(0),
                None => state
                    .priority_classes
                    .values()
                    .find(|c| c.global_default)
                    .map(|c| c.value)
                    .unwrap_or(0),
            };

            let now = Utc::now();
            let pod = Pod {
                id: Uuid::new_v4(),
                pack_id: spec.pack_id,
                pack_version,
                namespace: spec.namespace.clone(),
                node_id: None,
                status: PodStatus::Pending,
                priority,
                priority_class: spec.priority_class,
                requests,
                limits: spec.limits,
                labels: spec.labels,
                tolerations: spec.tolerations,
                node_selector: spec.node_selector,
                env: spec.env,
                created_by: spec.created_by,
                status_message: None,
                scheduling_attempts: 0,
                created_at: now,
                scheduled_at: None,
                started_at: None,
                stopped_at: None,
            };

            let ns = state.namespaces.get_mut(&spec.namespace).unwrap();
            ns.usage.pods += 1;
            ns.usage.cpu_millis += pod.requests.cpu_millis;
            ns.usage.memory_bytes += pod.requests.memory_bytes;
            let ns = ns.clone();

            state.push_history(PodHistoryEntry {
                pod_id: pod.id,
                timestamp: now,
                action: HistoryAction::Created,
                previous_status: None,
                new_status: Some(PodStatus::Pending),
                metadata: HashMap::new(),
            });
            state.pods.insert(pod.id, pod.clone());
            (pod, ns)
        };
        self.commit(vec![
            Flush::put(EntityRef::Pod(pod.id), &pod),
            Flush::put(EntityRef::Namespace(ns.name.clone()), &ns),
        ])
        .await;
        Ok(pod)
    }

    /// Atomically bind a pending pod to a node, re-checking admission at
    /// commit time. The resource check and the allocation increment happen
    /// under the same lock acquisition, so two racing placements cannot
    /// oversubscribe.
    pub async fn schedule_pod(&self, pod_id: Uuid, node_id: Uuid) -> Result<Pod, Error> {
        let (pod, node) = {
            let mut state = self.write();
            let pod = state
                .pods
                .get(&pod_id)
                .ok_or(Error::PodNotFound(pod_id))?;
            if pod.status != PodStatus::Pending {
                return Err(Error::InvalidState(format!(
                    "pod {pod_id} is {}, expected pending",
                    pod.status
                )));
            }
            let requests = pod.requests.clone();
            let pack = state
                .packs
                .get(&pod.pack_id)
                .ok_or_else(|| Error::PackNotFound(pod.pack_id.to_string()))?;
            let runtime_tag = pack.runtime_tag;

            let node = state
                .nodes
                .get(&node_id)
                .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;
            if node.status != NodeStatus::Online || node.unschedulable {
                return Err(Error::InvalidState(format!(
                    "node {} is not schedulable",
                    node.name
                )));
            }
            if !runtime_tag.compatible_with(node.runtime_kind) {
                return Err(Error::RuntimeMismatch {
                    tag: runtime_tag.to_string(),
                    kind: node.runtime_kind.to_string(),
                });
            }
            if !node.fits(&requests) {
                return Err(Error::InsufficientResources(node.name.clone()));
            }

            let node = state.nodes.get_mut(&node_id).unwrap();
            node.allocated.cpu_millis += requests.cpu_millis;
            node.allocated.memory_bytes += requests.memory_bytes;
            node.allocated.pods += 1;
            let node = node.clone();

            state.pods_by_node.entry(node_id).or_default().insert(pod_id);
            let now = Utc::now();
            let pod = state.pods.get_mut(&pod_id).unwrap();
            pod.node_id = Some(node_id);
            pod.status = PodStatus::Scheduled;
            pod.scheduled_at = Some(now);
            let pod = pod.clone();

            state.push_history(PodHistoryEntry {
                pod_id,
                timestamp: now,
                action: HistoryAction::Scheduled,
                previous_status: Some(PodStatus::Pending),
                new_status: Some(PodStatus::Scheduled),
                metadata: HashMap::from([("node".to_string(), node.name.clone())]),
            });
            (pod, node)
        };
        self.commit(vec![
            Flush::put(EntityRef::Pod(pod.id), &pod),
            Flush::put(EntityRef::Node(node.id), &node),
        ])
        .await;
        tracing::info!(pod = %pod.id, node = %node.name, "pod scheduled");
        Ok(pod)
    }

    /// Drive the pod state machine. Terminal transitions release node
    /// resources, clear the node binding, and return namespace quota.
    pub async fn transition_pod(
        &self,
        pod_id: Uuid,
        transition: PodTransition,
        message: Option<&str>,
    ) -> Result<Pod, Error> {
        let (pod, touched_node, touched_ns) = {
            let mut state = self.write();
            let pod = state
                .pods
                .get(&pod_id)
                .ok_or(Error::PodNotFound(pod_id))?;
            let previous = pod.status;
            let next = previous.apply(transition)?;
            let requests = pod.requests.clone();
            let node_id = pod.node_id;
            let namespace = pod.namespace.clone();

            let now = Utc::now();
            let mut touched_node = None;
            let mut touched_ns = None;
            if next.is_terminal() {
                if let Some(node_id) = node_id {
                    state.release_pod(pod_id, node_id, requests.cpu_millis, requests.memory_bytes);
                    touched_node = state.nodes.get(&node_id).cloned();
                }
                state.release_namespace_usage(&namespace, requests.cpu_millis, requests.memory_bytes);
                touched_ns = state.namespaces.get(&namespace).cloned();
            }

            let pod = state.pods.get_mut(&pod_id).unwrap();
            pod.status = next;
            if let Some(message) = message {
                pod.status_message = Some(message.to_string());
            }
            match next {
                PodStatus::Starting => pod.started_at = Some(now),
                s if s.is_terminal() => {
                    pod.stopped_at = Some(now);
                    pod.node_id = None;
                }
                _ => {}
            }
            let pod = pod.clone();

            let action = match next {
                PodStatus::Starting => Some(HistoryAction::Started),
                PodStatus::Running => Some(HistoryAction::Running),
                PodStatus::Stopped => Some(HistoryAction::Stopped),
                PodStatus::Failed => Some(HistoryAction::Failed),
                PodStatus::Evicted => Some(HistoryAction::Evicted),
                _ => None,
            };
            if let Some(action) = action {
                let mut metadata = HashMap::new();
                if let Some(message) = message {
                    metadata.insert("message".to_string(), message.to_string());
                }
                state.push_history(PodHistoryEntry {
                    pod_id,
                    timestamp: now,
                    action,
                    previous_status: Some(previous),
                    new_status: Some(next),
                    metadata,
                });
            }
            (pod, touched_node, touched_ns)
        };

        let mut flushes = vec![Flush::put(EntityRef::Pod(pod.id), &pod)];
        if let Some(node) = &touched_node {
            flushes.push(Flush::put(EntityRef::Node(node.id), node));
        }
        if let Some(ns) = &touched_ns {
            flushes.push(Flush::put(EntityRef::Namespace(ns.name.clone()), ns));
        }
        self.commit(flushes).await;
        tracing::debug!(pod = %pod.id, status = %pod.status, "pod transition");
        Ok(pod)
    }

    /// Count a failed placement attempt; the reconciler fails the pod once
    /// the bound is exhausted.
    pub async fn record_unscheduled(&self, pod_id: Uuid, reason: &str) -> Result<u32, Error> {
        let (pod, attempts) = {
            let mut state = self.write();
            let pod = state
                .pods
                .get_mut(&pod_id)
                .ok_or(Error::PodNotFound(pod_id))?;
            pod.scheduling_attempts += 1;
            let attempts = pod.scheduling_attempts;
            let pod = pod.clone();
            state.push_history(PodHistoryEntry {
                pod_id,
                timestamp: Utc::now(),
                action: HistoryAction::Unscheduled,
                previous_status: Some(pod.status),
                new_status: Some(pod.status),
                metadata: HashMap::from([
                    ("reason".to_string(), reason.to_string()),
                    ("attempt".to_string(), attempts.to_string()),
                ]),
            });
            (pod, attempts)
        };
        self.commit(vec![Flush::put(EntityRef::Pod(pod.id), &pod)]).await;
        Ok(attempts)
    }

    /// Swap a live pod onto another version of its pack, in place. Node
    /// allocation is untouched; the runtime tag of the target version must
    /// still match the node.
    pub async fn rollback_pod(&self, pod_id: Uuid, target_version: &str) -> Result<Pod, Error> {
        let pod = {
            let mut state = self.write();
            let pod = state
                .pods
                .get(&pod_id)
                .ok_or(Error::PodNotFound(pod_id))?;
            if !matches!(
                pod.status,
                PodStatus::Scheduled | PodStatus::Starting | PodStatus::Running
            ) {
                return Err(Error::InvalidState(format!(
                    "pod {pod_id} is {}, rollback needs scheduled|starting|running",
                    pod.status
                )));
            }
            if pod.pack_version == target_version {
                return Err(Error::SameVersion(target_version.to_string()));
            }
            let current_pack = state
                .packs
                .get(&pod.pack_id)
                .ok_or_else(|| Error::PackNotFound(pod.pack_id.to_string()))?;
            let name = current_pack.name.clone();
            let target_id = *state
                .pack_versions
                .get(&(name.clone(), target_version.to_string()))
                .ok_or_else(|| Error::VersionNotFound {
                    name: name.clone(),
                    version: target_version.to_string(),
                })?;
            let target_tag = state.packs[&target_id].runtime_tag;
            if let Some(node_id) = pod.node_id {
                let node = state
                    .nodes
                    .get(&node_id)
                    .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;
                if !target_tag.compatible_with(node.runtime_kind) {
                    return Err(Error::RuntimeMismatch {
                        tag: target_tag.to_string(),
                        kind: node.runtime_kind.to_string(),
                    });
                }
            }

            let previous_version = pod.pack_version.clone();
            let status = pod.status;
            let pod = state.pods.get_mut(&pod_id).unwrap();
            pod.pack_id = target_id;
            pod.pack_version = target_version.to_string();
            let pod = pod.clone();

            state.push_history(PodHistoryEntry {
                pod_id,
                timestamp: Utc::now(),
                action: HistoryAction::RolledBack,
                previous_status: Some(status),
                new_status: Some(status),
                metadata: HashMap::from([
                    ("from".to_string(), previous_version),
                    ("to".to_string(), target_version.to_string()),
                ]),
            });
            pod
        };
        self.commit(vec![Flush::put(EntityRef::Pod(pod.id), &pod)]).await;
        tracing::info!(pod = %pod.id, version = %pod.pack_version, "pod rolled back");
        Ok(pod)
    }

    /// Remove a pod entity and its history. Only pending or terminal pods
    /// can be removed; live pods must be stopped or evicted first.
    pub async fn delete_pod(&self, pod_id: Uuid) -> Result<(), Error> {
        let touched_ns = {
            let mut state = self.write();
            let pod = state
                .pods
                .get(&pod_id)
                .ok_or(Error::PodNotFound(pod_id))?;
            if pod.status != PodStatus::Pending && !pod.status.is_terminal() {
                return Err(Error::InvalidState(format!(
                    "pod {pod_id} is {}, delete needs pending or terminal",
                    pod.status
                )));
            }
            let mut touched_ns = None;
            if pod.status == PodStatus::Pending {
                let (ns, cpu, mem) = (
                    pod.namespace.clone(),
                    pod.requests.cpu_millis,
                    pod.requests.memory_bytes,
                );
                state.release_namespace_usage(&ns, cpu, mem);
                touched_ns = state.namespaces.get(&ns).cloned();
            }
            state.pods.remove(&pod_id);
            state.history.remove(&pod_id);
            touched_ns
        };
        let mut flushes = vec![Flush::Delete(EntityRef::Pod(pod_id))];
        if let Some(ns) = &touched_ns {
            flushes.push(Flush::put(EntityRef::Namespace(ns.name.clone()), ns));
        }
        self.commit(flushes).await;
        Ok(())
    }

    // ─── Services ──────────────────────────────────────────────────────────

    pub async fn create_service(&self, spec: ServiceSpec) -> Result<Service, Error> {
        validate_name(&spec.name)?;
        let service = {
            let mut state = self.write();
            if !state.namespaces.contains_key(&spec.namespace) {
                return Err(Error::NamespaceMissing(spec.namespace));
            }
            let key = (spec.namespace.clone(), spec.name.clone());
            if state.service_names.contains_key(&key) {
                return Err(Error::NameTaken(spec.name));
            }
            let pack = state
                .packs
                .get(&spec.pack_id)
                .ok_or_else(|| Error::PackNotFound(spec.pack_id.to_string()))?;
            let service = Service {
                id: Uuid::new_v4(),
                name: spec.name,
                namespace: spec.namespace,
                pack_id: spec.pack_id,
                pack_version: pack.version.clone(),
                replicas: spec.replicas,
                template: spec.template,
                status: ServiceStatus::Active,
                ready_replicas: 0,
                available_replicas: 0,
                updated_replicas: 0,
                visibility: spec.visibility,
                exposed: spec.exposed,
                allowed_sources: spec.allowed_sources,
                max_surge: spec.max_surge,
                max_unavailable: spec.max_unavailable,
                created_at: Utc::now(),
            };
            state.service_names.insert(key, service.id);
            state.services.insert(service.id, service.clone());
            service
        };
        self.commit(vec![Flush::put(EntityRef::Service(service.id), &service)])
            .await;
        tracing::info!(service = %service.name, replicas = service.replicas, "service created");
        Ok(service)
    }

    pub async fn scale_service(&self, service_id: Uuid, replicas: u32) -> Result<Service, Error> {
        let service = {
            let mut state = self.write();
            let service = state
                .services
                .get_mut(&service_id)
                .ok_or_else(|| Error::InvalidState(format!("service {service_id} not found")))?;
            service.replicas = replicas;
            service.status = ServiceStatus::Scaling;
            service.clone()
        };
        self.commit(vec![Flush::put(EntityRef::Service(service.id), &service)])
            .await;
        Ok(service)
    }

    /// Re-target the service at another registered version of its pack.
    pub async fn update_service_version(
        &self,
        service_id: Uuid,
        target_version: &str,
    ) -> Result<Service, Error> {
        let service = {
            let mut state = self.write();
            let service = state
                .services
                .get(&service_id)
                .ok_or_else(|| Error::InvalidState(format!("service {service_id} not found")))?;
            let pack = state
                .packs
                .get(&service.pack_id)
                .ok_or_else(|| Error::PackNotFound(service.pack_id.to_string()))?;
            let name = pack.name.clone();
            let target_id = *state
                .pack_versions
                .get(&(name.clone(), target_version.to_string()))
                .ok_or_else(|| Error::VersionNotFound {
                    name,
                    version: target_version.to_string(),
                })?;
            let service = state.services.get_mut(&service_id).unwrap();
            service.pack_id = target_id;
            service.pack_version = target_version.to_string();
            service.status = ServiceStatus::Scaling;
            service.clone()
        };
        self.commit(vec![Flush::put(EntityRef::Service(service.id), &service)])
            .await;
        tracing::info!(service = %service.name, version = %service.pack_version, "service retargeted");
        Ok(service)
    }

    pub async fn set_service_status(
        &self,
        service_id: Uuid,
        status: ServiceStatus,
    ) -> Result<Service, Error> {
        let service = {
            let mut state = self.write();
            let service = state
                .services
                .get_mut(&service_id)
                .ok_or_else(|| Error::InvalidState(format!("service {service_id} not found")))?;
            service.status = status;
            service.clone()
        };
        self.commit(vec![Flush::put(EntityRef::Service(service.id), &service)])
            .await;
        Ok(service)
    }

    pub async fn update_service_observed(
        &self,
        service_id: Uuid,
        ready: u32,
        available: u32,
        updated: u32,
    ) -> Result<(), Error> {
        let service = {
            let mut state = self.write();
            let service = state
                .services
                .get_mut(&service_id)
                .ok_or_else(|| Error::InvalidState(format!("service {service_id} not found")))?;
            if (service.ready_replicas, service.available_replicas, service.updated_replicas)
                == (ready, available, updated)
            {
                return Ok(());
            }
            service.ready_replicas = ready;
            service.available_replicas = available;
            service.updated_replicas = updated;
            service.clone()
        };
        self.commit(vec![Flush::put(EntityRef::Service(service.id), &service)])
            .await;
        Ok(())
    }

    /// Final removal, once the reconciler has cleaned up the pods of a
    /// `deleting` service.
    pub async fn remove_service(&self, service_id: Uuid) -> Result<(), Error> {
        {
            let mut state = self.write();
            let Some(service) = state.services.remove(&service_id) else {
                return Err(Error::InvalidState(format!("service {service_id} not found")));
            };
            state
                .service_names
                .remove(&(service.namespace.clone(), service.name.clone()));
        }
        self.commit(vec![Flush::Delete(EntityRef::Service(service_id))])
            .await;
        Ok(())
    }

    // ─── Read views ────────────────────────────────────────────────────────

    pub fn nodes(&self) -> Vec<Node> {
        self.read().nodes.values().cloned().collect()
    }

    pub fn get_node(&self, node_id: Uuid) -> Option<Node> {
        self.read().nodes.get(&node_id).cloned()
    }

    pub fn node_by_name(&self, name: &str) -> Option<Node> {
        let state = self.read();
        state
            .node_names
            .get(name)
            .and_then(|id| state.nodes.get(id))
            .cloned()
    }

    /// Nodes placement may consider: online and not cordoned.
    pub fn schedulable_nodes(&self) -> Vec<Node> {
        self.read()
            .nodes
            .values()
            .filter(|n| n.status == NodeStatus::Online && !n.unschedulable)
            .cloned()
            .collect()
    }

    pub fn get_pod(&self, pod_id: Uuid) -> Option<Pod> {
        self.read().pods.get(&pod_id).cloned()
    }

    pub fn pods(&self) -> Vec<Pod> {
        self.read().pods.values().cloned().collect()
    }

    /// Pending pods, highest priority first; FIFO within a priority.
    pub fn pending_pods_by_priority(&self) -> Vec<Pod> {
        let mut pods: Vec<Pod> = self
            .read()
            .pods
            .values()
            .filter(|p| p.status == PodStatus::Pending)
            .cloned()
            .collect();
        pods.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        pods
    }

    pub fn pods_on_node(&self, node_id: Uuid) -> Vec<Pod> {
        let state = self.read();
        state
            .pods_by_node
            .get(&node_id)
            .map(|set| {
                set.iter()
                    .filter_map(|id| state.pods.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Non-terminal pods running any version of the named pack. This is the
    /// observed set the reconciler compares against desired state.
    pub fn live_pods_of_pack(&self, pack_name: &str) -> Vec<Pod> {
        let state = self.read();
        state
            .pods
            .values()
            .filter(|p| !p.status.is_terminal())
            .filter(|p| {
                state
                    .packs
                    .get(&p.pack_id)
                    .is_some_and(|pack| pack.name == pack_name)
            })
            .cloned()
            .collect()
    }

    pub fn get_pack(&self, pack_id: Uuid) -> Option<Pack> {
        self.read().packs.get(&pack_id).cloned()
    }

    pub fn pack_by_name_version(&self, name: &str, version: &str) -> Option<Pack> {
        let state = self.read();
        state
            .pack_versions
            .get(&(name.to_string(), version.to_string()))
            .and_then(|id| state.packs.get(id))
            .cloned()
    }

    pub fn packs_by_name(&self, name: &str) -> Vec<Pack> {
        self.read()
            .packs
            .values()
            .filter(|p| p.name == name)
            .cloned()
            .collect()
    }

    pub fn packs(&self) -> Vec<Pack> {
        self.read().packs.values().cloned().collect()
    }

    pub fn services(&self) -> Vec<Service> {
        self.read().services.values().cloned().collect()
    }

    pub fn get_service(&self, service_id: Uuid) -> Option<Service> {
        self.read().services.get(&service_id).cloned()
    }

    pub fn service_by_name(&self, namespace: &str, name: &str) -> Option<Service> {
        let state = self.read();
        state
            .service_names
            .get(&(namespace.to_string(), name.to_string()))
            .and_then(|id| state.services.get(id))
            .cloned()
    }

    pub fn namespaces(&self) -> Vec<Namespace> {
        self.read().namespaces.values().cloned().collect()
    }

    pub fn get_namespace(&self, name: &str) -> Option<Namespace> {
        self.read().namespaces.get(name).cloned()
    }

    pub fn priority_classes(&self) -> Vec<PriorityClass> {
        self.read().priority_classes.values().cloned().collect()
    }

    pub fn pod_history(&self, pod_id: Uuid) -> Vec<PodHistoryEntry> {
        self.read().history.get(&pod_id).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::node::{NodeCapacity, RuntimeKind};
    use pkg_types::pack::RuntimeTag;
    use pkg_types::pod::ResourceRequests;

    fn node_spec(name: &str) -> RegisterNodeInput {
        RegisterNodeInput {
            name: name.to_string(),
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
        }
    }

    fn pack_spec(name: &str, version: &str) -> PackSpec {
        PackSpec {
            name: name.to_string(),
            version: version.to_string(),
            runtime_tag: RuntimeTag::Node,
            owner_id: "test".to_string(),
            bundle_url: None,
            bundle_bytes: Some(b"exports.main = () => {}".to_vec()),
            metadata: Default::default(),
        }
    }

    fn pod_spec(pack_id: Uuid) -> PodSpec {
        PodSpec {
            pack_id,
            namespace: "default".to_string(),
            priority_class: None,
            requests: ResourceRequests {
                cpu_millis: 200,
                memory_bytes: 256,
            },
            limits: ResourceRequests::default(),
            labels: HashMap::new(),
            tolerations: vec![],
            node_selector: HashMap::new(),
            env: HashMap::new(),
            created_by: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn basic_placement_updates_allocation() {
        let store = StateStore::in_memory();
        let pack = store.register_pack(pack_spec("p", "1.0.0")).await.unwrap();
        let node = store.add_node(node_spec("na")).await.unwrap();
        let pod = store.create_pod(pod_spec(pack.id)).await.unwrap();

        let pod = store.schedule_pod(pod.id, node.id).await.unwrap();
        assert_eq!(pod.status, PodStatus::Scheduled);
        assert_eq!(pod.node_id, Some(node.id));

        let node = store.get_node(node.id).unwrap();
        assert_eq!(node.allocated.cpu_millis, 200);
        assert_eq!(node.allocated.memory_bytes, 256);
        assert_eq!(node.allocated.pods, 1);
    }

    #[tokio::test]
    async fn duplicate_names_conflict() {
        let store = StateStore::in_memory();
        store.add_node(node_spec("na")).await.unwrap();
        let err = store.add_node(node_spec("na")).await.unwrap_err();
        assert_eq!(err.code(), "NAME_TAKEN");

        store.register_pack(pack_spec("p", "1.0.0")).await.unwrap();
        let err = store
            .register_pack(pack_spec("p", "1.0.0"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VERSION_EXISTS");
    }

    #[tokio::test]
    async fn schedule_rechecks_resources_atomically() {
        let store = StateStore::in_memory();
        let pack = store.register_pack(pack_spec("p", "1.0.0")).await.unwrap();
        let node = store.add_node(node_spec("na")).await.unwrap();

        let mut spec = pod_spec(pack.id);
        spec.requests.cpu_millis = 700;
        let first = store.create_pod(spec.clone()).await.unwrap();
        let second = store.create_pod(spec).await.unwrap();

        store.schedule_pod(first.id, node.id).await.unwrap();
        let err = store.schedule_pod(second.id, node.id).await.unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_RESOURCES");
    }

    #[tokio::test]
    async fn terminal_transition_releases_everything() {
        let store = StateStore::in_memory();
        let pack = store.register_pack(pack_spec("p", "1.0.0")).await.unwrap();
        let node = store.add_node(node_spec("na")).await.unwrap();
        let pod = store.create_pod(pod_spec(pack.id)).await.unwrap();
        store.schedule_pod(pod.id, node.id).await.unwrap();

        let pod = store
            .transition_pod(pod.id, PodTransition::Evict, Some("preempted"))
            .await
            .unwrap();
        assert_eq!(pod.status, PodStatus::Evicted);
        assert_eq!(pod.node_id, None);
        assert_eq!(pod.status_message.as_deref(), Some("preempted"));

        let node = store.get_node(node.id).unwrap();
        assert_eq!(node.allocated, NodeAllocated::default());
        assert!(store.pods_on_node(node.id).is_empty());

        let ns = store.get_namespace("default").unwrap();
        assert_eq!(ns.usage.pods, 0);

        // Terminal is a sink.
        let err = store
            .transition_pod(pod.id, PodTransition::Stop, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_STATUS_TRANSITION");
    }

    #[tokio::test]
    async fn quota_blocks_admission() {
        let store = StateStore::in_memory();
        let pack = store.register_pack(pack_spec("p", "1.0.0")).await.unwrap();
        store
            .create_namespace(
                "team-a".to_string(),
                Some(ResourceQuota {
                    max_pods: Some(1),
                    max_cpu_millis: None,
                    max_memory_bytes: None,
                }),
                None,
            )
            .await
            .unwrap();

        let mut spec = pod_spec(pack.id);
        spec.namespace = "team-a".to_string();
        store.create_pod(spec.clone()).await.unwrap();
        let err = store.create_pod(spec).await.unwrap_err();
        assert_eq!(err.code(), "QUOTA_EXCEEDED");
    }

    #[tokio::test]
    async fn rollback_round_trip() {
        let store = StateStore::in_memory();
        let v0 = store.register_pack(pack_spec("p", "1.0.0")).await.unwrap();
        let _v1 = store.register_pack(pack_spec("p", "2.0.0")).await.unwrap();
        let node = store.add_node(node_spec("na")).await.unwrap();
        let pod = store.create_pod(pod_spec(v0.id)).await.unwrap();
        store.schedule_pod(pod.id, node.id).await.unwrap();

        let pod = store.rollback_pod(pod.id, "2.0.0").await.unwrap();
        assert_eq!(pod.pack_version, "2.0.0");
        let pod = store.rollback_pod(pod.id, "1.0.0").await.unwrap();
        assert_eq!(pod.pack_version, "1.0.0");

        let rolled: Vec<_> = store
            .pod_history(pod.id)
            .into_iter()
            .filter(|h| h.action == HistoryAction::RolledBack)
            .collect();
        assert_eq!(rolled.len(), 2);

        // node allocation untouched by rollback
        let node = store.get_node(node.id).unwrap();
        assert_eq!(node.allocated.pods, 1);

        let err = store.rollback_pod(pod.id, "1.0.0").await.unwrap_err();
        assert_eq!(err.code(), "SAME_VERSION");
        let err = store.rollback_pod(pod.id, "9.9.9").await.unwrap_err();
        assert_eq!(err.code(), "VERSION_NOT_FOUND");
    }

    #[tokio::test]
    async fn pack_delete_blocked_while_referenced() {
        let store = StateStore::in_memory();
        let pack = store.register_pack(pack_spec("p", "1.0.0")).await.unwrap();
        let pod = store.create_pod(pod_spec(pack.id)).await.unwrap();

        let err = store.delete_pack(pack.id).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");

        store
            .transition_pod(pod.id, PodTransition::Fail, Some("gave up"))
            .await
            .unwrap();
        store.delete_pod(pod.id).await.unwrap();
        store.delete_pack(pack.id).await.unwrap();
    }

    #[tokio::test]
    async fn reserved_namespaces_cannot_be_deleted() {
        let store = StateStore::in_memory();
        assert!(store.delete_namespace("default").await.is_err());

        store
            .create_namespace("scratch".to_string(), None, None)
            .await
            .unwrap();
        store.delete_namespace("scratch").await.unwrap();
    }

    #[tokio::test]
    async fn priority_resolution() {
        let store = StateStore::in_memory();
        let pack = store.register_pack(pack_spec("p", "1.0.0")).await.unwrap();
        store
            .set_priority_class(PriorityClass {
                name: "critical".to_string(),
                value: 1000,
                global_default: false,
            })
            .await
            .unwrap();

        let mut spec = pod_spec(pack.id);
        spec.priority_class = Some("critical".to_string());
        let pod = store.create_pod(spec).await.unwrap();
        assert_eq!(pod.priority, 1000);

        // Unknown class resolves to 0.
        let mut spec = pod_spec(pack.id);
        spec.priority_class = Some("missing".to_string());
        let pod = store.create_pod(spec).await.unwrap();
        assert_eq!(pod.priority, 0);
    }

    #[tokio::test]
    async fn pending_pods_sorted_by_priority() {
        let store = StateStore::in_memory();
        let pack = store.register_pack(pack_spec("p", "1.0.0")).await.unwrap();
        store
            .set_priority_class(PriorityClass {
                name: "high".to_string(),
                value: 100,
                global_default: false,
            })
            .await
            .unwrap();

        let low = store.create_pod(pod_spec(pack.id)).await.unwrap();
        let mut spec = pod_spec(pack.id);
        spec.priority_class = Some("high".to_string());
        let high = store.create_pod(spec).await.unwrap();

        let pending = store.pending_pods_by_priority();
        assert_eq!(pending[0].id, high.id);
        assert_eq!(pending[1].id, low.id);
    }

    #[tokio::test]
    async fn recovery_recomputes_allocation() {
        let record = Arc::new(crate::record::MemoryRecordStore::new());
        let store = StateStore::new(record.clone());
        let pack = store.register_pack(pack_spec("p", "1.0.0")).await.unwrap();
        let node = store.add_node(node_spec("na")).await.unwrap();
        let pod = store.create_pod(pod_spec(pack.id)).await.unwrap();
        store.schedule_pod(pod.id, node.id).await.unwrap();

        let recovered = StateStore::new(record);
        recovered.load().await.unwrap();

        let node = recovered.get_node(node.id).unwrap();
        assert_eq!(node.allocated.cpu_millis, 200);
        assert_eq!(node.allocated.pods, 1);
        assert_eq!(recovered.pods_on_node(node.id).len(), 1);
        let ns = recovered.get_namespace("default").unwrap();
        assert_eq!(ns.usage.pods, 1);
    }

    /// Resource conservation: after an arbitrary mix of lifecycle
    /// operations, each node's allocation equals the sum of requests over
    /// its live pods, and never exceeds allocatable.
    #[tokio::test]
    async fn allocation_tracks_live_pods_exactly() {
        let store = StateStore::in_memory();
        let pack = store.register_pack(pack_spec("p", "1.0.0")).await.unwrap();
        store.register_pack(pack_spec("p", "2.0.0")).await.unwrap();
        let node_a = store.add_node(node_spec("na")).await.unwrap();
        let node_b = store.add_node(node_spec("nb")).await.unwrap();

        let mut pods = Vec::new();
        for i in 0..6 {
            let mut spec = pod_spec(pack.id);
            spec.requests.cpu_millis = 100 + i * 10;
            spec.requests.memory_bytes = 64 + i;
            pods.push(store.create_pod(spec).await.unwrap());
        }
        for (i, pod) in pods.iter().enumerate() {
            let node = if i % 2 == 0 { node_a.id } else { node_b.id };
            store.schedule_pod(pod.id, node).await.unwrap();
        }
        // Drive a mixed bag of lifecycles.
        store.transition_pod(pods[0].id, PodTransition::Start, None).await.unwrap();
        store.transition_pod(pods[0].id, PodTransition::Run, None).await.unwrap();
        store.transition_pod(pods[1].id, PodTransition::Evict, Some("test")).await.unwrap();
        store.transition_pod(pods[2].id, PodTransition::Start, None).await.unwrap();
        store.transition_pod(pods[2].id, PodTransition::Fail, Some("boom")).await.unwrap();
        store.rollback_pod(pods[3].id, "2.0.0").await.unwrap();
        store.transition_pod(pods[4].id, PodTransition::Stop, None).await.unwrap();
        store.transition_pod(pods[4].id, PodTransition::Stopped, None).await.unwrap();

        for node in store.nodes() {
            let live = store.pods_on_node(node.id);
            let cpu: u64 = live.iter().map(|p| p.requests.cpu_millis).sum();
            let mem: u64 = live.iter().map(|p| p.requests.memory_bytes).sum();
            assert_eq!(node.allocated.cpu_millis, cpu, "cpu on {}", node.name);
            assert_eq!(node.allocated.memory_bytes, mem, "memory on {}", node.name);
            assert_eq!(node.allocated.pods as usize, live.len(), "slots on {}", node.name);
            assert!(node.allocated.cpu_millis <= node.allocatable.cpu_millis);
            assert!(node.allocated.memory_bytes <= node.allocatable.memory_bytes);
            assert!(node.allocated.pods <= node.allocatable.pods);
            for pod in &live {
                assert!(!pod.status.is_terminal());
                assert_eq!(pod.node_id, Some(node.id));
            }
        }
    }

    #[tokio::test]
    async fn mutations_notify_observers() {
        let store = StateStore::in_memory();
        let mut rx = store.subscribe();
        let node = store.add_node(node_spec("na")).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.entity, EntityRef::Node(node.id));
        assert_eq!(event.kind, ChangeKind::Put);
    }
}
