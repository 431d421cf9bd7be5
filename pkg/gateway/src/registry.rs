//! Live session bookkeeping: connection id → session, plus node and pod
//! indexes and the per-service round-robin cursor for route lookups.

use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

use crate::session::{Session, SessionKind};

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<Uuid, Arc<Session>>,
    nodes: DashMap<Uuid, Uuid>,
    pods: DashMap<Uuid, Uuid>,
    route_cursors: DashMap<Uuid, AtomicUsize>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<Session>) {
        self.sessions.insert(session.id, session);
    }

    /// Drop the session and any index entries pointing at it.
    pub fn remove(&self, connection_id: Uuid) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove(&connection_id)?;
        match session.kind() {
            SessionKind::Node(node_id) => {
                self.nodes.remove_if(&node_id, |_, conn| *conn == connection_id);
            }
            SessionKind::Pod { pod_id, .. } => {
                self.pods.remove_if(&pod_id, |_, conn| *conn == connection_id);
            }
            SessionKind::Pending => {}
        }
        Some(session)
    }

    pub fn get(&self, connection_id: Uuid) -> Option<Arc<Session>> {
        self.sessions.get(&connection_id).map(|s| s.clone())
    }

    /// Bind a registered node to its session. A reconnect displaces the
    /// previous binding; the old session is returned so the caller can
    /// close it.
    pub fn bind_node(&self, node_id: Uuid, connection_id: Uuid) -> Option<Arc<Session>> {
        let previous = self.nodes.insert(node_id, connection_id);
        previous
            .filter(|prev| *prev != connection_id)
            .and_then(|prev| self.get(prev))
    }

    pub fn bind_pod(&self, pod_id: Uuid, connection_id: Uuid) -> Option<Arc<Session>> {
        let previous = self.pods.insert(pod_id, connection_id);
        previous
            .filter(|prev| *prev != connection_id)
            .and_then(|prev| self.get(prev))
    }

    pub fn node_session(&self, node_id: Uuid) -> Option<Arc<Session>> {
        self.nodes.get(&node_id).and_then(|conn| self.get(*conn))
    }

    pub fn pod_session(&self, pod_id: Uuid) -> Option<Arc<Session>> {
        self.pods.get(&pod_id).and_then(|conn| self.get(*conn))
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Advance and return the round-robin cursor for a service.
    pub fn next_route_index(&self, service_id: Uuid, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        let cursor = self
            .route_cursors
            .entry(service_id)
            .or_insert_with(|| AtomicUsize::new(0));
        cursor.fetch_add(1, Ordering::Relaxed) % len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_channel::sendq::send_queue;

    fn session() -> Arc<Session> {
        let (queue, _rx) = send_queue();
        Session::new(queue)
    }

    #[test]
    fn bind_and_lookup() {
        let registry = SessionRegistry::new();
        let s = session();
        let node_id = Uuid::new_v4();
        registry.insert(s.clone());
        s.set_kind(SessionKind::Node(node_id));
        assert!(registry.bind_node(node_id, s.id).is_none());
        assert_eq!(registry.node_session(node_id).unwrap().id, s.id);

        registry.remove(s.id);
        assert!(registry.node_session(node_id).is_none());
    }

    #[test]
    fn reconnect_displaces_previous_binding() {
        let registry = SessionRegistry::new();
        let node_id = Uuid::new_v4();

        let old = session();
        old.set_kind(SessionKind::Node(node_id));
        registry.insert(old.clone());
        registry.bind_node(node_id, old.id);

        let new = session();
        new.set_kind(SessionKind::Node(node_id));
        registry.insert(new.clone());
        let displaced = registry.bind_node(node_id, new.id).unwrap();
        assert_eq!(displaced.id, old.id);
        assert_eq!(registry.node_session(node_id).unwrap().id, new.id);

        // Removing the displaced session must not unbind the new one.
        registry.remove(old.id);
        assert_eq!(registry.node_session(node_id).unwrap().id, new.id);
    }

    #[test]
    fn round_robin_cycles() {
        let registry = SessionRegistry::new();
        let service = Uuid::new_v4();
        let picks: Vec<usize> = (0..6).map(|_| registry.next_route_index(service, 3)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }
}
