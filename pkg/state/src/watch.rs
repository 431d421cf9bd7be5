use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Type of change in the watch stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChangeKind {
    Put,
    Delete,
}

/// Which entity a state event refers to. Observers get the id only and
/// re-read through the store for the current value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum EntityRef {
    Node(Uuid),
    Pack(Uuid),
    Pod(Uuid),
    Service(Uuid),
    Namespace(String),
    PriorityClass(String),
}

impl EntityRef {
    /// Key under which this entity is flushed to the record store.
    pub fn record_key(&self) -> String {
        use pkg_constants::state::*;
        match self {
            EntityRef::Node(id) => format!("{NODE_PREFIX}{id}"),
            EntityRef::Pack(id) => format!("{PACK_PREFIX}{id}"),
            EntityRef::Pod(id) => format!("{POD_PREFIX}{id}"),
            EntityRef::Service(id) => format!("{SERVICE_PREFIX}{id}"),
            EntityRef::Namespace(name) => format!("{NAMESPACE_PREFIX}{name}"),
            EntityRef::PriorityClass(name) => format!("{PRIORITY_CLASS_PREFIX}{name}"),
        }
    }
}

/// A single watch event representing a committed state mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEvent {
    pub seq: u64,
    pub kind: ChangeKind,
    pub entity: EntityRef,
}

/// In-memory event log tracking all state mutations with monotonic sequence
/// numbers. Observers subscribe for new events and can page missed ones
/// with [`EventLog::events_since`].
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<RwLock<EventLogInner>>,
    sender: broadcast::Sender<StateEvent>,
}

struct EventLogInner {
    seq: u64,
    /// Ring buffer of recent events (capped)
    events: Vec<StateEvent>,
    max_events: usize,
}

impl EventLog {
    /// Create a new event log with the given capacity for recent events.
    pub fn new(max_events: usize) -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(RwLock::new(EventLogInner {
                seq: 0,
                events: Vec::with_capacity(max_events),
                max_events,
            })),
            sender,
        }
    }

    /// Record a new event. Called by the state store after a mutation
    /// commits and its lock is released.
    pub async fn emit(&self, kind: ChangeKind, entity: EntityRef) {
        let mut inner = self.inner.write().await;
        inner.seq += 1;
        let event = StateEvent {
            seq: inner.seq,
            kind,
            entity,
        };
        // Ring buffer: remove oldest if at capacity
        if inner.events.len() >= inner.max_events {
            inner.events.remove(0);
        }
        inner.events.push(event.clone());
        // Broadcast to subscribers (ignore errors if no receivers)
        let _ = self.sender.send(event);
    }

    /// Get the current sequence number.
    pub async fn current_seq(&self) -> u64 {
        self.inner.read().await.seq
    }

    /// Get all events since the given sequence number.
    pub async fn events_since(&self, from_seq: u64) -> Vec<StateEvent> {
        let inner = self.inner.read().await;
        inner
            .events
            .iter()
            .filter(|e| e.seq > from_seq)
            .cloned()
            .collect()
    }

    /// Subscribe to receive new events as they are emitted.
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequence_is_monotonic() {
        let log = EventLog::new(8);
        let id = Uuid::new_v4();
        log.emit(ChangeKind::Put, EntityRef::Pod(id)).await;
        log.emit(ChangeKind::Delete, EntityRef::Pod(id)).await;
        assert_eq!(log.current_seq().await, 2);

        let since = log.events_since(1).await;
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].kind, ChangeKind::Delete);
    }

    #[tokio::test]
    async fn ring_buffer_drops_oldest() {
        let log = EventLog::new(2);
        for _ in 0..3 {
            log.emit(ChangeKind::Put, EntityRef::Namespace("default".into()))
                .await;
        }
        let all = log.events_since(0).await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].seq, 2);
    }

    #[tokio::test]
    async fn subscribers_see_events() {
        let log = EventLog::new(8);
        let mut rx = log.subscribe();
        log.emit(ChangeKind::Put, EntityRef::Node(Uuid::new_v4()))
            .await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.seq, 1);
    }
}
