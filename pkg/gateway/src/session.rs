//! One attached channel session (a node agent or a pod host).

use std::sync::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use pkg_channel::correlation::CorrelationTable;
use pkg_channel::sendq::{Enqueued, FrameClass, SendQueue};
use pkg_constants::channel::MAX_PENDING_CORRELATIONS;
use pkg_types::error::Error;
use pkg_types::protocol::{self, Payload};

/// `open → authenticated → registered → (stale | closed)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Authenticated,
    Registered,
    Stale,
    Closed,
}

/// What the far end registered as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Pending,
    Node(Uuid),
    Pod { pod_id: Uuid, service_id: Uuid },
}

pub struct Session {
    pub id: Uuid,
    queue: SendQueue,
    /// Cancelling closes the socket; the writer sends the close frame.
    pub closer: CancellationToken,
    /// Close code the writer should use, set before cancelling.
    close_code: RwLock<u16>,
    pub correlations: CorrelationTable,
    state: RwLock<SessionState>,
    kind: RwLock<SessionKind>,
    liveness: RwLock<Liveness>,
}

struct Liveness {
    last_pong: Instant,
    ping_sent: Option<Instant>,
}

impl Session {
    pub fn new(queue: SendQueue) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            queue,
            closer: CancellationToken::new(),
            close_code: RwLock::new(pkg_constants::network::CLOSE_NORMAL),
            correlations: CorrelationTable::new(MAX_PENDING_CORRELATIONS),
            state: RwLock::new(SessionState::Open),
            kind: RwLock::new(SessionKind::Pending),
            liveness: RwLock::new(Liveness {
                last_pong: Instant::now(),
                ping_sent: None,
            }),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.read().unwrap()
    }

    pub fn set_state(&self, state: SessionState) {
        *self.state.write().unwrap() = state;
    }

    pub fn kind(&self) -> SessionKind {
        *self.kind.read().unwrap()
    }

    pub fn set_kind(&self, kind: SessionKind) {
        *self.kind.write().unwrap() = kind;
    }

    pub fn node_id(&self) -> Option<Uuid> {
        match self.kind() {
            SessionKind::Node(id) => Some(id),
            _ => None,
        }
    }

    pub fn pod_id(&self) -> Option<Uuid> {
        match self.kind() {
            SessionKind::Pod { pod_id, .. } => Some(pod_id),
            _ => None,
        }
    }

    /// Queue a frame. Non-critical frames are shed while congested.
    pub fn send(&self, payload: &Payload, class: FrameClass) -> Result<Enqueued, Error> {
        if self.state() == SessionState::Closed {
            return Err(Error::NotConnected(format!("session {} closed", self.id)));
        }
        let text = protocol::encode(payload, None).map_err(|e| Error::Validation(e.to_string()))?;
        self.queue.enqueue(text, class)
    }

    /// Queue a correlated reply or request frame.
    pub fn send_correlated(
        &self,
        payload: &Payload,
        correlation_id: &str,
        class: FrameClass,
    ) -> Result<Enqueued, Error> {
        if self.state() == SessionState::Closed {
            return Err(Error::NotConnected(format!("session {} closed", self.id)));
        }
        let text = protocol::encode(payload, Some(correlation_id))
            .map_err(|e| Error::Validation(e.to_string()))?;
        self.queue.enqueue(text, class)
    }

    /// Fire a correlated request at the far end and await its answer.
    pub async fn request(&self, payload: Payload, timeout: Duration) -> Result<Payload, Error> {
        let (id, rx) = self.correlations.register(timeout)?;
        self.send_correlated(&payload, &id, FrameClass::Critical)?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                self.correlations.forget(&id);
                Err(Error::Timeout(format!(
                    "request {} to session {}",
                    payload.kind(),
                    self.id
                )))
            }
        }
    }

    pub fn record_pong(&self) {
        let mut liveness = self.liveness.write().unwrap();
        liveness.last_pong = Instant::now();
        liveness.ping_sent = None;
    }

    pub fn record_ping_sent(&self) {
        let mut liveness = self.liveness.write().unwrap();
        if liveness.ping_sent.is_none() {
            liveness.ping_sent = Some(Instant::now());
        }
    }

    /// An unanswered ping older than the pong timeout marks the session
    /// stale.
    pub fn is_stale(&self, pong_timeout: Duration) -> bool {
        let liveness = self.liveness.read().unwrap();
        matches!(liveness.ping_sent, Some(sent) if sent.elapsed() > pong_timeout)
    }

    pub fn is_congested(&self) -> bool {
        self.queue.is_congested()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.queue.dropped()
    }

    /// Ask the writer to close the socket with `code`. Idempotent.
    pub fn close(&self, code: u16) {
        *self.close_code.write().unwrap() = code;
        self.set_state(SessionState::Closed);
        self.closer.cancel();
    }

    pub fn close_code(&self) -> u16 {
        *self.close_code.read().unwrap()
    }

    /// Mark stale and close with 1011.
    pub fn mark_stale(&self) {
        self.set_state(SessionState::Stale);
        *self.close_code.write().unwrap() = pkg_constants::network::CLOSE_GOING_AWAY;
        self.closer.cancel();
    }
}
