//! Request/response correlation over the message channel.
//!
//! Outbound requests register a fresh correlation id paired with a one-shot
//! resolver and a deadline. Any inbound frame carrying the id resolves it;
//! a frame whose type ends in `:error` rejects it. Expired entries are
//! garbage-collected by [`CorrelationTable::sweep`]; on socket close the
//! owner rejects everything with `CONNECTION_CLOSED`.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use uuid::Uuid;

use pkg_types::error::Error;
use pkg_types::protocol::Payload;

#[derive(Debug)]
struct Pending {
    tx: oneshot::Sender<Result<Payload, Error>>,
    deadline: Instant,
}

#[derive(Debug)]
pub struct CorrelationTable {
    pending: DashMap<String, Pending>,
    capacity: usize,
}

impl CorrelationTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: DashMap::new(),
            capacity,
        }
    }

    /// Register a fresh correlation. Returns the id to stamp on the outbound
    /// frame and the receiver the caller awaits.
    pub fn register(
        &self,
        timeout: Duration,
    ) -> Result<(String, oneshot::Receiver<Result<Payload, Error>>), Error> {
        if self.pending.len() >= self.capacity {
            return Err(Error::InvalidState(format!(
                "correlation table full ({} pending)",
                self.capacity
            )));
        }
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id.clone(),
            Pending {
                tx,
                deadline: Instant::now() + timeout,
            },
        );
        Ok((id, rx))
    }

    /// Route an inbound frame to its waiter. Returns `false` when the id is
    /// unknown (already resolved, timed out, or never ours).
    pub fn resolve(&self, correlation_id: &str, payload: Payload) -> bool {
        let Some((_, pending)) = self.pending.remove(correlation_id) else {
            return false;
        };
        let outcome = match payload {
            Payload::Error { body, .. } => Err(error_from_body(body)),
            other => Ok(other),
        };
        pending.tx.send(outcome).is_ok()
    }

    /// Drop a registration the caller no longer waits on.
    pub fn forget(&self, correlation_id: &str) {
        self.pending.remove(correlation_id);
    }

    /// Reject every outstanding correlation, e.g. when the session closes
    /// or its owner is stopped.
    pub fn reject_all(&self, make_err: impl Fn() -> Error) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending.tx.send(Err(make_err()));
            }
        }
    }

    /// Reject entries past their deadline. Returns how many were collected.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|e| e.deadline <= now)
            .map(|e| e.key().clone())
            .collect();
        let count = expired.len();
        for id in expired {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending.tx.send(Err(Error::Timeout(format!(
                    "no response for correlation {id}"
                ))));
            }
        }
        count
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Map a wire `{code, message}` back onto the taxonomy where it matters to
/// callers; everything else surfaces as a validation-shaped error carrying
/// the original code.
fn error_from_body(body: pkg_types::error::ErrorBody) -> Error {
    match body.code.as_str() {
        "CONNECTION_CLOSED" => Error::ConnectionClosed,
        "NOT_CONNECTED" => Error::NotConnected(body.message),
        "TIMEOUT" => Error::Timeout(body.message),
        "AUTH_FAILED" => Error::AuthFailed(body.message),
        "AUTH_TIMEOUT" => Error::AuthTimeout,
        "CANCELLED" => Error::Cancelled,
        _ => Error::Validation(format!("{}: {}", body.code, body.message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::protocol::{PingPayload, kinds};

    fn pong() -> Payload {
        Payload::Pong(PingPayload {
            timestamp: chrono::Utc::now(),
        })
    }

    #[tokio::test]
    async fn resolve_delivers_payload() {
        let table = CorrelationTable::new(16);
        let (id, rx) = table.register(Duration::from_secs(5)).unwrap();
        assert!(table.resolve(&id, pong()));
        assert!(matches!(rx.await.unwrap(), Ok(Payload::Pong(_))));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn error_frames_reject() {
        let table = CorrelationTable::new(16);
        let (id, rx) = table.register(Duration::from_secs(5)).unwrap();
        let payload = Payload::Error {
            of: kinds::NODE_REGISTER.to_string(),
            body: Error::AuthFailed("bad token".into()).into(),
        };
        assert!(table.resolve(&id, payload));
        match rx.await.unwrap() {
            Err(Error::AuthFailed(msg)) => assert_eq!(msg, "bad token"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn sweep_times_out_expired_entries() {
        let table = CorrelationTable::new(16);
        let (_id, rx) = table.register(Duration::from_millis(0)).unwrap();
        let swept = table.sweep(Instant::now() + Duration::from_millis(1));
        assert_eq!(swept, 1);
        assert!(matches!(rx.await.unwrap(), Err(Error::Timeout(_))));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn close_rejects_everything() {
        let table = CorrelationTable::new(16);
        let (_a, rx_a) = table.register(Duration::from_secs(5)).unwrap();
        let (_b, rx_b) = table.register(Duration::from_secs(5)).unwrap();
        table.reject_all(|| Error::ConnectionClosed);
        assert!(matches!(rx_a.await.unwrap(), Err(Error::ConnectionClosed)));
        assert!(matches!(rx_b.await.unwrap(), Err(Error::ConnectionClosed)));
        assert!(table.is_empty());
    }

    #[test]
    fn capacity_is_bounded() {
        let table = CorrelationTable::new(1);
        let _keep = table.register(Duration::from_secs(5)).unwrap();
        assert!(table.register(Duration::from_secs(5)).is_err());
    }

    #[test]
    fn unknown_id_is_ignored() {
        let table = CorrelationTable::new(16);
        assert!(!table.resolve("nope", pong()));
    }
}
