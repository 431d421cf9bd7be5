//! Client side of the message channel, used by node agents (and pod hosts)
//! to reach the control plane over an outbound WebSocket.
//!
//! [`Connection::connect`] performs the attach handshake: wait for
//! `connected`, authenticate within the window, then hand the caller a live
//! connection plus the stream of non-correlated inbound frames. Reconnect
//! policy (backoff, register vs reconnect) belongs to the caller.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};
use uuid::Uuid;

use pkg_constants::channel::{AUTH_TIMEOUT_SECS, MAX_PENDING_CORRELATIONS, REQUEST_TIMEOUT_SECS};
use pkg_types::error::Error;
use pkg_types::protocol::{
    self, AuthenticatePayload, Inbound, Payload, PingPayload,
};

use crate::correlation::CorrelationTable;

#[derive(Debug)]
pub struct Connection {
    out: mpsc::UnboundedSender<WsMessage>,
    correlations: Arc<CorrelationTable>,
    connection_id: Uuid,
}

impl Connection {
    /// Dial, wait for `connected`, and authenticate. Returns the connection
    /// and the stream of inbound frames that are not correlation responses.
    pub async fn connect(
        url: &str,
        token: &str,
    ) -> Result<(Connection, mpsc::Receiver<Inbound>), Error> {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| Error::NotConnected(format!("dial {url}: {e}")))?;
        let (mut sink, mut stream) = ws.split();

        let (out, mut out_rx) = mpsc::unbounded_channel::<WsMessage>();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let correlations = Arc::new(CorrelationTable::new(MAX_PENDING_CORRELATIONS));
        let (inbound_tx, mut inbound_rx) = mpsc::channel::<Inbound>(64);

        {
            let correlations = correlations.clone();
            let out = out.clone();
            tokio::spawn(async move {
                while let Some(message) = stream.next().await {
                    let text = match message {
                        Ok(WsMessage::Text(text)) => text,
                        Ok(WsMessage::Ping(data)) => {
                            let _ = out.send(WsMessage::Pong(data));
                            continue;
                        }
                        Ok(WsMessage::Close(_)) | Err(_) => break,
                        Ok(_) => continue,
                    };
                    let inbound = match protocol::decode(text.as_str()) {
                        Ok(inbound) => inbound,
                        Err(protocol::DecodeError::UnknownType(kind)) => {
                            debug!(kind, "ignoring unknown frame type");
                            continue;
                        }
                        Err(e) => {
                            debug!(error = %e, "dropping malformed frame");
                            continue;
                        }
                    };
                    // Application-level liveness: answer pings in place.
                    if let Payload::Ping(ping) = &inbound.payload {
                        let pong = Payload::Pong(PingPayload {
                            timestamp: ping.timestamp,
                        });
                        if let Ok(text) = protocol::encode(&pong, None) {
                            let _ = out.send(WsMessage::Text(text.into()));
                        }
                        continue;
                    }
                    if let Some(id) = &inbound.correlation_id {
                        if correlations.resolve(id, inbound.payload.clone()) {
                            continue;
                        }
                    }
                    if inbound_tx.send(inbound).await.is_err() {
                        break;
                    }
                }
                correlations.reject_all(|| Error::ConnectionClosed);
            });
        }

        // Attach handshake: the server speaks first.
        let connected = tokio::time::timeout(
            Duration::from_secs(AUTH_TIMEOUT_SECS),
            inbound_rx.recv(),
        )
        .await
        .map_err(|_| Error::Timeout("waiting for connected frame".into()))?
        .ok_or(Error::ConnectionClosed)?;
        let connection_id = match connected.payload {
            Payload::Connected(p) => p.connection_id,
            other => {
                return Err(Error::Validation(format!(
                    "expected connected frame, got {}",
                    other.kind()
                )));
            }
        };

        let connection = Connection {
            out,
            correlations,
            connection_id,
        };
        match connection
            .request(
                Payload::Authenticate(AuthenticatePayload {
                    token: token.to_string(),
                }),
                Duration::from_secs(AUTH_TIMEOUT_SECS),
            )
            .await?
        {
            Payload::AuthAck(_) => {}
            other => {
                return Err(Error::AuthFailed(format!(
                    "unexpected auth response {}",
                    other.kind()
                )));
            }
        }

        Ok((connection, inbound_rx))
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Fire a correlated request and await its response or deadline.
    pub async fn request(&self, payload: Payload, timeout: Duration) -> Result<Payload, Error> {
        let (id, rx) = self.correlations.register(timeout)?;
        let text = protocol::encode(&payload, Some(&id))
            .map_err(|e| Error::Validation(e.to_string()))?;
        self.out
            .send(WsMessage::Text(text.into()))
            .map_err(|_| Error::NotConnected("connection closed".into()))?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                self.correlations.forget(&id);
                Err(Error::Timeout(format!(
                    "request {} exceeded {timeout:?}",
                    payload.kind()
                )))
            }
        }
    }

    /// Default-deadline variant of [`Connection::request`].
    pub async fn request_default(&self, payload: Payload) -> Result<Payload, Error> {
        self.request(payload, Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .await
    }

    /// Fire-and-forget send.
    pub fn send(&self, payload: Payload) -> Result<(), Error> {
        let text = protocol::encode(&payload, None)
            .map_err(|e| Error::Validation(e.to_string()))?;
        self.out
            .send(WsMessage::Text(text.into()))
            .map_err(|_| Error::NotConnected("connection closed".into()))
    }

    /// Answer an inbound correlated frame.
    pub fn reply(&self, payload: Payload, correlation_id: &str) -> Result<(), Error> {
        let text = protocol::encode(&payload, Some(correlation_id))
            .map_err(|e| Error::Validation(e.to_string()))?;
        self.out
            .send(WsMessage::Text(text.into()))
            .map_err(|_| Error::NotConnected("connection closed".into()))
    }

    pub fn close(&self) {
        if self.out.send(WsMessage::Close(None)).is_err() {
            warn!("close on already-dropped connection");
        }
    }
}
