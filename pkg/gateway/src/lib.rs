//! Server side of the message channel.
//!
//! Owns every attached session: the attach/authenticate handshake, frame
//! dispatch, ping/pong liveness, request/response correlation toward nodes,
//! congestion shedding, and teardown. The peer signaling router lives in
//! [`signal`] and uses the same session registry for delivery.

pub mod auth;
pub mod handlers;
pub mod registry;
pub mod session;
pub mod signal;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::stream::{SplitStream, StreamExt};
use futures_util::SinkExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pkg_channel::sendq::{FrameClass, send_queue};
use pkg_constants::channel::{
    AUTH_TIMEOUT_SECS, PING_INTERVAL_SECS, PONG_TIMEOUT_SECS, REQUEST_TIMEOUT_SECS,
};
use pkg_constants::network::{CLOSE_GOING_AWAY, CLOSE_POLICY_VIOLATION};
use pkg_metrics::{MetricsRegistry, well_known};
use pkg_state::StateStore;
use pkg_types::error::Error;
use pkg_types::protocol::{
    self, ConnectedPayload, DeployPayload, Payload, PingPayload, StopPayload, kinds,
    AuthAck, MAX_FRAME_BYTES,
};

use auth::TokenVerifier;
use registry::SessionRegistry;
use session::{Session, SessionKind, SessionState};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub auth_timeout: Duration,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(AUTH_TIMEOUT_SECS),
            ping_interval: Duration::from_secs(PING_INTERVAL_SECS),
            pong_timeout: Duration::from_secs(PONG_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
        }
    }
}

pub struct Gateway {
    pub store: Arc<StateStore>,
    pub registry: SessionRegistry,
    pub metrics: Arc<MetricsRegistry>,
    verifier: Arc<dyn TokenVerifier>,
    config: GatewayConfig,
    cancel: CancellationToken,
}

impl Gateway {
    pub fn new(
        store: Arc<StateStore>,
        verifier: Arc<dyn TokenVerifier>,
        config: GatewayConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            registry: SessionRegistry::new(),
            metrics,
            verifier,
            config,
            cancel: CancellationToken::new(),
        })
    }

    /// Periodic liveness pings and correlation garbage collection.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let gateway = self.clone();
        tokio::spawn(async move {
            info!(
                interval_secs = gateway.config.ping_interval.as_secs(),
                "gateway liveness loop started"
            );
            let mut ping = tokio::time::interval(gateway.config.ping_interval);
            let mut sweep = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = gateway.cancel.cancelled() => break,
                    _ = ping.tick() => gateway.ping_sessions(),
                    _ = sweep.tick() => gateway.sweep_correlations(),
                }
            }
        })
    }

    /// Close every session (1011) and reject outstanding requests.
    pub fn stop(&self) {
        self.cancel.cancel();
        for session in self.registry.sessions() {
            session.correlations.reject_all(|| Error::Cancelled);
            session.close(CLOSE_GOING_AWAY);
        }
    }

    fn ping_sessions(&self) {
        let now = chrono::Utc::now();
        for session in self.registry.sessions() {
            match session.state() {
                SessionState::Authenticated | SessionState::Registered => {}
                _ => continue,
            }
            if session.is_stale(self.config.pong_timeout) {
                warn!(session = %session.id, "no pong within timeout, closing stale session");
                session.mark_stale();
                continue;
            }
            let ping = Payload::Ping(PingPayload { timestamp: now });
            if session.send(&ping, FrameClass::Critical).is_ok() {
                session.record_ping_sent();
            }
        }
    }

    fn sweep_correlations(&self) {
        let now = std::time::Instant::now();
        let mut pending = 0usize;
        let mut expired = 0usize;
        for session in self.registry.sessions() {
            expired += session.correlations.sweep(now);
            pending += session.correlations.len();
        }
        self.metrics
            .gauge_set(well_known::CORRELATIONS_PENDING, pending as i64);
        if expired > 0 {
            self.metrics
                .counter_add(well_known::CORRELATIONS_TIMED_OUT, expired as u64);
        }
    }

    // ─── Outbound commands ────────────────────────────────────────────────

    /// Ship a deploy command to a node and await its receipt.
    pub async fn deploy_pod(&self, node_id: Uuid, payload: DeployPayload) -> Result<(), Error> {
        let session = self
            .registry
            .node_session(node_id)
            .ok_or_else(|| Error::NotConnected(format!("node {node_id} has no session")))?;
        match session
            .request(Payload::PodDeploy(payload), self.config.request_timeout)
            .await?
        {
            Payload::PodDeployAck(_) => Ok(()),
            other => Err(Error::Validation(format!(
                "unexpected deploy response {}",
                other.kind()
            ))),
        }
    }

    /// Fire a stop command at the node hosting a pod.
    pub fn stop_pod(
        &self,
        node_id: Uuid,
        pod_id: Uuid,
        reason: &str,
        graceful: bool,
    ) -> Result<(), Error> {
        let session = self
            .registry
            .node_session(node_id)
            .ok_or_else(|| Error::NotConnected(format!("node {node_id} has no session")))?;
        session.send(
            &Payload::PodStop(StopPayload {
                pod_id,
                reason: reason.to_string(),
                graceful,
            }),
            FrameClass::Critical,
        )?;
        Ok(())
    }

    pub fn send_to_pod(&self, pod_id: Uuid, payload: &Payload) -> Result<(), Error> {
        let session = self
            .registry
            .pod_session(pod_id)
            .ok_or(Error::TargetUnreachable(pod_id))?;
        session.send(payload, FrameClass::Normal)?;
        Ok(())
    }
}

// ─── Socket lifecycle ──────────────────────────────────────────────────────

/// Axum handler for the `/channel` endpoint.
pub async fn ws_handler(State(gateway): State<Arc<Gateway>>, ws: WebSocketUpgrade) -> Response {
    ws.max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_socket(gateway, socket))
}

async fn handle_socket(gateway: Arc<Gateway>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (queue, mut queue_rx) = send_queue();
    let session = Session::new(queue);
    gateway.registry.insert(session.clone());
    gateway.metrics.gauge_inc(well_known::SESSIONS_OPEN);
    debug!(session = %session.id, "channel session attached");

    // Sole writer for this socket: drains the send queue, emits the close
    // frame when the session is closed from anywhere else.
    let writer_session = session.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = queue_rx.recv() => match frame {
                    Some(text) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = writer_session.closer.cancelled() => {
                    let close = CloseFrame {
                        code: writer_session.close_code(),
                        reason: "".into(),
                    };
                    let _ = sink.send(Message::Close(Some(close))).await;
                    break;
                }
            }
        }
    });

    let hello = Payload::Connected(ConnectedPayload {
        connection_id: session.id,
    });
    let _ = session.send(&hello, FrameClass::Critical);

    let authed = tokio::time::timeout(
        gateway.config.auth_timeout,
        authenticate(&gateway, &session, &mut stream),
    )
    .await;
    match authed {
        Ok(Ok(())) => {
            session.set_state(SessionState::Authenticated);
            read_loop(&gateway, &session, &mut stream).await;
        }
        Ok(Err(e)) => {
            debug!(session = %session.id, error = %e, "authentication failed");
            session.close(CLOSE_POLICY_VIOLATION);
        }
        Err(_) => {
            let err = Error::AuthTimeout;
            let _ = session.send(
                &Payload::Error {
                    of: kinds::AUTHENTICATE.to_string(),
                    body: (&err).into(),
                },
                FrameClass::Critical,
            );
            session.close(CLOSE_POLICY_VIOLATION);
        }
    }

    // Teardown: unbind, reject waiters, account gauges.
    gateway.registry.remove(session.id);
    match session.kind() {
        SessionKind::Node(_) => gateway.metrics.gauge_dec(well_known::SESSIONS_NODE),
        SessionKind::Pod { .. } => gateway.metrics.gauge_dec(well_known::SESSIONS_POD),
        SessionKind::Pending => {}
    }
    gateway.metrics.gauge_dec(well_known::SESSIONS_OPEN);
    session.correlations.reject_all(|| Error::ConnectionClosed);
    session.set_state(SessionState::Closed);
    session.closer.cancel();
    let _ = writer.await;
    debug!(session = %session.id, "channel session detached");
}

/// Wait for a valid `auth:authenticate`. Anything else before it is noise.
async fn authenticate(
    gateway: &Arc<Gateway>,
    session: &Arc<Session>,
    stream: &mut SplitStream<WebSocket>,
) -> Result<(), Error> {
    loop {
        let message = stream.next().await.ok_or(Error::ConnectionClosed)?;
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => return Err(Error::ConnectionClosed),
            Ok(_) => continue,
            Err(_) => return Err(Error::ConnectionClosed),
        };
        let inbound = match protocol::decode(text.as_str()) {
            Ok(inbound) => inbound,
            Err(_) => continue,
        };
        let Payload::Authenticate(payload) = inbound.payload else {
            debug!(session = %session.id, "frame before authentication ignored");
            continue;
        };
        match gateway.verifier.verify(&payload.token) {
            Ok(principal) => {
                debug!(session = %session.id, principal = %principal.name, "authenticated");
                let ack = Payload::AuthAck(AuthAck {
                    connection_id: session.id,
                });
                match inbound.correlation_id.as_deref() {
                    Some(id) => session.send_correlated(&ack, id, FrameClass::Critical)?,
                    None => session.send(&ack, FrameClass::Critical)?,
                };
                return Ok(());
            }
            Err(e) => {
                let frame = Payload::Error {
                    of: kinds::AUTHENTICATE.to_string(),
                    body: (&e).into(),
                };
                match inbound.correlation_id.as_deref() {
                    Some(id) => {
                        let _ = session.send_correlated(&frame, id, FrameClass::Critical);
                    }
                    None => {
                        let _ = session.send(&frame, FrameClass::Critical);
                    }
                }
                return Err(e);
            }
        }
    }
}

async fn read_loop(
    gateway: &Arc<Gateway>,
    session: &Arc<Session>,
    stream: &mut SplitStream<WebSocket>,
) {
    let mut malformed_logged = false;
    loop {
        let message = tokio::select! {
            _ = gateway.cancel.cancelled() => {
                session.close(CLOSE_GOING_AWAY);
                return;
            }
            _ = session.closer.cancelled() => return,
            message = stream.next() => message,
        };
        let text = match message {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => continue,
            Some(Err(_)) => return,
        };

        let inbound = match protocol::decode(text.as_str()) {
            Ok(inbound) => inbound,
            Err(protocol::DecodeError::TooLarge(size, cap)) => {
                warn!(session = %session.id, size, cap, "oversize frame, closing session");
                session.close(CLOSE_POLICY_VIOLATION);
                return;
            }
            Err(protocol::DecodeError::UnknownType(kind)) => {
                gateway.metrics.counter_inc(well_known::FRAMES_UNKNOWN_TYPE);
                debug!(session = %session.id, kind, "ignoring unknown frame type");
                continue;
            }
            Err(protocol::DecodeError::Malformed(reason)) => {
                gateway.metrics.counter_inc_with(
                    well_known::FRAMES_DROPPED,
                    &[("reason", well_known::REASON_MALFORMED)],
                );
                if !malformed_logged {
                    warn!(session = %session.id, reason, "malformed frame dropped");
                    malformed_logged = true;
                }
                continue;
            }
        };

        // Responses to our own requests resolve here; everything else is
        // dispatched in arrival order.
        if let Some(id) = &inbound.correlation_id {
            if session.correlations.resolve(id, inbound.payload.clone()) {
                continue;
            }
        }
        handlers::dispatch(gateway, session, inbound).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use auth::StaticTokenVerifier;
    use pkg_channel::client::Connection;
    use pkg_types::node::{NodeCapacity, RegisterNodeInput, RuntimeKind};
    use pkg_types::pack::{PackMetadata, PackSpec, RuntimeTag};
    use pkg_types::pod::{PodSpec, PodStatus, PodTransition, ResourceRequests};
    use pkg_types::protocol::{
        DeployAck, DeployPack, HeartbeatPayload, NodeRegistered, PodRegisterPayload,
        RouteRequestPayload, SignalPayload,
    };
    use pkg_types::service::{ServiceSpec, Visibility};
    use std::collections::HashMap;
    use std::net::SocketAddr;

    const TOKEN: &str = "test-token";

    async fn start_gateway() -> (Arc<Gateway>, Arc<StateStore>, SocketAddr) {
        start_gateway_with(GatewayConfig::default()).await
    }

    async fn start_gateway_with(
        config: GatewayConfig,
    ) -> (Arc<Gateway>, Arc<StateStore>, SocketAddr) {
        let store = Arc::new(StateStore::in_memory());
        let gateway = Gateway::new(
            store.clone(),
            Arc::new(StaticTokenVerifier::new(TOKEN)),
            config,
            Arc::new(MetricsRegistry::with_well_known()),
        );
        let _liveness = gateway.start();
        let app = axum::Router::new()
            .route("/channel", axum::routing::get(ws_handler))
            .with_state(gateway.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        (gateway, store, addr)
    }

    fn node_input(name: &str) -> RegisterNodeInput {
        RegisterNodeInput {
            name: name.to_string(),
            runtime_kind: RuntimeKind::Node,
            capability_tags: vec![],
            allocatable: NodeCapacity {
                cpu_millis: 4000,
                memory_bytes: 8 << 30,
                pods: 16,
                storage_bytes: 0,
            },
            labels: HashMap::new(),
            taints: vec![],
        }
    }

    fn pack_spec(name: &str) -> PackSpec {
        PackSpec {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            runtime_tag: RuntimeTag::Node,
            owner_id: "test".into(),
            bundle_url: None,
            bundle_bytes: Some(b"exports.main = () => {}".to_vec()),
            metadata: PackMetadata::default(),
        }
    }

    /// Pack + node + one pod driven to running. Returns (pod_id, node_id).
    async fn running_pod(store: &StateStore, pack_name: &str, node_name: &str) -> (Uuid, Uuid) {
        let pack = match store.pack_by_name_version(pack_name, "1.0.0") {
            Some(pack) => pack,
            None => store.register_pack(pack_spec(pack_name)).await.unwrap(),
        };
        let node = match store.node_by_name(node_name) {
            Some(node) => node,
            None => store.add_node(node_input(node_name)).await.unwrap(),
        };
        let pod = store
            .create_pod(PodSpec {
                pack_id: pack.id,
                namespace: "default".into(),
                priority_class: None,
                requests: ResourceRequests {
                    cpu_millis: 100,
                    memory_bytes: 128,
                },
                limits: ResourceRequests::default(),
                labels: HashMap::new(),
                tolerations: vec![],
                node_selector: HashMap::new(),
                env: HashMap::new(),
                created_by: "test".into(),
            })
            .await
            .unwrap();
        store.schedule_pod(pod.id, node.id).await.unwrap();
        store
            .transition_pod(pod.id, PodTransition::Start, None)
            .await
            .unwrap();
        store
            .transition_pod(pod.id, PodTransition::Run, None)
            .await
            .unwrap();
        (pod.id, node.id)
    }

    async fn connect(addr: SocketAddr) -> (Connection, tokio::sync::mpsc::Receiver<protocol::Inbound>) {
        Connection::connect(&format!("ws://{addr}/channel"), TOKEN)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn node_register_and_heartbeat() {
        let (_gateway, store, addr) = start_gateway().await;
        let (conn, _inbound) = connect(addr).await;

        let reply = conn
            .request_default(Payload::NodeRegister(node_input("worker-1")))
            .await
            .unwrap();
        let Payload::NodeRegistered(NodeRegistered { node_id }) = reply else {
            panic!("unexpected reply: {reply:?}");
        };
        let node = store.get_node(node_id).unwrap();
        assert_eq!(node.name, "worker-1");

        let before = node.last_heartbeat;
        tokio::time::sleep(Duration::from_millis(10)).await;
        conn.send(Payload::NodeHeartbeat(HeartbeatPayload {
            node_id,
            status: node.status,
            allocated: Default::default(),
            timestamp: chrono::Utc::now(),
        }))
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.get_node(node_id).unwrap().last_heartbeat > before);
    }

    #[tokio::test]
    async fn duplicate_register_surfaces_conflict() {
        let (_gateway, _store, addr) = start_gateway().await;
        let (conn, _inbound) = connect(addr).await;

        conn.request_default(Payload::NodeRegister(node_input("worker-1")))
            .await
            .unwrap();
        let err = conn
            .request_default(Payload::NodeRegister(node_input("worker-1")))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("NAME_TAKEN"), "{err}");
    }

    #[tokio::test]
    async fn bad_token_is_refused() {
        let (_gateway, _store, addr) = start_gateway().await;
        let err = Connection::connect(&format!("ws://{addr}/channel"), "wrong")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthFailed(_)));
    }

    #[tokio::test]
    async fn reconnect_reuses_node_entity() {
        let (_gateway, store, addr) = start_gateway().await;
        let (conn, _inbound) = connect(addr).await;
        let Payload::NodeRegistered(NodeRegistered { node_id }) = conn
            .request_default(Payload::NodeRegister(node_input("worker-1")))
            .await
            .unwrap()
        else {
            panic!("register failed");
        };
        conn.close();

        let (conn, _inbound) = connect(addr).await;
        let reply = conn
            .request_default(Payload::NodeReconnect(
                protocol::NodeReconnectPayload { node_id },
            ))
            .await
            .unwrap();
        // The ack reuses the request's type and shape.
        assert!(matches!(
            reply,
            Payload::NodeReconnect(protocol::NodeReconnectPayload { node_id: id }) if id == node_id
        ));
        assert_eq!(store.nodes().len(), 1);
    }

    #[tokio::test]
    async fn pod_status_updates_drive_lifecycle() {
        let (_gateway, store, addr) = start_gateway().await;
        let (conn, _inbound) = connect(addr).await;
        let Payload::NodeRegistered(NodeRegistered { node_id }) = conn
            .request_default(Payload::NodeRegister(node_input("worker-1")))
            .await
            .unwrap()
        else {
            panic!("register failed");
        };

        let pack = store.register_pack(pack_spec("p")).await.unwrap();
        let pod = store
            .create_pod(PodSpec {
                pack_id: pack.id,
                namespace: "default".into(),
                priority_class: None,
                requests: ResourceRequests::default(),
                limits: ResourceRequests::default(),
                labels: HashMap::new(),
                tolerations: vec![],
                node_selector: HashMap::new(),
                env: HashMap::new(),
                created_by: "test".into(),
            })
            .await
            .unwrap();
        store.schedule_pod(pod.id, node_id).await.unwrap();

        for status in [PodStatus::Starting, PodStatus::Running] {
            conn.send(Payload::PodStatusUpdate(protocol::PodStatusUpdate {
                pod_id: pod.id,
                status,
                message: None,
                reason: None,
            }))
            .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.get_pod(pod.id).unwrap().status, PodStatus::Running);

        // A crash-stop reported straight from running folds into two edges.
        conn.send(Payload::PodStatusUpdate(protocol::PodStatusUpdate {
            pod_id: pod.id,
            status: PodStatus::Stopped,
            message: Some("exit 0".into()),
            reason: None,
        }))
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let pod = store.get_pod(pod.id).unwrap();
        assert_eq!(pod.status, PodStatus::Stopped);
        assert_eq!(pod.status_message.as_deref(), Some("exit 0"));
    }

    #[tokio::test]
    async fn deploy_round_trips_through_the_node_session() {
        let (gateway, store, addr) = start_gateway().await;
        let (conn, mut inbound) = connect(addr).await;
        let Payload::NodeRegistered(NodeRegistered { node_id }) = conn
            .request_default(Payload::NodeRegister(node_input("worker-1")))
            .await
            .unwrap()
        else {
            panic!("register failed");
        };

        // Agent side: ack the deploy command when it arrives.
        let agent_conn = Arc::new(conn);
        let acker = agent_conn.clone();
        tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                if let Payload::PodDeploy(deploy) = frame.payload {
                    if let Some(id) = frame.correlation_id.as_deref() {
                        let ack = Payload::PodDeployAck(DeployAck {
                            pod_id: deploy.pod_id,
                        });
                        acker.reply(ack, id).unwrap();
                    }
                }
            }
        });

        let pack = store.register_pack(pack_spec("p")).await.unwrap();
        let payload = DeployPayload {
            pod_id: Uuid::new_v4(),
            pack: DeployPack::with_bytes(
                pack.id,
                pack.version.clone(),
                b"exports.main = () => {}",
                PackMetadata::default(),
            ),
            env: HashMap::new(),
            timeout_secs: None,
        };
        gateway.deploy_pod(node_id, payload).await.unwrap();

        // Unknown node has no session.
        let err = gateway
            .deploy_pod(
                Uuid::new_v4(),
                DeployPayload {
                    pod_id: Uuid::new_v4(),
                    pack: DeployPack::with_bytes(
                        pack.id,
                        pack.version,
                        b"",
                        PackMetadata::default(),
                    ),
                    env: HashMap::new(),
                    timeout_secs: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected(_)));
    }

    #[tokio::test]
    async fn signal_routing_and_spoof_rejection() {
        let (_gateway, store, addr) = start_gateway().await;
        let (pod_a, _) = running_pod(&store, "pack-a", "n1").await;
        let (pod_b, _) = running_pod(&store, "pack-b", "n2").await;
        let (pod_x, _) = running_pod(&store, "pack-x", "n3").await;
        let service_id = Uuid::new_v4();

        let (conn_a, _inbound_a) = connect(addr).await;
        let (conn_b, mut inbound_b) = connect(addr).await;
        let (conn_x, mut inbound_x) = connect(addr).await;
        for (conn, pod_id) in [(&conn_a, pod_a), (&conn_b, pod_b), (&conn_x, pod_x)] {
            let reply = conn
                .request_default(Payload::PodRegister(PodRegisterPayload { pod_id, service_id }))
                .await
                .unwrap();
            // The ack shares the request's type and shape.
            assert!(matches!(reply, Payload::PodRegister(_)));
        }

        // A → B arrives exactly once with the true source.
        conn_a
            .send(Payload::Signal(SignalPayload {
                source_pod_id: pod_a,
                target_pod_id: pod_b,
                signal_type: "offer".into(),
                signal_data: serde_json::json!({"sdp": "v=0"}),
            }))
            .unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(2), inbound_b.recv())
            .await
            .unwrap()
            .unwrap();
        let Payload::Signal(signal) = frame.payload else {
            panic!("expected signal, got {frame:?}");
        };
        assert_eq!(signal.source_pod_id, pod_a);
        assert_eq!(signal.signal_type, "offer");

        // X claiming to be A is dropped and told so; B sees nothing.
        conn_x
            .send(Payload::Signal(SignalPayload {
                source_pod_id: pod_a,
                target_pod_id: pod_b,
                signal_type: "offer".into(),
                signal_data: serde_json::json!({}),
            }))
            .unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(2), inbound_x.recv())
            .await
            .unwrap()
            .unwrap();
        match frame.payload {
            Payload::Error { of, body } => {
                assert_eq!(of, "network:signal");
                assert_eq!(body.code, "SOURCE_SPOOFED");
            }
            other => panic!("expected spoof error, got {other:?}"),
        }
        assert!(
            tokio::time::timeout(Duration::from_millis(200), inbound_b.recv())
                .await
                .is_err(),
            "spoofed frame must not reach the target"
        );

        // Unreachable target bounces, unbuffered.
        conn_a
            .send(Payload::Signal(SignalPayload {
                source_pod_id: pod_a,
                target_pod_id: Uuid::new_v4(),
                signal_type: "offer".into(),
                signal_data: serde_json::json!({}),
            }))
            .unwrap();
        let mut inbound_a = _inbound_a;
        let frame = tokio::time::timeout(Duration::from_secs(2), inbound_a.recv())
            .await
            .unwrap()
            .unwrap();
        match frame.payload {
            Payload::Error { body, .. } => assert_eq!(body.code, "TARGET_UNREACHABLE"),
            other => panic!("expected unreachable error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn silent_clients_are_disconnected_at_the_auth_deadline() {
        let (_gateway, _store, addr) = start_gateway_with(GatewayConfig {
            auth_timeout: Duration::from_millis(100),
            ..GatewayConfig::default()
        })
        .await;

        // A raw socket that never authenticates.
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/channel"))
            .await
            .unwrap();
        let (_sink, mut stream) = ws.split();

        // First the connected frame, then a policy-violation close.
        let mut saw_close = false;
        while let Ok(Some(message)) =
            tokio::time::timeout(Duration::from_secs(2), stream.next()).await
        {
            match message {
                Ok(tokio_tungstenite::tungstenite::Message::Close(frame)) => {
                    let frame = frame.expect("close frame should carry a code");
                    assert_eq!(u16::from(frame.code), CLOSE_POLICY_VIOLATION);
                    saw_close = true;
                    break;
                }
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        assert!(saw_close, "session must be closed at the auth deadline");
    }

    #[tokio::test]
    async fn sessions_that_stop_ponging_go_stale() {
        let (_gateway, _store, addr) = start_gateway_with(GatewayConfig {
            ping_interval: Duration::from_millis(50),
            pong_timeout: Duration::from_millis(20),
            ..GatewayConfig::default()
        })
        .await;

        // Authenticate by hand, then ignore every ping.
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/channel"))
            .await
            .unwrap();
        let (mut sink, mut stream) = ws.split();
        let auth = protocol::encode(
            &Payload::Authenticate(protocol::AuthenticatePayload {
                token: TOKEN.into(),
            }),
            Some("auth-1"),
        )
        .unwrap();
        sink.send(tokio_tungstenite::tungstenite::Message::Text(auth.into()))
            .await
            .unwrap();

        let mut saw_close = false;
        while let Ok(Some(message)) =
            tokio::time::timeout(Duration::from_secs(3), stream.next()).await
        {
            match message {
                Ok(tokio_tungstenite::tungstenite::Message::Close(frame)) => {
                    let frame = frame.expect("close frame should carry a code");
                    assert_eq!(u16::from(frame.code), CLOSE_GOING_AWAY);
                    saw_close = true;
                    break;
                }
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        assert!(saw_close, "an unresponsive session must be closed as stale");
    }

    #[tokio::test]
    async fn route_lookup_round_robins_over_healthy_pods() {
        let (_gateway, store, addr) = start_gateway().await;
        let (pod_1, node_1) = running_pod(&store, "web", "n1").await;
        let (pod_2, node_2) = running_pod(&store, "web", "n2").await;
        let (client_pod, _) = running_pod(&store, "client", "n3").await;

        let pack = store.pack_by_name_version("web", "1.0.0").unwrap();
        let service = store
            .create_service(ServiceSpec {
                name: "web".into(),
                namespace: "default".into(),
                pack_id: pack.id,
                replicas: 2,
                template: Default::default(),
                visibility: Visibility::Public,
                exposed: true,
                allowed_sources: vec![],
                max_surge: 1,
                max_unavailable: 0,
            })
            .await
            .unwrap();

        let (conn_1, _i1) = connect(addr).await;
        let (conn_2, _i2) = connect(addr).await;
        let (conn_c, _ic) = connect(addr).await;
        for (conn, pod_id, service_id) in [
            (&conn_1, pod_1, service.id),
            (&conn_2, pod_2, service.id),
            (&conn_c, client_pod, Uuid::new_v4()),
        ] {
            conn.request_default(Payload::PodRegister(PodRegisterPayload { pod_id, service_id }))
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..4 {
            let reply = conn_c
                .request_default(Payload::RouteRequest(RouteRequestPayload {
                    target_service_id: service.id,
                }))
                .await
                .unwrap();
            let Payload::RouteResponse(route) = reply else {
                panic!("expected route response: {reply:?}");
            };
            assert!([node_1, node_2].contains(&route.node_id));
            seen.push(route.pod_id);
        }
        assert_eq!(seen[0], seen[2]);
        assert_eq!(seen[1], seen[3]);
        assert_ne!(seen[0], seen[1], "round robin must alternate");
    }
}
