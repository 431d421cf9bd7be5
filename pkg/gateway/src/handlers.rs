//! Typed dispatch for inbound frames on an authenticated session.
//!
//! Dispatch runs inline in the session's reader task, which is what gives
//! the per-session ordering guarantee. Correlated responses to our own
//! outbound requests are resolved before frames ever reach this module.

use std::sync::Arc;
use tracing::{debug, info, warn};

use pkg_channel::sendq::FrameClass;
use pkg_metrics::well_known;
use pkg_types::error::Error;
use pkg_types::pod::{PodStatus, PodTransition};
use pkg_types::protocol::{
    AuthAck, HeartbeatPayload, Inbound, NodeReconnectPayload, NodeRegistered, Payload,
    PingPayload, PodRegisterPayload, PodStatusUpdate, kinds,
};
use pkg_types::node::RegisterNodeInput;

use crate::Gateway;
use crate::session::{Session, SessionKind, SessionState};
use crate::signal;

pub async fn dispatch(gateway: &Arc<Gateway>, session: &Arc<Session>, inbound: Inbound) {
    let correlation_id = inbound.correlation_id.as_deref();
    match inbound.payload {
        Payload::Ping(ping) => {
            let pong = Payload::Pong(PingPayload {
                timestamp: ping.timestamp,
            });
            let _ = session.send(&pong, FrameClass::Critical);
        }
        Payload::Pong(_) => session.record_pong(),
        Payload::Authenticate(_) => {
            // Already authenticated; answer idempotently.
            let ack = Payload::AuthAck(AuthAck {
                connection_id: session.id,
            });
            reply(session, ack, correlation_id, FrameClass::Critical);
        }
        Payload::NodeRegister(input) => {
            on_node_register(gateway, session, input, correlation_id).await;
        }
        Payload::NodeReconnect(payload) => {
            on_node_reconnect(gateway, session, payload, correlation_id).await;
        }
        Payload::NodeHeartbeat(hb) => on_heartbeat(gateway, session, hb, correlation_id).await,
        Payload::PodStatusUpdate(update) => on_pod_status(gateway, update).await,
        Payload::PodRegister(payload) => {
            on_pod_register(gateway, session, payload, correlation_id).await;
        }
        Payload::Signal(payload) => signal::handle_signal(gateway, session, payload, correlation_id),
        Payload::RouteRequest(payload) => {
            signal::handle_route(gateway, session, payload, correlation_id);
        }
        Payload::Error { of, body } => {
            debug!(session = %session.id, of, code = %body.code, "uncorrelated error frame");
        }
        other => {
            debug!(session = %session.id, kind = %other.kind(), "frame not expected from a client");
        }
    }
}

async fn on_node_register(
    gateway: &Arc<Gateway>,
    session: &Arc<Session>,
    input: RegisterNodeInput,
    correlation_id: Option<&str>,
) {
    match gateway.store.add_node(input).await {
        Ok(node) => {
            bind_node(gateway, session, node.id);
            reply(
                session,
                Payload::NodeRegistered(NodeRegistered { node_id: node.id }),
                correlation_id,
                FrameClass::Critical,
            );
        }
        Err(e) => {
            warn!(session = %session.id, error = %e, "node registration rejected");
            reply_error(session, kinds::NODE_REGISTER, &e, correlation_id);
        }
    }
}

async fn on_node_reconnect(
    gateway: &Arc<Gateway>,
    session: &Arc<Session>,
    payload: NodeReconnectPayload,
    correlation_id: Option<&str>,
) {
    match gateway.store.reconnect_node(payload.node_id).await {
        Ok(node) => {
            bind_node(gateway, session, node.id);
            info!(node = %node.name, "node reconnected");
            reply(
                session,
                Payload::NodeReconnected(NodeRegistered { node_id: node.id }),
                correlation_id,
                FrameClass::Critical,
            );
        }
        Err(e) => {
            warn!(session = %session.id, error = %e, "node reconnect rejected");
            reply_error(session, kinds::NODE_RECONNECT, &e, correlation_id);
        }
    }
}

fn bind_node(gateway: &Arc<Gateway>, session: &Arc<Session>, node_id: uuid::Uuid) {
    session.set_kind(SessionKind::Node(node_id));
    session.set_state(SessionState::Registered);
    gateway.metrics.gauge_inc(well_known::SESSIONS_NODE);
    if let Some(displaced) = gateway.registry.bind_node(node_id, session.id) {
        debug!(node = %node_id, old_session = %displaced.id, "closing displaced node session");
        displaced.close(pkg_constants::network::CLOSE_NORMAL);
    }
}

async fn on_heartbeat(
    gateway: &Arc<Gateway>,
    session: &Arc<Session>,
    hb: HeartbeatPayload,
    correlation_id: Option<&str>,
) {
    if session.node_id() != Some(hb.node_id) {
        warn!(
            session = %session.id,
            claimed = %hb.node_id,
            "heartbeat for a node this session did not register"
        );
        return;
    }
    if let Err(e) = gateway
        .store
        .process_heartbeat(hb.node_id, hb.allocated, hb.timestamp)
        .await
    {
        reply_error(session, kinds::NODE_HEARTBEAT, &e, correlation_id);
    }
}

/// Fold a node-reported pod status into the lifecycle state machine. A node
/// may report a crash-stop straight from `running`; that is two edges.
async fn on_pod_status(gateway: &Arc<Gateway>, update: PodStatusUpdate) {
    let Some(pod) = gateway.store.get_pod(update.pod_id) else {
        warn!(pod = %update.pod_id, "status update for unknown pod");
        return;
    };
    let steps: Vec<PodTransition> = match update.status {
        PodStatus::Starting => vec![PodTransition::Start],
        PodStatus::Running => vec![PodTransition::Run],
        PodStatus::Stopping => vec![PodTransition::Stop],
        PodStatus::Failed => vec![PodTransition::Fail],
        PodStatus::Stopped if pod.status == PodStatus::Stopping => vec![PodTransition::Stopped],
        PodStatus::Stopped => vec![PodTransition::Stop, PodTransition::Stopped],
        PodStatus::Pending | PodStatus::Scheduled | PodStatus::Evicted => {
            warn!(pod = %update.pod_id, status = %update.status, "node reported a control-plane-owned status");
            return;
        }
    };
    let message = update.message.or(update.reason);
    for step in steps {
        if let Err(e) = gateway
            .store
            .transition_pod(update.pod_id, step, message.as_deref())
            .await
        {
            debug!(pod = %update.pod_id, error = %e, "pod status update not applied");
            return;
        }
    }
}

async fn on_pod_register(
    gateway: &Arc<Gateway>,
    session: &Arc<Session>,
    payload: PodRegisterPayload,
    correlation_id: Option<&str>,
) {
    let Some(pod) = gateway.store.get_pod(payload.pod_id) else {
        reply_error(
            session,
            kinds::POD_REGISTER,
            &Error::PodNotFound(payload.pod_id),
            correlation_id,
        );
        return;
    };
    if pod.status.is_terminal() || pod.status == PodStatus::Pending {
        reply_error(
            session,
            kinds::POD_REGISTER,
            &Error::InvalidState(format!("pod {} is {}", pod.id, pod.status)),
            correlation_id,
        );
        return;
    }

    session.set_kind(SessionKind::Pod {
        pod_id: payload.pod_id,
        service_id: payload.service_id,
    });
    session.set_state(SessionState::Registered);
    gateway.metrics.gauge_inc(well_known::SESSIONS_POD);
    if let Some(displaced) = gateway.registry.bind_pod(payload.pod_id, session.id) {
        displaced.close(pkg_constants::network::CLOSE_NORMAL);
    }
    reply(
        session,
        Payload::PodRegistered(payload),
        correlation_id,
        FrameClass::Critical,
    );
}

fn reply(
    session: &Arc<Session>,
    payload: Payload,
    correlation_id: Option<&str>,
    class: FrameClass,
) {
    let outcome = match correlation_id {
        Some(id) => session.send_correlated(&payload, id, class),
        None => session.send(&payload, class),
    };
    if let Err(e) = outcome {
        debug!(session = %session.id, error = %e, "reply not delivered");
    }
}

fn reply_error(session: &Arc<Session>, of: &str, error: &Error, correlation_id: Option<&str>) {
    reply(
        session,
        Payload::Error {
            of: of.to_string(),
            body: error.into(),
        },
        correlation_id,
        FrameClass::Critical,
    );
}
