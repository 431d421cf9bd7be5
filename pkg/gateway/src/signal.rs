//! Peer signaling router.
//!
//! Relays offer/answer/candidate envelopes between registered pod sessions
//! without touching the payload. Source identity is checked against the
//! sending session's registration; route lookups load-balance round-robin
//! over the healthy pods of a service, honoring visibility.

use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use pkg_channel::sendq::{Enqueued, FrameClass};
use pkg_metrics::well_known;
use pkg_types::error::Error;
use pkg_types::pod::PodStatus;
use pkg_types::protocol::{
    RouteRequestPayload, RouteResponsePayload, SignalPayload, kinds, Payload,
};
use pkg_types::service::Visibility;

use crate::Gateway;
use crate::session::{Session, SessionKind};

/// Forward one signal frame, exactly once, in sender order (per-session
/// dispatch is serial). Never buffered: an unreachable target is an error
/// straight back to the sender.
pub fn handle_signal(
    gateway: &Gateway,
    session: &Arc<Session>,
    payload: SignalPayload,
    correlation_id: Option<&str>,
) {
    let registered = match session.kind() {
        SessionKind::Pod { pod_id, .. } => pod_id,
        _ => {
            warn!(session = %session.id, "signal from a non-pod session dropped");
            reply_error(
                session,
                kinds::SIGNAL,
                &Error::InvalidState("session is not a registered pod".into()),
                correlation_id,
            );
            return;
        }
    };

    if payload.source_pod_id != registered {
        gateway.metrics.counter_inc_with(
            well_known::SIGNALS,
            &[("outcome", well_known::OUTCOME_SPOOFED)],
        );
        warn!(
            session = %session.id,
            claimed = %payload.source_pod_id,
            %registered,
            "signal source mismatch dropped"
        );
        reply_error(
            session,
            kinds::SIGNAL,
            &Error::SourceSpoofed {
                claimed: payload.source_pod_id,
                registered,
            },
            correlation_id,
        );
        return;
    }

    let Some(target) = gateway.registry.pod_session(payload.target_pod_id) else {
        gateway.metrics.counter_inc_with(
            well_known::SIGNALS,
            &[("outcome", well_known::OUTCOME_UNREACHABLE)],
        );
        reply_error(
            session,
            kinds::SIGNAL,
            &Error::TargetUnreachable(payload.target_pod_id),
            correlation_id,
        );
        return;
    };

    let target_pod_id = payload.target_pod_id;
    match target.send(&Payload::Signal(payload), FrameClass::Normal) {
        Ok(Enqueued::Queued) => gateway.metrics.counter_inc_with(
            well_known::SIGNALS,
            &[("outcome", well_known::OUTCOME_FORWARDED)],
        ),
        // Non-critical frames are shed on a congested target; the sender is
        // not told, per the backpressure contract.
        Ok(Enqueued::DroppedCongested) => {
            gateway.metrics.counter_inc_with(
                well_known::FRAMES_DROPPED,
                &[("reason", well_known::REASON_CONGESTED)],
            );
            debug!(target = %target_pod_id, "signal shed on congested session");
        }
        Err(e) => {
            debug!(error = %e, "signal delivery failed");
            reply_error(
                session,
                kinds::SIGNAL,
                &Error::TargetUnreachable(target_pod_id),
                correlation_id,
            );
        }
    }
}

/// Resolve a service to one of its healthy, connected pods.
pub fn handle_route(
    gateway: &Gateway,
    session: &Arc<Session>,
    payload: RouteRequestPayload,
    correlation_id: Option<&str>,
) {
    let Some(correlation_id) = correlation_id else {
        debug!(session = %session.id, "route request without correlation id dropped");
        return;
    };

    let SessionKind::Pod {
        pod_id: _,
        service_id: source_service,
    } = session.kind()
    else {
        reply_error(
            session,
            kinds::ROUTE_REQUEST,
            &Error::InvalidState("session is not a registered pod".into()),
            Some(correlation_id),
        );
        return;
    };

    match resolve_route(gateway, source_service, payload.target_service_id) {
        Ok((pod_id, node_id)) => {
            let response = Payload::RouteResponse(RouteResponsePayload { pod_id, node_id });
            let _ = session.send_correlated(&response, correlation_id, FrameClass::Normal);
        }
        Err(e) => reply_error(session, kinds::ROUTE_REQUEST, &e, Some(correlation_id)),
    }
}

fn resolve_route(
    gateway: &Gateway,
    source_service: Uuid,
    target_service: Uuid,
) -> Result<(Uuid, Uuid), Error> {
    let service = gateway
        .store
        .get_service(target_service)
        .ok_or_else(|| Error::InvalidState(format!("service {target_service} not found")))?;

    let allowed = match service.visibility {
        Visibility::Public => true,
        Visibility::Private => {
            source_service == service.id || service.allowed_sources.contains(&source_service)
        }
        Visibility::System => gateway
            .store
            .get_service(source_service)
            .is_some_and(|s| s.namespace.starts_with("system")),
    };
    if !allowed {
        return Err(Error::InvalidState(format!(
            "service {} is not visible to the requesting service",
            service.name
        )));
    }

    let pack = gateway
        .store
        .get_pack(service.pack_id)
        .ok_or_else(|| Error::PackNotFound(service.pack_id.to_string()))?;

    // Healthy = running with an open, registered session.
    let mut candidates: Vec<(Uuid, Uuid)> = gateway
        .store
        .live_pods_of_pack(&pack.name)
        .into_iter()
        .filter(|p| p.status == PodStatus::Running)
        .filter(|p| gateway.registry.pod_session(p.id).is_some())
        .filter_map(|p| p.node_id.map(|n| (p.id, n)))
        .collect();
    candidates.sort_by_key(|(pod_id, _)| *pod_id);

    if candidates.is_empty() {
        return Err(Error::NoCompatibleNodes(format!(
            "service {} has no reachable pods",
            service.name
        )));
    }
    let index = gateway
        .registry
        .next_route_index(service.id, candidates.len());
    Ok(candidates[index])
}

fn reply_error(
    session: &Arc<Session>,
    of: &str,
    error: &Error,
    correlation_id: Option<&str>,
) {
    let payload = Payload::Error {
        of: of.to_string(),
        body: error.into(),
    };
    let outcome = match correlation_id {
        Some(id) => session.send_correlated(&payload, id, FrameClass::Normal),
        None => session.send(&payload, FrameClass::Normal),
    };
    if let Err(e) = outcome {
        debug!(error = %e, "error reply not delivered");
    }
}
