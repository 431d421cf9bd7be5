//! Wire protocol of the bidirectional message channel.
//!
//! Every frame is a UTF-8 JSON object `{type, payload, correlationId?}`.
//! Each reserved `type` decodes into a strict [`Payload`] variant; a frame
//! whose `type` ends in `:error` carries an [`ErrorBody`] and resolves the
//! correlation it answers. Unknown types are reported as
//! [`DecodeError::UnknownType`] so sessions can ignore them without
//! tearing down.

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::ErrorBody;
use crate::node::{NodeAllocated, NodeStatus, RegisterNodeInput};
use crate::pack::PackMetadata;
use crate::pod::PodStatus;

/// Reserved frame type strings.
pub mod kinds {
    pub const CONNECTED: &str = "connected";
    pub const AUTHENTICATE: &str = "auth:authenticate";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const NODE_REGISTER: &str = "node:register";
    pub const NODE_RECONNECT: &str = "node:reconnect";
    pub const NODE_HEARTBEAT: &str = "node:heartbeat";
    pub const POD_DEPLOY: &str = "pod:deploy";
    pub const POD_STOP: &str = "pod:stop";
    pub const POD_STATUS_UPDATE: &str = "pod:status:update";
    pub const POD_REGISTER: &str = "network:pod:register";
    pub const SIGNAL: &str = "network:signal";
    pub const ROUTE_REQUEST: &str = "network:route:request";
    pub const ROUTE_RESPONSE: &str = "network:route:response";

    pub const ERROR_SUFFIX: &str = ":error";
}

// --- Raw frame ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "correlationId", default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

// --- Typed payloads ---

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedPayload {
    pub connection_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticatePayload {
    pub token: String,
}

/// Success response to `auth:authenticate` (same frame type back).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthAck {
    pub connection_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingPayload {
    pub timestamp: DateTime<Utc>,
}

/// Success response to `node:register` / `node:reconnect`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRegistered {
    pub node_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeReconnectPayload {
    pub node_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub node_id: Uuid,
    pub status: NodeStatus,
    /// The node's own view of its allocation. Informational; the store's
    /// accounting stays authoritative.
    #[serde(default)]
    pub allocated: NodeAllocated,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployPack {
    pub id: Uuid,
    pub version: String,
    /// Base64-encoded bundle bytes, when shipped inline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_bytes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_path: Option<String>,
    #[serde(default)]
    pub metadata: PackMetadata,
}

impl DeployPack {
    pub fn with_bytes(id: Uuid, version: String, bytes: &[u8], metadata: PackMetadata) -> Self {
        DeployPack {
            id,
            version,
            bundle_bytes: Some(base64::engine::general_purpose::STANDARD.encode(bytes)),
            bundle_path: None,
            metadata,
        }
    }

    pub fn decode_bytes(&self) -> Result<Option<Vec<u8>>, base64::DecodeError> {
        self.bundle_bytes
            .as_deref()
            .map(|b| base64::engine::general_purpose::STANDARD.decode(b))
            .transpose()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployPayload {
    pub pod_id: Uuid,
    pub pack: DeployPack,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Node's receipt for a `pod:deploy` command (same frame type back).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployAck {
    pub pod_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopPayload {
    pub pod_id: Uuid,
    pub reason: String,
    #[serde(default)]
    pub graceful: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatusUpdate {
    pub pod_id: Uuid,
    pub status: PodStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodRegisterPayload {
    pub pod_id: Uuid,
    pub service_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalPayload {
    pub source_pod_id: Uuid,
    pub target_pod_id: Uuid,
    /// Offer, answer, or candidate — opaque to the control plane.
    pub signal_type: String,
    pub signal_data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRequestPayload {
    pub target_service_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteResponsePayload {
    pub pod_id: Uuid,
    pub node_id: Uuid,
}

// --- The tagged union ---

#[derive(Debug, Clone)]
pub enum Payload {
    Connected(ConnectedPayload),
    Authenticate(AuthenticatePayload),
    AuthAck(AuthAck),
    Ping(PingPayload),
    Pong(PingPayload),
    NodeRegister(RegisterNodeInput),
    NodeRegistered(NodeRegistered),
    NodeReconnect(NodeReconnectPayload),
    /// Ack for `node:reconnect` (same frame type back; the payload shape is
    /// identical to the request, so inbound decoding yields `NodeReconnect`).
    NodeReconnected(NodeRegistered),
    NodeHeartbeat(HeartbeatPayload),
    PodDeploy(DeployPayload),
    PodDeployAck(DeployAck),
    PodStop(StopPayload),
    PodStatusUpdate(PodStatusUpdate),
    PodRegister(PodRegisterPayload),
    PodRegistered(PodRegisterPayload),
    Signal(SignalPayload),
    RouteRequest(RouteRequestPayload),
    RouteResponse(RouteResponsePayload),
    /// Any `<base>:error` frame; `of` is the base type it answers.
    Error { of: String, body: ErrorBody },
}

impl Payload {
    /// The wire `type` string this payload serializes under. Register/
    /// reconnect acks reuse the request's type, which is how correlation
    /// matching pairs them.
    pub fn kind(&self) -> String {
        match self {
            Payload::Connected(_) => kinds::CONNECTED.to_string(),
            Payload::Authenticate(_) | Payload::AuthAck(_) => kinds::AUTHENTICATE.to_string(),
            Payload::Ping(_) => kinds::PING.to_string(),
            Payload::Pong(_) => kinds::PONG.to_string(),
            Payload::NodeRegister(_) | Payload::NodeRegistered(_) => {
                kinds::NODE_REGISTER.to_string()
            }
            Payload::NodeReconnect(_) | Payload::NodeReconnected(_) => {
                kinds::NODE_RECONNECT.to_string()
            }
            Payload::NodeHeartbeat(_) => kinds::NODE_HEARTBEAT.to_string(),
            Payload::PodDeploy(_) | Payload::PodDeployAck(_) => kinds::POD_DEPLOY.to_string(),
            Payload::PodStop(_) => kinds::POD_STOP.to_string(),
            Payload::PodStatusUpdate(_) => kinds::POD_STATUS_UPDATE.to_string(),
            Payload::PodRegister(_) | Payload::PodRegistered(_) => kinds::POD_REGISTER.to_string(),
            Payload::Signal(_) => kinds::SIGNAL.to_string(),
            Payload::RouteRequest(_) => kinds::ROUTE_REQUEST.to_string(),
            Payload::RouteResponse(_) => kinds::ROUTE_RESPONSE.to_string(),
            Payload::Error { of, .. } => format!("{of}{}", kinds::ERROR_SUFFIX),
        }
    }

    fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            Payload::Connected(p) => serde_json::to_value(p),
            Payload::Authenticate(p) => serde_json::to_value(p),
            Payload::AuthAck(p) => serde_json::to_value(p),
            Payload::Ping(p) | Payload::Pong(p) => serde_json::to_value(p),
            Payload::NodeRegister(p) => serde_json::to_value(p),
            Payload::NodeRegistered(p) => serde_json::to_value(p),
            Payload::NodeReconnect(p) => serde_json::to_value(p),
            Payload::NodeReconnected(p) => serde_json::to_value(p),
            Payload::NodeHeartbeat(p) => serde_json::to_value(p),
            Payload::PodDeploy(p) => serde_json::to_value(p),
            Payload::PodDeployAck(p) => serde_json::to_value(p),
            Payload::PodStop(p) => serde_json::to_value(p),
            Payload::PodStatusUpdate(p) => serde_json::to_value(p),
            Payload::PodRegister(p) | Payload::PodRegistered(p) => serde_json::to_value(p),
            Payload::Signal(p) => serde_json::to_value(p),
            Payload::RouteRequest(p) => serde_json::to_value(p),
            Payload::RouteResponse(p) => serde_json::to_value(p),
            Payload::Error { body, .. } => serde_json::to_value(body),
        }
    }
}

// --- Decode / encode ---

#[derive(Debug, Clone, thiserror::Error)]
pub enum DecodeError {
    #[error("frame of {0} bytes exceeds the {1} byte limit")]
    TooLarge(usize, usize),
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// Not fatal: the session logs and ignores the frame.
    #[error("unknown frame type '{0}'")]
    UnknownType(String),
}

/// A decoded inbound frame.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub payload: Payload,
    pub correlation_id: Option<String>,
}

/// Hard cap on a single wire frame (10 MiB).
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

pub fn decode(text: &str) -> Result<Inbound, DecodeError> {
    if text.len() > MAX_FRAME_BYTES {
        return Err(DecodeError::TooLarge(text.len(), MAX_FRAME_BYTES));
    }
    let frame: Frame =
        serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let payload = decode_payload(&frame.kind, frame.payload)?;
    Ok(Inbound {
        payload,
        correlation_id: frame.correlation_id,
    })
}

fn decode_payload(kind: &str, payload: Value) -> Result<Payload, DecodeError> {
    if let Some(base) = kind.strip_suffix(kinds::ERROR_SUFFIX) {
        let body: ErrorBody =
            serde_json::from_value(payload).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        return Ok(Payload::Error {
            of: base.to_string(),
            body,
        });
    }
    let malformed = |e: serde_json::Error| DecodeError::Malformed(e.to_string());
    let decoded = match kind {
        kinds::CONNECTED => Payload::Connected(serde_json::from_value(payload).map_err(malformed)?),
        // `auth:authenticate` is a request when it carries a token and an
        // ack otherwise; both directions share the type string.
        kinds::AUTHENTICATE => match serde_json::from_value::<AuthenticatePayload>(payload.clone())
        {
            Ok(p) => Payload::Authenticate(p),
            Err(_) => Payload::AuthAck(serde_json::from_value(payload).map_err(malformed)?),
        },
        kinds::PING => Payload::Ping(serde_json::from_value(payload).map_err(malformed)?),
        kinds::PONG => Payload::Pong(serde_json::from_value(payload).map_err(malformed)?),
        kinds::NODE_REGISTER => {
            match serde_json::from_value::<NodeRegistered>(payload.clone()) {
                Ok(p) => Payload::NodeRegistered(p),
                Err(_) => Payload::NodeRegister(serde_json::from_value(payload).map_err(malformed)?),
            }
        }
        kinds::NODE_RECONNECT => {
            Payload::NodeReconnect(serde_json::from_value(payload).map_err(malformed)?)
        }
        kinds::NODE_HEARTBEAT => {
            Payload::NodeHeartbeat(serde_json::from_value(payload).map_err(malformed)?)
        }
        // A deploy command carries the pack; the node's receipt carries only
        // the pod id under the same type.
        kinds::POD_DEPLOY => match serde_json::from_value::<DeployPayload>(payload.clone()) {
            Ok(p) => Payload::PodDeploy(p),
            Err(_) => Payload::PodDeployAck(serde_json::from_value(payload).map_err(malformed)?),
        },
        kinds::POD_STOP => Payload::PodStop(serde_json::from_value(payload).map_err(malformed)?),
        kinds::POD_STATUS_UPDATE => {
            Payload::PodStatusUpdate(serde_json::from_value(payload).map_err(malformed)?)
        }
        kinds::POD_REGISTER => {
            Payload::PodRegister(serde_json::from_value(payload).map_err(malformed)?)
        }
        kinds::SIGNAL => Payload::Signal(serde_json::from_value(payload).map_err(malformed)?),
        kinds::ROUTE_REQUEST => {
            Payload::RouteRequest(serde_json::from_value(payload).map_err(malformed)?)
        }
        kinds::ROUTE_RESPONSE => {
            Payload::RouteResponse(serde_json::from_value(payload).map_err(malformed)?)
        }
        other => return Err(DecodeError::UnknownType(other.to_string())),
    };
    Ok(decoded)
}

pub fn encode(payload: &Payload, correlation_id: Option<&str>) -> Result<String, DecodeError> {
    let frame = Frame {
        kind: payload.kind(),
        payload: payload
            .to_value()
            .map_err(|e| DecodeError::Malformed(e.to_string()))?,
        correlation_id: correlation_id.map(str::to_string),
    };
    let text =
        serde_json::to_string(&frame).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    if text.len() > MAX_FRAME_BYTES {
        return Err(DecodeError::TooLarge(text.len(), MAX_FRAME_BYTES));
    }
    Ok(text)
}
