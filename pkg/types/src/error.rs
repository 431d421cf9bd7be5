use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pod::PodStatus;

/// Unified error taxonomy. Every variant maps to a stable wire code via
/// [`Error::code`]; see [`ErrorBody`] for the serialized form.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    // Validation — surfaced, never retried.
    #[error("{0}")]
    Validation(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("invalid transition: {from} does not accept '{transition}'")]
    InvalidStatusTransition { from: PodStatus, transition: String },

    // Not found — surfaced, never retried.
    #[error("pod {0} not found")]
    PodNotFound(Uuid),
    #[error("pack not found: {0}")]
    PackNotFound(String),
    #[error("node not found: {0}")]
    NodeNotFound(String),
    #[error("namespace missing: {0}")]
    NamespaceMissing(String),
    #[error("no version {version} of pack {name}")]
    VersionNotFound { name: String, version: String },

    // Conflict — surfaced, caller decides.
    #[error("name taken: {0}")]
    NameTaken(String),
    #[error("pack {name}@{version} already registered")]
    VersionExists { name: String, version: String },
    #[error("pod already at version {0}")]
    SameVersion(String),

    // Capacity — retried with backoff by the reconciler.
    #[error("no compatible nodes: {0}")]
    NoCompatibleNodes(String),
    #[error("insufficient resources on node {0}")]
    InsufficientResources(String),
    #[error("quota exceeded in namespace {namespace}: {detail}")]
    QuotaExceeded { namespace: String, detail: String },
    #[error("pack runtime {tag} incompatible with node runtime {kind}")]
    RuntimeMismatch { tag: String, kind: String },

    // Transient network — retried at the connection/distribution layer.
    #[error("not connected: {0}")]
    NotConnected(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("bundle unavailable for {name}@{version}: {detail}")]
    BundleUnavailable {
        name: String,
        version: String,
        detail: String,
    },
    #[error("cancelled")]
    Cancelled,

    // Channel-protocol errors.
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("authentication timed out")]
    AuthTimeout,
    #[error("signal source {claimed} does not match registered pod {registered}")]
    SourceSpoofed { claimed: Uuid, registered: Uuid },
    #[error("no open session for pod {0}")]
    TargetUnreachable(Uuid),

    // Infrastructure.
    #[error("record store: {0}")]
    Backend(String),
}

impl Error {
    /// Stable machine-readable code for the wire and the admin API.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::InvalidState(_) => "INVALID_STATE",
            Error::InvalidStatusTransition { .. } => "INVALID_STATUS_TRANSITION",
            Error::PodNotFound(_) => "POD_NOT_FOUND",
            Error::PackNotFound(_) => "PACK_NOT_FOUND",
            Error::NodeNotFound(_) => "NODE_NOT_FOUND",
            Error::NamespaceMissing(_) => "NAMESPACE_MISSING",
            Error::VersionNotFound { .. } => "VERSION_NOT_FOUND",
            Error::NameTaken(_) => "NAME_TAKEN",
            Error::VersionExists { .. } => "VERSION_EXISTS",
            Error::SameVersion(_) => "SAME_VERSION",
            Error::NoCompatibleNodes(_) => "NO_COMPATIBLE_NODES",
            Error::InsufficientResources(_) => "INSUFFICIENT_RESOURCES",
            Error::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            Error::RuntimeMismatch { .. } => "RUNTIME_MISMATCH",
            Error::NotConnected(_) => "NOT_CONNECTED",
            Error::ConnectionClosed => "CONNECTION_CLOSED",
            Error::Timeout(_) => "TIMEOUT",
            Error::BundleUnavailable { .. } => "BUNDLE_UNAVAILABLE",
            Error::Cancelled => "CANCELLED",
            Error::AuthFailed(_) => "AUTH_FAILED",
            Error::AuthTimeout => "AUTH_TIMEOUT",
            Error::SourceSpoofed { .. } => "SOURCE_SPOOFED",
            Error::TargetUnreachable(_) => "TARGET_UNREACHABLE",
            Error::Backend(_) => "BACKEND_ERROR",
        }
    }

    /// Capacity and transient-network errors are worth retrying; the rest
    /// are deterministic.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NoCompatibleNodes(_)
                | Error::InsufficientResources(_)
                | Error::QuotaExceeded { .. }
                | Error::NotConnected(_)
                | Error::ConnectionClosed
                | Error::Timeout(_)
                | Error::BundleUnavailable { .. }
        )
    }
}

/// Serialized error: `{code, message, details?}`. Used as the payload of
/// every `*:error` frame and in admin API responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<&Error> for ErrorBody {
    fn from(err: &Error) -> Self {
        ErrorBody {
            code: err.code().to_string(),
            message: err.to_string(),
            details: None,
        }
    }
}

impl From<Error> for ErrorBody {
    fn from(err: Error) -> Self {
        ErrorBody::from(&err)
    }
}
