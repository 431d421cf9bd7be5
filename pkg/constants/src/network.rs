//! Network-related constants.

/// Default port for the packd control plane.
pub const DEFAULT_SERVER_PORT: u16 = 7100;

/// Default control-plane address as seen by nodes (HTTP; the message
/// channel lives at `CHANNEL_PATH` on the same listener).
pub const DEFAULT_SERVER_ADDR: &str = "http://127.0.0.1:7100";

/// URL path of the bidirectional message channel endpoint.
pub const CHANNEL_PATH: &str = "/channel";

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// Policy violation: oversize frame or failed authentication.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Server shutdown or stale (unresponsive) session.
pub const CLOSE_GOING_AWAY: u16 = 1011;
