//! Message-channel timing and sizing constants.

/// A client must authenticate within this window after attach.
pub const AUTH_TIMEOUT_SECS: u64 = 10;

/// Server-initiated ping cadence per session.
pub const PING_INTERVAL_SECS: u64 = 30;

/// A session missing a pong for this long after a ping is stale.
pub const PONG_TIMEOUT_SECS: u64 = 10;

/// A node missing heartbeats for `2 × PING_INTERVAL` is unhealthy.
pub const NODE_UNHEALTHY_FACTOR: u64 = 2;

/// A node missing heartbeats for `4 × PING_INTERVAL` is offline.
pub const NODE_OFFLINE_FACTOR: u64 = 4;

/// Default deadline for a correlated request/response round trip.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Upper bound on outstanding correlated requests per process.
pub const MAX_PENDING_CORRELATIONS: usize = 4096;

/// Hard cap on a single wire frame.
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

/// Send queue high-water mark: messages queued.
pub const SEND_QUEUE_HIGH_WATER_MSGS: usize = 1024;

/// Send queue high-water mark: bytes queued.
pub const SEND_QUEUE_HIGH_WATER_BYTES: usize = 16 * 1024 * 1024;

/// Queue level below which a congested session clears.
pub const SEND_QUEUE_LOW_WATER_MSGS: usize = 256;

/// Client reconnect: base backoff delay in milliseconds.
pub const RECONNECT_BASE_DELAY_MS: u64 = 500;

/// Client reconnect: the delay doubles at most this many times.
pub const RECONNECT_MAX_DOUBLINGS: u32 = 5;

/// Grace period given to pod shutdown handlers on a graceful stop.
pub const GRACEFUL_STOP_SECS: u64 = 5;

/// Cadence of `node:heartbeat` frames from the agent.
pub const NODE_HEARTBEAT_INTERVAL_SECS: u64 = 10;

/// Pod slots a node offers when its config does not say otherwise.
pub const DEFAULT_NODE_POD_SLOTS: u32 = 32;
