//! Filesystem path constants.

// ─── Server ────────────────────────────────────────────────────────────────

/// Default config file path for the server.
pub const DEFAULT_SERVER_CONFIG: &str = "/etc/packd/config.yaml";

/// Default data directory for the record store.
pub const DEFAULT_SERVER_DATA_DIR: &str = "/tmp/packd-data";

// ─── Node agent ────────────────────────────────────────────────────────────

/// Default config file path for the node agent.
pub const DEFAULT_NODE_CONFIG: &str = "/etc/packd/node-config.yaml";

/// Directory where the agent keeps its assigned node id and pack workdirs.
/// Full path = `NODE_STATE_DIR_PREFIX + node_name`.
pub const NODE_STATE_DIR_PREFIX: &str = "/tmp/packd-node-";

/// File (inside the node state dir) holding the control-plane-issued node id.
pub const NODE_ID_FILE: &str = "node-id";
