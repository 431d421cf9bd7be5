use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::node::RuntimeKind;

// --- Runtime tag ---

/// Which runtime kinds a pack can execute on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeTag {
    Node,
    Browser,
    Universal,
}

impl RuntimeTag {
    pub fn compatible_with(&self, kind: RuntimeKind) -> bool {
        match self {
            RuntimeTag::Universal => true,
            RuntimeTag::Node => kind == RuntimeKind::Node,
            RuntimeTag::Browser => kind == RuntimeKind::Browser,
        }
    }
}

impl std::fmt::Display for RuntimeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeTag::Node => write!(f, "node"),
            RuntimeTag::Browser => write!(f, "browser"),
            RuntimeTag::Universal => write!(f, "universal"),
        }
    }
}

// --- Pack metadata ---

/// Mutable descriptive fields; everything else on a pack is immutable
/// after registration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PackMetadata {
    /// Entrypoint inside the bundle (e.g. `main.js`).
    #[serde(default)]
    pub entrypoint: String,
    /// Environment applied to every pod of this pack unless overridden.
    #[serde(default)]
    pub default_env: HashMap<String, String>,
    /// Hard cap on pod run time, if any.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

// --- Pack ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pack {
    pub id: Uuid,
    pub name: String,
    /// Semver; (name, version) is unique.
    pub version: String,
    pub runtime_tag: RuntimeTag,
    pub owner_id: String,
    /// Origin locator for the bundle bytes, if not inline.
    #[serde(default)]
    pub bundle_url: Option<String>,
    /// Inline bundle bytes; small packs ship these directly.
    #[serde(default)]
    pub bundle_bytes: Option<Vec<u8>>,
    #[serde(default)]
    pub metadata: PackMetadata,
    pub created_at: DateTime<Utc>,
}

/// Input to `register_pack`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackSpec {
    pub name: String,
    pub version: String,
    pub runtime_tag: RuntimeTag,
    #[serde(default = "default_owner")]
    pub owner_id: String,
    #[serde(default)]
    pub bundle_url: Option<String>,
    #[serde(default)]
    pub bundle_bytes: Option<Vec<u8>>,
    #[serde(default)]
    pub metadata: PackMetadata,
}

fn default_owner() -> String {
    "api".to_string()
}
