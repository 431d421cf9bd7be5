use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::pod::{ResourceRequests, Toleration};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Active,
    Paused,
    Scaling,
    Deleting,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceStatus::Active => write!(f, "active"),
            ServiceStatus::Paused => write!(f, "paused"),
            ServiceStatus::Scaling => write!(f, "scaling"),
            ServiceStatus::Deleting => write!(f, "deleting"),
        }
    }
}

/// Who may resolve routes to this service's pods.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    #[default]
    Private,
    System,
}

/// Pod-shaping fields stamped onto every replica the reconciler creates.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PodTemplate {
    #[serde(default)]
    pub requests: ResourceRequests,
    #[serde(default)]
    pub limits: ResourceRequests,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
    #[serde(default)]
    pub node_selector: HashMap<String, String>,
    #[serde(default)]
    pub priority_class: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: Uuid,
    /// Unique within its namespace.
    pub name: String,
    pub namespace: String,
    /// Target pack at the target version; pods are matched by pack *name*
    /// across versions during reconciliation.
    pub pack_id: Uuid,
    pub pack_version: String,
    /// Desired replicas. 0 means daemon mode: one replica per compatible
    /// schedulable node.
    pub replicas: u32,
    #[serde(default)]
    pub template: PodTemplate,
    pub status: ServiceStatus,
    #[serde(default)]
    pub ready_replicas: u32,
    #[serde(default)]
    pub available_replicas: u32,
    #[serde(default)]
    pub updated_replicas: u32,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub exposed: bool,
    /// Service ids allowed to resolve routes here when visibility is
    /// `private`.
    #[serde(default)]
    pub allowed_sources: Vec<Uuid>,
    #[serde(default = "default_max_surge")]
    pub max_surge: u32,
    #[serde(default)]
    pub max_unavailable: u32,
    pub created_at: DateTime<Utc>,
}

fn default_max_surge() -> u32 {
    1
}

/// Input to `create_service`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub pack_id: Uuid,
    #[serde(default)]
    pub replicas: u32,
    #[serde(default)]
    pub template: PodTemplate,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub exposed: bool,
    #[serde(default)]
    pub allowed_sources: Vec<Uuid>,
    #[serde(default = "default_max_surge")]
    pub max_surge: u32,
    #[serde(default)]
    pub max_unavailable: u32,
}

fn default_namespace() -> String {
    "default".to_string()
}
