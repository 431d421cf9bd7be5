use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::pod::PodStatus;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Created,
    Scheduled,
    Started,
    Running,
    Stopped,
    Failed,
    Evicted,
    RolledBack,
    Unscheduled,
}

/// Append-only record of one lifecycle step of a pod. Owned by the pod;
/// deleted with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodHistoryEntry {
    pub pod_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub action: HistoryAction,
    #[serde(default)]
    pub previous_status: Option<PodStatus>,
    #[serde(default)]
    pub new_status: Option<PodStatus>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}
