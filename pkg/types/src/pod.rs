use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::Error;

// --- Resource requests ---

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ResourceRequests {
    /// CPU in millicores (1000 = 1 core)
    #[serde(default)]
    pub cpu_millis: u64,
    /// Memory in bytes
    #[serde(default)]
    pub memory_bytes: u64,
}

// --- Taints & tolerations ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Toleration {
    pub key: String,
    #[serde(default)]
    pub operator: TolerationOperator,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub effect: TaintEffect,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum TolerationOperator {
    #[default]
    Equal,
    Exists,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum TaintEffect {
    #[default]
    NoSchedule,
    PreferNoSchedule,
}

// --- Pod status ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PodStatus {
    Pending,
    Scheduled,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Evicted,
}

impl PodStatus {
    /// Terminal states are sinks: no transition leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PodStatus::Stopped | PodStatus::Failed | PodStatus::Evicted)
    }
}

impl std::fmt::Display for PodStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PodStatus::Pending => write!(f, "pending"),
            PodStatus::Scheduled => write!(f, "scheduled"),
            PodStatus::Starting => write!(f, "starting"),
            PodStatus::Running => write!(f, "running"),
            PodStatus::Stopping => write!(f, "stopping"),
            PodStatus::Stopped => write!(f, "stopped"),
            PodStatus::Failed => write!(f, "failed"),
            PodStatus::Evicted => write!(f, "evicted"),
        }
    }
}

// --- Lifecycle transitions ---

/// Actions that move a pod through its lifecycle. Placement (`pending →
/// scheduled`) and rollback are separate store operations and not listed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PodTransition {
    /// scheduled → starting
    Start,
    /// starting → running
    Run,
    /// scheduled | starting | running → stopping
    Stop,
    /// stopping → stopped
    Stopped,
    /// any non-terminal → failed
    Fail,
    /// scheduled | starting | running | stopping → evicted
    Evict,
}

impl std::fmt::Display for PodTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PodTransition::Start => write!(f, "start"),
            PodTransition::Run => write!(f, "run"),
            PodTransition::Stop => write!(f, "stop"),
            PodTransition::Stopped => write!(f, "stopped"),
            PodTransition::Fail => write!(f, "fail"),
            PodTransition::Evict => write!(f, "evict"),
        }
    }
}

impl PodStatus {
    /// Pure transition function of the pod state machine. Returns the next
    /// status, or `INVALID_STATUS_TRANSITION` when the edge does not exist.
    pub fn apply(self, transition: PodTransition) -> Result<PodStatus, Error> {
        use PodStatus::*;
        use PodTransition::*;
        let next = match (self, transition) {
            (Scheduled, Start) => Starting,
            (Starting, Run) => Running,
            (Scheduled, Stop) | (Starting, Stop) | (Running, Stop) => Stopping,
            (Stopping, PodTransition::Stopped) => PodStatus::Stopped,
            (Pending, Fail)
            | (Scheduled, Fail)
            | (Starting, Fail)
            | (Running, Fail)
            | (Stopping, Fail) => Failed,
            (Scheduled, Evict) | (Starting, Evict) | (Running, Evict) | (Stopping, Evict) => {
                Evicted
            }
            (from, t) => {
                return Err(Error::InvalidStatusTransition {
                    from,
                    transition: t.to_string(),
                });
            }
        };
        Ok(next)
    }
}

// --- Pod ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pod {
    pub id: Uuid,
    pub pack_id: Uuid,
    pub pack_version: String,
    pub namespace: String,
    /// Set by the scheduler; cleared again when the pod reaches a terminal
    /// state so node accounting and membership stay in lockstep.
    #[serde(default)]
    pub node_id: Option<Uuid>,
    pub status: PodStatus,
    /// Resolved priority value (from the priority class at admission).
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub priority_class: Option<String>,
    #[serde(default)]
    pub requests: ResourceRequests,
    #[serde(default)]
    pub limits: ResourceRequests,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
    /// Labels a candidate node must carry.
    #[serde(default)]
    pub node_selector: HashMap<String, String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub created_by: String,
    /// Human-readable reason for the current status (set on every terminal
    /// transition).
    #[serde(default)]
    pub status_message: Option<String>,
    /// Failed placement attempts so far; the reconciler gives up after a
    /// bounded number and fails the pod.
    #[serde(default)]
    pub scheduling_attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
}

// --- Admission input ---

/// Input to `create_pod`. The pack is referenced by id; its version is
/// copied onto the pod at admission so rollback can later move it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodSpec {
    pub pack_id: Uuid,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub priority_class: Option<String>,
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
    pub env: HashMap<String, String>,
    #[serde(default = "default_created_by")]
    pub created_by: String,
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_created_by() -> String {
    "api".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_sinks() {
        use PodTransition::*;
        for terminal in [PodStatus::Stopped, PodStatus::Failed, PodStatus::Evicted] {
            for t in [Start, Run, Stop, Stopped, Fail, Evict] {
                assert!(terminal.apply(t).is_err(), "{terminal} must not accept {t}");
            }
        }
    }

    #[test]
    fn happy_path() {
        let s = PodStatus::Scheduled;
        let s = s.apply(PodTransition::Start).unwrap();
        assert_eq!(s, PodStatus::Starting);
        let s = s.apply(PodTransition::Run).unwrap();
        assert_eq!(s, PodStatus::Running);
        let s = s.apply(PodTransition::Stop).unwrap();
        assert_eq!(s, PodStatus::Stopping);
        let s = s.apply(PodTransition::Stopped).unwrap();
        assert_eq!(s, PodStatus::Stopped);
    }

    #[test]
    fn pending_only_fails() {
        assert!(PodStatus::Pending.apply(PodTransition::Start).is_err());
        assert!(PodStatus::Pending.apply(PodTransition::Evict).is_err());
        assert_eq!(
            PodStatus::Pending.apply(PodTransition::Fail).unwrap(),
            PodStatus::Failed
        );
    }
}
