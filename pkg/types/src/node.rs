use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::pod::{ResourceRequests, TaintEffect};

// --- Runtime kind ---

/// The runtime a host can execute packs in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Server-side JS runtime host.
    Node,
    /// Browser runtime host.
    Browser,
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeKind::Node => write!(f, "node"),
            RuntimeKind::Browser => write!(f, "browser"),
        }
    }
}

// --- Node status ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Draining,
    Unhealthy,
    Offline,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Online => write!(f, "online"),
            NodeStatus::Draining => write!(f, "draining"),
            NodeStatus::Unhealthy => write!(f, "unhealthy"),
            NodeStatus::Offline => write!(f, "offline"),
        }
    }
}

// --- Capacity ---

/// What a node can hand out, per dimension.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct NodeCapacity {
    /// CPU in millicores (1000 = 1 core)
    #[serde(default)]
    pub cpu_millis: u64,
    /// Memory in bytes
    #[serde(default)]
    pub memory_bytes: u64,
    /// Pod slots
    #[serde(default)]
    pub pods: u32,
    /// Scratch storage in bytes
    #[serde(default)]
    pub storage_bytes: u64,
}

/// What a node has handed out to live pods. Maintained exclusively by the
/// state store; a pod counts here iff its `node_id` points at the node and
/// its status is not terminal.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct NodeAllocated {
    #[serde(default)]
    pub cpu_millis: u64,
    #[serde(default)]
    pub memory_bytes: u64,
    #[serde(default)]
    pub pods: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub effect: TaintEffect,
}

// --- Node ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    pub name: String,
    pub runtime_kind: RuntimeKind,
    #[serde(default)]
    pub capability_tags: Vec<String>,
    pub allocatable: NodeCapacity,
    #[serde(default)]
    pub allocated: NodeAllocated,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub taints: Vec<Taint>,
    pub status: NodeStatus,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub unschedulable: bool,
}

impl Node {
    /// Whether the remaining capacity covers `req` on every dimension,
    /// with at least one free pod slot.
    pub fn fits(&self, req: &ResourceRequests) -> bool {
        let free_cpu = self.allocatable.cpu_millis.saturating_sub(self.allocated.cpu_millis);
        let free_mem = self
            .allocatable
            .memory_bytes
            .saturating_sub(self.allocated.memory_bytes);
        req.cpu_millis <= free_cpu
            && req.memory_bytes <= free_mem
            && self.allocated.pods < self.allocatable.pods
    }

    /// Fraction of capacity in use after hypothetically placing `req`,
    /// averaged over cpu and memory. Used by the binpack scorer.
    pub fn utilization_after(&self, req: &ResourceRequests) -> f64 {
        let cpu = if self.allocatable.cpu_millis > 0 {
            (self.allocated.cpu_millis + req.cpu_millis) as f64 / self.allocatable.cpu_millis as f64
        } else {
            0.0
        };
        let mem = if self.allocatable.memory_bytes > 0 {
            (self.allocated.memory_bytes + req.memory_bytes) as f64
                / self.allocatable.memory_bytes as f64
        } else {
            0.0
        };
        (cpu + mem) / 2.0
    }
}

// --- Registration ---

/// Payload of a `node:register` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterNodeInput {
    pub name: String,
    pub runtime_kind: RuntimeKind,
    #[serde(default)]
    pub capability_tags: Vec<String>,
    pub allocatable: NodeCapacity,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub taints: Vec<Taint>,
}
