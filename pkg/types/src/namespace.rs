use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NamespacePhase {
    Active,
    Terminating,
}

/// Hard ceilings on what a namespace's pods may request in aggregate.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResourceQuota {
    #[serde(default)]
    pub max_pods: Option<u32>,
    #[serde(default)]
    pub max_cpu_millis: Option<u64>,
    #[serde(default)]
    pub max_memory_bytes: Option<u64>,
}

/// Defaults applied to pods admitted without explicit requests.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LimitRange {
    #[serde(default)]
    pub default_cpu_millis: Option<u64>,
    #[serde(default)]
    pub default_memory_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QuotaUsage {
    pub pods: u32,
    pub cpu_millis: u64,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Namespace {
    pub name: String,
    pub phase: NamespacePhase,
    #[serde(default)]
    pub quota: Option<ResourceQuota>,
    #[serde(default)]
    pub limit_range: Option<LimitRange>,
    #[serde(default)]
    pub usage: QuotaUsage,
}

impl Namespace {
    /// `default` and `system-*` namespaces cannot be deleted.
    pub fn is_reserved(name: &str) -> bool {
        name == "default" || name.starts_with("system-")
    }
}
