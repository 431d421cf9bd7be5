//! Scheduler and reconciler constants.

/// Commit retries when a chosen node loses the resource race.
pub const PLACEMENT_COMMIT_RETRIES: u32 = 3;

/// Scheduling attempts before a pod is failed as unschedulable.
pub const MAX_SCHEDULING_ATTEMPTS: u32 = 5;

/// Reconcile pass cadence for the deployment reconciler.
pub const RECONCILE_INTERVAL_SECS: u64 = 10;

/// Default rolling-update surge above the desired replica count.
pub const DEFAULT_MAX_SURGE: u32 = 1;

/// Default rolling-update tolerance below the desired replica count.
pub const DEFAULT_MAX_UNAVAILABLE: u32 = 0;

/// Per-pod history entries kept; older entries are trimmed.
pub const POD_HISTORY_CAP: usize = 100;
