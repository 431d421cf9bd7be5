//! Cluster metrics for packd, rendered in the Prometheus text exposition
//! format by the admin API's `/metrics` endpoint.
//!
//! Every metric the subsystems record against is registered up front (see
//! [`well_known`] and [`MetricsRegistry::with_well_known`]); recording
//! against an unregistered name is a silent no-op, so instrumentation can
//! never take a subsystem down. A family may carry label pairs — each
//! distinct label set becomes its own series, e.g.
//! `packd_frames_dropped_total{reason="congested"}`.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetricKind {
    Counter,
    Gauge,
}

/// One registered family: kind, help text, and a series per label set.
/// The unlabeled series lives under the empty key.
struct Family {
    kind: MetricKind,
    help: String,
    series: BTreeMap<String, AtomicI64>,
}

pub struct MetricsRegistry {
    families: RwLock<BTreeMap<String, Family>>,
}

/// Metric names and label values shared across packd subsystems.
pub mod well_known {
    pub const SESSIONS_OPEN: &str = "packd_sessions_open";
    pub const SESSIONS_NODE: &str = "packd_sessions_node";
    pub const SESSIONS_POD: &str = "packd_sessions_pod";
    /// Labeled by `reason`: [`REASON_CONGESTED`], [`REASON_MALFORMED`].
    pub const FRAMES_DROPPED: &str = "packd_frames_dropped_total";
    pub const FRAMES_UNKNOWN_TYPE: &str = "packd_frames_unknown_type_total";
    /// Labeled by `outcome`: [`OUTCOME_FORWARDED`], [`OUTCOME_SPOOFED`],
    /// [`OUTCOME_UNREACHABLE`].
    pub const SIGNALS: &str = "packd_signals_total";
    pub const PODS_SCHEDULED: &str = "packd_pods_scheduled_total";
    pub const PODS_PREEMPTED: &str = "packd_pods_preempted_total";
    pub const PODS_UNSCHEDULABLE: &str = "packd_pods_unschedulable_total";
    pub const RECONCILE_TICKS: &str = "packd_reconcile_ticks_total";
    pub const BUNDLE_CACHE_HITS: &str = "packd_bundle_cache_hits_total";
    pub const BUNDLE_CACHE_MISSES: &str = "packd_bundle_cache_misses_total";
    pub const CORRELATIONS_PENDING: &str = "packd_correlations_pending";
    pub const CORRELATIONS_TIMED_OUT: &str = "packd_correlations_timed_out_total";

    pub const REASON_CONGESTED: &str = "congested";
    pub const REASON_MALFORMED: &str = "malformed";
    pub const OUTCOME_FORWARDED: &str = "forwarded";
    pub const OUTCOME_SPOOFED: &str = "spoofed";
    pub const OUTCOME_UNREACHABLE: &str = "unreachable";
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            families: RwLock::new(BTreeMap::new()),
        }
    }

    /// A registry with every packd metric pre-registered.
    pub fn with_well_known() -> Self {
        use well_known::*;
        let reg = Self::new();
        reg.register_gauge(SESSIONS_OPEN, "Open channel sessions");
        reg.register_gauge(SESSIONS_NODE, "Sessions registered as nodes");
        reg.register_gauge(SESSIONS_POD, "Sessions registered as pods");
        reg.register_counter(FRAMES_DROPPED, "Inbound or outbound frames dropped, by reason");
        reg.register_counter(FRAMES_UNKNOWN_TYPE, "Frames ignored for an unknown type");
        reg.register_counter(SIGNALS, "Peer signal envelopes handled, by outcome");
        reg.register_counter(PODS_SCHEDULED, "Pods placed on a node");
        reg.register_counter(PODS_PREEMPTED, "Pods evicted to make room for higher priority");
        reg.register_counter(PODS_UNSCHEDULABLE, "Pods failed after the placement attempt budget");
        reg.register_counter(RECONCILE_TICKS, "Deployment reconciler passes");
        reg.register_counter(BUNDLE_CACHE_HITS, "Bundle resolutions served from cache");
        reg.register_counter(BUNDLE_CACHE_MISSES, "Bundle resolutions that missed the cache");
        reg.register_gauge(CORRELATIONS_PENDING, "Outstanding correlated requests");
        reg.register_counter(CORRELATIONS_TIMED_OUT, "Correlated requests that hit their deadline");
        reg
    }

    pub fn register_counter(&self, name: &str, help: &str) {
        self.register(name, help, MetricKind::Counter);
    }

    pub fn register_gauge(&self, name: &str, help: &str) {
        self.register(name, help, MetricKind::Gauge);
    }

    fn register(&self, name: &str, help: &str, kind: MetricKind) {
        let mut families = self.families.write().unwrap();
        families.entry(name.to_string()).or_insert_with(|| Family {
            kind,
            help: help.to_string(),
            series: BTreeMap::new(),
        });
    }

    /// Apply `op` to the series for (name, labels), creating the series on
    /// first touch. Unregistered families are ignored.
    fn record(&self, name: &str, labels: &[(&str, &str)], op: impl Fn(&AtomicI64)) {
        let key = series_key(labels);
        {
            let families = self.families.read().unwrap();
            match families.get(name) {
                Some(family) => {
                    if let Some(cell) = family.series.get(&key) {
                        op(cell);
                        return;
                    }
                }
                None => return,
            }
        }
        // First touch of this label set; take the write lock to add it.
        let mut families = self.families.write().unwrap();
        if let Some(family) = families.get_mut(name) {
            op(family.series.entry(key).or_insert_with(|| AtomicI64::new(0)));
        }
    }

    pub fn counter_inc(&self, name: &str) {
        self.counter_add(name, 1);
    }

    pub fn counter_add(&self, name: &str, amount: u64) {
        self.record(name, &[], |cell| {
            cell.fetch_add(amount as i64, Ordering::Relaxed);
        });
    }

    pub fn counter_inc_with(&self, name: &str, labels: &[(&str, &str)]) {
        self.record(name, labels, |cell| {
            cell.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn gauge_set(&self, name: &str, value: i64) {
        self.record(name, &[], |cell| cell.store(value, Ordering::Relaxed));
    }

    pub fn gauge_inc(&self, name: &str) {
        self.record(name, &[], |cell| {
            cell.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn gauge_dec(&self, name: &str) {
        self.record(name, &[], |cell| {
            cell.fetch_sub(1, Ordering::Relaxed);
        });
    }

    /// Current value of the unlabeled series (0 if never touched).
    pub fn counter_value(&self, name: &str) -> u64 {
        self.value(name, &[])
    }

    /// Current value of a labeled series (0 if never touched).
    pub fn counter_value_with(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.value(name, labels)
    }

    fn value(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let families = self.families.read().unwrap();
        families
            .get(name)
            .and_then(|family| family.series.get(&series_key(labels)))
            .map(|cell| cell.load(Ordering::Relaxed).max(0) as u64)
            .unwrap_or(0)
    }

    /// Prometheus text exposition of every family, series sorted within.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let families = self.families.read().unwrap();
        for (name, family) in families.iter() {
            let kind = match family.kind {
                MetricKind::Counter => "counter",
                MetricKind::Gauge => "gauge",
            };
            out.push_str(&format!("# HELP {name} {}\n", family.help));
            out.push_str(&format!("# TYPE {name} {kind}\n"));
            if family.series.is_empty() {
                out.push_str(&format!("{name} 0\n"));
                continue;
            }
            for (labels, cell) in &family.series {
                let value = cell.load(Ordering::Relaxed);
                if labels.is_empty() {
                    out.push_str(&format!("{name} {value}\n"));
                } else {
                    out.push_str(&format!("{name}{{{labels}}} {value}\n"));
                }
            }
        }
        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Series key doubling as the rendered label body: `k1="v1",k2="v2"`.
fn series_key(labels: &[(&str, &str)]) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{v}\""))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let reg = MetricsRegistry::with_well_known();
        reg.counter_inc(well_known::RECONCILE_TICKS);
        reg.counter_add(well_known::RECONCILE_TICKS, 2);
        assert_eq!(reg.counter_value(well_known::RECONCILE_TICKS), 3);
    }

    #[test]
    fn label_sets_are_independent_series() {
        let reg = MetricsRegistry::with_well_known();
        let congested = [("reason", well_known::REASON_CONGESTED)];
        let malformed = [("reason", well_known::REASON_MALFORMED)];
        reg.counter_inc_with(well_known::FRAMES_DROPPED, &congested);
        reg.counter_inc_with(well_known::FRAMES_DROPPED, &malformed);
        reg.counter_inc_with(well_known::FRAMES_DROPPED, &malformed);

        assert_eq!(reg.counter_value_with(well_known::FRAMES_DROPPED, &congested), 1);
        assert_eq!(reg.counter_value_with(well_known::FRAMES_DROPPED, &malformed), 2);

        let out = reg.render();
        assert!(out.contains("packd_frames_dropped_total{reason=\"congested\"} 1"));
        assert!(out.contains("packd_frames_dropped_total{reason=\"malformed\"} 2"));
    }

    #[test]
    fn render_includes_type_lines() {
        let reg = MetricsRegistry::with_well_known();
        reg.gauge_set(well_known::SESSIONS_OPEN, 4);
        let out = reg.render();
        assert!(out.contains("# TYPE packd_sessions_open gauge"));
        assert!(out.contains("packd_sessions_open 4"));
        assert!(out.contains("# TYPE packd_reconcile_ticks_total counter"));
        // Untouched families still render a zero line.
        assert!(out.contains("packd_pods_preempted_total 0"));
    }

    #[test]
    fn unregistered_names_are_ignored() {
        let reg = MetricsRegistry::with_well_known();
        reg.counter_inc("packd_not_a_metric");
        reg.gauge_set("packd_not_a_metric", 9);
        assert_eq!(reg.counter_value("packd_not_a_metric"), 0);
        assert!(!reg.render().contains("packd_not_a_metric"));
    }
}
