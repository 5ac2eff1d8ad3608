//! Observability: engine metrics and structured decision logs

use crate::factor::Direction;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Engine counters, gauges and timing summaries.
///
/// Histograms keep running aggregates only, so a long-lived engine holds a
/// fixed amount of memory per metric name.
#[derive(Clone)]
pub struct EngineMetrics {
    store: Arc<RwLock<MetricStore>>,
}

struct MetricStore {
    counters: HashMap<String, u64>,
    gauges: HashMap<String, f64>,
    histograms: HashMap<String, HistogramSummary>,
    started: Instant,
}

impl EngineMetrics {
    pub fn new() -> Self {
        let store = MetricStore {
            counters: HashMap::new(),
            gauges: HashMap::new(),
            histograms: HashMap::new(),
            started: Instant::now(),
        };
        Self {
            store: Arc::new(RwLock::new(store)),
        }
    }

    pub async fn increment(&self, name: &str, by: u64) {
        let mut store = self.store.write().await;
        *store.counters.entry(name.to_string()).or_insert(0) += by;
    }

    pub async fn gauge(&self, name: &str, value: f64) {
        self.store.write().await.gauges.insert(name.to_string(), value);
    }

    /// Fold one observation into the named summary
    pub async fn histogram(&self, name: &str, value: f64) {
        let mut store = self.store.write().await;
        store
            .histograms
            .entry(name.to_string())
            .or_default()
            .record(value);
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let store = self.store.read().await;
        MetricsSnapshot {
            counters: store.counters.clone(),
            gauges: store.gauges.clone(),
            histograms: store.histograms.clone(),
            uptime_secs: store.started.elapsed().as_secs(),
        }
    }

    pub async fn get_counter(&self, name: &str) -> u64 {
        self.store.read().await.counters.get(name).copied().unwrap_or(0)
    }

    pub async fn get_gauge(&self, name: &str) -> Option<f64> {
        self.store.read().await.gauges.get(name).copied()
    }

    pub async fn get_histogram(&self, name: &str) -> Option<HistogramSummary> {
        self.store.read().await.histograms.get(name).copied()
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, f64>,
    pub histograms: HashMap<String, HistogramSummary>,
    pub uptime_secs: u64,
}

/// Running count, sum and extremes of one observed value
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl HistogramSummary {
    fn record(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Log one finished evaluation as a structured event
pub fn decision_event(
    instrument: &str,
    direction: Direction,
    score: f64,
    probability: f64,
    changed: bool,
    rule: Option<&str>,
) {
    tracing::info!(
        instrument = %instrument,
        direction = %direction,
        score = score,
        probability = probability,
        changed = changed,
        rule = rule.unwrap_or("none"),
        "decision"
    );
}

/// Predefined metric names
pub mod metrics {
    // Evaluations
    pub const EVALUATIONS: &str = "evaluations_total";
    pub const EVALUATION_DURATION_US: &str = "evaluation_duration_us";

    // Inputs
    pub const ANALYZER_FAILURES: &str = "analyzer_failures_total";
    pub const FACTOR_COVERAGE: &str = "factor_coverage";

    // Conflict rules
    pub const RULE_EXTREME_OVERRIDE: &str = "rule_extreme_override_total";
    pub const RULE_STRONG_OVERRIDE: &str = "rule_strong_override_total";
    pub const RULE_DAMPENING: &str = "rule_dampening_total";

    // Hysteresis
    pub const DIRECTION_CHANGES: &str = "direction_changes_total";
    pub const HYSTERESIS_HOLDS: &str = "hysteresis_holds_total";

    // Correlation
    pub const LEADER_PUBLISHED: &str = "leader_signal_published_total";
    pub const CORRELATION_APPLIED: &str = "correlation_applied_total";
    pub const CORRELATION_CONFLICTS: &str = "correlation_conflicts_total";
    pub const CORRELATION_CLAMPED: &str = "correlation_clamped_total";

    /// Counter name for a conflict rule
    pub fn rule_counter(rule: &str) -> Option<&'static str> {
        match rule {
            "extreme_factor_override" => Some(RULE_EXTREME_OVERRIDE),
            "strong_signal_override" => Some(RULE_STRONG_OVERRIDE),
            "consensus_dampening" => Some(RULE_DAMPENING),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counters_and_snapshot() {
        let m = EngineMetrics::new();
        m.increment(metrics::EVALUATIONS, 1).await;
        m.increment(metrics::EVALUATIONS, 2).await;
        m.gauge(metrics::FACTOR_COVERAGE, 0.75).await;
        m.histogram(metrics::EVALUATION_DURATION_US, 10.0).await;
        m.histogram(metrics::EVALUATION_DURATION_US, 30.0).await;

        assert_eq!(m.get_counter(metrics::EVALUATIONS).await, 3);
        assert_eq!(m.get_counter(metrics::HYSTERESIS_HOLDS).await, 0);
        assert_eq!(m.get_gauge(metrics::FACTOR_COVERAGE).await, Some(0.75));

        let snapshot = m.snapshot().await;
        let durations = snapshot.histograms[metrics::EVALUATION_DURATION_US];
        assert_eq!(durations.count, 2);
        assert_eq!(durations.mean(), 20.0);
        assert_eq!(durations.min, 10.0);
        assert_eq!(durations.max, 30.0);
        assert!(serde_json::to_string(&snapshot).is_ok());
    }

    #[tokio::test]
    async fn test_histogram_keeps_running_summary() {
        let m = EngineMetrics::new();
        assert!(m.get_histogram(metrics::EVALUATION_DURATION_US).await.is_none());
        for i in 1..=5000 {
            m.histogram(metrics::EVALUATION_DURATION_US, i as f64).await;
        }
        let summary = m.get_histogram(metrics::EVALUATION_DURATION_US).await.unwrap();
        assert_eq!(summary.count, 5000);
        assert_eq!(summary.sum, 12_502_500.0);
        assert_eq!(summary.mean(), 2500.5);
        assert_eq!((summary.min, summary.max), (1.0, 5000.0));
    }

    #[test]
    fn test_rule_counter_names() {
        assert_eq!(
            metrics::rule_counter("consensus_dampening"),
            Some(metrics::RULE_DAMPENING)
        );
        assert_eq!(metrics::rule_counter("custom"), None);
    }
}
