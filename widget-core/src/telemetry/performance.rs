//! Named performance metrics keyed by instance.
//!
//! Each (metric, instance) pair holds only its latest value. This is a
//! dashboard snapshot, not a time series.

use crate::widget::InstanceId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Mount duration in milliseconds.
pub const LOAD_TIME: &str = "load_time";
/// Render callback duration in milliseconds.
pub const RENDER_TIME: &str = "render_time";
/// Refresh cycle duration in milliseconds.
pub const REFRESH_TIME: &str = "refresh_time";
/// Data sync duration in milliseconds.
pub const SYNC_TIME: &str = "sync_time";
/// Failed cycles divided by total cycles.
pub const ERROR_RATE: &str = "error_rate";

/// metric name -> instance -> latest value
pub type MetricMap = HashMap<String, HashMap<InstanceId, f64>>;

/// Single-instance view of the standard metrics.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct InstancePerformance {
    pub load_time: Option<f64>,
    pub render_time: Option<f64>,
    pub error_rate: Option<f64>,
}

/// Result of a performance query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum PerformanceReport {
    /// Every metric for every instance
    All { metrics: MetricMap },
    /// Standard metrics for one instance
    Instance {
        instance_id: InstanceId,
        metrics: InstancePerformance,
    },
}

#[derive(Debug, Default, Clone, Copy)]
struct CycleStats {
    total: u64,
    failed: u64,
}

#[derive(Debug, Default)]
struct TrackerState {
    metrics: MetricMap,
    sample_counts: HashMap<String, u64>,
    cycles: HashMap<InstanceId, CycleStats>,
}

/// Last-write-wins metric store.
#[derive(Debug, Default)]
pub struct PerformanceTracker {
    state: RwLock<TrackerState>,
}

impl PerformanceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sample, replacing any previous value for the pair.
    pub fn track(&self, instance_id: &InstanceId, metric: &str, value: f64) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state
            .metrics
            .entry(metric.to_string())
            .or_default()
            .insert(instance_id.clone(), value);
        *state.sample_counts.entry(metric.to_string()).or_insert(0) += 1;
    }

    /// Latest value for a pair.
    pub fn get(&self, instance_id: &InstanceId, metric: &str) -> Option<f64> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.metrics.get(metric)?.get(instance_id).copied()
    }

    /// How many samples were ever written for a metric.
    pub fn sample_count(&self, metric: &str) -> u64 {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.sample_counts.get(metric).copied().unwrap_or(0)
    }

    /// Count a finished lifecycle cycle and update the instance's error rate.
    pub fn record_cycle(&self, instance_id: &InstanceId, failed: bool) -> f64 {
        let rate = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let stats = state.cycles.entry(instance_id.clone()).or_default();
            stats.total += 1;
            if failed {
                stats.failed += 1;
            }
            stats.failed as f64 / stats.total as f64
        };
        self.track(instance_id, ERROR_RATE, rate);
        rate
    }

    /// Copy of the full metric map.
    pub fn snapshot(&self) -> MetricMap {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .metrics
            .clone()
    }

    /// Standard metrics for one instance.
    pub fn instance_view(&self, instance_id: &InstanceId) -> InstancePerformance {
        InstancePerformance {
            load_time: self.get(instance_id, LOAD_TIME),
            render_time: self.get(instance_id, RENDER_TIME),
            error_rate: self.get(instance_id, ERROR_RATE),
        }
    }

    /// Forget everything recorded for an instance.
    pub fn remove_instance(&self, instance_id: &InstanceId) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        for values in state.metrics.values_mut() {
            values.remove(instance_id);
        }
        state.metrics.retain(|_, values| !values.is_empty());
        state.cycles.remove(instance_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_write_wins() {
        let tracker = PerformanceTracker::new();
        let id = InstanceId::from("w1");
        tracker.track(&id, LOAD_TIME, 120.0);
        tracker.track(&id, LOAD_TIME, 80.0);

        assert_eq!(tracker.get(&id, LOAD_TIME), Some(80.0));
        assert_eq!(tracker.sample_count(LOAD_TIME), 2);
        assert_eq!(tracker.snapshot()[LOAD_TIME].len(), 1);
    }

    #[test]
    fn test_error_rate() {
        let tracker = PerformanceTracker::new();
        let id = InstanceId::from("w1");
        tracker.record_cycle(&id, false);
        tracker.record_cycle(&id, true);
        tracker.record_cycle(&id, false);
        let rate = tracker.record_cycle(&id, true);

        assert!((rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(tracker.instance_view(&id).error_rate, Some(0.5));
    }

    #[test]
    fn test_instance_view_and_removal() {
        let tracker = PerformanceTracker::new();
        let a = InstanceId::from("a");
        let b = InstanceId::from("b");
        tracker.track(&a, LOAD_TIME, 10.0);
        tracker.track(&a, RENDER_TIME, 2.0);
        tracker.track(&b, LOAD_TIME, 30.0);

        let view = tracker.instance_view(&a);
        assert_eq!(view.load_time, Some(10.0));
        assert_eq!(view.render_time, Some(2.0));
        assert_eq!(view.error_rate, None);

        tracker.remove_instance(&a);
        assert_eq!(tracker.get(&a, LOAD_TIME), None);
        assert_eq!(tracker.get(&b, LOAD_TIME), Some(30.0));
        assert!(!tracker.snapshot().contains_key(RENDER_TIME));
    }
}
