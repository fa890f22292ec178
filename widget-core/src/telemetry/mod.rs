//! Error and performance telemetry.
//!
//! All layers feed telemetry: the lifecycle manager records cycle failures
//! and timings, hosts report their own errors through the orchestrator.
//! Non-recoverable errors are handed to the configured [`Notifier`].

mod errors;
pub mod performance;

pub use errors::{ErrorCategory, ErrorLog, ErrorRecord, ErrorReport};
pub use performance::{InstancePerformance, MetricMap, PerformanceReport, PerformanceTracker};

use crate::host::{Notifier, TracingNotifier};
use crate::widget::InstanceId;
use std::sync::Arc;
use tracing::debug;

/// Rolling error log, metric store and notification hook.
pub struct Telemetry {
    errors: ErrorLog,
    performance: PerformanceTracker,
    notifier: Arc<dyn Notifier>,
}

impl Telemetry {
    /// Create telemetry with a global error log of `error_log_limit` entries.
    pub fn new(error_log_limit: usize) -> Self {
        Self {
            errors: ErrorLog::new(error_log_limit),
            performance: PerformanceTracker::new(),
            notifier: Arc::new(TracingNotifier),
        }
    }

    /// Replace the notifier.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Stamp and log a report. Non-recoverable errors are also notified.
    pub fn report_error(&self, report: ErrorReport) -> ErrorRecord {
        let record = ErrorRecord::from_report(report);
        debug!(
            instance_id = %record.instance_id,
            category = %record.category,
            recoverable = record.recoverable,
            "Widget error reported: {}",
            record.message
        );
        self.errors.push(record.clone());
        if !record.recoverable {
            self.notifier.notify(&record);
        }
        record
    }

    pub fn errors(&self) -> &ErrorLog {
        &self.errors
    }

    pub fn performance(&self) -> &PerformanceTracker {
        &self.performance
    }

    /// Performance for one instance, or everything.
    pub fn performance_report(&self, instance_id: Option<&InstanceId>) -> PerformanceReport {
        match instance_id {
            Some(id) => PerformanceReport::Instance {
                instance_id: id.clone(),
                metrics: self.performance.instance_view(id),
            },
            None => PerformanceReport::All {
                metrics: self.performance.snapshot(),
            },
        }
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("errors", &self.errors.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_only_non_recoverable_errors_notify() {
        let notified = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&notified);
        let telemetry = Telemetry::new(10).with_notifier(Arc::new(move |r: &ErrorRecord| {
            sink.lock().unwrap().push(r.message.clone());
        }));

        telemetry.report_error(ErrorReport::new("w1", ErrorCategory::Data, "stale"));
        telemetry.report_error(
            ErrorReport::new("w1", ErrorCategory::Permission, "forbidden").non_recoverable(),
        );

        assert_eq!(*notified.lock().unwrap(), vec!["forbidden".to_string()]);
        assert_eq!(telemetry.errors().len(), 2);
    }

    #[test]
    fn test_performance_report_scopes() {
        let telemetry = Telemetry::new(10);
        let id = InstanceId::from("w1");
        telemetry
            .performance()
            .track(&id, performance::LOAD_TIME, 42.0);

        match telemetry.performance_report(Some(&id)) {
            PerformanceReport::Instance { metrics, .. } => {
                assert_eq!(metrics.load_time, Some(42.0));
            }
            other => panic!("unexpected report: {:?}", other),
        }

        match telemetry.performance_report(None) {
            PerformanceReport::All { metrics } => {
                assert_eq!(metrics[performance::LOAD_TIME][&id], 42.0);
            }
            other => panic!("unexpected report: {:?}", other),
        }
    }
}
