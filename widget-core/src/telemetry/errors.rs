//! Error records and the rolling global error log.

use crate::widget::{push_bounded, InstanceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

/// Category of a runtime widget error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Config,
    Data,
    Render,
    Permission,
    Network,
    Validation,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Config => "config",
            Self::Data => "data",
            Self::Render => "render",
            Self::Permission => "permission",
            Self::Network => "network",
            Self::Validation => "validation",
        };
        write!(f, "{}", s)
    }
}

/// An error as reported, before the log assigns id and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub instance_id: InstanceId,
    pub category: ErrorCategory,
    pub message: String,
    pub stack: Option<String>,
    pub recoverable: bool,
}

impl ErrorReport {
    /// Create a recoverable error report.
    pub fn new(
        instance_id: impl Into<InstanceId>,
        category: ErrorCategory,
        message: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            category,
            message: message.into(),
            stack: None,
            recoverable: true,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Mark the error as non-recoverable.
    pub fn non_recoverable(mut self) -> Self {
        self.recoverable = false;
        self
    }
}

/// A logged error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: Uuid,
    pub instance_id: InstanceId,
    pub category: ErrorCategory,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub recoverable: bool,
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    /// Stamp a report with a fresh id and the current time.
    pub fn from_report(report: ErrorReport) -> Self {
        Self {
            id: Uuid::new_v4(),
            instance_id: report.instance_id,
            category: report.category,
            message: report.message,
            stack: report.stack,
            recoverable: report.recoverable,
            timestamp: Utc::now(),
        }
    }
}

/// Rolling log of the most recent errors across all instances.
#[derive(Debug)]
pub struct ErrorLog {
    records: Mutex<VecDeque<ErrorRecord>>,
    limit: usize,
}

impl ErrorLog {
    pub fn new(limit: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(limit)),
            limit: limit.max(1),
        }
    }

    /// Append a record, dropping the oldest past the limit.
    pub fn push(&self, record: ErrorRecord) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        push_bounded(&mut records, record, self.limit);
    }

    /// All records, oldest first.
    pub fn all(&self) -> Vec<ErrorRecord> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.iter().cloned().collect()
    }

    /// Records belonging to one instance, oldest first.
    pub fn for_instance(&self, instance_id: &InstanceId) -> Vec<ErrorRecord> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records
            .iter()
            .filter(|r| &r.instance_id == instance_id)
            .cloned()
            .collect()
    }

    /// Clear one instance's records, or everything. Returns how many were removed.
    pub fn clear(&self, instance_id: Option<&InstanceId>) -> usize {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let before = records.len();
        match instance_id {
            Some(id) => records.retain(|r| &r.instance_id != id),
            None => records.clear(),
        }
        before - records.len()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(instance: &str, message: &str) -> ErrorRecord {
        ErrorRecord::from_report(ErrorReport::new(instance, ErrorCategory::Data, message))
    }

    #[test]
    fn test_report_builder() {
        let report = ErrorReport::new("w1", ErrorCategory::Network, "offline")
            .with_stack("fetch")
            .non_recoverable();
        assert!(!report.recoverable);

        let record = ErrorRecord::from_report(report);
        assert_eq!(record.instance_id, InstanceId::from("w1"));
        assert_eq!(record.stack.as_deref(), Some("fetch"));
        assert_eq!(record.category.to_string(), "network");
    }

    #[test]
    fn test_log_is_bounded() {
        let log = ErrorLog::new(3);
        for i in 0..5 {
            log.push(record("w1", &format!("error {}", i)));
        }

        let messages: Vec<_> = log.all().into_iter().map(|r| r.message).collect();
        assert_eq!(messages, vec!["error 2", "error 3", "error 4"]);
    }

    #[test]
    fn test_scoped_clear() {
        let log = ErrorLog::new(10);
        log.push(record("w1", "a"));
        log.push(record("w2", "b"));
        log.push(record("w1", "c"));

        assert_eq!(log.for_instance(&"w1".into()).len(), 2);
        assert_eq!(log.clear(Some(&"w1".into())), 2);
        assert_eq!(log.len(), 1);
        assert_eq!(log.clear(None), 1);
        assert!(log.is_empty());
    }
}
