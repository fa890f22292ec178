//! Host collaborators: the pluggable seams between the orchestrator and the
//! application embedding it.
//!
//! - [`WidgetDriver`]: performs the actual mount / refresh / unmount work
//! - [`Renderer`]: turns a ready instance into an opaque visual element
//! - [`DataFetcher`]: resolves a widget type's [`DataSource`]s
//! - [`Notifier`]: surfaces non-recoverable errors to the user
//!
//! The orchestrator only invokes these; it never inspects what they produce
//! beyond success or failure.

use crate::telemetry::ErrorRecord;
use crate::widget::{DataSource, WidgetInstance, WidgetType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// Failure reported by a host collaborator.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{message}")]
pub struct HostError {
    /// What went wrong
    pub message: String,
    /// Optional stack or trace text
    pub stack: Option<String>,
    /// Whether the instance may be retried
    pub recoverable: bool,
}

impl HostError {
    /// Create a recoverable host error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            recoverable: true,
        }
    }

    /// Create a host error that blocks retries.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            recoverable: false,
            ..Self::new(message)
        }
    }

    /// Attach a stack trace.
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

/// Performs the lifecycle work for widget instances.
///
/// Implementations must be thread-safe (`Send + Sync`): refresh fan-out runs
/// cycles for different instances concurrently.
#[async_trait]
pub trait WidgetDriver: Send + Sync {
    /// Mount an instance. Called while the instance is `loading`.
    async fn mount(&self, instance: &WidgetInstance, widget_type: &WidgetType)
        -> Result<(), HostError>;

    /// Refresh a mounted instance.
    async fn refresh(
        &self,
        _instance: &WidgetInstance,
        _widget_type: &WidgetType,
    ) -> Result<(), HostError> {
        Ok(())
    }

    /// Release whatever the mount acquired.
    async fn unmount(&self, _instance: &WidgetInstance) {}
}

/// Driver that succeeds immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDriver;

#[async_trait]
impl WidgetDriver for NoopDriver {
    async fn mount(&self, _instance: &WidgetInstance, _widget_type: &WidgetType) -> Result<(), HostError> {
        Ok(())
    }
}

/// Render callback associated with a widget type.
pub trait Renderer: Send + Sync {
    /// Produce the visual element for a ready instance.
    fn render(&self, instance: &WidgetInstance) -> Value;
}

impl<F> Renderer for F
where
    F: Fn(&WidgetInstance) -> Value + Send + Sync,
{
    fn render(&self, instance: &WidgetInstance) -> Value {
        self(instance)
    }
}

/// Response from a data fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchResponse {
    /// HTTP-style status code
    pub status: u16,
    /// Response body, opaque to the orchestrator
    pub body: Value,
}

impl FetchResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn with_status(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    /// 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Resolves data sources declared on widget types.
#[async_trait]
pub trait DataFetcher: Send + Sync {
    async fn fetch(&self, source: &DataSource) -> Result<FetchResponse, HostError>;
}

/// Receives non-recoverable errors for user-visible notification.
pub trait Notifier: Send + Sync {
    fn notify(&self, record: &ErrorRecord);
}

impl<F> Notifier for F
where
    F: Fn(&ErrorRecord) + Send + Sync,
{
    fn notify(&self, record: &ErrorRecord) {
        self(record)
    }
}

/// Notifier that logs through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, record: &ErrorRecord) {
        warn!(
            instance_id = %record.instance_id,
            category = %record.category,
            "Non-recoverable widget error: {}",
            record.message
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{ErrorCategory, ErrorReport};
    use crate::widget::{Geometry, InstanceId, Placement, WidgetCategory};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn instance() -> WidgetInstance {
        WidgetInstance::new(
            InstanceId::from("w1"),
            "counter".into(),
            Placement::section("hero"),
            Geometry::default(),
            json!({"title": "Count"}),
        )
    }

    #[test]
    fn test_host_error_builders() {
        let err = HostError::new("timeout").with_stack("at fetch()");
        assert!(err.recoverable);
        assert_eq!(err.stack.as_deref(), Some("at fetch()"));
        assert_eq!(err.to_string(), "timeout");
        assert!(!HostError::fatal("bad").recoverable);
    }

    #[test]
    fn test_fetch_response_success() {
        assert!(FetchResponse::ok(json!({})).is_success());
        assert!(FetchResponse::with_status(204, Value::Null).is_success());
        assert!(!FetchResponse::with_status(404, Value::Null).is_success());
        assert!(!FetchResponse::with_status(500, Value::Null).is_success());
    }

    #[test]
    fn test_closure_renderer() {
        let renderer = |instance: &WidgetInstance| json!({"text": instance.config["title"]});
        assert_eq!(renderer.render(&instance()), json!({"text": "Count"}));
    }

    #[test]
    fn test_closure_notifier() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let notifier = move |_: &ErrorRecord| {
            counter.fetch_add(1, Ordering::SeqCst);
        };

        let record = ErrorRecord::from_report(ErrorReport::new(
            "w1",
            ErrorCategory::Render,
            "boom",
        ));
        notifier.notify(&record);
        TracingNotifier.notify(&record);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_noop_driver() {
        let widget = WidgetType::new("counter", "Counter", WidgetCategory::Display);
        let instance = instance();
        assert!(NoopDriver.mount(&instance, &widget).await.is_ok());
        assert!(NoopDriver.refresh(&instance, &widget).await.is_ok());
        NoopDriver.unmount(&instance).await;
    }
}
