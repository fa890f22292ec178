//! Error types for widget-core.

use crate::schema::ValidationError;
use crate::widget::{InstanceId, WidgetStatus, WidgetTypeId};
use thiserror::Error;

/// Result type alias using widget-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced synchronously by orchestrator operations.
///
/// Runtime failures inside mount, refresh and data sync are not errors at
/// this level: they become [`ErrorRecord`](crate::telemetry::ErrorRecord)s
/// and move the instance to the `error` status.
#[derive(Error, Debug)]
pub enum Error {
    /// A widget type with this id is already registered
    #[error("Widget type '{type_id}' is already registered")]
    DuplicateType { type_id: WidgetTypeId },

    /// No widget type with this id is registered
    #[error("Widget type '{type_id}' not found")]
    TypeNotFound { type_id: WidgetTypeId },

    /// No instance with this id exists
    #[error("Widget instance '{instance_id}' not found")]
    InstanceNotFound { instance_id: InstanceId },

    /// Configuration failed schema validation
    #[error("Invalid configuration for '{type_id}': {}", join_violations(.violations))]
    InvalidConfiguration {
        type_id: WidgetTypeId,
        violations: Vec<ValidationError>,
    },

    /// The lifecycle state machine refused a transition
    #[error("Instance '{instance_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        instance_id: InstanceId,
        from: WidgetStatus,
        to: WidgetStatus,
    },

    /// Status changes go through the lifecycle manager, never through updates
    #[error("Instance '{instance_id}' status is {status}; use mount, refresh or disable to change it")]
    StatusLocked {
        instance_id: InstanceId,
        status: WidgetStatus,
    },

    /// Retry refused because the last reported error was not recoverable
    #[error("Instance '{instance_id}' is in an unrecoverable error state")]
    Unrecoverable { instance_id: InstanceId },

    /// The operation needs a ready instance
    #[error("Instance '{instance_id}' is not ready (status: {status})")]
    NotReady {
        instance_id: InstanceId,
        status: WidgetStatus,
    },

    /// A message handler rejected a message
    #[error("Message handler error: {0}")]
    Handler(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a duplicate type error.
    pub fn duplicate_type(type_id: impl Into<WidgetTypeId>) -> Self {
        Self::DuplicateType {
            type_id: type_id.into(),
        }
    }

    /// Create a type not found error.
    pub fn type_not_found(type_id: impl Into<WidgetTypeId>) -> Self {
        Self::TypeNotFound {
            type_id: type_id.into(),
        }
    }

    /// Create an instance not found error.
    pub fn instance_not_found(instance_id: impl Into<InstanceId>) -> Self {
        Self::InstanceNotFound {
            instance_id: instance_id.into(),
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_configuration(
        type_id: impl Into<WidgetTypeId>,
        violations: Vec<ValidationError>,
    ) -> Self {
        Self::InvalidConfiguration {
            type_id: type_id.into(),
            violations,
        }
    }

    /// Create an invalid transition error.
    pub fn invalid_transition(
        instance_id: impl Into<InstanceId>,
        from: WidgetStatus,
        to: WidgetStatus,
    ) -> Self {
        Self::InvalidTransition {
            instance_id: instance_id.into(),
            from,
            to,
        }
    }

    /// Create a handler error.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }

    /// Schema violations carried by this error, if any.
    pub fn violations(&self) -> &[ValidationError] {
        match self {
            Self::InvalidConfiguration { violations, .. } => violations,
            _ => &[],
        }
    }
}

fn join_violations(violations: &[ValidationError]) -> String {
    violations
        .iter()
        .map(|v| v.to_user_message())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldType;

    #[test]
    fn test_invalid_configuration_lists_every_violation() {
        let err = Error::invalid_configuration(
            "counter",
            vec![
                ValidationError::missing_field("title", FieldType::String),
                ValidationError::constraint_violated("step", "must be >= 1"),
            ],
        );

        let message = err.to_string();
        assert!(message.contains("'counter'"));
        assert!(message.contains("Missing required field 'title'"));
        assert!(message.contains("Field 'step' violates constraint"));
        assert_eq!(err.violations().len(), 2);
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = Error::invalid_transition("w1", WidgetStatus::Ready, WidgetStatus::Loading);
        assert_eq!(
            err.to_string(),
            "Instance 'w1' cannot move from ready to loading"
        );
        assert!(err.violations().is_empty());
    }
}
