//! Configuration schemas for widget types.
//!
//! Every widget type carries a [`ConfigSchema`]: a structural validator that
//! turns a JSON configuration into a list of field-level violations. The
//! validator is independent of any widget implementation; widgets only
//! declare their fields.
//!
//! # Example
//!
//! ```rust,ignore
//! use widget_core::schema::WidgetConfig;
//!
//! #[derive(WidgetConfig)]
//! #[widget_config(strict)]
//! struct CountdownConfig {
//!     #[field(desc = "Heading shown above the timer", max_len = 40)]
//!     title: String,
//!     #[field(desc = "Show seconds", default = "true")]
//!     show_seconds: Option<bool>,
//! }
//!
//! let schema = CountdownConfig::schema();
//! ```

mod proptest;
pub mod types;
pub mod validation;

pub use types::{ConfigSchema, FieldConstraint, FieldSpec, FieldType};
pub use validation::{
    apply_defaults, check_constraints, merge_objects, validate_fields, validate_value,
    ValidationError, ValidationResult,
};

use serde_json::Value;

// Re-export derive macro
pub use widget_core_derive::WidgetConfig;

/// Types that describe a widget configuration schema.
///
/// Usually implemented with `#[derive(WidgetConfig)]`.
pub trait WidgetConfig {
    /// The schema for this configuration type.
    fn schema() -> ConfigSchema;
}

/// Read a default written as JSON text. Text that is not JSON becomes a string.
pub fn parse_default(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_parse_default() {
        assert_eq!(parse_default("3"), json!(3));
        assert_eq!(parse_default("true"), json!(true));
        assert_eq!(parse_default("\"grid\""), json!("grid"));
        assert_eq!(parse_default("grid"), json!("grid"));
        assert_eq!(parse_default("[1, 2]"), json!([1, 2]));
    }

    #[test]
    fn test_derived_schema() {
        #[derive(WidgetConfig)]
        #[widget_config(strict)]
        #[allow(dead_code)]
        struct RsvpConfig {
            #[field(desc = "Form heading", max_len = 40)]
            title: String,
            #[field(default = "50", min = 1, max = 500)]
            capacity: Option<u32>,
            #[field(enum_values = "open,closed", default = "open")]
            state: Option<String>,
        }

        let schema = RsvpConfig::schema();
        assert!(schema.strict);
        assert_eq!(schema.fields.len(), 3);
        assert_eq!(schema.defaults().get("capacity"), Some(&json!(50)));
        assert_eq!(schema.defaults().get("state"), Some(&json!("open")));

        assert!(schema.validate(&json!({"title": "RSVP"})).is_ok());
        let errors = schema
            .validate(&json!({"capacity": 0, "state": "maybe", "extra": 1}))
            .unwrap_err();
        assert_eq!(errors.len(), 4);
    }
}
