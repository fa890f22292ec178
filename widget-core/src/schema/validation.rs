//! Validation of configuration values against a [`ConfigSchema`].
//!
//! Validation never stops at the first problem: every violated field is
//! reported so the template builder can highlight all of them at once.

use super::types::{ConfigSchema, FieldConstraint, FieldSpec, FieldType};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{LazyLock, PoisonError, RwLock};

/// Compiled `pattern` constraints, keyed by source. Invalid patterns keep their error.
static PATTERNS: LazyLock<RwLock<HashMap<String, Result<Regex, String>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Compile a pattern once per process.
fn compiled_pattern(pattern: &str) -> Result<Regex, String> {
    if let Some(cached) = PATTERNS
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(pattern)
    {
        return cached.clone();
    }
    let compiled = Regex::new(pattern).map_err(|e| e.to_string());
    PATTERNS
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .entry(pattern.to_string())
        .or_insert(compiled)
        .clone()
}

/// A single field-level schema violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "error_type", rename_all = "snake_case")]
pub enum ValidationError {
    /// A required configuration key is absent.
    MissingField {
        /// Key that is missing
        field: String,
        /// Declared type
        expected_type: FieldType,
    },

    /// Value has a different JSON type than declared.
    TypeMismatch {
        /// Name of the field
        field: String,
        /// Expected type
        expected: FieldType,
        /// JSON type that was found
        got: String,
        /// Shortened rendering of the value
        value_preview: String,
    },

    /// Value is not one of the allowed enum members.
    EnumInvalid {
        /// Name of the field
        field: String,
        /// Rejected value
        value: String,
        /// Enum members
        allowed: Vec<String>,
    },

    /// A value constraint was violated.
    ConstraintViolated {
        /// Name of the field
        field: String,
        /// Human-readable form of the constraint
        constraint: String,
    },

    /// Key not declared by a strict schema.
    UnknownField {
        /// The undeclared key
        field: String,
    },

    /// Violation inside a nested object or list item.
    NestedError {
        /// Path to the nested field (e.g., "venue.address.city")
        path: String,
        /// Violation at that path
        error: Box<ValidationError>,
    },

    /// Free-form violation, e.g. a non-object configuration.
    Custom(String),
}

impl ValidationError {
    /// Violation for an absent required key.
    pub fn missing_field(field: impl Into<String>, expected_type: FieldType) -> Self {
        Self::MissingField {
            field: field.into(),
            expected_type,
        }
    }

    /// Violation for a value of the wrong JSON type.
    pub fn type_mismatch(field: impl Into<String>, expected: FieldType, value: &Value) -> Self {
        Self::TypeMismatch {
            field: field.into(),
            expected,
            got: value_type_name(value),
            value_preview: truncate_preview(&value.to_string(), 100),
        }
    }

    /// Violation for a value outside an enum.
    pub fn enum_invalid(
        field: impl Into<String>,
        value: impl Into<String>,
        allowed: Vec<String>,
    ) -> Self {
        Self::EnumInvalid {
            field: field.into(),
            value: value.into(),
            allowed,
        }
    }

    /// Violation of a [`FieldConstraint`](super::FieldConstraint).
    pub fn constraint_violated(field: impl Into<String>, constraint: impl Into<String>) -> Self {
        Self::ConstraintViolated {
            field: field.into(),
            constraint: constraint.into(),
        }
    }

    /// Prefix the violation with the enclosing key.
    pub fn with_path(self, parent: impl Into<String>) -> Self {
        let parent = parent.into();
        match self {
            Self::NestedError { path, error } => Self::NestedError {
                path: format!("{}.{}", parent, path),
                error,
            },
            other => Self::NestedError {
                path: parent,
                error: Box::new(other),
            },
        }
    }

    /// Name of the top-level field this violation belongs to.
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::MissingField { field, .. }
            | Self::TypeMismatch { field, .. }
            | Self::EnumInvalid { field, .. }
            | Self::ConstraintViolated { field, .. }
            | Self::UnknownField { field } => Some(field.as_str()),
            Self::NestedError { path, .. } => path.split('.').next(),
            Self::Custom(_) => None,
        }
    }

    /// Message suitable for the template builder UI.
    pub fn to_user_message(&self) -> String {
        match self {
            Self::MissingField {
                field,
                expected_type,
            } => format!(
                "Missing required field '{}' (expected {})",
                field,
                expected_type.type_hint()
            ),
            Self::TypeMismatch {
                field,
                expected,
                got,
                value_preview,
            } => format!(
                "Field '{}' has wrong type: expected {}, got {} (value: {})",
                field,
                expected.type_hint(),
                got,
                value_preview
            ),
            Self::EnumInvalid {
                field,
                value,
                allowed,
            } => format!(
                "Field '{}' has invalid value '{}'. Allowed values: {}",
                field,
                value,
                allowed.join(", ")
            ),
            Self::ConstraintViolated { field, constraint } => {
                format!("Field '{}' violates constraint: {}", field, constraint)
            }
            Self::UnknownField { field } => format!("Unknown field '{}'", field),
            Self::NestedError { path, error } => {
                format!("At '{}': {}", path, error.to_user_message())
            }
            Self::Custom(msg) => msg.clone(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_user_message())
    }
}

impl std::error::Error for ValidationError {}

/// Result of validating a value; the error side carries every violation.
pub type ValidationResult = Result<(), Vec<ValidationError>>;

impl ConfigSchema {
    /// Validate a configuration object against this schema.
    ///
    /// # Example
    ///
    /// ```
    /// use widget_core::schema::{ConfigSchema, FieldSpec, FieldType};
    /// use serde_json::json;
    ///
    /// let schema = ConfigSchema::new(vec![
    ///     FieldSpec::new("title", FieldType::String),
    ///     FieldSpec::new("columns", FieldType::Integer).optional(),
    /// ]);
    ///
    /// assert!(schema.validate(&json!({"title": "Gallery"})).is_ok());
    /// assert_eq!(schema.validate(&json!({"columns": "two"})).unwrap_err().len(), 2);
    /// ```
    pub fn validate(&self, value: &Value) -> ValidationResult {
        let obj = match value.as_object() {
            Some(obj) => obj,
            None => {
                return Err(vec![ValidationError::Custom(format!(
                    "Expected a configuration object, got {}",
                    value_type_name(value)
                ))]);
            }
        };

        let mut errors = match validate_fields(value, &self.fields) {
            Ok(()) => Vec::new(),
            Err(errors) => errors,
        };

        if self.strict {
            for key in obj.keys() {
                if self.field(key).is_none() {
                    errors.push(ValidationError::UnknownField { field: key.clone() });
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Return a copy of `value` with schema defaults filled in.
    pub fn apply_defaults(&self, value: &Value) -> Value {
        apply_defaults(value, &self.fields)
    }
}

/// Validate a JSON object against a list of field specifications.
pub fn validate_fields(value: &Value, fields: &[FieldSpec]) -> ValidationResult {
    let obj = match value.as_object() {
        Some(obj) => obj,
        None => {
            return Err(vec![ValidationError::Custom(
                "Expected an object".to_string(),
            )]);
        }
    };

    let mut errors = Vec::new();

    for field in fields {
        match obj.get(&field.name) {
            Some(field_value) => {
                if let Err(e) = validate_value(field_value, &field.field_type, &field.name) {
                    errors.extend(e);
                } else if let Err(e) =
                    check_constraints(field_value, &field.constraints, &field.name)
                {
                    errors.extend(e);
                }
            }
            None => {
                if field.required {
                    errors.push(ValidationError::missing_field(
                        &field.name,
                        field.field_type.clone(),
                    ));
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Check one value against its declared type, recursing into lists and objects.
pub fn validate_value(value: &Value, field_type: &FieldType, field_name: &str) -> ValidationResult {
    let mut errors = Vec::new();

    match field_type {
        FieldType::String | FieldType::Integer | FieldType::Float | FieldType::Boolean => {
            if !field_type.is_compatible(value) {
                errors.push(ValidationError::type_mismatch(
                    field_name,
                    field_type.clone(),
                    value,
                ));
            }
        }
        FieldType::List(inner) => {
            if let Some(arr) = value.as_array() {
                for (i, item) in arr.iter().enumerate() {
                    let item_path = format!("{}[{}]", field_name, i);
                    if let Err(e) = validate_value(item, inner, &item_path) {
                        errors.extend(e);
                    }
                }
            } else {
                errors.push(ValidationError::type_mismatch(
                    field_name,
                    field_type.clone(),
                    value,
                ));
            }
        }
        FieldType::Object(fields) => {
            if value.is_object() {
                if let Err(e) = validate_fields(value, fields) {
                    for err in e {
                        errors.push(err.with_path(field_name));
                    }
                }
            } else {
                errors.push(ValidationError::type_mismatch(
                    field_name,
                    field_type.clone(),
                    value,
                ));
            }
        }
        FieldType::Enum(allowed) => match value.as_str() {
            Some(s) if allowed.iter().any(|a| a == s) => {}
            Some(s) => errors.push(ValidationError::enum_invalid(
                field_name,
                s,
                allowed.clone(),
            )),
            None => errors.push(ValidationError::type_mismatch(
                field_name,
                field_type.clone(),
                value,
            )),
        },
        FieldType::Custom(_) => {}
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Check value constraints for a field whose type already matched.
pub fn check_constraints(
    value: &Value,
    constraints: &[FieldConstraint],
    field_name: &str,
) -> ValidationResult {
    let mut errors = Vec::new();

    for constraint in constraints {
        let satisfied = match constraint {
            FieldConstraint::Min(min) => value.as_f64().map_or(true, |n| n >= *min),
            FieldConstraint::Max(max) => value.as_f64().map_or(true, |n| n <= *max),
            FieldConstraint::MinLength(len) => value_len(value).map_or(true, |n| n >= *len),
            FieldConstraint::MaxLength(len) => value_len(value).map_or(true, |n| n <= *len),
            FieldConstraint::Pattern(pattern) => match (value.as_str(), compiled_pattern(pattern)) {
                (Some(s), Ok(re)) => re.is_match(s),
                (Some(_), Err(e)) => {
                    errors.push(ValidationError::constraint_violated(
                        field_name,
                        format!("invalid pattern /{}/: {}", pattern, e),
                    ));
                    continue;
                }
                (None, _) => true,
            },
        };

        if !satisfied {
            errors.push(ValidationError::constraint_violated(
                field_name,
                constraint.describe(),
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Fill absent keys that declare a default.
pub fn apply_defaults(value: &Value, fields: &[FieldSpec]) -> Value {
    let mut obj = match value.as_object() {
        Some(obj) => obj.clone(),
        None => return value.clone(),
    };

    for field in fields {
        if !obj.contains_key(&field.name) {
            if let Some(default) = &field.default {
                obj.insert(field.name.clone(), default.clone());
            }
        }
    }

    Value::Object(obj)
}

/// Shallow-merge `overrides` on top of `base`. Non-object overrides win outright.
pub fn merge_objects(base: &Map<String, Value>, overrides: &Value) -> Value {
    match overrides.as_object() {
        Some(over) => {
            let mut merged = base.clone();
            for (key, value) in over {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        None if overrides.is_null() => Value::Object(base.clone()),
        None => overrides.clone(),
    }
}

fn value_len(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(arr) => Some(arr.len()),
        _ => None,
    }
}

/// JSON type name used in messages.
fn value_type_name(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "boolean".to_string(),
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                "integer".to_string()
            } else {
                "number".to_string()
            }
        }
        Value::String(_) => "string".to_string(),
        Value::Array(_) => "array".to_string(),
        Value::Object(_) => "object".to_string(),
    }
}

fn truncate_preview(s: &str, max_len: usize) -> String {
    match s.char_indices().nth(max_len) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
