//! Type definitions for widget configuration schemas.
//!
//! - **FieldSpec**: one configurable field of a widget
//! - **FieldType**: the JSON shape the field must have
//! - **FieldConstraint**: value-level rules layered on top of the type
//! - **ConfigSchema**: the full field list for a widget type

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Specification for one configuration field.
///
/// # Example
///
/// ```
/// use widget_core::schema::{FieldConstraint, FieldSpec, FieldType};
///
/// let field = FieldSpec::new("columns", FieldType::Integer)
///     .with_description("Number of grid columns")
///     .with_constraint(FieldConstraint::Min(1.0))
///     .with_default(3);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Field name (key in the configuration object)
    pub name: String,
    /// Field type for validation
    pub field_type: FieldType,
    /// Human-readable description shown in the template builder
    #[serde(default)]
    pub description: String,
    /// Whether the field must be present after defaults are merged
    pub required: bool,
    /// Default value (JSON) if not required
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Additional value constraints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<FieldConstraint>,
}

impl FieldSpec {
    /// Create a new required field specification.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            description: String::new(),
            required: true,
            default: None,
            constraints: Vec::new(),
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Mark the field as optional.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Set a default value. A field with a default is never missing.
    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self.required = false;
        self
    }

    /// Add a value constraint.
    pub fn with_constraint(mut self, constraint: FieldConstraint) -> Self {
        self.constraints.push(constraint);
        self
    }
}

/// Type of a configuration field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldType {
    /// String value
    #[default]
    String,
    /// Integer value (any size)
    Integer,
    /// Floating point value
    Float,
    /// Boolean value
    Boolean,
    /// List of items of a specific type
    List(Box<FieldType>),
    /// Nested object with fields
    Object(Vec<FieldSpec>),
    /// Enumeration with allowed values
    Enum(Vec<String>),
    /// Custom type (name only, accepts any value)
    Custom(String),
}

impl FieldType {
    /// Create a list type.
    pub fn list(inner: FieldType) -> Self {
        Self::List(Box::new(inner))
    }

    /// Create an object type with fields.
    pub fn object(fields: Vec<FieldSpec>) -> Self {
        Self::Object(fields)
    }

    /// Create an enum type with allowed values.
    pub fn enum_of(values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::Enum(values.into_iter().map(|v| v.into()).collect())
    }

    /// Create a custom type.
    pub fn custom(name: impl Into<String>) -> Self {
        Self::Custom(name.into())
    }

    /// Short name used in validation messages (e.g. "list[string]").
    pub fn type_hint(&self) -> String {
        match self {
            Self::String => "string".to_string(),
            Self::Integer => "integer".to_string(),
            Self::Float => "number".to_string(),
            Self::Boolean => "boolean".to_string(),
            Self::List(inner) => format!("list[{}]", inner.type_hint()),
            Self::Object(_) => "object".to_string(),
            Self::Enum(values) => {
                if values.len() <= 5 {
                    values.join("|")
                } else {
                    format!("one of {} values", values.len())
                }
            }
            Self::Custom(name) => name.clone(),
        }
    }

    /// Check if this type is compatible with a JSON value (shape only).
    pub fn is_compatible(&self, value: &Value) -> bool {
        match (self, value) {
            (Self::String, Value::String(_)) => true,
            (Self::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (Self::Float, Value::Number(_)) => true,
            (Self::Boolean, Value::Bool(_)) => true,
            (Self::List(inner), Value::Array(arr)) => arr.iter().all(|v| inner.is_compatible(v)),
            (Self::Object(fields), Value::Object(obj)) => fields.iter().all(|f| {
                obj.get(&f.name)
                    .map(|v| f.field_type.is_compatible(v))
                    .unwrap_or(!f.required)
            }),
            (Self::Enum(values), Value::String(s)) => values.contains(s),
            (Self::Custom(_), _) => true,
            _ => false,
        }
    }
}

/// Value-level constraint on a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldConstraint {
    /// Numeric lower bound (inclusive)
    Min(f64),
    /// Numeric upper bound (inclusive)
    Max(f64),
    /// Minimum length of a string (chars) or list
    MinLength(usize),
    /// Maximum length of a string (chars) or list
    MaxLength(usize),
    /// Regular expression a string must match
    Pattern(String),
}

impl FieldConstraint {
    /// Describe the constraint for validation messages.
    pub fn describe(&self) -> String {
        match self {
            Self::Min(min) => format!("must be >= {}", min),
            Self::Max(max) => format!("must be <= {}", max),
            Self::MinLength(len) => format!("length must be >= {}", len),
            Self::MaxLength(len) => format!("length must be <= {}", len),
            Self::Pattern(pattern) => format!("must match /{}/", pattern),
        }
    }
}

/// Configuration schema attached to a widget type.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConfigSchema {
    /// Declared fields, in declaration order
    pub fields: Vec<FieldSpec>,
    /// Reject keys that are not declared
    #[serde(default)]
    pub strict: bool,
}

impl ConfigSchema {
    /// Create a schema from fields.
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self {
            fields,
            strict: false,
        }
    }

    /// Schema that accepts any object.
    pub fn permissive() -> Self {
        Self::default()
    }

    /// Reject undeclared keys.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Add a field.
    pub fn with_field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Default values declared by the schema as a JSON object.
    pub fn defaults(&self) -> Map<String, Value> {
        self.fields
            .iter()
            .filter_map(|f| f.default.clone().map(|d| (f.name.clone(), d)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_spec_builder() {
        let field = FieldSpec::new("layout", FieldType::enum_of(["grid", "list"]))
            .with_description("Gallery layout")
            .optional();

        assert_eq!(field.name, "layout");
        assert_eq!(field.description, "Gallery layout");
        assert!(!field.required);
        assert!(field.default.is_none());
    }

    #[test]
    fn test_default_makes_field_optional() {
        let field = FieldSpec::new("columns", FieldType::Integer).with_default(3);
        assert!(!field.required);
        assert_eq!(field.default, Some(json!(3)));
    }

    #[test]
    fn test_type_hints() {
        assert_eq!(FieldType::Float.type_hint(), "number");
        assert_eq!(FieldType::list(FieldType::String).type_hint(), "list[string]");
        assert_eq!(FieldType::enum_of(["a", "b"]).type_hint(), "a|b");
        assert_eq!(
            FieldType::enum_of(["a", "b", "c", "d", "e", "f"]).type_hint(),
            "one of 6 values"
        );
    }

    #[test]
    fn test_compatibility() {
        assert!(FieldType::Integer.is_compatible(&json!(4)));
        assert!(!FieldType::Integer.is_compatible(&json!(4.5)));
        assert!(FieldType::Float.is_compatible(&json!(4)));
        assert!(FieldType::Custom("color".into()).is_compatible(&json!(null)));

        let venue = FieldType::object(vec![
            FieldSpec::new("name", FieldType::String),
            FieldSpec::new("capacity", FieldType::Integer).optional(),
        ]);
        assert!(venue.is_compatible(&json!({"name": "Barn"})));
        assert!(!venue.is_compatible(&json!({"capacity": 120})));
    }

    #[test]
    fn test_schema_defaults() {
        let schema = ConfigSchema::new(vec![
            FieldSpec::new("title", FieldType::String),
            FieldSpec::new("columns", FieldType::Integer).with_default(3),
            FieldSpec::new("theme", FieldType::String).with_default("light"),
        ]);

        let defaults = schema.defaults();
        assert_eq!(defaults.len(), 2);
        assert_eq!(defaults["columns"], json!(3));
        assert!(schema.field("title").is_some());
        assert!(schema.field("missing").is_none());
    }

    #[test]
    fn test_schema_serialization() {
        let schema = ConfigSchema::new(vec![FieldSpec::new("title", FieldType::String)
            .with_constraint(FieldConstraint::MaxLength(40))])
        .strict();

        let json = serde_json::to_string(&schema).unwrap();
        let back: ConfigSchema = serde_json::from_str(&json).unwrap();
        assert_eq!(schema, back);
    }
}
