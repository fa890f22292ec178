//! Property-based tests for configuration validation.
//!
//! Validation must report one violation per broken field, whatever the
//! number and position of the broken fields.

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::{Map, Value};

    use crate::schema::{ConfigSchema, FieldConstraint, FieldSpec, FieldType, ValidationError};

    fn schema_with(count: usize) -> ConfigSchema {
        ConfigSchema::new(
            (0..count)
                .map(|i| {
                    FieldSpec::new(format!("field_{}", i), FieldType::Integer)
                        .with_constraint(FieldConstraint::Max(100.0))
                })
                .collect(),
        )
    }

    // Each field is valid, missing, mistyped, or out of range
    fn field_state() -> impl Strategy<Value = u8> {
        0u8..4
    }

    proptest! {
        /// Every independently broken field produces exactly one violation.
        #[test]
        fn violations_match_broken_fields(states in prop::collection::vec(field_state(), 1..12)) {
            let schema = schema_with(states.len());
            let mut config = Map::new();
            let mut broken = Vec::new();

            for (i, state) in states.iter().enumerate() {
                let name = format!("field_{}", i);
                match state {
                    0 => {
                        config.insert(name, Value::from(i as u64));
                    }
                    1 => broken.push(name),
                    2 => {
                        config.insert(name.clone(), Value::from("not a number"));
                        broken.push(name);
                    }
                    _ => {
                        config.insert(name.clone(), Value::from(1_000 + i as u64));
                        broken.push(name);
                    }
                }
            }

            match schema.validate(&Value::Object(config)) {
                Ok(()) => prop_assert!(broken.is_empty()),
                Err(errors) => {
                    prop_assert_eq!(errors.len(), broken.len());
                    let reported: Vec<String> = errors
                        .iter()
                        .filter_map(ValidationError::field)
                        .map(str::to_string)
                        .collect();
                    prop_assert_eq!(reported, broken);
                }
            }
        }

        /// Applying defaults never removes keys that were already present.
        #[test]
        fn defaults_preserve_existing_keys(value in 0i64..1_000) {
            let schema = ConfigSchema::new(vec![
                FieldSpec::new("columns", FieldType::Integer).with_default(3),
                FieldSpec::new("title", FieldType::String).with_default("Untitled"),
            ]);

            let merged = schema.apply_defaults(&serde_json::json!({ "columns": value }));
            prop_assert_eq!(&merged["columns"], &Value::from(value));
            prop_assert_eq!(&merged["title"], &Value::from("Untitled"));
        }
    }
}
