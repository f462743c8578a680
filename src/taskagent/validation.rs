use serde_json::Value;
use std::fmt;
use tracing::warn;

use crate::core::errors::{CoordError, FieldError, Result};

/// Result of checking one payload
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    /// The value to hand on, possibly normalised by the validator
    Valid(Value),
    Invalid(Vec<FieldError>),
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationOutcome::Valid(_))
    }
}

/// `validate(input) -> typed value | errors`
pub trait Validator: Send + Sync {
    fn validate(&self, input: &Value) -> ValidationOutcome;
}

impl<F> Validator for F
where
    F: Fn(&Value) -> ValidationOutcome + Send + Sync,
{
    fn validate(&self, input: &Value) -> ValidationOutcome {
        self(input)
    }
}

/// Validator compiled from a JSON Schema document
pub struct JsonSchemaValidator {
    schema: Value,
    compiled: jsonschema::Validator,
}

impl JsonSchemaValidator {
    pub fn new(schema: Value) -> Result<Self> {
        let compiled = jsonschema::validator_for(&schema).map_err(|e| {
            CoordError::configuration_field(format!("Failed to compile schema: {}", e), "schema")
        })?;
        Ok(Self { schema, compiled })
    }

    pub fn schema(&self) -> &Value {
        &self.schema
    }
}

impl fmt::Debug for JsonSchemaValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonSchemaValidator")
            .field("schema", &self.schema)
            .finish()
    }
}

impl Validator for JsonSchemaValidator {
    fn validate(&self, input: &Value) -> ValidationOutcome {
        let errors: Vec<FieldError> = self
            .compiled
            .iter_errors(input)
            .map(|e| FieldError::new(e.instance_path.to_string(), e.to_string()))
            .collect();

        if errors.is_empty() {
            ValidationOutcome::Valid(input.clone())
        } else {
            warn!("Schema validation failed with {} error(s)", errors.len());
            ValidationOutcome::Invalid(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn prompt_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {"type": "string"},
                "max_words": {"type": "integer", "minimum": 1}
            },
            "required": ["prompt"]
        })
    }

    #[test]
    fn test_valid_input_passes_through() {
        let validator = JsonSchemaValidator::new(prompt_schema()).unwrap();
        let input = json!({"prompt": "write a tagline", "max_words": 8});
        assert_eq!(validator.validate(&input), ValidationOutcome::Valid(input));
    }

    #[test]
    fn test_errors_point_at_fields() {
        let validator = JsonSchemaValidator::new(prompt_schema()).unwrap();
        let outcome = validator.validate(&json!({"prompt": "x", "max_words": 0}));
        match outcome {
            ValidationOutcome::Invalid(errors) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].path, "/max_words");
            }
            other => panic!("expected invalid, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_schema_is_a_configuration_error() {
        let err = JsonSchemaValidator::new(json!({"type": "string", "pattern": "(unclosed"})).unwrap_err();
        assert!(matches!(err, CoordError::Configuration { .. }));
    }

    #[test]
    fn test_closure_validator() {
        let non_null = |v: &Value| {
            if v.is_null() {
                ValidationOutcome::Invalid(vec![FieldError::new("", "input is null")])
            } else {
                ValidationOutcome::Valid(v.clone())
            }
        };
        assert!(!non_null.validate(&Value::Null).is_valid());
        assert!(non_null.validate(&json!(1)).is_valid());
    }
}
