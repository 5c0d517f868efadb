//! Typed field schemas for workflow input and output.

use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

use crate::error::WorkflowError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    Any,
}

impl FieldType {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
            FieldType::Any => true,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Array => "array",
            FieldType::Object => "object",
            FieldType::Any => "any",
        }
    }
}

type Validator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

#[derive(Clone)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
    pub default: Option<Value>,
    pub allowed: Option<Vec<Value>>,
    validator: Option<Validator>,
}

impl fmt::Debug for FieldSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldSpec")
            .field("name", &self.name)
            .field("field_type", &self.field_type)
            .field("required", &self.required)
            .field("default", &self.default)
            .field("allowed", &self.allowed)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

impl FieldSpec {
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
            default: None,
            allowed: None,
            validator: None,
        }
    }

    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            required: false,
            ..Self::required(name, field_type)
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn one_of(mut self, allowed: Vec<Value>) -> Self {
        self.allowed = Some(allowed);
        self
    }

    pub fn validate_with<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    fn check(&self, value: &Value) -> Result<(), String> {
        if !self.field_type.accepts(value) {
            return Err(format!(
                "field '{}' must be of type {}",
                self.name,
                self.field_type.as_str()
            ));
        }
        if let Some(allowed) = &self.allowed {
            if !allowed.contains(value) {
                return Err(format!("field '{}' has a value outside the allowed set", self.name));
            }
        }
        if let Some(validator) = &self.validator {
            validator(value).map_err(|e| format!("field '{}': {}", self.name, e))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Schema {
    fields: Vec<FieldSpec>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.fields.push(spec);
        self
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Checks `value` against the schema and fills in defaults. Fields the
    /// schema does not declare pass through untouched.
    pub fn validate(&self, value: &Value) -> Result<Value, WorkflowError> {
        let mut out = self.as_object(value)?.clone();
        self.apply(&mut out)?;
        Ok(Value::Object(out))
    }

    /// Like [`validate`](Self::validate) but keeps only declared fields.
    pub fn project(&self, value: &Value) -> Result<Value, WorkflowError> {
        let source = self.as_object(value)?;
        let mut out = Map::new();
        for spec in &self.fields {
            if let Some(v) = source.get(&spec.name) {
                out.insert(spec.name.clone(), v.clone());
            }
        }
        self.apply(&mut out)?;
        Ok(Value::Object(out))
    }

    fn as_object<'a>(&self, value: &'a Value) -> Result<&'a Map<String, Value>, WorkflowError> {
        value
            .as_object()
            .ok_or_else(|| WorkflowError::Validation("expected an object".to_string()))
    }

    fn apply(&self, out: &mut Map<String, Value>) -> Result<(), WorkflowError> {
        let mut errors = Vec::new();
        for spec in &self.fields {
            match out.get(&spec.name) {
                Some(Value::Null) | None => {
                    if let Some(default) = &spec.default {
                        out.insert(spec.name.clone(), default.clone());
                    } else if spec.required {
                        errors.push(format!("missing required field '{}'", spec.name));
                    }
                }
                Some(v) => {
                    if let Err(e) = spec.check(v) {
                        errors.push(e);
                    }
                }
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(WorkflowError::Validation(errors.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Schema {
        Schema::new()
            .field(FieldSpec::required("text", FieldType::String))
            .field(FieldSpec::optional("limit", FieldType::Integer).with_default(json!(10)))
            .field(
                FieldSpec::optional("tone", FieldType::String)
                    .one_of(vec![json!("formal"), json!("casual")]),
            )
    }

    #[test]
    fn test_defaults_applied_and_extras_kept() {
        let out = schema().validate(&json!({"text": "hi", "extra": 1})).unwrap();
        assert_eq!(out, json!({"text": "hi", "limit": 10, "extra": 1}));
    }

    #[test]
    fn test_missing_required_field() {
        let err = schema().validate(&json!({})).unwrap_err();
        assert!(err.to_string().contains("missing required field 'text'"));
    }

    #[test]
    fn test_type_and_allowed_values() {
        assert!(schema().validate(&json!({"text": 5})).is_err());
        assert!(schema().validate(&json!({"text": "a", "tone": "rude"})).is_err());
        assert!(schema().validate(&json!({"text": "a", "tone": "casual"})).is_ok());
    }

    #[test]
    fn test_custom_validator() {
        let schema = Schema::new().field(
            FieldSpec::required("score", FieldType::Number).validate_with(|v| {
                match v.as_f64() {
                    Some(s) if (0.0..=1.0).contains(&s) => Ok(()),
                    _ => Err("must be within 0..1".to_string()),
                }
            }),
        );
        assert!(schema.validate(&json!({"score": 0.5})).is_ok());
        let err = schema.validate(&json!({"score": 3})).unwrap_err();
        assert!(err.to_string().contains("must be within 0..1"));
    }

    #[test]
    fn test_project_keeps_declared_fields_only() {
        let out = schema().project(&json!({"text": "a", "noise": true})).unwrap();
        assert_eq!(out, json!({"text": "a", "limit": 10}));
    }

    #[test]
    fn test_non_object_rejected() {
        assert!(matches!(
            schema().validate(&json!("text")),
            Err(WorkflowError::Validation(_))
        ));
    }
}
