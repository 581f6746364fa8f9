//! Schema definition and validation.
//!
//! Every insert and update is passed through the collection's
//! [`SchemaValidator`] before it reaches a transaction. The validator may
//! transform the candidate (for example by filling defaults); the returned
//! value is what gets stored.

use crate::error::ValidationIssue;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Validates candidate items for a collection.
pub trait SchemaValidator: Send + Sync {
    /// Return the (possibly transformed) value, or every issue found.
    fn validate(&self, candidate: &Value) -> Result<Value, Vec<ValidationIssue>>;
}

impl<F> SchemaValidator for F
where
    F: Fn(&Value) -> Result<Value, Vec<ValidationIssue>> + Send + Sync,
{
    fn validate(&self, candidate: &Value) -> Result<Value, Vec<ValidationIssue>> {
        self(candidate)
    }
}

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    /// Milliseconds since the epoch or an RFC 3339 string
    Timestamp,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FieldType::String => "string",
            FieldType::Int => "int",
            FieldType::Float => "float",
            FieldType::Bool => "bool",
            FieldType::Timestamp => "timestamp",
            FieldType::Json => "json",
        };
        f.write_str(name)
    }
}

/// Definition of a field in a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: FieldType,
    /// Whether this field is required
    pub required: bool,
    /// Value used when the field is absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
            default: None,
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            default: None,
        }
    }

    /// Fill the field with `value` when it is missing.
    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    /// Validate a JSON value against this field definition.
    pub fn validate(&self, value: Option<&Value>) -> Result<(), ValidationIssue> {
        match value {
            None | Some(Value::Null) if self.required => Err(ValidationIssue::new(
                &self.name,
                "missing required field",
            )),
            None | Some(Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &Value) -> Result<(), ValidationIssue> {
        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => {
                value.is_u64()
                    || value.is_i64()
                    || value
                        .as_str()
                        .is_some_and(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok())
            }
            FieldType::Json => true,
        };

        if valid {
            Ok(())
        } else {
            Err(ValidationIssue::new(
                &self.name,
                format!(
                    "expected {}, got {}",
                    self.field_type,
                    json_type_name(value)
                ),
            ))
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "int",
        Value::Number(_) => "float",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Field-list schema for a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSchema {
    /// Field definitions
    pub fields: Vec<FieldDef>,
    /// Reject fields that are not declared
    #[serde(default)]
    pub strict: bool,
}

impl CollectionSchema {
    /// Create a new collection schema.
    pub fn new(fields: Vec<FieldDef>) -> Self {
        Self {
            fields,
            strict: false,
        }
    }

    /// Reject undeclared fields.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    fn check(&self, obj: &Map<String, Value>) -> Vec<ValidationIssue> {
        let mut issues: Vec<_> = self
            .fields
            .iter()
            .filter_map(|field| field.validate(obj.get(&field.name)).err())
            .collect();

        if self.strict {
            for name in obj.keys() {
                if !self.fields.iter().any(|f| &f.name == name) {
                    issues.push(ValidationIssue::new(name, "unknown field"));
                }
            }
        }
        issues
    }
}

impl SchemaValidator for CollectionSchema {
    fn validate(&self, candidate: &Value) -> Result<Value, Vec<ValidationIssue>> {
        let obj = candidate
            .as_object()
            .ok_or_else(|| vec![ValidationIssue::new("", "payload must be an object")])?;

        let mut out = obj.clone();
        for field in &self.fields {
            if let Some(default) = &field.default {
                if out.get(&field.name).map_or(true, Value::is_null) {
                    out.insert(field.name.clone(), default.clone());
                }
            }
        }

        let issues = self.check(&out);
        if issues.is_empty() {
            Ok(Value::Object(out))
        } else {
            Err(issues)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_schema() -> CollectionSchema {
        CollectionSchema::new(vec![
            FieldDef::required("name", FieldType::String),
            FieldDef::required("age", FieldType::Int),
            FieldDef::optional("email", FieldType::String),
        ])
    }

    #[test]
    fn validate_valid_payload() {
        let schema = test_schema();

        let payload = json!({"name": "Alice", "age": 30});
        assert_eq!(schema.validate(&payload), Ok(payload.clone()));

        let payload_with_optional = json!({"name": "Bob", "age": 25, "email": "bob@example.com"});
        assert!(schema.validate(&payload_with_optional).is_ok());
    }

    #[test]
    fn validate_missing_required_field() {
        let schema = test_schema();

        let result = schema.validate(&json!({"name": "Alice"}));
        let issues = result.unwrap_err();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].path, "age");
    }

    #[test]
    fn validate_wrong_type() {
        let schema = test_schema();

        let issues = schema
            .validate(&json!({"name": "Alice", "age": "thirty"}))
            .unwrap_err();
        assert_eq!(issues[0].path, "age");
        assert_eq!(issues[0].message, "expected int, got string");
    }

    #[test]
    fn validate_null_required_field() {
        let schema = test_schema();

        let issues = schema.validate(&json!({"name": null, "age": 30})).unwrap_err();
        assert_eq!(issues[0].path, "name");
    }

    #[test]
    fn reports_every_issue() {
        let schema = test_schema();

        let issues = schema.validate(&json!({"email": 5})).unwrap_err();
        let paths: Vec<_> = issues.iter().map(|i| i.path.as_str()).collect();
        assert_eq!(paths, vec!["name", "age", "email"]);
    }

    #[test]
    fn non_object_payload() {
        let issues = test_schema().validate(&json!([1, 2])).unwrap_err();
        assert_eq!(issues[0].message, "payload must be an object");
    }

    #[test]
    fn defaults_are_filled() {
        let schema = CollectionSchema::new(vec![
            FieldDef::required("title", FieldType::String),
            FieldDef::required("done", FieldType::Bool).with_default(json!(false)),
        ]);

        let out = schema.validate(&json!({"title": "write docs"})).unwrap();
        assert_eq!(out, json!({"title": "write docs", "done": false}));
    }

    #[test]
    fn strict_rejects_unknown_fields() {
        let schema = test_schema().strict();
        let issues = schema
            .validate(&json!({"name": "A", "age": 1, "nickname": "a"}))
            .unwrap_err();
        assert_eq!(issues[0].path, "nickname");
    }

    #[test]
    fn timestamps_accept_rfc3339() {
        let schema = CollectionSchema::new(vec![FieldDef::required("at", FieldType::Timestamp)]);
        assert!(schema.validate(&json!({"at": 1706745600000u64})).is_ok());
        assert!(schema.validate(&json!({"at": "2024-02-01T00:00:00Z"})).is_ok());
        assert!(schema.validate(&json!({"at": "yesterday"})).is_err());
    }

    #[test]
    fn closures_are_validators() {
        let validator = |v: &Value| {
            if v.get("id").is_some() {
                Ok(v.clone())
            } else {
                Err(vec![ValidationIssue::new("id", "required")])
            }
        };
        assert!(validator.validate(&json!({"id": 1})).is_ok());
        assert!(SchemaValidator::validate(&validator, &json!({})).is_err());
    }

    #[test]
    fn display_matches_serialized_name() {
        for ty in [FieldType::String, FieldType::Timestamp, FieldType::Json] {
            assert_eq!(serde_json::to_value(ty).unwrap(), json!(ty.to_string()));
        }
    }

    #[test]
    fn schema_serialization() {
        let schema = test_schema();
        let json = serde_json::to_string(&schema).unwrap();
        let parsed: CollectionSchema = serde_json::from_str(&json).unwrap();
        assert_eq!(schema, parsed);
    }
}
