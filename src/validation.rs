// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Parameter Validation
//!
//! Every provider verb declares a [`Pattern`] describing its parameters. A
//! pattern entry is either required (absent or `null` is rejected) or
//! optional with an optional default filled in when the field is absent.
//! Validation runs on the JSON view of the parameters before any broker I/O.

use crate::errors::ValidationError;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

/// Expected JSON type of a parameter field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    String,
    Object,
    Bool,
    Number,
    Any,
}

impl Kind {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            Kind::String => value.is_string(),
            Kind::Object => value.is_object(),
            Kind::Bool => value.is_boolean(),
            Kind::Number => value.is_number(),
            Kind::Any => true,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Kind::String => "string",
            Kind::Object => "object",
            Kind::Bool => "boolean",
            Kind::Number => "number",
            Kind::Any => "any",
        }
    }
}

/// One entry of a [`Pattern`].
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub(crate) name: &'static str,
    pub(crate) kind: Kind,
    pub(crate) optional: bool,
    pub(crate) default_to: Option<Value>,
}

impl Field {
    /// A field that must be present and non-null.
    pub fn required(name: &'static str, kind: Kind) -> Self {
        Field {
            name,
            kind,
            optional: false,
            default_to: None,
        }
    }

    /// A field that may be absent.
    pub fn optional(name: &'static str, kind: Kind) -> Self {
        Field {
            name,
            kind,
            optional: true,
            default_to: None,
        }
    }

    /// Value used when an optional field is absent.
    pub fn default_to(mut self, value: Value) -> Self {
        self.default_to = Some(value);
        self
    }
}

/// Declared shape of a verb's parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pattern(Vec<Field>);

impl Pattern {
    pub fn new() -> Self {
        Pattern(vec![])
    }

    pub fn field(mut self, field: Field) -> Self {
        self.0.push(field);
        self
    }
}

/// Parameters accepted by a provider verb.
pub trait Params: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn pattern() -> Pattern;
}

/// Checks `input` against `pattern`, returning the input with defaults filled.
///
/// Fields not named by the pattern are passed through untouched.
pub fn validate(input: Value, pattern: &Pattern) -> Result<Value, ValidationError> {
    let Value::Object(mut fields) = input else {
        return Err(ValidationError::NotAnObject);
    };

    for field in &pattern.0 {
        let present = fields.get(field.name).is_some_and(|v| !v.is_null());

        if !present {
            if !field.optional {
                return Err(ValidationError::MissingField(field.name.to_owned()));
            }
            if let Some(default) = &field.default_to {
                fields.insert(field.name.to_owned(), default.clone());
            }
            continue;
        }

        if let Some(value) = fields.get(field.name) {
            if !field.kind.accepts(value) {
                return Err(ValidationError::TypeMismatch {
                    field: field.name.to_owned(),
                    expected: field.kind.name().to_owned(),
                });
            }
        }
    }

    Ok(Value::Object(fields))
}

/// Validates typed parameters through their JSON view.
pub fn check<P: Params>(params: P) -> Result<P, ValidationError> {
    let value = serde_json::to_value(&params).map_err(|_| ValidationError::NotAnObject)?;
    let value = validate(value, &P::pattern())?;

    serde_json::from_value(value).map_err(|err| ValidationError::TypeMismatch {
        field: err.to_string(),
        expected: "declared type".to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn produce_pattern() -> Pattern {
        Pattern::new()
            .field(Field::required("queue", Kind::String))
            .field(Field::required("json", Kind::Object))
            .field(Field::optional("ack", Kind::String).default_to(json!("auto")))
    }

    #[test]
    fn rejects_missing_required_field() {
        let err = validate(json!({ "queue": "q1" }), &produce_pattern()).unwrap_err();
        assert_eq!(err, ValidationError::MissingField("json".to_owned()));
    }

    #[test]
    fn null_counts_as_missing() {
        let err = validate(json!({ "queue": "q1", "json": null }), &produce_pattern()).unwrap_err();
        assert_eq!(err, ValidationError::MissingField("json".to_owned()));
    }

    #[test]
    fn rejects_wrong_type() {
        let err = validate(json!({ "queue": 7, "json": {} }), &produce_pattern()).unwrap_err();
        assert_eq!(
            err,
            ValidationError::TypeMismatch {
                field: "queue".to_owned(),
                expected: "string".to_owned()
            }
        );
    }

    #[test]
    fn fills_defaults_for_absent_optional_fields() {
        let out = validate(json!({ "queue": "q1", "json": { "x": 1 } }), &produce_pattern()).unwrap();
        assert_eq!(out["ack"], json!("auto"));
        assert_eq!(out["json"], json!({ "x": 1 }));
    }

    #[test]
    fn keeps_present_optional_fields() {
        let out = validate(
            json!({ "queue": "q1", "json": {}, "ack": "manual" }),
            &produce_pattern(),
        )
        .unwrap();
        assert_eq!(out["ack"], json!("manual"));
    }

    #[test]
    fn rejects_non_object_input() {
        assert_eq!(
            validate(json!("q1"), &produce_pattern()).unwrap_err(),
            ValidationError::NotAnObject
        );
        assert!(validate(json!({}), &Pattern::new()).is_ok());
    }
}
