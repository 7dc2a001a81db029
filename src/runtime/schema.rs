//! Flat field-to-type schema validation for skill I/O.
//!
//! Schemas are JSON objects mapping field names to type tags
//! (`{"title": "str", "count": "int"}`). Values are validated for
//! presence and type; extra fields pass through untouched, matching the
//! permissive model validation the generated skills use themselves.

use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

use crate::error::{KilnError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Str,
    Int,
    Float,
    Bool,
    List,
    Dict,
    Any,
}

impl FieldType {
    fn parse(tag: &str) -> Result<Self> {
        match tag {
            "str" | "string" => Ok(Self::Str),
            "int" | "integer" => Ok(Self::Int),
            "float" | "number" => Ok(Self::Float),
            "bool" | "boolean" => Ok(Self::Bool),
            "list" | "array" => Ok(Self::List),
            "dict" | "object" => Ok(Self::Dict),
            "any" => Ok(Self::Any),
            other => Err(KilnError::InvalidInput(format!(
                "unknown schema type tag '{other}'"
            ))),
        }
    }

    fn accepts(&self, value: &JsonValue) -> bool {
        match self {
            Self::Str => value.is_string(),
            Self::Int => value.is_i64() || value.is_u64(),
            Self::Float => value.is_number(),
            Self::Bool => value.is_boolean(),
            Self::List => value.is_array(),
            Self::Dict => value.is_object(),
            Self::Any => true,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Str => "str",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::List => "list",
            Self::Dict => "dict",
            Self::Any => "any",
        }
    }
}

/// A parsed flat schema.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimpleSchema {
    fields: BTreeMap<String, FieldType>,
}

impl SimpleSchema {
    /// Parse a schema from its JSON text.
    pub fn parse(json: &str) -> Result<Self> {
        let value: JsonValue = serde_json::from_str(json)
            .map_err(|err| KilnError::InvalidInput(format!("schema is not valid JSON: {err}")))?;
        let Some(object) = value.as_object() else {
            return Err(KilnError::InvalidInput(
                "schema must be a JSON object".to_string(),
            ));
        };

        let mut fields = BTreeMap::new();
        for (name, tag) in object {
            let Some(tag) = tag.as_str() else {
                return Err(KilnError::InvalidInput(format!(
                    "schema field '{name}' must map to a type tag string"
                )));
            };
            fields.insert(name.clone(), FieldType::parse(tag)?);
        }
        Ok(Self { fields })
    }

    /// Validate a JSON value against the schema.
    pub fn validate(&self, value: &JsonValue) -> Result<()> {
        let Some(object) = value.as_object() else {
            return Err(KilnError::InvalidInput("expected a JSON object".to_string()));
        };

        let mut problems = Vec::new();
        for (name, field_type) in &self.fields {
            match object.get(name) {
                None => problems.push(format!("missing field '{name}'")),
                Some(v) if !field_type.accepts(v) => {
                    problems.push(format!("field '{name}' is not a {}", field_type.label()));
                }
                Some(_) => {}
            }
        }
        if !problems.is_empty() {
            return Err(KilnError::InvalidInput(problems.join("; ")));
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
