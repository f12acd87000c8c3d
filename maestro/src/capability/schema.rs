//! Capability-agnostic schema descriptions.
//!
//! A `SchemaDef` wraps a JSON Schema document together with its compiled
//! validator, so callers describe the shape they want (named fields with
//! types and optional descriptions) without committing the rest of the
//! engine to any particular validation library.

use std::fmt;
use std::sync::Arc;

use jsonschema::JSONSchema;
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("invalid schema document: {0}")]
    Compile(String),
}

/// Validation failure with the offending paths and messages joined.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("schema validation failed: {0}")]
pub struct ValidationFailure(pub String);

/// Primitive field kinds usable in a field-list schema description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl FieldKind {
    fn json_type(self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Integer => "integer",
            FieldKind::Boolean => "boolean",
            FieldKind::Array => "array",
            FieldKind::Object => "object",
        }
    }
}

/// One named field of an object schema.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    pub description: Option<String>,
    pub required: bool,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            description: None,
            required: true,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// A named, compiled schema description.
#[derive(Clone)]
pub struct SchemaDef {
    name: String,
    document: JsonValue,
    compiled: Arc<JSONSchema>,
}

impl SchemaDef {
    /// Wrap an existing JSON Schema document. The document gets a `title`
    /// equal to `name` when it has none, so handlers can identify the shape
    /// they are asked for.
    pub fn new(name: impl Into<String>, mut document: JsonValue) -> Result<Self, SchemaError> {
        let name = name.into();
        if let Some(obj) = document.as_object_mut() {
            obj.entry("title".to_string())
                .or_insert_with(|| JsonValue::String(name.clone()));
        }
        let compiled = JSONSchema::compile(&document)
            .map_err(|e| SchemaError::Compile(e.to_string()))?;
        Ok(Self {
            name,
            document,
            compiled: Arc::new(compiled),
        })
    }

    /// Build an object schema from a list of field definitions.
    pub fn object(name: impl Into<String>, fields: Vec<FieldDef>) -> Result<Self, SchemaError> {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for field in fields {
            let mut prop = Map::new();
            prop.insert(
                "type".to_string(),
                JsonValue::String(field.kind.json_type().to_string()),
            );
            if let Some(desc) = field.description {
                prop.insert("description".to_string(), JsonValue::String(desc));
            }
            if field.required {
                required.push(JsonValue::String(field.name.clone()));
            }
            properties.insert(field.name, JsonValue::Object(prop));
        }
        let document = json!({
            "type": "object",
            "properties": properties,
            "required": required,
        });
        Self::new(name, document)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn document(&self) -> &JsonValue {
        &self.document
    }

    /// Validate a value, collecting every violation into one failure.
    pub fn validate(&self, value: &JsonValue) -> Result<(), ValidationFailure> {
        match self.compiled.validate(value) {
            Ok(()) => Ok(()),
            Err(errors) => {
                let detail = errors
                    .map(|e| format!("{} at {}", e, e.instance_path))
                    .collect::<Vec<_>>()
                    .join("; ");
                Err(ValidationFailure(detail))
            }
        }
    }

    /// Compact textual rendering for inclusion in prompts.
    pub fn describe(&self) -> String {
        serde_json::to_string_pretty(&self.document).unwrap_or_else(|_| self.document.to_string())
    }
}

impl fmt::Debug for SchemaDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaDef")
            .field("name", &self.name)
            .field("document", &self.document)
            .finish()
    }
}
