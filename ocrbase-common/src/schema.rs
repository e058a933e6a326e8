//! Canonical JSON Schema representation for `extract` jobs, and the three
//! ways a caller can build one: a simple flat object description, a raw
//! JSON Schema document, or an externally registered schema looked up by
//! reference.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::BTreeMap;

use crate::error::CollaboratorError;

/// A resolved schema ready to hand to the LLM Adapter. Always draft-07
/// compatible JSON Schema, regardless of which builder produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedSchema {
    pub reference: Option<String>,
    pub document: serde_json::Value,
}

/// A minimal, non-nested field description accepted by the "simple object"
/// shorthand builder: `{"field_name": "type"}` where type is one of the
/// primitive JSON Schema types.
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct SimpleObjectSpec(pub BTreeMap<String, String>);

/// `fromSimpleObject`: expand a flat field->type map into a full object
/// schema with every field marked required, `additionalProperties: false`.
pub fn from_simple_object(spec: &SimpleObjectSpec) -> Result<ResolvedSchema, CollaboratorError> {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();
    for (name, ty) in &spec.0 {
        let json_type = normalize_primitive_type(ty)
            .ok_or_else(|| CollaboratorError::SchemaNotFound(format!("unknown type {ty}")))?;
        properties.insert(name.clone(), serde_json::json!({ "type": json_type }));
        required.push(serde_json::Value::String(name.clone()));
    }
    let document = serde_json::json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false,
    });
    Ok(ResolvedSchema {
        reference: None,
        document,
    })
}

fn normalize_primitive_type(ty: &str) -> Option<&'static str> {
    match ty.to_ascii_lowercase().as_str() {
        "string" | "str" => Some("string"),
        "number" | "float" | "double" => Some("number"),
        "integer" | "int" => Some("integer"),
        "boolean" | "bool" => Some("boolean"),
        "array" | "list" => Some("array"),
        "object" | "dict" => Some("object"),
        _ => None,
    }
}

/// `fromJsonSchema`: accept a raw JSON Schema document as-is, validating
/// only that it is itself well-formed (compiles with the `jsonschema`
/// crate), not that it describes anything in particular.
pub fn from_json_schema(document: serde_json::Value) -> Result<ResolvedSchema, CollaboratorError> {
    validate_is_schema(&document)?;
    Ok(ResolvedSchema {
        reference: None,
        document,
    })
}

/// `fromExternalBuilder`: resolve a `schemaRef` against a registry of
/// previously-registered named schemas. The Submission API registers a
/// document once, at admission time, via `from_simple_object`/
/// `from_json_schema`; the Worker only ever looks one up by reference, so
/// by the time it sees a `schemaRef` the document is already canonical.
#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    async fn lookup(&self, reference: &str) -> Result<Option<serde_json::Value>, CollaboratorError>;
    async fn register(&self, reference: &str, document: serde_json::Value)
        -> Result<(), CollaboratorError>;
}

pub async fn from_external_builder(
    registry: &dyn SchemaRegistry,
    reference: &str,
) -> Result<ResolvedSchema, CollaboratorError> {
    let document = registry
        .lookup(reference)
        .await?
        .ok_or_else(|| CollaboratorError::SchemaNotFound(reference.to_owned()))?;
    validate_is_schema(&document)?;
    Ok(ResolvedSchema {
        reference: Some(reference.to_owned()),
        document,
    })
}

/// Durable schema registry backed by the `schemas` table, shared by the
/// Submission API (writer) and Worker (reader) across processes.
pub struct PgSchemaRegistry {
    pool: PgPool,
}

impl PgSchemaRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SchemaRegistry for PgSchemaRegistry {
    async fn lookup(&self, reference: &str) -> Result<Option<serde_json::Value>, CollaboratorError> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT document FROM schemas WHERE reference = $1")
                .bind(reference)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| CollaboratorError::Unknown(e.to_string()))?;
        Ok(row.map(|(document,)| document))
    }

    async fn register(
        &self,
        reference: &str,
        document: serde_json::Value,
    ) -> Result<(), CollaboratorError> {
        sqlx::query(
            "INSERT INTO schemas (reference, document) VALUES ($1, $2)
             ON CONFLICT (reference) DO UPDATE SET document = EXCLUDED.document",
        )
        .bind(reference)
        .bind(document)
        .execute(&self.pool)
        .await
        .map_err(|e| CollaboratorError::Unknown(e.to_string()))?;
        Ok(())
    }
}

fn validate_is_schema(document: &serde_json::Value) -> Result<(), CollaboratorError> {
    jsonschema::JSONSchema::compile(document)
        .map_err(|e| CollaboratorError::SchemaNotFound(format!("invalid schema document: {e}")))?;
    Ok(())
}

/// Validates an LLM-produced JSON value against the resolved schema.
/// Returns the list of validation error messages, empty when valid.
pub fn validate_instance(schema: &ResolvedSchema, instance: &serde_json::Value) -> Vec<String> {
    let compiled = match jsonschema::JSONSchema::compile(&schema.document) {
        Ok(c) => c,
        Err(e) => return vec![format!("schema failed to compile: {e}")],
    };
    match compiled.validate(instance) {
        Ok(()) => Vec::new(),
        Err(errors) => errors.map(|e| e.to_string()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_object_expands_every_field_as_required() {
        let mut fields = BTreeMap::new();
        fields.insert("invoice_number".to_owned(), "string".to_owned());
        fields.insert("total".to_owned(), "number".to_owned());
        let resolved = from_simple_object(&SimpleObjectSpec(fields)).unwrap();
        assert_eq!(resolved.document["type"], "object");
        assert_eq!(resolved.document["additionalProperties"], false);
        let required = resolved.document["required"].as_array().unwrap();
        assert_eq!(required.len(), 2);
    }

    #[test]
    fn simple_object_rejects_unknown_type() {
        let mut fields = BTreeMap::new();
        fields.insert("x".to_owned(), "blob".to_owned());
        assert!(from_simple_object(&SimpleObjectSpec(fields)).is_err());
    }

    #[test]
    fn from_json_schema_rejects_malformed_document() {
        let bad = serde_json::json!({"type": "not-a-real-type"});
        assert!(from_json_schema(bad).is_err());
    }

    #[test]
    fn validate_instance_reports_missing_required_field() {
        let mut fields = BTreeMap::new();
        fields.insert("total".to_owned(), "number".to_owned());
        let schema = from_simple_object(&SimpleObjectSpec(fields)).unwrap();
        let errors = validate_instance(&schema, &serde_json::json!({}));
        assert!(!errors.is_empty());
    }

    struct StaticRegistry(BTreeMap<String, serde_json::Value>);

    #[async_trait]
    impl SchemaRegistry for StaticRegistry {
        async fn lookup(&self, reference: &str) -> Result<Option<serde_json::Value>, CollaboratorError> {
            Ok(self.0.get(reference).cloned())
        }

        async fn register(
            &self,
            _reference: &str,
            _document: serde_json::Value,
        ) -> Result<(), CollaboratorError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn external_builder_reports_unknown_reference() {
        let registry = StaticRegistry(BTreeMap::new());
        let err = from_external_builder(&registry, "schema_does_not_exist").await;
        assert!(err.is_err());
    }
}
