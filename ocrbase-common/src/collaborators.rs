//! OCR and LLM collaborator adapters. Both are plain HTTP clients behind a
//! trait, so the Worker never depends on a concrete provider; tests swap in
//! an `httpmock` server.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header;
use std::time::Duration;

use crate::error::CollaboratorError;
use crate::schema::ResolvedSchema;

#[derive(Debug, Clone)]
pub struct OcrOutput {
    pub markdown: String,
    pub page_count: i32,
}

#[async_trait]
pub trait OcrCollaborator: Send + Sync {
    async fn recognize(&self, bytes: Bytes, mime_type: &str) -> Result<OcrOutput, CollaboratorError>;
}

#[derive(Debug, Clone)]
pub struct LlmOutput {
    pub json: serde_json::Value,
    pub model: String,
    pub token_count: i64,
}

#[async_trait]
pub trait LlmCollaborator: Send + Sync {
    /// Runs the initial-call-then-repair sequence described in the LLM
    /// Adapter design: first call, validate shape, one repair attempt on
    /// failure, then give up with `LlmParseFailed`.
    async fn extract(
        &self,
        markdown: &str,
        schema: &ResolvedSchema,
        hints: Option<&str>,
    ) -> Result<LlmOutput, CollaboratorError>;
}

pub struct HttpOcrCollaborator {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpOcrCollaborator {
    pub fn new(endpoint: impl Into<String>, request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent("ocrbase-worker")
            .build()
            .expect("failed to construct reqwest client for OCR collaborator");
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[derive(serde::Deserialize)]
struct OcrResponse {
    markdown: String,
    page_count: i32,
}

#[async_trait]
impl OcrCollaborator for HttpOcrCollaborator {
    async fn recognize(&self, bytes: Bytes, mime_type: &str) -> Result<OcrOutput, CollaboratorError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(header::CONTENT_TYPE, mime_type)
            .body(bytes)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    CollaboratorError::OcrTransient(e.to_string())
                } else {
                    CollaboratorError::OcrUnrecoverable(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(CollaboratorError::OcrTransient(format!(
                "OCR collaborator returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(CollaboratorError::OcrUnrecoverable(format!(
                "OCR collaborator returned {status}"
            )));
        }

        let parsed: OcrResponse = response
            .json()
            .await
            .map_err(|e| CollaboratorError::OcrUnrecoverable(e.to_string()))?;

        Ok(OcrOutput {
            markdown: parsed.markdown,
            page_count: parsed.page_count,
        })
    }
}

pub struct HttpLlmCollaborator {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl HttpLlmCollaborator {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent("ocrbase-worker")
            .build()
            .expect("failed to construct reqwest client for LLM collaborator");
        Self {
            client,
            endpoint: endpoint.into(),
            model: model.into(),
        }
    }

    async fn call(&self, prompt: &str) -> Result<LlmCallResponse, CollaboratorError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "model": self.model, "prompt": prompt }))
            .send()
            .await
            .map_err(|e| CollaboratorError::LlmTransient(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CollaboratorError::LlmTransient(format!(
                "LLM collaborator returned {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| CollaboratorError::LlmTransient(e.to_string()))
    }
}

#[derive(serde::Deserialize)]
struct LlmCallResponse {
    text: String,
    token_count: i64,
}

fn build_prompt(markdown: &str, schema: &ResolvedSchema, hints: Option<&str>) -> String {
    format!(
        "Extract the fields described by this JSON Schema as a single JSON object.\nSchema: {}\nHints: {}\nDocument:\n{markdown}",
        schema.document,
        hints.unwrap_or("(none)"),
    )
}

fn build_repair_prompt(schema: &ResolvedSchema, malformed: &str) -> String {
    format!(
        "The previous response was not valid JSON matching this schema: {}.\nRespond with valid JSON only, no prose.\nPrevious response:\n{malformed}",
        schema.document,
    )
}

/// Accepts the parse only if the value is a plain object and it validates
/// against the resolved schema (required top-level keys among other
/// constraints the schema declares).
fn passes_shape_validation(value: &serde_json::Value, schema: &ResolvedSchema) -> bool {
    if !value.is_object() {
        return false;
    }
    crate::schema::validate_instance(schema, value).is_empty()
}

/// Extracts the first balanced `{...}` JSON object substring, rejecting the
/// response as ambiguous if more than one top-level candidate exists.
fn extract_single_json_object(text: &str) -> Option<serde_json::Value> {
    let mut depth = 0i32;
    let mut start = None;
    let mut candidates = Vec::new();

    for (i, c) in text.char_indices() {
        match c {
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start {
                        candidates.push(&text[s..=i]);
                    }
                }
            }
            _ => {}
        }
    }

    if candidates.len() != 1 {
        return None;
    }
    serde_json::from_str(candidates[0]).ok()
}

#[async_trait]
impl LlmCollaborator for HttpLlmCollaborator {
    async fn extract(
        &self,
        markdown: &str,
        schema: &ResolvedSchema,
        hints: Option<&str>,
    ) -> Result<LlmOutput, CollaboratorError> {
        let first = self.call(&build_prompt(markdown, schema, hints)).await?;
        let mut token_count = first.token_count;

        if let Some(value) = extract_single_json_object(&first.text) {
            if passes_shape_validation(&value, schema) {
                return Ok(LlmOutput {
                    json: value,
                    model: self.model.clone(),
                    token_count,
                });
            }
        }

        let repaired = self.call(&build_repair_prompt(schema, &first.text)).await?;
        token_count += repaired.token_count;

        let value = extract_single_json_object(&repaired.text)
            .filter(|v| passes_shape_validation(v, schema))
            .ok_or(CollaboratorError::LlmParseFailed)?;

        Ok(LlmOutput {
            json: value,
            model: self.model.clone(),
            token_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn schema_requiring(keys: &[&str]) -> ResolvedSchema {
        ResolvedSchema {
            reference: None,
            document: json!({
                "type": "object",
                "required": keys,
            }),
        }
    }

    #[test]
    fn extract_single_json_object_rejects_multiple_candidates() {
        let text = r#"here: {"a": 1} and also {"b": 2}"#;
        assert!(extract_single_json_object(text).is_none());
    }

    #[test]
    fn extract_single_json_object_finds_the_only_candidate() {
        let text = r#"sure, here is the json: {"a": 1, "b": "x"} thanks"#;
        let value = extract_single_json_object(text).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn shape_validation_requires_every_required_key() {
        let schema = schema_requiring(&["a", "b"]);
        assert!(!passes_shape_validation(&json!({"a": 1}), &schema));
        assert!(passes_shape_validation(&json!({"a": 1, "b": 2}), &schema));
    }

    #[tokio::test]
    async fn extract_accepts_well_shaped_first_response() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST);
            then.status(200)
                .json_body(json!({"text": r#"{"total": 42}"#, "token_count": 10}));
        });

        let collaborator =
            HttpLlmCollaborator::new(server.url("/extract"), "test-model", Duration::from_secs(5));
        let schema = schema_requiring(&["total"]);
        let result = collaborator
            .extract("some markdown", &schema, None)
            .await
            .unwrap();

        mock.assert();
        assert_eq!(result.json["total"], 42);
        assert_eq!(result.token_count, 10);
    }

    #[tokio::test]
    async fn extract_repairs_once_then_succeeds() {
        let server = MockServer::start();
        let first = server.mock(|when, then| {
            when.method(POST).body_contains("Extract the fields");
            then.status(200)
                .json_body(json!({"text": "not json at all", "token_count": 5}));
        });
        let repair = server.mock(|when, then| {
            when.method(POST).body_contains("valid JSON only");
            then.status(200)
                .json_body(json!({"text": r#"{"total": 7}"#, "token_count": 3}));
        });

        let collaborator =
            HttpLlmCollaborator::new(server.url("/extract"), "test-model", Duration::from_secs(5));
        let schema = schema_requiring(&["total"]);
        let result = collaborator
            .extract("some markdown", &schema, None)
            .await
            .unwrap();

        first.assert();
        repair.assert();
        assert_eq!(result.json["total"], 7);
        assert_eq!(result.token_count, 8);
    }

    #[tokio::test]
    async fn extract_fails_parse_when_repair_still_malformed() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST);
            then.status(200)
                .json_body(json!({"text": "still not json", "token_count": 1}));
        });

        let collaborator =
            HttpLlmCollaborator::new(server.url("/extract"), "test-model", Duration::from_secs(5));
        let schema = schema_requiring(&["total"]);
        let err = collaborator
            .extract("some markdown", &schema, None)
            .await
            .unwrap_err();

        assert!(matches!(err, CollaboratorError::LlmParseFailed));
    }

    #[tokio::test]
    async fn recognize_classifies_5xx_as_transient() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST);
            then.status(503);
        });

        let collaborator = HttpOcrCollaborator::new(server.base_url(), Duration::from_secs(5));
        let err = collaborator
            .recognize(Bytes::from_static(b"%PDF-1.4"), "application/pdf")
            .await
            .unwrap_err();

        assert!(matches!(err, CollaboratorError::OcrTransient(_)));
    }

    #[tokio::test]
    async fn recognize_classifies_4xx_as_unrecoverable() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST);
            then.status(400);
        });

        let collaborator = HttpOcrCollaborator::new(server.base_url(), Duration::from_secs(5));
        let err = collaborator
            .recognize(Bytes::from_static(b"%PDF-1.4"), "application/pdf")
            .await
            .unwrap_err();

        assert!(matches!(err, CollaboratorError::OcrUnrecoverable(_)));
    }
}
