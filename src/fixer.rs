//! External fix collaborator.
//!
//! The orchestrator talks to the fixer through the `SqlFixer` trait so tests
//! can script responses. The production implementation, `LlmFixer`, sends the
//! draft plus the validation summary to an OpenAI-compatible chat endpoint
//! and expects a JSON object back.

use crate::config::LlmConfig;
use crate::error::FixerError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Everything the collaborator needs to propose a corrected draft.
#[derive(Debug, Clone, Serialize)]
pub struct FixRequest {
    /// The user's original question, for intent context.
    pub question: String,
    /// The draft that failed local validation.
    pub sql: String,
    /// Human-readable issue list from the last validation pass.
    pub report_summary: String,
    /// Schema context: known tables with their columns.
    pub schema_context: String,
}

/// A corrected draft with the collaborator's reasoning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FixedSql {
    pub sql: String,
    #[serde(default)]
    pub explanation: String,
}

#[async_trait]
pub trait SqlFixer: Send + Sync {
    async fn fix(&self, request: &FixRequest) -> Result<FixedSql, FixerError>;
}

pub struct LlmFixer {
    client: reqwest::Client,
    config: LlmConfig,
}

impl LlmFixer {
    /// Fails when the HTTP client cannot be constructed; the request timeout
    /// from `config` is mandatory, so there is no degraded fallback.
    pub fn new(config: LlmConfig) -> Result<Self, FixerError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| FixerError::Connection(format!("client construction failed: {}", e)))?;
        Ok(Self { client, config })
    }

    fn build_prompt(request: &FixRequest) -> String {
        format!(
            r#"Fix this SQL query so it passes schema validation. Return JSON only.

Question: "{}"

SQL:
{}

Validation issues:
{}

Known schema:
{}

Rules:
- Only reference tables and columns from the known schema.
- Joins must follow the declared relationships.
- Keep the query's intent; change as little as possible.

Format: {{"sql": "corrected query", "explanation": "what was changed and why"}}"#,
            request.question, request.sql, request.report_summary, request.schema_context
        )
    }

    fn map_transport_error(err: reqwest::Error) -> FixerError {
        if err.is_timeout() {
            FixerError::Timeout
        } else {
            FixerError::Connection(err.to_string())
        }
    }

    fn parse_response(body: &serde_json::Value) -> Result<FixedSql, FixerError> {
        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| FixerError::Malformed("no content in response".to_string()))?;

        // Strip markdown fences some models wrap JSON in.
        let cleaned = content
            .trim()
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim();
        if cleaned.is_empty() {
            return Err(FixerError::Malformed("empty content".to_string()));
        }

        let fixed: FixedSql = serde_json::from_str(cleaned).map_err(|e| {
            FixerError::Malformed(format!("bad JSON: {}. Content: {}", e, cleaned))
        })?;
        if fixed.sql.trim().is_empty() {
            return Err(FixerError::Malformed("fixed sql is empty".to_string()));
        }
        Ok(fixed)
    }
}

#[async_trait]
impl SqlFixer for LlmFixer {
    async fn fix(&self, request: &FixRequest) -> Result<FixedSql, FixerError> {
        let prompt = Self::build_prompt(request);
        debug!(model = %self.config.model, "sending fix request");

        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": "Return JSON only, no text."},
                {"role": "user", "content": prompt}
            ],
            "temperature": 0.1,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(Self::map_transport_error)?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(FixerError::RateLimited);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(%status, "fixer endpoint returned an error");
            return Err(FixerError::Connection(format!("HTTP {}: {}", status, text)));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| FixerError::Malformed(format!("unreadable body: {}", e)))?;
        Self::parse_response(&json)
    }
}

/// Compact schema description for the fixer prompt.
pub fn schema_context(schema: &crate::knowledge::SchemaKnowledgeBase) -> String {
    let mut lines: Vec<String> = schema
        .table_names()
        .filter_map(|name| {
            schema.lookup(name).map(|table| {
                let columns: Vec<&str> = table.column_names().collect();
                format!("{}: {}", table.name, columns.join(", "))
            })
        })
        .collect();
    lines.sort();
    for rel in schema.relationships() {
        lines.push(format!(
            "relationship: {}.{} = {}.{}",
            rel.table1, rel.field1, rel.table2, rel.field2
        ));
    }
    lines.join("\n")
}
