use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;

use crate::core::errors::{EngineError, EngineResult};

/// One chat-style completion request as seen by a provider adapter.
///
/// `purpose` identifies the pipeline stage that issued the call (selection,
/// aggregation, …); adapters use it for logging and model routing only.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub purpose: String,
    pub model: String,
    pub system: Option<String>,
    pub prompt: String,
    /// JSON schema the reply must conform to; providers that support a JSON
    /// output mode should enable it when this is set.
    pub schema: Option<serde_json::Value>,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Capability seam for LLM backends. The worker pool is the only caller.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, req: &CompletionRequest) -> EngineResult<String>;
}

// ---------------------------------------------------------------------------
// OpenAI-compatible adapter
// ---------------------------------------------------------------------------

/// Chat-completions adapter for any OpenAI-compatible endpoint (OpenAI,
/// Ollama, LM Studio, vLLM). Point `base_url` at the `/v1` root.
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiCompatProvider {
    pub fn new(client: reqwest::Client, base_url: String, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn complete(&self, req: &CompletionRequest) -> EngineResult<String> {
        let mut messages = Vec::new();
        let mut system = req.system.clone().unwrap_or_default();
        if let Some(schema) = &req.schema {
            // Schema goes into the system message; response_format=json_object
            // is the widest-supported structured-output mode.
            if !system.is_empty() {
                system.push_str("\n\n");
            }
            system.push_str(
                "Reply with a single JSON object that conforms to this JSON schema. \
                 Do not wrap it in markdown fences or add commentary.\n",
            );
            system.push_str(&schema.to_string());
        }
        if !system.is_empty() {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": req.prompt}));

        let mut body = json!({
            "model": req.model,
            "messages": messages,
            "max_tokens": req.max_tokens,
            "temperature": req.temperature,
        });
        if req.schema.is_some() {
            body["response_format"] = json!({"type": "json_object"});
        }

        let url = format!("{}/chat/completions", self.base_url);
        let mut http = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            if !key.is_empty() {
                http = http.bearer_auth(key);
            }
        }

        let resp = http.send().await.map_err(EngineError::from)?;
        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            let mut err = EngineError::from_http_status(status.as_u16(), "llm");
            if !detail.is_empty() {
                err.message = format!("{} — {}", err.message, truncate(&detail, 300));
            }
            return Err(err);
        }

        let payload: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EngineError::transient("llm_decode", e.to_string()))?;

        let content = payload
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .context("missing choices[0].message.content")
            .map_err(|e| EngineError::permanent("llm_malformed", e.to_string()))?;

        tracing::debug!(
            purpose = %req.purpose,
            model = %req.model,
            chars = content.len(),
            "llm completion received"
        );

        Ok(content.to_string())
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}
