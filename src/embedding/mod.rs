//! Embedding providers (C8).
//!
//! Embeddings run behind the same retry and rate-limit discipline as LLM
//! calls but over their own token bucket — embedding quotas are independent
//! of completion quotas.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use model2vec_rs::model::StaticModel;
use serde_json::json;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::core::errors::{EngineError, EngineResult, ErrorKind};
use crate::core::types::CompanyRecord;
use crate::llm::{backoff_with_jitter, TokenBucket};

/// Character cap on the canonical embedding text; matches typical embedding
/// model input limits with headroom.
const EMBED_TEXT_CAP: usize = 8_000;

/// Capability seam for embedding backends.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>>;
    /// Fixed output dimensionality; every stored vector must have this length.
    fn dim(&self) -> usize;
}

/// Deterministic canonical text for a record's vector, so re-research of an
/// unchanged company produces a comparable embedding.
pub fn build_embedding_text(record: &CompanyRecord) -> String {
    let mut parts: Vec<String> = vec![record.name.clone()];
    if let Some(d) = &record.description {
        parts.push(d.clone());
    }
    if !record.key_services.is_empty() {
        parts.push(record.key_services.join(", "));
    }
    if let Some(v) = &record.value_proposition {
        parts.push(v.clone());
    }
    let text = parts.join("\n");
    if text.chars().count() > EMBED_TEXT_CAP {
        text.chars().take(EMBED_TEXT_CAP).collect()
    } else {
        text
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible HTTP embedder
// ---------------------------------------------------------------------------

pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    dim: usize,
    bucket: TokenBucket,
    retries: u32,
    timeout: Duration,
}

impl HttpEmbedder {
    pub fn new(
        client: reqwest::Client,
        base_url: String,
        api_key: Option<String>,
        model: String,
        dim: usize,
        requests_per_minute: f64,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            dim,
            bucket: TokenBucket::per_minute(requests_per_minute),
            retries: 3,
            timeout: Duration::from_secs(30),
        }
    }

    async fn embed_once(&self, text: &str) -> EngineResult<Vec<f32>> {
        let url = format!("{}/embeddings", self.base_url);
        let mut req = self.client.post(&url).timeout(self.timeout).json(&json!({
            "model": self.model,
            "input": text,
            "dimensions": self.dim,
        }));
        if let Some(key) = &self.api_key {
            if !key.is_empty() {
                req = req.bearer_auth(key);
            }
        }

        let resp = req.send().await.map_err(EngineError::from)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(EngineError::from_http_status(status.as_u16(), "embedding"));
        }

        let payload: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EngineError::transient("embed_decode", e.to_string()))?;
        let vector: Vec<f32> = payload
            .get("data")
            .and_then(|d| d.get(0))
            .and_then(|d| d.get("embedding"))
            .and_then(|e| e.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_f64()).map(|v| v as f32).collect())
            .unwrap_or_default();

        if vector.len() != self.dim {
            return Err(EngineError::permanent(
                "embed_dim",
                format!("expected dimension {}, got {}", self.dim, vector.len()),
            ));
        }
        Ok(vector)
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbedder {
    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        let mut attempts: u32 = 0;
        loop {
            self.bucket.acquire().await;
            match self.embed_once(text).await {
                Ok(v) => return Ok(v),
                Err(e) if matches!(e.kind, ErrorKind::Transient | ErrorKind::Quota) => {
                    attempts += 1;
                    if attempts > self.retries {
                        return Err(e);
                    }
                    let delay = if e.kind == ErrorKind::Quota {
                        self.bucket.window()
                    } else {
                        backoff_with_jitter(attempts)
                    };
                    warn!("embedding error, retrying in {delay:?}: {}", e.message);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

// ---------------------------------------------------------------------------
// Local model2vec embedder
// ---------------------------------------------------------------------------

/// In-process static-model embedder. Dimensionality is probed at load time;
/// encoding is CPU-bound and runs under `spawn_blocking`.
pub struct LocalEmbedder {
    model_id: String,
    model: Arc<OnceCell<Arc<StaticModel>>>,
    dim: usize,
}

impl LocalEmbedder {
    pub async fn load(model_id: &str) -> anyhow::Result<Self> {
        let id = model_id.to_string();
        let (model, dim) = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
            let model = StaticModel::from_pretrained(&id, None, None, None)
                .with_context(|| format!("Failed to load model2vec model '{id}'"))?;
            let probe = model.encode_single("dimension probe");
            Ok((model, probe.len()))
        })
        .await
        .context("model2vec init task failed")??;

        info!("local embedder ready (model: {}, dim: {})", model_id, dim);

        let cell = Arc::new(OnceCell::new());
        let _ = cell.set(Arc::new(model));
        Ok(Self {
            model_id: model_id.to_string(),
            model: cell,
            dim,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for LocalEmbedder {
    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        let model = self
            .model
            .get()
            .cloned()
            .ok_or_else(|| EngineError::internal(format!("model '{}' not loaded", self.model_id)))?;
        let text = text.to_string();
        let vector = tokio::task::spawn_blocking(move || model.encode_single(&text))
            .await
            .map_err(|e| EngineError::internal(format!("embedding task failed: {e}")))?;

        if vector.len() != self.dim {
            return Err(EngineError::internal(format!(
                "embedding dimension drifted: expected {}, got {}",
                self.dim,
                vector.len()
            )));
        }
        Ok(vector)
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_text_is_canonical_and_clipped() {
        let mut record = CompanyRecord::new("Acme", "https://acme.test");
        record.description = Some("Industrial anvils.".into());
        record.key_services = vec!["anvils".into(), "drop testing".into()];
        record.value_proposition = Some("Heaviest anvils per dollar.".into());

        let text = build_embedding_text(&record);
        assert!(text.starts_with("Acme\n"));
        assert!(text.contains("anvils, drop testing"));

        record.description = Some("y".repeat(20_000));
        let clipped = build_embedding_text(&record);
        assert_eq!(clipped.chars().count(), EMBED_TEXT_CAP);
    }
}
