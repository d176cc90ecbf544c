// ---------------------------------------------------------------------------
// EngineConfig — file-based config loader (prospect-scout.json) with env-var
// fallback per field. Missing file or missing fields fall through to
// conservative defaults; nothing here panics.
// ---------------------------------------------------------------------------

/// LLM sub-config (mirrors the `llm` key in prospect-scout.json).
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct LlmConfig {
    /// LLM endpoint — e.g. `https://api.openai.com/v1` or `http://localhost:11434/v1` (Ollama).
    pub base_url: Option<String>,
    /// API key. Never logged. Leave blank for key-less local endpoints.
    pub api_key: Option<String>,
    /// Model name — e.g. `gpt-4o-mini`, `llama3`, `mistral`.
    pub model: Option<String>,
    /// Token-bucket refill rate. Kept low by default: free-tier quotas are
    /// the common deployment and the bucket is process-wide.
    pub requests_per_minute: Option<f64>,
    /// Worker count for the LLM pool.
    pub workers: Option<usize>,
    pub timeout_s: Option<LlmTimeouts>,
}

#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct LlmTimeouts {
    pub selection: Option<u64>,
    pub aggregation: Option<u64>,
    pub classification: Option<u64>,
    pub explanation: Option<u64>,
}

impl LlmConfig {
    /// API key: JSON field → `OPENAI_API_KEY` env var → `None`.
    ///
    /// An explicit empty string in the config file means "no key required"
    /// (Ollama / LM Studio) and is passed through as `Some("")`.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(k) = &self.api_key {
            return Some(k.trim().to_string());
        }
        std::env::var("OPENAI_API_KEY").ok().filter(|v| !v.trim().is_empty())
    }

    /// LLM base URL: JSON field → `OPENAI_BASE_URL` env var → OpenAI default.
    pub fn resolve_base_url(&self) -> String {
        if let Some(u) = &self.base_url {
            if !u.trim().is_empty() {
                return u.clone();
            }
        }
        std::env::var("OPENAI_BASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
    }

    /// Model name: JSON field → `PROSPECT_LLM_MODEL` env var → `gpt-4o-mini`.
    pub fn resolve_model(&self) -> String {
        if let Some(m) = &self.model {
            if !m.trim().is_empty() {
                return m.clone();
            }
        }
        std::env::var("PROSPECT_LLM_MODEL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "gpt-4o-mini".to_string())
    }

    pub fn resolve_requests_per_minute(&self) -> f64 {
        if let Some(n) = self.requests_per_minute {
            return n.max(0.1);
        }
        std::env::var("PROSPECT_LLM_RPM")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8.0)
    }

    pub fn resolve_workers(&self) -> usize {
        self.workers
            .or_else(|| {
                std::env::var("PROSPECT_LLM_WORKERS")
                    .ok()
                    .and_then(|v| v.parse().ok())
            })
            .unwrap_or(1)
            .clamp(1, 8)
    }

    pub fn resolve_selection_timeout_s(&self) -> u64 {
        self.timeout_s
            .as_ref()
            .and_then(|t| t.selection)
            .unwrap_or(25)
    }

    pub fn resolve_aggregation_timeout_s(&self) -> u64 {
        self.timeout_s
            .as_ref()
            .and_then(|t| t.aggregation)
            .unwrap_or(60)
    }

    pub fn resolve_classification_timeout_s(&self) -> u64 {
        self.timeout_s
            .as_ref()
            .and_then(|t| t.classification)
            .unwrap_or(25)
    }

    pub fn resolve_explanation_timeout_s(&self) -> u64 {
        self.timeout_s
            .as_ref()
            .and_then(|t| t.explanation)
            .unwrap_or(20)
    }
}

/// Crawl sub-config (C3 link discovery + C5 extraction limits).
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct CrawlConfig {
    pub max_links: Option<usize>,
    pub max_depth: Option<usize>,
    pub per_page_timeout_s: Option<u64>,
    pub parallelism: Option<usize>,
    pub per_host_concurrency: Option<usize>,
    pub discovery_timeout_s: Option<u64>,
    pub max_page_bytes: Option<usize>,
    pub max_chars_per_page: Option<usize>,
}

impl CrawlConfig {
    pub fn resolve_max_links(&self) -> usize {
        self.max_links.unwrap_or(1000)
    }

    pub fn resolve_max_depth(&self) -> usize {
        self.max_depth.unwrap_or(3)
    }

    pub fn resolve_per_page_timeout_s(&self) -> u64 {
        self.per_page_timeout_s.unwrap_or(20)
    }

    pub fn resolve_parallelism(&self) -> usize {
        self.parallelism.unwrap_or(10).max(1)
    }

    pub fn resolve_per_host_concurrency(&self) -> usize {
        self.per_host_concurrency.unwrap_or(4).max(1)
    }

    pub fn resolve_discovery_timeout_s(&self) -> u64 {
        self.discovery_timeout_s.unwrap_or(20)
    }

    pub fn resolve_max_page_bytes(&self) -> usize {
        self.max_page_bytes.unwrap_or(2 * 1024 * 1024)
    }

    pub fn resolve_max_chars_per_page(&self) -> usize {
        self.max_chars_per_page.unwrap_or(10_000)
    }
}

/// Research orchestration sub-config (C10).
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct ResearchConfig {
    pub overall_timeout_s: Option<u64>,
    pub select_top_k: Option<usize>,
    pub aggregation_chars_per_page: Option<usize>,
    pub aggregation_max_pages: Option<usize>,
    pub list_cap: Option<usize>,
    pub cancel_grace_ms: Option<u64>,
}

impl ResearchConfig {
    pub fn resolve_overall_timeout_s(&self) -> u64 {
        self.overall_timeout_s.unwrap_or(120)
    }

    pub fn resolve_select_top_k(&self) -> usize {
        self.select_top_k.unwrap_or(15).clamp(1, 50)
    }

    pub fn resolve_aggregation_chars_per_page(&self) -> usize {
        self.aggregation_chars_per_page.unwrap_or(5_000)
    }

    pub fn resolve_aggregation_max_pages(&self) -> usize {
        self.aggregation_max_pages.unwrap_or(30)
    }

    /// Cap applied to every list field of the record.
    pub fn resolve_list_cap(&self) -> usize {
        self.list_cap.unwrap_or(15).clamp(1, 50)
    }

    pub fn resolve_cancel_grace_ms(&self) -> u64 {
        self.cancel_grace_ms.unwrap_or(2_000)
    }
}

/// Batch coordinator sub-config (C12).
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct BatchConfig {
    pub concurrency_start: Option<usize>,
    pub concurrency_max: Option<usize>,
    pub cooldown_s: Option<u64>,
    pub success_streak: Option<usize>,
    pub row_retries: Option<u32>,
    pub resume_ttl_s: Option<u64>,
}

impl BatchConfig {
    pub fn resolve_concurrency_start(&self) -> usize {
        self.concurrency_start.unwrap_or(3).max(1)
    }

    pub fn resolve_concurrency_max(&self) -> usize {
        self.concurrency_max.unwrap_or(10).max(1)
    }

    pub fn resolve_cooldown_s(&self) -> u64 {
        self.cooldown_s.unwrap_or(60)
    }

    pub fn resolve_success_streak(&self) -> usize {
        self.success_streak.unwrap_or(5).max(1)
    }

    pub fn resolve_row_retries(&self) -> u32 {
        self.row_retries.unwrap_or(3)
    }

    pub fn resolve_resume_ttl_s(&self) -> u64 {
        self.resume_ttl_s.unwrap_or(24 * 60 * 60)
    }
}

/// Similarity sub-config (C11).
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct SimilarityConfig {
    pub threshold: Option<f64>,
    pub weights: Option<SimilarityWeights>,
}

#[derive(serde::Deserialize, Clone, Copy, Debug)]
pub struct SimilarityWeights {
    pub business_model: f64,
    pub industry: f64,
    pub company_size: f64,
    pub tech: f64,
    pub market_focus: f64,
    pub growth_stage: f64,
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self {
            business_model: 0.25,
            industry: 0.20,
            company_size: 0.15,
            tech: 0.15,
            market_focus: 0.15,
            growth_stage: 0.10,
        }
    }
}

impl SimilarityConfig {
    pub fn resolve_threshold(&self) -> f64 {
        self.threshold.unwrap_or(0.6).clamp(0.0, 1.0)
    }

    pub fn resolve_weights(&self) -> SimilarityWeights {
        self.weights.unwrap_or_default()
    }
}

/// Embedding sub-config (C8). Independent endpoint and quota from the LLM.
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct EmbeddingConfig {
    /// `http` (OpenAI-compatible /embeddings) or `local` (model2vec).
    pub provider: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub dim: Option<usize>,
    pub requests_per_minute: Option<f64>,
    /// model2vec model id for the local provider.
    pub local_model_id: Option<String>,
}

impl EmbeddingConfig {
    pub fn resolve_provider(&self) -> String {
        self.provider
            .clone()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| "http".to_string())
    }

    pub fn resolve_base_url(&self) -> String {
        if let Some(u) = &self.base_url {
            if !u.trim().is_empty() {
                return u.clone();
            }
        }
        std::env::var("OPENAI_BASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
    }

    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(k) = &self.api_key {
            return Some(k.trim().to_string());
        }
        std::env::var("OPENAI_API_KEY").ok().filter(|v| !v.trim().is_empty())
    }

    pub fn resolve_model(&self) -> String {
        self.model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| "text-embedding-3-small".to_string())
    }

    pub fn resolve_dim(&self) -> usize {
        self.dim.unwrap_or(1536)
    }

    pub fn resolve_requests_per_minute(&self) -> f64 {
        self.requests_per_minute.unwrap_or(60.0).max(0.1)
    }

    pub fn resolve_local_model_id(&self) -> String {
        self.local_model_id
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| "minishlab/potion-base-8M".to_string())
    }
}

/// Vector-store sub-config (C9).
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct VectorConfig {
    pub uri: Option<String>,
    pub table: Option<String>,
}

impl VectorConfig {
    /// LanceDB directory/URI: JSON field → `LANCEDB_URI` env var → a stable
    /// per-user default path.
    pub fn resolve_uri(&self) -> Option<String> {
        if let Some(u) = &self.uri {
            if !u.trim().is_empty() {
                return Some(u.clone());
            }
        }
        if let Ok(v) = std::env::var("LANCEDB_URI") {
            let v = v.trim();
            if !v.is_empty() {
                return Some(v.to_string());
            }
        }
        let home = dirs::home_dir()?;
        Some(
            home.join(".prospect-scout")
                .join("lancedb")
                .to_string_lossy()
                .to_string(),
        )
    }

    pub fn resolve_table(&self) -> String {
        self.table
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| "companies".to_string())
    }
}

/// Progress-bus sub-config (C1).
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct ProgressConfig {
    pub retention_minutes: Option<u64>,
    pub subscriber_buffer: Option<usize>,
}

impl ProgressConfig {
    pub fn resolve_retention_minutes(&self) -> u64 {
        self.retention_minutes.unwrap_or(30)
    }

    pub fn resolve_subscriber_buffer(&self) -> usize {
        self.subscriber_buffer.unwrap_or(256).max(8)
    }
}

/// Top-level config loaded from `prospect-scout.json`.
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct EngineConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub crawl: CrawlConfig,
    #[serde(default)]
    pub research: ResearchConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub similarity: SimilarityConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    /// Optional override of the built-in 59-category taxonomy.
    #[serde(default)]
    pub taxonomy: Option<Vec<String>>,
}

/// Load `prospect-scout.json` from standard locations.
///
/// Search order (first found wins):
/// 1. `PROSPECT_SCOUT_CONFIG` env var path
/// 2. `./prospect-scout.json`
/// 3. `../prospect-scout.json`
///
/// Missing file → `EngineConfig::default()` (silent, all env-var fallbacks
/// apply). Parse error → log a warning, return defaults.
pub fn load_config() -> EngineConfig {
    let candidates: Vec<std::path::PathBuf> = {
        let mut v = vec![
            std::path::PathBuf::from("prospect-scout.json"),
            std::path::PathBuf::from("../prospect-scout.json"),
        ];
        if let Ok(env_path) = std::env::var("PROSPECT_SCOUT_CONFIG") {
            v.insert(0, std::path::PathBuf::from(env_path));
        }
        v
    };

    for path in &candidates {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<EngineConfig>(&contents) {
                Ok(cfg) => {
                    tracing::info!("prospect-scout.json loaded from {}", path.display());
                    return cfg;
                }
                Err(e) => {
                    tracing::warn!(
                        "prospect-scout.json parse error at {}: {} — using defaults",
                        path.display(),
                        e
                    );
                    return EngineConfig::default();
                }
            },
            Err(_) => continue, // file not found at this path — try next
        }
    }

    EngineConfig::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.llm.resolve_requests_per_minute(), 8.0);
        assert_eq!(cfg.llm.resolve_workers(), 1);
        assert_eq!(cfg.crawl.resolve_max_links(), 1000);
        assert_eq!(cfg.crawl.resolve_max_depth(), 3);
        assert_eq!(cfg.research.resolve_overall_timeout_s(), 120);
        assert_eq!(cfg.batch.resolve_concurrency_start(), 3);
        assert_eq!(cfg.similarity.resolve_threshold(), 0.6);
        assert_eq!(cfg.embedding.resolve_dim(), 1536);
    }

    #[test]
    fn test_weights_sum_to_one() {
        let w = SimilarityWeights::default();
        let sum = w.business_model + w.industry + w.company_size + w.tech + w.market_focus
            + w.growth_stage;
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_partial_file_parse() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{"llm": {"requests_per_minute": 30.0}}"#).unwrap();
        assert_eq!(cfg.llm.resolve_requests_per_minute(), 30.0);
        // Everything else falls back to defaults.
        assert_eq!(cfg.crawl.resolve_parallelism(), 10);
    }
}
