use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::batch::{BatchCoordinator, BatchCoordinatorConfig};
use crate::core::config::EngineConfig;
use crate::core::errors::{EngineError, EngineResult};
use crate::core::taxonomy::Taxonomy;
use crate::core::types::{CompanyRecord, ResearchRequest, SimilarityRequest, SimilarityResult};
use crate::embedding::EmbeddingProvider;
use crate::llm::{LlmPool, LlmProvider, PoolConfig};
use crate::progress::ProgressBus;
use crate::research::orchestrator;
use crate::scraping::{FetcherConfig, PageFetcher, RobotsCache};
use crate::similarity::{SimilarityEngine, SimilarityEngineConfig};
use crate::vector::VectorStore;

/// The engine container: every long-lived dependency, constructed once at
/// startup and injected explicitly. There are no process-wide singletons;
/// tests build an `Engine` with mock providers and an in-memory store.
pub struct Engine {
    pub http_client: reqwest::Client,
    pub config: Arc<EngineConfig>,
    pub llm: Arc<LlmPool>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub store: Arc<dyn VectorStore>,
    pub progress: Arc<ProgressBus>,
    pub fetcher: Arc<PageFetcher>,
    pub robots: Arc<RobotsCache>,
    pub taxonomy: Arc<Taxonomy>,
    /// Cancellation tokens of in-flight research jobs, by job id.
    jobs: RwLock<HashMap<String, CancellationToken>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("taxonomy_labels", &self.taxonomy.len())
            .finish()
    }
}

impl Engine {
    pub fn new(
        http_client: reqwest::Client,
        config: EngineConfig,
        llm_provider: Arc<dyn LlmProvider>,
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
    ) -> Arc<Self> {
        let pool = Arc::new(LlmPool::new(
            llm_provider,
            PoolConfig {
                workers: config.llm.resolve_workers(),
                requests_per_minute: config.llm.resolve_requests_per_minute(),
                default_model: config.llm.resolve_model(),
                ..Default::default()
            },
        ));

        let progress = Arc::new(ProgressBus::new(
            Duration::from_secs(config.progress.resolve_retention_minutes() * 60),
            config.progress.resolve_subscriber_buffer(),
        ));
        let _janitor = progress.spawn_janitor();

        let fetcher = Arc::new(PageFetcher::new(
            http_client.clone(),
            FetcherConfig {
                max_page_bytes: config.crawl.resolve_max_page_bytes(),
                ..Default::default()
            },
        ));
        let robots = Arc::new(RobotsCache::new(http_client.clone()));

        let taxonomy = Arc::new(match &config.taxonomy {
            Some(labels) if !labels.is_empty() => Taxonomy::new(labels.clone()),
            _ => Taxonomy::default_set(),
        });
        info!(
            "engine ready (taxonomy: {} labels, llm workers: {}, rpm: {})",
            taxonomy.len(),
            config.llm.resolve_workers(),
            config.llm.resolve_requests_per_minute()
        );

        Arc::new(Self {
            http_client,
            config: Arc::new(config),
            llm: pool,
            embedder,
            store,
            progress,
            fetcher,
            robots,
            taxonomy,
            jobs: RwLock::new(HashMap::new()),
        })
    }

    // ── job lifecycle ────────────────────────────────────────────────────

    async fn register_job(&self, job_id: &str) -> EngineResult<CancellationToken> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(job_id) {
            return Err(EngineError::input(
                "job_exists",
                format!("job '{job_id}' is already running"),
            ));
        }
        let token = CancellationToken::new();
        jobs.insert(job_id.to_string(), token.clone());
        Ok(token)
    }

    async fn finish_job(&self, job_id: &str) {
        self.jobs.write().await.remove(job_id);
    }

    /// Cancel a running job. Returns false when the id is unknown (already
    /// finished or never started).
    pub async fn cancel_job(&self, job_id: &str) -> bool {
        match self.jobs.read().await.get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    // ── public operations ────────────────────────────────────────────────

    /// Run a research job under a fresh job id.
    pub async fn research(&self, request: ResearchRequest) -> EngineResult<CompanyRecord> {
        let job_id = uuid::Uuid::new_v4().to_string();
        self.research_with_job(request, &job_id).await
    }

    /// Run a research job under a caller-chosen id so progress can be
    /// subscribed to (and the job cancelled) while it runs.
    pub async fn research_with_job(
        &self,
        request: ResearchRequest,
        job_id: &str,
    ) -> EngineResult<CompanyRecord> {
        let cancel = self.register_job(job_id).await?;
        let result = orchestrator::run_research(self, &request, job_id, cancel).await;
        self.finish_job(job_id).await;
        result
    }

    /// Similarity discovery (C11) wired to this engine's store and pool.
    pub fn similarity(&self) -> SimilarityEngine {
        SimilarityEngine::new(
            Arc::clone(&self.store),
            Arc::clone(&self.llm),
            Arc::clone(&self.embedder),
            SimilarityEngineConfig {
                threshold: self.config.similarity.resolve_threshold(),
                weights: self.config.similarity.resolve_weights(),
                web_deadline: Duration::from_secs(self.config.llm.resolve_selection_timeout_s()),
                explain_deadline: Duration::from_secs(
                    self.config.llm.resolve_explanation_timeout_s(),
                ),
            },
        )
    }

    pub async fn discover_similar(
        &self,
        request: &SimilarityRequest,
    ) -> EngineResult<Vec<SimilarityResult>> {
        self.similarity()
            .discover(request, &CancellationToken::new())
            .await
    }

    /// Batch coordinator (C12) for this engine.
    pub fn batch(self: &Arc<Self>) -> BatchCoordinator {
        BatchCoordinator::new(
            Arc::clone(self),
            BatchCoordinatorConfig {
                concurrency_start: self.config.batch.resolve_concurrency_start(),
                concurrency_max: self.config.batch.resolve_concurrency_max(),
                cooldown: Duration::from_secs(self.config.batch.resolve_cooldown_s()),
                success_streak: self.config.batch.resolve_success_streak(),
                row_retries: self.config.batch.resolve_row_retries(),
                resume_ttl: Duration::from_secs(self.config.batch.resolve_resume_ttl_s()),
            },
        )
    }
}
