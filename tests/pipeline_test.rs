//! End-to-end pipeline tests against an in-process fixture site with mocked
//! LLM and embedding providers. No external network access.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{extract::Path as AxumPath, response::Html, routing::get, Router};
use prospect_scout::core::config::EngineConfig;
use prospect_scout::llm::CompletionRequest;
use prospect_scout::{
    BatchRequest, BatchRow, DiscoverySource, Engine, EngineError, EngineResult, EmbeddingProvider,
    LlmProvider, MemoryStore, PhaseState, ResearchRequest, ScrapeStatus, SimilarityFilters,
    SimilarityRequest, VectorStore,
};

// ── fixture site ─────────────────────────────────────────────────────────

fn paragraph(topic: &str) -> String {
    format!(
        "<p>{topic} — Acme builds industrial anvils for discerning customers. \
         The product line spans forty years of engineering excellence and three \
         continents of manufacturing capacity, with dedicated support teams in \
         every region. We serve over two thousand enterprise customers who rely \
         on our hardware for mission critical operations. The company was \
         founded in 1949 and remains family owned, employing around three \
         hundred people across five sites. Safety and precision define \
         everything we ship, from the smallest bench anvil to the ten ton drop \
         forge models used by national railways around the world.</p>"
    )
}

fn page(title: &str, body: &str) -> Html<String> {
    Html(format!(
        "<html><head><title>{title}</title></head><body><main>{body}</main></body></html>"
    ))
}

/// Serve a small company site on an ephemeral port; returns its base URL.
async fn spawn_fixture_site(with_slow_pages: bool) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let base = format!("http://{addr}");

    let home_links = {
        let mut links = vec![
            "/about", "/team", "/products", "/careers", "/contact", "/news",
        ]
        .into_iter()
        .map(String::from)
        .collect::<Vec<_>>();
        if with_slow_pages {
            links.extend((0..5).map(|i| format!("/slow/{i}")));
        }
        links
    };
    let home_body = format!(
        "{}<ul>{}</ul>\
         <script src=\"https://widget.intercom.io/widget/abc\"></script>\
         <form action=\"/subscribe\"><input type=\"email\"></form>",
        paragraph("Welcome"),
        home_links
            .iter()
            .map(|l| format!("<li><a href=\"{l}\">{l}</a></li>"))
            .collect::<String>()
    );

    let robots = format!(
        "User-agent: *\nDisallow: /admin\nSitemap: {base}/sitemap.xml\n"
    );
    let sitemap = format!(
        "<?xml version=\"1.0\"?><urlset>\
         <url><loc>{base}/about</loc></url>\
         <url><loc>{base}/products</loc></url>\
         </urlset>"
    );

    let app = Router::new()
        .route("/", get(move || async move { page("Acme Anvils", &home_body) }))
        .route("/robots.txt", get(move || async move { robots }))
        .route("/sitemap.xml", get(move || async move { sitemap }))
        .route(
            "/about",
            get(|| async { page("About Acme", &paragraph("About us")) }),
        )
        .route(
            "/team",
            get(|| async { page("Team", &paragraph("Leadership team")) }),
        )
        .route(
            "/products",
            get(|| async { page("Products", &paragraph("Product catalog")) }),
        )
        .route(
            "/careers",
            get(|| async {
                page(
                    "Careers",
                    &format!("{} Join our team — open positions.", paragraph("Careers")),
                )
            }),
        )
        .route(
            "/contact",
            get(|| async { page("Contact", &paragraph("Contact and locations")) }),
        )
        .route(
            "/news",
            get(|| async { page("News", &paragraph("Press releases")) }),
        )
        .route(
            "/slow/{n}",
            get(|AxumPath(_n): AxumPath<String>| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                page("Slow", &paragraph("Slow page"))
            }),
        );

    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    base
}

// ── mock providers ───────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq)]
enum SelectionBehavior {
    Normal,
    Timeout,
    PreferSlow,
}

struct MockLlm {
    selection: SelectionBehavior,
}

impl MockLlm {
    fn new(selection: SelectionBehavior) -> Arc<Self> {
        Arc::new(Self { selection })
    }

    fn candidate_urls(prompt: &str) -> Vec<String> {
        let mut urls: Vec<String> = prompt
            .split_whitespace()
            .filter(|t| t.starts_with("http"))
            .map(|t| t.to_string())
            .collect();
        urls.dedup();
        urls
    }
}

#[async_trait]
impl LlmProvider for MockLlm {
    async fn complete(&self, req: &CompletionRequest) -> EngineResult<String> {
        match req.purpose.as_str() {
            "page_selection" => {
                match self.selection {
                    SelectionBehavior::Timeout => {
                        Err(EngineError::timeout("llm_timeout", "injected timeout"))
                    }
                    SelectionBehavior::Normal => {
                        let urls = Self::candidate_urls(&req.prompt);
                        let selected: Vec<&String> = urls.iter().take(12).collect();
                        Ok(serde_json::json!({"selected": selected, "reasons": {}}).to_string())
                    }
                    SelectionBehavior::PreferSlow => {
                        let urls = Self::candidate_urls(&req.prompt);
                        let selected: Vec<&String> =
                            urls.iter().filter(|u| u.contains("/slow/")).collect();
                        Ok(serde_json::json!({"selected": selected, "reasons": {}}).to_string())
                    }
                }
            }
            "aggregation" => Ok(serde_json::json!({
                "industry": "Manufacturing",
                "business_model": "B2B",
                "target_market": "Enterprise heavy industry",
                "company_stage": "mature",
                "company_size": "201-500",
                "description": "Acme builds industrial anvils and drop forges.",
                "value_proposition": "Heaviest anvils per dollar.",
                "key_services": ["anvils", "drop forges", "Anvils"],
                "tech_stack": ["steel", "forging"],
                "leadership_team": ["Wile E. Coyote"],
                "founding_year": 1949,
                "social_media": {"linkedin": "https://linkedin.com/company/acme"},
            })
            .to_string()),
            "classification" => Ok(serde_json::json!({
                "label": "Manufacturing & Industrial Software",
                "is_saas": false,
                "confidence": 0.82,
                "justification": "Hardware manufacturer with industrial focus.",
            })
            .to_string()),
            "similarity_web_search" => Ok(serde_json::json!({
                "companies": [
                    {"name": "Umbrella Forge", "website": "https://umbrella-forge.test"},
                    {"name": "Beta Metals", "website": "https://beta-metals.test"},
                ]
            })
            .to_string()),
            "similarity_explanation" => Ok(serde_json::json!({
                "explanation": "Both sell industrial equipment to the same market."
            })
            .to_string()),
            other => Err(EngineError::internal(format!("unexpected purpose '{other}'"))),
        }
    }
}

/// Deterministic hash-based embedder, dimension 16.
struct MockEmbedder;

#[async_trait]
impl EmbeddingProvider for MockEmbedder {
    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        let mut v = vec![0f32; 16];
        for (i, b) in text.bytes().enumerate() {
            v[i % 16] += (b as f32) / 255.0;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-6);
        Ok(v.into_iter().map(|x| x / norm).collect())
    }

    fn dim(&self) -> usize {
        16
    }
}

fn test_config() -> EngineConfig {
    serde_json::from_value(serde_json::json!({
        "llm": {
            "requests_per_minute": 600000.0,
            "timeout_s": {"selection": 3, "aggregation": 10, "classification": 5}
        },
        "crawl": {
            "max_links": 100,
            "max_depth": 2,
            "discovery_timeout_s": 5,
            "per_page_timeout_s": 10,
            "parallelism": 8
        },
        "research": {"overall_timeout_s": 60}
    }))
    .unwrap()
}

fn build_engine(
    llm: Arc<MockLlm>,
    store: Arc<MemoryStore>,
    config: EngineConfig,
) -> Arc<Engine> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()
        .unwrap();
    Engine::new(client, config, llm, Arc::new(MockEmbedder), store)
}

// ── scenarios ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_happy_path_research_success() {
    let base = spawn_fixture_site(false).await;
    let store = Arc::new(MemoryStore::new());
    let engine = build_engine(
        MockLlm::new(SelectionBehavior::Normal),
        Arc::clone(&store),
        test_config(),
    );

    let record = engine
        .research_with_job(
            ResearchRequest {
                name: "Acme Anvils".into(),
                website: Some(base.clone()),
                options: None,
            },
            "happy-path",
        )
        .await
        .unwrap();

    assert_eq!(record.scrape_status, ScrapeStatus::Success, "{:?}", record.scrape_error);
    assert_eq!(record.industry.as_deref(), Some("Manufacturing"));
    assert_eq!(record.founding_year, Some(1949));
    assert_eq!(record.embedding.as_ref().unwrap().len(), 16);
    assert!(record.pages_crawled.len() >= 3, "{:?}", record.pages_crawled);
    // Case-insensitive list dedup collapsed "anvils"/"Anvils".
    assert_eq!(record.key_services, vec!["anvils", "drop forges"]);
    // Site signals detected from markup, not the LLM.
    assert!(record.has_chat_widget);
    assert!(record.has_forms);
    assert!(record.has_job_listings);
    assert_eq!(
        record.saas_classification.as_deref(),
        Some("Manufacturing & Industrial Software")
    );
    assert!(!record.is_saas);

    // Stored exactly once and terminal event is `completed`.
    assert_eq!(store.count().await.unwrap(), 1);
    let snapshot = engine.progress.snapshot("happy-path").await.unwrap();
    assert_eq!(snapshot.terminal, Some(PhaseState::Completed));
}

#[tokio::test]
async fn test_unreachable_site_completes_partial() {
    let store = Arc::new(MemoryStore::new());
    let engine = build_engine(
        MockLlm::new(SelectionBehavior::Normal),
        Arc::clone(&store),
        test_config(),
    );

    let record = engine
        .research_with_job(
            ResearchRequest {
                name: "Ghost Co".into(),
                // Nothing listens here; connections are refused immediately.
                website: Some("http://127.0.0.1:9".into()),
                options: None,
            },
            "unreachable",
        )
        .await
        .unwrap();

    assert_eq!(record.scrape_status, ScrapeStatus::Partial);
    assert!(record.pages_crawled.is_empty());
    assert!(
        record.scrape_error.as_deref().unwrap_or("").contains("no content"),
        "scrape_error: {:?}",
        record.scrape_error
    );
    // The minimal record still went through aggregation and was stored.
    assert_eq!(store.count().await.unwrap(), 1);
    let snapshot = engine.progress.snapshot("unreachable").await.unwrap();
    assert_eq!(snapshot.terminal, Some(PhaseState::Completed));
}

#[tokio::test]
async fn test_selection_timeout_uses_heuristic_fallback() {
    let base = spawn_fixture_site(false).await;
    let store = Arc::new(MemoryStore::new());
    let engine = build_engine(
        MockLlm::new(SelectionBehavior::Timeout),
        Arc::clone(&store),
        test_config(),
    );

    let record = engine
        .research_with_job(
            ResearchRequest {
                name: "Acme Anvils".into(),
                website: Some(base),
                options: None,
            },
            "fallback",
        )
        .await
        .unwrap();

    // Heuristic fallback still selected enough pages to research.
    assert!(record.pages_crawled.len() >= 5, "{:?}", record.pages_crawled);
    assert_eq!(record.scrape_status, ScrapeStatus::Partial);

    let snapshot = engine.progress.snapshot("fallback").await.unwrap();
    assert_eq!(snapshot.terminal, Some(PhaseState::Completed));
    assert!(
        snapshot.log.iter().any(|l| l.contains("partial (fallback)")),
        "log: {:?}",
        snapshot.log
    );
}

#[tokio::test]
async fn test_cancellation_mid_extraction_discards_record() {
    let base = spawn_fixture_site(true).await;
    let store = Arc::new(MemoryStore::new());
    let mut config = test_config();
    config.crawl.discovery_timeout_s = Some(2);
    let engine = build_engine(
        MockLlm::new(SelectionBehavior::PreferSlow),
        Arc::clone(&store),
        config,
    );

    let job_id = "cancel-me";
    let runner = {
        let engine = Arc::clone(&engine);
        let base = base.clone();
        tokio::spawn(async move {
            engine
                .research_with_job(
                    ResearchRequest {
                        name: "Acme Anvils".into(),
                        website: Some(base),
                        options: None,
                    },
                    job_id,
                )
                .await
        })
    };

    // Let the job get through discovery/selection and into extraction of the
    // slow pages, then cancel.
    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert!(engine.cancel_job(job_id).await);

    let started = std::time::Instant::now();
    let result = runner.await.unwrap();
    // Cancellation must cut the job short instead of waiting out the slow
    // fetches (30s each).
    assert!(started.elapsed() < Duration::from_secs(5));

    let err = result.unwrap_err();
    assert_eq!(err.kind, prospect_scout::ErrorKind::Cancelled);

    // Partial state is discarded: nothing reaches the store.
    assert_eq!(store.count().await.unwrap(), 0);
    let snapshot = engine.progress.snapshot(job_id).await.unwrap();
    assert_eq!(snapshot.terminal, Some(PhaseState::Cancelled));
}

#[tokio::test]
async fn test_batch_counts_and_resume_cache() {
    let base = spawn_fixture_site(false).await;
    let store = Arc::new(MemoryStore::new());
    let engine = build_engine(
        MockLlm::new(SelectionBehavior::Normal),
        Arc::clone(&store),
        test_config(),
    );

    let rows = vec![
        BatchRow {
            name: "Acme Anvils".into(),
            website: Some(base.clone()),
        },
        BatchRow {
            name: "Ghost Co".into(),
            website: Some("http://127.0.0.1:9".into()),
        },
    ];

    let coordinator = engine.batch();
    let cancel = tokio_util::sync::CancellationToken::new();
    let report = coordinator
        .run(
            BatchRequest {
                rows: rows.clone(),
                concurrency: Some(2),
                resume: false,
            },
            &cancel,
            None,
        )
        .await;

    assert_eq!(report.total, 2);
    // processed = successful + failed (+ skipped); both rows complete here.
    assert_eq!(report.successful + report.failed + report.skipped, 2);
    assert_eq!(report.successful, 2); // unreachable row still lands `partial`

    // Re-run with resume: both rows are served from the outcome cache.
    let report2 = coordinator
        .run(
            BatchRequest {
                rows,
                concurrency: Some(2),
                resume: true,
            },
            &cancel,
            None,
        )
        .await;
    assert_eq!(report2.skipped, 2);
}

#[tokio::test]
async fn test_similarity_hybrid_sorted_unique_above_threshold() {
    let store = Arc::new(MemoryStore::new());
    let engine = build_engine(
        MockLlm::new(SelectionBehavior::Normal),
        Arc::clone(&store),
        test_config(),
    );

    // Seed three stored companies with near-identical profiles and one
    // outlier.
    let mut target = prospect_scout::CompanyRecord::new("Acme Anvils", "https://acme.test");
    target.business_model = Some("B2B".into());
    target.industry = Some("Manufacturing".into());
    target.company_size = Some("201-500".into());
    target.target_market = Some("Enterprise heavy industry".into());
    target.company_stage = Some("mature".into());
    target.tech_stack = vec!["steel".into(), "forging".into()];
    target.embedding = Some(MockEmbedder.embed("acme").await.unwrap());

    let mut peer = target.clone();
    peer.id = "peer-1".into();
    peer.name = "Umbrella Forge".into();
    peer.website = "https://umbrella-forge.test".into();
    peer.embedding = Some(MockEmbedder.embed("umbrella").await.unwrap());

    let mut outlier = prospect_scout::CompanyRecord::new("Soft SaaS", "https://softsaas.test");
    outlier.business_model = Some("B2C".into());
    outlier.industry = Some("Education".into());
    outlier.embedding = Some(MockEmbedder.embed("soft").await.unwrap());

    store.upsert(&target).await.unwrap();
    store.upsert(&peer).await.unwrap();
    store.upsert(&outlier).await.unwrap();

    let results = engine
        .discover_similar(&SimilarityRequest {
            query: target.id.clone(),
            k: 10,
            filters: SimilarityFilters::default(),
            source: DiscoverySource::Hybrid,
            threshold: Some(0.7),
            explain: false,
        })
        .await
        .unwrap();

    assert!(!results.is_empty());
    for r in &results {
        assert!(r.score >= 0.7, "{} scored {}", r.name, r.score);
        assert!(r.breakdown.business_model > 0.0);
    }
    // Sorted descending, unique ids, target itself excluded.
    for pair in results.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
    let mut ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), results.len());
    assert!(results.iter().all(|r| r.id != target.id));
    // The known peer ranks above any web-only stub.
    assert_eq!(results[0].name, "Umbrella Forge");
}
