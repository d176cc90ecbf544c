use std::convert::Infallible;
use std::env;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use futures::StreamExt;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use prospect_scout::core::config::{load_config, EngineConfig};
use prospect_scout::{
    BatchRequest, Engine, EngineError, ErrorKind, HttpEmbedder, LanceStore, LocalEmbedder,
    MemoryStore, OpenAiCompatProvider, ResearchRequest, SimilarityRequest,
};

fn parse_port_from_args() -> Option<u16> {
    let mut args = std::env::args().peekable();
    while let Some(a) = args.next() {
        if a == "--port" {
            if let Some(v) = args.next() {
                if let Ok(p) = v.parse::<u16>() {
                    return Some(p);
                }
            }
        } else if let Some(rest) = a.strip_prefix("--port=") {
            if let Ok(p) = rest.parse::<u16>() {
                return Some(p);
            }
        }
    }
    None
}

fn port_from_env() -> Option<u16> {
    for k in ["PROSPECT_SCOUT_PORT", "PORT"] {
        if let Ok(v) = std::env::var(k) {
            if let Ok(p) = v.trim().parse::<u16>() {
                return Some(p);
            }
        }
    }
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tower_http=warn"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    info!("Starting prospect-scout");

    let config = load_config();

    let http_timeout = env::var("HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(30);
    let connect_timeout = env::var("HTTP_CONNECT_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(10);
    let http_client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(http_timeout))
        .connect_timeout(std::time::Duration::from_secs(connect_timeout))
        .user_agent(concat!("prospect-scout/", env!("CARGO_PKG_VERSION")))
        .build()?;

    let engine = build_engine(http_client, config).await;

    let app = Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/research", post(research_handler))
        .route("/similar", post(similar_handler))
        .route("/batch", post(batch_handler))
        .route("/jobs/{job_id}", get(job_snapshot_handler))
        .route("/jobs/{job_id}/events", get(job_events_handler))
        .route("/jobs/{job_id}/cancel", post(cancel_handler))
        .route("/companies", get(list_handler))
        .route("/companies/{id}", get(fetch_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(engine);

    let port = parse_port_from_args().or_else(port_from_env).unwrap_or(8844);
    let addr = format!("0.0.0.0:{port}");
    info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Assemble the dependency container. Provider and store failures degrade
/// with a warning instead of refusing to start.
async fn build_engine(http_client: reqwest::Client, config: EngineConfig) -> Arc<Engine> {
    let llm_provider = Arc::new(OpenAiCompatProvider::new(
        http_client.clone(),
        config.llm.resolve_base_url(),
        config.llm.resolve_api_key(),
    ));

    let embedder: Arc<dyn prospect_scout::EmbeddingProvider> =
        if config.embedding.resolve_provider() == "local" {
            match LocalEmbedder::load(&config.embedding.resolve_local_model_id()).await {
                Ok(local) => Arc::new(local),
                Err(e) => {
                    warn!("local embedder failed to load ({e}), falling back to HTTP embedder");
                    Arc::new(http_embedder(&http_client, &config))
                }
            }
        } else {
            Arc::new(http_embedder(&http_client, &config))
        };

    let dim = embedder.dim();
    let store: Arc<dyn prospect_scout::VectorStore> = match config.vector.resolve_uri() {
        Some(uri) => match LanceStore::connect(&uri, &config.vector.resolve_table(), dim).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                warn!("LanceDB unavailable ({e}); continuing with in-memory store");
                Arc::new(MemoryStore::new())
            }
        },
        None => {
            warn!("no vector store path configured; using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    Engine::new(http_client, config, llm_provider, embedder, store)
}

fn http_embedder(client: &reqwest::Client, config: &EngineConfig) -> HttpEmbedder {
    HttpEmbedder::new(
        client.clone(),
        config.embedding.resolve_base_url(),
        config.embedding.resolve_api_key(),
        config.embedding.resolve_model(),
        config.embedding.resolve_dim(),
        config.embedding.resolve_requests_per_minute(),
    )
}

// ── handlers ─────────────────────────────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "prospect-scout",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Deserialize, Default)]
struct JobIdParam {
    job_id: Option<String>,
}

async fn research_handler(
    State(engine): State<Arc<Engine>>,
    Query(params): Query<JobIdParam>,
    Json(request): Json<ResearchRequest>,
) -> Response {
    let job_id = params
        .job_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    match engine.research_with_job(request, &job_id).await {
        Ok(record) => Json(serde_json::json!({"job_id": job_id, "record": record})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn similar_handler(
    State(engine): State<Arc<Engine>>,
    Json(request): Json<SimilarityRequest>,
) -> Response {
    match engine.discover_similar(&request).await {
        Ok(results) => Json(serde_json::json!({"results": results})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn batch_handler(
    State(engine): State<Arc<Engine>>,
    Json(request): Json<BatchRequest>,
) -> Response {
    let coordinator = engine.batch();
    let cancel = tokio_util::sync::CancellationToken::new();
    let report = coordinator.run(request, &cancel, None).await;
    Json(report).into_response()
}

async fn job_snapshot_handler(
    State(engine): State<Arc<Engine>>,
    Path(job_id): Path<String>,
) -> Response {
    match engine.progress.snapshot(&job_id).await {
        Some(progress) => Json(progress).into_response(),
        None => error_response(EngineError::input("job_unknown", format!("no job '{job_id}'"))),
    }
}

/// Newline-delimited JSON stream of progress events; ends when the job
/// reaches a terminal state.
async fn job_events_handler(
    State(engine): State<Arc<Engine>>,
    Path(job_id): Path<String>,
) -> Response {
    let Some(events) = engine.progress.subscribe(&job_id).await else {
        return error_response(EngineError::input("job_unknown", format!("no job '{job_id}'")));
    };

    let body = Body::from_stream(events.map(|event| {
        let mut line = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        line.push('\n');
        Ok::<_, Infallible>(line)
    }));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn cancel_handler(State(engine): State<Arc<Engine>>, Path(job_id): Path<String>) -> Response {
    let cancelled = engine.cancel_job(&job_id).await;
    Json(serde_json::json!({"job_id": job_id, "cancelled": cancelled})).into_response()
}

#[derive(Deserialize)]
struct ListParams {
    #[serde(default)]
    offset: usize,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

async fn list_handler(
    State(engine): State<Arc<Engine>>,
    Query(params): Query<ListParams>,
) -> Response {
    match engine.store.list(params.offset, params.limit.min(500)).await {
        Ok(companies) => Json(serde_json::json!({"companies": companies})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn fetch_handler(State(engine): State<Arc<Engine>>, Path(id): Path<String>) -> Response {
    match engine.store.fetch(&id).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => error_response(EngineError::input("not_found", format!("no company '{id}'"))),
        Err(e) => error_response(e),
    }
}

/// Stable error surface: code, message, and the last phase reached. Stack
/// traces and internals never leak to callers.
fn error_response(error: EngineError) -> Response {
    let status = match error.kind {
        ErrorKind::Input => StatusCode::BAD_REQUEST,
        ErrorKind::Quota => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Schema | ErrorKind::Permanent => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Cancelled => StatusCode::CONFLICT,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = Json(serde_json::json!({
        "error": {
            "kind": error.kind,
            "code": error.code,
            "message": error.message,
            "phase": error.phase,
        }
    }));
    (status, body).into_response()
}
