use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use crate::core::app_state::Engine;
use crate::core::errors::{EngineError, EngineResult, ErrorKind};
use crate::core::types::{
    CompanyFacts, CompanyRecord, Phase, PhaseState, ResearchRequest, ScrapeStatus,
};
use crate::embedding::build_embedding_text;
use crate::llm::backoff_with_jitter;
use crate::research::aggregate::{aggregate, AggregatorConfig};
use crate::research::classify::classify;
use crate::research::extract::{extract_pages, ExtractorConfig};
use crate::research::select::{select_pages, SelectorConfig};
use crate::scraping::{discover_links, DiscoveryConfig};

const UPSERT_RETRIES: u32 = 2;

/// Run one research job end to end (C10).
///
/// Phases run in order with their own deadlines under the overall job
/// deadline; recoverable phase failures downgrade the outcome toward
/// `partial` instead of aborting. Exactly one terminal event is emitted on
/// the progress bus no matter how the job ends.
pub(crate) async fn run_research(
    engine: &Engine,
    request: &ResearchRequest,
    job_id: &str,
    cancel: CancellationToken,
) -> EngineResult<CompanyRecord> {
    // Input validation happens before job creation; bad input never shows up
    // as a failed job.
    let name = request.name.trim();
    if name.is_empty() {
        return Err(EngineError::input("name_required", "company name is empty"));
    }
    let website = request
        .website
        .as_deref()
        .map(str::trim)
        .filter(|w| !w.is_empty())
        .ok_or_else(|| {
            EngineError::input(
                "website_required",
                "no website given; resolve the company URL before calling research",
            )
        })?;
    let base_url = normalize_website(website)?;

    engine.progress.create(job_id, &Phase::PIPELINE).await?;

    let result = run_phases(engine, request, job_id, name, &base_url, &cancel).await;

    // The terminal event is guaranteed regardless of how the phases ended.
    let (state, message) = match &result {
        Ok(record) => (
            PhaseState::Completed,
            format!("scrape_status={:?}", record.scrape_status),
        ),
        Err(e) if e.kind == ErrorKind::Cancelled => {
            (PhaseState::Cancelled, "job cancelled".to_string())
        }
        Err(e) => (PhaseState::Failed, format!("{}: {}", e.code, e.message)),
    };
    let _ = engine
        .progress
        .update(job_id, Phase::Job, state, Some(message), None)
        .await;

    result
}

async fn run_phases(
    engine: &Engine,
    request: &ResearchRequest,
    job_id: &str,
    name: &str,
    base_url: &Url,
    cancel: &CancellationToken,
) -> EngineResult<CompanyRecord> {
    let cfg = &engine.config;
    let opts = request.options.clone().unwrap_or_default();
    let started = Instant::now();
    let overall = Duration::from_secs(
        opts.timeout_s
            .unwrap_or_else(|| cfg.research.resolve_overall_timeout_s()),
    );
    let job_deadline = started + overall;
    let remaining = move || job_deadline.saturating_duration_since(Instant::now());

    let mut record = CompanyRecord::new(name, base_url.as_str());
    record.scrape_status = ScrapeStatus::Running;
    let mut partial_reasons: Vec<String> = Vec::new();

    // ── C3: link discovery ───────────────────────────────────────────────
    ensure_live(cancel)?;
    emit(engine, job_id, Phase::LinkDiscovery, PhaseState::Running, None, None).await;

    let discovery_cfg = DiscoveryConfig {
        max_links: opts.max_links.unwrap_or_else(|| cfg.crawl.resolve_max_links()),
        max_depth: cfg.crawl.resolve_max_depth(),
        per_host_concurrency: cfg.crawl.resolve_per_host_concurrency(),
        deadline: Duration::from_secs(cfg.crawl.resolve_discovery_timeout_s()).min(remaining()),
        per_page_timeout: Duration::from_secs(8),
    };
    let discovery = discover_links(
        &engine.fetcher,
        &engine.robots,
        &engine.http_client,
        base_url,
        &discovery_cfg,
        cancel,
    )
    .await;
    ensure_live(cancel)?;

    record.crawl_depth = discovery.max_depth_reached;
    let empty_discovery = discovery.pages_fetched == 0 && discovery.links.len() <= 1;
    if empty_discovery {
        partial_reasons.push("no content: site unreachable or empty".to_string());
    }
    emit(
        engine,
        job_id,
        Phase::LinkDiscovery,
        PhaseState::Completed,
        Some(format!("{} candidate urls", discovery.links.len())),
        Some(BTreeMap::from([
            ("links".to_string(), discovery.links.len() as u64),
            ("pages_fetched".to_string(), discovery.pages_fetched as u64),
            ("fetch_failures".to_string(), discovery.fetch_failures as u64),
        ])),
    )
    .await;

    // ── C4: page selection ───────────────────────────────────────────────
    emit(engine, job_id, Phase::PageSelection, PhaseState::Running, None, None).await;

    let selector_cfg = SelectorConfig {
        top_k: cfg.research.resolve_select_top_k(),
        deadline: Duration::from_secs(cfg.llm.resolve_selection_timeout_s()).min(remaining()),
    };
    let links = if empty_discovery { &[][..] } else { &discovery.links[..] };
    let selection = select_pages(&engine.llm, links, name, &selector_cfg, cancel).await;
    ensure_live(cancel)?;

    let mut urls = selection.urls;
    if let Some(max_pages) = opts.max_pages {
        urls.truncate(max_pages);
    }
    if selection.partial && !empty_discovery {
        partial_reasons.push("page_selection: partial (fallback)".to_string());
        emit(
            engine,
            job_id,
            Phase::PageSelection,
            PhaseState::Completed,
            Some("partial (fallback)".to_string()),
            Some(BTreeMap::from([("selected".to_string(), urls.len() as u64)])),
        )
        .await;
    } else {
        emit(
            engine,
            job_id,
            Phase::PageSelection,
            PhaseState::Completed,
            Some(format!("{} urls selected", urls.len())),
            None,
        )
        .await;
    }

    // ── C5: content extraction ───────────────────────────────────────────
    emit(engine, job_id, Phase::ContentExtraction, PhaseState::Running, None, None).await;

    // Reserve part of the remaining budget for aggregation so a slow site
    // cannot starve the synthesis call.
    let aggregation_reserve =
        Duration::from_secs(cfg.llm.resolve_aggregation_timeout_s()).min(remaining() / 2);
    let extraction_deadline = Instant::now() + remaining().saturating_sub(aggregation_reserve);
    let extractor_cfg = ExtractorConfig {
        parallelism: cfg.crawl.resolve_parallelism(),
        per_page_timeout: Duration::from_secs(cfg.crawl.resolve_per_page_timeout_s()),
        max_chars_per_page: cfg.crawl.resolve_max_chars_per_page(),
    };
    let extraction =
        extract_pages(&engine.fetcher, &urls, &extractor_cfg, extraction_deadline, cancel).await;
    ensure_live(cancel)?;

    record.pages_crawled = extraction.pages.iter().map(|p| p.url.clone()).collect();
    record.has_chat_widget = extraction.signals.has_chat_widget;
    record.has_forms = extraction.signals.has_forms;
    record.has_job_listings = extraction.signals.has_job_listings;
    if extraction.pages.is_empty() && !empty_discovery {
        partial_reasons.push("no content: all page fetches failed".to_string());
    }
    emit(
        engine,
        job_id,
        Phase::ContentExtraction,
        PhaseState::Completed,
        Some(format!(
            "{}/{} pages extracted",
            extraction.pages.len(),
            extraction.attempted
        )),
        Some(BTreeMap::from([
            ("pages".to_string(), extraction.pages.len() as u64),
            ("failures".to_string(), extraction.failures.len() as u64),
        ])),
    )
    .await;

    // ── C6: aggregation ──────────────────────────────────────────────────
    emit(engine, job_id, Phase::Aggregation, PhaseState::Running, None, None).await;

    let aggregator_cfg = AggregatorConfig {
        chars_per_page: cfg.research.resolve_aggregation_chars_per_page(),
        max_pages: cfg.research.resolve_aggregation_max_pages(),
        deadline: Duration::from_secs(cfg.llm.resolve_aggregation_timeout_s())
            .min(remaining().max(Duration::from_secs(1))),
        list_cap: cfg.research.resolve_list_cap(),
    };
    match aggregate(
        &engine.llm,
        name,
        base_url.as_str(),
        &extraction.pages,
        &aggregator_cfg,
        cancel,
    )
    .await
    {
        Ok(outcome) => {
            apply_facts(&mut record, outcome.facts);
            if outcome.partial {
                partial_reasons.push(format!(
                    "aggregation dropped fields: {}",
                    outcome.dropped_fields.join(", ")
                ));
            }
            emit(engine, job_id, Phase::Aggregation, PhaseState::Completed, None, None).await;
        }
        Err(e) if e.kind == ErrorKind::Cancelled => return Err(e),
        Err(e) => {
            // No synthesis at all means there is no useful record to store.
            emit(
                engine,
                job_id,
                Phase::Aggregation,
                PhaseState::Failed,
                Some(e.to_string()),
                None,
            )
            .await;
            return Err(e.with_phase(Phase::Aggregation));
        }
    }

    // ── C7: classification ───────────────────────────────────────────────
    emit(engine, job_id, Phase::Classification, PhaseState::Running, None, None).await;

    let classification_deadline =
        Duration::from_secs(cfg.llm.resolve_classification_timeout_s())
            .min(remaining().max(Duration::from_secs(1)));
    match classify(
        &engine.llm,
        &engine.taxonomy,
        &record,
        classification_deadline,
        cancel,
    )
    .await
    {
        Err(e) if e.kind == ErrorKind::Cancelled => return Err(e),
        Err(_) | Ok(None) => {
            partial_reasons.push("classification unavailable".to_string());
            emit(
                engine,
                job_id,
                Phase::Classification,
                PhaseState::Failed,
                Some("record stored without classification".to_string()),
                None,
            )
            .await;
        }
        Ok(Some(c)) => {
            record.saas_classification = Some(c.label);
            record.is_saas = c.is_saas;
            record.classification_confidence = c.confidence;
            record.classification_justification = Some(c.justification);
            emit(engine, job_id, Phase::Classification, PhaseState::Completed, None, None).await;
        }
    }

    // ── C8: embedding ────────────────────────────────────────────────────
    ensure_live(cancel)?;
    emit(engine, job_id, Phase::Embedding, PhaseState::Running, None, None).await;

    let embed_deadline = Duration::from_secs(30).min(remaining().max(Duration::from_secs(1)));
    let embed_text = build_embedding_text(&record);
    match tokio::time::timeout(embed_deadline, engine.embedder.embed(&embed_text)).await {
        Ok(Ok(vector)) => {
            record.embedding = Some(vector);
            emit(engine, job_id, Phase::Embedding, PhaseState::Completed, None, None).await;
        }
        Ok(Err(e)) => {
            warn!("embedding failed for {}: {}", record.name, e);
            partial_reasons.push("embedding unavailable".to_string());
            emit(
                engine,
                job_id,
                Phase::Embedding,
                PhaseState::Failed,
                Some(e.to_string()),
                None,
            )
            .await;
        }
        Err(_) => {
            partial_reasons.push("embedding timed out".to_string());
            emit(
                engine,
                job_id,
                Phase::Embedding,
                PhaseState::Failed,
                Some("deadline exceeded".to_string()),
                None,
            )
            .await;
        }
    }

    // ── C9: store ────────────────────────────────────────────────────────
    ensure_live(cancel)?;
    emit(engine, job_id, Phase::Store, PhaseState::Running, None, None).await;

    record.scrape_status = if partial_reasons.is_empty() {
        ScrapeStatus::Success
    } else {
        ScrapeStatus::Partial
    };
    record.scrape_error = (!partial_reasons.is_empty()).then(|| partial_reasons.join("; "));
    record.crawl_duration_s = started.elapsed().as_secs_f64();
    record.last_updated = chrono::Utc::now();

    let mut stored = false;
    for attempt in 0..=UPSERT_RETRIES {
        ensure_live(cancel)?;
        match engine.store.upsert(&record).await {
            Ok(()) => {
                stored = true;
                break;
            }
            Err(e) if e.kind.retryable() && attempt < UPSERT_RETRIES => {
                warn!("upsert retry {attempt} for {}: {}", record.id, e);
                tokio::time::sleep(backoff_with_jitter(attempt + 1)).await;
            }
            Err(e) => {
                warn!("upsert failed for {}: {}", record.id, e);
                break;
            }
        }
    }
    if stored {
        emit(engine, job_id, Phase::Store, PhaseState::Completed, None, None).await;
    } else {
        record.scrape_status = ScrapeStatus::Partial;
        let reason = "record not stored".to_string();
        record.scrape_error = Some(match record.scrape_error.take() {
            Some(prev) => format!("{prev}; {reason}"),
            None => reason.clone(),
        });
        emit(engine, job_id, Phase::Store, PhaseState::Failed, Some(reason), None).await;
    }

    info!(
        "research finished for {} ({:?}, {} pages, {:.1}s)",
        record.name,
        record.scrape_status,
        record.pages_crawled.len(),
        record.crawl_duration_s
    );
    Ok(record)
}

fn ensure_live(cancel: &CancellationToken) -> EngineResult<()> {
    if cancel.is_cancelled() {
        Err(EngineError::cancelled())
    } else {
        Ok(())
    }
}

async fn emit(
    engine: &Engine,
    job_id: &str,
    phase: Phase,
    state: PhaseState,
    message: Option<String>,
    counters: Option<BTreeMap<String, u64>>,
) {
    if let Err(e) = engine
        .progress
        .update(job_id, phase, state, message, counters)
        .await
    {
        warn!("progress update failed for {job_id}/{phase}: {e}");
    }
}

/// Merge the aggregation output into the record; only present fields
/// overwrite.
fn apply_facts(record: &mut CompanyRecord, facts: CompanyFacts) {
    macro_rules! set_opt {
        ($field:ident) => {
            if facts.$field.is_some() {
                record.$field = facts.$field;
            }
        };
    }
    set_opt!(industry);
    set_opt!(business_model);
    set_opt!(target_market);
    set_opt!(company_stage);
    set_opt!(company_size);
    set_opt!(description);
    set_opt!(value_proposition);
    set_opt!(company_culture);
    set_opt!(founding_year);

    record.key_services = facts.key_services;
    record.competitive_advantages = facts.competitive_advantages;
    record.tech_stack = facts.tech_stack;
    record.certifications = facts.certifications;
    record.partnerships = facts.partnerships;
    record.awards = facts.awards;
    record.leadership_team = facts.leadership_team;
    record.recent_news = facts.recent_news;
    record.social_media = facts.social_media;
    record.contact_info = facts.contact_info;
    record.key_decision_makers = facts.key_decision_makers;
}

/// Normalize a user-supplied website into an absolute http(s) URL.
pub fn normalize_website(input: &str) -> EngineResult<Url> {
    let trimmed = input.trim();
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    let url = Url::parse(&with_scheme)
        .map_err(|e| EngineError::input("bad_url", format!("{input}: {e}")))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(EngineError::input(
            "bad_url",
            format!("{input}: unsupported scheme '{}'", url.scheme()),
        ));
    }
    if url.host_str().is_none() {
        return Err(EngineError::input("bad_url", format!("{input}: missing host")));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_website() {
        assert_eq!(
            normalize_website("acme.com").unwrap().as_str(),
            "https://acme.com/"
        );
        assert_eq!(
            normalize_website("http://acme.com/x").unwrap().as_str(),
            "http://acme.com/x"
        );
        assert!(normalize_website("ftp://acme.com").is_err());
        assert!(normalize_website("not a url at all").is_err());
    }

    #[test]
    fn test_apply_facts_overwrites_only_present_fields() {
        let mut record = CompanyRecord::new("Acme", "https://acme.test");
        record.industry = Some("Old".into());
        record.description = Some("Old description".into());

        let facts = CompanyFacts {
            industry: Some("Fintech".into()),
            key_services: vec!["payments".into()],
            ..Default::default()
        };
        apply_facts(&mut record, facts);

        assert_eq!(record.industry.as_deref(), Some("Fintech"));
        // Absent narrative fields keep their previous value.
        assert_eq!(record.description.as_deref(), Some("Old description"));
        assert_eq!(record.key_services, vec!["payments"]);
    }
}
