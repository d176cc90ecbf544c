use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::core::config::SimilarityWeights;
use crate::core::errors::{EngineResult, ErrorKind};
use crate::core::types::{
    CandidateCompanies, CompanyRecord, DiscoverySource, ExplanationOut, SimilarityFilters,
    SimilarityRequest, SimilarityResult,
};
use crate::embedding::EmbeddingProvider;
use crate::llm::{json_schema_for, LlmPool, LlmTask};
use crate::similarity::scoring::{factor_breakdown, overall_score, pair_confidence};
use crate::vector::{VectorFilters, VectorStore};

/// How many stored metas the web path indexes when resolving candidates to
/// known records.
const KNOWN_INDEX_LIMIT: usize = 2_000;

#[derive(Clone)]
pub struct SimilarityEngineConfig {
    pub threshold: f64,
    pub weights: SimilarityWeights,
    pub web_deadline: Duration,
    pub explain_deadline: Duration,
}

/// Similarity discovery over the vector store with an optional web-search
/// path through the LLM pool (C11).
pub struct SimilarityEngine {
    store: Arc<dyn VectorStore>,
    pool: Arc<LlmPool>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: SimilarityEngineConfig,
}

impl SimilarityEngine {
    pub fn new(
        store: Arc<dyn VectorStore>,
        pool: Arc<LlmPool>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: SimilarityEngineConfig,
    ) -> Self {
        Self {
            store,
            pool,
            embedder,
            config,
        }
    }

    /// Find companies resembling the queried one. `request.query` is a stored
    /// record id or a free-form company name.
    pub async fn discover(
        &self,
        request: &SimilarityRequest,
        cancel: &CancellationToken,
    ) -> EngineResult<Vec<SimilarityResult>> {
        let k = request.k.clamp(1, 100);
        let threshold = request
            .threshold
            .unwrap_or(self.config.threshold)
            .clamp(0.0, 1.0);

        let target = self.resolve_target(&request.query).await?;
        debug!(
            "similarity target resolved: {} (stored: {})",
            target.name,
            target.embedding.is_some()
        );

        let mut results: Vec<SimilarityResult> = match request.source {
            DiscoverySource::Vector => self.vector_path(&target, k, &request.filters).await?,
            DiscoverySource::Web => self.web_path(&target, k, cancel).await?,
            DiscoverySource::Hybrid => {
                let (vector, web) = tokio::join!(
                    self.vector_path(&target, k, &request.filters),
                    self.web_path(&target, k, cancel),
                );
                let vector = vector.unwrap_or_else(|e| {
                    warn!("hybrid vector path failed: {e}");
                    Vec::new()
                });
                let web = web.unwrap_or_else(|e| {
                    warn!("hybrid web path failed: {e}");
                    Vec::new()
                });
                merge_hybrid(vector, web)
            }
        };

        results.retain(|r| r.score >= threshold && !is_same_company(r, &target));
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        dedupe_by_id(&mut results);
        results.truncate(k);

        if request.explain {
            self.attach_explanations(&target, &mut results, cancel).await;
        }

        info!(
            "similarity discover: {} results for '{}' (source {:?}, threshold {:.2})",
            results.len(),
            request.query,
            request.source,
            threshold
        );
        Ok(results)
    }

    /// Resolve the query to a target record: stored id, stored name, or a
    /// name-only stub for companies we have never researched.
    async fn resolve_target(&self, query: &str) -> EngineResult<CompanyRecord> {
        if let Some(record) = self.store.fetch(query).await? {
            return Ok(record);
        }

        // Embed the name and see whether the nearest stored record is an
        // exact name match.
        let vector = self.embedder.embed(query).await?;
        if let Some(hit) = self
            .store
            .query(&vector, 1, &VectorFilters::default())
            .await?
            .into_iter()
            .next()
        {
            if hit.meta.name.eq_ignore_ascii_case(query) {
                if let Some(record) = self.store.fetch(&hit.id).await? {
                    return Ok(record);
                }
            }
        }

        let mut stub = CompanyRecord::new(query, "");
        stub.embedding = Some(vector);
        Ok(stub)
    }

    async fn vector_path(
        &self,
        target: &CompanyRecord,
        k: usize,
        filters: &SimilarityFilters,
    ) -> EngineResult<Vec<SimilarityResult>> {
        let Some(vector) = &target.embedding else {
            return Ok(Vec::new());
        };
        let store_filters = VectorFilters {
            industry: filters.industry.clone(),
            business_model: filters.business_model.clone(),
            company_stage: filters.company_stage.clone(),
        };

        // Over-fetch so threshold and self-filtering still leave k results.
        let hits = self.store.query(vector, k * 2 + 1, &store_filters).await?;

        let mut results = Vec::new();
        for hit in hits {
            let Some(record) = self.store.fetch(&hit.id).await? else {
                continue;
            };
            let breakdown = factor_breakdown(target, &record);
            results.push(SimilarityResult {
                id: record.id.clone(),
                name: record.name.clone(),
                website: record.website.clone(),
                score: overall_score(&breakdown, &self.config.weights),
                breakdown,
                confidence: pair_confidence(target, &record),
                source: DiscoverySource::Vector,
                known: true,
                explanation: None,
            });
        }
        Ok(results)
    }

    /// Web discovery goes through the LLM pool, so it is paced by the same
    /// token bucket as every other model call.
    async fn web_path(
        &self,
        target: &CompanyRecord,
        k: usize,
        cancel: &CancellationToken,
    ) -> EngineResult<Vec<SimilarityResult>> {
        let prompt = format!(
            "List up to {} real companies most similar to the one below. \
             Prefer direct competitors and companies with the same business \
             model and market.\n\nCompany: {}\n{}{}",
            k * 2,
            target.name,
            target
                .description
                .as_deref()
                .map(|d| format!("Description: {d}\n"))
                .unwrap_or_default(),
            target
                .industry
                .as_deref()
                .map(|i| format!("Industry: {i}\n"))
                .unwrap_or_default(),
        );

        let task = LlmTask::new(
            "similarity_web_search",
            prompt,
            self.config.web_deadline,
            cancel.clone(),
        )
        .with_system("You are a market-research assistant. Respond only with JSON.")
        .with_schema(json_schema_for::<CandidateCompanies>());

        let candidates = match self.pool.submit_parsed::<CandidateCompanies>(task).await {
            Ok(out) => out.companies,
            Err(e) if e.kind == ErrorKind::Cancelled => return Err(e),
            Err(e) => {
                warn!("web discovery call failed: {e}");
                return Ok(Vec::new());
            }
        };

        // Resolve candidates against stored records by name / website host.
        let metas = self.store.list(0, KNOWN_INDEX_LIMIT).await?;
        let mut by_name: HashMap<String, String> = HashMap::new();
        let mut by_host: HashMap<String, String> = HashMap::new();
        for meta in &metas {
            by_name.insert(meta.name.to_ascii_lowercase(), meta.id.clone());
            if let Some(host) = website_host(&meta.website) {
                by_host.insert(host, meta.id.clone());
            }
        }

        let mut results = Vec::new();
        for candidate in candidates.into_iter().take(k * 2) {
            let known_id = by_name
                .get(&candidate.name.to_ascii_lowercase())
                .or_else(|| {
                    candidate
                        .website
                        .as_deref()
                        .and_then(website_host)
                        .and_then(|h| by_host.get(&h))
                })
                .cloned();

            match known_id {
                Some(id) => {
                    let Some(record) = self.store.fetch(&id).await? else {
                        continue;
                    };
                    let breakdown = factor_breakdown(target, &record);
                    results.push(SimilarityResult {
                        id: record.id.clone(),
                        name: record.name.clone(),
                        website: record.website.clone(),
                        score: overall_score(&breakdown, &self.config.weights),
                        breakdown,
                        confidence: pair_confidence(target, &record),
                        source: DiscoverySource::Web,
                        known: true,
                        explanation: None,
                    });
                }
                None => {
                    // Unknown but named: surfaced with a synthetic id so the
                    // caller can queue it for research.
                    let website = candidate.website.clone().unwrap_or_default();
                    let stub = CompanyRecord::new(&candidate.name, &website);
                    let breakdown = factor_breakdown(target, &stub);
                    results.push(SimilarityResult {
                        id: format!("web-{}", company_key(&candidate.name, &website)),
                        name: candidate.name,
                        website,
                        score: overall_score(&breakdown, &self.config.weights),
                        breakdown,
                        confidence: pair_confidence(target, &stub) * 0.5,
                        source: DiscoverySource::Web,
                        known: false,
                        explanation: None,
                    });
                }
            }
        }
        Ok(results)
    }

    async fn attach_explanations(
        &self,
        target: &CompanyRecord,
        results: &mut [SimilarityResult],
        cancel: &CancellationToken,
    ) {
        for result in results.iter_mut() {
            if cancel.is_cancelled() {
                return;
            }
            let prompt = format!(
                "In one or two sentences, explain why {} (score {:.2}; factors: \
                 business model {:.2}, industry {:.2}, size {:.2}, tech {:.2}, \
                 market {:.2}, stage {:.2}) is similar to {}.",
                result.name,
                result.score,
                result.breakdown.business_model,
                result.breakdown.industry,
                result.breakdown.company_size,
                result.breakdown.tech,
                result.breakdown.market_focus,
                result.breakdown.growth_stage,
                target.name,
            );
            let task = LlmTask::new(
                "similarity_explanation",
                prompt,
                self.config.explain_deadline,
                cancel.clone(),
            )
            .with_schema(json_schema_for::<ExplanationOut>());

            match self.pool.submit_parsed::<ExplanationOut>(task).await {
                Ok(out) => result.explanation = Some(out.explanation),
                Err(e) => {
                    debug!("explanation call failed for {}: {e}", result.name);
                    return; // quota is better spent on the remaining work
                }
            }
        }
    }
}

/// Canonical company identity hash (FNV-1a over name + website host); the
/// merge key for hybrid discovery.
pub fn company_key(name: &str, website: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    let mut hash = FNV_OFFSET;
    let canonical = format!(
        "{}|{}",
        name.trim().to_ascii_lowercase(),
        website_host(website).unwrap_or_default()
    );
    for byte in canonical.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

fn website_host(website: &str) -> Option<String> {
    if website.trim().is_empty() {
        return None;
    }
    let with_scheme = if website.contains("://") {
        website.to_string()
    } else {
        format!("https://{website}")
    };
    Url::parse(&with_scheme)
        .ok()?
        .host_str()
        .map(|h| h.trim_start_matches("www.").to_ascii_lowercase())
}

/// Merge both hybrid paths by canonical identity: entries found by both sides
/// are tagged `Hybrid`, and the richer (known) version wins.
fn merge_hybrid(
    vector: Vec<SimilarityResult>,
    web: Vec<SimilarityResult>,
) -> Vec<SimilarityResult> {
    let mut merged: HashMap<u64, SimilarityResult> = HashMap::new();
    for result in vector {
        merged.insert(company_key(&result.name, &result.website), result);
    }
    for result in web {
        let key = company_key(&result.name, &result.website);
        match merged.get_mut(&key) {
            Some(existing) => {
                existing.source = DiscoverySource::Hybrid;
                existing.score = existing.score.max(result.score);
            }
            None => {
                merged.insert(key, result);
            }
        }
    }
    merged.into_values().collect()
}

fn is_same_company(result: &SimilarityResult, target: &CompanyRecord) -> bool {
    result.id == target.id
        || company_key(&result.name, &result.website) == company_key(&target.name, &target.website)
}

fn dedupe_by_id(results: &mut Vec<SimilarityResult>) {
    let mut seen = std::collections::HashSet::new();
    results.retain(|r| seen.insert(r.id.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FactorBreakdown;

    fn result(name: &str, website: &str, score: f64, source: DiscoverySource) -> SimilarityResult {
        SimilarityResult {
            id: format!("id-{name}"),
            name: name.to_string(),
            website: website.to_string(),
            score,
            breakdown: FactorBreakdown::default(),
            confidence: 0.5,
            source,
            known: true,
            explanation: None,
        }
    }

    #[test]
    fn test_company_key_normalizes_host() {
        assert_eq!(
            company_key("Acme", "https://www.acme.com/about"),
            company_key("  acme ", "acme.com")
        );
        assert_ne!(company_key("Acme", "acme.com"), company_key("Acme", "other.com"));
    }

    #[test]
    fn test_merge_hybrid_tags_overlap() {
        let vector = vec![result("Acme", "acme.com", 0.8, DiscoverySource::Vector)];
        let web = vec![
            result("Acme", "www.acme.com", 0.7, DiscoverySource::Web),
            result("Umbrella", "umbrella.test", 0.6, DiscoverySource::Web),
        ];
        let merged = merge_hybrid(vector, web);
        assert_eq!(merged.len(), 2);

        let acme = merged.iter().find(|r| r.name == "Acme").unwrap();
        assert_eq!(acme.source, DiscoverySource::Hybrid);
        assert!((acme.score - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_dedupe_by_id_keeps_first() {
        let mut results = vec![
            result("A", "a.com", 0.9, DiscoverySource::Vector),
            result("A", "a.com", 0.5, DiscoverySource::Web),
        ];
        dedupe_by_id(&mut results);
        assert_eq!(results.len(), 1);
        assert!((results[0].score - 0.9).abs() < 1e-9);
    }
}
