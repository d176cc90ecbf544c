use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Research pipeline phases
// ---------------------------------------------------------------------------

/// Sequential stages of a research job. `Job` is the synthetic phase used for
/// job-level (terminal) events on the progress bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    LinkDiscovery,
    PageSelection,
    ContentExtraction,
    Aggregation,
    Classification,
    Embedding,
    Store,
    Job,
}

impl Phase {
    pub const PIPELINE: [Phase; 7] = [
        Phase::LinkDiscovery,
        Phase::PageSelection,
        Phase::ContentExtraction,
        Phase::Aggregation,
        Phase::Classification,
        Phase::Embedding,
        Phase::Store,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::LinkDiscovery => "link_discovery",
            Phase::PageSelection => "page_selection",
            Phase::ContentExtraction => "content_extraction",
            Phase::Aggregation => "aggregation",
            Phase::Classification => "classification",
            Phase::Embedding => "embedding",
            Phase::Store => "store",
            Phase::Job => "job",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-phase (and job-level) state carried in progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl PhaseState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PhaseState::Completed | PhaseState::Failed | PhaseState::Cancelled
        )
    }
}

/// One event on the progress stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: String,
    pub seq: u64,
    pub phase: Phase,
    pub state: PhaseState,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counters: Option<BTreeMap<String, u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
    /// Set on the synthetic marker a slow subscriber receives after its
    /// buffer overflowed: how many events were dropped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lost: Option<u64>,
}

/// Point-in-time view of a job used by `ProgressBus::snapshot`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobProgress {
    pub job_id: String,
    pub phases: Vec<PhaseProgress>,
    pub log: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal: Option<PhaseState>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseProgress {
    pub phase: Phase,
    pub state: PhaseState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// CompanyRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrapeStatus {
    Pending,
    Running,
    Success,
    Partial,
    Failed,
}

/// The canonical structured output of a research job.
///
/// Narrative and categorical fields are nullable; list fields are bounded and
/// deduplicated case-insensitively before the record leaves the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyRecord {
    pub id: String,
    pub name: String,
    pub website: String,

    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub business_model: Option<String>,
    #[serde(default)]
    pub target_market: Option<String>,
    #[serde(default)]
    pub company_stage: Option<String>,
    #[serde(default)]
    pub company_size: Option<String>,

    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub value_proposition: Option<String>,
    #[serde(default)]
    pub company_culture: Option<String>,

    #[serde(default)]
    pub key_services: Vec<String>,
    #[serde(default)]
    pub competitive_advantages: Vec<String>,
    #[serde(default)]
    pub tech_stack: Vec<String>,
    #[serde(default)]
    pub certifications: Vec<String>,
    #[serde(default)]
    pub partnerships: Vec<String>,
    #[serde(default)]
    pub awards: Vec<String>,
    #[serde(default)]
    pub leadership_team: Vec<String>,
    #[serde(default)]
    pub recent_news: Vec<String>,

    #[serde(default)]
    pub social_media: BTreeMap<String, String>,
    #[serde(default)]
    pub contact_info: BTreeMap<String, String>,
    #[serde(default)]
    pub key_decision_makers: BTreeMap<String, String>,

    #[serde(default)]
    pub founding_year: Option<i32>,
    #[serde(default)]
    pub has_chat_widget: bool,
    #[serde(default)]
    pub has_forms: bool,
    #[serde(default)]
    pub has_job_listings: bool,
    #[serde(default)]
    pub is_saas: bool,

    #[serde(default)]
    pub saas_classification: Option<String>,
    #[serde(default)]
    pub classification_confidence: f64,
    #[serde(default)]
    pub classification_justification: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,

    #[serde(default)]
    pub pages_crawled: Vec<String>,
    #[serde(default)]
    pub crawl_depth: usize,
    #[serde(default)]
    pub crawl_duration_s: f64,

    pub scrape_status: ScrapeStatus,
    #[serde(default)]
    pub scrape_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl CompanyRecord {
    pub fn new(name: &str, website: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            website: website.to_string(),
            industry: None,
            business_model: None,
            target_market: None,
            company_stage: None,
            company_size: None,
            description: None,
            value_proposition: None,
            company_culture: None,
            key_services: Vec::new(),
            competitive_advantages: Vec::new(),
            tech_stack: Vec::new(),
            certifications: Vec::new(),
            partnerships: Vec::new(),
            awards: Vec::new(),
            leadership_team: Vec::new(),
            recent_news: Vec::new(),
            social_media: BTreeMap::new(),
            contact_info: BTreeMap::new(),
            key_decision_makers: BTreeMap::new(),
            founding_year: None,
            has_chat_widget: false,
            has_forms: false,
            has_job_listings: false,
            is_saas: false,
            saas_classification: None,
            classification_confidence: 0.0,
            classification_justification: None,
            embedding: None,
            pages_crawled: Vec::new(),
            crawl_depth: 0,
            crawl_duration_s: 0.0,
            scrape_status: ScrapeStatus::Pending,
            scrape_error: None,
            created_at: now,
            last_updated: now,
        }
    }

    /// Fraction of key intelligence fields that are populated. Feeds the
    /// similarity confidence computation.
    pub fn completeness(&self) -> f64 {
        let present = [
            self.industry.is_some(),
            self.business_model.is_some(),
            self.target_market.is_some(),
            self.company_stage.is_some(),
            self.company_size.is_some(),
            self.description.is_some(),
            self.value_proposition.is_some(),
            !self.key_services.is_empty(),
            !self.tech_stack.is_empty(),
            self.saas_classification.is_some(),
        ];
        let filled = present.iter().filter(|p| **p).count();
        filled as f64 / present.len() as f64
    }
}

// ---------------------------------------------------------------------------
// LLM-facing structured outputs
// ---------------------------------------------------------------------------

/// Fields the aggregation call may fill in. Every field is optional: the
/// schema validator accepts partial records and the orchestrator merges what
/// it gets into the `CompanyRecord`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CompanyFacts {
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub business_model: Option<String>,
    #[serde(default)]
    pub target_market: Option<String>,
    #[serde(default)]
    pub company_stage: Option<String>,
    #[serde(default)]
    pub company_size: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub value_proposition: Option<String>,
    #[serde(default)]
    pub company_culture: Option<String>,
    #[serde(default)]
    pub key_services: Vec<String>,
    #[serde(default)]
    pub competitive_advantages: Vec<String>,
    #[serde(default)]
    pub tech_stack: Vec<String>,
    #[serde(default)]
    pub certifications: Vec<String>,
    #[serde(default)]
    pub partnerships: Vec<String>,
    #[serde(default)]
    pub awards: Vec<String>,
    #[serde(default)]
    pub leadership_team: Vec<String>,
    #[serde(default)]
    pub recent_news: Vec<String>,
    #[serde(default)]
    pub social_media: BTreeMap<String, String>,
    #[serde(default)]
    pub contact_info: BTreeMap<String, String>,
    #[serde(default)]
    pub key_decision_makers: BTreeMap<String, String>,
    #[serde(default)]
    pub founding_year: Option<i32>,
}

/// Output schema of the page-selection call.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct SelectionOut {
    pub selected: Vec<String>,
    #[serde(default)]
    pub reasons: BTreeMap<String, String>,
}

/// Output schema of the classification call.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct ClassificationOut {
    pub label: String,
    pub is_saas: bool,
    pub confidence: f64,
    pub justification: String,
}

/// Output schema of the similarity web-discovery call.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct CandidateCompanies {
    pub companies: Vec<CandidateCompany>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct CandidateCompany {
    pub name: String,
    #[serde(default)]
    pub website: Option<String>,
}

/// Output schema of the per-result explanation call.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct ExplanationOut {
    pub explanation: String,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResearchOptions {
    #[serde(default)]
    pub timeout_s: Option<u64>,
    #[serde(default)]
    pub max_links: Option<usize>,
    #[serde(default)]
    pub max_pages: Option<usize>,
    #[serde(default)]
    pub embed_dim: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchRequest {
    pub name: String,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub options: Option<ResearchOptions>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoverySource {
    Vector,
    Web,
    Hybrid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimilarityFilters {
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub business_model: Option<String>,
    #[serde(default)]
    pub company_stage: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityRequest {
    /// Company id or free-form company name.
    pub query: String,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default)]
    pub filters: SimilarityFilters,
    pub source: DiscoverySource,
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub explain: bool,
}

fn default_k() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRow {
    pub name: String,
    #[serde(default)]
    pub website: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub rows: Vec<BatchRow>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub resume: bool,
}

// ---------------------------------------------------------------------------
// Similarity results
// ---------------------------------------------------------------------------

/// Per-factor similarity scores, each in [0, 1].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FactorBreakdown {
    pub business_model: f64,
    pub industry: f64,
    pub company_size: f64,
    pub tech: f64,
    pub market_focus: f64,
    pub growth_stage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityResult {
    pub id: String,
    pub name: String,
    pub website: String,
    pub score: f64,
    pub breakdown: FactorBreakdown,
    pub confidence: f64,
    pub source: DiscoverySource,
    /// False for web-path candidates that have no stored record yet.
    #[serde(default)]
    pub known: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

// ---------------------------------------------------------------------------
// Batch reporting
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    Success,
    Partial,
    Failed,
    SkippedCached,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowOutcome {
    pub name: String,
    pub website: Option<String>,
    pub status: RowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    pub duration_ms: u64,
}

/// Aggregate progress emitted by the batch coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchProgress {
    pub processed: usize,
    pub successful: usize,
    pub failed: usize,
    pub current_message: String,
    pub rate_per_hour: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total_duration_ms: u64,
    pub rows: Vec<RowOutcome>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_completeness() {
        let mut r = CompanyRecord::new("Acme", "https://acme.test");
        assert_eq!(r.completeness(), 0.0);
        r.industry = Some("Software".into());
        r.description = Some("Makes anvils".into());
        r.key_services = vec!["anvils".into()];
        assert!((r.completeness() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_phase_serde_names() {
        let s = serde_json::to_string(&Phase::LinkDiscovery).unwrap();
        assert_eq!(s, "\"link_discovery\"");
        assert_eq!(Phase::ContentExtraction.as_str(), "content_extraction");
    }

    #[test]
    fn test_company_facts_partial_parse() {
        // Missing fields must not fail deserialization.
        let facts: CompanyFacts =
            serde_json::from_value(serde_json::json!({"industry": "Fintech"})).unwrap();
        assert_eq!(facts.industry.as_deref(), Some("Fintech"));
        assert!(facts.key_services.is_empty());
    }
}
