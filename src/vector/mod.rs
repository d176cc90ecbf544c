//! Vector store adapter (C9).
//!
//! The engine depends only on the `VectorStore` capability set; `LanceStore`
//! is the production backend and `MemoryStore` backs tests and degraded
//! startup.

pub mod lance;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::EngineResult;
use crate::core::types::CompanyRecord;

pub use lance::LanceStore;
pub use memory::MemoryStore;

/// Metadata subset persisted beside every vector; enough for filtering and
/// result display without fetching full records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyMeta {
    pub id: String,
    pub name: String,
    pub website: String,
    pub industry: Option<String>,
    pub business_model: Option<String>,
    pub company_stage: Option<String>,
    pub is_saas: bool,
    pub saas_classification: Option<String>,
    pub classification_confidence: f64,
    pub last_updated: DateTime<Utc>,
}

impl CompanyMeta {
    pub fn from_record(record: &CompanyRecord) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            website: record.website.clone(),
            industry: record.industry.clone(),
            business_model: record.business_model.clone(),
            company_stage: record.company_stage.clone(),
            is_saas: record.is_saas,
            saas_classification: record.saas_classification.clone(),
            classification_confidence: record.classification_confidence,
            last_updated: record.last_updated,
        }
    }
}

/// Equality filters over the persisted metadata.
#[derive(Debug, Clone, Default)]
pub struct VectorFilters {
    pub industry: Option<String>,
    pub business_model: Option<String>,
    pub company_stage: Option<String>,
}

impl VectorFilters {
    pub fn is_empty(&self) -> bool {
        self.industry.is_none() && self.business_model.is_none() && self.company_stage.is_none()
    }

    pub fn matches(&self, meta: &CompanyMeta) -> bool {
        let eq = |filter: &Option<String>, value: &Option<String>| match filter {
            None => true,
            Some(f) => value
                .as_deref()
                .is_some_and(|v| v.eq_ignore_ascii_case(f)),
        };
        eq(&self.industry, &meta.industry)
            && eq(&self.business_model, &meta.business_model)
            && eq(&self.company_stage, &meta.company_stage)
    }
}

#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    /// Similarity in [0, 1] (cosine).
    pub score: f64,
    pub meta: CompanyMeta,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Write vector + metadata + full record under `record.id`. Idempotent:
    /// repeating the same record leaves the store unchanged.
    async fn upsert(&self, record: &CompanyRecord) -> EngineResult<()>;

    /// k-nearest records by cosine similarity, filtered by metadata equality.
    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filters: &VectorFilters,
    ) -> EngineResult<Vec<VectorHit>>;

    async fn fetch(&self, id: &str) -> EngineResult<Option<CompanyRecord>>;

    async fn delete(&self, id: &str) -> EngineResult<()>;

    async fn list(&self, offset: usize, limit: usize) -> EngineResult<Vec<CompanyMeta>>;

    async fn count(&self) -> EngineResult<usize>;
}

/// Cosine similarity between two f32 vectors; 0.0 on shape mismatch or zero
/// magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_filters_match_case_insensitive() {
        let mut record = CompanyRecord::new("Acme", "https://acme.test");
        record.industry = Some("Fintech".into());
        let meta = CompanyMeta::from_record(&record);

        let filters = VectorFilters {
            industry: Some("fintech".into()),
            ..Default::default()
        };
        assert!(filters.matches(&meta));

        let filters = VectorFilters {
            industry: Some("healthcare".into()),
            ..Default::default()
        };
        assert!(!filters.matches(&meta));

        assert!(VectorFilters::default().matches(&meta));
    }
}
