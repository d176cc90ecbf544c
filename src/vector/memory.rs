use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::errors::EngineResult;
use crate::core::types::CompanyRecord;
use crate::vector::{cosine_similarity, CompanyMeta, VectorFilters, VectorHit, VectorStore};

/// In-memory `VectorStore` with brute-force cosine search. Backs tests and
/// lets the engine start when no LanceDB path is usable.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, CompanyRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for MemoryStore {
    async fn upsert(&self, record: &CompanyRecord) -> EngineResult<()> {
        self.records
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filters: &VectorFilters,
    ) -> EngineResult<Vec<VectorHit>> {
        let records = self.records.read().await;
        let mut hits: Vec<VectorHit> = records
            .values()
            .filter_map(|r| {
                let embedding = r.embedding.as_ref()?;
                let meta = CompanyMeta::from_record(r);
                if !filters.matches(&meta) {
                    return None;
                }
                Some(VectorHit {
                    id: r.id.clone(),
                    score: cosine_similarity(vector, embedding) as f64,
                    meta,
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }

    async fn fetch(&self, id: &str) -> EngineResult<Option<CompanyRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn delete(&self, id: &str) -> EngineResult<()> {
        self.records.write().await.remove(id);
        Ok(())
    }

    async fn list(&self, offset: usize, limit: usize) -> EngineResult<Vec<CompanyMeta>> {
        let records = self.records.read().await;
        let mut metas: Vec<CompanyMeta> = records.values().map(CompanyMeta::from_record).collect();
        metas.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(metas.into_iter().skip(offset).take(limit).collect())
    }

    async fn count(&self) -> EngineResult<usize> {
        Ok(self.records.read().await.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, industry: &str, embedding: Vec<f32>) -> CompanyRecord {
        let mut r = CompanyRecord::new(name, &format!("https://{name}.test"));
        r.industry = Some(industry.to_string());
        r.embedding = Some(embedding);
        r
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = MemoryStore::new();
        let r = record("acme", "Fintech", vec![1.0, 0.0]);
        store.upsert(&r).await.unwrap();
        store.upsert(&r).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        let hits = store
            .query(&[1.0, 0.0], 10, &VectorFilters::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, r.id);
    }

    #[tokio::test]
    async fn test_query_ranks_by_similarity_and_filters() {
        let store = MemoryStore::new();
        store.upsert(&record("near", "Fintech", vec![1.0, 0.0])).await.unwrap();
        store.upsert(&record("far", "Fintech", vec![0.0, 1.0])).await.unwrap();
        store.upsert(&record("other", "Retail", vec![1.0, 0.0])).await.unwrap();

        let hits = store
            .query(
                &[1.0, 0.0],
                10,
                &VectorFilters {
                    industry: Some("fintech".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].meta.name, "near");
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn test_records_without_embedding_are_not_searchable() {
        let store = MemoryStore::new();
        let mut r = CompanyRecord::new("novec", "https://novec.test");
        r.embedding = None;
        store.upsert(&r).await.unwrap();

        let hits = store
            .query(&[1.0, 0.0], 10, &VectorFilters::default())
            .await
            .unwrap();
        assert!(hits.is_empty());
        // But it is still fetchable and listable.
        assert!(store.fetch(&r.id).await.unwrap().is_some());
        assert_eq!(store.list(0, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_and_pagination() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .upsert(&record(&format!("c{i}"), "Retail", vec![1.0]))
                .await
                .unwrap();
        }
        let page = store.list(2, 2).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].name, "c2");

        let id = store.list(0, 1).await.unwrap()[0].id.clone();
        store.delete(&id).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 4);
    }
}
