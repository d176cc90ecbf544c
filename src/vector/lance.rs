use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{
    types::Float32Type, Array, BooleanArray, FixedSizeListArray, Float32Array, Int64Array,
    RecordBatch, RecordBatchIterator, StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use lancedb::{
    query::{ExecutableQuery, QueryBase},
    Table,
};

use crate::core::errors::{EngineError, EngineResult};
use crate::core::types::CompanyRecord;
use crate::vector::{CompanyMeta, VectorFilters, VectorHit, VectorStore};

/// LanceDB-backed `VectorStore`.
///
/// The table holds the filterable metadata subset as typed columns, the full
/// record as JSON, and the embedding as a fixed-size vector column (nullable:
/// partial records without an embedding are stored but never matched by
/// similarity queries).
pub struct LanceStore {
    table: Table,
    dim: usize,
}

impl LanceStore {
    pub async fn connect(uri: &str, table_name: &str, dim: usize) -> Result<Self> {
        tracing::info!(
            "connecting LanceDB at {} (table: {}, dim: {})",
            uri,
            table_name,
            dim
        );

        let db = lancedb::connect(uri)
            .execute()
            .await
            .context("Failed to connect to LanceDB")?;

        let schema = Arc::new(Self::table_schema(dim)?);
        let table = match db.open_table(table_name).execute().await {
            Ok(table) => table,
            Err(lancedb::Error::TableNotFound { .. }) => {
                tracing::info!("creating LanceDB table '{}'", table_name);
                db.create_empty_table(table_name, schema.clone())
                    .execute()
                    .await
                    .context("Failed to create LanceDB table")?
            }
            Err(e) => return Err(e).context("Failed to open LanceDB table"),
        };

        // Index creation is best-effort; flat search still works without it.
        if let Err(e) = table
            .create_index(&["vector"], lancedb::index::Index::Auto)
            .execute()
            .await
        {
            tracing::debug!("LanceDB create_index skipped/failed: {}", e);
        }

        Ok(Self { table, dim })
    }

    fn table_schema(dim: usize) -> Result<Schema> {
        let vector_len: i32 = dim.try_into().context("Embedding dimension too large")?;
        Ok(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("name", DataType::Utf8, false),
            Field::new("website", DataType::Utf8, false),
            Field::new("industry", DataType::Utf8, true),
            Field::new("business_model", DataType::Utf8, true),
            Field::new("company_stage", DataType::Utf8, true),
            Field::new("is_saas", DataType::Boolean, false),
            Field::new("saas_classification", DataType::Utf8, true),
            Field::new("classification_confidence", DataType::Float32, false),
            Field::new("last_updated_ms", DataType::Int64, false),
            Field::new("record_json", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    vector_len,
                ),
                true,
            ),
        ]))
    }

    fn record_to_batch(&self, record: &CompanyRecord) -> Result<RecordBatch> {
        let schema = Arc::new(Self::table_schema(self.dim)?);

        if let Some(embedding) = &record.embedding {
            anyhow::ensure!(
                embedding.len() == self.dim,
                "embedding dimension mismatch: expected {}, got {}",
                self.dim,
                embedding.len()
            );
        }

        let vector_len: i32 = self.dim.try_into().context("Embedding dimension too large")?;
        let vector = FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(
            std::iter::once(
                record
                    .embedding
                    .as_ref()
                    .map(|e| e.iter().map(|v| Some(*v)).collect::<Vec<_>>()),
            ),
            vector_len,
        );

        let record_json =
            serde_json::to_string(record).context("Failed to serialize CompanyRecord")?;

        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec![record.id.clone()])),
                Arc::new(StringArray::from(vec![record.name.clone()])),
                Arc::new(StringArray::from(vec![record.website.clone()])),
                Arc::new(StringArray::from(vec![record.industry.clone()])),
                Arc::new(StringArray::from(vec![record.business_model.clone()])),
                Arc::new(StringArray::from(vec![record.company_stage.clone()])),
                Arc::new(BooleanArray::from(vec![record.is_saas])),
                Arc::new(StringArray::from(vec![record.saas_classification.clone()])),
                Arc::new(Float32Array::from(vec![
                    record.classification_confidence as f32,
                ])),
                Arc::new(Int64Array::from(vec![record.last_updated.timestamp_millis()])),
                Arc::new(StringArray::from(vec![record_json])),
                Arc::new(vector),
            ],
        )
        .context("Failed to build Arrow RecordBatch")?;

        Ok(batch)
    }

    fn filter_sql(filters: &VectorFilters) -> Option<String> {
        let mut clauses = Vec::new();
        let mut push = |column: &str, value: &Option<String>| {
            if let Some(v) = value {
                clauses.push(format!("{column} = '{}'", escape_sql(v)));
            }
        };
        push("industry", &filters.industry);
        push("business_model", &filters.business_model);
        push("company_stage", &filters.company_stage);
        if clauses.is_empty() {
            None
        } else {
            Some(clauses.join(" AND "))
        }
    }

    fn batch_to_hits(batch: &RecordBatch, with_distance: bool) -> Result<Vec<VectorHit>> {
        let get_str = |name: &str| -> Result<&StringArray> {
            batch
                .column_by_name(name)
                .with_context(|| format!("Missing column: {name}"))?
                .as_any()
                .downcast_ref::<StringArray>()
                .with_context(|| format!("Invalid type for column: {name}"))
        };

        let id_col = get_str("id")?;
        let name_col = get_str("name")?;
        let website_col = get_str("website")?;
        let industry_col = get_str("industry")?;
        let model_col = get_str("business_model")?;
        let stage_col = get_str("company_stage")?;
        let classification_col = get_str("saas_classification")?;
        let is_saas_col = batch
            .column_by_name("is_saas")
            .context("Missing column: is_saas")?
            .as_any()
            .downcast_ref::<BooleanArray>()
            .context("Invalid type for column: is_saas")?;
        let confidence_col = batch
            .column_by_name("classification_confidence")
            .context("Missing column: classification_confidence")?
            .as_any()
            .downcast_ref::<Float32Array>()
            .context("Invalid type for column: classification_confidence")?;
        let ts_col = batch
            .column_by_name("last_updated_ms")
            .context("Missing column: last_updated_ms")?
            .as_any()
            .downcast_ref::<Int64Array>()
            .context("Invalid type for column: last_updated_ms")?;

        let distance_col: Option<&Float32Array> = if with_distance {
            batch
                .column_by_name("_distance")
                .and_then(|arr| arr.as_any().downcast_ref::<Float32Array>())
        } else {
            None
        };

        let opt = |col: &StringArray, row: usize| -> Option<String> {
            if col.is_null(row) {
                None
            } else {
                Some(col.value(row).to_string())
            }
        };

        let mut out = Vec::with_capacity(batch.num_rows());
        for row in 0..batch.num_rows() {
            let last_updated = DateTime::<Utc>::from_timestamp_millis(ts_col.value(row))
                .unwrap_or_else(Utc::now);
            let score = match distance_col {
                Some(dist) => {
                    let d = dist.value(row);
                    // Cosine distance → similarity.
                    if d.is_nan() {
                        0.0
                    } else {
                        (1.0 - d as f64).clamp(0.0, 1.0)
                    }
                }
                None => 0.0,
            };
            out.push(VectorHit {
                id: id_col.value(row).to_string(),
                score,
                meta: CompanyMeta {
                    id: id_col.value(row).to_string(),
                    name: name_col.value(row).to_string(),
                    website: website_col.value(row).to_string(),
                    industry: opt(industry_col, row),
                    business_model: opt(model_col, row),
                    company_stage: opt(stage_col, row),
                    is_saas: is_saas_col.value(row),
                    saas_classification: opt(classification_col, row),
                    classification_confidence: confidence_col.value(row) as f64,
                    last_updated,
                },
            });
        }
        Ok(out)
    }

    fn internal(e: impl std::fmt::Display) -> EngineError {
        EngineError::internal(format!("vector store: {e}"))
    }
}

#[async_trait]
impl VectorStore for LanceStore {
    async fn upsert(&self, record: &CompanyRecord) -> EngineResult<()> {
        // Delete-then-add under the same id makes the write idempotent.
        self.table
            .delete(&format!("id = '{}'", escape_sql(&record.id)))
            .await
            .map_err(Self::internal)?;

        let batch = self.record_to_batch(record).map_err(Self::internal)?;
        let schema = batch.schema();
        let batches = RecordBatchIterator::new(vec![Ok(batch)].into_iter(), schema);
        self.table
            .add(batches)
            .execute()
            .await
            .map_err(Self::internal)?;

        tracing::debug!("upserted record {} ({})", record.id, record.name);
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filters: &VectorFilters,
    ) -> EngineResult<Vec<VectorHit>> {
        let mut query = self
            .table
            .query()
            .nearest_to(vector)
            .map_err(Self::internal)?
            .distance_type(lancedb::DistanceType::Cosine)
            .limit(k);

        if let Some(sql) = Self::filter_sql(filters) {
            query = query.only_if(sql);
        }

        let stream = query.execute().await.map_err(Self::internal)?;
        let batches: Vec<RecordBatch> = stream.try_collect().await.map_err(Self::internal)?;

        let mut hits = Vec::new();
        for batch in &batches {
            hits.extend(Self::batch_to_hits(batch, true).map_err(Self::internal)?);
        }
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(hits)
    }

    async fn fetch(&self, id: &str) -> EngineResult<Option<CompanyRecord>> {
        let stream = self
            .table
            .query()
            .only_if(format!("id = '{}'", escape_sql(id)))
            .limit(1)
            .execute()
            .await
            .map_err(Self::internal)?;
        let batches: Vec<RecordBatch> = stream.try_collect().await.map_err(Self::internal)?;

        for batch in &batches {
            let json_col = batch
                .column_by_name("record_json")
                .and_then(|c| c.as_any().downcast_ref::<StringArray>());
            if let Some(col) = json_col {
                if batch.num_rows() > 0 {
                    let record: CompanyRecord = serde_json::from_str(col.value(0))
                        .map_err(Self::internal)?;
                    return Ok(Some(record));
                }
            }
        }
        Ok(None)
    }

    async fn delete(&self, id: &str) -> EngineResult<()> {
        self.table
            .delete(&format!("id = '{}'", escape_sql(id)))
            .await
            .map_err(Self::internal)?;
        Ok(())
    }

    async fn list(&self, offset: usize, limit: usize) -> EngineResult<Vec<CompanyMeta>> {
        let stream = self
            .table
            .query()
            .limit(offset + limit)
            .execute()
            .await
            .map_err(Self::internal)?;
        let batches: Vec<RecordBatch> = stream.try_collect().await.map_err(Self::internal)?;

        let mut metas = Vec::new();
        for batch in &batches {
            metas.extend(
                Self::batch_to_hits(batch, false)
                    .map_err(Self::internal)?
                    .into_iter()
                    .map(|h| h.meta),
            );
        }
        Ok(metas.into_iter().skip(offset).take(limit).collect())
    }

    async fn count(&self) -> EngineResult<usize> {
        self.table
            .count_rows(None)
            .await
            .map_err(Self::internal)
    }
}

fn escape_sql(value: &str) -> String {
    value.replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_sql() {
        assert_eq!(escape_sql("plain-id"), "plain-id");
        assert_eq!(escape_sql("o'brien"), "o''brien");
    }

    #[test]
    fn test_filter_sql() {
        let filters = VectorFilters {
            industry: Some("Fintech".into()),
            business_model: Some("B2B".into()),
            company_stage: None,
        };
        assert_eq!(
            LanceStore::filter_sql(&filters).unwrap(),
            "industry = 'Fintech' AND business_model = 'B2B'"
        );
        assert!(LanceStore::filter_sql(&VectorFilters::default()).is_none());
    }

    #[tokio::test]
    async fn test_roundtrip_against_temp_db() {
        let dir = tempfile::tempdir().unwrap();
        let store = LanceStore::connect(dir.path().to_str().unwrap(), "companies", 4)
            .await
            .unwrap();

        let mut record = CompanyRecord::new("Acme", "https://acme.test");
        record.industry = Some("Fintech".into());
        record.embedding = Some(vec![1.0, 0.0, 0.0, 0.0]);
        store.upsert(&record).await.unwrap();
        // Second upsert with identical content must not duplicate.
        store.upsert(&record).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);

        let hits = store
            .query(&[1.0, 0.0, 0.0, 0.0], 5, &VectorFilters::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].meta.name, "Acme");
        assert!(hits[0].score > 0.99);

        let fetched = store.fetch(&record.id).await.unwrap().unwrap();
        assert_eq!(fetched.industry.as_deref(), Some("Fintech"));

        store.delete(&record.id).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
