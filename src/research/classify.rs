use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::errors::{EngineResult, ErrorKind};
use crate::core::taxonomy::Taxonomy;
use crate::core::types::{ClassificationOut, CompanyRecord};
use crate::llm::{json_schema_for, LlmPool, LlmTask};

/// Attempts per run: one initial call plus two label-repair retries.
const LABEL_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct Classification {
    pub label: String,
    pub is_saas: bool,
    pub confidence: f64,
    pub justification: String,
}

/// Classify a researched company against the fixed taxonomy (C7).
///
/// A label outside the taxonomy is rejected and re-asked up to twice; after
/// that the record is stored without classification (`Ok(None)`). Only
/// cancellation propagates as an error.
pub async fn classify(
    pool: &LlmPool,
    taxonomy: &Taxonomy,
    record: &CompanyRecord,
    deadline: Duration,
    cancel: &CancellationToken,
) -> EngineResult<Option<Classification>> {
    let base_prompt = build_classification_prompt(taxonomy, record);
    let mut rejection: Option<String> = None;

    for attempt in 1..=LABEL_ATTEMPTS {
        let mut prompt = base_prompt.clone();
        if let Some(reason) = &rejection {
            prompt.push_str(&format!(
                "\n\nYour previous label was rejected: {reason}. \
                 Pick the closest label from the list, verbatim."
            ));
        }

        let task = LlmTask::new("classification", prompt, deadline, cancel.clone())
            .with_system(
                "You classify companies into a fixed taxonomy. \
                 Respond only with JSON.",
            )
            .with_schema(json_schema_for::<ClassificationOut>());

        let out = match pool.submit_parsed::<ClassificationOut>(task).await {
            Ok(out) => out,
            Err(e) if e.kind == ErrorKind::Cancelled => return Err(e),
            Err(e) => {
                warn!("classification call failed (attempt {attempt}): {e}");
                return Ok(None);
            }
        };

        match taxonomy.canonicalize(&out.label) {
            Some(canonical) => {
                info!(
                    "classified as '{}' (saas: {}, confidence {:.2})",
                    canonical, out.is_saas, out.confidence
                );
                return Ok(Some(Classification {
                    label: canonical.to_string(),
                    is_saas: out.is_saas,
                    confidence: out.confidence.clamp(0.0, 1.0),
                    justification: out.justification,
                }));
            }
            None => {
                warn!(
                    "classification label '{}' is outside the taxonomy (attempt {attempt})",
                    out.label
                );
                rejection = Some(format!("'{}' is not in the taxonomy", out.label));
            }
        }
    }

    Ok(None)
}

fn build_classification_prompt(taxonomy: &Taxonomy, record: &CompanyRecord) -> String {
    let mut prompt = format!(
        "Classify this company into exactly one category from the taxonomy \
         below, decide whether it is a SaaS business, and give a confidence \
         in [0,1] with a one-sentence justification.\n\n\
         Company: {}\nWebsite: {}\n",
        record.name, record.website
    );
    if let Some(d) = &record.description {
        prompt.push_str(&format!("Description: {d}\n"));
    }
    if let Some(v) = &record.value_proposition {
        prompt.push_str(&format!("Value proposition: {v}\n"));
    }
    if !record.key_services.is_empty() {
        prompt.push_str(&format!("Key services: {}\n", record.key_services.join(", ")));
    }
    if let Some(i) = &record.industry {
        prompt.push_str(&format!("Industry: {i}\n"));
    }

    prompt.push_str("\nTaxonomy:\n");
    for label in taxonomy.labels() {
        prompt.push_str(&format!("- {label}\n"));
    }
    prompt
}
