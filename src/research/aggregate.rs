use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::errors::EngineResult;
use crate::core::types::CompanyFacts;
use crate::llm::{json_schema_for, LlmPool, LlmTask};
use crate::research::extract::PageContent;

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Per-page clip applied when assembling the consolidation prompt.
    pub chars_per_page: usize,
    pub max_pages: usize,
    pub deadline: Duration,
    /// Cap applied to every list field after the merge.
    pub list_cap: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            chars_per_page: 5_000,
            max_pages: 30,
            deadline: Duration::from_secs(60),
            list_cap: 15,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AggregationOutcome {
    pub facts: CompanyFacts,
    /// True when some reply fields were unusable and dropped.
    pub partial: bool,
    pub dropped_fields: Vec<String>,
}

/// Synthesize structured company facts from the extracted page texts (C6).
///
/// One large-context call consolidates every page; the reply is taken apart
/// field by field so a single malformed field never discards the rest.
/// With zero pages the call still runs on the company identity alone, which
/// is how unreachable sites end up with a minimal `partial` record.
pub async fn aggregate(
    pool: &LlmPool,
    name: &str,
    website: &str,
    pages: &[PageContent],
    config: &AggregatorConfig,
    cancel: &CancellationToken,
) -> EngineResult<AggregationOutcome> {
    let prompt = build_aggregation_prompt(name, website, pages, config);

    let task = LlmTask::new("aggregation", prompt, config.deadline, cancel.clone())
        .with_system(
            "You are a business analyst producing a structured company profile \
             from website content. Use only information supported by the \
             provided pages (or the company identity when no pages exist). \
             Leave unknown fields null or empty. Respond only with JSON.",
        )
        .with_schema(json_schema_for::<CompanyFacts>())
        .with_max_tokens(4096);

    let value = pool.submit(task).await?;
    let (mut facts, dropped_fields) = facts_from_value_lossy(&value);
    normalize_facts(&mut facts, config.list_cap);

    if !dropped_fields.is_empty() {
        warn!(
            "aggregation dropped {} unusable fields: {:?}",
            dropped_fields.len(),
            dropped_fields
        );
    }
    info!(
        "aggregation synthesized facts from {} pages ({} fields dropped)",
        pages.len(),
        dropped_fields.len()
    );

    Ok(AggregationOutcome {
        partial: !dropped_fields.is_empty(),
        facts,
        dropped_fields,
    })
}

fn build_aggregation_prompt(
    name: &str,
    website: &str,
    pages: &[PageContent],
    config: &AggregatorConfig,
) -> String {
    let mut prompt = format!(
        "Company: {name}\nWebsite: {website}\n\n\
         Synthesize a company profile from the pages below. Merging rules:\n\
         - For narrative fields (description, value_proposition, company_culture) \
           prefer the longer, more descriptive text.\n\
         - For list fields return a deduplicated union of what the pages support.\n\
         - For categorical fields (industry, business_model, target_market, \
           company_stage, company_size) pick the most specific supported value.\n\
         - founding_year is a four-digit integer or null.\n"
    );

    if pages.is_empty() {
        prompt.push_str(
            "\nNo page content is available. Fill in only what the company name \
             and domain reliably imply and leave everything else null.\n",
        );
        return prompt;
    }

    prompt.push_str("\nPages:\n");
    for page in pages.iter().take(config.max_pages) {
        let clipped: String = page.cleaned_text.chars().take(config.chars_per_page).collect();
        prompt.push_str(&format!("\n## {} — {}\n{}\n", page.url, page.title, clipped));
    }
    prompt
}

/// Pull known fields out of the reply one by one. A field that exists but has
/// the wrong shape is dropped and reported; everything else survives.
pub fn facts_from_value_lossy(value: &serde_json::Value) -> (CompanyFacts, Vec<String>) {
    let mut dropped = Vec::new();
    let Some(obj) = value.as_object() else {
        return (CompanyFacts::default(), vec!["<root>".to_string()]);
    };

    let mut take_str = |key: &str| -> Option<String> {
        match obj.get(key) {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(s)) => {
                let t = s.trim();
                (!t.is_empty()).then(|| t.to_string())
            }
            Some(_) => {
                dropped.push(key.to_string());
                None
            }
        }
    };

    let facts_strs = [
        "industry",
        "business_model",
        "target_market",
        "company_stage",
        "company_size",
        "description",
        "value_proposition",
        "company_culture",
    ]
    .map(|k| take_str(k));

    let mut take_list = |key: &str| -> Vec<String> {
        match obj.get(key) {
            None | Some(serde_json::Value::Null) => Vec::new(),
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            // A bare string is tolerated as a one-element list.
            Some(serde_json::Value::String(s)) if !s.trim().is_empty() => {
                vec![s.trim().to_string()]
            }
            Some(_) => {
                dropped.push(key.to_string());
                Vec::new()
            }
        }
    };

    let key_services = take_list("key_services");
    let competitive_advantages = take_list("competitive_advantages");
    let tech_stack = take_list("tech_stack");
    let certifications = take_list("certifications");
    let partnerships = take_list("partnerships");
    let awards = take_list("awards");
    let leadership_team = take_list("leadership_team");
    let recent_news = take_list("recent_news");

    let mut take_map = |key: &str| -> BTreeMap<String, String> {
        match obj.get(key) {
            None | Some(serde_json::Value::Null) => BTreeMap::new(),
            Some(serde_json::Value::Object(m)) => m
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.trim().to_string())))
                .filter(|(_, v)| !v.is_empty())
                .collect(),
            Some(_) => {
                dropped.push(key.to_string());
                BTreeMap::new()
            }
        }
    };

    let social_media = take_map("social_media");
    let contact_info = take_map("contact_info");
    let key_decision_makers = take_map("key_decision_makers");

    let founding_year = match obj.get("founding_year") {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::Number(n)) => n.as_i64().map(|y| y as i32),
        Some(serde_json::Value::String(s)) => s.trim().parse::<i32>().ok(),
        Some(_) => {
            dropped.push("founding_year".to_string());
            None
        }
    };

    let [industry, business_model, target_market, company_stage, company_size, description, value_proposition, company_culture] =
        facts_strs;

    (
        CompanyFacts {
            industry,
            business_model,
            target_market,
            company_stage,
            company_size,
            description,
            value_proposition,
            company_culture,
            key_services,
            competitive_advantages,
            tech_stack,
            certifications,
            partnerships,
            awards,
            leadership_team,
            recent_news,
            social_media,
            contact_info,
            key_decision_makers,
            founding_year,
        },
        dropped,
    )
}

/// Enforce list caps, case-insensitive dedup, and a sane founding year. The
/// merge itself happened in the model; this is only bookkeeping.
pub fn normalize_facts(facts: &mut CompanyFacts, list_cap: usize) {
    for list in [
        &mut facts.key_services,
        &mut facts.competitive_advantages,
        &mut facts.tech_stack,
        &mut facts.certifications,
        &mut facts.partnerships,
        &mut facts.awards,
        &mut facts.leadership_team,
        &mut facts.recent_news,
    ] {
        dedupe_ci_capped(list, list_cap);
    }

    for map in [
        &mut facts.social_media,
        &mut facts.contact_info,
        &mut facts.key_decision_makers,
    ] {
        while map.len() > list_cap {
            let last = map.keys().next_back().cloned();
            if let Some(k) = last {
                map.remove(&k);
            }
        }
    }

    if let Some(year) = facts.founding_year {
        if !(1600..=2100).contains(&year) {
            facts.founding_year = None;
        }
    }
}

/// First occurrence wins; comparison ignores case and surrounding whitespace.
pub fn dedupe_ci_capped(list: &mut Vec<String>, cap: usize) {
    let mut seen: HashSet<String> = HashSet::new();
    list.retain(|item| seen.insert(item.trim().to_ascii_lowercase()));
    list.truncate(cap);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedupe_ci_capped() {
        let mut list = vec![
            "Rust".to_string(),
            "rust".to_string(),
            " RUST ".to_string(),
            "Go".to_string(),
        ];
        dedupe_ci_capped(&mut list, 10);
        assert_eq!(list, vec!["Rust", "Go"]);

        let mut long: Vec<String> = (0..30).map(|i| format!("item{i}")).collect();
        dedupe_ci_capped(&mut long, 15);
        assert_eq!(long.len(), 15);
    }

    #[test]
    fn test_lossy_parse_keeps_good_fields() {
        let value = serde_json::json!({
            "industry": "Fintech",
            "description": "Payments infrastructure.",
            "key_services": ["payments", "billing"],
            "tech_stack": 42,                 // wrong type, dropped
            "founding_year": "2010",          // string year tolerated
            "social_media": {"twitter": "https://x.com/acme"},
        });
        let (facts, dropped) = facts_from_value_lossy(&value);
        assert_eq!(facts.industry.as_deref(), Some("Fintech"));
        assert_eq!(facts.key_services, vec!["payments", "billing"]);
        assert_eq!(facts.founding_year, Some(2010));
        assert!(facts.tech_stack.is_empty());
        assert_eq!(dropped, vec!["tech_stack"]);
    }

    #[test]
    fn test_lossy_parse_non_object() {
        let (facts, dropped) = facts_from_value_lossy(&serde_json::json!([1, 2]));
        assert!(facts.industry.is_none());
        assert_eq!(dropped, vec!["<root>"]);
    }

    #[test]
    fn test_normalize_rejects_implausible_year() {
        let mut facts = CompanyFacts {
            founding_year: Some(214),
            ..Default::default()
        };
        normalize_facts(&mut facts, 15);
        assert_eq!(facts.founding_year, None);
    }

    #[test]
    fn test_prompt_mentions_identity_when_no_pages() {
        let cfg = AggregatorConfig::default();
        let prompt = build_aggregation_prompt("Acme", "https://acme.test", &[], &cfg);
        assert!(prompt.contains("No page content is available"));
        assert!(prompt.contains("Acme"));
    }

    #[test]
    fn test_prompt_clips_pages() {
        let cfg = AggregatorConfig {
            chars_per_page: 10,
            ..Default::default()
        };
        let pages = vec![PageContent {
            url: "https://acme.test/about".into(),
            title: "About".into(),
            cleaned_text: "x".repeat(500),
            byte_count: 500,
            fetch_ms: 5,
            word_count: 1,
            language: None,
        }];
        let prompt = build_aggregation_prompt("Acme", "https://acme.test", &pages, &cfg);
        assert!(!prompt.contains(&"x".repeat(20)));
        assert!(prompt.contains(&"x".repeat(10)));
    }
}
