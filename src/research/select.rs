use std::collections::HashSet;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::errors::ErrorKind;
use crate::core::types::SelectionOut;
use crate::llm::{json_schema_for, LlmPool, LlmTask};
use crate::scraping::{DiscoveredLink, LinkCategory};

/// How many candidates the selection prompt lists at most; beyond this the
/// prompt stops paying for itself.
const MAX_CANDIDATES_IN_PROMPT: usize = 200;
const MIN_SELECTION: usize = 10;
const MAX_SELECTION: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMethod {
    Llm,
    Heuristic,
}

#[derive(Debug, Clone)]
pub struct PageSelection {
    pub urls: Vec<String>,
    pub method: SelectionMethod,
    /// True when the LLM path failed and the deterministic fallback ran.
    pub partial: bool,
}

#[derive(Debug, Clone)]
pub struct SelectorConfig {
    pub top_k: usize,
    pub deadline: Duration,
}

/// Choose the highest-value subset of discovered URLs (C4).
///
/// The LLM ranks candidates for business-intelligence yield; on timeout,
/// schema failure, or an empty reply, a deterministic category-and-substring
/// ranking takes over and the phase is marked partial.
pub async fn select_pages(
    pool: &LlmPool,
    links: &[DiscoveredLink],
    company: &str,
    config: &SelectorConfig,
    cancel: &CancellationToken,
) -> PageSelection {
    if links.is_empty() {
        return PageSelection {
            urls: Vec::new(),
            method: SelectionMethod::Heuristic,
            partial: true,
        };
    }

    let known: HashSet<&str> = links.iter().map(|l| l.url.as_str()).collect();
    let task = LlmTask::new(
        "page_selection",
        build_selection_prompt(company, links),
        config.deadline,
        cancel.clone(),
    )
    .with_system(
        "You select the web pages most likely to reveal business intelligence \
         about a company. Respond only with JSON.",
    )
    .with_schema(json_schema_for::<SelectionOut>())
    .with_max_tokens(2048);

    match pool.submit_parsed::<SelectionOut>(task).await {
        Ok(out) => {
            let mut urls: Vec<String> = out
                .selected
                .into_iter()
                .filter(|u| known.contains(u.as_str()))
                .collect();
            urls.dedup();
            urls.truncate(MAX_SELECTION);

            if urls.is_empty() {
                warn!("page selection returned nothing usable, falling back to heuristics");
                return PageSelection {
                    urls: heuristic_select(links, config.top_k),
                    method: SelectionMethod::Heuristic,
                    partial: true,
                };
            }

            // Top up thin selections from the heuristic ranking so downstream
            // stages always see a reasonable page budget.
            if urls.len() < MIN_SELECTION.min(links.len()) {
                let have: HashSet<&str> = urls.iter().map(|u| u.as_str()).collect();
                let extra: Vec<String> = heuristic_select(links, MIN_SELECTION)
                    .into_iter()
                    .filter(|u| !have.contains(u.as_str()))
                    .collect();
                urls.extend(extra);
                urls.truncate(MIN_SELECTION.max(config.top_k).min(MAX_SELECTION));
            }

            info!("page selection chose {} urls via llm", urls.len());
            PageSelection {
                urls,
                method: SelectionMethod::Llm,
                partial: false,
            }
        }
        Err(e) => {
            match e.kind {
                ErrorKind::Cancelled => PageSelection {
                    urls: Vec::new(),
                    method: SelectionMethod::Heuristic,
                    partial: true,
                },
                _ => {
                    warn!("page selection llm failed ({}), using heuristic fallback", e);
                    PageSelection {
                        urls: heuristic_select(links, config.top_k),
                        method: SelectionMethod::Heuristic,
                        partial: true,
                    }
                }
            }
        }
    }
}

fn build_selection_prompt(company: &str, links: &[DiscoveredLink]) -> String {
    let mut prompt = format!(
        "Company under research: {company}\n\n\
         From the candidate URLs below, select the pages most likely to reveal \
         business intelligence. Prioritize, in order: company overview, \
         about/history, team/leadership, products/services, careers (company-size \
         signal), contact/locations, news/press. Select between {MIN_SELECTION} \
         and {MAX_SELECTION} URLs (fewer if fewer exist), best first. Use the \
         exact URLs as listed.\n\nCandidates:\n"
    );
    for (i, link) in links.iter().take(MAX_CANDIDATES_IN_PROMPT).enumerate() {
        prompt.push_str(&format!(
            "{}. {} [{}]\n",
            i + 1,
            link.url,
            link.category.as_str()
        ));
    }
    prompt
}

/// Deterministic fallback ranking: category weight, path keywords, and a
/// shallow-path bonus.
pub fn heuristic_select(links: &[DiscoveredLink], top_k: usize) -> Vec<String> {
    const KEYWORDS: [&str; 10] = [
        "about", "team", "leadership", "product", "service", "pricing", "customers", "press",
        "careers", "contact",
    ];

    let mut scored: Vec<(i64, &DiscoveredLink)> = links
        .iter()
        .map(|link| {
            let mut score: i64 = match link.category {
                LinkCategory::About => 100,
                LinkCategory::Products => 90,
                LinkCategory::Team => 85,
                LinkCategory::Careers => 75,
                LinkCategory::News => 70,
                LinkCategory::Contact => 65,
                LinkCategory::Other => 10,
            };
            let lower = link.url.to_ascii_lowercase();
            score += KEYWORDS.iter().filter(|k| lower.contains(*k)).count() as i64 * 5;
            // Shallow paths tend to be canonical pages.
            let depth = lower.matches('/').count().saturating_sub(2);
            score -= depth as i64 * 3;
            (score, link)
        })
        .collect();

    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.url.cmp(&b.1.url)));
    scored
        .into_iter()
        .take(top_k)
        .map(|(_, l)| l.url.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(url: &str, category: LinkCategory) -> DiscoveredLink {
        DiscoveredLink {
            url: url.to_string(),
            category,
        }
    }

    #[test]
    fn test_heuristic_prefers_high_value_categories() {
        let links = vec![
            link("https://acme.com/blog/some-post", LinkCategory::News),
            link("https://acme.com/about", LinkCategory::About),
            link("https://acme.com/legal/privacy", LinkCategory::Other),
            link("https://acme.com/products", LinkCategory::Products),
        ];
        let selected = heuristic_select(&links, 2);
        assert_eq!(selected[0], "https://acme.com/about");
        assert_eq!(selected[1], "https://acme.com/products");
    }

    #[test]
    fn test_heuristic_respects_top_k() {
        let links: Vec<DiscoveredLink> = (0..30)
            .map(|i| link(&format!("https://acme.com/page-{i}"), LinkCategory::Other))
            .collect();
        assert_eq!(heuristic_select(&links, 15).len(), 15);
    }

    #[test]
    fn test_heuristic_is_deterministic() {
        let links = vec![
            link("https://acme.com/a", LinkCategory::Other),
            link("https://acme.com/b", LinkCategory::Other),
        ];
        assert_eq!(heuristic_select(&links, 2), heuristic_select(&links, 2));
    }

    #[test]
    fn test_prompt_lists_candidates_with_categories() {
        let links = vec![link("https://acme.com/about", LinkCategory::About)];
        let prompt = build_selection_prompt("Acme", &links);
        assert!(prompt.contains("https://acme.com/about [about]"));
        assert!(prompt.contains("Acme"));
    }
}
