//! Deterministic multi-factor similarity scoring (C11).
//!
//! Every factor is computed by fixed rules over record fields; the LLM plays
//! no part in scoring, only in optional explanations.

use crate::core::config::SimilarityWeights;
use crate::core::taxonomy::{
    business_model_group, industry_parent, model_groups_compatible, size_ordinal, stage_ordinal,
};
use crate::core::types::{CompanyRecord, FactorBreakdown};

/// Floor score for unknown or incomparable values.
const FLOOR: f64 = 0.2;

pub fn score_business_model(a: Option<&str>, b: Option<&str>) -> f64 {
    let (Some(a), Some(b)) = (a, b) else {
        return FLOOR;
    };
    if a.eq_ignore_ascii_case(b) {
        return 1.0;
    }
    let (ga, gb) = (business_model_group(a), business_model_group(b));
    if model_groups_compatible(ga, gb) {
        0.8
    } else if ga == gb && ga != "other" {
        0.6
    } else {
        FLOOR
    }
}

pub fn score_industry(a: Option<&str>, b: Option<&str>) -> f64 {
    let (Some(a), Some(b)) = (a, b) else {
        return 0.3;
    };
    if a.eq_ignore_ascii_case(b) {
        return 1.0;
    }
    let (pa, pb) = (industry_parent(a), industry_parent(b));
    // One is the other's parent in the taxonomy tree.
    if pa.is_some_and(|p| p.eq_ignore_ascii_case(b)) || pb.is_some_and(|p| p.eq_ignore_ascii_case(a))
    {
        return 0.8;
    }
    if let (Some(pa), Some(pb)) = (pa, pb) {
        if pa == pb {
            return 0.7;
        }
    }
    if normalized_levenshtein(&a.to_ascii_lowercase(), &b.to_ascii_lowercase()) > 0.7 {
        return 0.6;
    }
    0.3
}

fn ordinal_distance_score(a: Option<usize>, b: Option<usize>) -> f64 {
    let (Some(a), Some(b)) = (a, b) else {
        return FLOOR;
    };
    match a.abs_diff(b) {
        0 => 1.0,
        1 => 0.8,
        2 => 0.5,
        _ => FLOOR,
    }
}

pub fn score_company_size(a: Option<&str>, b: Option<&str>) -> f64 {
    ordinal_distance_score(a.and_then(size_ordinal), b.and_then(size_ordinal))
}

pub fn score_growth_stage(a: Option<&str>, b: Option<&str>) -> f64 {
    ordinal_distance_score(a.and_then(stage_ordinal), b.and_then(stage_ordinal))
}

/// Jaccard overlap of lower-cased stack sets.
pub fn score_tech(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let set_a: std::collections::HashSet<String> =
        a.iter().map(|s| s.trim().to_ascii_lowercase()).collect();
    let set_b: std::collections::HashSet<String> =
        b.iter().map(|s| s.trim().to_ascii_lowercase()).collect();
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Target-market similarity: exact match, then word overlap.
pub fn score_market_focus(a: Option<&str>, b: Option<&str>) -> f64 {
    let (Some(a), Some(b)) = (a, b) else {
        return FLOOR;
    };
    if a.eq_ignore_ascii_case(b) {
        return 1.0;
    }
    let words_a: std::collections::HashSet<String> = a
        .to_ascii_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect();
    let words_b: std::collections::HashSet<String> = b
        .to_ascii_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect();
    let intersection = words_a.intersection(&words_b).count();
    let union = words_a.union(&words_b).count();
    if union > 0 && intersection as f64 / union as f64 >= 0.5 {
        0.7
    } else {
        FLOOR
    }
}

/// All factor scores for a candidate against the target company.
pub fn factor_breakdown(target: &CompanyRecord, candidate: &CompanyRecord) -> FactorBreakdown {
    FactorBreakdown {
        business_model: score_business_model(
            target.business_model.as_deref(),
            candidate.business_model.as_deref(),
        ),
        industry: score_industry(target.industry.as_deref(), candidate.industry.as_deref()),
        company_size: score_company_size(
            target.company_size.as_deref(),
            candidate.company_size.as_deref(),
        ),
        tech: score_tech(&target.tech_stack, &candidate.tech_stack),
        market_focus: score_market_focus(
            target.target_market.as_deref(),
            candidate.target_market.as_deref(),
        ),
        growth_stage: score_growth_stage(
            target.company_stage.as_deref(),
            candidate.company_stage.as_deref(),
        ),
    }
}

/// Weighted sum of factor scores.
pub fn overall_score(breakdown: &FactorBreakdown, weights: &SimilarityWeights) -> f64 {
    breakdown.business_model * weights.business_model
        + breakdown.industry * weights.industry
        + breakdown.company_size * weights.company_size
        + breakdown.tech * weights.tech
        + breakdown.market_focus * weights.market_focus
        + breakdown.growth_stage * weights.growth_stage
}

/// Confidence derived from record completeness on both sides, clamped.
pub fn pair_confidence(target: &CompanyRecord, candidate: &CompanyRecord) -> f64 {
    ((target.completeness() + candidate.completeness()) / 2.0).clamp(0.0, 1.0)
}

pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// 1.0 for identical strings, 0.0 for completely different ones.
pub fn normalized_levenshtein(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / max_len as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_with(
        model: &str,
        industry: &str,
        size: &str,
        tech: &[&str],
        market: &str,
        stage: &str,
    ) -> CompanyRecord {
        let mut r = CompanyRecord::new("x", "https://x.test");
        r.business_model = Some(model.to_string());
        r.industry = Some(industry.to_string());
        r.company_size = Some(size.to_string());
        r.tech_stack = tech.iter().map(|s| s.to_string()).collect();
        r.target_market = Some(market.to_string());
        r.company_stage = Some(stage.to_string());
        r
    }

    #[test]
    fn test_business_model_rules() {
        assert_eq!(score_business_model(Some("B2B SaaS"), Some("b2b saas")), 1.0);
        assert_eq!(score_business_model(Some("B2B"), Some("Enterprise")), 0.8);
        assert_eq!(score_business_model(Some("B2C app"), Some("consumer")), 0.6);
        assert_eq!(score_business_model(Some("B2C"), Some("Enterprise")), 0.2);
        assert_eq!(score_business_model(None, Some("B2B")), 0.2);
    }

    #[test]
    fn test_industry_rules() {
        assert_eq!(score_industry(Some("Fintech"), Some("fintech")), 1.0);
        assert_eq!(
            score_industry(Some("Fintech"), Some("Financial Services")),
            0.8
        );
        assert_eq!(score_industry(Some("Fintech"), Some("InsurTech")), 0.7);
        // Close strings score via Levenshtein.
        assert_eq!(score_industry(Some("logistic"), Some("logistics")), 0.6);
        assert_eq!(score_industry(Some("Mining"), Some("Education")), 0.3);
    }

    #[test]
    fn test_size_ordinal_distances() {
        assert_eq!(score_company_size(Some("11-50"), Some("11-50")), 1.0);
        assert_eq!(score_company_size(Some("11-50"), Some("51-200")), 0.8);
        assert_eq!(score_company_size(Some("11-50"), Some("201-500")), 0.5);
        assert_eq!(score_company_size(Some("1-10"), Some("5000+")), 0.2);
    }

    #[test]
    fn test_tech_jaccard() {
        let a = ["Rust".to_string(), "Postgres".to_string()];
        let b = ["rust".to_string(), "Kafka".to_string()];
        // |{rust}| / |{rust, postgres, kafka}|
        assert!((score_tech(&a, &b) - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(score_tech(&[], &b), 0.0);
    }

    #[test]
    fn test_overall_monotonicity() {
        let weights = SimilarityWeights::default();
        let low = FactorBreakdown {
            business_model: 0.2,
            industry: 0.3,
            company_size: 0.2,
            tech: 0.0,
            market_focus: 0.2,
            growth_stage: 0.2,
        };
        let mut high = low;
        high.industry = 1.0;
        high.tech = 0.5;
        // All factors of `high` >= `low` → overall must not decrease.
        assert!(overall_score(&high, &weights) >= overall_score(&low, &weights));
    }

    #[test]
    fn test_identical_records_score_high() {
        let a = record_with(
            "B2B SaaS",
            "Fintech",
            "51-200",
            &["rust", "postgres"],
            "Mid-market banks",
            "Series B",
        );
        let b = a.clone();
        let breakdown = factor_breakdown(&a, &b);
        let score = overall_score(&breakdown, &SimilarityWeights::default());
        assert!(score > 0.95, "score was {score}");
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
        assert!((normalized_levenshtein("abcd", "abcd") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_tracks_completeness() {
        let full = record_with("B2B", "Fintech", "11-50", &["rust"], "SMB", "seed");
        let empty = CompanyRecord::new("e", "https://e.test");
        assert!(pair_confidence(&full, &full) > pair_confidence(&full, &empty));
        assert!(pair_confidence(&empty, &empty) >= 0.0);
    }
}
