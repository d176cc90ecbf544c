use std::collections::{HashMap, HashSet};

/// Business-model classification taxonomy.
///
/// The label set is fixed per deployment (59 categories by default) and is
/// supplied as configuration; classifier output outside the set is rejected.
/// Lookup is case-insensitive but stored labels keep their canonical casing.
pub struct Taxonomy {
    labels: Vec<String>,
    index: HashMap<String, usize>,
}

impl Taxonomy {
    pub fn new(labels: Vec<String>) -> Self {
        let index = labels
            .iter()
            .enumerate()
            .map(|(i, l)| (l.to_ascii_lowercase(), i))
            .collect();
        Self { labels, index }
    }

    /// The built-in 59-category SaaS taxonomy.
    pub fn default_set() -> Self {
        Self::new(DEFAULT_LABELS.iter().map(|s| s.to_string()).collect())
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Resolve a candidate label to its canonical form, or `None` if it is
    /// not part of the taxonomy.
    pub fn canonicalize(&self, label: &str) -> Option<&str> {
        self.index
            .get(label.trim().to_ascii_lowercase().as_str())
            .map(|&i| self.labels[i].as_str())
    }

    pub fn contains(&self, label: &str) -> bool {
        self.canonicalize(label).is_some()
    }
}

const DEFAULT_LABELS: [&str; 59] = [
    "Accounting & Financial Management",
    "Advertising Technology",
    "Analytics & Business Intelligence",
    "API Management & Integration",
    "Artificial Intelligence & ML Platforms",
    "Asset & Fleet Management",
    "Billing & Subscription Management",
    "Collaboration & Productivity",
    "Compliance & Risk Management",
    "Construction Technology",
    "Content Management Systems",
    "Customer Data Platforms",
    "Customer Relationship Management",
    "Customer Support & Helpdesk",
    "Cybersecurity",
    "Data Infrastructure & Pipelines",
    "Developer Tools & DevOps",
    "Digital Signature & Documents",
    "E-commerce Platforms",
    "Education Technology",
    "Email & Messaging Infrastructure",
    "Employee Engagement & Experience",
    "Energy & Utilities Software",
    "Event Management",
    "Field Service Management",
    "FinTech Infrastructure",
    "Governance & Legal Technology",
    "Healthcare Technology",
    "Hospitality & Travel Technology",
    "Human Resources & Payroll",
    "Identity & Access Management",
    "Insurance Technology",
    "Inventory & Warehouse Management",
    "IT Service Management",
    "Logistics & Supply Chain",
    "Manufacturing & Industrial Software",
    "Marketing Automation",
    "Marketplace Platforms",
    "Media & Publishing Technology",
    "Nonprofit & Fundraising Software",
    "Observability & Monitoring",
    "Payments Processing",
    "Point of Sale Systems",
    "Procurement & Spend Management",
    "Product Management Tools",
    "Project & Work Management",
    "Real Estate Technology",
    "Recruiting & Talent Acquisition",
    "Restaurant Technology",
    "Retail Technology",
    "Sales Enablement",
    "Scheduling & Appointment Booking",
    "Search & Discovery Infrastructure",
    "Social Media Management",
    "Tax & Audit Technology",
    "Telecommunications Software",
    "Video & Communications Platforms",
    "Web Hosting & Infrastructure",
    "Workflow Automation",
];

// ---------------------------------------------------------------------------
// Deterministic similarity tables (business-model compatibility, industry
// tree, ordinal scales). Used by the similarity scorer; the LLM is never
// involved in these.
// ---------------------------------------------------------------------------

/// Canonical business-model group for a free-text label.
pub fn business_model_group(model: &str) -> &'static str {
    let m = model.to_ascii_lowercase();
    if m.contains("b2b2c") {
        "b2b2c"
    } else if m.contains("marketplace") {
        "marketplace"
    } else if m.contains("enterprise") {
        "enterprise"
    } else if m.contains("saas") || m.contains("subscription") || m.contains("software") {
        "saas"
    } else if m.contains("b2c") || m.contains("consumer") || m.contains("d2c") {
        "b2c"
    } else if m.contains("b2b") {
        "b2b"
    } else if m.contains("service") || m.contains("agency") || m.contains("consult") {
        "services"
    } else if m.contains("hardware") || m.contains("manufactur") {
        "hardware"
    } else {
        "other"
    }
}

/// Fixed compatibility table: group pairs that score 0.8 even though they are
/// not identical.
const COMPATIBLE_MODEL_GROUPS: [(&str, &str); 5] = [
    ("b2b", "enterprise"),
    ("saas", "b2b"),
    ("saas", "enterprise"),
    ("marketplace", "b2c"),
    ("b2b2c", "marketplace"),
];

pub fn model_groups_compatible(a: &str, b: &str) -> bool {
    COMPATIBLE_MODEL_GROUPS
        .iter()
        .any(|(x, y)| (*x == a && *y == b) || (*x == b && *y == a))
}

/// Parent industry in the fixed two-level taxonomy tree, if any.
pub fn industry_parent(industry: &str) -> Option<&'static str> {
    let i = industry.to_ascii_lowercase();
    let table: [(&[&str], &str); 8] = [
        (
            &["fintech", "insurtech", "banking", "payments", "lending", "wealth"],
            "financial services",
        ),
        (
            &["healthtech", "biotech", "pharma", "medtech", "telehealth"],
            "healthcare",
        ),
        (
            &["edtech", "e-learning", "education technology"],
            "education",
        ),
        (
            &["martech", "adtech", "advertising"],
            "marketing",
        ),
        (
            &["proptech", "real estate technology"],
            "real estate",
        ),
        (
            &["logistics", "supply chain", "freight", "shipping"],
            "transportation",
        ),
        (
            &["cybersecurity", "infosec", "security software"],
            "software",
        ),
        (
            &["e-commerce", "ecommerce", "retail technology"],
            "retail",
        ),
    ];
    for (children, parent) in table {
        if children.iter().any(|c| i.contains(c)) {
            return Some(parent);
        }
    }
    None
}

/// Employee-count buckets in ascending order; index is the ordinal used for
/// size-distance scoring.
const SIZE_BUCKETS: [&str; 7] = [
    "1-10", "11-50", "51-200", "201-500", "501-1000", "1001-5000", "5000+",
];

/// Map a free-text company-size description onto its bucket ordinal.
pub fn size_ordinal(size: &str) -> Option<usize> {
    let s = size.trim().to_ascii_lowercase();
    if s.is_empty() {
        return None;
    }
    // Longest bucket match wins: "501-1000" also contains the "1-10" substring.
    if let Some(i) = SIZE_BUCKETS
        .iter()
        .enumerate()
        .filter(|(_, b)| s.contains(*b))
        .max_by_key(|(_, b)| b.len())
        .map(|(i, _)| i)
    {
        return Some(i);
    }
    // Fall back to the first number mentioned.
    let digits: String = s
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    let n: u64 = digits.parse().ok()?;
    Some(match n {
        0..=10 => 0,
        11..=50 => 1,
        51..=200 => 2,
        201..=500 => 3,
        501..=1000 => 4,
        1001..=5000 => 5,
        _ => 6,
    })
}

/// Growth-stage ordinals, ascending.
const STAGE_ORDER: [&str; 8] = [
    "idea", "pre-seed", "seed", "series a", "series b", "series c", "growth", "public",
];

pub fn stage_ordinal(stage: &str) -> Option<usize> {
    let s = stage.trim().to_ascii_lowercase();
    if s.is_empty() {
        return None;
    }
    STAGE_ORDER.iter().position(|b| s.contains(b)).or({
        if s.contains("startup") || s.contains("early") {
            Some(2)
        } else if s.contains("scale") || s.contains("expansion") {
            Some(6)
        } else if s.contains("mature") || s.contains("established") || s.contains("late") {
            Some(7)
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_set_has_59_labels() {
        let t = Taxonomy::default_set();
        assert_eq!(t.len(), 59);
        // No duplicates after lowercasing.
        let unique: HashSet<String> = t
            .labels()
            .iter()
            .map(|l| l.to_ascii_lowercase())
            .collect();
        assert_eq!(unique.len(), 59);
    }

    #[test]
    fn test_canonicalize_case_insensitive() {
        let t = Taxonomy::default_set();
        assert_eq!(t.canonicalize("cybersecurity"), Some("Cybersecurity"));
        assert_eq!(
            t.canonicalize("  marketing automation "),
            Some("Marketing Automation")
        );
        assert_eq!(t.canonicalize("Underwater Basket Weaving"), None);
    }

    #[test]
    fn test_model_groups() {
        assert_eq!(business_model_group("B2B SaaS"), "saas");
        assert_eq!(business_model_group("Enterprise software"), "enterprise");
        assert_eq!(business_model_group("consumer app"), "b2c");
        assert_eq!(business_model_group("two-sided marketplace"), "marketplace");
    }

    #[test]
    fn test_model_compat_table() {
        assert!(model_groups_compatible("b2b", "enterprise"));
        assert!(model_groups_compatible("enterprise", "saas"));
        assert!(!model_groups_compatible("b2c", "enterprise"));
    }

    #[test]
    fn test_size_ordinals() {
        assert_eq!(size_ordinal("11-50 employees"), Some(1));
        assert_eq!(size_ordinal("about 300 people"), Some(3));
        assert_eq!(size_ordinal("501-1000"), Some(4));
        assert_eq!(size_ordinal("10000+"), Some(6));
        assert_eq!(size_ordinal(""), None);
    }

    #[test]
    fn test_stage_ordinals() {
        assert_eq!(stage_ordinal("Series B"), Some(4));
        assert!(stage_ordinal("seed") < stage_ordinal("growth"));
        assert_eq!(stage_ordinal("unknown"), None);
    }

    #[test]
    fn test_industry_parent() {
        assert_eq!(industry_parent("Fintech"), Some("financial services"));
        assert_eq!(industry_parent("InsurTech"), Some("financial services"));
        assert_eq!(industry_parent("Gardening"), None);
    }
}
