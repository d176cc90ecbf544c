use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::scraping::clean::extract_links;
use crate::scraping::fetch::PageFetcher;
use crate::scraping::robots::RobotsCache;
use crate::scraping::sitemap::collect_sitemap_urls;

/// Advisory content category derived from path heuristics. The page selector
/// may use it as a prior but is free to ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkCategory {
    About,
    Contact,
    Team,
    Products,
    Careers,
    News,
    Other,
}

impl LinkCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkCategory::About => "about",
            LinkCategory::Contact => "contact",
            LinkCategory::Team => "team",
            LinkCategory::Products => "products",
            LinkCategory::Careers => "careers",
            LinkCategory::News => "news",
            LinkCategory::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredLink {
    pub url: String,
    pub category: LinkCategory,
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub max_links: usize,
    pub max_depth: usize,
    pub per_host_concurrency: usize,
    pub deadline: Duration,
    pub per_page_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_links: 1000,
            max_depth: 3,
            per_host_concurrency: 4,
            deadline: Duration::from_secs(20),
            per_page_timeout: Duration::from_secs(8),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct DiscoveryReport {
    pub links: Vec<DiscoveredLink>,
    pub pages_fetched: usize,
    pub fetch_failures: usize,
    pub from_sitemap: usize,
    pub max_depth_reached: usize,
    pub duration_ms: u64,
}

/// Collect candidate URLs for a company site: robots.txt + sitemaps + a
/// bounded breadth-first crawl, deduplicated by canonical URL (C3).
///
/// Single fetch failures are logged and skipped; a completely unreachable
/// site yields an empty report, never an error.
pub async fn discover_links(
    fetcher: &PageFetcher,
    robots: &RobotsCache,
    client: &reqwest::Client,
    base_url: &Url,
    config: &DiscoveryConfig,
    cancel: &CancellationToken,
) -> DiscoveryReport {
    let started = Instant::now();
    let deadline = started + config.deadline;
    let scope_domain = registrable_domain(base_url.host_str().unwrap_or(""));

    let mut report = DiscoveryReport::default();
    let mut seen: HashSet<String> = HashSet::new();

    // 1. robots.txt: disallow rules plus advertised sitemaps.
    let rules = robots.rules_for(base_url).await;

    let push = |url: &Url, seen: &mut HashSet<String>, report: &mut DiscoveryReport| -> bool {
        let canonical = canonical_url(url);
        if !seen.insert(canonical.clone()) {
            return false;
        }
        report.links.push(DiscoveredLink {
            category: categorize_path(url.path()),
            url: canonical,
        });
        true
    };

    push(base_url, &mut seen, &mut report);

    // 2. Sitemaps, nested indexes included.
    if !rules.sitemaps.is_empty() && Instant::now() < deadline {
        let sitemap_urls =
            collect_sitemap_urls(client, &rules.sitemaps, config.max_links, deadline).await;
        for raw in sitemap_urls {
            let Ok(url) = Url::parse(&raw) else { continue };
            if !in_scope(&url, &scope_domain) || !rules.allows(&url) {
                continue;
            }
            if push(&url, &mut seen, &mut report) {
                report.from_sitemap += 1;
            }
            if report.links.len() >= config.max_links {
                break;
            }
        }
        debug!(
            "sitemap discovery added {} urls for {}",
            report.from_sitemap, base_url
        );
    }

    // 3. Breadth-first crawl, wave by wave.
    let mut queue: VecDeque<(Url, usize)> = VecDeque::new();
    queue.push_back((base_url.clone(), 0));
    let mut crawled: HashSet<String> = HashSet::new();
    crawled.insert(canonical_url(base_url));

    while !queue.is_empty() {
        if report.links.len() >= config.max_links
            || Instant::now() >= deadline
            || cancel.is_cancelled()
        {
            break;
        }

        let batch_size = config.per_host_concurrency * 2;
        let mut batch: Vec<(Url, usize)> = Vec::new();
        while batch.len() < batch_size {
            match queue.pop_front() {
                Some(item) => batch.push(item),
                None => break,
            }
        }

        let per_page_timeout = config
            .per_page_timeout
            .min(deadline.saturating_duration_since(Instant::now()));
        if per_page_timeout.is_zero() {
            break;
        }

        let fetched: Vec<(Url, usize, Option<Arc<crate::scraping::fetch::FetchedPage>>)> =
            stream::iter(batch)
                .map(|(url, depth)| async move {
                    match fetcher.fetch(url.as_str(), per_page_timeout).await {
                        Ok(page) if page.is_html() => (url, depth, Some(page)),
                        Ok(_) => (url, depth, None),
                        Err(e) => {
                            debug!("discovery fetch failed for {}: {}", url, e);
                            (url, depth, None)
                        }
                    }
                })
                .buffer_unordered(config.per_host_concurrency)
                .collect()
                .await;

        for (page_url, depth, page) in fetched {
            report.max_depth_reached = report.max_depth_reached.max(depth);
            let Some(page) = page else {
                report.fetch_failures += 1;
                continue;
            };
            report.pages_fetched += 1;

            if depth >= config.max_depth {
                continue;
            }
            for (href, _text) in extract_links(&page.html, &page_url) {
                let Ok(url) = Url::parse(&href) else { continue };
                if !in_scope(&url, &scope_domain)
                    || !rules.allows(&url)
                    || is_excluded_path(url.path())
                {
                    continue;
                }
                if push(&url, &mut seen, &mut report) && crawled.insert(canonical_url(&url)) {
                    queue.push_back((url, depth + 1));
                }
                if report.links.len() >= config.max_links {
                    break;
                }
            }
        }
    }

    report.duration_ms = started.elapsed().as_millis() as u64;
    if report.links.len() <= 1 && report.pages_fetched == 0 {
        warn!("link discovery found nothing reachable at {}", base_url);
    } else {
        info!(
            "link discovery: {} urls ({} from sitemap, {} pages fetched, {} failures) in {}ms",
            report.links.len(),
            report.from_sitemap,
            report.pages_fetched,
            report.fetch_failures,
            report.duration_ms
        );
    }
    report
}

/// Canonical form used for deduplication: lowercase scheme and host, no
/// fragment, query keys sorted, no trailing slash.
pub fn canonical_url(url: &Url) -> String {
    let mut u = url.clone();
    u.set_fragment(None);

    let mut pairs: Vec<(String, String)> = u
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        u.set_query(None);
    } else {
        pairs.sort();
        let q = pairs
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{k}={v}")
                }
            })
            .collect::<Vec<_>>()
            .join("&");
        u.set_query(Some(&q));
    }

    // scheme and host are already lowercased by the Url parser
    let mut s = u.to_string();
    if s.ends_with('/') && u.query().is_none() && s.len() > u.scheme().len() + 3 {
        s.pop();
    }
    s
}

/// Registrable domain with handling for common two-part public suffixes.
pub fn registrable_domain(host: &str) -> String {
    let host = host.to_ascii_lowercase();
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() <= 2 {
        return host;
    }
    let two_part_suffixes = [
        "co.uk", "org.uk", "ac.uk", "com.au", "net.au", "org.au", "co.jp", "co.nz", "co.in",
        "com.br", "com.mx", "co.za", "com.sg",
    ];
    let last_two = labels[labels.len() - 2..].join(".");
    if two_part_suffixes.contains(&last_two.as_str()) {
        labels[labels.len() - 3..].join(".")
    } else {
        last_two
    }
}

fn in_scope(url: &Url, scope_domain: &str) -> bool {
    match url.host_str() {
        Some(host) => registrable_domain(host) == scope_domain,
        None => false,
    }
}

/// Paths that never yield business intelligence (binaries, auth, commerce
/// plumbing).
fn is_excluded_path(path: &str) -> bool {
    let p = path.to_ascii_lowercase();
    const EXCLUDED_PREFIXES: [&str; 7] = [
        "/login", "/logout", "/signup", "/register", "/cart", "/checkout", "/api/",
    ];
    const EXCLUDED_EXTENSIONS: [&str; 14] = [
        ".pdf", ".zip", ".exe", ".dmg", ".tar", ".gz", ".mp4", ".mp3", ".jpg", ".jpeg", ".png",
        ".gif", ".svg", ".webp",
    ];
    EXCLUDED_PREFIXES.iter().any(|x| p.starts_with(x))
        || EXCLUDED_EXTENSIONS.iter().any(|x| p.ends_with(x))
}

/// Advisory category from path segments.
pub fn categorize_path(path: &str) -> LinkCategory {
    let p = path.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| p.contains(n));

    if has(&["/about", "/company", "/story", "/mission", "/who-we-are"]) {
        LinkCategory::About
    } else if has(&["/team", "/people", "/leadership", "/founders", "/management"]) {
        LinkCategory::Team
    } else if has(&["/career", "/jobs", "/hiring", "/join"]) {
        LinkCategory::Careers
    } else if has(&["/contact", "/locations", "/offices"]) {
        LinkCategory::Contact
    } else if has(&["/news", "/press", "/blog", "/media", "/announcements"]) {
        LinkCategory::News
    } else if has(&[
        "/product", "/services", "/solutions", "/platform", "/features", "/pricing",
    ]) {
        LinkCategory::Products
    } else {
        LinkCategory::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_url() {
        let u = Url::parse("HTTPS://Example.COM/Path?b=2&a=1#frag").unwrap();
        assert_eq!(canonical_url(&u), "https://example.com/Path?a=1&b=2");

        let root = Url::parse("https://example.com/").unwrap();
        assert_eq!(canonical_url(&root), "https://example.com");
    }

    #[test]
    fn test_canonical_dedup_is_stable() {
        let a = Url::parse("https://example.com/p?x=1&y=2").unwrap();
        let b = Url::parse("https://example.com/p?y=2&x=1").unwrap();
        assert_eq!(canonical_url(&a), canonical_url(&b));
    }

    #[test]
    fn test_registrable_domain() {
        assert_eq!(registrable_domain("www.example.com"), "example.com");
        assert_eq!(registrable_domain("docs.api.example.com"), "example.com");
        assert_eq!(registrable_domain("shop.example.co.uk"), "example.co.uk");
        assert_eq!(registrable_domain("example.com"), "example.com");
    }

    #[test]
    fn test_scope_allows_subdomains() {
        let url = Url::parse("https://docs.acme.com/guide").unwrap();
        assert!(in_scope(&url, "acme.com"));
        let other = Url::parse("https://evil.com/").unwrap();
        assert!(!in_scope(&other, "acme.com"));
    }

    #[test]
    fn test_categorize_path() {
        assert_eq!(categorize_path("/about-us"), LinkCategory::About);
        assert_eq!(categorize_path("/company/leadership"), LinkCategory::About);
        assert_eq!(categorize_path("/team"), LinkCategory::Team);
        assert_eq!(categorize_path("/careers/open-roles"), LinkCategory::Careers);
        assert_eq!(categorize_path("/products/widgets"), LinkCategory::Products);
        assert_eq!(categorize_path("/press/2025"), LinkCategory::News);
        assert_eq!(categorize_path("/random"), LinkCategory::Other);
    }

    #[test]
    fn test_excluded_paths() {
        assert!(is_excluded_path("/login"));
        assert!(is_excluded_path("/assets/logo.png"));
        assert!(is_excluded_path("/api/v1/users"));
        assert!(!is_excluded_path("/products"));
    }
}
