use std::collections::HashSet;
use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;
use tracing::debug;

/// Nested sitemap indexes are followed one level deep; anything deeper is a
/// pathological site and not worth the fetch budget.
const MAX_INDEX_DEPTH: usize = 2;
const FETCH_TIMEOUT: Duration = Duration::from_secs(8);

/// Collect page URLs from the advertised sitemaps, following nested
/// `<sitemapindex>` documents. Stops at `max_urls` or the shared deadline;
/// individual fetch failures are skipped.
pub async fn collect_sitemap_urls(
    client: &reqwest::Client,
    sitemap_urls: &[String],
    max_urls: usize,
    deadline: Instant,
) -> Vec<String> {
    let loc_re = Regex::new(r"<loc>\s*([^<]+?)\s*</loc>").expect("static regex");
    let mut seen: HashSet<String> = HashSet::new();
    let mut out: Vec<String> = Vec::new();

    // (url, index_depth) work queue.
    let mut queue: Vec<(String, usize)> = sitemap_urls.iter().map(|u| (u.clone(), 0)).collect();

    while let Some((sitemap_url, depth)) = queue.pop() {
        if out.len() >= max_urls || Instant::now() >= deadline {
            break;
        }
        if !seen.insert(sitemap_url.clone()) {
            continue;
        }

        let body = match client
            .get(&sitemap_url)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => match resp.text().await {
                Ok(b) => b,
                Err(e) => {
                    debug!("sitemap body read failed for {}: {}", sitemap_url, e);
                    continue;
                }
            },
            Ok(resp) => {
                debug!("sitemap {} returned {}", sitemap_url, resp.status());
                continue;
            }
            Err(e) => {
                debug!("sitemap fetch failed for {}: {}", sitemap_url, e);
                continue;
            }
        };

        let is_index = body.contains("<sitemapindex");
        for cap in loc_re.captures_iter(&body) {
            let loc = cap[1].trim().to_string();
            if !loc.starts_with("http") {
                continue;
            }
            if is_index {
                if depth + 1 < MAX_INDEX_DEPTH {
                    queue.push((loc, depth + 1));
                }
            } else if seen.insert(loc.clone()) {
                out.push(loc);
                if out.len() >= max_urls {
                    break;
                }
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loc_extraction() {
        let re = Regex::new(r"<loc>\s*([^<]+?)\s*</loc>").unwrap();
        let xml = r#"<?xml version="1.0"?>
<urlset>
  <url><loc>https://example.com/</loc></url>
  <url><loc> https://example.com/about </loc></url>
</urlset>"#;
        let locs: Vec<&str> = re.captures_iter(xml).map(|c| c.get(1).unwrap().as_str()).collect();
        assert_eq!(locs, vec!["https://example.com/", "https://example.com/about"]);
    }

    #[test]
    fn test_index_detection() {
        let xml = r#"<sitemapindex><sitemap><loc>https://example.com/a.xml</loc></sitemap></sitemapindex>"#;
        assert!(xml.contains("<sitemapindex"));
    }
}
