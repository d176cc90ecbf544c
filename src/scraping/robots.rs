use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use url::Url;

/// Parsed robots.txt directives relevant to the crawler: the `*` user-agent
/// group's disallow prefixes plus any advertised sitemap URLs.
#[derive(Debug, Default, Clone)]
pub struct RobotsRules {
    pub disallow: Vec<String>,
    pub sitemaps: Vec<String>,
}

impl RobotsRules {
    /// Parse the subset of robots.txt this crawler honors. Unknown directives
    /// and non-`*` groups are skipped; `Sitemap:` lines are global.
    pub fn parse(text: &str) -> Self {
        let mut rules = RobotsRules::default();
        let mut applies = false;

        for raw in text.lines() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();

            match key.as_str() {
                "user-agent" => applies = value == "*",
                "disallow" if applies => {
                    if !value.is_empty() {
                        rules.disallow.push(value.to_string());
                    }
                }
                "sitemap" => {
                    if value.starts_with("http") {
                        rules.sitemaps.push(value.to_string());
                    }
                }
                _ => {}
            }
        }
        rules
    }

    /// Whether the URL's path is allowed for the `*` user agent.
    pub fn allows(&self, url: &Url) -> bool {
        let path = url.path();
        !self.disallow.iter().any(|rule| path.starts_with(rule.as_str()))
    }

    /// Permissive default used when robots.txt is missing or unreadable.
    pub fn permissive() -> Self {
        RobotsRules::default()
    }
}

/// Per-host robots.txt cache. Fetch failures are treated as "no rules" so an
/// unreachable robots.txt never blocks discovery.
pub struct RobotsCache {
    client: reqwest::Client,
    cache: moka::future::Cache<String, Arc<RobotsRules>>,
}

impl RobotsCache {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            cache: moka::future::Cache::builder()
                .max_capacity(2_000)
                .time_to_live(Duration::from_secs(60 * 60))
                .build(),
        }
    }

    pub async fn rules_for(&self, base: &Url) -> Arc<RobotsRules> {
        let Some(host) = base.host_str() else {
            return Arc::new(RobotsRules::permissive());
        };
        let key = format!("{}://{}", base.scheme(), host);
        let client = self.client.clone();
        let robots_url = format!("{key}/robots.txt");

        self.cache
            .get_with(key, async move {
                match client
                    .get(&robots_url)
                    .timeout(Duration::from_secs(5))
                    .send()
                    .await
                {
                    Ok(resp) if resp.status().is_success() => match resp.text().await {
                        Ok(body) => Arc::new(RobotsRules::parse(&body)),
                        Err(_) => Arc::new(RobotsRules::permissive()),
                    },
                    Ok(resp) => {
                        debug!("robots.txt at {} returned {}", robots_url, resp.status());
                        Arc::new(RobotsRules::permissive())
                    }
                    Err(e) => {
                        debug!("robots.txt fetch failed for {}: {}", robots_url, e);
                        Arc::new(RobotsRules::permissive())
                    }
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# comment
User-agent: Googlebot
Disallow: /google-only

User-agent: *
Disallow: /admin
Disallow: /cart
Disallow:

Sitemap: https://example.com/sitemap.xml
Sitemap: https://example.com/sitemap-news.xml
";

    #[test]
    fn test_parse_star_group_only() {
        let rules = RobotsRules::parse(SAMPLE);
        assert_eq!(rules.disallow, vec!["/admin", "/cart"]);
        assert_eq!(rules.sitemaps.len(), 2);
    }

    #[test]
    fn test_allows() {
        let rules = RobotsRules::parse(SAMPLE);
        let allowed = Url::parse("https://example.com/products/anvil").unwrap();
        let blocked = Url::parse("https://example.com/admin/users").unwrap();
        assert!(rules.allows(&allowed));
        assert!(!rules.allows(&blocked));
    }

    #[test]
    fn test_permissive_allows_everything() {
        let rules = RobotsRules::permissive();
        let url = Url::parse("https://example.com/anything").unwrap();
        assert!(rules.allows(&url));
    }
}
