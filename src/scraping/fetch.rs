use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::core::errors::{EngineError, EngineResult};
use crate::scraping::browser;

/// One fetched page, HTML still attached. Cached briefly so overlapping
/// pipeline stages (discovery, extraction) never refetch the same URL.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub final_url: String,
    pub status: u16,
    pub html: String,
    pub content_type: String,
    pub byte_count: usize,
    pub fetch_ms: u64,
    /// True when the HTML came from the headless-browser fallback.
    pub rendered: bool,
}

impl FetchedPage {
    pub fn is_html(&self) -> bool {
        self.content_type.contains("text/html")
            || self.content_type.contains("application/xhtml")
            || self.content_type.is_empty()
    }
}

/// Markup-derived site signals; detected from HTML, never asked of the LLM.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SiteSignals {
    pub has_chat_widget: bool,
    pub has_forms: bool,
    pub has_job_listings: bool,
}

impl SiteSignals {
    pub fn merge(&mut self, other: SiteSignals) {
        self.has_chat_widget |= other.has_chat_widget;
        self.has_forms |= other.has_forms;
        self.has_job_listings |= other.has_job_listings;
    }
}

/// Detect chat widgets, forms, and job listings from raw HTML.
pub fn detect_site_signals(html: &str) -> SiteSignals {
    let lower = html.to_ascii_lowercase();
    let chat_markers = [
        "intercom", "drift.com", "crisp.chat", "zendesk", "livechat", "tawk.to", "hubspot-messages",
        "freshchat",
    ];
    let job_markers = [
        "/careers", "/jobs", "greenhouse.io", "lever.co", "workable.com", "ashbyhq.com",
        "join our team", "open positions", "we're hiring",
    ];
    SiteSignals {
        has_chat_widget: chat_markers.iter().any(|m| lower.contains(m)),
        has_forms: lower.contains("<form"),
        has_job_listings: job_markers.iter().any(|m| lower.contains(m)),
    }
}

#[derive(Clone, Debug)]
pub struct FetcherConfig {
    pub max_page_bytes: usize,
    /// Rendered text shorter than this triggers the browser fallback.
    pub render_fallback_threshold: usize,
    pub browser_fallback: bool,
    pub cache_ttl: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            max_page_bytes: 2 * 1024 * 1024,
            render_fallback_threshold: 400,
            browser_fallback: true,
            cache_ttl: Duration::from_secs(60 * 30),
        }
    }
}

/// HTTP-first page fetcher with a byte cap and an optional headless-browser
/// fallback for JS-heavy pages.
pub struct PageFetcher {
    client: reqwest::Client,
    cache: moka::future::Cache<String, Arc<FetchedPage>>,
    config: FetcherConfig,
}

impl PageFetcher {
    pub fn new(client: reqwest::Client, config: FetcherConfig) -> Self {
        let cache = moka::future::Cache::builder()
            .max_capacity(10_000)
            .time_to_live(config.cache_ttl)
            .build();
        Self {
            client,
            cache,
            config,
        }
    }

    /// Fetch one page within `timeout`. Served from cache when possible.
    pub async fn fetch(&self, url: &str, timeout: Duration) -> EngineResult<Arc<FetchedPage>> {
        if let Some(hit) = self.cache.get(url).await {
            return Ok(hit);
        }
        let page = Arc::new(self.fetch_uncached(url, timeout).await?);
        self.cache.insert(url.to_string(), Arc::clone(&page)).await;
        Ok(page)
    }

    async fn fetch_uncached(&self, url: &str, timeout: Duration) -> EngineResult<FetchedPage> {
        let started = Instant::now();
        let parsed = Url::parse(url)
            .map_err(|e| EngineError::input("bad_url", format!("{url}: {e}")))?;

        let resp = self
            .client
            .get(parsed.clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(EngineError::from)?;

        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if status >= 400 {
            return Err(EngineError::from_http_status(status, url));
        }

        // Stream the body up to the byte cap; oversized pages are truncated,
        // not rejected.
        let mut body: Vec<u8> = Vec::new();
        let mut resp = resp;
        loop {
            match resp.chunk().await {
                Ok(Some(chunk)) => {
                    let remaining = self.config.max_page_bytes.saturating_sub(body.len());
                    if remaining == 0 {
                        debug!("byte cap reached for {}", url);
                        break;
                    }
                    body.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
                }
                Ok(None) => break,
                Err(e) => return Err(EngineError::from(e)),
            }
        }
        let byte_count = body.len();
        let html = String::from_utf8_lossy(&body).into_owned();

        let mut page = FetchedPage {
            url: url.to_string(),
            final_url,
            status,
            html,
            content_type,
            byte_count,
            fetch_ms: started.elapsed().as_millis() as u64,
            rendered: false,
        };

        // JS-heavy pages come back as near-empty shells; render them when a
        // browser is available and the time budget allows it.
        if self.config.browser_fallback
            && page.is_html()
            && visible_text_len(&page.html) < self.config.render_fallback_threshold
            && browser::native_browser_available()
        {
            let remaining = timeout.saturating_sub(started.elapsed());
            if remaining > Duration::from_secs(3) {
                match tokio::time::timeout(remaining, browser::fetch_html_rendered(url, 2_000))
                    .await
                {
                    Ok(Ok(rendered_html)) => {
                        page.byte_count = rendered_html.len();
                        page.html = rendered_html;
                        page.rendered = true;
                        page.fetch_ms = started.elapsed().as_millis() as u64;
                    }
                    Ok(Err(e)) => warn!("browser fallback failed for {}: {}", url, e),
                    Err(_) => warn!("browser fallback timed out for {}", url),
                }
            }
        }

        Ok(page)
    }
}

/// Rough visible-text length: HTML with tags dropped.
fn visible_text_len(html: &str) -> usize {
    let mut in_tag = false;
    let mut count = 0usize;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag && !c.is_whitespace() => count += 1,
            _ => {}
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_site_signal_detection() {
        let html = r#"<html><body>
<script src="https://widget.intercom.io/widget/abc"></script>
<form action="/subscribe"><input type="email"></form>
<a href="/careers">Join our team</a>
</body></html>"#;
        let s = detect_site_signals(html);
        assert!(s.has_chat_widget);
        assert!(s.has_forms);
        assert!(s.has_job_listings);

        let s = detect_site_signals("<html><body><p>plain</p></body></html>");
        assert!(!s.has_chat_widget);
        assert!(!s.has_forms);
        assert!(!s.has_job_listings);
    }

    #[test]
    fn test_signal_merge() {
        let mut a = SiteSignals {
            has_chat_widget: true,
            ..Default::default()
        };
        a.merge(SiteSignals {
            has_forms: true,
            ..Default::default()
        });
        assert!(a.has_chat_widget && a.has_forms && !a.has_job_listings);
    }

    #[test]
    fn test_visible_text_len_ignores_tags() {
        assert_eq!(visible_text_len("<p>abc</p>"), 3);
        assert!(visible_text_len("<div class=\"x\"></div>") == 0);
    }
}
