use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::scraping::clean::{extract_clean_text, extract_title, word_count};
use crate::scraping::fetch::{detect_site_signals, PageFetcher, SiteSignals};

/// Cleaned text of one successfully extracted page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageContent {
    pub url: String,
    pub title: String,
    pub cleaned_text: String,
    pub byte_count: usize,
    pub fetch_ms: u64,
    pub word_count: usize,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageFailure {
    pub url: String,
    pub reason: String,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ExtractionReport {
    pub pages: Vec<PageContent>,
    pub failures: Vec<PageFailure>,
    pub attempted: usize,
    pub signals: SiteSignals,
    pub duration_ms: u64,
    /// True when the deadline cut extraction short.
    pub truncated: bool,
}

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub parallelism: usize,
    pub per_page_timeout: Duration,
    pub max_chars_per_page: usize,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            parallelism: 10,
            per_page_timeout: Duration::from_secs(20),
            max_chars_per_page: 10_000,
        }
    }
}

/// Fetch and clean the selected pages concurrently under a semaphore-sized
/// stream (C5). Pages finished before `deadline` are kept even when the
/// deadline interrupts the rest; per-page failures are recorded, never fatal.
pub async fn extract_pages(
    fetcher: &PageFetcher,
    urls: &[String],
    config: &ExtractorConfig,
    deadline: Instant,
    cancel: &CancellationToken,
) -> ExtractionReport {
    let started = Instant::now();
    let attempted = urls.len();

    // Results accumulate as pages finish so a deadline mid-flight still
    // surfaces everything already extracted.
    let pages: Arc<Mutex<Vec<(usize, PageContent)>>> = Arc::new(Mutex::new(Vec::new()));
    let failures: Arc<Mutex<Vec<PageFailure>>> = Arc::new(Mutex::new(Vec::new()));
    let signals: Arc<Mutex<SiteSignals>> = Arc::new(Mutex::new(SiteSignals::default()));

    let run = stream::iter(urls.iter().cloned().enumerate())
        .map(|(index, url)| {
            let pages = Arc::clone(&pages);
            let failures = Arc::clone(&failures);
            let signals = Arc::clone(&signals);
            let cancel = cancel.clone();
            async move {
                if cancel.is_cancelled() {
                    return;
                }
                let fetch_deadline = config
                    .per_page_timeout
                    .min(deadline.saturating_duration_since(Instant::now()));
                if fetch_deadline.is_zero() {
                    return;
                }
                match fetcher.fetch(&url, fetch_deadline).await {
                    Ok(page) => {
                        if !page.is_html() {
                            failures.lock().expect("failures lock").push(PageFailure {
                                url,
                                reason: format!("unsupported content type: {}", page.content_type),
                            });
                            return;
                        }
                        let Ok(base) = Url::parse(&page.final_url)
                            .or_else(|_| Url::parse(&page.url))
                        else {
                            return;
                        };
                        signals
                            .lock()
                            .expect("signals lock")
                            .merge(detect_site_signals(&page.html));

                        let mut text = extract_clean_text(&page.html, &base);
                        if text.chars().count() > config.max_chars_per_page {
                            text = text.chars().take(config.max_chars_per_page).collect();
                        }
                        if text.trim().is_empty() {
                            failures.lock().expect("failures lock").push(PageFailure {
                                url,
                                reason: "no extractable text".to_string(),
                            });
                            return;
                        }

                        let language = whatlang::detect(&text)
                            .map(|info| info.lang().code().to_string());
                        let content = PageContent {
                            url: url.clone(),
                            title: extract_title(&page.html),
                            word_count: word_count(&text),
                            cleaned_text: text,
                            byte_count: page.byte_count,
                            fetch_ms: page.fetch_ms,
                            language,
                        };
                        pages.lock().expect("pages lock").push((index, content));
                    }
                    Err(e) => {
                        debug!("extraction fetch failed for {}: {}", url, e);
                        failures.lock().expect("failures lock").push(PageFailure {
                            url,
                            reason: e.to_string(),
                        });
                    }
                }
            }
        })
        .buffer_unordered(config.parallelism.max(1))
        .collect::<Vec<()>>();

    let truncated = tokio::select! {
        _ = run => false,
        _ = tokio::time::sleep_until(deadline) => true,
        _ = cancel.cancelled() => true,
    };

    let mut collected = pages.lock().expect("pages lock").clone();
    collected.sort_by_key(|(i, _)| *i);
    let pages: Vec<PageContent> = collected.into_iter().map(|(_, p)| p).collect();
    let failures = failures.lock().expect("failures lock").clone();
    let signals = *signals.lock().expect("signals lock");

    info!(
        "content extraction: {}/{} pages, {} failures{} in {}ms",
        pages.len(),
        attempted,
        failures.len(),
        if truncated { " (deadline hit)" } else { "" },
        started.elapsed().as_millis()
    );

    ExtractionReport {
        pages,
        failures,
        attempted,
        signals,
        duration_ms: started.elapsed().as_millis() as u64,
        truncated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extractor_defaults() {
        let cfg = ExtractorConfig::default();
        assert_eq!(cfg.parallelism, 10);
        assert_eq!(cfg.per_page_timeout, Duration::from_secs(20));
        assert_eq!(cfg.max_chars_per_page, 10_000);
    }
}
