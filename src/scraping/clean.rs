//! Main-content extraction for fetched pages.
//!
//! Two passes run over pre-cleaned HTML — a readability pass and a heuristic
//! container pass — and the wordier result wins. Navigation, scripts, styles,
//! and boilerplate blocks are stripped before either pass so neither gets
//! distracted by chrome.

use regex::Regex;
use scraper::{Html, Selector};
use std::sync::LazyLock;
use tracing::debug;
use url::Url;

static SCRIPT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script[^>]*>.*?</script>").expect("static regex"));
static STYLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<style[^>]*>.*?</style>").expect("static regex"));
static NOSCRIPT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<noscript[^>]*>.*?</noscript>").expect("static regex"));
static SVG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<svg[^>]*>.*?</svg>").expect("static regex"));
static COMMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").expect("static regex"));
static CHROME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(nav|footer|header|aside|form)[^>]*>.*?</(nav|footer|header|aside|form)>")
        .expect("static regex")
});

/// Strip non-content markup before the extraction passes.
fn preprocess_html(html: &str) -> String {
    let mut s = SCRIPT_RE.replace_all(html, " ").into_owned();
    s = STYLE_RE.replace_all(&s, " ").into_owned();
    s = NOSCRIPT_RE.replace_all(&s, " ").into_owned();
    s = SVG_RE.replace_all(&s, " ").into_owned();
    s = COMMENT_RE.replace_all(&s, " ").into_owned();
    s = CHROME_RE.replace_all(&s, " ").into_owned();
    s
}

/// Extract the main textual content of a page.
pub fn extract_clean_text(html: &str, base_url: &Url) -> String {
    let pre = preprocess_html(html);

    let readability_text = match readability::extractor::extract(&mut pre.as_bytes(), base_url) {
        Ok(product) => {
            let text = html2md::parse_html(&product.content);
            post_clean_text(&text)
        }
        Err(e) => {
            debug!("readability extraction failed: {}, trying heuristics", e);
            String::new()
        }
    };

    let heuristic_text = heuristic_main_extraction(&pre);

    let rt_words = word_count(&readability_text);
    let ht_words = word_count(&heuristic_text);

    let chosen = if rt_words == 0 && ht_words > 0 {
        heuristic_text
    } else if ht_words == 0 && rt_words > 0 {
        readability_text
    } else if ht_words > rt_words.saturating_add(20) {
        heuristic_text
    } else if rt_words > 0 {
        readability_text
    } else {
        fallback_text_extraction(&pre)
    };

    post_clean_text(&chosen)
}

/// Try common main-content containers in priority order.
fn heuristic_main_extraction(html: &str) -> String {
    let doc = Html::parse_document(html);
    let selectors = ["main", "article", "[role=\"main\"]", "#content", ".content"];

    for sel in selectors {
        let Ok(selector) = Selector::parse(sel) else {
            continue;
        };
        if let Some(node) = doc.select(&selector).next() {
            let text = html2md::parse_html(&node.inner_html());
            let cleaned = post_clean_text(&text);
            if word_count(&cleaned) > 50 {
                return cleaned;
            }
        }
    }
    String::new()
}

/// Last resort: the whole document's text nodes.
fn fallback_text_extraction(html: &str) -> String {
    let doc = Html::parse_document(html);
    let text: String = doc.root_element().text().collect::<Vec<_>>().join(" ");
    post_clean_text(&text)
}

/// Collapse whitespace runs, drop repeated lines, and limit blank runs to one.
pub fn post_clean_text(text: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut prev_blank = false;
    let mut prev_line = String::new();

    for raw in text.lines() {
        let line = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        if line.is_empty() {
            if !prev_blank && !out.is_empty() {
                out.push(String::new());
            }
            prev_blank = true;
            continue;
        }
        // Repeated nav labels and duplicated headings collapse to one.
        if line == prev_line {
            continue;
        }
        prev_line = line.clone();
        prev_blank = false;
        out.push(line);
    }

    while out.last().is_some_and(|l| l.is_empty()) {
        out.pop();
    }
    out.join("\n")
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// The `<title>` element, trimmed.
pub fn extract_title(html: &str) -> String {
    let doc = Html::parse_document(html);
    let Ok(selector) = Selector::parse("title") else {
        return String::new();
    };
    doc.select(&selector)
        .next()
        .map(|t| t.text().collect::<String>().trim().to_string())
        .unwrap_or_default()
}

/// All same-document anchor targets resolved against `base`, with link text.
pub fn extract_links(html: &str, base: &Url) -> Vec<(String, String)> {
    let doc = Html::parse_document(html);
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };

    let mut links = Vec::new();
    for a in doc.select(&selector) {
        let Some(href) = a.value().attr("href") else {
            continue;
        };
        if href.starts_with("javascript:")
            || href.starts_with("mailto:")
            || href.starts_with("tel:")
            || href.starts_with('#')
            || href.starts_with("data:")
        {
            continue;
        }
        let Ok(resolved) = base.join(href) else {
            continue;
        };
        if resolved.scheme() != "http" && resolved.scheme() != "https" {
            continue;
        }
        let text = a.text().collect::<String>().trim().to_string();
        links.push((resolved.to_string(), text));
    }
    links
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprocess_strips_chrome() {
        let html = r#"<html><head><script>var x = 1;</script><style>.a{}</style></head>
<body><nav>Home | About</nav><main><p>Real content here.</p></main>
<footer>© 2025</footer></body></html>"#;
        let pre = preprocess_html(html);
        assert!(!pre.contains("var x"));
        assert!(!pre.contains("Home | About"));
        assert!(!pre.contains("© 2025"));
        assert!(pre.contains("Real content here."));
    }

    #[test]
    fn test_post_clean_collapses_duplicates() {
        let text = "Products\nProducts\n\n\n\nWe   make    anvils.\n\n";
        let cleaned = post_clean_text(text);
        assert_eq!(cleaned, "Products\n\nWe make anvils.");
    }

    #[test]
    fn test_extract_title_and_links() {
        let html = r#"<html><head><title> Acme Corp </title></head>
<body><a href="/about">About us</a><a href="mailto:x@y.z">mail</a>
<a href="https://other.example/page">ext</a></body></html>"#;
        let base = Url::parse("https://acme.test/").unwrap();

        assert_eq!(extract_title(html), "Acme Corp");

        let links = extract_links(html, &base);
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].0, "https://acme.test/about");
        assert_eq!(links[0].1, "About us");
    }

    #[test]
    fn test_clean_text_prefers_main_content() {
        let html = r#"<html><body>
<nav>Home About Products Contact Careers Blog</nav>
<main><p>Acme builds industrial anvils for discerning coyotes. Our product
line spans forty years of engineering excellence and three continents of
manufacturing capacity, with dedicated support teams in every region. We
serve over two thousand enterprise customers who rely on our hardware for
mission critical drops. The company was founded in 1949 and remains family
owned, employing around three hundred people across five sites. Safety and
precision define everything we ship, from the smallest bench anvil to the
ten ton drop forge models used by national railways.</p></main>
</body></html>"#;
        let base = Url::parse("https://acme.test/").unwrap();
        let text = extract_clean_text(html, &base);
        assert!(text.contains("industrial anvils"));
        assert!(word_count(&text) > 50);
    }
}
