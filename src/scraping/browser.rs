//! Headless-browser fallback fetch using `chromiumoxide`.
//!
//! The extractor reaches for this only when a plain HTTP fetch yields too
//! little text and a Chromium-family binary is present on the machine. One
//! browser per fetch keeps the failure domain small; page volume is already
//! bounded by the extraction semaphore.

use anyhow::{anyhow, Result};
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::Browser;
use futures::StreamExt;
use std::path::Path;
use std::time::Duration;
use tracing::{error, warn};

/// Find a usable Chromium-family browser executable.
///
/// Resolution order:
/// 1. `CHROME_EXECUTABLE` env var.
/// 2. PATH scan — finds package-manager installs on all platforms.
/// 3. OS-specific well-known install paths.
pub fn find_chrome_executable() -> Option<String> {
    if let Ok(p) = std::env::var("CHROME_EXECUTABLE") {
        if Path::new(&p).exists() {
            return Some(p);
        }
    }

    if let Ok(path_var) = std::env::var("PATH") {
        let candidates = [
            "google-chrome",
            "chromium",
            "chromium-browser",
            "chrome",
            "brave-browser",
        ];
        for dir in std::env::split_paths(&path_var) {
            for exe in candidates {
                let full = dir.join(exe);
                if full.exists() {
                    return Some(full.to_string_lossy().to_string());
                }
            }
        }
    }

    #[cfg(target_os = "macos")]
    {
        let candidates = [
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    #[cfg(target_os = "linux")]
    {
        let candidates = [
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/usr/local/bin/chromium",
            "/usr/bin/brave-browser",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    #[cfg(target_os = "windows")]
    {
        let candidates = [
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    None
}

/// Whether JS rendering is available on this machine.
pub fn native_browser_available() -> bool {
    find_chrome_executable().is_some()
}

fn build_headless_config(exe: &str) -> Result<BrowserConfig> {
    BrowserConfig::builder()
        .chrome_executable(exe)
        .viewport(Viewport {
            width: 1280,
            height: 900,
            device_scale_factor: Some(1.0),
            emulating_mobile: false,
            is_landscape: true,
            has_touch: false,
        })
        .window_size(1280, 900)
        .arg("--disable-gpu")
        .arg("--no-sandbox") // required in Docker / CI environments
        .arg("--disable-dev-shm-usage") // avoids /dev/shm OOM in Docker
        .arg("--disable-extensions")
        .arg("--disable-background-networking")
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--hide-scrollbars")
        .arg("--mute-audio")
        .build()
        .map_err(|e| anyhow!("Failed to build browser config: {}", e))
}

/// Fetch the rendered HTML of `url` with a fresh headless browser.
///
/// `wait_ms` — settle time after navigation before capturing HTML.
pub async fn fetch_html_rendered(url: &str, wait_ms: u64) -> Result<String> {
    let exe = find_chrome_executable().ok_or_else(|| {
        anyhow!("No browser found. Install Chrome or Chromium, or set CHROME_EXECUTABLE.")
    })?;

    let config = build_headless_config(&exe)?;
    let (mut browser, mut handler) = Browser::launch(config)
        .await
        .map_err(|e| anyhow!("Failed to launch browser ({}): {}", exe, e))?;

    let _handle = tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(e) = event {
                error!("CDP handler error: {}", e);
            }
        }
    });

    let result: Result<String> = async {
        let page = browser
            .new_page(url)
            .await
            .map_err(|e| anyhow!("Failed to open page: {}", e))?;

        tokio::time::sleep(Duration::from_millis(wait_ms)).await;

        page.content()
            .await
            .map_err(|e| anyhow!("Failed to get page content: {}", e))
    }
    .await;

    // Best-effort cleanup — don't let a close error shadow the fetch error.
    if let Err(e) = browser.close().await {
        warn!("Browser close error (non-fatal): {}", e);
    }

    result
}
