//! Chromium launch plumbing shared by every platform engine.
//!
//! * Browser executable discovery (Chromium/Chrome on Linux workers, macOS
//!   for local runs).
//! * Stealth launch config with a realistic fingerprint (viewport, rotating
//!   user agent, `--disable-blink-features=AutomationControlled`).
//! * `wait_until_stable`: a networkidle heuristic for JS-rendered pages.

use anyhow::{anyhow, Result};
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::Page;
use rand::seq::IndexedRandom;
use std::path::Path;
use std::time::Duration;
use tracing::info;

// ── Realistic User-Agent pool ────────────────────────────────────────────────

const DESKTOP_USER_AGENTS: &[&str] = &[
    // Chrome 132 – Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36",
    // Chrome 132 – macOS
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36",
    // Chrome 131 – Linux
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    // Edge 132 – Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36 Edg/132.0.0.0",
];

/// Returns a randomly-chosen realistic desktop User-Agent string.
pub fn random_user_agent() -> &'static str {
    let mut rng = rand::rng();
    DESKTOP_USER_AGENTS
        .choose(&mut rng)
        .copied()
        .unwrap_or(DESKTOP_USER_AGENTS[0])
}

// ── Browser executable discovery ─────────────────────────────────────────────

/// Find a usable Chromium-family browser executable.
///
/// Resolution order: `CHROME_EXECUTABLE` env var (explicit override), PATH
/// scan, then the well-known install paths for the OSes workers run on
/// (Linux in deployment, macOS locally).
pub fn find_chrome_executable() -> Option<String> {
    const PATH_NAMES: &[&str] = &["chromium", "chromium-browser", "google-chrome", "chrome"];

    #[cfg(target_os = "linux")]
    const INSTALL_PATHS: &[&str] = &[
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/usr/bin/google-chrome",
        "/usr/local/bin/chromium",
    ];
    #[cfg(target_os = "macos")]
    const INSTALL_PATHS: &[&str] = &[
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
    ];
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    const INSTALL_PATHS: &[&str] = &[];

    if let Ok(p) = std::env::var("CHROME_EXECUTABLE") {
        if Path::new(&p).exists() {
            return Some(p);
        }
    }

    if let Ok(path_var) = std::env::var("PATH") {
        for dir in std::env::split_paths(&path_var) {
            for exe in PATH_NAMES {
                let full = dir.join(exe);
                if full.exists() {
                    return Some(full.to_string_lossy().into_owned());
                }
            }
        }
    }

    INSTALL_PATHS
        .iter()
        .find(|c| Path::new(c).exists())
        .map(|c| c.to_string())
}

// ── Stealth launch config ────────────────────────────────────────────────────

/// Build a `BrowserConfig` for headless operation with stealth defaults.
///
/// Flags chosen for:
/// * Compatibility with CI / restricted environments (`--no-sandbox`,
///   `--disable-dev-shm-usage`).
/// * Stealth: `--disable-blink-features=AutomationControlled` hides the
///   `navigator.webdriver` flag; UA is drawn from `DESKTOP_USER_AGENTS`.
pub fn build_stealth_config(exe: &str, width: u32, height: u32) -> Result<BrowserConfig> {
    let ua = random_user_agent();

    BrowserConfig::builder()
        .chrome_executable(exe)
        .viewport(Viewport {
            width,
            height,
            device_scale_factor: Some(1.0),
            emulating_mobile: false,
            is_landscape: true,
            has_touch: false,
        })
        .window_size(width, height)
        .arg("--disable-gpu")
        .arg("--no-sandbox")
        .arg("--disable-setuid-sandbox")
        .arg("--disable-dev-shm-usage")
        .arg("--disable-extensions")
        .arg("--disable-background-networking")
        .arg("--disable-sync")
        .arg("--disable-translate")
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--hide-scrollbars")
        .arg("--mute-audio")
        .arg("--lang=pt-BR,pt,en")
        // Stealth: suppress CDP automation fingerprint
        .arg("--disable-blink-features=AutomationControlled")
        .arg(format!("--user-agent={}", ua))
        .build()
        .map_err(|e| anyhow!("Failed to build browser config: {}", e))
}

// ── Smart wait / networkidle ─────────────────────────────────────────────────

/// Wait until the page network goes idle (no new resource entries for
/// `quiet_ms` consecutive ms) or until `timeout_ms` has elapsed.
///
/// Polls `performance.getEntriesByType("resource").length` every 250 ms;
/// a networkidle heuristic that works without CDP Network events.
pub async fn wait_until_stable(page: &Page, quiet_ms: u64, timeout_ms: u64) -> Result<()> {
    let poll_ms = 250u64;
    let start = std::time::Instant::now();
    let mut last_count: u64 = 0;
    let mut stable_since = std::time::Instant::now();

    loop {
        if start.elapsed().as_millis() as u64 >= timeout_ms {
            info!("wait_until_stable: timeout after {}ms", timeout_ms);
            break;
        }

        let count: u64 = page
            .evaluate("performance.getEntriesByType('resource').length")
            .await
            .ok()
            .and_then(|v| v.into_value::<serde_json::Value>().ok())
            .and_then(|j| j.as_u64())
            .unwrap_or(0);

        let ready_complete: bool = page
            .evaluate("document.readyState")
            .await
            .ok()
            .and_then(|v| v.into_value::<serde_json::Value>().ok())
            .and_then(|j| j.as_str().map(|s| s == "complete"))
            .unwrap_or(false);

        if !ready_complete {
            // DOM not fully loaded; do not allow "idle" to trigger yet.
            stable_since = std::time::Instant::now();
            last_count = count;
        } else if count != last_count {
            last_count = count;
            stable_since = std::time::Instant::now();
        } else if stable_since.elapsed().as_millis() as u64 >= quiet_ms {
            break;
        }

        tokio::time::sleep(Duration::from_millis(poll_ms)).await;
    }
    Ok(())
}

/// Short randomized pause between page interactions, simulating a human
/// reading beat.
pub async fn human_pause(min_ms: u64, max_ms: u64) {
    use rand::distr::{Distribution, Uniform};
    let wait = {
        let mut rng = rand::rng();
        Uniform::new(min_ms, max_ms)
            .map(|d| d.sample(&mut rng))
            .unwrap_or(min_ms)
    };
    tokio::time::sleep(Duration::from_millis(wait)).await;
}
