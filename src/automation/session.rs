//! Per-platform cookie jar persistence.
//!
//! After a successful form login the browser cookies are saved to
//! `~/.nichehawk/sessions/{platform}.json`. The next mission against the same
//! platform loads and injects them before navigation, skipping the login form
//! (and its email-verification round-trip) entirely when the session is still
//! valid.
//!
//! Concurrent missions against the same platform can race on the jar file
//! (one overwrites another's cookies). Accepted: cookie reuse is a best-effort
//! optimization, not a correctness requirement, and the loser simply falls
//! through to a fresh form login.

use chromiumoxide::Page;
use tracing::{info, warn};

/// Filesystem-safe key for a platform identifier.
fn platform_key(platform: &str) -> String {
    platform
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Full path to the cookie jar for a platform.
pub fn session_path(platform: &str) -> Option<std::path::PathBuf> {
    let home = dirs::home_dir()?;
    Some(
        home.join(".nichehawk")
            .join("sessions")
            .join(format!("{}.json", platform_key(platform))),
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Expiry helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Minimum finite cookie expiry timestamp from a raw cookie array.
///
/// CDP cookies carry an `expires` field that is either `-1.0` (session
/// cookie, no persistent expiry) or a positive Unix timestamp in seconds.
/// Returns `None` when every cookie is session-scoped.
pub fn min_cookie_expiry(raw_cookies: &[serde_json::Value]) -> Option<f64> {
    raw_cookies
        .iter()
        .filter_map(|v| v.get("expires").and_then(|e| e.as_f64()))
        .filter(|&exp| exp > 0.0) // -1 = session cookie, skip
        .reduce(f64::min)
}

/// True when the jar holds at least one persistent cookie that has already
/// expired. A fully session-scoped jar is treated as still usable; the
/// engine's post-navigation URL check is the real authority.
pub fn jar_expired(raw_cookies: &[serde_json::Value]) -> bool {
    match min_cookie_expiry(raw_cookies) {
        Some(min_exp) => min_exp < chrono::Utc::now().timestamp() as f64,
        None => false,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Load / save / inject
// ─────────────────────────────────────────────────────────────────────────────

/// Load stored cookies for a platform as raw JSON values.
///
/// Returns `None` when no jar exists, the file is unreadable/empty, or the
/// jar is known-expired (in which case the stale file is removed).
pub fn load_raw(platform: &str) -> Option<Vec<serde_json::Value>> {
    let path = session_path(platform)?;
    if !path.exists() {
        return None;
    }
    let content = std::fs::read_to_string(&path).ok()?;
    let cookies: Vec<serde_json::Value> = serde_json::from_str(&content).ok()?;
    if cookies.is_empty() {
        return None;
    }
    if jar_expired(&cookies) {
        info!("session: jar for '{}' is expired, discarding", platform);
        invalidate(platform);
        return None;
    }
    info!(
        "session: 🍪 loaded {} cookies for '{}' ({})",
        cookies.len(),
        platform,
        path.display()
    );
    Some(cookies)
}

/// Persist the page's current cookies as the platform jar.
///
/// Write is atomic (temp file + rename) so a crash mid-write never leaves a
/// truncated jar behind.
pub async fn save_from_page(page: &Page, platform: &str) -> anyhow::Result<()> {
    let cookies = page.get_cookies().await?;
    let raw: Vec<serde_json::Value> = cookies
        .iter()
        .filter_map(|c| serde_json::to_value(c).ok())
        .collect();

    let path = session_path(platform)
        .ok_or_else(|| anyhow::anyhow!("no home directory for session storage"))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(&raw)?)?;
    std::fs::rename(&tmp, &path)?;

    info!(
        "session: 💾 saved {} cookies for '{}' ({})",
        raw.len(),
        platform,
        path.display()
    );
    Ok(())
}

/// Inject stored cookies into a live CDP page **before** navigation.
///
/// Any individual cookie that fails to deserialize is silently skipped so a
/// partially-malformed jar never blocks a mission. Returns the number of
/// cookies injected.
pub async fn inject_into_page(page: &Page, raw_cookies: &[serde_json::Value]) -> usize {
    use chromiumoxide::cdp::browser_protocol::network::{CookieParam, SetCookiesParams};

    let cookie_params: Vec<CookieParam> = raw_cookies
        .iter()
        .filter_map(|v| serde_json::from_value::<CookieParam>(v.clone()).ok())
        .collect();

    if cookie_params.is_empty() {
        warn!("session: stored jar contained no valid CookieParams, skipping injection");
        return 0;
    }

    let count = cookie_params.len();
    match page.execute(SetCookiesParams::new(cookie_params)).await {
        Ok(_) => {
            info!("session: 💉 injected {} cookies into CDP page", count);
            count
        }
        Err(e) => {
            warn!("session: failed to inject cookies: {}", e);
            0
        }
    }
}

/// Remove the stored jar so the next mission performs a fresh form login.
pub fn invalidate(platform: &str) {
    if let Some(path) = session_path(platform) {
        if path.exists() {
            match std::fs::remove_file(&path) {
                Ok(()) => info!(
                    "session: 🗑️  removed stale jar for '{}' ({})",
                    platform,
                    path.display()
                ),
                Err(e) => warn!("session: failed to remove {}: {}", path.display(), e),
            }
        }
    }
}
