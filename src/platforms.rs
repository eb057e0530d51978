//! Per-platform declarative configuration and the authenticated-session check.
//!
//! A platform record carries everything the automation engine needs to drive
//! a marketplace: login URL, the dual URL+selector auth predicate, marketplace
//! navigation targets, and the loose selector unions used for extraction.
//!
//! [`verify_login`] is the **single source of truth** for "is this session
//! authenticated". It must never be satisfied by URL alone or DOM alone;
//! cached pages and half-finished redirects produce false positives on either
//! signal in isolation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::Page;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::automation::{engine::MarketplaceEngine, MarketplaceAutomation};
use crate::core::config::{BrowserConfig, VerificationConfig};

// ───────────────────────────────────────────────────────────────────────────
// Declarative platform record
// ───────────────────────────────────────────────────────────────────────────

/// Combined URL + selector predicate defining "logged in" for one platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthCheck {
    /// Current URL must contain this fragment.
    pub url_includes: String,
    /// ...and must NOT contain this fragment (login/SSO redirect tell).
    pub url_excludes: String,
    /// Comma-separated selector list, tried in order, first match wins.
    pub selectors: String,
    pub description: String,
}

/// Login form field selectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginForm {
    pub email_selector: String,
    pub password_selector: String,
    pub submit_selector: String,
}

/// Marketplace navigation target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Marketplace {
    pub url: String,
    /// Selector that signals the results grid has rendered.
    pub ready_selector: String,
    /// Query-string search template; `{query}` is replaced with the niche.
    pub search_url: String,
    /// Optional language filter control. Absence on the page is non-fatal.
    #[serde(default)]
    pub language_filter_selector: Option<String>,
    /// Optional sort control. Absence on the page is non-fatal.
    #[serde(default)]
    pub sort_selector: Option<String>,
    /// Next-page control for the pagination loop.
    #[serde(default)]
    pub pagination_selector: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Registry key, lowercase ("hotmart").
    pub key: String,
    pub login_url: String,
    pub login_form: LoginForm,
    pub auth_check: AuthCheck,
    pub marketplace: Marketplace,
    /// URL fragments that mark the login/SSO space (cookie-reuse failure tell).
    pub login_url_tokens: Vec<String>,
    /// URL fragments that mark the email/2FA verification interstitial.
    pub verification_url_tokens: Vec<String>,
    /// Path fragment identifying product detail URLs, for the anchor fallback.
    pub product_path_token: String,
    /// Per-platform override of the verification long-poll constants.
    #[serde(skip)]
    pub verification: Option<VerificationConfig>,
}

impl PlatformConfig {
    /// Built-in Hotmart marketplace record.
    pub fn hotmart() -> Self {
        Self {
            key: "hotmart".to_string(),
            login_url: "https://app.hotmart.com/login".to_string(),
            login_form: LoginForm {
                email_selector: "input[name='username'], input[type='email'], #username"
                    .to_string(),
                password_selector: "input[name='password'], input[type='password'], #password"
                    .to_string(),
                submit_selector: "button[type='submit'], button.login-button".to_string(),
            },
            auth_check: AuthCheck {
                url_includes: "app.hotmart.com".to_string(),
                url_excludes: "login".to_string(),
                selectors: "[data-testid='user-menu'], .user-avatar, hot-application-header"
                    .to_string(),
                description: "Hotmart app shell with user menu".to_string(),
            },
            marketplace: Marketplace {
                url: "https://app.hotmart.com/market".to_string(),
                ready_selector: "main, [class*='marketplace'], [class*='results']".to_string(),
                search_url: "https://app.hotmart.com/market/search?q={query}".to_string(),
                language_filter_selector: Some("[data-testid='language-filter']".to_string()),
                sort_selector: Some("[data-testid='sort-select']".to_string()),
                pagination_selector: Some(
                    "button[aria-label='Next page'], a[rel='next']".to_string(),
                ),
            },
            login_url_tokens: vec!["login".to_string(), "sso".to_string(), "auth".to_string()],
            verification_url_tokens: vec![
                "verify".to_string(),
                "confirm".to_string(),
                "two-factor".to_string(),
                "2fa".to_string(),
            ],
            product_path_token: "/product/".to_string(),
            verification: None,
        }
    }

    /// URL fragments that keep the URL-leaves-verification poll waiting:
    /// verification tokens plus the login/SSO space itself.
    pub fn verification_space_tokens(&self) -> Vec<&str> {
        self.verification_url_tokens
            .iter()
            .chain(self.login_url_tokens.iter())
            .map(|s| s.as_str())
            .collect()
    }

    /// True when `url` is inside the login/SSO space.
    pub fn is_login_url(&self, url: &str) -> bool {
        let lower = url.to_lowercase();
        self.login_url_tokens.iter().any(|t| lower.contains(t))
    }

    /// True when `url` looks like the email/2FA verification interstitial.
    pub fn is_verification_url(&self, url: &str) -> bool {
        let lower = url.to_lowercase();
        self.verification_url_tokens.iter().any(|t| lower.contains(t))
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Login verification
// ───────────────────────────────────────────────────────────────────────────

/// Mutually exclusive outcomes of the authenticated-session check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoginCheckReason {
    /// URL predicate failed (wrong host, or still on a login/SSO page).
    UrlCheckFailed,
    /// A selector lookup raised (invalid selector, page torn down).
    SelectorCheckFailed,
    /// Every selector in the list resolved to nothing within its wait.
    SelectorNotFound,
    /// Both predicates held.
    AuthVerified,
}

impl LoginCheckReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UrlCheckFailed => "URL_CHECK_FAILED",
            Self::SelectorCheckFailed => "SELECTOR_CHECK_FAILED",
            Self::SelectorNotFound => "SELECTOR_NOT_FOUND",
            Self::AuthVerified => "AUTH_VERIFIED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginCheck {
    pub is_logged_in: bool,
    pub reason: LoginCheckReason,
    pub details: String,
}

/// Pure URL half of the predicate, split out so it is testable without a
/// live page.
pub fn url_satisfies_auth_check(url: &str, check: &AuthCheck) -> bool {
    let lower = url.to_lowercase();
    lower.contains(&check.url_includes.to_lowercase())
        && !lower.contains(&check.url_excludes.to_lowercase())
}

/// Poll `document.querySelector(sel)` until it matches or `timeout` elapses.
///
/// `Ok(true)`: matched. `Ok(false)`: timed out without a match.
/// `Err`: the lookup itself raised (maps to `SELECTOR_CHECK_FAILED`).
async fn selector_resolves(page: &Page, selector: &str, timeout: Duration) -> anyhow::Result<bool> {
    let probe = format!(
        "!!document.querySelector({})",
        serde_json::to_string(selector)?
    );
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let found = page
            .evaluate(probe.as_str())
            .await?
            .into_value::<bool>()
            .unwrap_or(false);
        if found {
            return Ok(true);
        }
        if tokio::time::Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

/// The authenticated-session check: URL predicate AND at least one selector
/// from the comma-separated list resolving within `selector_timeout` (tried
/// in order, first match wins).
pub async fn verify_login(
    page: &Page,
    platform: &PlatformConfig,
    selector_timeout: Duration,
) -> LoginCheck {
    let url = match page.url().await {
        Ok(Some(u)) => u,
        Ok(None) | Err(_) => {
            return LoginCheck {
                is_logged_in: false,
                reason: LoginCheckReason::UrlCheckFailed,
                details: "page URL unavailable".to_string(),
            }
        }
    };

    if !url_satisfies_auth_check(&url, &platform.auth_check) {
        debug!("verify_login: URL predicate failed for {}", url);
        return LoginCheck {
            is_logged_in: false,
            reason: LoginCheckReason::UrlCheckFailed,
            details: format!(
                "url '{}' must contain '{}' and not '{}'",
                url, platform.auth_check.url_includes, platform.auth_check.url_excludes
            ),
        };
    }

    for selector in platform.auth_check.selectors.split(',') {
        let selector = selector.trim();
        if selector.is_empty() {
            continue;
        }
        match selector_resolves(page, selector, selector_timeout).await {
            Ok(true) => {
                info!(
                    "verify_login: ✅ {} authenticated via '{}'",
                    platform.key, selector
                );
                return LoginCheck {
                    is_logged_in: true,
                    reason: LoginCheckReason::AuthVerified,
                    details: format!("matched '{}' ({})", selector, platform.auth_check.description),
                };
            }
            Ok(false) => continue,
            Err(e) => {
                return LoginCheck {
                    is_logged_in: false,
                    reason: LoginCheckReason::SelectorCheckFailed,
                    details: format!("selector '{}' lookup failed: {}", selector, e),
                }
            }
        }
    }

    LoginCheck {
        is_logged_in: false,
        reason: LoginCheckReason::SelectorNotFound,
        details: format!(
            "no selector in '{}' matched",
            platform.auth_check.selectors
        ),
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Registry
// ───────────────────────────────────────────────────────────────────────────

/// Builds an un-launched automation engine for one platform. Adding a
/// platform means registering a factory, not editing a dispatch switch.
pub trait AutomationFactory: Send + Sync {
    fn create(
        &self,
        platform: PlatformConfig,
        browser: BrowserConfig,
        verification: VerificationConfig,
    ) -> Box<dyn MarketplaceAutomation>;
}

struct EngineFactory;

impl AutomationFactory for EngineFactory {
    fn create(
        &self,
        platform: PlatformConfig,
        browser: BrowserConfig,
        verification: VerificationConfig,
    ) -> Box<dyn MarketplaceAutomation> {
        Box::new(MarketplaceEngine::new(platform, browser, verification))
    }
}

pub struct PlatformEntry {
    pub config: PlatformConfig,
    pub factory: Arc<dyn AutomationFactory>,
}

/// Platform key → config + automation factory.
pub struct PlatformRegistry {
    entries: HashMap<String, PlatformEntry>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Registry pre-loaded with the built-in marketplaces.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(PlatformConfig::hotmart(), Arc::new(EngineFactory));
        registry
    }

    pub fn register(&mut self, config: PlatformConfig, factory: Arc<dyn AutomationFactory>) {
        self.entries
            .insert(config.key.to_lowercase(), PlatformEntry { config, factory });
    }

    pub fn resolve(&self, platform: &str) -> Option<&PlatformEntry> {
        self.entries.get(&platform.to_lowercase())
    }

    pub fn supported(&self) -> Vec<&str> {
        self.entries.keys().map(|k| k.as_str()).collect()
    }
}

impl Default for PlatformRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check() -> AuthCheck {
        AuthCheck {
            url_includes: "app.hotmart.com".to_string(),
            url_excludes: "login".to_string(),
            selectors: ".a, .b".to_string(),
            description: "test".to_string(),
        }
    }

    #[test]
    fn url_predicate_requires_include_and_rejects_exclude() {
        assert!(url_satisfies_auth_check(
            "https://app.hotmart.com/market",
            &check()
        ));
        // Still on the login page: include matches but exclude also matches.
        assert!(!url_satisfies_auth_check(
            "https://app.hotmart.com/login?next=/market",
            &check()
        ));
        assert!(!url_satisfies_auth_check("https://example.com/", &check()));
    }

    #[test]
    fn url_predicate_is_case_insensitive() {
        assert!(url_satisfies_auth_check(
            "https://APP.HOTMART.COM/Market",
            &check()
        ));
    }

    #[test]
    fn verification_space_covers_login_and_2fa() {
        let p = PlatformConfig::hotmart();
        assert!(p.is_login_url("https://sso.hotmart.com/signin"));
        assert!(p.is_verification_url("https://app.hotmart.com/verify-email"));
        assert!(!p.is_verification_url("https://app.hotmart.com/market"));
    }

    #[test]
    fn registry_resolves_case_insensitively() {
        let registry = PlatformRegistry::with_builtin();
        assert!(registry.resolve("Hotmart").is_some());
        assert!(registry.resolve("hotmart").is_some());
        assert!(registry.resolve("unknown").is_none());
    }

    #[test]
    fn reason_codes_are_stable_strings() {
        assert_eq!(LoginCheckReason::UrlCheckFailed.as_str(), "URL_CHECK_FAILED");
        assert_eq!(
            LoginCheckReason::SelectorCheckFailed.as_str(),
            "SELECTOR_CHECK_FAILED"
        );
        assert_eq!(
            LoginCheckReason::SelectorNotFound.as_str(),
            "SELECTOR_NOT_FOUND"
        );
        assert_eq!(LoginCheckReason::AuthVerified.as_str(), "AUTH_VERIFIED");
    }
}
