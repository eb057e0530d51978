//! Chromium-driven marketplace engine.
//!
//! Drives one mission's browser session through the full
//! login → search → extract → details sequence. Page interactions carry
//! explicit timeouts; the email/2FA verification wait is a polling loop, not
//! a single sleep, because the user completes it out-of-band and the URL is
//! the only progress signal.

use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chromiumoxide::{Browser, Element, Page};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{browser as browser_util, parse, session, EngineState, MarketplaceAutomation};
use crate::core::config::{BrowserConfig, VerificationConfig};
use crate::core::types::{ProductCard, ProductDetails};
use crate::error::MissionError;
use crate::platforms::{verify_login, PlatformConfig};

/// Upper bound on the pagination loop so an endless results feed cannot pin
/// a worker.
const MAX_RESULT_PAGES: usize = 5;

pub struct MarketplaceEngine {
    platform: PlatformConfig,
    browser_cfg: BrowserConfig,
    verification: VerificationConfig,
    browser: Option<Browser>,
    handler_task: Option<JoinHandle<()>>,
    page: Option<Page>,
    state: EngineState,
}

impl MarketplaceEngine {
    pub fn new(
        platform: PlatformConfig,
        browser_cfg: BrowserConfig,
        verification: VerificationConfig,
    ) -> Self {
        // Platform records may override the process-wide verification tuning.
        let verification = platform.verification.clone().unwrap_or(verification);
        Self {
            platform,
            browser_cfg,
            verification,
            browser: None,
            handler_task: None,
            page: None,
            state: EngineState::Uninitialized,
        }
    }

    fn page(&self) -> Result<&Page, MissionError> {
        self.page
            .as_ref()
            .ok_or_else(|| MissionError::automation(anyhow!("engine has no live page")))
    }

    async fn goto(&self, url: &str) -> Result<(), MissionError> {
        let page = self.page()?;
        tokio::time::timeout(self.browser_cfg.action_timeout, page.goto(url))
            .await
            .map_err(|_| {
                MissionError::automation(anyhow!(
                    "navigation to {} timed out after {:?}",
                    url,
                    self.browser_cfg.action_timeout
                ))
            })?
            .map_err(|e| MissionError::automation(anyhow!("navigation to {} failed: {}", url, e)))?;
        browser_util::wait_until_stable(page, 1500, 10_000).await.ok();
        Ok(())
    }

    async fn current_url(&self) -> Result<String, MissionError> {
        self.page()?
            .url()
            .await
            .map_err(|e| MissionError::automation(anyhow!("failed to read page URL: {}", e)))?
            .ok_or_else(|| MissionError::automation(anyhow!("page has no URL")))
    }

    /// Try each selector in a comma-separated list in order, first match wins.
    async fn find_first(&self, selector_list: &str) -> Option<Element> {
        let page = self.page().ok()?;
        for selector in selector_list.split(',') {
            let selector = selector.trim();
            if selector.is_empty() {
                continue;
            }
            if let Ok(el) = page.find_element(selector).await {
                return Some(el);
            }
        }
        None
    }

    /// Visible body text, for verification-interstitial and error-banner
    /// detection.
    async fn body_text(&self) -> String {
        let Ok(page) = self.page() else {
            return String::new();
        };
        page.evaluate("document.body ? document.body.innerText : ''")
            .await
            .ok()
            .and_then(|v| v.into_value::<String>().ok())
            .unwrap_or_default()
    }

    // ── Login ────────────────────────────────────────────────────────────

    /// Silent cookie-jar reuse: inject the saved jar, navigate straight to
    /// an authenticated page, and confirm we were not bounced to login/SSO.
    async fn try_cookie_login(&mut self) -> Result<bool, MissionError> {
        let Some(raw) = session::load_raw(&self.platform.key) else {
            return Ok(false);
        };
        if session::inject_into_page(self.page()?, &raw).await == 0 {
            return Ok(false);
        }

        self.goto(&self.platform.marketplace.url).await?;
        let url = self.current_url().await?;
        if self.platform.is_login_url(&url) {
            info!(
                "login: 🍪 saved session rejected (bounced to {}), falling back to form login",
                url
            );
            session::invalidate(&self.platform.key);
            return Ok(false);
        }

        let check =
            verify_login(self.page()?, &self.platform, self.browser_cfg.selector_timeout).await;
        if check.is_logged_in {
            info!("login: 🍪 cookie session still valid for {}", self.platform.key);
            Ok(true)
        } else {
            info!(
                "login: cookie session failed auth check ({}), falling back to form login",
                check.reason.as_str()
            );
            session::invalidate(&self.platform.key);
            Ok(false)
        }
    }

    async fn fill_field(&self, selector_list: &str, value: &str, label: &str) -> Result<(), MissionError> {
        let el = self.find_first(selector_list).await.ok_or_else(|| {
            MissionError::automation(anyhow!(
                "login form field '{}' not found (tried: {})",
                label,
                selector_list
            ))
        })?;
        el.click()
            .await
            .map_err(|e| MissionError::automation(anyhow!("click on '{}' failed: {}", label, e)))?;
        el.type_str(value)
            .await
            .map_err(|e| MissionError::automation(anyhow!("typing into '{}' failed: {}", label, e)))?;
        Ok(())
    }

    async fn form_login(&mut self, email: &str, password: &str) -> Result<(), MissionError> {
        info!("login: 📝 form login at {}", self.platform.login_url);
        self.goto(&self.platform.login_url).await?;
        browser_util::human_pause(800, 2000).await;

        let form = self.platform.login_form.clone();
        self.fill_field(&form.email_selector, email, "email").await?;
        browser_util::human_pause(300, 900).await;
        self.fill_field(&form.password_selector, password, "password").await?;
        browser_util::human_pause(300, 900).await;

        let submit = self.find_first(&form.submit_selector).await.ok_or_else(|| {
            MissionError::automation(anyhow!(
                "login submit button not found (tried: {})",
                form.submit_selector
            ))
        })?;
        submit
            .click()
            .await
            .map_err(|e| MissionError::automation(anyhow!("login submit click failed: {}", e)))?;

        // Give the redirect chain a moment before inspecting where we landed.
        tokio::time::sleep(Duration::from_secs(3)).await;
        browser_util::wait_until_stable(self.page()?, 1500, 10_000).await.ok();
        Ok(())
    }

    /// True when the current page is the email/2FA verification interstitial,
    /// by URL or by visible text.
    async fn on_verification_interstitial(&self) -> Result<bool, MissionError> {
        let url = self.current_url().await?;
        if self.platform.is_verification_url(&url) {
            return Ok(true);
        }
        let text = self.body_text().await.to_lowercase();
        Ok(text.contains("verification code")
            || text.contains("verifique seu e-mail")
            || text.contains("confirme seu"))
    }

    async fn wait_for_verification(&self) -> Result<(), MissionError> {
        poll_verification(&self.platform, &self.verification, move || {
            self.current_url()
        })
        .await
    }

    /// Best-effort visible error message from the login page.
    async fn page_error_text(&self) -> Option<String> {
        let el = self
            .find_first(".error, .alert, [role='alert'], .form-error")
            .await?;
        el.inner_text().await.ok().flatten().filter(|t| !t.trim().is_empty())
    }

    // ── Extraction ───────────────────────────────────────────────────────

    async fn collect_cards(&self, seen: &mut Vec<String>) -> Vec<ProductCard> {
        let mut cards = Vec::new();
        let Ok(page) = self.page() else {
            return cards;
        };
        let anchors = match page.find_elements("a").await {
            Ok(a) => a,
            Err(e) => {
                warn!("extract: anchor scan failed: {}", e);
                return cards;
            }
        };

        for anchor in &anchors {
            let text = anchor.inner_text().await.ok().flatten().unwrap_or_default();
            if !parse::looks_like_product_card(&text) {
                continue;
            }
            let href = anchor.attribute("href").await.ok().flatten();
            if let Some(mut card) = parse::parse_product_card(&text, href.as_deref()) {
                let key = card.url.clone().unwrap_or_else(|| card.name.clone());
                if seen.contains(&key) {
                    continue;
                }
                seen.push(key);
                if let Ok(img) = anchor.find_element("img").await {
                    card.image_url = img.attribute("src").await.ok().flatten();
                }
                cards.push(card);
            }
        }
        cards
    }

    /// Generic fallback when the content heuristic yields nothing: anchors
    /// whose URL carries the product-path token.
    async fn collect_fallback(&self, seen: &mut Vec<String>) -> Vec<ProductCard> {
        let mut cards = Vec::new();
        let Ok(page) = self.page() else {
            return cards;
        };
        let Ok(anchors) = page.find_elements("a").await else {
            return cards;
        };

        for anchor in &anchors {
            let Some(href) = anchor.attribute("href").await.ok().flatten() else {
                continue;
            };
            if !href.contains(&self.platform.product_path_token) || seen.contains(&href) {
                continue;
            }
            let text = anchor.inner_text().await.ok().flatten().unwrap_or_default();
            let card = parse::parse_product_card(&text, Some(&href)).or_else(|| {
                let name = text.lines().map(str::trim).find(|l| l.len() >= 4)?;
                Some(ProductCard {
                    name: name.to_string(),
                    url: Some(href.clone()),
                    ..Default::default()
                })
            });
            if let Some(card) = card {
                seen.push(href);
                cards.push(card);
            }
        }
        cards
    }
}

#[async_trait]
impl MarketplaceAutomation for MarketplaceEngine {
    async fn init(&mut self) -> Result<(), MissionError> {
        let exe = self
            .browser_cfg
            .executable
            .clone()
            .or_else(browser_util::find_chrome_executable)
            .ok_or_else(|| {
                MissionError::config(
                    "No browser found. Install Chromium or Chrome, or set CHROME_EXECUTABLE.",
                )
            })?;

        info!("engine: 🚀 launching stealth browser ({})", exe);
        let config = browser_util::build_stealth_config(
            &exe,
            self.browser_cfg.viewport_width,
            self.browser_cfg.viewport_height,
        )
        .map_err(MissionError::automation)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| MissionError::automation(anyhow!("browser launch failed ({}): {}", exe, e)))?;

        let handle = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    warn!("CDP handler error: {}", e);
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| MissionError::automation(anyhow!("failed to open page: {}", e)))?;

        self.browser = Some(browser);
        self.handler_task = Some(handle);
        self.page = Some(page);
        self.state = EngineState::Initialized;
        Ok(())
    }

    async fn login(&mut self, email: &str, password: &str) -> Result<(), MissionError> {
        if self.try_cookie_login().await? {
            self.state = EngineState::LoggedIn;
            return Ok(());
        }

        self.form_login(email, password).await?;

        if self.on_verification_interstitial().await? {
            self.wait_for_verification().await?;
        }

        let check =
            verify_login(self.page()?, &self.platform, self.browser_cfg.selector_timeout).await;
        if !check.is_logged_in {
            self.state = EngineState::LoginFailed;
            let page_hint = self.page_error_text().await;
            let mut msg = format!(
                "Login failed for {}: {} ({})",
                self.platform.key,
                check.reason.as_str(),
                check.details
            );
            if let Some(hint) = page_hint {
                msg.push_str(&format!("; page said: {}", hint.trim()));
            }
            return Err(MissionError::automation(anyhow!(msg)));
        }

        if let Err(e) = session::save_from_page(self.page()?, &self.platform.key).await {
            warn!("login: cookie save failed (non-fatal): {}", e);
        }
        info!("login: ✅ authenticated on {}", self.platform.key);
        self.state = EngineState::LoggedIn;
        Ok(())
    }

    async fn search(&mut self, niche: &str, language: Option<&str>) -> Result<(), MissionError> {
        self.state = EngineState::Navigating;
        let encoded: String = url::form_urlencoded::byte_serialize(niche.as_bytes()).collect();
        let target = self.platform.marketplace.search_url.replace("{query}", &encoded);

        info!("search: 🔎 '{}' → {}", niche, target);
        self.goto(&target).await?;

        // Results-grid readiness is best effort; a slow grid still gets the
        // anchor scan, it just finds less.
        if self
            .find_first(&self.platform.marketplace.ready_selector)
            .await
            .is_none()
        {
            warn!(
                "search: ready selector '{}' not found, continuing anyway",
                self.platform.marketplace.ready_selector
            );
        }

        // Filters are opportunistic: a redesigned filter bar must not sink
        // the mission.
        if let (Some(lang), Some(selector)) = (
            language,
            self.platform.marketplace.language_filter_selector.clone(),
        ) {
            match self.find_first(&selector).await {
                Some(el) => {
                    if let Err(e) = el.click().await {
                        warn!("search: language filter click failed: {}", e);
                    } else {
                        info!("search: applied language filter '{}'", lang);
                        browser_util::human_pause(500, 1200).await;
                    }
                }
                None => info!("search: language filter control absent, skipping"),
            }
        }
        if let Some(selector) = self.platform.marketplace.sort_selector.clone() {
            if let Some(el) = self.find_first(&selector).await {
                if el.click().await.is_ok() {
                    browser_util::human_pause(400, 1000).await;
                }
            }
        }

        self.state = EngineState::Searching;
        Ok(())
    }

    async fn extract(&mut self, max_products: usize) -> Result<Vec<ProductCard>, MissionError> {
        self.state = EngineState::Extracting;
        let mut seen: Vec<String> = Vec::new();
        let mut products: Vec<ProductCard> = Vec::new();

        for page_no in 1..=MAX_RESULT_PAGES {
            let mut batch = self.collect_cards(&mut seen).await;
            if batch.is_empty() && products.is_empty() {
                batch = self.collect_fallback(&mut seen).await;
                if !batch.is_empty() {
                    info!(
                        "extract: primary heuristic empty, product-path fallback found {}",
                        batch.len()
                    );
                }
            }
            info!(
                "extract: page {} yielded {} cards ({} total)",
                page_no,
                batch.len(),
                products.len() + batch.len()
            );
            products.extend(batch);

            if products.len() >= max_products {
                break;
            }

            let Some(next_selector) = self.platform.marketplace.pagination_selector.clone() else {
                break;
            };
            let Some(next) = self.find_first(&next_selector).await else {
                break;
            };
            if next.click().await.is_err() {
                break;
            }
            browser_util::human_pause(800, 1800).await;
            browser_util::wait_until_stable(self.page()?, 1500, 8000).await.ok();
        }

        products.truncate(max_products);
        Ok(products)
    }

    async fn product_details(&mut self, url: &str) -> Result<ProductDetails, MissionError> {
        self.goto(url).await?;
        let body = self.body_text().await;

        let name = self
            .find_first("h1, [class*='product-name'], [class*='title']")
            .await
            .and_then_inner_text()
            .await;
        let description = self
            .find_first("[class*='description'] p, [class*='about'] p, main p")
            .await
            .and_then_inner_text()
            .await;
        let vendor = self
            .find_first("[class*='producer'], [class*='vendor'], [class*='author']")
            .await
            .and_then_inner_text()
            .await;

        let commission_line = body
            .lines()
            .find(|l| {
                let lower = l.to_lowercase();
                lower.contains("comiss") || lower.contains("commission")
            })
            .map(|l| l.trim().to_string());
        let commission_percent = commission_line.as_deref().and_then(|l| {
            match parse::parse_commission(l) {
                Some(parse::Commission::Percent(p)) => Some(p),
                _ => None,
            }
        });

        Ok(ProductDetails {
            name,
            description,
            price: parse::parse_price(&body),
            commission: commission_line,
            commission_percent,
            vendor,
        })
    }

    async fn close(&mut self) {
        self.page = None;
        if let Some(mut browser) = self.browser.take() {
            if let Err(e) = browser.close().await {
                warn!("engine: browser close error (ignored): {}", e);
            }
        }
        if let Some(handle) = self.handler_task.take() {
            handle.abort();
        }
        self.state = EngineState::Closed;
    }

    fn state(&self) -> EngineState {
        self.state
    }
}

/// Poll until the URL leaves the verification/login/SSO space.
///
/// The user completes verification out-of-band (email link, 2FA app), so the
/// URL is the only progress signal. Timeout while still on a verification
/// URL is the hard, named failure; timeout once already past it counts as
/// success and the final auth check decides. Generic over the URL source so
/// the loop can be exercised without a live page.
async fn poll_verification<F, Fut>(
    platform: &PlatformConfig,
    cfg: &VerificationConfig,
    current_url: F,
) -> Result<(), MissionError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<String, MissionError>>,
{
    info!(
        "login: ⏳ email/2FA verification detected, polling up to {:?}",
        cfg.ceiling
    );
    let start = tokio::time::Instant::now();
    let mut last_progress = start;

    loop {
        tokio::time::sleep(cfg.poll_interval).await;
        let url = current_url().await?;
        let in_space = platform
            .verification_space_tokens()
            .iter()
            .any(|t| url.to_lowercase().contains(t));

        if !in_space {
            info!(
                "login: ✅ verification completed after {:.0}s (now at {})",
                start.elapsed().as_secs_f64(),
                url
            );
            return Ok(());
        }

        if start.elapsed() >= cfg.ceiling {
            if platform.is_verification_url(&url) {
                warn!(
                    "login: ❌ still on verification URL after {:?}: {}",
                    cfg.ceiling, url
                );
                return Err(MissionError::VerificationTimeout);
            }
            // Past the interstitial but still in the login space; let the
            // final auth check decide.
            return Ok(());
        }

        if last_progress.elapsed() >= cfg.progress_interval {
            info!(
                "login: ⏳ waiting for verification... {:.0}s / {:.0}s",
                start.elapsed().as_secs_f64(),
                cfg.ceiling.as_secs_f64()
            );
            last_progress = tokio::time::Instant::now();
        }
    }
}

/// Small extension so optional-element text extraction reads linearly above.
trait OptionalElementText {
    async fn and_then_inner_text(self) -> Option<String>;
}

impl OptionalElementText for Option<Element> {
    async fn and_then_inner_text(self) -> Option<String> {
        let el = self?;
        el.inner_text()
            .await
            .ok()
            .flatten()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const INTERSTITIAL: &str = "https://app.hotmart.com/verify-email";
    const MARKETPLACE: &str = "https://app.hotmart.com/market";

    // Time is paused; every sleep in the poll loop auto-advances the clock,
    // so a 120s ceiling runs in microseconds.

    #[tokio::test(start_paused = true)]
    async fn verification_poll_exits_as_soon_as_the_url_moves_on() {
        let platform = PlatformConfig::hotmart();
        let cfg = VerificationConfig::default();
        let polls = Arc::new(AtomicUsize::new(0));

        // Stuck on the interstitial for 22 polls (~44s), then through.
        let counter = Arc::clone(&polls);
        let provider = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                Ok::<_, MissionError>(if n < 22 {
                    INTERSTITIAL.to_string()
                } else {
                    MARKETPLACE.to_string()
                })
            }
        };

        let start = tokio::time::Instant::now();
        poll_verification(&platform, &cfg, provider)
            .await
            .expect("user completed verification in time");
        assert!(start.elapsed() >= Duration::from_secs(44));
        assert!(start.elapsed() < cfg.ceiling);
        assert_eq!(polls.load(Ordering::SeqCst), 23);
    }

    #[tokio::test(start_paused = true)]
    async fn verification_poll_times_out_on_a_stuck_interstitial() {
        let platform = PlatformConfig::hotmart();
        let cfg = VerificationConfig::default();
        let provider =
            move || async move { Ok::<_, MissionError>(INTERSTITIAL.to_string()) };

        let start = tokio::time::Instant::now();
        let err = poll_verification(&platform, &cfg, provider)
            .await
            .expect_err("the interstitial never clears");
        assert!(matches!(err, MissionError::VerificationTimeout));
        assert!(start.elapsed() >= cfg.ceiling);
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_in_login_space_but_off_the_interstitial_is_not_a_timeout() {
        let platform = PlatformConfig::hotmart();
        let cfg = VerificationConfig::default();
        // SSO URL: still in the login space, no longer on verification.
        let provider = move || async move {
            Ok::<_, MissionError>("https://sso.hotmart.com/signin".to_string())
        };

        // The final auth check decides; the poll itself does not fail.
        poll_verification(&platform, &cfg, provider)
            .await
            .expect("past the interstitial counts as poll success");
    }
}
