//! Browser automation layer.
//!
//! One engine instance drives one mission's browser session: init, login
//! (cookie reuse → form login → verification long-poll), marketplace search,
//! heuristic extraction, optional detail fetches, close. The session is a
//! stateful, non-shareable resource; engines are never shared across
//! concurrent missions.

pub mod browser;
pub mod engine;
pub mod parse;
pub mod session;

use async_trait::async_trait;

use crate::core::types::{ProductCard, ProductDetails};
use crate::error::MissionError;

/// Engine lifecycle, advanced strictly forward by the trait operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Initialized,
    LoggedIn,
    LoginFailed,
    Navigating,
    Searching,
    Extracting,
    Closed,
}

/// Common automation interface all platform engines implement.
///
/// `close` must be safe to call in any state, including after a partial
/// failure; it swallows secondary errors and resets internal state.
#[async_trait]
pub trait MarketplaceAutomation: Send {
    /// Launch the browser context. Failure is fatal to the mission.
    async fn init(&mut self) -> Result<(), MissionError>;

    /// Cookie-jar reuse first, full form login on fallback, including the
    /// email/2FA verification long-poll.
    async fn login(&mut self, email: &str, password: &str) -> Result<(), MissionError>;

    /// Navigate to the marketplace and run a keyword search, applying
    /// optional language/sort filters opportunistically.
    async fn search(&mut self, niche: &str, language: Option<&str>) -> Result<(), MissionError>;

    /// Heuristic product-card extraction, capped at `max_products`.
    /// A page with zero matching anchors yields an empty vec, never an error.
    async fn extract(&mut self, max_products: usize) -> Result<Vec<ProductCard>, MissionError>;

    /// Best-effort detail-page enrichment; absent fields are non-fatal.
    async fn product_details(&mut self, url: &str) -> Result<ProductDetails, MissionError>;

    /// Release page/browser and reset state. Never fails.
    async fn close(&mut self);

    fn state(&self) -> EngineState;
}
