//! Text heuristics for product-card recovery.
//!
//! Marketplace result grids are rendered dynamically with no stable
//! structural markup, so extraction works on the *visible text* of anchor
//! elements: a candidate card is any anchor whose text carries both a
//! temperature glyph and a commission keyword. Field parsing is pure and
//! deliberately forgiving (any field that fails to parse is `None`, never
//! an error) so it can be unit-tested against captured text fixtures
//! without a live page.

use std::sync::OnceLock;

use regex::Regex;

use crate::core::types::ProductCard;

/// Minimum visible-text length for a candidate card. Shorter anchors are
/// navigation chrome, not products.
pub const MIN_CARD_TEXT_LEN: usize = 30;

const COMMISSION_KEYWORDS: &[&str] = &["comissão", "comissao", "commission"];

fn temperature_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+(?:[.,]\d+)?)\s*°").unwrap())
}

fn rating_re() -> &'static Regex {
    // "4.8 (234)" / "4,8 (234)"
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d(?:[.,]\d+)?)\s*\((\d+)\)").unwrap())
}

fn percent_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+(?:[.,]\d+)?)\s*%").unwrap())
}

fn currency_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(?:R\$|US\$|\$|€|£)\s*(\d[\d.,]*)").unwrap())
}

// ───────────────────────────────────────────────────────────────────────────
// Numeric field parsers
// ───────────────────────────────────────────────────────────────────────────

/// Normalize a locale-formatted number ("1.234,56", "1,234.56", "497") into
/// an `f64`.
fn normalize_decimal(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let has_dot = raw.contains('.');
    let has_comma = raw.contains(',');
    let cleaned = match (has_dot, has_comma) {
        // Both present: the later one is the decimal separator.
        (true, true) => {
            if raw.rfind(',') > raw.rfind('.') {
                raw.replace('.', "").replace(',', ".")
            } else {
                raw.replace(',', "")
            }
        }
        // Comma only: decimal when followed by exactly 2 digits, thousands otherwise.
        (false, true) => {
            let after = raw.rsplit(',').next().unwrap_or("");
            if after.len() == 2 {
                raw.replace(',', ".")
            } else {
                raw.replace(',', "")
            }
        }
        _ => raw.to_string(),
    };
    cleaned.parse().ok()
}

/// Parse the first currency-prefixed amount in `text` ("R$ 497,00" → 497.0).
pub fn parse_price(text: &str) -> Option<f64> {
    currency_re()
        .captures(text)
        .and_then(|c| normalize_decimal(&c[1]))
}

/// A commission is quoted either as a percentage or a flat amount.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Commission {
    Percent(f64),
    Amount(f64),
}

/// Parse a commission figure, preferring the percent form when both appear.
pub fn parse_commission(text: &str) -> Option<Commission> {
    if let Some(c) = percent_re().captures(text) {
        return normalize_decimal(&c[1]).map(Commission::Percent);
    }
    parse_price(text).map(Commission::Amount)
}

/// Parse the temperature/popularity figure ("150°" → 150.0).
pub fn parse_temperature(text: &str) -> Option<f64> {
    temperature_re()
        .captures(text)
        .and_then(|c| normalize_decimal(&c[1]))
}

/// Parse a `rating (count)` pair ("4.8 (234)" → (4.8, 234)).
pub fn parse_rating(text: &str) -> Option<(f64, u32)> {
    let caps = rating_re().captures(text)?;
    let rating = normalize_decimal(&caps[1])?;
    let count = caps[2].parse().ok()?;
    Some((rating, count))
}

// ───────────────────────────────────────────────────────────────────────────
// Card detection & parsing
// ───────────────────────────────────────────────────────────────────────────

fn has_commission_keyword(text: &str) -> bool {
    let lower = text.to_lowercase();
    COMMISSION_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Candidate-card predicate: visible text carries a temperature glyph AND a
/// commission keyword AND exceeds the minimum length.
pub fn looks_like_product_card(text: &str) -> bool {
    text.len() >= MIN_CARD_TEXT_LEN && text.contains('°') && has_commission_keyword(text)
}

/// First text line that is not a price/rating/temperature token and falls in
/// a plausible name length range.
fn pick_name(text: &str) -> Option<String> {
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !(4..=120).contains(&line.chars().count()) {
            continue;
        }
        if temperature_re().is_match(line)
            || rating_re().is_match(line)
            || currency_re().is_match(line)
            || percent_re().is_match(line)
            || has_commission_keyword(line)
        {
            continue;
        }
        // Pure numeric/punctuation lines are layout debris.
        if !line.chars().any(|c| c.is_alphabetic()) {
            continue;
        }
        return Some(line.to_string());
    }
    None
}

/// Parse one candidate card's visible text into a structured record.
///
/// Returns `None` only when no plausible product name can be recovered;
/// every numeric field is independently best-effort.
pub fn parse_product_card(text: &str, href: Option<&str>) -> Option<ProductCard> {
    let name = pick_name(text)?;

    let (mut commission, mut commission_percent) = (None, None);
    // Commission is parsed from the line carrying the keyword so a nearby
    // "max price" amount is never mistaken for it.
    let commission_line = text.lines().find(|l| has_commission_keyword(l));
    if let Some(line) = commission_line {
        match parse_commission(line) {
            Some(Commission::Percent(p)) => commission_percent = Some(p),
            Some(Commission::Amount(a)) => commission = Some(a),
            None => {}
        }
    }

    // Max price: largest currency amount outside the commission line.
    let max_price = text
        .lines()
        .filter(|l| Some(*l) != commission_line)
        .filter_map(parse_price)
        .fold(None, |acc: Option<f64>, v| {
            Some(acc.map_or(v, |a| a.max(v)))
        });

    let (rating, review_count) = match parse_rating(text) {
        Some((r, c)) => (Some(r), Some(c)),
        None => (None, None),
    };

    Some(ProductCard {
        name,
        temperature: parse_temperature(text),
        rating,
        review_count,
        commission,
        commission_percent,
        max_price,
        image_url: None,
        url: href.map(|h| h.to_string()),
    })
}

// ───────────────────────────────────────────────────────────────────────────
// Niche derivation
// ───────────────────────────────────────────────────────────────────────────

const NICHE_STOP_WORDS: &[&str] = &[
    "find",
    "search",
    "research",
    "products",
    "in",
    "the",
    "for",
    "niche",
    "marketplace",
    "top",
    "best",
];

/// Derive a search niche from a free-text mission prompt by stop-word
/// filtering. Falls back to "general" when nothing survives.
pub fn derive_niche(prompt: &str) -> String {
    let niche = prompt
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2 && !NICHE_STOP_WORDS.contains(w))
        .collect::<Vec<_>>()
        .join(" ");

    if niche.is_empty() {
        "general".to_string()
    } else {
        niche
    }
}
