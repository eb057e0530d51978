//! AI scoring client.
//!
//! The pipeline consumes the model as an opaque `chat(prompt, opts) -> text`
//! call against any OpenAI-compatible `chat/completions` endpoint (set
//! `OPENAI_BASE_URL` to point at Ollama / LM Studio for fully local
//! inference). Scoring is an enhancement, never a hard dependency: malformed
//! or missing output degrades to a neutral default score, and the mission
//! still completes.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::warn;

use crate::core::config::AiConfig;
use crate::core::types::ProductCard;

/// Neutral score applied when AI output is missing or unparseable.
pub const DEFAULT_SCORE: f64 = 50.0;
pub const FALLBACK_RECOMMENDATION: &str = "Needs manual review";
pub const FALLBACK_RATIONALE: &str = "AI analysis unavailable";

#[derive(Debug, Clone, Copy)]
pub struct ChatOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Opaque chat contract. May fail or return malformed output; callers own
/// the fallback.
#[async_trait]
pub trait AiClient: Send + Sync {
    async fn chat(&self, prompt: &str, options: ChatOptions) -> Result<String>;
}

// ───────────────────────────────────────────────────────────────────────────
// OpenAI-compatible implementation
// ───────────────────────────────────────────────────────────────────────────

pub struct OpenAiClient {
    http: reqwest::Client,
    config: AiConfig,
}

impl OpenAiClient {
    pub fn new(http: reqwest::Client, config: AiConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl AiClient for OpenAiClient {
    async fn chat(&self, prompt: &str, options: ChatOptions) -> Result<String> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );

        let body = serde_json::json!({
            "model": self.config.model,
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
            "messages": [
                {"role": "user", "content": prompt}
            ]
        });

        let builder = self.http.post(url).json(&body);
        // Only send Authorization when a key is provided; key-less local
        // endpoints (Ollama / LM Studio) work without it.
        let builder = match self.config.api_key.as_deref() {
            Some(key) if !key.is_empty() => builder.bearer_auth(key.trim()),
            _ => builder,
        };

        let response = builder
            .send()
            .await
            .context("chat.completions request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("chat.completions failed: status={} body={}", status, text);
        }

        let value: serde_json::Value = response
            .json()
            .await
            .context("chat.completions json parse failed")?;

        value
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow::anyhow!("chat.completions returned no content"))
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Scoring prompt + response handling
// ───────────────────────────────────────────────────────────────────────────

/// Per-product assessment parsed out of the model response.
#[derive(Debug, Clone)]
pub struct ProductScore {
    pub ai_score: f64,
    pub strengths: Option<String>,
    pub weaknesses: Option<String>,
    pub recommendation: String,
}

impl ProductScore {
    pub fn fallback() -> Self {
        Self {
            ai_score: DEFAULT_SCORE,
            strengths: None,
            weaknesses: Some(FALLBACK_RATIONALE.to_string()),
            recommendation: FALLBACK_RECOMMENDATION.to_string(),
        }
    }
}

/// Build the structured scoring prompt embedding per-product summaries.
pub fn build_scoring_prompt(niche: &str, products: &[ProductCard]) -> String {
    let mut summaries = String::new();
    for (i, p) in products.iter().enumerate() {
        let commission = match (p.commission_percent, p.commission) {
            (Some(pct), _) => format!("{}%", pct),
            (None, Some(amount)) => format!("{:.2}", amount),
            _ => "unknown".to_string(),
        };
        summaries.push_str(&format!(
            "{}. {} | price: {} | commission: {} | temperature: {} | rating: {} ({} reviews)\n",
            i,
            p.name,
            p.max_price.map_or("unknown".to_string(), |v| format!("{:.2}", v)),
            commission,
            p.temperature.map_or("unknown".to_string(), |v| format!("{:.0}", v)),
            p.rating.map_or("unknown".to_string(), |v| format!("{:.1}", v)),
            p.review_count.unwrap_or(0),
        ));
    }

    format!(
        "You are an affiliate marketing analyst. Evaluate these products found for the niche \"{}\".\n\
         For each product, assess profitability potential, audience demand, and competition.\n\n\
         Products:\n{}\n\
         Respond with STRICT JSON only, no prose, in exactly this shape:\n\
         {{\"products\":[{{\"index\":0,\"aiScore\":75,\"strengths\":\"...\",\"weaknesses\":\"...\",\"recommendation\":\"...\"}}]}}\n\
         aiScore is 0-100. Include one entry per product, keyed by its index above.",
        niche, summaries
    )
}

/// Parse the model's JSON response into index → score.
///
/// Tolerates a markdown code fence around the JSON. Returns `None` when the
/// payload is missing or structurally unusable; partial entries are kept.
pub fn parse_scoring_response(raw: &str) -> Option<HashMap<usize, ProductScore>> {
    let trimmed = raw.trim();
    let json_str = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.trim_end_matches("```").trim())
        .unwrap_or(trimmed);

    let value: serde_json::Value = serde_json::from_str(json_str).ok()?;
    let entries = value.get("products")?.as_array()?;

    let mut scores = HashMap::new();
    for entry in entries {
        let Some(index) = entry.get("index").and_then(|v| v.as_u64()) else {
            continue;
        };
        let ai_score = entry
            .get("aiScore")
            .and_then(|v| v.as_f64())
            .unwrap_or(DEFAULT_SCORE)
            .clamp(0.0, 100.0);
        let text_field = |key: &str| {
            entry
                .get(key)
                .and_then(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        scores.insert(
            index as usize,
            ProductScore {
                ai_score,
                strengths: text_field("strengths"),
                weaknesses: text_field("weaknesses"),
                recommendation: text_field("recommendation")
                    .unwrap_or_else(|| FALLBACK_RECOMMENDATION.to_string()),
            },
        );
    }

    if scores.is_empty() {
        None
    } else {
        Some(scores)
    }
}

/// Score every product, degrading to the neutral fallback on any AI failure.
pub async fn score_products(
    ai: &dyn AiClient,
    config: &AiConfig,
    niche: &str,
    products: &[ProductCard],
) -> Vec<ProductScore> {
    if products.is_empty() {
        return Vec::new();
    }

    let prompt = build_scoring_prompt(niche, products);
    let options = ChatOptions {
        temperature: config.temperature,
        max_tokens: config.max_tokens,
    };

    let scores = match ai.chat(&prompt, options).await {
        Ok(raw) => match parse_scoring_response(&raw) {
            Some(s) => s,
            None => {
                warn!("scoring: 🤖 response unparseable, applying default score to all products");
                HashMap::new()
            }
        },
        Err(e) => {
            warn!("scoring: 🤖 chat call failed ({}), applying default score", e);
            HashMap::new()
        }
    };

    (0..products.len())
        .map(|i| scores.get(&i).cloned().unwrap_or_else(ProductScore::fallback))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(name: &str) -> ProductCard {
        ProductCard {
            name: name.to_string(),
            temperature: Some(120.0),
            commission_percent: Some(50.0),
            max_price: Some(197.0),
            ..Default::default()
        }
    }

    #[test]
    fn prompt_embeds_every_product_by_index() {
        let products = vec![card("Yoga Course"), card("Pilates Guide")];
        let prompt = build_scoring_prompt("yoga", &products);
        assert!(prompt.contains("0. Yoga Course"));
        assert!(prompt.contains("1. Pilates Guide"));
        assert!(prompt.contains("\"yoga\""));
        assert!(prompt.contains("aiScore"));
    }

    #[test]
    fn parses_well_formed_response() {
        let raw = r#"{"products":[{"index":0,"aiScore":82,"strengths":"hot niche","weaknesses":"crowded","recommendation":"promote"}]}"#;
        let scores = parse_scoring_response(raw).unwrap();
        let s = &scores[&0];
        assert_eq!(s.ai_score, 82.0);
        assert_eq!(s.recommendation, "promote");
        assert_eq!(s.strengths.as_deref(), Some("hot niche"));
    }

    #[test]
    fn parses_fenced_response() {
        let raw = "```json\n{\"products\":[{\"index\":1,\"aiScore\":40}]}\n```";
        let scores = parse_scoring_response(raw).unwrap();
        assert_eq!(scores[&1].ai_score, 40.0);
        // Missing recommendation falls back to a non-empty placeholder.
        assert_eq!(scores[&1].recommendation, FALLBACK_RECOMMENDATION);
    }

    #[test]
    fn malformed_response_returns_none() {
        assert!(parse_scoring_response("I think these are great products!").is_none());
        assert!(parse_scoring_response("{}").is_none());
        assert!(parse_scoring_response(r#"{"products":[]}"#).is_none());
    }

    #[test]
    fn scores_are_clamped() {
        let raw = r#"{"products":[{"index":0,"aiScore":250}]}"#;
        assert_eq!(parse_scoring_response(raw).unwrap()[&0].ai_score, 100.0);
    }

    #[test]
    fn fallback_has_non_empty_recommendation() {
        let f = ProductScore::fallback();
        assert_eq!(f.ai_score, DEFAULT_SCORE);
        assert!(!f.recommendation.is_empty());
    }

    struct EchoClient(String);

    #[async_trait]
    impl AiClient for EchoClient {
        async fn chat(&self, _prompt: &str, _options: ChatOptions) -> anyhow::Result<String> {
            Ok(self.0.clone())
        }
    }

    struct FailingClient;

    #[async_trait]
    impl AiClient for FailingClient {
        async fn chat(&self, _prompt: &str, _options: ChatOptions) -> anyhow::Result<String> {
            anyhow::bail!("model offline")
        }
    }

    #[tokio::test]
    async fn score_products_falls_back_per_product() {
        let products = vec![card("A"), card("B")];
        let ai = EchoClient(r#"{"products":[{"index":0,"aiScore":90,"recommendation":"go"}]}"#.into());
        let scores = score_products(&ai, &AiConfig::default(), "niche", &products).await;
        assert_eq!(scores.len(), 2);
        assert_eq!(scores[0].ai_score, 90.0);
        // Index 1 missing from the response → neutral fallback.
        assert_eq!(scores[1].ai_score, DEFAULT_SCORE);
        assert_eq!(scores[1].recommendation, FALLBACK_RECOMMENDATION);
    }

    #[tokio::test]
    async fn ai_failure_still_scores_everything() {
        let products = vec![card("A"), card("B"), card("C")];
        let scores = score_products(&FailingClient, &AiConfig::default(), "niche", &products).await;
        assert_eq!(scores.len(), 3);
        assert!(scores.iter().all(|s| s.ai_score == DEFAULT_SCORE));
        assert!(scores.iter().all(|s| !s.recommendation.is_empty()));
    }
}
