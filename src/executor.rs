//! Mission executor: drives one mission end-to-end.
//!
//! Status machine on the mission record:
//! `pending → running → completed | failed | cancelled`. Cancellation is
//! cooperative: the token is observed at checkpoints between expensive
//! steps, never pre-emptively. The browser is always closed and a final
//! status write is always attempted, even when the triggering error is
//! unknown; the queue layer only needs to know retry-or-not.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::ai::{self, AiClient};
use crate::automation::parse::derive_niche;
use crate::automation::MarketplaceAutomation;
use crate::core::config::AppConfig;
use crate::core::types::{
    AuditLogEntry, DiscoveredProduct, Mission, MissionResults, MissionStatus, ProductCard,
};
use crate::error::MissionError;
use crate::platforms::PlatformRegistry;
use crate::store::MissionStore;

pub struct MissionExecutor {
    store: Arc<dyn MissionStore>,
    ai: Arc<dyn AiClient>,
    registry: Arc<PlatformRegistry>,
    config: AppConfig,
}

fn checkpoint(cancel: &CancellationToken) -> Result<(), MissionError> {
    if cancel.is_cancelled() {
        Err(MissionError::Cancelled)
    } else {
        Ok(())
    }
}

impl MissionExecutor {
    pub fn new(
        store: Arc<dyn MissionStore>,
        ai: Arc<dyn AiClient>,
        registry: Arc<PlatformRegistry>,
        config: AppConfig,
    ) -> Self {
        Self {
            store,
            ai,
            registry,
            config,
        }
    }

    /// Audit failures are swallowed; the trail is evidence, not a dependency.
    async fn audit(&self, entry: AuditLogEntry) {
        if let Err(e) = self.store.append_audit(&entry).await {
            warn!("audit: write failed for '{}' (ignored): {}", entry.action, e);
        }
    }

    pub async fn execute(
        &self,
        mission_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<MissionResults, MissionError> {
        let started = Instant::now();

        let mission = self
            .store
            .mission(mission_id)
            .await
            .map_err(MissionError::Store)?
            .ok_or_else(|| MissionError::config(format!("unknown mission {}", mission_id)))?;

        checkpoint(cancel)?;

        self.store
            .mark_running(mission_id)
            .await
            .map_err(MissionError::Store)?;
        self.audit(AuditLogEntry::info(
            mission_id,
            "mission_started",
            serde_json::json!({ "platform": mission.platform, "prompt": mission.prompt }),
        ))
        .await;
        info!(
            "mission {}: ▶️  starting on {} ({:?})",
            mission_id, mission.platform, mission.prompt
        );

        // Both resolution steps are fatal config errors: retrying cannot fix
        // an unknown platform or absent credentials, and no browser has been
        // launched yet.
        let entry = self.registry.resolve(&mission.platform).ok_or_else(|| {
            MissionError::config(format!("Unsupported platform: {}", mission.platform))
        });
        let outcome = match entry {
            Ok(entry) => {
                let creds = self
                    .store
                    .credentials(mission.parameters.user_id, &mission.platform)
                    .await
                    .map_err(MissionError::Store)
                    .and_then(|c| {
                        c.ok_or_else(|| {
                            MissionError::config(format!(
                                "Missing credentials for platform '{}'",
                                mission.platform
                            ))
                        })
                    });
                match creds {
                    Ok(creds) => {
                        let mut engine = entry.factory.create(
                            entry.config.clone(),
                            self.config.browser.clone(),
                            self.config.verification.clone(),
                        );
                        let result = self
                            .run_pipeline(&mission, engine.as_mut(), &creds.email, &creds.password, cancel)
                            .await;
                        // Always release the browser, even on failure.
                        engine.close().await;
                        result
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };

        let outcome = outcome.map(|(products_found, products_saved)| MissionResults {
            products_found,
            products_saved,
            duration_secs: started.elapsed().as_secs(),
        });

        self.write_final_status(mission_id, &outcome).await;
        outcome
    }

    async fn run_pipeline(
        &self,
        mission: &Mission,
        engine: &mut dyn MarketplaceAutomation,
        email: &str,
        password: &str,
        cancel: &CancellationToken,
    ) -> Result<(usize, usize), MissionError> {
        engine.init().await?;
        checkpoint(cancel)?;

        engine.login(email, password).await?;
        self.audit(AuditLogEntry::info(
            mission.id,
            "login_succeeded",
            serde_json::json!({ "platform": mission.platform }),
        ))
        .await;
        checkpoint(cancel)?;

        let niche = derive_niche(&mission.prompt);
        self.audit(AuditLogEntry::info(
            mission.id,
            "niche_derived",
            serde_json::json!({ "niche": niche }),
        ))
        .await;

        engine
            .search(&niche, mission.parameters.language.as_deref())
            .await?;
        checkpoint(cancel)?;

        let mut products = engine.extract(mission.parameters.max_products).await?;
        self.audit(AuditLogEntry::info(
            mission.id,
            "products_extracted",
            serde_json::json!({ "count": products.len() }),
        ))
        .await;
        info!("mission {}: 📦 extracted {} products", mission.id, products.len());

        if mission.parameters.get_details {
            self.enrich_with_details(mission.id, engine, &mut products, cancel)
                .await?;
        }
        checkpoint(cancel)?;

        let scores = ai::score_products(self.ai.as_ref(), &self.config.ai, &niche, &products).await;
        self.audit(AuditLogEntry::info(
            mission.id,
            "products_scored",
            serde_json::json!({ "count": scores.len() }),
        ))
        .await;

        // Each insert is isolated: one bad row must not abort the batch.
        let mut saved = 0usize;
        for (card, score) in products.iter().zip(scores.iter()) {
            let row = DiscoveredProduct {
                mission_id: mission.id,
                name: card.name.clone(),
                price: card.max_price,
                commission: card.commission_percent.or(card.commission),
                category: None,
                niche: niche.clone(),
                ai_score: score.ai_score,
                strengths: score.strengths.clone(),
                weaknesses: score.weaknesses.clone(),
                recommendation: score.recommendation.clone(),
                source_platform: mission.platform.clone(),
                url: card.url.clone(),
                status: "pending".to_string(),
            };
            match self.store.insert_product(&row).await {
                Ok(()) => saved += 1,
                Err(e) => {
                    error!(
                        "mission {}: product '{}' failed to persist: {}",
                        mission.id, card.name, e
                    );
                    self.audit(AuditLogEntry::error(
                        mission.id,
                        "product_insert_failed",
                        serde_json::json!({ "name": card.name, "error": e.to_string() }),
                    ))
                    .await;
                }
            }
        }

        Ok((products.len(), saved))
    }

    async fn enrich_with_details(
        &self,
        mission_id: Uuid,
        engine: &mut dyn MarketplaceAutomation,
        products: &mut [ProductCard],
        cancel: &CancellationToken,
    ) -> Result<(), MissionError> {
        for card in products.iter_mut() {
            checkpoint(cancel)?;
            let Some(url) = card.url.clone() else {
                continue;
            };
            match engine.product_details(&url).await {
                Ok(details) => {
                    if card.max_price.is_none() {
                        card.max_price = details.price;
                    }
                    if card.commission_percent.is_none() {
                        card.commission_percent = details.commission_percent;
                    }
                }
                Err(e) => {
                    // Enrichment is best-effort per product.
                    warn!(
                        "mission {}: detail fetch failed for {} (skipped): {}",
                        mission_id, url, e
                    );
                }
            }
        }
        Ok(())
    }

    /// Final status write, tolerating a secondary failure: the mission may
    /// already be terminal from an inner handler or a racing cancel.
    async fn write_final_status(
        &self,
        mission_id: Uuid,
        outcome: &Result<MissionResults, MissionError>,
    ) {
        let (status, error, results) = match outcome {
            Ok(results) => (MissionStatus::Completed, None, Some(results)),
            Err(MissionError::Cancelled) => (MissionStatus::Cancelled, None, None),
            Err(e) => (MissionStatus::Failed, Some(e.to_string()), None),
        };

        if let Err(e) = self
            .store
            .finish_mission(mission_id, status, error.as_deref(), results)
            .await
        {
            warn!(
                "mission {}: final status write failed (ignored): {}",
                mission_id, e
            );
        }

        match outcome {
            Ok(results) => {
                self.audit(AuditLogEntry::info(
                    mission_id,
                    "mission_completed",
                    serde_json::json!({
                        "products_found": results.products_found,
                        "products_saved": results.products_saved,
                        "duration_secs": results.duration_secs,
                    }),
                ))
                .await;
                info!(
                    "mission {}: ✅ completed, {} found / {} saved in {}s",
                    mission_id, results.products_found, results.products_saved, results.duration_secs
                );
            }
            Err(MissionError::Cancelled) => {
                self.audit(AuditLogEntry::info(
                    mission_id,
                    "mission_cancelled",
                    serde_json::json!({}),
                ))
                .await;
                info!("mission {}: 🛑 cancelled at checkpoint", mission_id);
            }
            Err(e) => {
                self.audit(AuditLogEntry::error(
                    mission_id,
                    "mission_failed",
                    serde_json::json!({ "error": e.to_string(), "retryable": e.retryable() }),
                ))
                .await;
                error!("mission {}: ❌ failed: {}", mission_id, e);
            }
        }
    }
}
