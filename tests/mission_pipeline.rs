//! End-to-end pipeline runs against an in-memory store and a scripted
//! marketplace engine, so the full login/search/extract/score/persist flow
//! is exercised without a browser or a database.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use nichehawk::ai::{AiClient, ChatOptions, DEFAULT_SCORE, FALLBACK_RECOMMENDATION};
use nichehawk::automation::{EngineState, MarketplaceAutomation};
use nichehawk::config::AppConfig;
use nichehawk::error::MissionError;
use nichehawk::executor::MissionExecutor;
use nichehawk::platforms::{AutomationFactory, PlatformConfig, PlatformRegistry};
use nichehawk::store::{MemoryStore, MissionStore};
use nichehawk::{
    Mission, MissionParameters, MissionStatus, PlatformCredentials, ProductCard, ProductDetails,
};

// ───────────────────────────────────────────────────────────────────────────
// Scripted engine
// ───────────────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
struct Script {
    products: Vec<ProductCard>,
    fail_login: bool,
    browser_launched: Arc<AtomicBool>,
    detail_calls: Arc<AtomicUsize>,
}

struct ScriptedEngine {
    script: Script,
    state: EngineState,
}

#[async_trait]
impl MarketplaceAutomation for ScriptedEngine {
    async fn init(&mut self) -> Result<(), MissionError> {
        self.script.browser_launched.store(true, Ordering::SeqCst);
        self.state = EngineState::Initialized;
        Ok(())
    }

    async fn login(&mut self, _email: &str, _password: &str) -> Result<(), MissionError> {
        if self.script.fail_login {
            self.state = EngineState::LoginFailed;
            return Err(MissionError::automation(anyhow::anyhow!(
                "login form rejected credentials"
            )));
        }
        self.state = EngineState::LoggedIn;
        Ok(())
    }

    async fn search(&mut self, _niche: &str, _language: Option<&str>) -> Result<(), MissionError> {
        self.state = EngineState::Searching;
        Ok(())
    }

    async fn extract(&mut self, max_products: usize) -> Result<Vec<ProductCard>, MissionError> {
        self.state = EngineState::Extracting;
        let mut products = self.script.products.clone();
        products.truncate(max_products);
        Ok(products)
    }

    async fn product_details(&mut self, _url: &str) -> Result<ProductDetails, MissionError> {
        self.script.detail_calls.fetch_add(1, Ordering::SeqCst);
        Ok(ProductDetails {
            price: Some(149.0),
            ..Default::default()
        })
    }

    async fn close(&mut self) {
        self.state = EngineState::Closed;
    }

    fn state(&self) -> EngineState {
        self.state
    }
}

struct ScriptedFactory {
    script: Script,
}

impl AutomationFactory for ScriptedFactory {
    fn create(
        &self,
        _platform: PlatformConfig,
        _browser: nichehawk::config::BrowserConfig,
        _verification: nichehawk::config::VerificationConfig,
    ) -> Box<dyn MarketplaceAutomation> {
        Box::new(ScriptedEngine {
            script: self.script.clone(),
            state: EngineState::Uninitialized,
        })
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Fakes & fixtures
// ───────────────────────────────────────────────────────────────────────────

/// Returns whatever JSON body it was constructed with.
struct CannedAi(String);

#[async_trait]
impl AiClient for CannedAi {
    async fn chat(&self, _prompt: &str, _options: ChatOptions) -> anyhow::Result<String> {
        Ok(self.0.clone())
    }
}

struct UnavailableAi;

#[async_trait]
impl AiClient for UnavailableAi {
    async fn chat(&self, _prompt: &str, _options: ChatOptions) -> anyhow::Result<String> {
        anyhow::bail!("model endpoint unreachable")
    }
}

fn card(name: &str, url: &str) -> ProductCard {
    ProductCard {
        name: name.to_string(),
        commission_percent: Some(40.0),
        max_price: Some(97.0),
        url: Some(url.to_string()),
        ..Default::default()
    }
}

fn five_cards() -> Vec<ProductCard> {
    (1..=5)
        .map(|i| card(&format!("Product {i}"), &format!("https://x.test/product/{i}")))
        .collect()
}

fn mission(platform: &str, user_id: Uuid) -> Mission {
    Mission {
        id: Uuid::new_v4(),
        platform: platform.to_string(),
        prompt: "find yoga products in the marketplace".to_string(),
        agents: vec![],
        parameters: MissionParameters {
            user_id,
            ..Default::default()
        },
        status: MissionStatus::Pending,
        queued_at: Utc::now(),
        started_at: None,
        completed_at: None,
        error_message: None,
        results: None,
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    executor: MissionExecutor,
    script: Script,
}

fn harness(script: Script, ai: Arc<dyn AiClient>) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let mut registry = PlatformRegistry::new();
    registry.register(
        PlatformConfig::hotmart(),
        Arc::new(ScriptedFactory {
            script: script.clone(),
        }),
    );
    let mission_store: Arc<dyn MissionStore> = store.clone();
    let executor = MissionExecutor::new(mission_store, ai, Arc::new(registry), AppConfig::default());
    Harness {
        store,
        executor,
        script,
    }
}

fn seed(h: &Harness, m: &Mission) {
    h.store.put_mission(m.clone());
    h.store.put_credentials(
        m.parameters.user_id,
        &m.platform,
        PlatformCredentials {
            email: "affiliate@example.com".to_string(),
            password: "hunter2".to_string(),
        },
    );
}

fn good_scores_json(count: usize) -> String {
    let products: Vec<_> = (0..count)
        .map(|i| {
            serde_json::json!({
                "index": i,
                "aiScore": 80,
                "strengths": ["high commission"],
                "weaknesses": ["crowded niche"],
                "recommendation": "Promote",
            })
        })
        .collect();
    serde_json::json!({ "products": products }).to_string()
}

// ───────────────────────────────────────────────────────────────────────────
// Scenarios
// ───────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn happy_path_completes_and_persists() {
    let user = Uuid::new_v4();
    let h = harness(
        Script {
            products: five_cards(),
            ..Default::default()
        },
        Arc::new(CannedAi(good_scores_json(5))),
    );
    let m = mission("hotmart", user);
    seed(&h, &m);

    let results = h
        .executor
        .execute(m.id, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(results.products_found, 5);
    assert_eq!(results.products_saved, 5);

    let final_mission = h.store.mission_snapshot(m.id).unwrap();
    assert_eq!(final_mission.status, MissionStatus::Completed);
    assert!(final_mission.error_message.is_none());

    let products = h.store.products();
    assert_eq!(products.len(), 5);
    assert!(products.iter().all(|p| p.ai_score == 80.0));
    assert!(products.iter().all(|p| p.status == "pending"));
    // Niche derivation strips the prompt's filler words.
    assert!(products.iter().all(|p| p.niche == "yoga"));

    let actions: Vec<String> = h
        .store
        .audit_entries()
        .into_iter()
        .map(|e| e.action)
        .collect();
    for expected in [
        "mission_started",
        "login_succeeded",
        "products_extracted",
        "products_scored",
        "mission_completed",
    ] {
        assert!(actions.iter().any(|a| a == expected), "missing {expected}");
    }
}

#[tokio::test]
async fn unsupported_platform_fails_without_launching_browser() {
    let user = Uuid::new_v4();
    let h = harness(
        Script {
            products: five_cards(),
            ..Default::default()
        },
        Arc::new(UnavailableAi),
    );
    let m = mission("clickbank", user);
    seed(&h, &m);

    let err = h
        .executor
        .execute(m.id, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err.to_string().contains("Unsupported platform: clickbank"));
    assert!(!err.retryable());
    assert!(!h.script.browser_launched.load(Ordering::SeqCst));

    let final_mission = h.store.mission_snapshot(m.id).unwrap();
    assert_eq!(final_mission.status, MissionStatus::Failed);
    assert!(final_mission
        .error_message
        .unwrap()
        .contains("Unsupported platform"));
}

#[tokio::test]
async fn missing_credentials_fail_without_launching_browser() {
    let user = Uuid::new_v4();
    let h = harness(
        Script::default(),
        Arc::new(UnavailableAi),
    );
    let m = mission("hotmart", user);
    h.store.put_mission(m.clone()); // no credentials seeded

    let err = h
        .executor
        .execute(m.id, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err.to_string().contains("Missing credentials"));
    assert!(!h.script.browser_launched.load(Ordering::SeqCst));
}

#[tokio::test]
async fn one_bad_row_does_not_abort_the_batch() {
    let user = Uuid::new_v4();
    let h = harness(
        Script {
            products: five_cards(),
            ..Default::default()
        },
        Arc::new(CannedAi(good_scores_json(5))),
    );
    let m = mission("hotmart", user);
    seed(&h, &m);
    h.store.fail_product("Product 3");

    let results = h
        .executor
        .execute(m.id, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(results.products_found, 5);
    assert_eq!(results.products_saved, 4);
    assert_eq!(h.store.products().len(), 4);
    assert_eq!(
        h.store.mission_snapshot(m.id).unwrap().status,
        MissionStatus::Completed
    );
    assert!(h
        .store
        .audit_entries()
        .iter()
        .any(|e| e.action == "product_insert_failed"));
}

#[tokio::test]
async fn unavailable_ai_falls_back_to_default_scores() {
    let user = Uuid::new_v4();
    let h = harness(
        Script {
            products: five_cards(),
            ..Default::default()
        },
        Arc::new(UnavailableAi),
    );
    let m = mission("hotmart", user);
    seed(&h, &m);

    let results = h
        .executor
        .execute(m.id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(results.products_saved, 5);

    let products = h.store.products();
    assert!(products.iter().all(|p| p.ai_score == DEFAULT_SCORE));
    assert!(products
        .iter()
        .all(|p| p.recommendation == FALLBACK_RECOMMENDATION));
}

#[tokio::test]
async fn malformed_ai_response_falls_back_to_default_scores() {
    let user = Uuid::new_v4();
    let h = harness(
        Script {
            products: five_cards(),
            ..Default::default()
        },
        Arc::new(CannedAi("the model rambled instead of emitting JSON".into())),
    );
    let m = mission("hotmart", user);
    seed(&h, &m);

    h.executor
        .execute(m.id, &CancellationToken::new())
        .await
        .unwrap();

    let products = h.store.products();
    assert_eq!(products.len(), 5);
    assert!(products.iter().all(|p| p.ai_score == DEFAULT_SCORE));
}

#[tokio::test]
async fn cancellation_lands_in_cancelled_not_completed() {
    let user = Uuid::new_v4();
    let h = harness(
        Script {
            products: five_cards(),
            ..Default::default()
        },
        Arc::new(UnavailableAi),
    );
    let m = mission("hotmart", user);
    seed(&h, &m);

    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = h.executor.execute(m.id, &cancel).await.unwrap_err();
    assert!(matches!(err, MissionError::Cancelled));
    assert_eq!(
        h.store.mission_snapshot(m.id).unwrap().status,
        MissionStatus::Cancelled
    );
}

#[tokio::test]
async fn login_failure_marks_mission_failed() {
    let user = Uuid::new_v4();
    let h = harness(
        Script {
            fail_login: true,
            ..Default::default()
        },
        Arc::new(UnavailableAi),
    );
    let m = mission("hotmart", user);
    seed(&h, &m);

    let err = h
        .executor
        .execute(m.id, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.retryable());

    let final_mission = h.store.mission_snapshot(m.id).unwrap();
    assert_eq!(final_mission.status, MissionStatus::Failed);
    assert!(final_mission
        .error_message
        .unwrap()
        .contains("login form rejected credentials"));
    assert!(h.store.products().is_empty());
}

#[tokio::test]
async fn detail_enrichment_runs_per_product_when_requested() {
    let user = Uuid::new_v4();
    let h = harness(
        Script {
            products: five_cards(),
            ..Default::default()
        },
        Arc::new(CannedAi(good_scores_json(5))),
    );
    let mut m = mission("hotmart", user);
    m.parameters.get_details = true;
    seed(&h, &m);

    h.executor
        .execute(m.id, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(h.script.detail_calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn max_products_caps_extraction() {
    let user = Uuid::new_v4();
    let h = harness(
        Script {
            products: five_cards(),
            ..Default::default()
        },
        Arc::new(CannedAi(good_scores_json(2))),
    );
    let mut m = mission("hotmart", user);
    m.parameters.max_products = 2;
    seed(&h, &m);

    let results = h
        .executor
        .execute(m.id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(results.products_found, 2);
    assert_eq!(results.products_saved, 2);
}
