use std::env;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use nichehawk::ai::OpenAiClient;
use nichehawk::config::AppConfig;
use nichehawk::jobs::JobSystem;
use nichehawk::platforms::PlatformRegistry;
use nichehawk::store::{MemoryStore, MissionStore, PgMissionStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    info!("Starting NicheHawk research worker");

    let config = AppConfig::from_env();

    let store: Arc<dyn MissionStore> = match config.database_url.as_deref() {
        Some(url) => match PgMissionStore::connect(url).await {
            Ok(store) => {
                info!("💾 mission store connected");
                Arc::new(store)
            }
            Err(err) => {
                error!("💥 mission store unavailable, using in-memory store: {err:#}");
                Arc::new(MemoryStore::new())
            }
        },
        None => {
            warn!("DATABASE_URL not set; missions and products will not persist");
            Arc::new(MemoryStore::new())
        }
    };

    let http_timeout = env::var("HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(60);
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(http_timeout))
        .build()?;
    let ai = Arc::new(OpenAiClient::new(http, config.ai.clone()));
    if config.ai.api_key.is_none() {
        warn!("OPENAI_API_KEY not set; products will receive fallback scores");
    }

    let registry = Arc::new(PlatformRegistry::with_builtin());
    info!("🛒 platforms: {}", registry.supported().join(", "));

    let job_system = Arc::new(JobSystem::connect(store, ai, registry, config.clone()).await);
    job_system.initialize();
    if job_system.is_degraded() {
        warn!("running degraded: requests are acknowledged but not scheduled");
    }

    // Periodic retention sweep for finished jobs.
    let sweeper = {
        let job_system = Arc::clone(&job_system);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(3600));
            tick.tick().await;
            loop {
                tick.tick().await;
                if let Err(err) = job_system.cleanup().await {
                    warn!("cleanup sweep failed: {err:#}");
                }
            }
        })
    };

    shutdown_signal().await;
    info!("Shutdown signal received");

    sweeper.abort();
    job_system.shutdown().await;
    info!("Goodbye 👋");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).ok();
        let mut sigint = signal(SignalKind::interrupt()).ok();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                if let Some(ref mut s) = sigterm {
                    s.recv().await;
                } else {
                    futures::future::pending::<()>().await;
                }
            } => {},
            _ = async {
                if let Some(ref mut s) = sigint {
                    s.recv().await;
                } else {
                    futures::future::pending::<()>().await;
                }
            } => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
