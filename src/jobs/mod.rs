//! Durable job orchestration.
//!
//! Four queues cooperate: `missions` runs the full research pipeline,
//! `results` post-processes what a mission saved, `notifications` delivers
//! user-facing events, `scrape` runs standalone marketplace scrapes.
//! [`JobSystem`] is the facade the rest of the application talks to.

pub mod queue;
pub mod types;
pub mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::ai::AiClient;
use crate::core::config::AppConfig;
use crate::core::types::{AuditLogEntry, Mission, NotificationPayload};
use crate::error::MissionError;
use crate::executor::MissionExecutor;
use crate::platforms::PlatformRegistry;
use crate::store::MissionStore;

use queue::{InsertOutcome, MemoryQueueBackend, PgQueueBackend, QueueBackend};
use types::{
    mission_job_id, scrape_job_id, JobRecord, JobStatusView, MissionJobPayload, QueueName,
    QueuePolicy, QueueStats, ResultJobPayload, ScrapeJobPayload,
};
use worker::{CancelRegistry, JobContext, JobHandler, Worker};

// ───────────────────────────────────────────────────────────────────────────
// Handlers
// ───────────────────────────────────────────────────────────────────────────

struct MissionHandler {
    executor: Arc<MissionExecutor>,
    backend: Arc<dyn QueueBackend>,
}

#[async_trait]
impl JobHandler for MissionHandler {
    async fn handle(
        &self,
        job: &JobRecord,
        ctx: &JobContext,
    ) -> Result<serde_json::Value, MissionError> {
        let payload: MissionJobPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| MissionError::config(format!("malformed mission payload: {e}")))?;

        ctx.report_progress(5).await;
        let results = self
            .executor
            .execute(payload.mission_id, ctx.cancel_token())
            .await?;
        ctx.report_progress(95).await;

        // Follow-up jobs are best-effort; the mission outcome is already
        // durable in the mission store.
        let result_job = JobRecord::new(
            format!("results-{}", payload.mission_id),
            QueueName::Results,
            serde_json::to_value(ResultJobPayload {
                mission_id: payload.mission_id,
                user_id: payload.parameters.user_id,
                products_found: results.products_found,
                products_saved: results.products_saved,
            })
            .unwrap_or_default(),
            0,
        );
        if let Err(e) = self.backend.insert(result_job).await {
            warn!("mission {}: result job enqueue failed: {e:#}", payload.mission_id);
        }

        let notification = NotificationPayload::mission_completed(
            payload.mission_id,
            payload.parameters.user_id,
            results.products_found,
        );
        if let Err(e) = enqueue_notification(&*self.backend, &notification).await {
            warn!("mission {}: notification enqueue failed: {e:#}", payload.mission_id);
        }

        Ok(serde_json::json!({
            "productsFound": results.products_found,
            "productsSaved": results.products_saved,
            "durationSecs": results.duration_secs,
        }))
    }

    async fn on_terminal_failure(&self, job: &JobRecord, reason: &str) {
        let Ok(payload) = serde_json::from_value::<MissionJobPayload>(job.payload.clone()) else {
            return;
        };
        let notification = NotificationPayload::mission_failed(
            payload.mission_id,
            payload.parameters.user_id,
            reason,
        );
        if let Err(e) = enqueue_notification(&*self.backend, &notification).await {
            warn!("mission {}: failure notification enqueue failed: {e:#}", payload.mission_id);
        }
    }
}

struct ScrapeHandler {
    registry: Arc<PlatformRegistry>,
    config: AppConfig,
}

#[async_trait]
impl JobHandler for ScrapeHandler {
    async fn handle(
        &self,
        job: &JobRecord,
        ctx: &JobContext,
    ) -> Result<serde_json::Value, MissionError> {
        let payload: ScrapeJobPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| MissionError::config(format!("malformed scrape payload: {e}")))?;

        let entry = self.registry.resolve(&payload.marketplace_id).ok_or_else(|| {
            MissionError::config(format!("Unsupported platform: {}", payload.marketplace_id))
        })?;

        let mut engine = entry.factory.create(
            entry.config.clone(),
            self.config.browser.clone(),
            self.config.verification.clone(),
        );

        let run = async {
            engine.init().await?;
            ctx.report_progress(25).await;
            if ctx.cancel_token().is_cancelled() {
                return Err(MissionError::Cancelled);
            }
            let query = payload.config.query.as_deref().unwrap_or_default();
            engine.search(query, None).await?;
            ctx.report_progress(50).await;
            let products = engine.extract(payload.config.max_products).await?;
            ctx.report_progress(100).await;
            Ok(serde_json::json!({
                "sessionId": payload.session_id,
                "count": products.len(),
                "products": products,
            }))
        }
        .await;

        engine.close().await;
        run
    }
}

struct ResultHandler {
    store: Arc<dyn MissionStore>,
}

#[async_trait]
impl JobHandler for ResultHandler {
    async fn handle(
        &self,
        job: &JobRecord,
        _ctx: &JobContext,
    ) -> Result<serde_json::Value, MissionError> {
        let payload: ResultJobPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| MissionError::config(format!("malformed result payload: {e}")))?;

        info!(
            "mission {}: 📊 results processed ({} found, {} saved)",
            payload.mission_id, payload.products_found, payload.products_saved
        );
        let entry = AuditLogEntry::info(
            payload.mission_id,
            "results_processed",
            serde_json::json!({
                "productsFound": payload.products_found,
                "productsSaved": payload.products_saved,
            }),
        );
        self.store
            .append_audit(&entry)
            .await
            .map_err(MissionError::Store)?;
        Ok(serde_json::json!({ "processed": true }))
    }
}

struct NotificationHandler;

#[async_trait]
impl JobHandler for NotificationHandler {
    async fn handle(
        &self,
        job: &JobRecord,
        _ctx: &JobContext,
    ) -> Result<serde_json::Value, MissionError> {
        let payload: NotificationPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| MissionError::config(format!("malformed notification payload: {e}")))?;

        // Delivery transport (websocket, email) hangs off this point; the
        // queue guarantees the event survives a restart until handed over.
        info!(
            "notify user {}: 🔔 {} for mission {}",
            payload.user_id, payload.kind, payload.mission_id
        );
        Ok(serde_json::json!({ "delivered": true }))
    }
}

async fn enqueue_notification(
    backend: &dyn QueueBackend,
    payload: &NotificationPayload,
) -> Result<()> {
    let job = JobRecord::new(
        format!("notify-{}-{}-{}", payload.kind, payload.mission_id, Uuid::new_v4()),
        QueueName::Notifications,
        serde_json::to_value(payload)?,
        0,
    );
    backend.insert(job).await?;
    Ok(())
}

// ───────────────────────────────────────────────────────────────────────────
// Facade
// ───────────────────────────────────────────────────────────────────────────

/// One instance owns the queue backend, the per-queue workers, and the
/// live-job cancellation registry.
///
/// When a database was configured but unreachable at startup the system
/// comes up *degraded*: enqueue calls are acknowledged with a synthetic
/// pending status so callers keep functioning, but nothing is scheduled.
pub struct JobSystem {
    backend: Arc<dyn QueueBackend>,
    store: Arc<dyn MissionStore>,
    ai: Arc<dyn AiClient>,
    registry: Arc<PlatformRegistry>,
    config: AppConfig,
    cancels: CancelRegistry,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    degraded: bool,
}

impl JobSystem {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        store: Arc<dyn MissionStore>,
        ai: Arc<dyn AiClient>,
        registry: Arc<PlatformRegistry>,
        config: AppConfig,
    ) -> Self {
        Self {
            backend,
            store,
            ai,
            registry,
            config,
            cancels: CancelRegistry::new(),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            degraded: false,
        }
    }

    /// Picks the durable backend when a database is configured, falling back
    /// to degraded mode if it cannot be reached; memory otherwise.
    pub async fn connect(
        store: Arc<dyn MissionStore>,
        ai: Arc<dyn AiClient>,
        registry: Arc<PlatformRegistry>,
        config: AppConfig,
    ) -> Self {
        let (backend, degraded): (Arc<dyn QueueBackend>, bool) =
            match config.database_url.as_deref() {
                Some(url) => match PgQueueBackend::connect(url).await {
                    Ok(backend) => (Arc::new(backend), false),
                    Err(err) => {
                        error!("💥 queue backend unavailable, degraded mode: {err:#}");
                        (Arc::new(MemoryQueueBackend::new()), true)
                    }
                },
                None => {
                    info!("no database configured, using in-memory queues");
                    (Arc::new(MemoryQueueBackend::new()), false)
                }
            };
        let mut system = Self::new(backend, store, ai, registry, config);
        system.degraded = degraded;
        system
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Spawns one worker per queue. Safe to call more than once; only the
    /// first call starts anything.
    pub fn initialize(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.degraded {
            warn!("⚠️ job system degraded, workers not started");
            return;
        }

        let executor = Arc::new(MissionExecutor::new(
            Arc::clone(&self.store),
            Arc::clone(&self.ai),
            Arc::clone(&self.registry),
            self.config.clone(),
        ));

        let mut workers = self.workers.lock().unwrap();
        for queue in QueueName::ALL {
            let handler: Arc<dyn JobHandler> = match queue {
                QueueName::Missions => Arc::new(MissionHandler {
                    executor: Arc::clone(&executor),
                    backend: Arc::clone(&self.backend),
                }),
                QueueName::Results => Arc::new(ResultHandler {
                    store: Arc::clone(&self.store),
                }),
                QueueName::Notifications => Arc::new(NotificationHandler),
                QueueName::Scrape => Arc::new(ScrapeHandler {
                    registry: Arc::clone(&self.registry),
                    config: self.config.clone(),
                }),
            };
            let worker = Worker::new(
                Arc::clone(&self.backend),
                handler,
                QueuePolicy::for_queue(queue),
                self.config.queue.poll_interval,
                self.cancels.clone(),
                self.shutdown.clone(),
            );
            workers.push(worker.spawn());
        }
        info!("✨ job system up ({} queues)", QueueName::ALL.len());
    }

    /// Enqueue a research mission. Idempotent per mission: while a job for
    /// this mission is live the existing one is returned; once it finishes,
    /// enqueueing again starts a fresh run.
    pub async fn enqueue_mission(&self, mission: &Mission) -> Result<JobStatusView> {
        let job_id = mission_job_id(mission.id);
        if self.degraded {
            return Ok(JobStatusView::synthetic_pending(job_id));
        }

        let payload = MissionJobPayload {
            mission_id: mission.id,
            platform: mission.platform.clone(),
            prompt: mission.prompt.clone(),
            agents: mission.agents.clone(),
            parameters: mission.parameters.clone(),
        };
        let job = JobRecord::new(job_id, QueueName::Missions, serde_json::to_value(&payload)?, 0);
        match self.backend.insert(job).await? {
            InsertOutcome::Inserted(job) => {
                info!("mission {}: 📥 queued as {}", mission.id, job.id);
                Ok(JobStatusView::from_record(&job))
            }
            InsertOutcome::Existing(job) => {
                info!("mission {}: already queued as {}", mission.id, job.id);
                Ok(JobStatusView::from_record(&job))
            }
        }
    }

    pub async fn enqueue_scrape(&self, payload: &ScrapeJobPayload) -> Result<JobStatusView> {
        let job_id = scrape_job_id(&payload.session_id);
        if self.degraded {
            return Ok(JobStatusView::synthetic_pending(job_id));
        }
        let job = JobRecord::new(job_id, QueueName::Scrape, serde_json::to_value(payload)?, 0);
        let outcome = self.backend.insert(job).await?;
        Ok(JobStatusView::from_record(outcome.record()))
    }

    pub async fn enqueue_notification(&self, payload: &NotificationPayload) -> Result<()> {
        if self.degraded {
            return Ok(());
        }
        enqueue_notification(&*self.backend, payload).await
    }

    pub async fn status(&self, job_id: &str) -> Result<Option<JobStatusView>> {
        if self.degraded {
            return Ok(Some(JobStatusView::synthetic_pending(job_id.to_string())));
        }
        Ok(self
            .backend
            .get(job_id)
            .await?
            .as_ref()
            .map(JobStatusView::from_record))
    }

    /// Cancel a job. Waiting and delayed jobs are removed outright; active
    /// jobs are flagged and their cancellation token fired so the running
    /// pipeline stops at its next checkpoint. Returns whether anything was
    /// cancelled.
    pub async fn cancel(&self, job_id: &str) -> Result<bool> {
        if self.degraded {
            return Ok(false);
        }
        if self.backend.remove_waiting(job_id).await? {
            info!("job {}: removed from queue before it ran", job_id);
            return Ok(true);
        }
        let flagged = self.backend.mark_cancel_requested(job_id).await?;
        let signalled = self.cancels.cancel(job_id);
        if flagged || signalled {
            info!("job {}: 🚫 cancellation requested", job_id);
        }
        Ok(flagged || signalled)
    }

    pub async fn stats(&self) -> Result<Vec<(QueueName, QueueStats)>> {
        let mut all = Vec::with_capacity(QueueName::ALL.len());
        for queue in QueueName::ALL {
            all.push((queue, self.backend.stats(queue).await?));
        }
        Ok(all)
    }

    /// Drop terminal jobs older than the configured retention window.
    pub async fn cleanup(&self) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.queue.retention).unwrap_or_default();
        let removed = self.backend.cleanup(cutoff).await?;
        if removed > 0 {
            info!("🧹 cleaned up {} finished job(s)", removed);
        }
        Ok(removed)
    }

    pub async fn health(&self) -> Result<()> {
        if self.degraded {
            anyhow::bail!("job system degraded: queue backend unavailable");
        }
        self.backend.health().await
    }

    /// Graceful shutdown: stop the workers (draining in-flight jobs) before
    /// letting the backend go.
    pub async fn shutdown(&self) {
        info!("🛑 job system shutting down");
        self.shutdown.cancel();
        let handles: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("job system stopped");
    }
}

// Re-exported so callers do not need to reach into submodules.
pub use types::{JobState as QueueJobState, JobStatusView as JobStatus};
