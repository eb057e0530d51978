//! Queue workers.
//!
//! Each queue gets one [`Worker`] task that polls the backend, claims due
//! jobs up to the queue's concurrency limit, and drives a [`JobHandler`].
//! Retry, terminal failure, stalled-job sweeps, and the scrape rate limit
//! all live here so handlers stay pure business logic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::MissionError;

use super::queue::QueueBackend;
use super::types::{JobRecord, QueuePolicy, RateLimit};

/// Per-job context handed to handlers.
pub struct JobContext {
    backend: Arc<dyn QueueBackend>,
    job_id: String,
    cancel: CancellationToken,
}

impl JobContext {
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Best-effort progress update; storage hiccups never fail the job.
    pub async fn report_progress(&self, progress: u8) {
        if let Err(err) = self.backend.set_progress(&self.job_id, progress).await {
            warn!("job {}: progress update failed: {err:#}", self.job_id);
        }
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(
        &self,
        job: &JobRecord,
        ctx: &JobContext,
    ) -> Result<serde_json::Value, MissionError>;

    /// Called once when a job exhausts its attempts (or fails
    /// non-retryably). Follow-up work like failure notifications goes here.
    async fn on_terminal_failure(&self, _job: &JobRecord, _reason: &str) {}
}

/// Sliding-window rate limiter shared by a worker's claim loop.
struct RateWindow {
    limit: RateLimit,
    starts: Mutex<Vec<Instant>>,
}

impl RateWindow {
    fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            starts: Mutex::new(Vec::new()),
        }
    }

    /// Records a slot if the window has room.
    fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut starts = self.starts.lock().unwrap();
        starts.retain(|s| now.duration_since(*s) < self.limit.per);
        if starts.len() < self.limit.max {
            starts.push(now);
            true
        } else {
            false
        }
    }
}

/// Registry mapping live job ids to their cancellation tokens, shared with
/// the facade so `cancel` can reach a running handler.
#[derive(Default, Clone)]
pub struct CancelRegistry {
    tokens: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, job_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens
            .lock()
            .unwrap()
            .insert(job_id.to_string(), token.clone());
        token
    }

    fn unregister(&self, job_id: &str) {
        self.tokens.lock().unwrap().remove(job_id);
    }

    pub fn cancel(&self, job_id: &str) -> bool {
        match self.tokens.lock().unwrap().get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

pub struct Worker {
    backend: Arc<dyn QueueBackend>,
    handler: Arc<dyn JobHandler>,
    policy: QueuePolicy,
    poll_interval: Duration,
    cancels: CancelRegistry,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        handler: Arc<dyn JobHandler>,
        policy: QueuePolicy,
        poll_interval: Duration,
        cancels: CancelRegistry,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            backend,
            handler,
            policy,
            poll_interval,
            cancels,
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let queue = self.policy.queue;
        info!(
            "queue {}: 🚀 worker up (concurrency {})",
            queue.as_str(),
            self.policy.concurrency
        );

        let slots = Arc::new(Semaphore::new(self.policy.concurrency));
        let rate = self.policy.rate_limit.map(RateWindow::new).map(Arc::new);
        let mut last_sweep = Instant::now();
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            handles.retain(|h| !h.is_finished());

            if last_sweep.elapsed() >= self.policy.stalled_check_interval {
                last_sweep = Instant::now();
                match self.backend.requeue_stalled(queue).await {
                    Ok(0) => {}
                    Ok(n) => info!("queue {}: re-queued {n} stalled job(s)", queue.as_str()),
                    Err(err) => warn!("queue {}: stalled sweep failed: {err:#}", queue.as_str()),
                }
            }

            // Claim while slots (and rate budget) allow.
            loop {
                let Ok(permit) = Arc::clone(&slots).try_acquire_owned() else {
                    break;
                };
                if let Some(rate) = &rate {
                    if !rate.try_acquire() {
                        break;
                    }
                }
                let job = match self.backend.claim(queue, self.policy.lock_duration).await {
                    Ok(Some(job)) => job,
                    Ok(None) => break,
                    Err(err) => {
                        warn!("queue {}: claim failed: {err:#}", queue.as_str());
                        break;
                    }
                };

                let backend = Arc::clone(&self.backend);
                let handler = Arc::clone(&self.handler);
                let policy = self.policy.clone();
                let cancels = self.cancels.clone();
                handles.push(tokio::spawn(async move {
                    let _permit = permit;
                    process_job(backend, handler, policy, cancels, job).await;
                }));
            }
        }

        info!("queue {}: 🛑 worker draining", queue.as_str());
        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn process_job(
    backend: Arc<dyn QueueBackend>,
    handler: Arc<dyn JobHandler>,
    policy: QueuePolicy,
    cancels: CancelRegistry,
    job: JobRecord,
) {
    let queue = policy.queue;
    info!(
        "queue {}: ▶️ {} (attempt {}/{})",
        queue.as_str(),
        job.id,
        job.attempts_made,
        job.max_attempts
    );

    let token = cancels.register(&job.id);
    // Cancellation requested while the job sat in the queue, or persisted
    // by another process; honor it before any work starts.
    if job.cancel_requested {
        token.cancel();
    }

    let ctx = JobContext {
        backend: Arc::clone(&backend),
        job_id: job.id.clone(),
        cancel: token,
    };

    // The lock is renewed on a tick while the handler runs, otherwise a
    // healthy job outliving its lock gets swept as stalled and handed to a
    // second worker mid-flight.
    let renew_every = std::cmp::max(policy.lock_duration / 3, Duration::from_millis(10));
    let work = handler.handle(&job, &ctx);
    tokio::pin!(work);
    let outcome = loop {
        tokio::select! {
            outcome = &mut work => break outcome,
            _ = tokio::time::sleep(renew_every) => {
                match backend.extend_lock(&job.id, policy.lock_duration).await {
                    Ok(true) => {}
                    Ok(false) => warn!(
                        "queue {}: {} no longer active, lock not renewed",
                        queue.as_str(),
                        job.id
                    ),
                    Err(err) => warn!(
                        "queue {}: lock renewal for {} failed: {err:#}",
                        queue.as_str(),
                        job.id
                    ),
                }
            }
        }
    };
    cancels.unregister(&job.id);

    match outcome {
        Ok(result) => {
            if let Err(err) = backend.complete(&job.id, result).await {
                error!("queue {}: completing {} failed: {err:#}", queue.as_str(), job.id);
            }
            info!("queue {}: ✅ {} done", queue.as_str(), job.id);
        }
        Err(MissionError::Cancelled) => {
            // Cancelled jobs never retry.
            if let Err(err) = backend.fail(&job.id, "cancelled").await {
                error!("queue {}: failing {} failed: {err:#}", queue.as_str(), job.id);
            }
            info!("queue {}: 🚫 {} cancelled", queue.as_str(), job.id);
        }
        Err(err) => {
            let reason = err.to_string();
            if err.retryable() && job.attempts_made < job.max_attempts {
                let delay = policy.backoff_delay(job.attempts_made);
                let run_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
                warn!(
                    "queue {}: 🔁 {} failed (attempt {}/{}), retrying in {:?}: {reason}",
                    queue.as_str(),
                    job.id,
                    job.attempts_made,
                    job.max_attempts,
                    delay
                );
                if let Err(err) = backend.retry(&job.id, run_at, &reason).await {
                    error!("queue {}: retrying {} failed: {err:#}", queue.as_str(), job.id);
                }
            } else {
                error!(
                    "queue {}: ❌ {} failed terminally after {} attempt(s): {reason}",
                    queue.as_str(),
                    job.id,
                    job.attempts_made
                );
                if let Err(err) = backend.fail(&job.id, &reason).await {
                    error!("queue {}: failing {} failed: {err:#}", queue.as_str(), job.id);
                }
                handler.on_terminal_failure(&job, &reason).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::queue::{MemoryQueueBackend, QueueBackend};
    use crate::jobs::types::{JobState, QueueName};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(
            &self,
            _job: &JobRecord,
            _ctx: &JobContext,
        ) -> Result<serde_json::Value, MissionError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(MissionError::automation(anyhow::anyhow!("flaky")))
            } else {
                Ok(serde_json::json!({ "ok": true }))
            }
        }
    }

    struct CancelAware;

    #[async_trait]
    impl JobHandler for CancelAware {
        async fn handle(
            &self,
            _job: &JobRecord,
            ctx: &JobContext,
        ) -> Result<serde_json::Value, MissionError> {
            if ctx.cancel_token().is_cancelled() {
                return Err(MissionError::Cancelled);
            }
            Ok(serde_json::json!({}))
        }
    }

    fn test_policy() -> QueuePolicy {
        let mut policy = QueuePolicy::missions();
        policy.backoff_base = Duration::from_millis(1);
        policy
    }

    async fn drive(
        backend: &Arc<dyn QueueBackend>,
        handler: &Arc<dyn JobHandler>,
        policy: &QueuePolicy,
    ) {
        // One claim-and-process step, synchronous for deterministic tests.
        if let Some(job) = backend
            .claim(policy.queue, policy.lock_duration)
            .await
            .unwrap()
        {
            process_job(
                Arc::clone(backend),
                Arc::clone(handler),
                policy.clone(),
                CancelRegistry::new(),
                job,
            )
            .await;
        }
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let backend: Arc<dyn QueueBackend> = Arc::new(MemoryQueueBackend::new());
        let handler: Arc<dyn JobHandler> = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            fail_first: 2,
        });
        let policy = test_policy();

        backend
            .insert(JobRecord::new(
                "m".into(),
                QueueName::Missions,
                serde_json::json!({}),
                0,
            ))
            .await
            .unwrap();

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            drive(&backend, &handler, &policy).await;
        }

        let job = backend.get("m").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts_made, 3);
    }

    #[tokio::test]
    async fn exhausted_attempts_fail_terminally() {
        let backend: Arc<dyn QueueBackend> = Arc::new(MemoryQueueBackend::new());
        let handler: Arc<dyn JobHandler> = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            fail_first: usize::MAX,
        });
        let policy = test_policy();

        backend
            .insert(JobRecord::new(
                "m".into(),
                QueueName::Missions,
                serde_json::json!({}),
                0,
            ))
            .await
            .unwrap();

        for _ in 0..policy.attempts {
            tokio::time::sleep(Duration::from_millis(5)).await;
            drive(&backend, &handler, &policy).await;
        }

        let job = backend.get("m").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts_made, policy.attempts);
        assert!(job.failed_reason.is_some());
    }

    #[tokio::test]
    async fn persisted_cancel_flag_cancels_before_work() {
        let backend: Arc<dyn QueueBackend> = Arc::new(MemoryQueueBackend::new());
        let handler: Arc<dyn JobHandler> = Arc::new(CancelAware);
        let policy = test_policy();

        backend
            .insert(JobRecord::new(
                "c".into(),
                QueueName::Missions,
                serde_json::json!({}),
                0,
            ))
            .await
            .unwrap();
        let job = backend
            .claim(policy.queue, policy.lock_duration)
            .await
            .unwrap()
            .unwrap();
        backend.mark_cancel_requested("c").await.unwrap();
        // Re-read so the flag is visible to the processor.
        let job = backend.get(&job.id).await.unwrap().unwrap();

        process_job(backend.clone(), handler, policy, CancelRegistry::new(), job).await;

        let job = backend.get("c").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.failed_reason.as_deref(), Some("cancelled"));
    }

    struct SlowHandler {
        calls: AtomicUsize,
        work: Duration,
    }

    #[async_trait]
    impl JobHandler for SlowHandler {
        async fn handle(
            &self,
            _job: &JobRecord,
            _ctx: &JobContext,
        ) -> Result<serde_json::Value, MissionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.work).await;
            Ok(serde_json::json!({ "ok": true }))
        }
    }

    #[tokio::test]
    async fn slow_job_outliving_its_lock_runs_exactly_once() {
        let backend: Arc<dyn QueueBackend> = Arc::new(MemoryQueueBackend::new());
        let handler = Arc::new(SlowHandler {
            calls: AtomicUsize::new(0),
            work: Duration::from_millis(800),
        });
        // Lock far shorter than the handler, sweep running constantly.
        let mut policy = QueuePolicy::notifications();
        policy.lock_duration = Duration::from_millis(200);
        policy.stalled_check_interval = Duration::from_millis(50);

        let shutdown = CancellationToken::new();
        let worker_handler: Arc<dyn JobHandler> = handler.clone();
        let worker = Worker::new(
            Arc::clone(&backend),
            worker_handler,
            policy,
            Duration::from_millis(10),
            CancelRegistry::new(),
            shutdown.clone(),
        );
        let worker_handle = worker.spawn();

        backend
            .insert(JobRecord::new(
                "slow".into(),
                QueueName::Notifications,
                serde_json::json!({}),
                0,
            ))
            .await
            .unwrap();

        for _ in 0..300 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if let Some(job) = backend.get("slow").await.unwrap() {
                if job.state == JobState::Completed {
                    break;
                }
            }
        }

        shutdown.cancel();
        let _ = worker_handle.await;

        let job = backend.get("slow").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts_made, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rate_window_enforces_budget() {
        let window = RateWindow::new(RateLimit {
            max: 2,
            per: Duration::from_secs(60),
        });
        assert!(window.try_acquire());
        assert!(window.try_acquire());
        assert!(!window.try_acquire());
    }
}
