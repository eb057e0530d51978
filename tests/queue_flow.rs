//! Worker loop against the in-memory queue backend: claiming, completion,
//! and cooperative cancellation of an active job.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use nichehawk::error::MissionError;
use nichehawk::jobs::queue::{MemoryQueueBackend, QueueBackend};
use nichehawk::jobs::types::{JobRecord, JobState, QueueName, QueuePolicy};
use nichehawk::jobs::worker::{CancelRegistry, JobContext, JobHandler, Worker};

struct CountingHandler {
    handled: Arc<AtomicUsize>,
}

#[async_trait]
impl JobHandler for CountingHandler {
    async fn handle(
        &self,
        _job: &JobRecord,
        ctx: &JobContext,
    ) -> Result<serde_json::Value, MissionError> {
        ctx.report_progress(50).await;
        self.handled.fetch_add(1, Ordering::SeqCst);
        Ok(serde_json::json!({ "ok": true }))
    }
}

/// Blocks until its cancellation token fires.
struct WaitForCancel;

#[async_trait]
impl JobHandler for WaitForCancel {
    async fn handle(
        &self,
        _job: &JobRecord,
        ctx: &JobContext,
    ) -> Result<serde_json::Value, MissionError> {
        ctx.cancel_token().cancelled().await;
        Err(MissionError::Cancelled)
    }
}

fn fast_policy(queue: QueueName) -> QueuePolicy {
    let mut policy = QueuePolicy::for_queue(queue);
    policy.backoff_base = Duration::from_millis(1);
    policy
}

async fn wait_for<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

async fn wait_for_state(backend: &Arc<dyn QueueBackend>, id: &str, state: JobState) {
    for _ in 0..200 {
        if backend
            .get(id)
            .await
            .unwrap()
            .is_some_and(|j| j.state == state)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {id} never reached {state:?}");
}

#[tokio::test]
async fn worker_drains_the_queue() {
    let backend: Arc<dyn QueueBackend> = Arc::new(MemoryQueueBackend::new());
    let handled = Arc::new(AtomicUsize::new(0));
    let shutdown = CancellationToken::new();

    for i in 0..3 {
        backend
            .insert(JobRecord::new(
                format!("n-{i}"),
                QueueName::Notifications,
                serde_json::json!({ "i": i }),
                0,
            ))
            .await
            .unwrap();
    }

    let worker = Worker::new(
        Arc::clone(&backend),
        Arc::new(CountingHandler {
            handled: Arc::clone(&handled),
        }),
        fast_policy(QueueName::Notifications),
        Duration::from_millis(10),
        CancelRegistry::new(),
        shutdown.clone(),
    );
    let handle = worker.spawn();

    {
        let handled = Arc::clone(&handled);
        wait_for(move || handled.load(Ordering::SeqCst) == 3).await;
    }

    shutdown.cancel();
    handle.await.unwrap();

    let stats = backend.stats(QueueName::Notifications).await.unwrap();
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.waiting, 0);

    for i in 0..3 {
        let job = backend.get(&format!("n-{i}")).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.progress, 100);
    }
}

#[tokio::test]
async fn cancel_registry_stops_an_active_job() {
    let backend: Arc<dyn QueueBackend> = Arc::new(MemoryQueueBackend::new());
    let cancels = CancelRegistry::new();
    let shutdown = CancellationToken::new();

    backend
        .insert(JobRecord::new(
            "stuck".into(),
            QueueName::Missions,
            serde_json::json!({}),
            0,
        ))
        .await
        .unwrap();

    let worker = Worker::new(
        Arc::clone(&backend),
        Arc::new(WaitForCancel),
        fast_policy(QueueName::Missions),
        Duration::from_millis(10),
        cancels.clone(),
        shutdown.clone(),
    );
    let handle = worker.spawn();

    // Wait until the worker has the job in flight, then cancel it.
    wait_for_state(&backend, "stuck", JobState::Active).await;
    assert!(cancels.cancel("stuck"));
    wait_for_state(&backend, "stuck", JobState::Failed).await;

    let job = backend.get("stuck").await.unwrap().unwrap();
    assert_eq!(job.failed_reason.as_deref(), Some("cancelled"));

    shutdown.cancel();
    handle.await.unwrap();
}
