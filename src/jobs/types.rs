//! Queue-layer data model: queues, policies, job records, payloads.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::types::MissionParameters;

// ───────────────────────────────────────────────────────────────────────────
// Queues & policies
// ───────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Missions,
    Results,
    Notifications,
    Scrape,
}

impl QueueName {
    pub const ALL: [QueueName; 4] = [
        Self::Missions,
        Self::Results,
        Self::Notifications,
        Self::Scrape,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Missions => "missions",
            Self::Results => "results",
            Self::Notifications => "notifications",
            Self::Scrape => "scrape",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "missions" => Some(Self::Missions),
            "results" => Some(Self::Results),
            "notifications" => Some(Self::Notifications),
            "scrape" => Some(Self::Scrape),
            _ => None,
        }
    }
}

/// Queue-level rate limit modeling an external constraint, independent of
/// worker concurrency.
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub max: usize,
    pub per: Duration,
}

/// Per-queue retry / concurrency policy.
#[derive(Debug, Clone)]
pub struct QueuePolicy {
    pub queue: QueueName,
    pub attempts: u32,
    /// Exponential backoff base: delay = base * 2^(attempt-1).
    pub backoff_base: Duration,
    pub concurrency: usize,
    /// How long a claimed job stays locked before it counts as stalled.
    pub lock_duration: Duration,
    pub stalled_check_interval: Duration,
    pub rate_limit: Option<RateLimit>,
}

impl QueuePolicy {
    /// Browser automation is slow but a dead worker must still be detected:
    /// long lock, shorter stalled sweep, single-job concurrency because one
    /// browser session cannot be shared.
    pub fn missions() -> Self {
        Self {
            queue: QueueName::Missions,
            attempts: 3,
            backoff_base: Duration::from_secs(60),
            concurrency: 1,
            lock_duration: Duration::from_secs(600),
            stalled_check_interval: Duration::from_secs(120),
            rate_limit: None,
        }
    }

    /// Purely post-processing: no retries needed.
    pub fn results() -> Self {
        Self {
            queue: QueueName::Results,
            attempts: 1,
            backoff_base: Duration::from_secs(5),
            concurrency: 2,
            lock_duration: Duration::from_secs(60),
            stalled_check_interval: Duration::from_secs(60),
            rate_limit: None,
        }
    }

    /// Fire-and-forget delivery.
    pub fn notifications() -> Self {
        Self {
            queue: QueueName::Notifications,
            attempts: 2,
            backoff_base: Duration::from_secs(5),
            concurrency: 5,
            lock_duration: Duration::from_secs(30),
            stalled_check_interval: Duration::from_secs(60),
            rate_limit: None,
        }
    }

    /// Rate-limited to respect upstream marketplace limits.
    pub fn scrape() -> Self {
        Self {
            queue: QueueName::Scrape,
            attempts: 3,
            backoff_base: Duration::from_secs(5),
            concurrency: 2,
            lock_duration: Duration::from_secs(120),
            stalled_check_interval: Duration::from_secs(60),
            rate_limit: Some(RateLimit {
                max: 5,
                per: Duration::from_secs(60),
            }),
        }
    }

    pub fn for_queue(queue: QueueName) -> Self {
        match queue {
            QueueName::Missions => Self::missions(),
            QueueName::Results => Self::results(),
            QueueName::Notifications => Self::notifications(),
            QueueName::Scrape => Self::scrape(),
        }
    }

    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(10);
        self.backoff_base.saturating_mul(1u32 << exp)
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Job record
// ───────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Delayed => "delayed",
        }
    }
}

/// Queue-layer wrapper around a mission or scrape request.
///
/// Identity is deterministically derived from the logical identity
/// (`mission-<id>`, `scrape-<sessionId>`) so at most one live job exists per
/// mission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub queue: QueueName,
    pub payload: serde_json::Value,
    pub state: JobState,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub priority: i32,
    /// 0-100, reported by the running worker.
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    /// Not eligible to run before this instant (retry backoff / delays).
    pub run_at: DateTime<Utc>,
    #[serde(default)]
    pub locked_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub processed_on: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_on: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_reason: Option<String>,
    /// Set by `cancel` on an active job; observed cooperatively by the
    /// worker at its next checkpoint.
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

impl JobRecord {
    pub fn new(id: String, queue: QueueName, payload: serde_json::Value, priority: i32) -> Self {
        let policy = QueuePolicy::for_queue(queue);
        let now = Utc::now();
        Self {
            id,
            queue,
            payload,
            state: JobState::Waiting,
            attempts_made: 0,
            max_attempts: policy.attempts,
            priority,
            progress: 0,
            created_at: now,
            run_at: now,
            locked_until: None,
            processed_on: None,
            finished_on: None,
            failed_reason: None,
            cancel_requested: false,
            result: None,
        }
    }
}

/// Deterministic job id for a mission: at-most-one live job per mission.
pub fn mission_job_id(mission_id: Uuid) -> String {
    format!("mission-{}", mission_id)
}

/// Deterministic job id for a scrape session.
pub fn scrape_job_id(session_id: &str) -> String {
    format!("scrape-{}", session_id)
}

// ───────────────────────────────────────────────────────────────────────────
// Payloads
// ───────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionJobPayload {
    pub mission_id: Uuid,
    pub platform: String,
    pub prompt: String,
    #[serde(default)]
    pub agents: Vec<String>,
    pub parameters: MissionParameters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeConfig {
    pub url: String,
    pub scraper_type: String,
    #[serde(default)]
    pub query: Option<String>,
    pub max_products: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeJobPayload {
    pub session_id: String,
    pub marketplace_id: String,
    pub user_id: Uuid,
    pub config: ScrapeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultJobPayload {
    pub mission_id: Uuid,
    pub user_id: Uuid,
    pub products_found: usize,
    pub products_saved: usize,
}

// ───────────────────────────────────────────────────────────────────────────
// External views
// ───────────────────────────────────────────────────────────────────────────

/// Status-query shape exposed to the rest of the application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: String,
    pub state: JobState,
    pub progress: u8,
    pub attempts_made: u32,
    #[serde(default)]
    pub processed_on: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_on: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_reason: Option<String>,
    /// True when the durable backend was unreachable and this view is a
    /// synthetic placeholder: the request was recorded, not scheduled.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub synthetic: bool,
}

impl JobStatusView {
    pub fn from_record(job: &JobRecord) -> Self {
        Self {
            job_id: job.id.clone(),
            state: job.state,
            progress: job.progress,
            attempts_made: job.attempts_made,
            processed_on: job.processed_on,
            finished_on: job.finished_on,
            failed_reason: job.failed_reason.clone(),
            synthetic: false,
        }
    }

    /// Degraded-mode placeholder: looks pending so callers keep functioning.
    pub fn synthetic_pending(job_id: String) -> Self {
        Self {
            job_id,
            state: JobState::Waiting,
            progress: 0,
            attempts_made: 0,
            processed_on: None,
            finished_on: None,
            failed_reason: None,
            synthetic: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
}
