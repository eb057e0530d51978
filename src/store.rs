//! Persistence contract.
//!
//! The pipeline consumes storage through [`MissionStore`] only; table layout
//! and migrations belong to the wider application. [`PgMissionStore`] is the
//! production Postgres implementation, [`MemoryStore`] backs tests and local
//! dry runs.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::core::types::{
    AuditLogEntry, DiscoveredProduct, Mission, MissionResults, MissionStatus, PlatformCredentials,
};

#[async_trait]
pub trait MissionStore: Send + Sync {
    async fn mission(&self, id: Uuid) -> Result<Option<Mission>>;

    async fn mark_running(&self, id: Uuid) -> Result<()>;

    /// Final status write. Tolerated to fail by callers (the mission may
    /// already be marked failed by an inner handler).
    async fn finish_mission(
        &self,
        id: Uuid,
        status: MissionStatus,
        error: Option<&str>,
        results: Option<&MissionResults>,
    ) -> Result<()>;

    async fn insert_product(&self, product: &DiscoveredProduct) -> Result<()>;

    /// Append-only audit trail. Callers swallow failures here; an audit miss
    /// must never escalate into a mission failure.
    async fn append_audit(&self, entry: &AuditLogEntry) -> Result<()>;

    async fn credentials(
        &self,
        user_id: Uuid,
        platform: &str,
    ) -> Result<Option<PlatformCredentials>>;
}

// ───────────────────────────────────────────────────────────────────────────
// Postgres
// ───────────────────────────────────────────────────────────────────────────

pub struct PgMissionStore {
    pool: PgPool,
}

impl PgMissionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("failed to connect mission store")?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MissionStore for PgMissionStore {
    async fn mission(&self, id: Uuid) -> Result<Option<Mission>> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT payload FROM missions WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .context("mission lookup failed")?;
        match row {
            Some((payload,)) => Ok(Some(serde_json::from_value(payload)?)),
            None => Ok(None),
        }
    }

    async fn mark_running(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE missions SET status = 'running', started_at = $2, \
             payload = jsonb_set(jsonb_set(payload, '{status}', '\"running\"'), '{started_at}', to_jsonb($2::timestamptz)) \
             WHERE id = $1",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("mark_running failed")?;
        Ok(())
    }

    async fn finish_mission(
        &self,
        id: Uuid,
        status: MissionStatus,
        error: Option<&str>,
        results: Option<&MissionResults>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE missions SET status = $2, completed_at = $3, error_message = $4, results = $5 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(error)
        .bind(results.map(serde_json::to_value).transpose()?)
        .execute(&self.pool)
        .await
        .context("finish_mission failed")?;
        Ok(())
    }

    async fn insert_product(&self, product: &DiscoveredProduct) -> Result<()> {
        sqlx::query(
            "INSERT INTO discovered_products \
             (mission_id, name, price, commission, category, niche, ai_score, \
              strengths, weaknesses, recommendation, source_platform, url, status, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(product.mission_id)
        .bind(&product.name)
        .bind(product.price)
        .bind(product.commission)
        .bind(&product.category)
        .bind(&product.niche)
        .bind(product.ai_score)
        .bind(&product.strengths)
        .bind(&product.weaknesses)
        .bind(&product.recommendation)
        .bind(&product.source_platform)
        .bind(&product.url)
        .bind(&product.status)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .with_context(|| format!("insert failed for product '{}'", product.name))?;
        Ok(())
    }

    async fn append_audit(&self, entry: &AuditLogEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO mission_audit_log (mission_id, action, details, level, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(entry.mission_id)
        .bind(&entry.action)
        .bind(&entry.details)
        .bind(serde_json::to_value(entry.level)?.as_str().unwrap_or("info").to_string())
        .bind(entry.timestamp)
        .execute(&self.pool)
        .await
        .context("audit append failed")?;
        Ok(())
    }

    async fn credentials(
        &self,
        user_id: Uuid,
        platform: &str,
    ) -> Result<Option<PlatformCredentials>> {
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT email, password FROM platform_integrations \
             WHERE user_id = $1 AND platform = $2 AND active = TRUE",
        )
        .bind(user_id)
        .bind(platform.to_lowercase())
        .fetch_optional(&self.pool)
        .await
        .context("credentials lookup failed")?;
        Ok(row.map(|(email, password)| PlatformCredentials { email, password }))
    }
}

// ───────────────────────────────────────────────────────────────────────────
// In-memory store (tests / dry runs)
// ───────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryInner {
    missions: HashMap<Uuid, Mission>,
    products: Vec<DiscoveredProduct>,
    audit: Vec<AuditLogEntry>,
    credentials: HashMap<(Uuid, String), PlatformCredentials>,
    /// Product names whose insert should fail, for failure-path tests.
    failing_products: Vec<String>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_mission(&self, mission: Mission) {
        self.inner.lock().unwrap().missions.insert(mission.id, mission);
    }

    pub fn put_credentials(&self, user_id: Uuid, platform: &str, creds: PlatformCredentials) {
        self.inner
            .lock()
            .unwrap()
            .credentials
            .insert((user_id, platform.to_lowercase()), creds);
    }

    /// Make the next insert of a product with this name fail.
    pub fn fail_product(&self, name: &str) {
        self.inner.lock().unwrap().failing_products.push(name.to_string());
    }

    pub fn products(&self) -> Vec<DiscoveredProduct> {
        self.inner.lock().unwrap().products.clone()
    }

    pub fn audit_entries(&self) -> Vec<AuditLogEntry> {
        self.inner.lock().unwrap().audit.clone()
    }

    pub fn mission_snapshot(&self, id: Uuid) -> Option<Mission> {
        self.inner.lock().unwrap().missions.get(&id).cloned()
    }
}

#[async_trait]
impl MissionStore for MemoryStore {
    async fn mission(&self, id: Uuid) -> Result<Option<Mission>> {
        Ok(self.inner.lock().unwrap().missions.get(&id).cloned())
    }

    async fn mark_running(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(m) = inner.missions.get_mut(&id) {
            m.status = MissionStatus::Running;
            m.started_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn finish_mission(
        &self,
        id: Uuid,
        status: MissionStatus,
        error: Option<&str>,
        results: Option<&MissionResults>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let m = inner
            .missions
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("unknown mission {}", id))?;
        m.status = status;
        m.completed_at = Some(Utc::now());
        m.error_message = error.map(str::to_string);
        m.results = results.cloned();
        Ok(())
    }

    async fn insert_product(&self, product: &DiscoveredProduct) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.failing_products.contains(&product.name) {
            anyhow::bail!("simulated insert failure for '{}'", product.name);
        }
        inner.products.push(product.clone());
        Ok(())
    }

    async fn append_audit(&self, entry: &AuditLogEntry) -> Result<()> {
        self.inner.lock().unwrap().audit.push(entry.clone());
        Ok(())
    }

    async fn credentials(
        &self,
        user_id: Uuid,
        platform: &str,
    ) -> Result<Option<PlatformCredentials>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .credentials
            .get(&(user_id, platform.to_lowercase()))
            .cloned())
    }
}
