use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ───────────────────────────────────────────────────────────────────────────
// Mission
// ───────────────────────────────────────────────────────────────────────────

/// Lifecycle of a research mission. Terminal once `Completed`, `Failed`, or
/// `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl MissionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Parameter bag attached to a mission request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionParameters {
    #[serde(default = "default_max_products")]
    pub max_products: usize,
    #[serde(default)]
    pub language: Option<String>,
    /// Fetch each product's detail page after extraction.
    #[serde(default)]
    pub get_details: bool,
    pub user_id: Uuid,
}

fn default_max_products() -> usize {
    10
}

impl Default for MissionParameters {
    fn default() -> Self {
        Self {
            max_products: default_max_products(),
            language: None,
            get_details: false,
            user_id: Uuid::nil(),
        }
    }
}

/// Results summary written on mission completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MissionResults {
    pub products_found: usize,
    pub products_saved: usize,
    pub duration_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mission {
    pub id: Uuid,
    pub platform: String,
    /// Free-text research prompt, e.g. "find top yoga products in the marketplace".
    pub prompt: String,
    #[serde(default)]
    pub agents: Vec<String>,
    pub parameters: MissionParameters,
    pub status: MissionStatus,
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<MissionResults>,
}

// ───────────────────────────────────────────────────────────────────────────
// Products
// ───────────────────────────────────────────────────────────────────────────

/// A product card recovered from rendered marketplace text.
///
/// Every field except `name` is best-effort: a parse miss yields `None`,
/// never an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProductCard {
    pub name: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub review_count: Option<u32>,
    #[serde(default)]
    pub commission: Option<f64>,
    /// Commission expressed as a percentage when the card shows one.
    #[serde(default)]
    pub commission_percent: Option<f64>,
    #[serde(default)]
    pub max_price: Option<f64>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// Detail-page enrichment, looser than the card heuristic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProductDetails {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub commission: Option<String>,
    #[serde(default)]
    pub commission_percent: Option<f64>,
    #[serde(default)]
    pub vendor: Option<String>,
}

/// One persisted row per product surfaced by a mission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredProduct {
    pub mission_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub commission: Option<f64>,
    #[serde(default)]
    pub category: Option<String>,
    pub niche: String,
    pub ai_score: f64,
    #[serde(default)]
    pub strengths: Option<String>,
    #[serde(default)]
    pub weaknesses: Option<String>,
    pub recommendation: String,
    pub source_platform: String,
    #[serde(default)]
    pub url: Option<String>,
    /// Always "pending" at insert time; review workflows move it forward.
    pub status: String,
}

// ───────────────────────────────────────────────────────────────────────────
// Audit log
// ───────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditLevel {
    Info,
    Warn,
    Error,
}

/// Append-only trail of significant mission events. Never updated or deleted
/// by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub mission_id: Uuid,
    pub action: String,
    #[serde(default)]
    pub details: serde_json::Value,
    pub level: AuditLevel,
    pub timestamp: DateTime<Utc>,
}

impl AuditLogEntry {
    pub fn info(mission_id: Uuid, action: &str, details: serde_json::Value) -> Self {
        Self::with_level(mission_id, action, details, AuditLevel::Info)
    }

    pub fn error(mission_id: Uuid, action: &str, details: serde_json::Value) -> Self {
        Self::with_level(mission_id, action, details, AuditLevel::Error)
    }

    fn with_level(
        mission_id: Uuid,
        action: &str,
        details: serde_json::Value,
        level: AuditLevel,
    ) -> Self {
        Self {
            mission_id,
            action: action.to_string(),
            details,
            level,
            timestamp: Utc::now(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Credentials & notifications
// ───────────────────────────────────────────────────────────────────────────

/// Marketplace credentials resolved from the integrations store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformCredentials {
    pub email: String,
    pub password: String,
}

/// Payload handed to the notification queue on mission completion/failure.
/// Delivery itself is a separate mechanism.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub mission_id: Uuid,
    pub user_id: Uuid,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl NotificationPayload {
    pub fn mission_completed(mission_id: Uuid, user_id: Uuid, products_found: usize) -> Self {
        Self {
            kind: "mission_completed".to_string(),
            mission_id,
            user_id,
            data: serde_json::json!({ "productsFound": products_found }),
        }
    }

    pub fn mission_failed(mission_id: Uuid, user_id: Uuid, error: &str) -> Self {
        Self {
            kind: "mission_failed".to_string(),
            mission_id,
            user_id,
            data: serde_json::json!({ "error": error }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!MissionStatus::Pending.is_terminal());
        assert!(!MissionStatus::Running.is_terminal());
        assert!(MissionStatus::Completed.is_terminal());
        assert!(MissionStatus::Failed.is_terminal());
        assert!(MissionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn mission_parameters_default_max_products() {
        let p: MissionParameters = serde_json::from_value(serde_json::json!({
            "user_id": Uuid::nil(),
        }))
        .unwrap();
        assert_eq!(p.max_products, 10);
        assert!(!p.get_details);
    }

    #[test]
    fn notification_payload_shape() {
        let n = NotificationPayload::mission_failed(Uuid::nil(), Uuid::nil(), "boom");
        let v = serde_json::to_value(&n).unwrap();
        assert_eq!(v["type"], "mission_failed");
        assert_eq!(v["data"]["error"], "boom");
    }
}
