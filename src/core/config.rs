use std::time::Duration;

// ---------------------------------------------------------------------------
// AppConfig: env-driven configuration with sensible defaults
// ---------------------------------------------------------------------------

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Browser launch / interaction tuning.
#[derive(Clone, Debug)]
pub struct BrowserConfig {
    /// Explicit browser binary path. `None` auto-discovers Chromium/Chrome.
    pub executable: Option<String>,
    pub viewport_width: u32,
    pub viewport_height: u32,
    /// Default timeout for a single page action (navigation, selector wait).
    pub action_timeout: Duration,
    /// Bounded wait per selector in the auth check list.
    pub selector_timeout: Duration,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            executable: None,
            viewport_width: 1920,
            viewport_height: 1080,
            action_timeout: Duration::from_secs(30),
            selector_timeout: Duration::from_secs(3),
        }
    }
}

impl BrowserConfig {
    pub fn from_env() -> Self {
        Self {
            executable: env_string("CHROME_EXECUTABLE"),
            action_timeout: Duration::from_secs(env_u64("BROWSER_ACTION_TIMEOUT_SECS", 30)),
            selector_timeout: Duration::from_secs(env_u64("BROWSER_SELECTOR_TIMEOUT_SECS", 3)),
            ..Default::default()
        }
    }
}

/// Email / 2FA verification long-poll tuning.
///
/// The defaults (2s poll, 10s progress log, 120s ceiling) match the
/// verification UX of the currently supported marketplaces; platforms with a
/// slower email round-trip can raise the ceiling per deployment.
#[derive(Clone, Debug)]
pub struct VerificationConfig {
    pub poll_interval: Duration,
    pub progress_interval: Duration,
    pub ceiling: Duration,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            progress_interval: Duration::from_secs(10),
            ceiling: Duration::from_secs(120),
        }
    }
}

impl VerificationConfig {
    pub fn from_env() -> Self {
        Self {
            poll_interval: Duration::from_secs(env_u64("VERIFICATION_POLL_SECS", 2)),
            progress_interval: Duration::from_secs(env_u64("VERIFICATION_PROGRESS_SECS", 10)),
            ceiling: Duration::from_secs(env_u64("VERIFICATION_CEILING_SECS", 120)),
        }
    }
}

/// LLM scoring endpoint, any OpenAI-compatible `chat/completions` server.
#[derive(Clone, Debug)]
pub struct AiConfig {
    pub base_url: String,
    /// Never logged. `None` (or an empty value) skips the Authorization
    /// header, which key-less local endpoints (Ollama / LM Studio) accept.
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            temperature: 0.3,
            max_tokens: 2000,
        }
    }
}

impl AiConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: env_string("OPENAI_BASE_URL").unwrap_or(defaults.base_url),
            api_key: std::env::var("OPENAI_API_KEY").ok().map(|k| k.trim().to_string()),
            model: env_string("SCORING_LLM_MODEL").unwrap_or(defaults.model),
            temperature: defaults.temperature,
            max_tokens: env_u64("SCORING_LLM_MAX_TOKENS", 2000) as u32,
        }
    }
}

/// Queue maintenance tuning.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Terminal jobs older than this are eligible for cleanup.
    pub retention: Duration,
    /// Worker poll interval when a queue is idle.
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(24 * 3600),
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl QueueConfig {
    pub fn from_env() -> Self {
        Self {
            retention: Duration::from_secs(env_u64("JOB_RETENTION_SECS", 24 * 3600)),
            poll_interval: Duration::from_millis(env_u64("QUEUE_POLL_MS", 500)),
        }
    }
}

/// Top-level application config.
#[derive(Clone, Debug, Default)]
pub struct AppConfig {
    /// Postgres DSN. `None` runs with the in-memory queue (non-durable).
    pub database_url: Option<String>,
    pub browser: BrowserConfig,
    pub verification: VerificationConfig,
    pub ai: AiConfig,
    pub queue: QueueConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: env_string("DATABASE_URL"),
            browser: BrowserConfig::from_env(),
            verification: VerificationConfig::from_env(),
            ai: AiConfig::from_env(),
            queue: QueueConfig::from_env(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verification_defaults_match_documented_constants() {
        let v = VerificationConfig::default();
        assert_eq!(v.poll_interval, Duration::from_secs(2));
        assert_eq!(v.progress_interval, Duration::from_secs(10));
        assert_eq!(v.ceiling, Duration::from_secs(120));
    }

    #[test]
    fn browser_defaults_are_desktop_sized() {
        let b = BrowserConfig::default();
        assert_eq!((b.viewport_width, b.viewport_height), (1920, 1080));
        assert_eq!(b.selector_timeout, Duration::from_secs(3));
    }
}
