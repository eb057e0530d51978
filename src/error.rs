use thiserror::Error;

/// Classified mission failure taxonomy.
///
/// The queue layer reads [`MissionError::retryable`] to decide whether a
/// failed attempt is rescheduled; retry intent is declared here, not
/// inferred from whichever exception happened to bubble up.
#[derive(Debug, Error)]
pub enum MissionError {
    /// Unsupported platform, missing credentials, bad selector config.
    /// Fatal: retrying cannot help.
    #[error("{0}")]
    Config(String),

    /// Selector timeouts, navigation failures, browser launch errors.
    /// Transient: the queue retries with backoff.
    #[error("automation error: {0}")]
    Automation(#[source] anyhow::Error),

    /// The 120s-class polling window elapsed while still on a verification
    /// URL. Named distinctly so operators can tell it from a flaky page.
    #[error("Email verification timeout")]
    VerificationTimeout,

    /// Cooperative cancellation observed at a checkpoint. Terminal, not a
    /// failure.
    #[error("mission cancelled")]
    Cancelled,

    /// Persistence failure outside the per-product isolation scopes
    /// (e.g. the final status write path).
    #[error("store error: {0}")]
    Store(#[source] anyhow::Error),
}

impl MissionError {
    pub fn retryable(&self) -> bool {
        match self {
            Self::Config(_) | Self::Cancelled => false,
            Self::Automation(_) | Self::VerificationTimeout | Self::Store(_) => true,
        }
    }

    pub fn automation(err: impl Into<anyhow::Error>) -> Self {
        Self::Automation(err.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_are_fatal() {
        assert!(!MissionError::config("Unsupported platform: unknown").retryable());
        assert!(!MissionError::Cancelled.retryable());
    }

    #[test]
    fn automation_errors_are_retryable() {
        assert!(MissionError::automation(anyhow::anyhow!("selector timeout")).retryable());
        assert!(MissionError::VerificationTimeout.retryable());
    }

    #[test]
    fn verification_timeout_message_is_stable() {
        assert_eq!(
            MissionError::VerificationTimeout.to_string(),
            "Email verification timeout"
        );
    }
}
