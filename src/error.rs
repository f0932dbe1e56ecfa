use thiserror::Error;

/// Errors produced by sources, caches and the polling registry.
///
/// Cloneable so a single cold-load failure can be handed to every caller
/// that coalesced onto the same load.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MonitorError {
    #[error("Fetch failed for {origin}: {message}")]
    Fetch { origin: String, message: String },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Registration rejected: {0}")]
    Registration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MonitorError {
    pub fn fetch(origin: impl Into<String>, message: impl std::fmt::Display) -> Self {
        MonitorError::Fetch {
            origin: origin.into(),
            message: message.to_string(),
        }
    }

    /// Prefix the error with source-identifying context (host, port, server name).
    pub fn with_context(self, context: &str) -> Self {
        match self {
            MonitorError::Fetch { origin, message } => MonitorError::Fetch {
                origin: format!("{} ({})", origin, context),
                message,
            },
            MonitorError::Timeout(m) => MonitorError::Timeout(format!("[{}] {}", context, m)),
            MonitorError::Upstream(m) => MonitorError::Upstream(format!("[{}] {}", context, m)),
            other => other,
        }
    }
}

impl From<reqwest::Error> for MonitorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            MonitorError::Timeout(err.to_string())
        } else {
            MonitorError::Upstream(err.to_string())
        }
    }
}

impl From<std::io::Error> for MonitorError {
    fn from(err: std::io::Error) -> Self {
        MonitorError::fetch("io", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_is_attached_to_fetch_errors() {
        let err = MonitorError::fetch("redis", "connection refused").with_context("10.0.0.1:6379");
        assert_eq!(
            err.to_string(),
            "Fetch failed for redis (10.0.0.1:6379): connection refused"
        );
    }

    #[test]
    fn test_context_leaves_registry_errors_alone() {
        let err = MonitorError::NotFound("db-1".into()).with_context("ignored");
        assert_eq!(err, MonitorError::NotFound("db-1".into()));
    }
}
