use thiserror::Error;

/// Longest error detail carried into logs and trace entries.
pub const MAX_ERROR_DETAIL_CHARS: usize = 300;

#[derive(Error, Debug)]
pub enum LocateError {
    #[error("{service} timed out after {timeout_ms}ms")]
    UpstreamTimeout { service: String, timeout_ms: u64 },

    #[error("{service} failed: {message}")]
    UpstreamFailure {
        service: String,
        message: String,
        status: Option<u16>,
    },

    #[error("Model contract violation: {0}")]
    ModelContractViolation(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error("Unknown jobId: {0}")]
    UnknownJob(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LocateError {
    pub fn upstream(service: impl Into<String>, message: impl std::fmt::Display) -> Self {
        LocateError::UpstreamFailure {
            service: service.into(),
            message: truncate(&message.to_string(), MAX_ERROR_DETAIL_CHARS),
            status: None,
        }
    }

    pub fn upstream_status(service: impl Into<String>, status: u16, body: &str) -> Self {
        LocateError::UpstreamFailure {
            service: service.into(),
            message: format!("HTTP {}: {}", status, truncate(body, MAX_ERROR_DETAIL_CHARS)),
            status: Some(status),
        }
    }

    pub fn from_reqwest(service: &str, timeout_ms: u64, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LocateError::UpstreamTimeout {
                service: service.to_string(),
                timeout_ms,
            }
        } else {
            LocateError::upstream(service, err)
        }
    }

    /// Transport-level failures worth another attempt. Contract violations
    /// and client errors never are.
    pub fn is_recoverable(&self) -> bool {
        match self {
            LocateError::UpstreamTimeout { .. } => true,
            LocateError::UpstreamFailure { status, .. } => match status {
                Some(code) => *code == 429 || *code >= 500,
                None => true,
            },
            _ => false,
        }
    }

    /// Message suitable for logs and job trace entries.
    pub fn detail(&self) -> String {
        truncate(&self.to_string(), MAX_ERROR_DETAIL_CHARS)
    }
}

impl From<reqwest::Error> for LocateError {
    fn from(err: reqwest::Error) -> Self {
        let service = err
            .url()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .unwrap_or_else(|| "http".to_string());
        LocateError::from_reqwest(&service, 0, err)
    }
}

impl From<anyhow::Error> for LocateError {
    fn from(err: anyhow::Error) -> Self {
        LocateError::Internal(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LocateError>;

/// Truncate on a char boundary, appending an ellipsis when cut.
pub fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        let timeout = LocateError::UpstreamTimeout {
            service: "overpass".into(),
            timeout_ms: 10,
        };
        assert!(timeout.is_recoverable());
        assert!(LocateError::upstream_status("openai", 503, "busy").is_recoverable());
        assert!(LocateError::upstream_status("openai", 429, "slow down").is_recoverable());
        assert!(!LocateError::upstream_status("openai", 400, "bad").is_recoverable());
        assert!(!LocateError::ModelContractViolation("x".into()).is_recoverable());
        assert!(!LocateError::InvalidInput("x".into()).is_recoverable());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééééé", 2), "éé…");
    }
}
