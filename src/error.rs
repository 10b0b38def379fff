use thiserror::Error;

/// Errors surfaced by the feed, timeline and document layers.
///
/// `NotFound` is only returned where an operation has no natural "nothing
/// here" value; reads such as `get_latest_chapter_id` map it to `None`.
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transport error{}: {message}", status_suffix(.status))]
    Transport {
        status: Option<u16>,
        message: String,
    },

    #[error("Publish conflict: expected feed at {expected:?}, found {actual:?}")]
    PublishConflict {
        expected: Option<String>,
        actual: Option<String>,
    },

    #[error("Payload of {size} bytes exceeds the maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Chain broken: {0}")]
    ChainBroken(String),

    #[error("Signature error: {0}")]
    Signature(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    #[error("CRDT error: {0}")]
    Crdt(String),
}

impl FeedError {
    pub fn transport(message: impl Into<String>) -> Self {
        FeedError::Transport {
            status: None,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FeedError::NotFound(_))
    }

    /// Whether retrying the same call could succeed. Bad data never will.
    pub fn is_retryable(&self) -> bool {
        match self {
            FeedError::Transport { status, .. } => status.map_or(true, |s| s >= 500 || s == 429),
            FeedError::Timeout(_) | FeedError::PublishConflict { .. } => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(e: serde_json::Error) -> Self {
        FeedError::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(e: reqwest::Error) -> Self {
        FeedError::Transport {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (status {s})")).unwrap_or_default()
}

pub type Result<T, E = FeedError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_display_includes_status() {
        let err = FeedError::Transport {
            status: Some(503),
            message: "unavailable".into(),
        };
        assert_eq!(err.to_string(), "Transport error (status 503): unavailable");
        assert_eq!(FeedError::transport("reset").to_string(), "Transport error: reset");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(FeedError::Timeout(100).is_retryable());
        assert!(FeedError::transport("connection reset").is_retryable());
        assert!(!FeedError::Transport { status: Some(400), message: "bad".into() }.is_retryable());
        assert!(!FeedError::Validation("wrong protocol".into()).is_retryable());
        assert!(FeedError::NotFound("x".into()).is_not_found());
    }
}
