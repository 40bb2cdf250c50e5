use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("configuration anomaly: {0}")]
    ConfigurationAnomaly(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("subscription conflict: {0}")]
    SubscriptionConflict(String),
    #[error("transition not allowed: {event} while {from}")]
    InvalidTransition { from: String, event: String },
    #[error("upstream stream failure: {0}")]
    Upstream(String),
    #[error("job {job} failed: {reason}")]
    JobFailed { job: String, reason: String },
    #[error("{operation} is temporarily unavailable, retry later")]
    Unavailable { operation: String },
    #[error("http error: {0}")]
    Http(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("runtime error: {0}")]
    Runtime(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Failures a caller may retry without changing the request.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Unavailable { .. }
                | EngineError::Http(_)
                | EngineError::Storage(_)
                | EngineError::Runtime(_)
                | EngineError::Upstream(_)
        )
    }

    /// Text safe to hand back to an end user. Raw storage and network
    /// details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            EngineError::Http(_) | EngineError::Storage(_) | EngineError::Runtime(_) => {
                "temporarily unavailable, retry later".to_string()
            }
            EngineError::Serialization(_) => "malformed request".to_string(),
            EngineError::Config(_) | EngineError::ConfigurationAnomaly(_) => {
                "service misconfigured".to_string()
            }
            EngineError::Upstream(_) => "the assistant failed to respond, retry later".to_string(),
            EngineError::JobFailed { job, .. } => format!("job {job} failed"),
            other => other.to_string(),
        }
    }

    pub fn unavailable(operation: impl Into<String>) -> Self {
        EngineError::Unavailable {
            operation: operation.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_details_are_hidden_from_callers() {
        let err = EngineError::Storage("database is locked at /srv/data.db".to_string());
        assert!(err.is_transient());
        assert!(!err.public_message().contains("/srv"));
        assert!(format!("{err}").contains("storage error"));
    }

    #[test]
    fn caller_errors_keep_their_text() {
        let err = EngineError::InvalidTransition {
            from: "expired".to_string(),
            event: "cancel".to_string(),
        };
        assert!(!err.is_transient());
        assert_eq!(
            err.public_message(),
            "transition not allowed: cancel while expired"
        );
        let err = EngineError::unavailable("authorize");
        assert!(err.public_message().contains("retry later"));
    }
}
