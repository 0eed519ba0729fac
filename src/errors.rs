use thiserror::Error;

#[derive(Debug, Error)]
pub enum WebClawError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("LLM provider error: {0}")]
    LlmProvider(String),

    #[error("SSE parsing error: {0}")]
    SseParsing(String),

    #[error("Executor error: {0}")]
    Executor(String),

    #[error("Browser error: {0}")]
    Browser(String),

    /// The browser session is gone. Never retried.
    #[error("Browser session lost: {0}")]
    SessionLost(String),

    /// The backend produced no valid decision after the corrective retries.
    #[error("Invalid decision: {0}")]
    InvalidDecision(String),

    #[error("Invalid run state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Report error: {0}")]
    Report(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TOML deserialize error: {0}")]
    TomlDe(#[from] toml::de::Error),
}

impl WebClawError {
    /// Only these end a run; everything else is folded back into history.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WebClawError::SessionLost(_) | WebClawError::InvalidDecision(_)
        )
    }
}

impl serde::Serialize for WebClawError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

pub type WebClawResult<T> = Result<T, WebClawError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_session_lost_and_invalid_decision_are_fatal() {
        assert!(WebClawError::SessionLost("closed".into()).is_fatal());
        assert!(WebClawError::InvalidDecision("no action".into()).is_fatal());
        assert!(!WebClawError::Browser("box model".into()).is_fatal());
        assert!(!WebClawError::LlmProvider("503".into()).is_fatal());
    }

    #[test]
    fn serializes_as_display_string() {
        let json = serde_json::to_string(&WebClawError::SessionLost("closed".into())).unwrap();
        assert_eq!(json, "\"Browser session lost: closed\"");
    }
}
