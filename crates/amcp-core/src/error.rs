//! Error types for Amcp

use http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("authentication failed: {reason}")]
    AuthFailed { reason: String },

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("llm error: {provider} - {message}")]
    LlmError { provider: String, message: String },

    #[error("tool error: {name} - {message}")]
    ToolError { name: String, message: String },

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("session busy: {0}")]
    SessionBusy(String),

    #[error("step limit exceeded: {0} steps")]
    StepLimit(usize),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("timeout: {0}")]
    Timeout(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn auth_failed(reason: impl Into<String>) -> Self {
        Self::AuthFailed {
            reason: reason.into(),
        }
    }

    pub fn llm_error(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LlmError {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn tool_error(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolError {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn validation_error(message: impl Into<String>) -> Self {
        Self::ValidationError(message.into())
    }

    pub fn session_busy(session_id: impl Into<String>) -> Self {
        Self::SessionBusy(session_id.into())
    }

    /// HTTP status code for a gateway error response (§6.5).
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::InvalidMessage(_) => StatusCode::BAD_REQUEST,
            Self::ValidationError(_) => StatusCode::BAD_REQUEST,
            Self::JsonError(_) => StatusCode::BAD_REQUEST,
            Self::AuthFailed { .. } => StatusCode::UNAUTHORIZED,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::MethodNotFound(_) => StatusCode::NOT_FOUND,
            Self::SessionBusy(_) => StatusCode::CONFLICT,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::ConnectionClosed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::LlmError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ToolError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::IoError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::StepLimit(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Cancelled(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable error code for a gateway error response (§6.5).
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidMessage(_) => "BAD_REQUEST",
            Self::ValidationError(_) => "VALIDATION_ERROR",
            Self::JsonError(_) => "INVALID_JSON",
            Self::AuthFailed { .. } => "UNAUTHORIZED",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::MethodNotFound(_) => "NOT_FOUND",
            Self::SessionBusy(_) => "SESSION_BUSY",
            Self::Timeout(_) => "TIMEOUT",
            Self::ConnectionClosed(_) => "INTERNAL_ERROR",
            Self::LlmError { .. } => "LLM_ERROR",
            Self::ToolError { .. } => "TOOL_ERROR",
            Self::ConfigError(_) => "INTERNAL_ERROR",
            Self::IoError(_) => "INTERNAL_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::StepLimit(_) => "INTERNAL_ERROR",
            Self::Cancelled(_) => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_busy_maps_to_409() {
        let err = Error::session_busy("abc");
        assert_eq!(err.http_status(), StatusCode::CONFLICT);
        assert_eq!(err.error_code(), "SESSION_BUSY");
    }

    #[test]
    fn validation_error_maps_to_400() {
        let err = Error::validation_error("bad field");
        assert_eq!(err.http_status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }
}
