//! Custom errors for the Gemini control

use thiserror::Error;

/// Base error type for all control errors
#[derive(Error, Debug)]
pub enum GeminiControlError {
    /// The backend reported a failure for one specific request.
    #[error("{message}")]
    Invocation { method: String, message: String },

    #[error("Request cancelled: {method}")]
    Cancelled { method: String },

    #[error("Malformed response from {method}: {message}")]
    MalformedResponse { method: String, message: String },

    #[error("Request timed out: {method}")]
    Timeout { method: String, timeout: f64 },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("API error: {message} (status: {status_code})")]
    Api { message: String, status_code: u16 },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl GeminiControlError {
    pub fn invocation(method: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invocation {
            method: method.into(),
            message: message.into(),
        }
    }

    pub fn cancelled(method: impl Into<String>) -> Self {
        Self::Cancelled {
            method: method.into(),
        }
    }

    pub fn malformed(method: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedResponse {
            method: method.into(),
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Validation {
            message: message.into(),
            field: field.map(String::from),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn api_error(message: impl Into<String>, status_code: u16) -> Self {
        Self::Api {
            message: message.into(),
            status_code,
        }
    }

    /// Whether this error came from a cancelled request.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

pub type Result<T> = std::result::Result<T, GeminiControlError>;
