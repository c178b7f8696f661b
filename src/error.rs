//! Error types for tiergate.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::proxy::retry::AttemptFailure;

/// Result type alias for tiergate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for tiergate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("No provider available for category '{category}' (strategy: {strategy})")]
    NoProviderAvailable { category: String, strategy: String },

    #[error("All providers failed ({})", summarize_attempts(.attempts))]
    AllProvidersFailed { attempts: Vec<AttemptFailure> },

    #[error("Provider '{0}' not found")]
    ProviderNotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// One line per failed candidate, last attempt first in prominence.
fn summarize_attempts(attempts: &[AttemptFailure]) -> String {
    if attempts.is_empty() {
        return "no candidates were attempted".to_string();
    }
    let last = &attempts[attempts.len() - 1];
    let mut s = format!("{} candidate(s) attempted; last: {}", attempts.len(), last);
    if attempts.len() > 1 {
        let earlier: Vec<String> = attempts[..attempts.len() - 1]
            .iter()
            .map(|a| a.to_string())
            .collect();
        s.push_str(&format!("; earlier: {}", earlier.join(", ")));
    }
    s
}

impl Error {
    /// Wire-format error type string for the response envelope.
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::Config(_) => "api_error",
            Error::InvalidRequest(_) => "invalid_request_error",
            Error::NoProviderAvailable { .. } => "no_provider_available",
            Error::AllProvidersFailed { .. } => "all_providers_failed",
            Error::ProviderNotFound(_) => "not_found_error",
            Error::Internal(_) => "api_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::NoProviderAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::AllProvidersFailed { .. } => StatusCode::BAD_GATEWAY,
            Error::ProviderNotFound(_) => StatusCode::NOT_FOUND,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Messages-compatible error envelope
        let body = serde_json::json!({
            "type": "error",
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
            }
        });

        (status, axum::Json(body)).into_response()
    }
}
