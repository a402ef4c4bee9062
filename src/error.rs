use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use std::time::Duration;
use thiserror::Error;

/// Returned when a circuit breaker refuses a call.
///
/// Kept separate from [`ResilienceError`] so guarded callers can match on it
/// and fall back without waiting.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Circuit open for '{service}' (retry in {retry_after_ms}ms)")]
pub struct CircuitOpenError {
    pub service: String,
    pub retry_after_ms: u64,
}

#[derive(Error, Debug)]
pub enum ResilienceError {
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("Circuit breaker '{0}' not found")]
    BreakerNotFound(String),

    #[error("Failure event '{0}' not found")]
    EventNotFound(String),

    #[error("No handler registered for recovery action '{0}'")]
    HandlerMissing(String),

    #[error("Recovery action failed: {0}")]
    ActionFailed(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type ResilienceResult<T> = Result<T, ResilienceError>;

impl serde::Serialize for ResilienceError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl From<toml::de::Error> for ResilienceError {
    fn from(err: toml::de::Error) -> Self {
        ResilienceError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for ResilienceError {
    fn from(err: reqwest::Error) -> Self {
        ResilienceError::NetworkError(err.to_string())
    }
}

impl IntoResponse for ResilienceError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ResilienceError::BreakerNotFound(_) | ResilienceError::EventNotFound(_) => {
                (StatusCode::NOT_FOUND, self.to_string())
            }
            ResilienceError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ResilienceError::CircuitOpen(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            ResilienceError::Timeout(_) => (StatusCode::REQUEST_TIMEOUT, self.to_string()),
            // Default to 500
            _ => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        };

        let body = serde_json::json!({
            "error": message,
            "code": status.as_u16(),
            "type": format!("{:?}", self).split('(').next().unwrap_or("Error")
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = ResilienceError::BreakerNotFound("db".to_string());
        assert_eq!(err.to_string(), "Circuit breaker 'db' not found");

        let err = ResilienceError::EventNotFound("evt-1".to_string());
        assert_eq!(err.to_string(), "Failure event 'evt-1' not found");

        let err: ResilienceError = CircuitOpenError {
            service: "db".to_string(),
            retry_after_ms: 1200,
        }
        .into();
        assert_eq!(err.to_string(), "Circuit open for 'db' (retry in 1200ms)");
    }

    #[test]
    fn test_status_codes() {
        let resp = ResilienceError::BreakerNotFound("x".into()).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = ResilienceError::BadRequest("bad".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = ResilienceError::from(CircuitOpenError {
            service: "db".into(),
            retry_after_ms: 0,
        })
        .into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let resp = ResilienceError::InternalError("boom".into()).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
