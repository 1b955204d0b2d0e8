use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("OpenAI authentication failed: {0}")]
    AuthFailed(String),

    #[error("OpenAI quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Model forbidden: {0}")]
    ModelForbidden(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("LLM provider unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("No scraping provider is currently available")]
    AllProvidersDown,

    #[error("Upstream scrape failed: {0}")]
    UpstreamFailed(String),

    #[error("Upstream returned no results: {0}")]
    UpstreamEmpty(String),

    #[error("No response for prompt: {0}")]
    NoResponse(String),

    #[error("Retryable upstream error: {0}")]
    RetryableUpstream(String),

    #[error("Analysis failed: {0}")]
    AnalysisFailed(String),

    #[error("Database update failed: {0}")]
    DbUpdateFailed(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Service not ready: {0}")]
    NotReady(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a dispatcher should negatively acknowledge the queue
    /// message so it gets redelivered. Covers 429, 5xx, connection
    /// resets and timeouts.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::RetryableUpstream(_) => true,
            Error::Http(e) => {
                if e.is_timeout() || e.is_connect() {
                    return true;
                }
                match e.status() {
                    Some(status) => {
                        status.as_u16() == 429 || status.is_server_error()
                    }
                    None => {
                        let msg = e.to_string().to_lowercase();
                        msg.contains("network") || msg.contains("timeout")
                    }
                }
            }
            _ => false,
        }
    }

    /// Short machine-readable tag stored in `response.error` on failed
    /// tracking rows and carried in failure emails.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::InvalidRequest(_) => "invalid_request",
            Error::AuthFailed(_) => "auth_failed",
            Error::QuotaExceeded(_) => "quota_exceeded",
            Error::ModelForbidden(_) => "model_forbidden",
            Error::ModelNotFound(_) => "model_not_found",
            Error::UpstreamUnavailable(_) => "upstream_unavailable",
            Error::AllProvidersDown => "all_providers_down",
            Error::UpstreamFailed(_) => "upstream_failed",
            Error::UpstreamEmpty(_) => "upstream_empty",
            Error::NoResponse(_) => "no_response",
            Error::RetryableUpstream(_) => "retryable_upstream",
            Error::AnalysisFailed(_) => "analysis_failed",
            Error::DbUpdateFailed(_) => "db_update_failed",
            Error::Database(_) => "database_error",
            Error::Config(_) => "config_error",
            Error::Http(_) => "http_error",
            Error::Serialization(_) => "serialization_error",
            Error::Io(_) => "io_error",
            Error::NotReady(_) => "not_ready",
            Error::NotFound(_) => "not_found",
            Error::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            Error::InvalidRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Error::AuthFailed(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Error::QuotaExceeded(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Error::ModelForbidden(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Error::ModelNotFound(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Error::AllProvidersDown => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
            Error::NotReady(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            Error::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            Error::UpstreamUnavailable(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            Error::Database(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            Error::DbUpdateFailed(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, msg.clone())
            }
            Error::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        };

        let body = Json(json!({
            "error": error_message,
            "code": self.reason(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}
