use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::orchestrator::QuotaDimension;

/// Unified error type for the ads-gateway service.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    // ── OAuth Errors ────────────────────────────────────────────────────
    /// Malformed or replayed state, missing verifier, or a rejected code.
    #[error("Authorization failed: {0}")]
    Auth(String),

    /// Refresh token invalid or revoked. The owner must reconnect.
    #[error("Credential expired, re-authorization required")]
    AuthExpired,

    #[error("No credential connected for owner {0}")]
    NotConnected(String),

    // ── Quota / API Errors ──────────────────────────────────────────────
    #[error("Rate limit exceeded on {dimension}")]
    RateLimitExceeded { dimension: QuotaDimension },

    #[error("Transient API error ({}): {message}", status_label(.status))]
    TransientApi { status: Option<u16>, message: String },

    #[error("API request rejected ({status}): {message}")]
    PermanentApi { status: u16, message: String },

    // ── Queue Errors ────────────────────────────────────────────────────
    #[error("Request queue is full")]
    QueueFull,

    #[error("Request cancelled before dispatch")]
    Cancelled,

    #[error("Request orchestrator is shutting down")]
    ShuttingDown,

    // ── Resource Errors ─────────────────────────────────────────────────
    #[error("Authentication required")]
    Unauthorized,

    #[error("{0} not found")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    // ── Crypto Errors ───────────────────────────────────────────────────
    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    // ── Internal ────────────────────────────────────────────────────────
    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn status_label(status: &Option<u16>) -> String {
    status.map_or_else(|| "network".to_string(), |s| s.to_string())
}

impl GatewayError {
    /// Whether the orchestrator may retry the request that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::TransientApi { .. } | GatewayError::RateLimitExceeded { .. }
        )
    }

    /// Stable machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Auth(_) => "auth_error",
            GatewayError::AuthExpired => "auth_expired",
            GatewayError::NotConnected(_) => "not_connected",
            GatewayError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            GatewayError::TransientApi { .. } => "transient_api_error",
            GatewayError::PermanentApi { .. } => "permanent_api_error",
            GatewayError::QueueFull => "queue_full",
            GatewayError::Cancelled => "cancelled",
            GatewayError::ShuttingDown => "shutting_down",
            GatewayError::Unauthorized => "unauthorized",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::BadRequest(_) => "bad_request",
            GatewayError::Encryption(_) => "encryption_error",
            GatewayError::Decryption(_) => "decryption_error",
            GatewayError::Crypto(_) => "crypto_error",
            GatewayError::Database(_) => "database_error",
            GatewayError::Internal(_) => "internal_error",
        }
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(e: sqlx::Error) -> Self {
        tracing::error!("Database error: {e}");
        GatewayError::Database(e.to_string())
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(e: anyhow::Error) -> Self {
        GatewayError::Internal(e.to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::Auth(_) => StatusCode::BAD_REQUEST,
            GatewayError::AuthExpired => StatusCode::UNAUTHORIZED,
            GatewayError::NotConnected(_) => StatusCode::NOT_FOUND,
            GatewayError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::TransientApi { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::PermanentApi { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            GatewayError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Cancelled => StatusCode::CONFLICT,
            GatewayError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Encryption(_)
            | GatewayError::Decryption(_)
            | GatewayError::Crypto(_)
            | GatewayError::Database(_)
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });

        (status, axum::Json(body)).into_response()
    }
}
