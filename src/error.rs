use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use crate::ledger::LedgerError;
use crate::store::StoreError;

/// Stable, machine-readable failure codes returned to callers and recorded
/// in telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unauthenticated,
    RateLimitExceeded,
    InsufficientCredit,
    ValidationFailed,
    /// Retried internally. Only ever appears in telemetry metadata.
    BackendTransient,
    BackendTerminal,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::InsufficientCredit => "INSUFFICIENT_CREDIT",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::BackendTransient => "BACKEND_TRANSIENT",
            Self::BackendTerminal => "BACKEND_TERMINAL",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified application error type. Every variant maps onto exactly one
/// [`ErrorCode`].
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Authentication required: {0}")]
    Unauthenticated(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("Insufficient credit: {required} required, {available} available")]
    InsufficientCredit { required: u64, available: u64 },

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Generation failed: {0}")]
    BackendTerminal(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: ErrorCode,
    message: String,
    r#type: &'static str,
}

impl AppError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Unauthenticated(_) => ErrorCode::Unauthenticated,
            Self::RateLimitExceeded(_) => ErrorCode::RateLimitExceeded,
            Self::InsufficientCredit { .. } => ErrorCode::InsufficientCredit,
            Self::ValidationFailed(_) => ErrorCode::ValidationFailed,
            Self::BackendTerminal(_) => ErrorCode::BackendTerminal,
            Self::Database(_) | Self::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::RateLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::InsufficientCredit { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::ValidationFailed(_) => StatusCode::BAD_REQUEST,
            Self::BackendTerminal(_) => StatusCode::BAD_GATEWAY,
            Self::Database(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            Self::Unauthenticated(_) => "authentication_error",
            Self::RateLimitExceeded(_) => "rate_limit_error",
            Self::InsufficientCredit { .. } => "billing_error",
            Self::ValidationFailed(_) => "invalid_request_error",
            Self::BackendTerminal(_) => "api_error",
            Self::Database(_) | Self::Internal(_) => "server_error",
        }
    }

    /// Message shown to the caller. Server-side failures never leak their
    /// detail; it is logged instead.
    fn public_message(&self) -> String {
        match self {
            Self::Database(_) | Self::Internal(_) => "An internal error occurred".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.code(),
                message: self.public_message(),
                r#type: self.error_type(),
            },
        };
        (status, axum::Json(body)).into_response()
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        tracing::error!(error = %err, "Database error");
        Self::Database(err.to_string())
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        tracing::error!(error = %err, "Store error");
        Self::Database(err.to_string())
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Insufficient {
                required,
                available,
            } => Self::InsufficientCredit {
                required,
                available,
            },
            LedgerError::Store(e) => e.into(),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::ValidationFailed(format!("JSON error: {err}"))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(err: AppError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_rate_limit_response_shape() {
        let (status, body) = body_json(AppError::RateLimitExceeded("slow down".into())).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"]["code"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(body["error"]["type"], "rate_limit_error");
        assert!(body["error"]["message"].as_str().unwrap().contains("slow down"));
    }

    #[tokio::test]
    async fn test_internal_errors_hide_detail() {
        let (status, body) = body_json(AppError::Database("disk I/O error".into())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["code"], "INTERNAL");
        assert!(!body["error"]["message"].as_str().unwrap().contains("disk"));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            AppError::Unauthenticated("x".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::InsufficientCredit {
                required: 30,
                available: 10
            }
            .status_code(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            AppError::ValidationFailed("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::BackendTerminal("x".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_ledger_insufficient_maps_to_code() {
        let err: AppError = LedgerError::Insufficient {
            required: 30,
            available: 10,
        }
        .into();
        assert_eq!(err.code(), ErrorCode::InsufficientCredit);
        assert_eq!(
            err.to_string(),
            "Insufficient credit: 30 required, 10 available"
        );
    }

    #[test]
    fn test_error_code_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::BackendTransient).unwrap();
        assert_eq!(json, "\"BACKEND_TRANSIENT\"");
        assert_eq!(ErrorCode::BackendTransient.to_string(), "BACKEND_TRANSIENT");
    }
}
