//! Error taxonomy and the HTTP error envelope.
//!
//! Machine-readable `error_code` strings are the contract; Rust type names
//! are not. Validation and throttling errors carry remediation details back
//! to the caller; anything unclassified becomes INTERNAL_ERROR with the
//! original message exposed only in development builds.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::{json, Value};

/// Machine-readable error codes (spec'd API contract).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    FileTooLarge,
    InvalidFileType,
    ImageTooSmall,
    ImageQualityTooLow,
    InvalidImage,
    RateLimitExceeded,
    OcrFailed,
    LlmBudgetExceeded,
    NormalizationFailed,
    SessionNotFound,
    UnverifiedLines,
    SessionAlreadyCommitted,
    InsufficientStock,
    ForbiddenPrivilegedAction,
    SignatureMismatch,
    NotFound,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::FileTooLarge => "FILE_TOO_LARGE",
            ErrorCode::InvalidFileType => "INVALID_FILE_TYPE",
            ErrorCode::ImageTooSmall => "IMAGE_TOO_SMALL",
            ErrorCode::ImageQualityTooLow => "IMAGE_QUALITY_TOO_LOW",
            ErrorCode::InvalidImage => "INVALID_IMAGE",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::OcrFailed => "OCR_FAILED",
            ErrorCode::LlmBudgetExceeded => "LLM_BUDGET_EXCEEDED",
            ErrorCode::NormalizationFailed => "NORMALIZATION_FAILED",
            ErrorCode::SessionNotFound => "SESSION_NOT_FOUND",
            ErrorCode::UnverifiedLines => "UNVERIFIED_LINES",
            ErrorCode::SessionAlreadyCommitted => "SESSION_ALREADY_COMMITTED",
            ErrorCode::InsufficientStock => "INSUFFICIENT_STOCK",
            ErrorCode::ForbiddenPrivilegedAction => "FORBIDDEN_PRIVILEGED_ACTION",
            ErrorCode::SignatureMismatch => "SIGNATURE_MISMATCH",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            ErrorCode::FileTooLarge
            | ErrorCode::InvalidFileType
            | ErrorCode::ImageTooSmall
            | ErrorCode::ImageQualityTooLow
            | ErrorCode::InvalidImage
            | ErrorCode::UnverifiedLines => StatusCode::BAD_REQUEST,
            ErrorCode::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::ForbiddenPrivilegedAction => StatusCode::FORBIDDEN,
            ErrorCode::SessionNotFound | ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::SessionAlreadyCommitted | ErrorCode::InsufficientStock => {
                StatusCode::CONFLICT
            }
            ErrorCode::OcrFailed
            | ErrorCode::LlmBudgetExceeded
            | ErrorCode::NormalizationFailed
            | ErrorCode::SignatureMismatch
            | ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Pipeline error carrying the code, a user-facing message, and optional
/// structured details (counts, limits, remediation hints).
#[derive(Debug)]
pub struct PipelineError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<Value>,
}

impl PipelineError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: None }
    }

    pub fn with_details(code: ErrorCode, message: impl Into<String>, details: Value) -> Self {
        Self { code, message: message.into(), details: Some(details) }
    }

    pub fn rate_limited(current_count: i64, limit: i64, retry_after_seconds: i64) -> Self {
        Self::with_details(
            ErrorCode::RateLimitExceeded,
            format!("Rate limit exceeded: {current_count}/{limit} uploads in window"),
            json!({
                "current_count": current_count,
                "limit": limit,
                "retry_after_seconds": retry_after_seconds,
            }),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for PipelineError {}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        // Keep an already-classified error intact across anyhow boundaries.
        match err.downcast::<PipelineError>() {
            Ok(e) => e,
            Err(err) => PipelineError::internal(err.to_string()),
        }
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        PipelineError::internal(format!("database error: {err}"))
    }
}

/// HTTP-facing error. Wraps a [`PipelineError`] together with the request id
/// and the development flag that controls INTERNAL_ERROR verbosity.
#[derive(Debug)]
pub struct ApiError {
    pub inner: PipelineError,
    pub request_id: Option<String>,
    pub expose_internal: bool,
}

impl ApiError {
    pub fn new(inner: PipelineError) -> Self {
        Self { inner, request_id: None, expose_internal: false }
    }
}

impl From<PipelineError> for ApiError {
    fn from(inner: PipelineError) -> Self {
        Self::new(inner)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(PipelineError::from(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.inner.code;
        let message = if code == ErrorCode::InternalError && !self.expose_internal {
            "Internal server error".to_string()
        } else {
            self.inner.message.clone()
        };

        let mut body = json!({
            "status": "error",
            "error_code": code.as_str(),
            "message": message,
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let Some(details) = &self.inner.details {
            body["details"] = details.clone();
        }
        if let Some(request_id) = &self.request_id {
            body["request_id"] = json!(request_id);
        }

        let mut response = (code.http_status(), Json(body)).into_response();
        if code == ErrorCode::RateLimitExceeded {
            let retry_after = self
                .inner
                .details
                .as_ref()
                .and_then(|d| d.get("retry_after_seconds"))
                .and_then(|v| v.as_i64())
                .unwrap_or(3600);
            if let Ok(value) = retry_after.to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}
