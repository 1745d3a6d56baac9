//! HTTP mapping of [`BookingError`].

use crate::error::{BookingError, ErrorCategory};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// Error returned by every handler.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    category: ErrorCategory,
    retryable: bool,
    guidance: &'static str,
}

impl ApiError {
    /// A 400 for input that never reached the core
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "BAD_REQUEST",
            message: message.into(),
            category: ErrorCategory::Validation,
            retryable: false,
            guidance: "fix the request",
        }
    }

    /// HTTP status of this error
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }
}

/// HTTP status for a domain error.
const fn status_for(error: &BookingError) -> StatusCode {
    match error {
        BookingError::InvalidLocation { .. }
        | BookingError::InvalidQuote { .. }
        | BookingError::InvalidRequest(_)
        | BookingError::RefundExceedsCaptured { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        BookingError::NotFound { .. } => StatusCode::NOT_FOUND,
        BookingError::Unauthorized { .. } => StatusCode::FORBIDDEN,
        BookingError::IllegalTransition { .. }
        | BookingError::ConcurrentModification { .. }
        | BookingError::StateChangedConcurrently { .. }
        | BookingError::DisputeClosed(_)
        | BookingError::DisputeWindowExpired { .. }
        | BookingError::CaptureWindowExpired { .. } => StatusCode::CONFLICT,
        BookingError::PaymentDeclined { .. } => StatusCode::PAYMENT_REQUIRED,
        BookingError::PaymentProviderUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        BookingError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<BookingError> for ApiError {
    fn from(error: BookingError) -> Self {
        let status = status_for(&error);
        // Storage details stay in the logs.
        let message = match &error {
            BookingError::Storage(_) => "internal storage error".to_string(),
            other => other.to_string(),
        };
        Self {
            status,
            code: error.code(),
            message,
            category: error.category(),
            retryable: error.is_retryable(),
            guidance: error.guidance(),
        }
    }
}

/// Error response body (JSON).
#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: &'a str,
    category: ErrorCategory,
    retryable: bool,
    guidance: &'a str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, code = self.code, message = %self.message, "request failed");
        } else {
            tracing::debug!(status = %self.status, code = self.code, message = %self.message, "request rejected");
        }

        let body = ErrorBody {
            code: self.code,
            message: &self.message,
            category: self.category,
            retryable: self.retryable,
            guidance: self.guidance,
        };
        (self.status, Json(body)).into_response()
    }
}
