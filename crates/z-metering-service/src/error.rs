//! API error types and responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use z_metering_core::MeteringError;

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Unauthorized - missing or invalid credentials.
    #[error("unauthorized")]
    Unauthorized,

    /// Forbidden - valid credentials but no access to the target user.
    #[error("forbidden")]
    Forbidden,

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Bad request - invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Conflict with the current state of a resource.
    #[error("conflict: {message}")]
    Conflict {
        /// Machine-readable reason.
        code: &'static str,
        /// Human-readable message.
        message: String,
    },

    /// Insufficient credits.
    #[error("insufficient credits: remaining={remaining}, required={required}")]
    InsufficientCredits {
        /// Credits left in the period.
        remaining: u64,
        /// Required amount.
        required: u64,
    },

    /// No subscription permits metering.
    #[error("no active subscription")]
    NoActiveSubscription,

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match &self {
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                self.to_string(),
                None,
            ),
            Self::Forbidden => (StatusCode::FORBIDDEN, "forbidden", self.to_string(), None),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone(), None),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone(), None),
            Self::Conflict { code, message } => (StatusCode::CONFLICT, *code, message.clone(), None),
            Self::InsufficientCredits {
                remaining,
                required,
            } => (
                StatusCode::PAYMENT_REQUIRED,
                "insufficient_credits",
                self.to_string(),
                Some(serde_json::json!({
                    "remaining": remaining,
                    "required": required
                })),
            ),
            Self::NoActiveSubscription => (
                StatusCode::PAYMENT_REQUIRED,
                "no_active_subscription",
                self.to_string(),
                None,
            ),
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                    None,
                )
            }
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
                details,
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<MeteringError> for ApiError {
    fn from(err: MeteringError) -> Self {
        match err {
            MeteringError::InsufficientCredits {
                remaining,
                required,
            } => Self::InsufficientCredits {
                remaining,
                required,
            },
            MeteringError::NoActiveSubscription { .. } => Self::NoActiveSubscription,
            MeteringError::Forbidden { .. } => Self::Forbidden,
            MeteringError::SubscriptionNotFound { .. }
            | MeteringError::ReservationNotFound { .. }
            | MeteringError::PlanNotFound(_) => Self::NotFound(err.to_string()),
            MeteringError::AlreadyFinalized { .. }
            | MeteringError::AccountCreationConflict { .. }
            | MeteringError::SubscriptionEventOutOfOrder { .. }
            | MeteringError::InvalidTransition { .. } => Self::Conflict {
                code: err.code(),
                message: err.to_string(),
            },
            MeteringError::InvalidPlan(_)
            | MeteringError::InvalidCost(_)
            | MeteringError::InvalidPeriod { .. }
            | MeteringError::InvalidId(_) => Self::BadRequest(err.to_string()),
            MeteringError::Storage(msg) => Self::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denials_map_to_payment_required() {
        let insufficient: ApiError = MeteringError::InsufficientCredits {
            remaining: 3,
            required: 5,
        }
        .into();
        assert_eq!(
            insufficient.into_response().status(),
            StatusCode::PAYMENT_REQUIRED
        );

        let inactive: ApiError = MeteringError::NoActiveSubscription {
            user_id: "u".into(),
        }
        .into();
        assert_eq!(inactive.into_response().status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[test]
    fn forbidden_and_not_found() {
        let forbidden: ApiError = MeteringError::Forbidden {
            user_id: "u".into(),
        }
        .into();
        assert_eq!(forbidden.into_response().status(), StatusCode::FORBIDDEN);

        let missing: ApiError = MeteringError::PlanNotFound("gold".into()).into();
        assert_eq!(missing.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn storage_failures_are_internal() {
        let err: ApiError = MeteringError::Storage("disk full".into()).into();
        assert_eq!(
            err.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
