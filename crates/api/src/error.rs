//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use shiftwise_billing::BillingError;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Validation errors
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Webhook signature failures
    #[error("Invalid webhook signature")]
    BadSignature,

    // Resource errors
    #[error("Resource not found")]
    NotFound,

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::BadSignature => (
                StatusCode::BAD_REQUEST,
                "INVALID_SIGNATURE",
                self.to_string(),
            ),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),
            // Detail stays in tracing; clients get a generic message
            ApiError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "Database error".to_string(),
            ),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                self.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound,
            _ => ApiError::Database(err.to_string()),
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match &err {
            BillingError::InvalidInput(msg) | BillingError::InvalidPlan(msg) => {
                ApiError::BadRequest(msg.clone())
            }
            BillingError::WebhookSignatureInvalid => ApiError::BadSignature,
            BillingError::NotFound(_)
            | BillingError::CustomerNotFound(_)
            | BillingError::SubscriptionNotFound(_) => ApiError::NotFound,
            BillingError::Database(msg) => {
                tracing::error!(error = %msg, "Billing database error");
                ApiError::Database(msg.clone())
            }
            // Upstream detail is logged, never surfaced to clients
            BillingError::StripeApi(msg) => {
                tracing::error!(error = %msg, "Stripe API error");
                ApiError::Internal
            }
            BillingError::Config(msg) | BillingError::Internal(msg) => {
                tracing::error!(error = %msg, "Billing internal error");
                ApiError::Internal
            }
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billing_error_mapping() {
        let err: ApiError = BillingError::InvalidInput("bad plan".to_string()).into();
        assert!(matches!(err, ApiError::BadRequest(_)));

        let err: ApiError = BillingError::WebhookSignatureInvalid.into();
        assert!(matches!(err, ApiError::BadSignature));

        let err: ApiError = BillingError::StripeApi("boom".to_string()).into();
        assert!(matches!(err, ApiError::Internal));

        let err: ApiError = BillingError::NotFound("sub_123".to_string()).into();
        assert!(matches!(err, ApiError::NotFound));
    }
}
