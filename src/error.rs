use axum::{http::StatusCode, response::{IntoResponse, Response}};
use thiserror::Error;

use crate::entitlements::models::Plan;

#[derive(Debug, Error)]
pub enum EntitlementError {
    #[error("account not found")]
    NotFound,
    #[error("account already exists")]
    AlreadyExists,
    #[error("usage limit exceeded")]
    UsageLimitExceeded,
    #[error("plan {0} or higher required")]
    InsufficientPlan(Plan),
    #[error("subscription expired, renewal required")]
    SubscriptionExpired,
    #[error("receipt verification failed: {0}")]
    VerificationFailed(String),
    #[error("receipt does not map to a known plan")]
    UnknownProduct,
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),
    #[error("upstream completion failed: {0}")]
    Upstream(String),
    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl IntoResponse for EntitlementError {
    fn into_response(self) -> Response {
        let status = match self {
            EntitlementError::NotFound => StatusCode::NOT_FOUND,
            EntitlementError::AlreadyExists => StatusCode::CONFLICT,
            EntitlementError::UsageLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            EntitlementError::InsufficientPlan(_) => StatusCode::FORBIDDEN,
            EntitlementError::SubscriptionExpired => StatusCode::PAYMENT_REQUIRED,
            EntitlementError::VerificationFailed(_) => StatusCode::BAD_GATEWAY,
            EntitlementError::UnknownProduct => StatusCode::UNPROCESSABLE_ENTITY,
            EntitlementError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            EntitlementError::Upstream(_) => StatusCode::BAD_GATEWAY,
            EntitlementError::Malformed(_) => StatusCode::BAD_REQUEST,
        };
        tracing::error!(?self);
        (status, self.to_string()).into_response()
    }
}

pub type AppResult<T> = Result<T, EntitlementError>;
