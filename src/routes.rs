use axum::{
    routing::{get, post},
    Router,
};

use crate::entitlements::api::{
    create_completion, register_account, submit_receipt, usage_history, usage_summary,
};
use crate::webhooks::{billing_webhook, store_notification};

pub fn api_routes() -> Router {
    Router::new()
        .route("/v1/accounts", post(register_account))
        .route("/v1/accounts/:key/usage", get(usage_summary))
        .route("/v1/accounts/:key/usage/history", get(usage_history))
        .route("/v1/accounts/:key/completions", post(create_completion))
        .route("/v1/accounts/:key/receipts", post(submit_receipt))
        .route("/webhooks/billing", post(billing_webhook))
        .route("/webhooks/store", post(store_notification))
}
