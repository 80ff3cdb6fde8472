use axum::{extract::Extension, http::StatusCode, Json};
use serde::Deserialize;
use serde_json::Value;

use crate::entitlements::models::BillingPlatform;
use crate::entitlements::reconciliation::{ReconciliationHandle, ReconciliationJob};

/// key: webhooks-billing -> card-billing platform entrypoint
///
/// Signature validation happens in the transport; payloads arriving here are
/// already parsed. Handlers only enqueue; the replay guard downstream makes
/// at-least-once delivery safe.
#[derive(Debug, Deserialize)]
pub struct BillingWebhookRequest {
    pub account: String,
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

pub async fn billing_webhook(
    Extension(reconciliation): Extension<ReconciliationHandle>,
    Json(payload): Json<BillingWebhookRequest>,
) -> Result<StatusCode, StatusCode> {
    match payload.event.as_str() {
        "subscription.updated"
        | "subscription.deleted"
        | "invoice.payment_succeeded"
        | "invoice.payment_failed" => {
            reconciliation
                .dispatch(ReconciliationJob::PlatformWebhook {
                    account: payload.account,
                    event: payload.event,
                    payload: payload.data,
                })
                .await
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
            Ok(StatusCode::ACCEPTED)
        }
        _ => Ok(StatusCode::ACCEPTED),
    }
}

/// key: webhooks-store -> server-to-server storefront notifications
#[derive(Debug, Deserialize)]
pub struct StoreNotificationRequest {
    pub account: String,
    pub platform: String,
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

pub async fn store_notification(
    Extension(reconciliation): Extension<ReconciliationHandle>,
    Json(payload): Json<StoreNotificationRequest>,
) -> Result<StatusCode, StatusCode> {
    let platform = match BillingPlatform::parse(&payload.platform) {
        Some(BillingPlatform::Stripe) | None => return Err(StatusCode::BAD_REQUEST),
        Some(platform) => platform,
    };

    reconciliation
        .dispatch(ReconciliationJob::StoreNotification {
            account: payload.account,
            platform,
            event: payload.event,
            payload: payload.data,
        })
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(StatusCode::ACCEPTED)
}
