use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::completions::CompletionExecutor;
use crate::error::{AppResult, EntitlementError};
use crate::usage::{NewUsageEvent, UsageEvent, UsageLedger};

use super::gate::AdmissionGate;
use super::models::{BillingPlatform, Plan, UsageSummary};
use super::receipts::ReceiptVerifier;
use super::reconciliation::PlatformReconciler;
use super::store::{AccountKey, EntitlementStore, NewAccount};

/// key: entitlement-api -> rest endpoints
pub async fn register_account(
    Extension(store): Extension<EntitlementStore>,
    Json(payload): Json<RegisterAccountRequest>,
) -> AppResult<(StatusCode, Json<AccountEnvelope>)> {
    let email = payload.email.trim();
    if email.is_empty() || !email.contains('@') {
        return Err(EntitlementError::Malformed(
            "a valid email address is required".to_string(),
        ));
    }

    let entitlement = store
        .create(NewAccount {
            email: email.to_string(),
            id: payload.id,
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(AccountEnvelope {
            id: entitlement.id,
            email: entitlement.email.clone(),
            usage: entitlement.summary(),
        }),
    ))
}

pub async fn usage_summary(
    Extension(store): Extension<EntitlementStore>,
    Path(key): Path<String>,
) -> AppResult<Json<UsageSummary>> {
    let key = AccountKey::parse(&key);
    store.apply_reset(&key, Utc::now()).await?;
    let entitlement = store.get(&key).await?;
    Ok(Json(entitlement.summary()))
}

pub async fn usage_history(
    Extension(store): Extension<EntitlementStore>,
    Extension(ledger): Extension<UsageLedger>,
    Path(key): Path<String>,
    Query(params): Query<UsageHistoryParams>,
) -> AppResult<Json<UsageHistoryResponse>> {
    let key = AccountKey::parse(&key);
    let entitlement = store.get(&key).await?;

    let end = params.end.unwrap_or_else(Utc::now);
    let start = params.start.unwrap_or(end - Duration::days(30));
    let events = ledger.query(entitlement.id, start, end).await?;

    let mut totals = UsageRollup::default();
    let mut by_day: BTreeMap<String, UsageRollup> = BTreeMap::new();
    let mut by_provider: BTreeMap<String, UsageRollup> = BTreeMap::new();
    let mut by_model: BTreeMap<String, UsageRollup> = BTreeMap::new();
    for event in &events {
        totals.add(event);
        by_day
            .entry(event.occurred_at.date_naive().to_string())
            .or_default()
            .add(event);
        by_provider
            .entry(event.provider.clone())
            .or_default()
            .add(event);
        by_model.entry(event.model.clone()).or_default().add(event);
    }

    Ok(Json(UsageHistoryResponse {
        start,
        end,
        totals,
        by_day,
        by_provider,
        by_model,
    }))
}

/// The metered request path: admit, run the external completion, settle.
pub async fn create_completion(
    Extension(gate): Extension<AdmissionGate>,
    Extension(executor): Extension<Arc<dyn CompletionExecutor>>,
    Path(key): Path<String>,
    Json(payload): Json<CompletionRequest>,
) -> AppResult<Json<CompletionResponse>> {
    let key = AccountKey::parse(&key);
    let entitlement = gate.admit(&key, payload.min_plan).await?;

    let outcome = executor
        .execute(&payload.provider, &payload.model, &payload.prompt)
        .await
        .map_err(|err| EntitlementError::Upstream(err.to_string()))?;

    gate.settle(
        &entitlement,
        NewUsageEvent {
            provider: payload.provider,
            model: payload.model,
            tokens: outcome.tokens_consumed,
        },
    )
    .await?;

    Ok(Json(CompletionResponse {
        output: outcome.output,
        tokens_consumed: outcome.tokens_consumed,
    }))
}

pub async fn submit_receipt(
    Extension(store): Extension<EntitlementStore>,
    Extension(verifier): Extension<Arc<dyn ReceiptVerifier>>,
    Path(key): Path<String>,
    Json(payload): Json<ReceiptUploadRequest>,
) -> AppResult<Json<UsageSummary>> {
    let key = AccountKey::parse(&key);
    let reconciler = PlatformReconciler::new(store, verifier);
    let entitlement = reconciler
        .apply_receipt(&key, payload.platform, &payload.receipt)
        .await?;
    Ok(Json(entitlement.summary()))
}

#[derive(Debug, Deserialize)]
pub struct RegisterAccountRequest {
    pub email: String,
    #[serde(default)]
    pub id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct AccountEnvelope {
    pub id: Uuid,
    pub email: String,
    pub usage: UsageSummary,
}

#[derive(Debug, Deserialize)]
pub struct UsageHistoryParams {
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct UsageRollup {
    pub requests: i64,
    pub tokens: i64,
    pub cost_usd: f64,
}

impl UsageRollup {
    fn add(&mut self, event: &UsageEvent) {
        self.requests += 1;
        self.tokens += event.tokens;
        self.cost_usd += event.cost_usd;
    }
}

#[derive(Debug, Serialize)]
pub struct UsageHistoryResponse {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub totals: UsageRollup,
    pub by_day: BTreeMap<String, UsageRollup>,
    pub by_provider: BTreeMap<String, UsageRollup>,
    pub by_model: BTreeMap<String, UsageRollup>,
}

#[derive(Debug, Deserialize)]
pub struct CompletionRequest {
    pub provider: String,
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub min_plan: Option<Plan>,
}

#[derive(Debug, Serialize)]
pub struct CompletionResponse {
    pub output: String,
    pub tokens_consumed: i64,
}

#[derive(Debug, Deserialize)]
pub struct ReceiptUploadRequest {
    pub platform: BillingPlatform,
    pub receipt: String,
}
