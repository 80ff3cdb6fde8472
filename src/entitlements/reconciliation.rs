use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::mpsc::{channel, Sender};
use tracing::{debug, error, info};

use crate::config;
use crate::error::{AppResult, EntitlementError};

use super::models::{BillingPlatform, Entitlement, EntitlementStatus, Plan, ReceiptMetadata};
use super::receipts::{plan_for_product, PurchaseRecord, ReceiptVerifier};
use super::store::{AccountKey, EntitlementStore, EntitlementUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookEventKind {
    SubscriptionUpdated,
    SubscriptionDeleted,
    InvoicePaymentSucceeded,
    InvoicePaymentFailed,
}

impl WebhookEventKind {
    pub fn parse(event: &str) -> Option<Self> {
        match event {
            "subscription.updated" => Some(WebhookEventKind::SubscriptionUpdated),
            "subscription.deleted" => Some(WebhookEventKind::SubscriptionDeleted),
            "invoice.payment_succeeded" => Some(WebhookEventKind::InvoicePaymentSucceeded),
            "invoice.payment_failed" => Some(WebhookEventKind::InvoicePaymentFailed),
            _ => None,
        }
    }
}

/// Canonical form of a subscription event after payload parsing.
#[derive(Debug, Clone)]
pub struct SubscriptionEvent {
    pub kind: WebhookEventKind,
    pub plan: Option<Plan>,
    pub status: Option<String>,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
}

fn parse_timestamp(data: &Value, field: &str) -> AppResult<Option<DateTime<Utc>>> {
    match data.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => {
            let raw = value.as_str().ok_or_else(|| {
                EntitlementError::Malformed(format!("{field} must be an RFC 3339 string"))
            })?;
            let parsed = DateTime::parse_from_rfc3339(raw).map_err(|err| {
                EntitlementError::Malformed(format!("invalid {field}: {err}"))
            })?;
            Ok(Some(parsed.with_timezone(&Utc)))
        }
    }
}

/// Malformed payloads are rejected and leave the entitlement untouched.
pub fn parse_subscription_event(event: &str, data: &Value) -> AppResult<SubscriptionEvent> {
    let kind = WebhookEventKind::parse(event)
        .ok_or_else(|| EntitlementError::Malformed(format!("unknown billing event '{event}'")))?;

    let plan = match data.get("plan").and_then(|v| v.as_str()) {
        Some(name) => Some(Plan::parse(name).ok_or_else(|| {
            EntitlementError::Malformed(format!("unknown plan '{name}' in event metadata"))
        })?),
        None => None,
    };

    Ok(SubscriptionEvent {
        kind,
        plan,
        status: data
            .get("status")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        period_start: parse_timestamp(data, "period_start")?,
        period_end: parse_timestamp(data, "period_end")?,
    })
}

/// Replay guard: an event is applied only when it is newer than the stored
/// window or changes the status. Re-delivery of an applied event is a no-op.
fn event_applies(
    current: &Entitlement,
    new_status: EntitlementStatus,
    event_period_end: Option<DateTime<Utc>>,
) -> bool {
    if new_status != current.status {
        return true;
    }
    match (event_period_end, current.period_end) {
        (Some(event_end), Some(stored_end)) => event_end > stored_end,
        (Some(_), None) => true,
        _ => false,
    }
}

/// Ownership rule: a claim from platform X applies only if X already owns the
/// entitlement, the owner's claim has lapsed, or X's subscription expires
/// later than the owner's. The most-recently-expiring subscription wins.
pub fn may_assume_ownership(
    current: &Entitlement,
    claimant: BillingPlatform,
    claim_expiry: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    if current.platform == claimant {
        return true;
    }
    match current.period_end {
        None => true,
        Some(owned_end) if owned_end < now => true,
        Some(owned_end) => claim_expiry.map_or(false, |claimed| claimed > owned_end),
    }
}

/// Latest-expiring purchase with a known product; equal expiries resolve by
/// the greater transaction id so the choice is deterministic.
fn select_latest_purchase(purchases: &[PurchaseRecord]) -> Option<(&PurchaseRecord, Plan)> {
    purchases
        .iter()
        .filter_map(|record| plan_for_product(&record.product_id).map(|plan| (record, plan)))
        .max_by(|(a, _), (b, _)| {
            a.expiry_time
                .cmp(&b.expiry_time)
                .then_with(|| a.transaction_id.cmp(&b.transaction_id))
        })
}

/// key: platform-reconciler -> fold external billing events into the store
///
/// Reconciliation is read-modify-write; the ownership rule plus the replay
/// guard is the correctness mechanism, not locking.
pub struct PlatformReconciler {
    store: EntitlementStore,
    verifier: Arc<dyn ReceiptVerifier>,
}

impl PlatformReconciler {
    pub fn new(store: EntitlementStore, verifier: Arc<dyn ReceiptVerifier>) -> Self {
        Self { store, verifier }
    }

    /// Apply a subscription lifecycle event from the named platform. Returns
    /// `None` when the event was ignored as a replay or a stale claim.
    pub async fn apply_webhook(
        &self,
        key: &AccountKey,
        platform: BillingPlatform,
        event: &str,
        data: &Value,
    ) -> AppResult<Option<Entitlement>> {
        let now = Utc::now();
        let event = parse_subscription_event(event, data)?;
        let current = self.store.get(key).await?;

        let new_status = match event.kind {
            WebhookEventKind::SubscriptionUpdated => {
                if event.status.as_deref() == Some("active") {
                    EntitlementStatus::Active
                } else {
                    EntitlementStatus::Inactive
                }
            }
            WebhookEventKind::SubscriptionDeleted => EntitlementStatus::Cancelled,
            WebhookEventKind::InvoicePaymentSucceeded => EntitlementStatus::Active,
            WebhookEventKind::InvoicePaymentFailed => EntitlementStatus::PastDue,
        };

        if !event_applies(&current, new_status, event.period_end) {
            debug!(account = %key, platform = %platform, "billing event already applied, replay ignored");
            return Ok(None);
        }
        if !may_assume_ownership(&current, platform, event.period_end, now) {
            info!(
                account = %key,
                claimant = %platform,
                owner = %current.platform,
                "billing event from non-owning platform ignored"
            );
            return Ok(None);
        }

        // Receipt metadata belongs to the winning platform only.
        let receipt = if platform == current.platform {
            current.receipt.clone()
        } else {
            None
        };

        let updated = self
            .store
            .set_entitlement(
                key,
                EntitlementUpdate {
                    plan: event.plan.unwrap_or(current.plan),
                    status: new_status,
                    platform,
                    period_start: event.period_start.or(current.period_start),
                    period_end: event.period_end.or(current.period_end),
                    receipt,
                },
            )
            .await?;
        Ok(Some(updated))
    }

    /// Validate-or-restore: verify the opaque receipt blob, pick the winning
    /// purchase, and replace the entitlement when the ownership rule allows.
    pub async fn apply_receipt(
        &self,
        key: &AccountKey,
        platform: BillingPlatform,
        receipt: &str,
    ) -> AppResult<Entitlement> {
        if BASE64.decode(receipt.trim()).is_err() {
            return Err(EntitlementError::Malformed(
                "receipt blob is not valid base64".to_string(),
            ));
        }

        let purchases = self
            .verifier
            .verify(platform, receipt, *config::RECEIPT_VERIFY_ENVIRONMENT)
            .await?;

        let now = Utc::now();
        let current = self.store.get(key).await?;

        let Some((purchase, plan)) = select_latest_purchase(&purchases) else {
            if may_assume_ownership(&current, platform, None, now) {
                self.store
                    .set_entitlement(
                        key,
                        EntitlementUpdate {
                            plan: Plan::Free,
                            status: EntitlementStatus::Active,
                            platform,
                            period_start: None,
                            period_end: None,
                            receipt: None,
                        },
                    )
                    .await?;
                info!(account = %key, platform = %platform, "receipt carried no known product, downgraded to free");
            } else {
                info!(
                    account = %key,
                    claimant = %platform,
                    owner = %current.platform,
                    "unmappable receipt from non-owning platform ignored"
                );
            }
            return Err(EntitlementError::UnknownProduct);
        };

        if let Some(stored) = &current.receipt {
            if stored.transaction_id == purchase.transaction_id
                && stored.expires_at == purchase.expiry_time
            {
                debug!(
                    account = %key,
                    transaction = %purchase.transaction_id,
                    "transaction already applied, receipt replay ignored"
                );
                return Ok(current);
            }
        }

        if !may_assume_ownership(&current, platform, Some(purchase.expiry_time), now) {
            info!(
                account = %key,
                claimant = %platform,
                owner = %current.platform,
                claim_expiry = %purchase.expiry_time,
                "receipt claim expires before the owning subscription, ignored"
            );
            return Ok(current);
        }

        let status = if purchase.expiry_time > now {
            EntitlementStatus::Active
        } else {
            EntitlementStatus::Expired
        };

        self.store
            .set_entitlement(
                key,
                EntitlementUpdate {
                    plan,
                    status,
                    platform,
                    period_start: Some(purchase.purchase_time),
                    period_end: Some(purchase.expiry_time),
                    receipt: Some(ReceiptMetadata {
                        product_id: purchase.product_id.clone(),
                        transaction_id: purchase.transaction_id.clone(),
                        original_transaction_id: purchase.original_transaction_id.clone(),
                        purchased_at: purchase.purchase_time,
                        expires_at: purchase.expiry_time,
                        validated_at: now,
                    }),
                },
            )
            .await
    }

    /// Server-to-server renewal/cancellation notifications from the mobile
    /// storefronts are logged and applied like webhook events.
    pub async fn apply_store_notification(
        &self,
        key: &AccountKey,
        platform: BillingPlatform,
        event: &str,
        data: &Value,
    ) -> AppResult<Option<Entitlement>> {
        if platform == BillingPlatform::Stripe {
            return Err(EntitlementError::Malformed(
                "store notifications must come from a mobile storefront".to_string(),
            ));
        }
        info!(account = %key, platform = %platform, event = %event, "store server notification received");
        self.apply_webhook(key, platform, event, data).await
    }
}

/// key: reconciliation-worker -> decouple webhook delivery from application
#[derive(Debug)]
pub enum ReconciliationJob {
    PlatformWebhook {
        account: String,
        event: String,
        payload: Value,
    },
    StoreNotification {
        account: String,
        platform: BillingPlatform,
        event: String,
        payload: Value,
    },
}

#[derive(Clone)]
pub struct ReconciliationHandle {
    sender: Sender<ReconciliationJob>,
}

impl ReconciliationHandle {
    pub async fn dispatch(&self, job: ReconciliationJob) -> anyhow::Result<()> {
        self.sender
            .send(job)
            .await
            .map_err(|err| anyhow::anyhow!("failed to enqueue reconciliation job: {err}"))
    }
}

pub fn start_reconciliation_worker(
    pool: PgPool,
    verifier: Arc<dyn ReceiptVerifier>,
) -> ReconciliationHandle {
    let (tx, mut rx) = channel(64);
    tokio::spawn(async move {
        let reconciler = PlatformReconciler::new(EntitlementStore::new(pool), verifier);
        while let Some(job) = rx.recv().await {
            match job {
                ReconciliationJob::PlatformWebhook {
                    account,
                    event,
                    payload,
                } => {
                    let key = AccountKey::parse(&account);
                    match reconciler
                        .apply_webhook(&key, BillingPlatform::Stripe, &event, &payload)
                        .await
                    {
                        Ok(Some(entitlement)) => info!(
                            account = %key,
                            event = %event,
                            plan = %entitlement.plan,
                            status = %entitlement.status,
                            "billing event reconciled"
                        ),
                        Ok(None) => debug!(account = %key, event = %event, "billing event ignored"),
                        Err(err) => error!(
                            ?err,
                            account = %key,
                            event = %event,
                            "failed to reconcile billing event"
                        ),
                    }
                }
                ReconciliationJob::StoreNotification {
                    account,
                    platform,
                    event,
                    payload,
                } => {
                    let key = AccountKey::parse(&account);
                    match reconciler
                        .apply_store_notification(&key, platform, &event, &payload)
                        .await
                    {
                        Ok(Some(entitlement)) => info!(
                            account = %key,
                            platform = %platform,
                            event = %event,
                            status = %entitlement.status,
                            "store notification reconciled"
                        ),
                        Ok(None) => {
                            debug!(account = %key, platform = %platform, event = %event, "store notification ignored")
                        }
                        Err(err) => error!(
                            ?err,
                            account = %key,
                            platform = %platform,
                            event = %event,
                            "failed to reconcile store notification"
                        ),
                    }
                }
            }
        }
    });

    ReconciliationHandle { sender: tx }
}
