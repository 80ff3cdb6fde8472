use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::error::{AppResult, EntitlementError};

use super::models::{
    next_monthly_reset, BillingPlatform, Entitlement, EntitlementStatus, Plan, PlanLimits,
    ReceiptMetadata,
};

/// Dual addressing: an account is reachable by its primary email or its
/// opaque id, and both resolve to the same record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountKey {
    Id(Uuid),
    Email(String),
}

impl AccountKey {
    pub fn parse(raw: &str) -> Self {
        match Uuid::parse_str(raw) {
            Ok(id) => AccountKey::Id(id),
            Err(_) => AccountKey::Email(raw.trim().to_ascii_lowercase()),
        }
    }

    fn id(&self) -> Option<Uuid> {
        match self {
            AccountKey::Id(id) => Some(*id),
            AccountKey::Email(_) => None,
        }
    }

    fn email(&self) -> Option<&str> {
        match self {
            AccountKey::Id(_) => None,
            AccountKey::Email(email) => Some(email),
        }
    }
}

impl std::fmt::Display for AccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccountKey::Id(id) => write!(f, "{id}"),
            AccountKey::Email(email) => write!(f, "{email}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewAccount {
    pub email: String,
    pub id: Option<Uuid>,
}

/// Replacement fields applied by the Platform Reconciler in one update.
/// Usage limits are derived from the plan, never supplied independently.
#[derive(Debug, Clone)]
pub struct EntitlementUpdate {
    pub plan: Plan,
    pub status: EntitlementStatus,
    pub platform: BillingPlatform,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub receipt: Option<ReceiptMetadata>,
}

/// key: entitlement-store -> authoritative account record access
///
/// Counter mutations are expressed as conditional/additive SQL so that
/// concurrent requests compose without caller-side read-modify-write.
#[derive(Clone)]
pub struct EntitlementStore {
    pool: PgPool,
}

impl EntitlementStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, key: &AccountKey) -> AppResult<Entitlement> {
        let row = sqlx::query_as::<_, Entitlement>(
            "SELECT * FROM accounts WHERE id = $1 OR email = $2",
        )
        .bind(key.id())
        .bind(key.email())
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or(EntitlementError::NotFound)
    }

    /// Conditional insert: a duplicate email yields `AlreadyExists` without a
    /// read-then-write race window.
    pub async fn create(&self, new: NewAccount) -> AppResult<Entitlement> {
        let id = new.id.unwrap_or_else(Uuid::new_v4);
        let email = new.email.trim().to_ascii_lowercase();
        let limits = PlanLimits::for_plan(Plan::Free);
        let reset_date = next_monthly_reset(Utc::now());

        let row = sqlx::query_as::<_, Entitlement>(
            r#"
            INSERT INTO accounts (
                id,
                email,
                plan,
                status,
                platform,
                requests_current,
                requests_limit,
                tokens_current,
                tokens_limit,
                reset_date
            ) VALUES ($1, $2, 'free', 'active', 'stripe', 0, $3, 0, $4, $5)
            ON CONFLICT (email) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&email)
        .bind(limits.requests)
        .bind(limits.tokens)
        .bind(reset_date)
        .fetch_optional(&self.pool)
        .await?;

        let entitlement = row.ok_or(EntitlementError::AlreadyExists)?;
        info!(
            account = %email,
            id = %entitlement.id,
            reset_date = %entitlement.reset_date,
            "created account with free entitlement"
        );
        Ok(entitlement)
    }

    /// Zero both counters and advance the reset boundary, but only when the
    /// wall clock has actually passed it. Redundant and racing calls are
    /// no-ops thanks to the `reset_date` guard.
    pub async fn apply_reset(&self, key: &AccountKey, now: DateTime<Utc>) -> AppResult<bool> {
        let next = next_monthly_reset(now);
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET requests_current = 0,
                tokens_current = 0,
                reset_date = $3,
                updated_at = NOW()
            WHERE (id = $1 OR email = $2) AND reset_date < $4
            "#,
        )
        .bind(key.id())
        .bind(key.email())
        .bind(next)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let applied = result.rows_affected() > 0;
        if applied {
            info!(
                account = %key,
                next_reset = %next,
                "monthly usage reset applied, counters zeroed"
            );
        }
        Ok(applied)
    }

    /// Single additive update; concurrent increments for the same account all
    /// land.
    pub async fn increment(
        &self,
        key: &AccountKey,
        request_delta: i64,
        token_delta: i64,
    ) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET requests_current = requests_current + $3,
                tokens_current = tokens_current + $4,
                updated_at = NOW()
            WHERE id = $1 OR email = $2
            "#,
        )
        .bind(key.id())
        .bind(key.email())
        .bind(request_delta)
        .bind(token_delta)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EntitlementError::NotFound);
        }
        info!(
            account = %key,
            request_delta,
            token_delta,
            "incremented usage counters"
        );
        Ok(())
    }

    /// One-shot replacement of plan/status/platform/window/receipt metadata,
    /// used exclusively by the Platform Reconciler. Counters are untouched.
    pub async fn set_entitlement(
        &self,
        key: &AccountKey,
        update: EntitlementUpdate,
    ) -> AppResult<Entitlement> {
        let limits = PlanLimits::for_plan(update.plan);
        let receipt = update.receipt.as_ref();
        let row = sqlx::query_as::<_, Entitlement>(
            r#"
            UPDATE accounts
            SET plan = $3,
                status = $4,
                platform = $5,
                requests_limit = $6,
                tokens_limit = $7,
                period_start = $8,
                period_end = $9,
                receipt_product_id = $10,
                receipt_transaction_id = $11,
                receipt_original_transaction_id = $12,
                receipt_purchased_at = $13,
                receipt_expires_at = $14,
                receipt_validated_at = $15,
                updated_at = NOW()
            WHERE id = $1 OR email = $2
            RETURNING *
            "#,
        )
        .bind(key.id())
        .bind(key.email())
        .bind(update.plan.as_str())
        .bind(update.status.as_str())
        .bind(update.platform.as_str())
        .bind(limits.requests)
        .bind(limits.tokens)
        .bind(update.period_start)
        .bind(update.period_end)
        .bind(receipt.map(|r| r.product_id.clone()))
        .bind(receipt.map(|r| r.transaction_id.clone()))
        .bind(receipt.and_then(|r| r.original_transaction_id.clone()))
        .bind(receipt.map(|r| r.purchased_at))
        .bind(receipt.map(|r| r.expires_at))
        .bind(receipt.map(|r| r.validated_at))
        .fetch_optional(&self.pool)
        .await?;

        let entitlement = row.ok_or(EntitlementError::NotFound)?;
        info!(
            account = %key,
            plan = %entitlement.plan,
            status = %entitlement.status,
            platform = %entitlement.platform,
            period_end = ?entitlement.period_end,
            "entitlement replaced by reconciliation"
        );
        Ok(entitlement)
    }
}
