use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::warn;
use uuid::Uuid;

use crate::config;
use crate::error::AppResult;

/// One immutable row per completed metered request.
#[derive(Debug, Clone, FromRow)]
pub struct UsageEvent {
    pub account_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub event_id: Uuid,
    pub provider: String,
    pub model: String,
    pub tokens: i64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone)]
pub struct NewUsageEvent {
    pub provider: String,
    pub model: String,
    pub tokens: i64,
}

impl NewUsageEvent {
    pub fn derived_cost(&self) -> f64 {
        (self.tokens as f64 / 1000.0) * *config::USAGE_COST_PER_1K_TOKENS
    }
}

/// key: usage-ledger -> append-only metering trail
///
/// The ledger is analytics data. Losing a row must never fail the request
/// that produced it, which is the opposite contract from the entitlement
/// counters.
#[derive(Clone)]
pub struct UsageLedger {
    pool: PgPool,
}

impl UsageLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn append(&self, account_id: Uuid, event: &NewUsageEvent) -> AppResult<UsageEvent> {
        let row = sqlx::query_as::<_, UsageEvent>(
            r#"
            INSERT INTO usage_events (
                account_id,
                occurred_at,
                event_id,
                provider,
                model,
                tokens,
                cost_usd
            ) VALUES ($1, NOW(), $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(account_id)
        .bind(Uuid::new_v4())
        .bind(&event.provider)
        .bind(&event.model)
        .bind(event.tokens)
        .bind(event.derived_cost())
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    /// Append wrapper that logs and swallows failures.
    pub async fn record(&self, account_id: Uuid, event: NewUsageEvent) {
        if let Err(err) = self.append(account_id, &event).await {
            warn!(
                ?err,
                account = %account_id,
                provider = %event.provider,
                model = %event.model,
                tokens = event.tokens,
                "usage ledger write failed, metering row dropped"
            );
        }
    }

    /// Range query ordered ascending; rollups are computed by the caller.
    pub async fn query(
        &self,
        account_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AppResult<Vec<UsageEvent>> {
        let rows = sqlx::query_as::<_, UsageEvent>(
            r#"
            SELECT * FROM usage_events
            WHERE account_id = $1
              AND occurred_at >= $2
              AND occurred_at <= $3
            ORDER BY occurred_at ASC
            "#,
        )
        .bind(account_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
