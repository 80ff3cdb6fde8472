use chrono::{DateTime, Datelike, Months, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

/// key: entitlement-plan -> ordered subscription tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Pro,
    Enterprise,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Pro => "pro",
            Plan::Enterprise => "enterprise",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "free" => Some(Plan::Free),
            "pro" => Some(Plan::Pro),
            "enterprise" => Some(Plan::Enterprise),
            _ => None,
        }
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// key: entitlement-limits -> fixed per-plan quota table
///
/// Limits are only ever derived from the plan; a plan change is the single
/// way the stored limit columns move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanLimits {
    pub requests: i64,
    pub tokens: i64,
}

impl PlanLimits {
    pub fn for_plan(plan: Plan) -> Self {
        match plan {
            Plan::Free => Self {
                requests: 100,
                tokens: 10_000,
            },
            Plan::Pro => Self {
                requests: 5_000,
                tokens: 1_000_000,
            },
            // -1 means unlimited
            Plan::Enterprise => Self {
                requests: -1,
                tokens: -1,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementStatus {
    Active,
    Inactive,
    Cancelled,
    PastDue,
    Expired,
}

impl EntitlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntitlementStatus::Active => "active",
            EntitlementStatus::Inactive => "inactive",
            EntitlementStatus::Cancelled => "cancelled",
            EntitlementStatus::PastDue => "past_due",
            EntitlementStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(EntitlementStatus::Active),
            "inactive" => Some(EntitlementStatus::Inactive),
            "cancelled" => Some(EntitlementStatus::Cancelled),
            "past_due" => Some(EntitlementStatus::PastDue),
            "expired" => Some(EntitlementStatus::Expired),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntitlementStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// key: entitlement-platform -> which external system owns renewal authority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingPlatform {
    Stripe,
    Ios,
    Android,
}

impl BillingPlatform {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingPlatform::Stripe => "stripe",
            BillingPlatform::Ios => "ios",
            BillingPlatform::Android => "android",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "stripe" => Some(BillingPlatform::Stripe),
            "ios" => Some(BillingPlatform::Ios),
            "android" => Some(BillingPlatform::Android),
            _ => None,
        }
    }
}

impl std::fmt::Display for BillingPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Receipt metadata for the currently-winning store purchase. At most one
/// platform's claim is stored per account at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptMetadata {
    pub product_id: String,
    pub transaction_id: String,
    pub original_transaction_id: Option<String>,
    pub purchased_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub validated_at: DateTime<Utc>,
}

/// key: entitlement-record -> authoritative per-account snapshot
#[derive(Debug, Clone, Serialize)]
pub struct Entitlement {
    pub id: Uuid,
    pub email: String,
    pub plan: Plan,
    pub status: EntitlementStatus,
    pub platform: BillingPlatform,
    pub requests_current: i64,
    pub requests_limit: i64,
    pub tokens_current: i64,
    pub tokens_limit: i64,
    pub reset_date: DateTime<Utc>,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub receipt: Option<ReceiptMetadata>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entitlement {
    /// Paid access is only live while the platform-supplied window holds.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        if self.status != EntitlementStatus::Active {
            return false;
        }
        if let Some(end) = self.period_end {
            if end < now {
                return false;
            }
        }
        true
    }

    pub fn summary(&self) -> UsageSummary {
        UsageSummary {
            plan: self.plan,
            status: self.status,
            requests: UsageCounter {
                current: self.requests_current,
                limit: self.requests_limit,
            },
            tokens: UsageCounter {
                current: self.tokens_current,
                limit: self.tokens_limit,
            },
            reset_date: self.reset_date,
            period_end: self.period_end,
        }
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Entitlement {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let plan: String = row.try_get("plan")?;
        let status: String = row.try_get("status")?;
        let platform: String = row.try_get("platform")?;

        let receipt_product_id: Option<String> = row.try_get("receipt_product_id")?;
        let receipt_transaction_id: Option<String> = row.try_get("receipt_transaction_id")?;
        let receipt_purchased_at: Option<DateTime<Utc>> = row.try_get("receipt_purchased_at")?;
        let receipt_expires_at: Option<DateTime<Utc>> = row.try_get("receipt_expires_at")?;
        let receipt_validated_at: Option<DateTime<Utc>> = row.try_get("receipt_validated_at")?;
        let receipt = match (
            receipt_product_id,
            receipt_transaction_id,
            receipt_purchased_at,
            receipt_expires_at,
            receipt_validated_at,
        ) {
            (
                Some(product_id),
                Some(transaction_id),
                Some(purchased_at),
                Some(expires_at),
                Some(validated_at),
            ) => Some(ReceiptMetadata {
                product_id,
                transaction_id,
                original_transaction_id: row.try_get("receipt_original_transaction_id")?,
                purchased_at,
                expires_at,
                validated_at,
            }),
            _ => None,
        };

        Ok(Self {
            id: row.try_get("id")?,
            email: row.try_get("email")?,
            // Unknown stored values resolve to the most restrictive reading.
            plan: Plan::parse(&plan).unwrap_or(Plan::Free),
            status: EntitlementStatus::parse(&status).unwrap_or(EntitlementStatus::Inactive),
            platform: BillingPlatform::parse(&platform).unwrap_or(BillingPlatform::Stripe),
            requests_current: row.try_get("requests_current")?,
            requests_limit: row.try_get("requests_limit")?,
            tokens_current: row.try_get("tokens_current")?,
            tokens_limit: row.try_get("tokens_limit")?,
            reset_date: row.try_get("reset_date")?,
            period_start: row.try_get("period_start")?,
            period_end: row.try_get("period_end")?,
            receipt,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UsageCounter {
    pub current: i64,
    pub limit: i64,
}

/// Read-only summary exposed to status-reporting endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct UsageSummary {
    pub plan: Plan,
    pub status: EntitlementStatus,
    pub requests: UsageCounter,
    pub tokens: UsageCounter,
    pub reset_date: DateTime<Utc>,
    pub period_end: Option<DateTime<Utc>>,
}

/// First instant of the calendar month following `now`.
pub fn next_monthly_reset(now: DateTime<Utc>) -> DateTime<Utc> {
    let month_start = NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    Utc.from_utc_datetime(&month_start) + Months::new(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_ordering_matches_tiers() {
        assert!(Plan::Free < Plan::Pro);
        assert!(Plan::Pro < Plan::Enterprise);
        assert_eq!(Plan::parse("pro"), Some(Plan::Pro));
        assert_eq!(Plan::parse("platinum"), None);
    }

    #[test]
    fn limits_are_a_fixed_lookup() {
        let free = PlanLimits::for_plan(Plan::Free);
        assert_eq!((free.requests, free.tokens), (100, 10_000));
        let enterprise = PlanLimits::for_plan(Plan::Enterprise);
        assert_eq!((enterprise.requests, enterprise.tokens), (-1, -1));
    }

    #[test]
    fn reset_advances_to_first_of_next_month() {
        let now = Utc.with_ymd_and_hms(2024, 3, 17, 15, 30, 0).unwrap();
        let reset = next_monthly_reset(now);
        assert_eq!(reset, Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn reset_rolls_over_year_boundary() {
        let now = Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 59).unwrap();
        let reset = next_monthly_reset(now);
        assert_eq!(reset, Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn status_round_trips_past_due() {
        assert_eq!(EntitlementStatus::PastDue.as_str(), "past_due");
        assert_eq!(
            EntitlementStatus::parse("past_due"),
            Some(EntitlementStatus::PastDue)
        );
    }
}
