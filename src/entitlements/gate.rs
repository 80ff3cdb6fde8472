use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{AppResult, EntitlementError};
use crate::usage::{NewUsageEvent, UsageLedger};

use super::models::{Entitlement, Plan};
use super::store::{AccountKey, EntitlementStore};

/// Permit iff the request counter has headroom. A passed reset boundary means
/// the counters are about to be zeroed, so the snapshot is treated as if they
/// already were. A missing entitlement is always a deny.
pub fn can_proceed(entitlement: Option<&Entitlement>, now: DateTime<Utc>) -> bool {
    let Some(entitlement) = entitlement else {
        return false;
    };
    if now > entitlement.reset_date {
        return true;
    }
    entitlement.requests_limit == -1 || entitlement.requests_current < entitlement.requests_limit
}

/// Plan gate for feature access. An expired paid plan is rejected with a
/// distinct renew signal rather than silently falling back to free-tier
/// access.
pub fn has_minimum_plan(
    entitlement: &Entitlement,
    required: Plan,
    now: DateTime<Utc>,
) -> AppResult<()> {
    if entitlement.plan != Plan::Free && !entitlement.is_active(now) {
        return Err(EntitlementError::SubscriptionExpired);
    }
    if entitlement.plan < required {
        return Err(EntitlementError::InsufficientPlan(required));
    }
    Ok(())
}

/// key: admission-gate -> decision sequence for a metered request
///
/// fetch -> lazy reset -> can_proceed -> optional plan gate; after the
/// external completion finishes, `settle` appends the ledger row
/// (best-effort) and increments the strict counters.
#[derive(Clone)]
pub struct AdmissionGate {
    store: EntitlementStore,
    ledger: UsageLedger,
}

impl AdmissionGate {
    pub fn new(store: EntitlementStore, ledger: UsageLedger) -> Self {
        Self { store, ledger }
    }

    pub async fn admit(
        &self,
        key: &AccountKey,
        required_plan: Option<Plan>,
    ) -> AppResult<Entitlement> {
        let now = Utc::now();
        self.store.apply_reset(key, now).await?;
        let entitlement = self.store.get(key).await?;

        if !can_proceed(Some(&entitlement), now) {
            return Err(EntitlementError::UsageLimitExceeded);
        }
        if let Some(required) = required_plan {
            has_minimum_plan(&entitlement, required, now)?;
        }
        debug!(account = %key, plan = %entitlement.plan, "request admitted");
        Ok(entitlement)
    }

    /// Ledger append is best-effort; the counter increment is strict and runs
    /// even if a reset is pending.
    pub async fn settle(&self, entitlement: &Entitlement, event: NewUsageEvent) -> AppResult<()> {
        let tokens = event.tokens;
        self.ledger.record(entitlement.id, event).await;
        self.store
            .increment(&AccountKey::Id(entitlement.id), 1, tokens)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entitlements::models::{BillingPlatform, EntitlementStatus};
    use chrono::{Duration, TimeZone};
    use uuid::Uuid;

    fn snapshot() -> Entitlement {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        Entitlement {
            id: Uuid::new_v4(),
            email: "gate@example.com".to_string(),
            plan: Plan::Free,
            status: EntitlementStatus::Active,
            platform: BillingPlatform::Stripe,
            requests_current: 0,
            requests_limit: 100,
            tokens_current: 0,
            tokens_limit: 10_000,
            reset_date: now + Duration::days(10),
            period_start: None,
            period_end: None,
            receipt: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn missing_entitlement_is_denied() {
        assert!(!can_proceed(None, now()));
    }

    #[test]
    fn exhausted_counter_is_denied() {
        let mut entitlement = snapshot();
        entitlement.requests_current = 100;
        assert!(!can_proceed(Some(&entitlement), now()));
    }

    #[test]
    fn unlimited_plan_ignores_current() {
        let mut entitlement = snapshot();
        entitlement.requests_current = 1_000_000;
        entitlement.requests_limit = -1;
        assert!(can_proceed(Some(&entitlement), now()));
    }

    #[test]
    fn passed_reset_boundary_reads_as_zeroed() {
        let mut entitlement = snapshot();
        entitlement.requests_current = 100;
        entitlement.reset_date = now() - Duration::seconds(1);
        assert!(can_proceed(Some(&entitlement), now()));
    }

    #[test]
    fn headroom_is_permitted() {
        let mut entitlement = snapshot();
        entitlement.requests_current = 99;
        assert!(can_proceed(Some(&entitlement), now()));
    }

    #[test]
    fn free_plan_is_denied_pro_features() {
        let entitlement = snapshot();
        let err = has_minimum_plan(&entitlement, Plan::Pro, now()).unwrap_err();
        assert!(matches!(err, EntitlementError::InsufficientPlan(Plan::Pro)));
    }

    #[test]
    fn expired_paid_plan_is_not_treated_as_free() {
        let mut entitlement = snapshot();
        entitlement.plan = Plan::Enterprise;
        entitlement.status = EntitlementStatus::Expired;
        let err = has_minimum_plan(&entitlement, Plan::Pro, now()).unwrap_err();
        assert!(matches!(err, EntitlementError::SubscriptionExpired));
    }

    #[test]
    fn lapsed_period_denies_even_when_status_active() {
        let mut entitlement = snapshot();
        entitlement.plan = Plan::Pro;
        entitlement.status = EntitlementStatus::Active;
        entitlement.period_end = Some(now() - Duration::days(1));
        let err = has_minimum_plan(&entitlement, Plan::Pro, now()).unwrap_err();
        assert!(matches!(err, EntitlementError::SubscriptionExpired));
    }

    #[test]
    fn sufficient_active_plan_passes() {
        let mut entitlement = snapshot();
        entitlement.plan = Plan::Enterprise;
        entitlement.period_end = Some(now() + Duration::days(20));
        assert!(has_minimum_plan(&entitlement, Plan::Pro, now()).is_ok());
    }
}
