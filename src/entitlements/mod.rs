pub mod api;
pub mod gate;
pub mod models;
pub mod receipts;
pub mod reconciliation;
pub mod store;

pub use gate::{can_proceed, has_minimum_plan, AdmissionGate};
pub use models::{
    next_monthly_reset, BillingPlatform, Entitlement, EntitlementStatus, Plan, PlanLimits,
    ReceiptMetadata, UsageCounter, UsageSummary,
};
pub use receipts::{
    plan_for_product, HttpReceiptVerifier, PurchaseRecord, ReceiptVerifier, StoreEnvironment,
};
pub use reconciliation::{
    may_assume_ownership, start_reconciliation_worker, PlatformReconciler, ReconciliationHandle,
    ReconciliationJob,
};
pub use store::{AccountKey, EntitlementStore, EntitlementUpdate, NewAccount};
