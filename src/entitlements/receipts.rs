use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config;
use crate::error::EntitlementError;

use super::models::{BillingPlatform, Plan};

/// Store products sold through the mobile storefronts.
const KNOWN_PRODUCTS: &[(&str, Plan)] = &[
    ("com.metergate.pro.monthly", Plan::Pro),
    ("com.metergate.pro.yearly", Plan::Pro),
    ("com.metergate.enterprise.monthly", Plan::Enterprise),
    ("com.metergate.enterprise.yearly", Plan::Enterprise),
];

pub fn plan_for_product(product_id: &str) -> Option<Plan> {
    KNOWN_PRODUCTS
        .iter()
        .find(|(known, _)| *known == product_id)
        .map(|(_, plan)| *plan)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreEnvironment {
    Sandbox,
    Production,
}

impl StoreEnvironment {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreEnvironment::Sandbox => "sandbox",
            StoreEnvironment::Production => "production",
        }
    }
}

/// One purchase record returned by the platform's verification endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchaseRecord {
    pub product_id: String,
    pub transaction_id: String,
    pub original_transaction_id: Option<String>,
    pub purchase_time: DateTime<Utc>,
    pub expiry_time: DateTime<Utc>,
}

/// key: receipts-verifier -> external verification seam
#[async_trait]
pub trait ReceiptVerifier: Send + Sync {
    async fn verify(
        &self,
        platform: BillingPlatform,
        receipt: &str,
        environment: StoreEnvironment,
    ) -> Result<Vec<PurchaseRecord>, EntitlementError>;
}

#[derive(Debug, Serialize)]
struct VerifyRequest<'a> {
    receipt: &'a str,
    environment: &'a str,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    status: i64,
    #[serde(default)]
    purchases: Vec<PurchaseRecord>,
}

/// HTTP client for the per-platform verification services. A non-zero status
/// from the platform is a hard verification failure surfaced to the caller.
pub struct HttpReceiptVerifier {
    client: reqwest::Client,
    ios_endpoint: String,
    android_endpoint: String,
}

impl HttpReceiptVerifier {
    pub fn new(ios_endpoint: String, android_endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            ios_endpoint,
            android_endpoint,
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            config::RECEIPT_VERIFY_URL_IOS.clone(),
            config::RECEIPT_VERIFY_URL_ANDROID.clone(),
        )
    }

    fn endpoint(&self, platform: BillingPlatform) -> Result<&str, EntitlementError> {
        match platform {
            BillingPlatform::Ios => Ok(&self.ios_endpoint),
            BillingPlatform::Android => Ok(&self.android_endpoint),
            BillingPlatform::Stripe => Err(EntitlementError::Malformed(
                "receipts are only issued by store platforms".to_string(),
            )),
        }
    }
}

#[async_trait]
impl ReceiptVerifier for HttpReceiptVerifier {
    async fn verify(
        &self,
        platform: BillingPlatform,
        receipt: &str,
        environment: StoreEnvironment,
    ) -> Result<Vec<PurchaseRecord>, EntitlementError> {
        let endpoint = self.endpoint(platform)?;
        let response = self
            .client
            .post(endpoint)
            .json(&VerifyRequest {
                receipt,
                environment: environment.as_str(),
            })
            .send()
            .await
            .map_err(|err| EntitlementError::VerificationFailed(err.to_string()))?;

        if !response.status().is_success() {
            return Err(EntitlementError::VerificationFailed(format!(
                "verification endpoint returned {}",
                response.status()
            )));
        }

        let body: VerifyResponse = response
            .json()
            .await
            .map_err(|err| EntitlementError::VerificationFailed(err.to_string()))?;

        if body.status != 0 {
            return Err(EntitlementError::VerificationFailed(format!(
                "platform rejected receipt with status {}",
                body.status
            )));
        }

        Ok(body.purchases)
    }
}
