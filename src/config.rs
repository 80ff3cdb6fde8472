use once_cell::sync::Lazy;

use crate::entitlements::receipts::StoreEnvironment;

/// Address the HTTP server should bind to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the HTTP server should listen on. Defaults to `3000`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(3000)
});

/// When set to a truthy value, allows the application to continue running even if database
/// migrations fail. Defaults to `false`.
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> = Lazy::new(|| {
    std::env::var("ALLOW_MIGRATION_FAILURE")
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes")
        })
        .unwrap_or(false)
});

/// key: receipts-config -> verification endpoint for iOS receipts
pub static RECEIPT_VERIFY_URL_IOS: Lazy<String> = Lazy::new(|| {
    read_optional_env("RECEIPT_VERIFY_URL_IOS")
        .unwrap_or_else(|| "http://127.0.0.1:8091/receipts/ios".to_string())
});

/// key: receipts-config -> verification endpoint for Android receipts
pub static RECEIPT_VERIFY_URL_ANDROID: Lazy<String> = Lazy::new(|| {
    read_optional_env("RECEIPT_VERIFY_URL_ANDROID")
        .unwrap_or_else(|| "http://127.0.0.1:8091/receipts/android".to_string())
});

/// key: receipts-config -> store environment presented to the verifier
pub static RECEIPT_VERIFY_ENVIRONMENT: Lazy<StoreEnvironment> = Lazy::new(|| {
    match std::env::var("RECEIPT_VERIFY_ENVIRONMENT") {
        Ok(raw) => {
            let normalized = raw.trim().to_ascii_lowercase();
            match normalized.as_str() {
                "" | "production" => StoreEnvironment::Production,
                "sandbox" => StoreEnvironment::Sandbox,
                other => panic!(
                    "unsupported RECEIPT_VERIFY_ENVIRONMENT value '{other}'; expected 'production' or 'sandbox'"
                ),
            }
        }
        Err(_) => StoreEnvironment::Production,
    }
});

/// key: usage-config -> flat rate used to derive ledger row cost
pub static USAGE_COST_PER_1K_TOKENS: Lazy<f64> = Lazy::new(|| {
    std::env::var("USAGE_COST_PER_1K_TOKENS")
        .ok()
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|value| *value >= 0.0)
        .unwrap_or(0.01)
});

fn read_optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
