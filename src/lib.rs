pub mod completions;
pub mod config;
pub mod entitlements;
pub mod error;
pub mod routes;
pub mod usage;
pub mod webhooks;
