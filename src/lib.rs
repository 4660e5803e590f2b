//! Pawbill - billing and subscription lifecycle engine
//!
//! Pawbill keeps each tenant of a pet-care CRM on the right plan. It
//! reconciles payment provider webhooks with tenant billing state, enforces
//! plan limits, and retries transient provider failures without charging,
//! granting or transitioning twice.
//!
//! # Features
//!
//! - **Lifecycle**: trial, paid, grace and suspended states driven by one
//!   pure state machine
//! - **Webhooks**: signature verification, typed event parsing and
//!   tampered-checkout detection
//! - **Entitlements**: seat, client and feature gates derived from the plan
//! - **Outbound calls**: checkout, portal and connected accounts with
//!   bounded retries
//! - **Audit**: every transition and rejected delivery leaves an entry
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use pawbill::{BillingContext, ConfigBuilder};
//!
//! #[tokio::main]
//! async fn main() -> pawbill::Result<()> {
//!     pawbill::init_tracing();
//!
//!     let config = ConfigBuilder::new().from_env().build()?;
//!     let ctx = BillingContext::builder(config)
//!         .with_store(store)
//!         .with_provider(Arc::new(pawbill::billing::LiveStripeProvider::new()))
//!         .build()?;
//!
//!     let app = axum::Router::new().merge(pawbill::webhook_router(ctx.clone()));
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8000").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

mod app;
pub mod billing;
mod config;
pub mod email;
mod error;
pub mod http;
pub mod utils;

// Re-exports for public API
pub use app::{BillingContext, BillingContextBuilder};
pub use config::{BillingConfig, Config, ConfigBuilder, LoggingConfig, RetryConfig};
pub use email::{ConsoleMailer, Email, Mailer};
pub use error::{ErrorResponse, PawbillError, Result};
pub use http::webhook_router;
pub use utils::{Clock, FixedClock, SystemClock};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging with sensible defaults
///
/// This should be called early in your application, typically in main()
/// before building the BillingContext.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "info", "debug", "pawbill=debug")
/// - `PAWBILL_LOG_JSON`: Set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = utils::parse_env_with_prefix::<bool>("LOG_JSON").unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Initialize tracing from the logging section of the configuration
pub fn init_tracing_with_config(config: &LoggingConfig) {
    let env_filter = EnvFilter::new(&config.level);

    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
