//! Billing and subscription lifecycle.
//!
//! Tenants move between trial, paid, grace and suspended states in response
//! to provider webhooks. Every transition goes through
//! [`state_machine::transition`] and is written with an optimistic version
//! check, so concurrent deliveries for one tenant never interleave.
//!
//! # Example
//!
//! ```rust,ignore
//! use pawbill::billing::{BillingService, CheckoutUrls, PlanCode, BillingCycle};
//!
//! let session = billing
//!     .create_checkout_session(
//!         "biz_42",
//!         PlanCode::Team,
//!         BillingCycle::Monthly,
//!         &CheckoutUrls::new("https://app.pawbill.app/billing/done", "https://app.pawbill.app/billing"),
//!     )
//!     .await?;
//!
//! if !gate.can_use_feature(&tenant, "gpsWalkRoutes").allowed {
//!     return Err(PawbillError::forbidden("Upgrade to use GPS walk routes"));
//! }
//! ```

pub mod audit;
pub mod checkout;
pub mod credentials;
pub mod entitlements;
pub mod error;
pub mod events;
pub mod lifecycle;
#[cfg(feature = "stripe")]
pub mod live_client;
pub mod notify;
pub mod plans;
pub mod provider;
pub mod retry;
pub mod state_machine;
pub mod storage;
pub mod webhook;

pub use audit::{
    AuditCategory, AuditLogEntry, AuditSeverity, AuditSink, MemoryAuditSink, NoOpAuditSink,
    OperationAuditor, TracingAuditSink,
};
pub use checkout::{BillingService, CheckoutUrls, PriceBook, PriceEntry, RedirectPolicy};
pub use credentials::{
    CredentialSource, EnvCredentialSource, FreshCredentials, InvalidApiKeyError, ProviderCredentials,
    StaticCredentialSource,
};
pub use entitlements::{
    AccessStatus, DenialReason, DowngradeCheck, EntitlementDecision, EntitlementGate, LimitViolation,
    LimitedResource,
};
pub use error::BillingError;
pub use events::{EventKind, ProviderEvent, parse_event};
pub use lifecycle::{FailedPayment, GraceSweep, LifecycleOutcome, SubscriptionLifecycle};
#[cfg(feature = "stripe")]
pub use live_client::LiveStripeProvider;
pub use notify::{
    MailerNotificationSink, NoOpNotificationSink, NotificationSink, PaymentFailureWarning,
    RecordingNotificationSink,
};
pub use plans::{BillingCycle, Feature, FeatureFlags, LimitCheckResult, Plan, PlanCode};
pub use provider::{
    CheckoutPurchase, CheckoutSession, ConnectedAccount, PaymentProvider, PortalSession, ProviderError,
    ProviderErrorKind,
};
pub use retry::{RetryOptions, RetryPolicy};
pub use state_machine::{BillingEvent, IntegrityViolation, LifecycleRules, SubscriptionStatus, Transition};
pub use storage::{BillingState, InMemoryTenantStore, Invoice, PlanStatus, Tenant, TenantPatch, TenantStore};
pub use webhook::{SignatureVerifier, WebhookOutcome, WebhookReconciler};

#[cfg(any(test, feature = "test-billing"))]
pub use provider::test::MockPaymentProvider;
