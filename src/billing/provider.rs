//! Payment provider boundary.
//!
//! Every provider failure is classified exactly once, here, into a closed
//! [`ProviderErrorKind`]. The retry executor and the HTTP layer match on that
//! kind and never look at provider error strings.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::credentials::{FreshCredentials, ProviderCredentials};
use super::plans::{BillingCycle, PlanCode};

/// Metadata key holding the tenant id on customers, sessions and subscriptions.
pub const META_TENANT_ID: &str = "tenant_id";
/// Metadata key holding the plan code on sessions and prices.
pub const META_PLAN: &str = "plan";
/// Metadata key holding the billing cycle on sessions and prices.
pub const META_BILLING_CYCLE: &str = "billing_cycle";
/// Metadata key tying a connected-account payment to a CRM invoice.
pub const META_INVOICE_ID: &str = "invoice_id";

// ============================================================================
// Error classification
// ============================================================================

/// What went wrong talking to the provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Connection reset, DNS failure, TLS failure.
    Transport,
    /// The attempt did not finish in time.
    Timeout,
    /// HTTP 429.
    RateLimited,
    /// The provider reported it could not reach its own backend.
    ProviderConnection,
    /// HTTP 5xx.
    ServerError,
    /// HTTP 401.
    Authentication,
    /// HTTP 403.
    Permission,
    /// HTTP 400/404/409 and other request problems.
    InvalidRequest,
    /// HTTP 402.
    CardDeclined,
    /// Anything that does not fit the shapes above.
    Unknown,
}

impl ProviderErrorKind {
    /// Unknown shapes are fatal so a new failure mode can never loop.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport
                | Self::Timeout
                | Self::RateLimited
                | Self::ProviderConnection
                | Self::ServerError
        )
    }

    #[must_use]
    pub fn from_http_status(status: u16) -> Self {
        match status {
            401 => Self::Authentication,
            402 => Self::CardDeclined,
            403 => Self::Permission,
            408 => Self::Timeout,
            429 => Self::RateLimited,
            500..=599 => Self::ServerError,
            400..=499 => Self::InvalidRequest,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::ProviderConnection => "provider_connection",
            Self::ServerError => "server_error",
            Self::Authentication => "authentication",
            Self::Permission => "permission",
            Self::InvalidRequest => "invalid_request",
            Self::CardDeclined => "card_declined",
            Self::Unknown => "unknown",
        }
    }

    /// Short text safe to show to the person who clicked the button.
    #[must_use]
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Transport | Self::Timeout | Self::ProviderConnection | Self::ServerError => {
                "The payment service is temporarily unavailable. Please try again in a few minutes."
            }
            Self::RateLimited => "Too many billing requests right now. Please try again shortly.",
            Self::CardDeclined => "Your card was declined. Please use a different payment method.",
            Self::InvalidRequest => "The billing request could not be completed. Please try again.",
            Self::Authentication | Self::Permission | Self::Unknown => {
                "Billing is unavailable right now. Our team has been notified."
            }
        }
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified provider failure.
///
/// `message` is the provider's own text and is for logs only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub operation: String,
    pub message: String,
    pub code: Option<String>,
    pub http_status: Option<u16>,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            operation: operation.into(),
            message: message.into(),
            code: None,
            http_status: None,
        }
    }

    /// Classify from an HTTP status returned by the provider.
    pub fn from_status(status: u16, operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::from_http_status(status), operation, message).with_http_status(status)
    }

    pub fn timeout(operation: impl Into<String>, after: std::time::Duration) -> Self {
        Self::new(
            ProviderErrorKind::Timeout,
            operation,
            format!("no response after {} ms", after.as_millis()),
        )
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    #[must_use]
    pub fn with_http_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    #[must_use]
    pub fn user_message(&self) -> &'static str {
        self.kind.user_message()
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed ({}): {}", self.operation, self.kind, self.message)?;
        if let Some(status) = self.http_status {
            write!(f, " [http {}]", status)?;
        }
        Ok(())
    }
}

impl std::error::Error for ProviderError {}

impl From<ProviderError> for crate::error::PawbillError {
    fn from(err: ProviderError) -> Self {
        use crate::error::PawbillError;

        tracing::error!(
            target: "pawbill::billing::provider",
            operation = %err.operation,
            kind = %err.kind,
            http_status = ?err.http_status,
            code = ?err.code,
            error = %err.message,
            "Payment provider call failed"
        );

        let message = err.user_message().to_string();
        match err.kind {
            ProviderErrorKind::Timeout => PawbillError::RequestTimeout,
            ProviderErrorKind::RateLimited => PawbillError::TooManyRequests(message),
            ProviderErrorKind::Transport
            | ProviderErrorKind::ProviderConnection
            | ProviderErrorKind::ServerError => PawbillError::ServiceUnavailable(message),
            ProviderErrorKind::InvalidRequest | ProviderErrorKind::CardDeclined => {
                PawbillError::BadRequest(message)
            }
            ProviderErrorKind::Authentication
            | ProviderErrorKind::Permission
            | ProviderErrorKind::Unknown => PawbillError::Internal(message),
        }
    }
}

// ============================================================================
// Requests and responses
// ============================================================================

/// Idempotency key for one logical create call.
///
/// Built once before the first attempt; every retry of that call sends the
/// same key so the provider returns the object an earlier attempt created.
#[must_use]
pub fn idempotency_key(operation: &str) -> String {
    format!("{}_{}", operation, uuid::Uuid::new_v4())
}

/// Request to create a provider customer for a tenant.
#[derive(Debug, Clone)]
pub struct CreateCustomerRequest {
    pub tenant_id: String,
    pub name: String,
    pub email: Option<String>,
    pub idempotency_key: String,
}

/// Metadata stamped onto a checkout session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutMetadata {
    pub tenant_id: String,
    pub plan: PlanCode,
    pub cycle: BillingCycle,
}

/// Request to create a subscription checkout session.
#[derive(Debug, Clone)]
pub struct CreateCheckoutSessionRequest {
    pub customer_id: String,
    pub price_id: String,
    pub success_url: String,
    pub cancel_url: String,
    pub metadata: CheckoutMetadata,
    pub idempotency_key: String,
}

/// A created checkout session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

/// Request to open the provider's customer portal.
#[derive(Debug, Clone)]
pub struct CreatePortalSessionRequest {
    pub customer_id: String,
    pub return_url: String,
}

/// A created portal session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortalSession {
    pub id: String,
    pub url: String,
}

/// Request to create a connected (sub-merchant) account for a tenant.
#[derive(Debug, Clone)]
pub struct CreateConnectedAccountRequest {
    pub tenant_id: String,
    pub email: String,
    pub country: Option<String>,
    pub idempotency_key: String,
}

/// A created connected account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectedAccount {
    pub id: String,
}

/// What a completed checkout actually bought, as recorded by the provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckoutPurchase {
    pub session_id: String,
    pub price_id: Option<String>,
    /// `plan` metadata on the purchased price.
    pub price_plan: Option<String>,
    /// `billing_cycle` metadata on the purchased price.
    pub price_cycle: Option<String>,
    /// End of the subscription's current period, unix seconds.
    pub current_period_end: Option<i64>,
}

// ============================================================================
// Provider client trait
// ============================================================================

/// Outbound calls to the payment provider.
///
/// Implementations perform exactly one request per call and classify any
/// failure into a [`ProviderError`]. Retrying is the caller's job.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Create a customer and return its id.
    async fn create_customer(
        &self,
        credentials: &ProviderCredentials,
        request: &CreateCustomerRequest,
    ) -> Result<String, ProviderError>;

    async fn create_checkout_session(
        &self,
        credentials: &ProviderCredentials,
        request: &CreateCheckoutSessionRequest,
    ) -> Result<CheckoutSession, ProviderError>;

    async fn create_portal_session(
        &self,
        credentials: &ProviderCredentials,
        request: &CreatePortalSessionRequest,
    ) -> Result<PortalSession, ProviderError>;

    /// Account creation must never run on cached credentials.
    async fn create_connected_account(
        &self,
        credentials: &FreshCredentials,
        request: &CreateConnectedAccountRequest,
    ) -> Result<ConnectedAccount, ProviderError>;

    /// Look up the price and period actually purchased in a checkout session.
    async fn retrieve_checkout_purchase(
        &self,
        credentials: &ProviderCredentials,
        session_id: &str,
    ) -> Result<CheckoutPurchase, ProviderError>;
}

// ============================================================================
// Test doubles
// ============================================================================

#[cfg(any(test, feature = "test-billing"))]
pub mod test {
    //! Scriptable in-memory provider.

    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Provider double that records calls and replays queued failures.
    #[derive(Default)]
    pub struct MockPaymentProvider {
        counter: AtomicU64,
        failures: Mutex<HashMap<&'static str, VecDeque<ProviderError>>>,
        calls: Mutex<HashMap<&'static str, u32>>,
        purchases: Mutex<HashMap<String, CheckoutPurchase>>,
        fresh_key_ids: Mutex<Vec<u64>>,
        idempotency_keys: Mutex<HashMap<&'static str, Vec<String>>>,
    }

    impl MockPaymentProvider {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue errors returned by the next calls to `operation`.
        pub fn fail_next(&self, operation: &'static str, errors: impl IntoIterator<Item = ProviderError>) {
            self.failures
                .lock()
                .unwrap()
                .entry(operation)
                .or_default()
                .extend(errors);
        }

        /// Register what a checkout session purchased.
        pub fn set_purchase(&self, purchase: CheckoutPurchase) {
            self.purchases
                .lock()
                .unwrap()
                .insert(purchase.session_id.clone(), purchase);
        }

        pub fn calls(&self, operation: &str) -> u32 {
            self.calls.lock().unwrap().get(operation).copied().unwrap_or(0)
        }

        /// Fetch serials of the fresh credentials seen by account creation.
        pub fn fresh_credential_serials(&self) -> Vec<u64> {
            self.fresh_key_ids.lock().unwrap().clone()
        }

        /// Idempotency keys sent to `operation`, one per attempt.
        pub fn idempotency_keys(&self, operation: &str) -> Vec<String> {
            self.idempotency_keys
                .lock()
                .unwrap()
                .get(operation)
                .cloned()
                .unwrap_or_default()
        }

        fn next_id(&self, prefix: &str) -> String {
            let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            format!("{}_test_{}", prefix, n)
        }

        fn enter_keyed(&self, operation: &'static str, key: &str) -> Result<(), ProviderError> {
            self.idempotency_keys
                .lock()
                .unwrap()
                .entry(operation)
                .or_default()
                .push(key.to_string());
            self.enter(operation)
        }

        fn enter(&self, operation: &'static str) -> Result<(), ProviderError> {
            *self.calls.lock().unwrap().entry(operation).or_default() += 1;
            match self.failures.lock().unwrap().get_mut(operation).and_then(|q| q.pop_front()) {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl PaymentProvider for MockPaymentProvider {
        async fn create_customer(
            &self,
            _credentials: &ProviderCredentials,
            request: &CreateCustomerRequest,
        ) -> Result<String, ProviderError> {
            self.enter_keyed("create_customer", &request.idempotency_key)?;
            Ok(self.next_id("cus"))
        }

        async fn create_checkout_session(
            &self,
            _credentials: &ProviderCredentials,
            request: &CreateCheckoutSessionRequest,
        ) -> Result<CheckoutSession, ProviderError> {
            self.enter_keyed("create_checkout_session", &request.idempotency_key)?;
            let id = self.next_id("cs");
            Ok(CheckoutSession {
                url: format!("https://checkout.example.com/pay/{}", id),
                id,
            })
        }

        async fn create_portal_session(
            &self,
            _credentials: &ProviderCredentials,
            _request: &CreatePortalSessionRequest,
        ) -> Result<PortalSession, ProviderError> {
            self.enter("create_portal_session")?;
            let id = self.next_id("bps");
            Ok(PortalSession {
                url: format!("https://billing.example.com/session/{}", id),
                id,
            })
        }

        async fn create_connected_account(
            &self,
            credentials: &FreshCredentials,
            request: &CreateConnectedAccountRequest,
        ) -> Result<ConnectedAccount, ProviderError> {
            self.enter_keyed("create_connected_account", &request.idempotency_key)?;
            self.fresh_key_ids.lock().unwrap().push(credentials.serial());
            Ok(ConnectedAccount {
                id: self.next_id("acct"),
            })
        }

        async fn retrieve_checkout_purchase(
            &self,
            _credentials: &ProviderCredentials,
            session_id: &str,
        ) -> Result<CheckoutPurchase, ProviderError> {
            self.enter("retrieve_checkout_purchase")?;
            self.purchases
                .lock()
                .unwrap()
                .get(session_id)
                .cloned()
                .ok_or_else(|| {
                    ProviderError::from_status(404, "retrieve_checkout_purchase", "No such checkout session")
                })
        }
    }
}
