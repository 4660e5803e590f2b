//! Live Stripe provider.
//!
//! One request per call. A client is built from the credentials handed in so
//! a rotated key takes effect on the next call. Retrying belongs to
//! [`RetryPolicy`](super::retry::RetryPolicy).

use std::collections::HashMap;

use async_trait::async_trait;
use secrecy::ExposeSecret;

use super::credentials::{FreshCredentials, ProviderCredentials};
use super::provider::{
    CheckoutPurchase, CheckoutSession, ConnectedAccount, CreateCheckoutSessionRequest,
    CreateConnectedAccountRequest, CreateCustomerRequest, CreatePortalSessionRequest, META_BILLING_CYCLE,
    META_PLAN, META_TENANT_ID, PaymentProvider, PortalSession, ProviderError, ProviderErrorKind,
};

const APP_NAME: &str = "pawbill";

/// [`PaymentProvider`] backed by the Stripe API.
#[derive(Debug, Clone, Default)]
pub struct LiveStripeProvider {
    /// Sent to Stripe alongside the app name.
    app_url: Option<String>,
}

impl LiveStripeProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_app_url(mut self, url: impl Into<String>) -> Self {
        self.app_url = Some(url.into());
        self
    }

    fn client(&self, credentials: &ProviderCredentials) -> stripe::Client {
        stripe::Client::new(credentials.secret_key().expose_secret()).with_app_info(
            APP_NAME.to_string(),
            Some(env!("CARGO_PKG_VERSION").to_string()),
            self.app_url.clone(),
        )
    }

    /// Client that sends the caller's idempotency key, for creating objects.
    fn idempotent_client(&self, credentials: &ProviderCredentials, key: &str) -> stripe::Client {
        self.client(credentials)
            .with_strategy(stripe::RequestStrategy::Idempotent(key.to_string()))
    }
}

// ============================================================================
// Error classification
// ============================================================================

/// Map a Stripe failure onto a single [`ProviderErrorKind`].
fn classify(error: stripe::StripeError, operation: &str) -> ProviderError {
    match error {
        stripe::StripeError::Stripe(request_error) => {
            let status = request_error.http_status;
            let message = request_error
                .message
                .clone()
                .unwrap_or_else(|| "Unknown error".to_string());
            let mut err = if status == 0 {
                ProviderError::new(ProviderErrorKind::ProviderConnection, operation, message)
            } else {
                ProviderError::from_status(status, operation, message)
            };
            if let Some(code) = request_error.code.as_ref() {
                err = err.with_code(format!("{code:?}"));
            }
            err
        }
        stripe::StripeError::Timeout => {
            ProviderError::new(ProviderErrorKind::Timeout, operation, "Request timed out")
        }
        stripe::StripeError::ClientError(msg) => {
            ProviderError::new(ProviderErrorKind::Transport, operation, format!("HTTP client error: {msg}"))
        }
        other => ProviderError::new(ProviderErrorKind::Unknown, operation, other.to_string()),
    }
}

fn invalid_id(operation: &str, what: &str, id: &str) -> ProviderError {
    ProviderError::new(
        ProviderErrorKind::InvalidRequest,
        operation,
        format!("Invalid {} id: {}", what, id),
    )
}

fn parse_customer_id(operation: &str, id: &str) -> Result<stripe::CustomerId, ProviderError> {
    id.parse().map_err(|_| invalid_id(operation, "customer", id))
}

// ============================================================================
// PaymentProvider
// ============================================================================

#[async_trait]
impl PaymentProvider for LiveStripeProvider {
    async fn create_customer(
        &self,
        credentials: &ProviderCredentials,
        request: &CreateCustomerRequest,
    ) -> Result<String, ProviderError> {
        const OP: &str = "create_customer";
        let client = self.idempotent_client(credentials, &request.idempotency_key);

        let mut params = stripe::CreateCustomer::new();
        params.name = Some(&request.name);
        params.email = request.email.as_deref();
        params.metadata = Some(HashMap::from([(
            META_TENANT_ID.to_string(),
            request.tenant_id.clone(),
        )]));

        let customer = stripe::Customer::create(&client, params)
            .await
            .map_err(|e| classify(e, OP))?;
        Ok(customer.id.to_string())
    }

    async fn create_checkout_session(
        &self,
        credentials: &ProviderCredentials,
        request: &CreateCheckoutSessionRequest,
    ) -> Result<CheckoutSession, ProviderError> {
        const OP: &str = "create_checkout_session";
        let client = self.idempotent_client(credentials, &request.idempotency_key);

        let metadata = HashMap::from([
            (META_TENANT_ID.to_string(), request.metadata.tenant_id.clone()),
            (META_PLAN.to_string(), request.metadata.plan.to_string()),
            (META_BILLING_CYCLE.to_string(), request.metadata.cycle.to_string()),
        ]);

        let mut params = stripe::CreateCheckoutSession::new();
        params.customer = Some(parse_customer_id(OP, &request.customer_id)?);
        params.mode = Some(stripe::CheckoutSessionMode::Subscription);
        params.success_url = Some(&request.success_url);
        params.cancel_url = Some(&request.cancel_url);
        params.line_items = Some(vec![stripe::CreateCheckoutSessionLineItems {
            price: Some(request.price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }]);
        // The subscription carries the tenant too, so later subscription
        // events resolve without the session.
        params.subscription_data = Some(stripe::CreateCheckoutSessionSubscriptionData {
            metadata: Some(metadata.clone()),
            ..Default::default()
        });
        params.metadata = Some(metadata);

        let session = stripe::CheckoutSession::create(&client, params)
            .await
            .map_err(|e| classify(e, OP))?;

        let url = session
            .url
            .ok_or_else(|| ProviderError::new(ProviderErrorKind::Unknown, OP, "Checkout session URL missing"))?;
        Ok(CheckoutSession {
            id: session.id.to_string(),
            url,
        })
    }

    async fn create_portal_session(
        &self,
        credentials: &ProviderCredentials,
        request: &CreatePortalSessionRequest,
    ) -> Result<PortalSession, ProviderError> {
        const OP: &str = "create_portal_session";
        let client = self.client(credentials);

        let mut params = stripe::CreateBillingPortalSession::new(parse_customer_id(OP, &request.customer_id)?);
        params.return_url = Some(&request.return_url);

        let session = stripe::BillingPortalSession::create(&client, params)
            .await
            .map_err(|e| classify(e, OP))?;
        Ok(PortalSession {
            id: session.id.to_string(),
            url: session.url,
        })
    }

    async fn create_connected_account(
        &self,
        credentials: &FreshCredentials,
        request: &CreateConnectedAccountRequest,
    ) -> Result<ConnectedAccount, ProviderError> {
        const OP: &str = "create_connected_account";
        let client = self.idempotent_client(credentials, &request.idempotency_key);

        let mut params = stripe::CreateAccount::new();
        params.type_ = Some(stripe::AccountType::Express);
        params.email = Some(&request.email);
        params.country = request.country.as_deref();
        params.metadata = Some(HashMap::from([(
            META_TENANT_ID.to_string(),
            request.tenant_id.clone(),
        )]));

        let account = stripe::Account::create(&client, params)
            .await
            .map_err(|e| classify(e, OP))?;
        Ok(ConnectedAccount {
            id: account.id.to_string(),
        })
    }

    async fn retrieve_checkout_purchase(
        &self,
        credentials: &ProviderCredentials,
        session_id: &str,
    ) -> Result<CheckoutPurchase, ProviderError> {
        const OP: &str = "retrieve_checkout_purchase";
        let client = self.client(credentials);
        let id: stripe::CheckoutSessionId = session_id
            .parse()
            .map_err(|_| invalid_id(OP, "checkout session", session_id))?;

        let session = stripe::CheckoutSession::retrieve(&client, &id, &["line_items", "subscription"])
            .await
            .map_err(|e| classify(e, OP))?;

        let price = session
            .line_items
            .as_ref()
            .and_then(|items| items.data.first())
            .and_then(|item| item.price.as_ref());
        let price_meta = |key: &str| {
            price
                .and_then(|p| p.metadata.as_ref())
                .and_then(|m| m.get(key))
                .cloned()
        };
        let current_period_end = session
            .subscription
            .as_ref()
            .and_then(|s| s.as_object())
            .map(|s| s.current_period_end);

        Ok(CheckoutPurchase {
            session_id: session.id.to_string(),
            price_id: price.map(|p| p.id.to_string()),
            price_plan: price_meta(META_PLAN),
            price_cycle: price_meta(META_BILLING_CYCLE),
            current_period_end,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_request_errors_by_status() {
        let err = stripe::StripeError::Stripe(stripe::RequestError {
            http_status: 429,
            message: Some("Too many requests".to_string()),
            ..Default::default()
        });
        let classified = classify(err, "create_customer");
        assert_eq!(classified.kind, ProviderErrorKind::RateLimited);
        assert_eq!(classified.http_status, Some(429));
        assert!(classified.is_retryable());

        let err = stripe::StripeError::Stripe(stripe::RequestError {
            http_status: 402,
            message: Some("Your card was declined".to_string()),
            ..Default::default()
        });
        assert_eq!(classify(err, "create_checkout_session").kind, ProviderErrorKind::CardDeclined);
    }

    #[test]
    fn test_classify_transport_failures() {
        assert_eq!(
            classify(stripe::StripeError::Timeout, "create_customer").kind,
            ProviderErrorKind::Timeout
        );
        assert_eq!(
            classify(stripe::StripeError::ClientError("reset".to_string()), "create_customer").kind,
            ProviderErrorKind::Transport
        );
        assert_eq!(
            classify(stripe::StripeError::UnsupportedVersion, "create_customer").kind,
            ProviderErrorKind::Unknown
        );
    }

    #[test]
    fn test_bad_ids_are_invalid_requests() {
        let err = parse_customer_id("create_portal_session", "not-a-customer").unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::InvalidRequest);
    }
}
