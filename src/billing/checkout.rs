//! Outbound billing operations.
//!
//! [`BillingService`] creates checkout sessions, portal sessions and
//! connected accounts. Every provider call goes through the [`RetryPolicy`];
//! failures reach the caller as short user-facing messages.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Deserialize;
use url::Url;

use super::credentials::CredentialSource;
use super::error::BillingError;
use super::plans::{BillingCycle, PlanCode};
use super::provider::{
    CheckoutMetadata, CheckoutSession, ConnectedAccount, CreateCheckoutSessionRequest,
    CreateConnectedAccountRequest, CreateCustomerRequest, CreatePortalSessionRequest, META_BILLING_CYCLE,
    META_PLAN, META_TENANT_ID, PaymentProvider, PortalSession, idempotency_key,
};
use super::retry::RetryPolicy;
use super::storage::{Tenant, TenantPatch, TenantStore};
use crate::error::Result;

/// Conditional writes of a provider ref before giving up on a busy tenant.
const MAX_REF_WRITE_ATTEMPTS: u32 = 3;

// ============================================================================
// Prices
// ============================================================================

/// One configured provider price.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PriceEntry {
    pub plan: PlanCode,
    pub cycle: BillingCycle,
    pub price_id: String,
}

/// Provider price ids per plan and cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriceBook {
    prices: HashMap<(PlanCode, BillingCycle), String>,
}

impl PriceBook {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = PriceEntry>) -> Self {
        Self {
            prices: entries
                .into_iter()
                .map(|e| ((e.plan, e.cycle), e.price_id))
                .collect(),
        }
    }

    #[must_use]
    pub fn with_price(mut self, plan: PlanCode, cycle: BillingCycle, price_id: impl Into<String>) -> Self {
        self.prices.insert((plan, cycle), price_id.into());
        self
    }

    pub fn price_id(&self, plan: PlanCode, cycle: BillingCycle) -> std::result::Result<&str, BillingError> {
        self.prices
            .get(&(plan, cycle))
            .map(String::as_str)
            .ok_or(BillingError::PriceNotConfigured { plan, cycle })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.prices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

// ============================================================================
// Redirect URLs
// ============================================================================

/// Which URLs the provider may send a tenant back to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RedirectPolicy {
    /// Empty allows any HTTPS host.
    allowed_domains: Vec<String>,
}

impl RedirectPolicy {
    pub fn new<I, D>(allowed_domains: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<String>,
    {
        Self {
            allowed_domains: allowed_domains.into_iter().map(Into::into).collect(),
        }
    }

    /// HTTPS is required except for local development hosts. When domains
    /// are configured the host must be one of them or a subdomain.
    pub fn validate(&self, url: &str) -> std::result::Result<(), BillingError> {
        let parsed = Url::parse(url).map_err(|e| BillingError::InvalidRedirectUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let host = parsed
            .host_str()
            .ok_or_else(|| BillingError::InvalidRedirectUrl {
                url: url.to_string(),
                reason: "missing host".to_string(),
            })?;

        let local = matches!(host, "localhost" | "127.0.0.1" | "[::1]");
        match parsed.scheme() {
            "https" => {}
            "http" if local => {}
            _ => {
                return Err(BillingError::InvalidRedirectUrl {
                    url: url.to_string(),
                    reason: "must use HTTPS".to_string(),
                });
            }
        }

        if !self.allowed_domains.is_empty()
            && !local
            && !self
                .allowed_domains
                .iter()
                .any(|allowed| host == allowed || host.ends_with(&format!(".{}", allowed)))
        {
            return Err(BillingError::RedirectDomainNotAllowed {
                domain: host.to_string(),
            });
        }
        Ok(())
    }
}

/// Where checkout sends the tenant afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutUrls {
    pub success_url: String,
    pub cancel_url: String,
}

impl CheckoutUrls {
    pub fn new(success_url: impl Into<String>, cancel_url: impl Into<String>) -> Self {
        Self {
            success_url: success_url.into(),
            cancel_url: cancel_url.into(),
        }
    }
}

// ============================================================================
// Service
// ============================================================================

/// Outbound billing operations for tenants.
pub struct BillingService<S: TenantStore + ?Sized> {
    store: Arc<S>,
    provider: Arc<dyn PaymentProvider>,
    credentials: Arc<dyn CredentialSource>,
    retry: RetryPolicy,
    prices: PriceBook,
    redirects: RedirectPolicy,
}

impl<S: TenantStore + ?Sized> BillingService<S> {
    pub fn new(
        store: Arc<S>,
        provider: Arc<dyn PaymentProvider>,
        credentials: Arc<dyn CredentialSource>,
        retry: RetryPolicy,
        prices: PriceBook,
    ) -> Self {
        Self {
            store,
            provider,
            credentials,
            retry,
            prices,
            redirects: RedirectPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_redirect_policy(mut self, redirects: RedirectPolicy) -> Self {
        self.redirects = redirects;
        self
    }

    async fn tenant(&self, tenant_id: &str) -> Result<Tenant> {
        Ok(self
            .store
            .get_tenant(tenant_id)
            .await?
            .ok_or_else(|| BillingError::TenantNotFound {
                tenant_id: tenant_id.to_string(),
            })?)
    }

    /// Start a subscription checkout for `plan` billed every `cycle`.
    ///
    /// The plan and cycle are stamped on the session so the completion
    /// webhook can cross-check them against the purchased price.
    pub async fn create_checkout_session(
        &self,
        tenant_id: &str,
        plan: PlanCode,
        cycle: BillingCycle,
        urls: &CheckoutUrls,
    ) -> Result<CheckoutSession> {
        self.redirects.validate(&urls.success_url)?;
        self.redirects.validate(&urls.cancel_url)?;
        let price_id = self.prices.price_id(plan, cycle)?.to_string();

        let tenant = self.tenant(tenant_id).await?;
        let customer_id = self.ensure_customer(&tenant).await?;

        let request = CreateCheckoutSessionRequest {
            customer_id,
            price_id,
            success_url: urls.success_url.clone(),
            cancel_url: urls.cancel_url.clone(),
            metadata: CheckoutMetadata {
                tenant_id: tenant.id.clone(),
                plan,
                cycle,
            },
            idempotency_key: idempotency_key("create_checkout_session"),
        };
        let metadata = BTreeMap::from([
            (META_TENANT_ID.to_string(), tenant.id.clone()),
            (META_PLAN.to_string(), plan.to_string()),
            (META_BILLING_CYCLE.to_string(), cycle.to_string()),
        ]);

        let credentials = self.credentials.credentials().await?;
        let provider = &self.provider;
        let (credentials, request) = (&credentials, &request);
        let session = self
            .retry
            .execute("create_checkout_session", &metadata, || {
                provider.create_checkout_session(credentials, request)
            })
            .await?;

        tracing::info!(
            target: "pawbill::billing::checkout",
            tenant_id = %tenant.id,
            plan = %plan,
            cycle = %cycle,
            session_id = %session.id,
            "Checkout session created"
        );
        Ok(session)
    }

    /// Provider customer for the tenant, created and stored on first use.
    async fn ensure_customer(&self, tenant: &Tenant) -> Result<String> {
        if let Some(ref customer_ref) = tenant.external_customer_ref {
            return Ok(customer_ref.clone());
        }

        let request = CreateCustomerRequest {
            tenant_id: tenant.id.clone(),
            name: tenant.name.clone(),
            email: tenant.billing_email.clone(),
            idempotency_key: idempotency_key("create_customer"),
        };
        let metadata = BTreeMap::from([(META_TENANT_ID.to_string(), tenant.id.clone())]);
        let credentials = self.credentials.credentials().await?;
        let provider = &self.provider;
        let (credentials, request) = (&credentials, &request);
        let customer_id = self
            .retry
            .execute("create_customer", &metadata, || provider.create_customer(credentials, request))
            .await?;

        self.record_ref(
            tenant,
            customer_id,
            "customer",
            |t| t.external_customer_ref.clone(),
            |id| TenantPatch::default().customer_ref(id),
        )
        .await
    }

    /// Store a just-created provider ref on the tenant unless a concurrent
    /// caller stored one first, in which case theirs is kept. Returns the ref
    /// the tenant ends up with.
    async fn record_ref(
        &self,
        tenant: &Tenant,
        created: String,
        kind: &'static str,
        stored: impl Fn(&Tenant) -> Option<String>,
        patch: impl Fn(String) -> TenantPatch,
    ) -> Result<String> {
        let mut current = tenant.clone();
        for _ in 0..MAX_REF_WRITE_ATTEMPTS {
            if let Some(existing) = stored(&current) {
                tracing::warn!(
                    target: "pawbill::billing::checkout",
                    tenant_id = %tenant.id,
                    kind,
                    kept = %existing,
                    orphaned = %created,
                    "Concurrent provider object creation, keeping the stored one"
                );
                return Ok(existing);
            }
            if self
                .store
                .compare_and_update_tenant(&current.id, current.version, patch(created.clone()))
                .await?
            {
                return Ok(created);
            }
            current = self.tenant(&tenant.id).await?;
        }
        Err(BillingError::ConcurrentModification {
            tenant_id: tenant.id.clone(),
        }
        .into())
    }

    /// Open the provider's self-service portal.
    pub async fn create_portal_session(&self, tenant_id: &str, return_url: &str) -> Result<PortalSession> {
        self.redirects.validate(return_url)?;
        let tenant = self.tenant(tenant_id).await?;
        let customer_id = tenant
            .external_customer_ref
            .clone()
            .ok_or_else(|| BillingError::NoCustomer {
                tenant_id: tenant.id.clone(),
            })?;

        let request = CreatePortalSessionRequest {
            customer_id,
            return_url: return_url.to_string(),
        };
        let metadata = BTreeMap::from([(META_TENANT_ID.to_string(), tenant.id.clone())]);
        let credentials = self.credentials.credentials().await?;
        let provider = &self.provider;
        let (credentials, request) = (&credentials, &request);
        let session = self
            .retry
            .execute("create_portal_session", &metadata, || {
                provider.create_portal_session(credentials, request)
            })
            .await?;
        Ok(session)
    }

    /// Create the tenant's connected account for taking client payments.
    ///
    /// Always runs on freshly fetched credentials. Returns the stored account
    /// if the tenant already has one.
    pub async fn create_connected_account(&self, tenant_id: &str, email: &str) -> Result<ConnectedAccount> {
        let tenant = self.tenant(tenant_id).await?;
        if let Some(ref existing) = tenant.external_connected_account_ref {
            return Ok(ConnectedAccount { id: existing.clone() });
        }

        let request = CreateConnectedAccountRequest {
            tenant_id: tenant.id.clone(),
            email: email.to_string(),
            country: None,
            idempotency_key: idempotency_key("create_connected_account"),
        };
        let metadata = BTreeMap::from([(META_TENANT_ID.to_string(), tenant.id.clone())]);
        let credentials = self.credentials.fresh_credentials().await?;
        let provider = &self.provider;
        let (credentials, request) = (&credentials, &request);
        let account = self
            .retry
            .execute("create_connected_account", &metadata, || {
                provider.create_connected_account(credentials, request)
            })
            .await?;

        let account = ConnectedAccount {
            id: self
                .record_ref(
                    &tenant,
                    account.id,
                    "connected_account",
                    |t| t.external_connected_account_ref.clone(),
                    |id| TenantPatch::default().connected_account_ref(id),
                )
                .await?,
        };

        tracing::info!(
            target: "pawbill::billing::checkout",
            tenant_id = %tenant.id,
            account_id = %account.id,
            "Connected account created"
        );
        Ok(account)
    }
}
