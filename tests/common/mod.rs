//! Shared fixtures: a fully wired BillingContext over in-memory doubles.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;

use pawbill::billing::credentials::{FreshCredentials, ProviderCredentials};
use pawbill::billing::provider::{
    CheckoutPurchase, CheckoutSession, ConnectedAccount, CreateCheckoutSessionRequest,
    CreateConnectedAccountRequest, CreateCustomerRequest, CreatePortalSessionRequest, PaymentProvider,
    PortalSession, ProviderError,
};
use pawbill::billing::webhook::signature_header;
use pawbill::billing::{
    BillingCycle, InMemoryTenantStore, MemoryAuditSink, PlanCode, RecordingNotificationSink, Tenant,
    WebhookOutcome,
};
use pawbill::{BillingContext, ConfigBuilder, FixedClock, RetryConfig};

pub const SECRET: &str = "whsec_integration_secret";
pub const TENANT: &str = "biz_1";
pub const CUSTOMER: &str = "cus_1";

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
}

/// Provider double: purchases are registered up front, failures queued.
#[derive(Default)]
pub struct ScriptedProvider {
    purchases: Mutex<HashMap<String, CheckoutPurchase>>,
    retrieve_failures: Mutex<VecDeque<ProviderError>>,
    retrieve_calls: AtomicU32,
    ids: AtomicU64,
}

impl ScriptedProvider {
    pub fn set_purchase(&self, purchase: CheckoutPurchase) {
        self.purchases
            .lock()
            .unwrap()
            .insert(purchase.session_id.clone(), purchase);
    }

    pub fn fail_retrieve(&self, errors: impl IntoIterator<Item = ProviderError>) {
        self.retrieve_failures.lock().unwrap().extend(errors);
    }

    pub fn retrieve_calls(&self) -> u32 {
        self.retrieve_calls.load(Ordering::SeqCst)
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}_{}", prefix, self.ids.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl PaymentProvider for ScriptedProvider {
    async fn create_customer(
        &self,
        _credentials: &ProviderCredentials,
        _request: &CreateCustomerRequest,
    ) -> Result<String, ProviderError> {
        Ok(self.next_id("cus"))
    }

    async fn create_checkout_session(
        &self,
        _credentials: &ProviderCredentials,
        _request: &CreateCheckoutSessionRequest,
    ) -> Result<CheckoutSession, ProviderError> {
        let id = self.next_id("cs");
        Ok(CheckoutSession {
            url: format!("https://checkout.test/{}", id),
            id,
        })
    }

    async fn create_portal_session(
        &self,
        _credentials: &ProviderCredentials,
        _request: &CreatePortalSessionRequest,
    ) -> Result<PortalSession, ProviderError> {
        let id = self.next_id("bps");
        Ok(PortalSession {
            url: format!("https://portal.test/{}", id),
            id,
        })
    }

    async fn create_connected_account(
        &self,
        _credentials: &FreshCredentials,
        _request: &CreateConnectedAccountRequest,
    ) -> Result<ConnectedAccount, ProviderError> {
        Ok(ConnectedAccount {
            id: self.next_id("acct"),
        })
    }

    async fn retrieve_checkout_purchase(
        &self,
        _credentials: &ProviderCredentials,
        session_id: &str,
    ) -> Result<CheckoutPurchase, ProviderError> {
        self.retrieve_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.retrieve_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.purchases
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .ok_or_else(|| ProviderError::from_status(404, "retrieve_checkout_purchase", "No such session"))
    }
}

pub struct World {
    pub store: InMemoryTenantStore,
    pub audit: Arc<MemoryAuditSink>,
    pub notifier: RecordingNotificationSink,
    pub clock: Arc<FixedClock>,
    pub provider: Arc<ScriptedProvider>,
    pub ctx: BillingContext,
    event_ids: AtomicU64,
}

impl World {
    pub fn new() -> Self {
        let store = InMemoryTenantStore::new();
        let mut tenant = Tenant::new_trial(TENANT, "Happy Hounds", PlanCode::Starter, t0() + Duration::days(14))
            .with_billing_email("owner@happyhounds.co.uk");
        tenant.external_customer_ref = Some(CUSTOMER.to_string());
        store.insert_tenant(tenant);

        let audit = Arc::new(MemoryAuditSink::new());
        let notifier = RecordingNotificationSink::new();
        let clock = Arc::new(FixedClock::new(t0()));
        let provider = Arc::new(ScriptedProvider::default());

        let config = ConfigBuilder::new()
            .with_webhook_secret(SECRET)
            .with_stripe_secret_key("sk_test_0123456789abcdefgh")
            .with_price(PlanCode::Team, BillingCycle::Monthly, "price_team_monthly")
            .with_retry(RetryConfig {
                base_delay_ms: 1,
                max_delay_ms: 2,
                jitter_ms: 0,
                ..RetryConfig::default()
            })
            .build()
            .unwrap();

        let ctx = BillingContext::builder(config)
            .with_store(Arc::new(store.clone()))
            .with_provider(provider.clone())
            .with_audit_sink(audit.clone())
            .with_notifier(Arc::new(notifier.clone()))
            .with_clock(clock.clone())
            .build()
            .unwrap();

        Self {
            store,
            audit,
            notifier,
            clock,
            provider,
            ctx,
            event_ids: AtomicU64::new(0),
        }
    }

    pub fn tenant(&self) -> Tenant {
        self.store.tenant(TENANT).unwrap()
    }

    pub fn event(&self, event_type: &str, object: serde_json::Value) -> Vec<u8> {
        let n = self.event_ids.fetch_add(1, Ordering::SeqCst) + 1;
        serde_json::to_vec(&json!({
            "id": format!("evt_{}", n),
            "type": event_type,
            "created": self.clock_now().timestamp(),
            "data": { "object": object }
        }))
        .unwrap()
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        use pawbill::Clock;
        self.clock.now()
    }

    pub fn sign(&self, payload: &[u8]) -> String {
        signature_header(SECRET, payload, self.clock_now().timestamp()).unwrap()
    }

    pub async fn deliver(&self, payload: &[u8]) -> pawbill::Result<WebhookOutcome> {
        self.ctx
            .reconciler()
            .reconcile(payload, &self.sign(payload), "dlv_test")
            .await
    }

    pub fn checkout_completed(&self, session_id: &str, claimed_plan: &str) -> Vec<u8> {
        self.event(
            "checkout.session.completed",
            json!({
                "id": session_id,
                "customer": CUSTOMER,
                "subscription": "sub_1",
                "metadata": { "tenant_id": TENANT, "plan": claimed_plan, "billing_cycle": "MONTHLY" }
            }),
        )
    }

    pub fn subscription_updated(&self, status: &str, plan: &str, period_end: DateTime<Utc>) -> Vec<u8> {
        self.event(
            "customer.subscription.updated",
            json!({
                "id": "sub_1",
                "customer": CUSTOMER,
                "status": status,
                "current_period_end": period_end.timestamp(),
                "metadata": { "tenant_id": TENANT },
                "items": { "data": [ {
                    "price": {
                        "id": "price_team_monthly",
                        "metadata": { "plan": plan, "billing_cycle": "MONTHLY" }
                    }
                } ] }
            }),
        )
    }

    pub fn invoice_payment_failed(&self, invoice_id: &str, attempt: u32) -> Vec<u8> {
        self.event(
            "invoice.payment_failed",
            json!({
                "id": invoice_id,
                "customer": CUSTOMER,
                "subscription": "sub_1",
                "attempt_count": attempt,
                "amount_due": 4900,
                "currency": "gbp",
                "subscription_details": { "metadata": { "tenant_id": TENANT } }
            }),
        )
    }

    pub fn invoice_paid(&self, invoice_id: &str, period_end: DateTime<Utc>) -> Vec<u8> {
        self.event(
            "invoice.paid",
            json!({
                "id": invoice_id,
                "customer": CUSTOMER,
                "subscription": "sub_1",
                "lines": { "data": [ { "period": { "end": period_end.timestamp() } } ] }
            }),
        )
    }
}

pub fn purchase(session_id: &str, plan: &str, cycle: &str, period_end: DateTime<Utc>) -> CheckoutPurchase {
    CheckoutPurchase {
        session_id: session_id.to_string(),
        price_id: Some(format!("price_{}_{}", plan.to_lowercase(), cycle.to_lowercase())),
        price_plan: Some(plan.to_string()),
        price_cycle: Some(cycle.to_string()),
        current_period_end: Some(period_end.timestamp()),
    }
}
