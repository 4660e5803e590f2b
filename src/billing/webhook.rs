//! Webhook reconciliation.
//!
//! [`WebhookReconciler::reconcile`] is the single entry point for provider
//! deliveries: verify the signature over the raw body, parse into a typed
//! [`ProviderEvent`], then dispatch either to the subscription lifecycle or
//! to connected-account invoice settlement.
//!
//! Handlers work from the payload's own state, never from a seen-event cache,
//! so redeliveries are harmless. Errors are returned after being logged and
//! audited, letting the provider redeliver; integrity violations are
//! acknowledged as [`WebhookOutcome::Rejected`] and never retried.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::Duration;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::audit::{AuditCategory, AuditLogEntry, AuditSeverity, OperationAuditor};
use super::credentials::CredentialSource;
use super::error::BillingError;
use super::events::{EventKind, ProviderEvent, parse_event};
use super::lifecycle::{FailedPayment, LifecycleOutcome, SubscriptionLifecycle};
use super::provider::{CheckoutPurchase, META_TENANT_ID, PaymentProvider};
use super::retry::RetryPolicy;
use super::state_machine::{BillingEvent, IntegrityViolation};
use super::storage::{Tenant, TenantStore};
use crate::error::Result;
use crate::utils::Clock;

type HmacSha256 = Hmac<Sha256>;

/// Label recorded on invoices settled through a connected account.
pub const PAID_VIA_CONNECT: &str = "stripe_connect";

/// What a delivery did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// State was written.
    Applied,
    /// The payload was already reflected.
    NoChange,
    /// Integrity violation; nothing written.
    Rejected,
    /// Event type or scope this crate does not act on.
    Ignored,
}

impl WebhookOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::NoChange => "no_change",
            Self::Rejected => "rejected",
            Self::Ignored => "ignored",
        }
    }
}

impl fmt::Display for WebhookOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&LifecycleOutcome> for WebhookOutcome {
    fn from(outcome: &LifecycleOutcome) -> Self {
        match outcome {
            LifecycleOutcome::Applied(_) => Self::Applied,
            LifecycleOutcome::NoChange(_) => Self::NoChange,
            LifecycleOutcome::Rejected(_) => Self::Rejected,
        }
    }
}

// ============================================================================
// Signature verification
// ============================================================================

/// Parsed `Stripe-Signature` header.
#[derive(Debug, PartialEq, Eq)]
struct SignatureHeader {
    timestamp: i64,
    signatures: Vec<String>,
}

fn parse_signature_header(header: &str) -> std::result::Result<SignatureHeader, BillingError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let (key, value) = part
            .split_once('=')
            .ok_or(BillingError::InvalidWebhookSignature)?;
        match key.trim() {
            "t" => timestamp = value.trim().parse().ok(),
            "v1" => signatures.push(value.trim().to_string()),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(BillingError::InvalidWebhookSignature)?;
    if signatures.is_empty() {
        return Err(BillingError::InvalidWebhookSignature);
    }
    Ok(SignatureHeader {
        timestamp,
        signatures,
    })
}

fn mac_over(secret: &str, timestamp: i64, payload: &[u8]) -> std::result::Result<HmacSha256, BillingError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| BillingError::Internal {
        message: "invalid webhook secret".to_string(),
    })?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac)
}

/// Build a `Stripe-Signature` header for `payload`.
///
/// Used to sign replayed or locally generated deliveries.
pub fn signature_header(secret: &str, payload: &[u8], timestamp: i64) -> Result<String> {
    let mac = mac_over(secret, timestamp, payload)?;
    Ok(format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Verifies webhook signatures against the endpoint secret.
pub struct SignatureVerifier {
    secret: SecretString,
    tolerance: Duration,
    clock: Arc<dyn Clock>,
}

impl SignatureVerifier {
    pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

    pub fn new(secret: SecretString, clock: Arc<dyn Clock>) -> Self {
        Self {
            secret,
            tolerance: Duration::seconds(Self::DEFAULT_TOLERANCE_SECS),
            clock,
        }
    }

    #[must_use]
    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Check `header` signs `payload`, byte for byte.
    pub fn verify(&self, payload: &[u8], header: &str) -> std::result::Result<(), BillingError> {
        let header = parse_signature_header(header)?;

        let age_seconds = self.clock.now().timestamp() - header.timestamp;
        if age_seconds.abs() > self.tolerance.num_seconds() {
            return Err(BillingError::WebhookTimestampExpired { age_seconds });
        }

        let expected = mac_over(self.secret.expose_secret(), header.timestamp, payload)?
            .finalize()
            .into_bytes();

        let matched = header
            .signatures
            .iter()
            .filter_map(|candidate| hex::decode(candidate).ok())
            .any(|candidate| bool::from(expected.as_slice().ct_eq(&candidate)));

        if matched {
            Ok(())
        } else {
            Err(BillingError::InvalidWebhookSignature)
        }
    }
}

impl fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("tolerance", &self.tolerance)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Reconciler
// ============================================================================

/// Authenticates and dispatches provider deliveries.
pub struct WebhookReconciler<S: TenantStore + ?Sized> {
    verifier: SignatureVerifier,
    lifecycle: SubscriptionLifecycle<S>,
    provider: Arc<dyn PaymentProvider>,
    credentials: Arc<dyn CredentialSource>,
    retry: RetryPolicy,
    auditor: OperationAuditor,
}

impl<S: TenantStore + ?Sized> WebhookReconciler<S> {
    pub fn new(
        verifier: SignatureVerifier,
        lifecycle: SubscriptionLifecycle<S>,
        provider: Arc<dyn PaymentProvider>,
        credentials: Arc<dyn CredentialSource>,
        retry: RetryPolicy,
        auditor: OperationAuditor,
    ) -> Self {
        Self {
            verifier,
            lifecycle,
            provider,
            credentials,
            retry,
            auditor,
        }
    }

    pub fn lifecycle(&self) -> &SubscriptionLifecycle<S> {
        &self.lifecycle
    }

    /// Handle one delivery. `payload` must be the exact request body.
    pub async fn reconcile(&self, payload: &[u8], signature: &str, delivery_id: &str) -> Result<WebhookOutcome> {
        if let Err(e) = self.verifier.verify(payload, signature) {
            tracing::warn!(
                target: "pawbill::billing::webhook",
                delivery_id,
                error = %e,
                "Webhook signature rejected"
            );
            self.auditor
                .record(
                    AuditLogEntry::new(AuditCategory::Security, AuditSeverity::Warning, "Webhook signature rejected")
                        .meta("delivery_id", delivery_id)
                        .meta("reason", &e),
                )
                .await;
            return Err(e.into());
        }

        let event = match parse_event(payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(
                    target: "pawbill::billing::webhook",
                    delivery_id,
                    error = %e,
                    "Failed to parse webhook payload"
                );
                self.auditor
                    .record(
                        AuditLogEntry::new(AuditCategory::Webhook, AuditSeverity::Warning, "Malformed webhook payload")
                            .meta("delivery_id", delivery_id),
                    )
                    .await;
                return Err(BillingError::InvalidWebhookPayload {
                    message: "malformed payload".to_string(),
                }
                .into());
            }
        };

        tracing::debug!(
            target: "pawbill::billing::webhook",
            event_id = %event.id,
            event_type = %event.event_type,
            delivery_id,
            "Webhook received"
        );

        match self.dispatch(&event).await {
            Ok(outcome) => {
                let severity = match outcome {
                    WebhookOutcome::Ignored => AuditSeverity::Low,
                    WebhookOutcome::Rejected => AuditSeverity::High,
                    WebhookOutcome::Applied | WebhookOutcome::NoChange => AuditSeverity::Info,
                };
                self.auditor
                    .record(
                        self.dispatch_entry(&event, delivery_id, severity, "Webhook processed")
                            .meta("outcome", outcome),
                    )
                    .await;
                Ok(outcome)
            }
            Err(e) => {
                tracing::error!(
                    target: "pawbill::billing::webhook",
                    event_id = %event.id,
                    event_type = %event.event_type,
                    delivery_id,
                    error = %e,
                    "Webhook handling failed"
                );
                self.auditor
                    .record(
                        self.dispatch_entry(&event, delivery_id, AuditSeverity::High, "Webhook handling failed")
                            .meta("error", &e),
                    )
                    .await;
                Err(e)
            }
        }
    }

    fn dispatch_entry(
        &self,
        event: &ProviderEvent,
        delivery_id: &str,
        severity: AuditSeverity,
        message: &str,
    ) -> AuditLogEntry {
        let mut entry = AuditLogEntry::new(AuditCategory::Webhook, severity, message)
            .maybe_tenant(event.tenant_hint())
            .meta("event_id", &event.id)
            .meta("event_type", &event.event_type)
            .meta("delivery_id", delivery_id);
        if let Some(ref account) = event.account {
            entry = entry.meta("account", account);
        }
        entry
    }

    async fn dispatch(&self, event: &ProviderEvent) -> Result<WebhookOutcome> {
        if event.account.is_some() {
            return match event.connected_invoice_id() {
                Some(invoice_id) => self.settle_connected_invoice(event, invoice_id).await,
                None => {
                    tracing::debug!(
                        target: "pawbill::billing::webhook",
                        event_type = %event.event_type,
                        "Connected-account event without invoice, ignoring"
                    );
                    Ok(WebhookOutcome::Ignored)
                }
            };
        }

        let billing_event = match &event.kind {
            EventKind::Unrecognized => {
                tracing::debug!(
                    target: "pawbill::billing::webhook",
                    event_type = %event.event_type,
                    "Unhandled event type"
                );
                return Ok(WebhookOutcome::Ignored);
            }
            // Platform charges are tracked through invoice events.
            EventKind::PaymentSucceeded(_) => return Ok(WebhookOutcome::Ignored),
            EventKind::CheckoutCompleted(session) => {
                if session.subscription.is_none() {
                    return Ok(WebhookOutcome::Ignored);
                }
                let tenant = self.resolve_tenant(event).await?;
                let purchase = self.fetch_purchase(&tenant.id, &session.id).await?;
                let billing_event = BillingEvent::CheckoutCompleted {
                    claimed_plan: session.claimed_plan().map(str::to_string),
                    claimed_cycle: session.claimed_cycle().map(str::to_string),
                    purchase,
                    customer_ref: session.customer.clone(),
                };
                return self.apply(&tenant, &billing_event).await;
            }
            EventKind::SubscriptionCreated(sub) | EventKind::SubscriptionUpdated(sub) => {
                BillingEvent::SubscriptionChanged {
                    status: sub.status.as_str().into(),
                    plan: sub.plan(),
                    cycle: sub.cycle(),
                    current_period_end: sub.period_end(),
                    customer_ref: sub.customer.clone(),
                }
            }
            EventKind::SubscriptionDeleted(_) => BillingEvent::SubscriptionDeleted,
            EventKind::InvoicePaid(invoice) => BillingEvent::InvoicePaid {
                period_end: invoice.paid_period_end(),
            },
            EventKind::InvoicePaymentFailed(invoice) => {
                let tenant = self.resolve_tenant(event).await?;
                let payment = FailedPayment {
                    invoice_id: invoice.id.clone(),
                    attempt: invoice.attempt_count.max(1),
                    amount: invoice.amount_due,
                    currency: invoice.currency.clone(),
                };
                let outcome = self.lifecycle.record_payment_failure(&tenant.id, &payment).await?;
                return Ok(WebhookOutcome::from(&outcome));
            }
        };

        let tenant = self.resolve_tenant(event).await?;
        self.apply(&tenant, &billing_event).await
    }

    async fn apply(&self, tenant: &Tenant, event: &BillingEvent) -> Result<WebhookOutcome> {
        let outcome = self.lifecycle.apply(&tenant.id, event).await?;
        Ok(WebhookOutcome::from(&outcome))
    }

    /// Tenant from the `tenant_id` metadata, else from the customer ref.
    async fn resolve_tenant(&self, event: &ProviderEvent) -> Result<Tenant> {
        let store = self.lifecycle.store();

        if let Some(tenant_id) = event.tenant_hint() {
            if let Some(tenant) = store.get_tenant(tenant_id).await? {
                return Ok(tenant);
            }
        }
        if let Some(customer_ref) = event.customer_ref() {
            if let Some(tenant) = store.find_tenant_by_customer_ref(customer_ref).await? {
                return Ok(tenant);
            }
        }
        Err(BillingError::TenantNotResolved {
            event_id: event.id.clone(),
            event_type: event.event_type.clone(),
        }
        .into())
    }

    async fn fetch_purchase(&self, tenant_id: &str, session_id: &str) -> Result<CheckoutPurchase> {
        let credentials = self.credentials.credentials().await?;
        let metadata = BTreeMap::from([
            (META_TENANT_ID.to_string(), tenant_id.to_string()),
            ("session_id".to_string(), session_id.to_string()),
        ]);
        let provider = &self.provider;
        let credentials = &credentials;

        let purchase = self
            .retry
            .execute("retrieve_checkout_purchase", &metadata, || {
                provider.retrieve_checkout_purchase(credentials, session_id)
            })
            .await?;
        Ok(purchase)
    }

    /// Mark a CRM invoice paid from a connected-account payment.
    async fn settle_connected_invoice(&self, event: &ProviderEvent, invoice_id: &str) -> Result<WebhookOutcome> {
        let store = self.lifecycle.store();
        let invoice = store
            .get_invoice(invoice_id)
            .await?
            .ok_or_else(|| BillingError::InvoiceNotFound {
                invoice_id: invoice_id.to_string(),
            })?;
        let tenant = store
            .get_tenant(&invoice.tenant_id)
            .await?
            .ok_or_else(|| BillingError::TenantNotFound {
                tenant_id: invoice.tenant_id.clone(),
            })?;

        let actual = event.account.clone().unwrap_or_default();
        if tenant.external_connected_account_ref.as_deref() != Some(actual.as_str()) {
            let violation = IntegrityViolation::ConnectedAccountMismatch {
                invoice_id: invoice.id.clone(),
                expected: tenant.external_connected_account_ref.clone(),
                actual,
            };
            tracing::error!(
                target: "pawbill::billing::webhook",
                tenant_id = %tenant.id,
                event_id = %event.id,
                violation = %violation,
                "Connected account mismatch, invoice not settled"
            );
            self.auditor
                .record(
                    AuditLogEntry::new(AuditCategory::Security, AuditSeverity::High, violation.to_string())
                        .tenant(&tenant.id)
                        .meta("violation", violation.kind())
                        .meta("event_id", &event.id)
                        .meta("invoice_id", &invoice.id),
                )
                .await;
            return Ok(WebhookOutcome::Rejected);
        }

        if invoice.is_paid() {
            return Ok(WebhookOutcome::NoChange);
        }
        if !store.mark_invoice_paid(&invoice.id, PAID_VIA_CONNECT).await? {
            return Ok(WebhookOutcome::NoChange);
        }

        tracing::info!(
            target: "pawbill::billing::webhook",
            tenant_id = %tenant.id,
            invoice_id = %invoice.id,
            "Invoice settled via connected account"
        );
        self.auditor
            .record(
                AuditLogEntry::new(AuditCategory::Subscription, AuditSeverity::Info, "Invoice settled via connected account")
                    .tenant(&tenant.id)
                    .meta("invoice_id", &invoice.id)
                    .meta("amount", invoice.amount)
                    .meta("currency", &invoice.currency),
            )
            .await;
        Ok(WebhookOutcome::Applied)
    }
}
