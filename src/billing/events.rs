//! Typed provider events.
//!
//! Deliveries are parsed once into a [`ProviderEvent`] whose [`EventKind`] is
//! a closed enum. Event types this crate does not handle parse to
//! [`EventKind::Unrecognized`] instead of failing.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::error::BillingError;
use super::plans::{BillingCycle, PlanCode};
use super::provider::{META_BILLING_CYCLE, META_INVOICE_ID, META_PLAN, META_TENANT_ID};

/// Webhook event types.
pub mod event_types {
    pub const CHECKOUT_SESSION_COMPLETED: &str = "checkout.session.completed";
    pub const CUSTOMER_SUBSCRIPTION_CREATED: &str = "customer.subscription.created";
    pub const CUSTOMER_SUBSCRIPTION_UPDATED: &str = "customer.subscription.updated";
    pub const CUSTOMER_SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";
    pub const INVOICE_PAID: &str = "invoice.paid";
    pub const INVOICE_PAYMENT_FAILED: &str = "invoice.payment_failed";
    pub const PAYMENT_INTENT_SUCCEEDED: &str = "payment_intent.succeeded";
}

type Metadata = HashMap<String, String>;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListOf<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Recurring {
    pub interval: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PriceObject {
    pub id: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub recurring: Option<Recurring>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionItem {
    pub price: PriceObject,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl CheckoutSessionObject {
    #[must_use]
    pub fn claimed_plan(&self) -> Option<&str> {
        self.metadata.get(META_PLAN).map(String::as_str)
    }

    #[must_use]
    pub fn claimed_cycle(&self) -> Option<&str> {
        self.metadata.get(META_BILLING_CYCLE).map(String::as_str)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    pub status: String,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub items: ListOf<SubscriptionItem>,
}

impl SubscriptionObject {
    fn price(&self) -> Option<&PriceObject> {
        self.items.data.first().map(|item| &item.price)
    }

    /// Plan from the line item's price metadata.
    #[must_use]
    pub fn plan(&self) -> Option<PlanCode> {
        self.price()?
            .metadata
            .get(META_PLAN)
            .and_then(|plan| PlanCode::from_str(plan).ok())
    }

    /// Cycle from price metadata, else the price's recurring interval.
    #[must_use]
    pub fn cycle(&self) -> Option<BillingCycle> {
        let price = self.price()?;
        price
            .metadata
            .get(META_BILLING_CYCLE)
            .map(String::as_str)
            .or_else(|| price.recurring.as_ref().map(|r| r.interval.as_str()))
            .and_then(|cycle| BillingCycle::from_str(cycle).ok())
    }

    #[must_use]
    pub fn period_end(&self) -> Option<DateTime<Utc>> {
        self.current_period_end.and_then(from_unix)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Period {
    #[serde(default)]
    pub end: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvoiceLine {
    #[serde(default)]
    pub period: Option<Period>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionDetails {
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default)]
    pub amount_due: i64,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub period_end: Option<i64>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub lines: ListOf<InvoiceLine>,
    #[serde(default)]
    pub subscription_details: Option<SubscriptionDetails>,
}

impl InvoiceObject {
    /// End of the period this invoice pays for.
    ///
    /// Subscription invoices carry it on their line items; the invoice's own
    /// `period_end` is the fallback.
    #[must_use]
    pub fn paid_period_end(&self) -> Option<DateTime<Utc>> {
        self.lines
            .data
            .iter()
            .filter_map(|line| line.period.as_ref()?.end)
            .max()
            .or(self.period_end)
            .and_then(from_unix)
    }

    fn tenant_hint(&self) -> Option<&str> {
        self.metadata
            .get(META_TENANT_ID)
            .or_else(|| {
                self.subscription_details
                    .as_ref()
                    .and_then(|d| d.metadata.get(META_TENANT_ID))
            })
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntentObject {
    pub id: String,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Every event kind this crate acts on.
#[derive(Debug, Clone)]
pub enum EventKind {
    CheckoutCompleted(CheckoutSessionObject),
    SubscriptionCreated(SubscriptionObject),
    SubscriptionUpdated(SubscriptionObject),
    SubscriptionDeleted(SubscriptionObject),
    InvoicePaid(InvoiceObject),
    InvoicePaymentFailed(InvoiceObject),
    PaymentSucceeded(PaymentIntentObject),
    Unrecognized,
}

/// A verified, parsed webhook delivery.
#[derive(Debug, Clone)]
pub struct ProviderEvent {
    pub id: String,
    pub event_type: String,
    pub created: i64,
    /// Set for events raised on a tenant's connected account.
    pub account: Option<String>,
    pub kind: EventKind,
}

impl ProviderEvent {
    fn metadata(&self) -> Option<&Metadata> {
        match &self.kind {
            EventKind::CheckoutCompleted(session) => Some(&session.metadata),
            EventKind::SubscriptionCreated(sub)
            | EventKind::SubscriptionUpdated(sub)
            | EventKind::SubscriptionDeleted(sub) => Some(&sub.metadata),
            EventKind::InvoicePaid(invoice) | EventKind::InvoicePaymentFailed(invoice) => {
                Some(&invoice.metadata)
            }
            EventKind::PaymentSucceeded(intent) => Some(&intent.metadata),
            EventKind::Unrecognized => None,
        }
    }

    /// `tenant_id` stamped into the object's metadata at checkout time.
    #[must_use]
    pub fn tenant_hint(&self) -> Option<&str> {
        match &self.kind {
            EventKind::InvoicePaid(invoice) | EventKind::InvoicePaymentFailed(invoice) => {
                invoice.tenant_hint()
            }
            _ => self
                .metadata()
                .and_then(|m| m.get(META_TENANT_ID))
                .map(String::as_str),
        }
    }

    #[must_use]
    pub fn customer_ref(&self) -> Option<&str> {
        match &self.kind {
            EventKind::CheckoutCompleted(session) => session.customer.as_deref(),
            EventKind::SubscriptionCreated(sub)
            | EventKind::SubscriptionUpdated(sub)
            | EventKind::SubscriptionDeleted(sub) => sub.customer.as_deref(),
            EventKind::InvoicePaid(invoice) | EventKind::InvoicePaymentFailed(invoice) => {
                invoice.customer.as_deref()
            }
            EventKind::PaymentSucceeded(_) | EventKind::Unrecognized => None,
        }
    }

    /// CRM invoice id for a payment taken on a connected account.
    ///
    /// `None` for platform events.
    #[must_use]
    pub fn connected_invoice_id(&self) -> Option<&str> {
        self.account.as_ref()?;
        self.metadata()?.get(META_INVOICE_ID).map(String::as_str)
    }
}

#[derive(Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    created: i64,
    #[serde(default)]
    account: Option<String>,
    data: RawEventData,
}

#[derive(Deserialize)]
struct RawEventData {
    object: serde_json::Value,
}

fn object<T: DeserializeOwned>(event_type: &str, value: serde_json::Value) -> Result<T, BillingError> {
    serde_json::from_value(value).map_err(|e| BillingError::InvalidWebhookPayload {
        message: format!("{}: {}", event_type, e),
    })
}

/// Parse a verified payload.
pub fn parse_event(payload: &[u8]) -> Result<ProviderEvent, BillingError> {
    use event_types::*;

    let raw: RawEvent = serde_json::from_slice(payload).map_err(|e| BillingError::InvalidWebhookPayload {
        message: e.to_string(),
    })?;
    let value = raw.data.object;
    let t = raw.event_type.as_str();

    let kind = match t {
        CHECKOUT_SESSION_COMPLETED => EventKind::CheckoutCompleted(object(t, value)?),
        CUSTOMER_SUBSCRIPTION_CREATED => EventKind::SubscriptionCreated(object(t, value)?),
        CUSTOMER_SUBSCRIPTION_UPDATED => EventKind::SubscriptionUpdated(object(t, value)?),
        CUSTOMER_SUBSCRIPTION_DELETED => EventKind::SubscriptionDeleted(object(t, value)?),
        INVOICE_PAID => EventKind::InvoicePaid(object(t, value)?),
        INVOICE_PAYMENT_FAILED => EventKind::InvoicePaymentFailed(object(t, value)?),
        PAYMENT_INTENT_SUCCEEDED => EventKind::PaymentSucceeded(object(t, value)?),
        _ => EventKind::Unrecognized,
    };

    Ok(ProviderEvent {
        id: raw.id,
        event_type: raw.event_type,
        created: raw.created,
        account: raw.account,
        kind,
    })
}

pub(crate) fn from_unix(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(event_type: &str, object: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": "evt_1",
            "type": event_type,
            "created": 1_770_000_000,
            "data": { "object": object }
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_checkout() {
        let event = parse_event(&payload(
            "checkout.session.completed",
            json!({
                "id": "cs_1",
                "customer": "cus_1",
                "metadata": { "tenant_id": "biz_1", "plan": "TEAM", "billing_cycle": "MONTHLY" }
            }),
        ))
        .unwrap();

        assert_eq!(event.tenant_hint(), Some("biz_1"));
        assert_eq!(event.customer_ref(), Some("cus_1"));
        match event.kind {
            EventKind::CheckoutCompleted(session) => {
                assert_eq!(session.claimed_plan(), Some("TEAM"));
                assert_eq!(session.claimed_cycle(), Some("MONTHLY"));
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_subscription_plan_from_price() {
        let event = parse_event(&payload(
            "customer.subscription.updated",
            json!({
                "id": "sub_1",
                "customer": "cus_1",
                "status": "active",
                "current_period_end": 1_772_000_000,
                "items": { "data": [ {
                    "price": { "id": "price_1", "metadata": { "plan": "SOLO" }, "recurring": { "interval": "year" } }
                } ] }
            }),
        ))
        .unwrap();

        let EventKind::SubscriptionUpdated(sub) = event.kind else {
            panic!("expected subscription update");
        };
        assert_eq!(sub.plan(), Some(PlanCode::Solo));
        assert_eq!(sub.cycle(), Some(BillingCycle::Annual));
        assert_eq!(sub.period_end().map(|t| t.timestamp()), Some(1_772_000_000));
    }

    #[test]
    fn test_invoice_period_and_tenant_from_subscription_details() {
        let event = parse_event(&payload(
            "invoice.paid",
            json!({
                "id": "in_1",
                "customer": "cus_1",
                "period_end": 1_700_000_000,
                "lines": { "data": [ { "period": { "end": 1_772_000_000 } } ] },
                "subscription_details": { "metadata": { "tenant_id": "biz_7" } }
            }),
        ))
        .unwrap();

        assert_eq!(event.tenant_hint(), Some("biz_7"));
        let EventKind::InvoicePaid(invoice) = event.kind else {
            panic!("expected invoice");
        };
        assert_eq!(invoice.paid_period_end().map(|t| t.timestamp()), Some(1_772_000_000));
    }

    #[test]
    fn test_connected_invoice_requires_account() {
        let mut value: serde_json::Value = serde_json::from_slice(&payload(
            "payment_intent.succeeded",
            json!({ "id": "pi_1", "amount": 4500, "currency": "gbp", "metadata": { "invoice_id": "inv_1" } }),
        ))
        .unwrap();

        let platform = parse_event(&serde_json::to_vec(&value).unwrap()).unwrap();
        assert_eq!(platform.connected_invoice_id(), None);

        value["account"] = json!("acct_1");
        let connected = parse_event(&serde_json::to_vec(&value).unwrap()).unwrap();
        assert_eq!(connected.connected_invoice_id(), Some("inv_1"));
    }

    #[test]
    fn test_unknown_type_is_unrecognized() {
        let event = parse_event(&payload("customer.tax_id.created", json!({ "id": "txi_1" }))).unwrap();
        assert!(matches!(event.kind, EventKind::Unrecognized));
        assert_eq!(event.event_type, "customer.tax_id.created");
    }

    #[test]
    fn test_malformed_known_object_fails() {
        let err = parse_event(&payload("customer.subscription.updated", json!({ "id": "sub_1" }))).unwrap_err();
        assert!(matches!(err, BillingError::InvalidWebhookPayload { .. }));

        assert!(parse_event(b"not json").is_err());
    }
}
