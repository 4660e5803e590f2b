//! Subscription state machine.
//!
//! [`transition`] is a pure function from (tenant, event, now) to the next
//! billing state. It never performs I/O; [`SubscriptionLifecycle`] owns the
//! read-modify-write around it.
//!
//! Every transition compares the event's own payload with what the tenant
//! already reflects, so replaying an event returns [`Transition::NoChange`].
//!
//! [`SubscriptionLifecycle`]: super::lifecycle::SubscriptionLifecycle

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Months, Utc};

use super::plans::{BillingCycle, PlanCode};
use super::provider::CheckoutPurchase;
use super::storage::{BillingState, PlanStatus, Tenant};

pub const REASON_PAYMENT_FAILED: &str = "Payment failed";
pub const REASON_SUBSCRIPTION_CANCELLED: &str = "Subscription cancelled";

/// Tunables for the lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LifecycleRules {
    /// How long service continues after a failed payment.
    pub grace_period: Duration,
}

impl Default for LifecycleRules {
    fn default() -> Self {
        Self {
            grace_period: Duration::days(3),
        }
    }
}

/// Provider-side subscription status.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Other(String),
}

impl From<&str> for SubscriptionStatus {
    fn from(status: &str) -> Self {
        match status {
            "active" => Self::Active,
            "trialing" => Self::Trialing,
            "past_due" => Self::PastDue,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => f.write_str("active"),
            Self::Trialing => f.write_str("trialing"),
            Self::PastDue => f.write_str("past_due"),
            Self::Other(status) => f.write_str(status),
        }
    }
}

/// An input to the state machine, already tied to a tenant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BillingEvent {
    /// A subscription checkout finished. `claimed_*` come from the session
    /// metadata, which the client influenced; `purchase` is what the
    /// provider says was actually bought.
    CheckoutCompleted {
        claimed_plan: Option<String>,
        claimed_cycle: Option<String>,
        purchase: CheckoutPurchase,
        customer_ref: Option<String>,
    },
    SubscriptionChanged {
        status: SubscriptionStatus,
        plan: Option<PlanCode>,
        cycle: Option<BillingCycle>,
        current_period_end: Option<DateTime<Utc>>,
        customer_ref: Option<String>,
    },
    SubscriptionDeleted,
    InvoicePaid {
        period_end: Option<DateTime<Utc>>,
    },
    PaymentFailed {
        invoice_id: String,
        attempt: u32,
    },
    /// Emitted by the grace sweep, never by the provider.
    GraceExpired,
}

impl BillingEvent {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::CheckoutCompleted { .. } => "checkout_completed",
            Self::SubscriptionChanged { .. } => "subscription_changed",
            Self::SubscriptionDeleted => "subscription_deleted",
            Self::InvoicePaid { .. } => "invoice_paid",
            Self::PaymentFailed { .. } => "payment_failed",
            Self::GraceExpired => "grace_expired",
        }
    }
}

/// An event that must never be applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IntegrityViolation {
    /// The purchased price does not carry the plan and cycle the session claimed.
    CheckoutPriceMismatch {
        claimed_plan: Option<String>,
        claimed_cycle: Option<String>,
        price_plan: Option<String>,
        price_cycle: Option<String>,
    },
    /// A connected-account payment names an account other than the one on
    /// file for the invoice's tenant.
    ConnectedAccountMismatch {
        invoice_id: String,
        expected: Option<String>,
        actual: String,
    },
}

impl IntegrityViolation {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CheckoutPriceMismatch { .. } => "checkout_price_mismatch",
            Self::ConnectedAccountMismatch { .. } => "connected_account_mismatch",
        }
    }
}

fn or_none(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("<none>")
}

impl fmt::Display for IntegrityViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CheckoutPriceMismatch {
                claimed_plan,
                claimed_cycle,
                price_plan,
                price_cycle,
            } => write!(
                f,
                "Checkout claimed {}/{} but purchased price is {}/{}",
                or_none(claimed_plan),
                or_none(claimed_cycle),
                or_none(price_plan),
                or_none(price_cycle)
            ),
            Self::ConnectedAccountMismatch {
                invoice_id,
                expected,
                actual,
            } => write!(
                f,
                "Payment for invoice {} came from account {} but tenant account is {}",
                invoice_id,
                actual,
                or_none(expected)
            ),
        }
    }
}

/// New billing columns to write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppliedChange {
    pub billing: BillingState,
    /// Provider customer to record, when the tenant has none yet.
    pub customer_ref: Option<String>,
}

/// What an event does to a tenant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    Apply(AppliedChange),
    NoChange(&'static str),
    Rejected(IntegrityViolation),
}

/// Compute the transition for `event` against `tenant` as of `now`.
#[must_use]
pub fn transition(tenant: &Tenant, event: &BillingEvent, now: DateTime<Utc>, rules: &LifecycleRules) -> Transition {
    let current = &tenant.billing;
    match event {
        BillingEvent::CheckoutCompleted {
            claimed_plan,
            claimed_cycle,
            purchase,
            customer_ref,
        } => checkout_completed(tenant, claimed_plan, claimed_cycle, purchase, customer_ref, now),

        BillingEvent::SubscriptionChanged {
            status,
            plan,
            cycle,
            current_period_end,
            customer_ref,
        } => match status {
            SubscriptionStatus::Active | SubscriptionStatus::Trialing => {
                subscription_active(tenant, *plan, *cycle, *current_period_end, customer_ref, now)
            }
            SubscriptionStatus::PastDue => {
                if current.in_grace(now) {
                    return Transition::NoChange("grace period still running");
                }
                if current.plan_status == PlanStatus::Suspended
                    && current.suspension_reason.as_deref() == Some(REASON_PAYMENT_FAILED)
                {
                    return Transition::NoChange("already suspended for payment failure");
                }
                let mut next = current.clone();
                next.plan_status = PlanStatus::Suspended;
                next.suspension_reason = Some(REASON_PAYMENT_FAILED.to_string());
                next.grace_period_end = None;
                apply(next, None)
            }
            SubscriptionStatus::Other(_) => Transition::NoChange("subscription status not tracked"),
        },

        BillingEvent::SubscriptionDeleted => {
            let lowest = PlanCode::lowest_paid();
            if current.plan_status == PlanStatus::Suspended
                && current.plan == lowest
                && current.suspension_reason.as_deref() == Some(REASON_SUBSCRIPTION_CANCELLED)
            {
                return Transition::NoChange("subscription already cancelled");
            }
            let mut next = current.clone();
            next.set_plan(lowest);
            next.plan_status = PlanStatus::Suspended;
            next.suspension_reason = Some(REASON_SUBSCRIPTION_CANCELLED.to_string());
            next.grace_period_end = None;
            apply(next, None)
        }

        BillingEvent::InvoicePaid { period_end } => {
            let until = match (*period_end, current.paid_until) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
            // Money arrived now. An invoice without a future period (a lapsed
            // renewal paid late) still buys one cycle from today.
            let until = until.filter(|until| *until > now).unwrap_or_else(|| {
                add_cycle(now, current.plan_billing_cycle.unwrap_or(BillingCycle::Monthly))
            });
            if current.plan_status == PlanStatus::Paid
                && current.paid_until == Some(until)
                && current.payment_failure_count == 0
                && current.grace_period_end.is_none()
                && current.suspension_reason.is_none()
            {
                return Transition::NoChange("invoice already reflected");
            }
            let mut next = current.clone();
            next.plan_status = PlanStatus::Paid;
            next.paid_at = Some(now);
            next.paid_until = Some(until);
            next.suspension_reason = None;
            next.clear_payment_failures();
            apply(next, None)
        }

        BillingEvent::PaymentFailed { invoice_id, attempt } => {
            let failure_ref = format!("{}#{}", invoice_id, attempt);
            if current.last_payment_failure_ref.as_deref() == Some(failure_ref.as_str()) {
                return Transition::NoChange("payment failure already recorded");
            }
            let mut next = current.clone();
            next.payment_failure_count = current.payment_failure_count.saturating_add(1);
            next.last_payment_failure_at = Some(now);
            next.last_payment_failure_ref = Some(failure_ref);
            // A suspended tenant has no service to continue: the failure is
            // counted but no grace window opens and the reason stands.
            if current.plan_status != PlanStatus::Suspended {
                let grace_end = now + rules.grace_period;
                next.grace_period_end = Some(grace_end);
                next.suspension_reason = Some(grace_reason(grace_end));
            }
            apply(next, None)
        }

        BillingEvent::GraceExpired => match current.grace_period_end {
            Some(end) if end <= now => {
                let mut next = current.clone();
                next.plan_status = PlanStatus::Suspended;
                next.suspension_reason = Some(REASON_PAYMENT_FAILED.to_string());
                next.grace_period_end = None;
                apply(next, None)
            }
            Some(_) => Transition::NoChange("grace period still running"),
            None => Transition::NoChange("no grace period"),
        },
    }
}

/// Suspension reason shown while a grace period runs.
#[must_use]
pub fn grace_reason(grace_end: DateTime<Utc>) -> String {
    format!(
        "{}; service continues until {}",
        REASON_PAYMENT_FAILED,
        grace_end.format("%Y-%m-%d %H:%M UTC")
    )
}

fn apply(billing: BillingState, customer_ref: Option<String>) -> Transition {
    Transition::Apply(AppliedChange { billing, customer_ref })
}

/// Customer ref worth recording: only when the tenant has none.
fn new_customer_ref(tenant: &Tenant, customer_ref: &Option<String>) -> Option<String> {
    match (&tenant.external_customer_ref, customer_ref) {
        (None, Some(customer_ref)) => Some(customer_ref.clone()),
        _ => None,
    }
}

fn add_cycle(now: DateTime<Utc>, cycle: BillingCycle) -> DateTime<Utc> {
    now.checked_add_months(Months::new(cycle.months()))
        .unwrap_or_else(|| now + Duration::days(30 * i64::from(cycle.months())))
}

fn verified_purchase(
    claimed_plan: &Option<String>,
    claimed_cycle: &Option<String>,
    purchase: &CheckoutPurchase,
) -> Option<(PlanCode, BillingCycle)> {
    let claimed_plan = PlanCode::from_str(claimed_plan.as_deref()?).ok()?;
    let claimed_cycle = BillingCycle::from_str(claimed_cycle.as_deref()?).ok()?;
    let price_plan = PlanCode::from_str(purchase.price_plan.as_deref()?).ok()?;
    let price_cycle = BillingCycle::from_str(purchase.price_cycle.as_deref()?).ok()?;

    (claimed_plan == price_plan && claimed_cycle == price_cycle).then_some((price_plan, price_cycle))
}

fn checkout_completed(
    tenant: &Tenant,
    claimed_plan: &Option<String>,
    claimed_cycle: &Option<String>,
    purchase: &CheckoutPurchase,
    customer_ref: &Option<String>,
    now: DateTime<Utc>,
) -> Transition {
    let Some((plan, cycle)) = verified_purchase(claimed_plan, claimed_cycle, purchase) else {
        return Transition::Rejected(IntegrityViolation::CheckoutPriceMismatch {
            claimed_plan: claimed_plan.clone(),
            claimed_cycle: claimed_cycle.clone(),
            price_plan: purchase.price_plan.clone(),
            price_cycle: purchase.price_cycle.clone(),
        });
    };

    let current = &tenant.billing;
    let already_reflected = current.plan_status == PlanStatus::Paid
        && current.plan == plan
        && current.plan_billing_cycle == Some(cycle)
        && current.suspension_reason.is_none()
        && current.grace_period_end.is_none();

    let period_end = purchase
        .current_period_end
        .and_then(|secs| DateTime::from_timestamp(secs, 0));
    let paid_until = match period_end {
        Some(end) if end <= now => return Transition::NoChange("checkout period already ended"),
        Some(end) => {
            if already_reflected && current.paid_until == Some(end) {
                return Transition::NoChange("checkout already reflected");
            }
            end
        }
        None => {
            if already_reflected && current.paid_until.is_some_and(|until| until > now) {
                return Transition::NoChange("checkout already reflected");
            }
            add_cycle(now, cycle)
        }
    };

    let mut next = current.clone();
    next.set_plan(plan);
    next.plan_status = PlanStatus::Paid;
    next.plan_billing_cycle = Some(cycle);
    next.paid_at = Some(now);
    next.paid_until = Some(paid_until);
    next.suspension_reason = None;
    next.clear_payment_failures();
    apply(next, new_customer_ref(tenant, customer_ref))
}

fn subscription_active(
    tenant: &Tenant,
    plan: Option<PlanCode>,
    cycle: Option<BillingCycle>,
    period_end: Option<DateTime<Utc>>,
    customer_ref: &Option<String>,
    now: DateTime<Utc>,
) -> Transition {
    let current = &tenant.billing;
    let plan = plan.unwrap_or(current.plan);
    let cycle = cycle.or(current.plan_billing_cycle);

    // An older period never shortens a paid window already recorded.
    let known_until = current
        .paid_until
        .filter(|_| current.plan_status == PlanStatus::Paid);
    let until = match (period_end, known_until) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };
    let Some(until) = until.filter(|until| *until > now) else {
        return Transition::NoChange("subscription period already ended");
    };

    if current.plan_status == PlanStatus::Paid
        && current.plan == plan
        && current.plan_billing_cycle == cycle
        && current.paid_until == Some(until)
        && current.suspension_reason.is_none()
    {
        return Transition::NoChange("subscription already reflected");
    }

    let mut next = current.clone();
    next.set_plan(plan);
    next.plan_status = PlanStatus::Paid;
    next.plan_billing_cycle = cycle;
    next.paid_until = Some(until);
    next.suspension_reason = None;
    apply(next, new_customer_ref(tenant, customer_ref))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::plans::FeatureFlags;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 9, 30, 0).unwrap()
    }

    fn rules() -> LifecycleRules {
        LifecycleRules::default()
    }

    fn trial_tenant() -> Tenant {
        Tenant::new_trial("biz_1", "Barkside Grooming", PlanCode::Starter, now() + Duration::days(7))
    }

    fn paid_tenant(plan: PlanCode) -> Tenant {
        let mut tenant = trial_tenant();
        tenant.billing.set_plan(plan);
        tenant.billing.plan_status = PlanStatus::Paid;
        tenant.billing.plan_billing_cycle = Some(BillingCycle::Monthly);
        tenant.billing.paid_at = Some(now() - Duration::days(10));
        tenant.billing.paid_until = Some(now() + Duration::days(20));
        tenant
    }

    fn checkout(claimed: (&str, &str), price: (&str, &str), period_end: Option<DateTime<Utc>>) -> BillingEvent {
        BillingEvent::CheckoutCompleted {
            claimed_plan: Some(claimed.0.to_string()),
            claimed_cycle: Some(claimed.1.to_string()),
            purchase: CheckoutPurchase {
                session_id: "cs_1".to_string(),
                price_id: Some("price_team_m".to_string()),
                price_plan: Some(price.0.to_string()),
                price_cycle: Some(price.1.to_string()),
                current_period_end: period_end.map(|t| t.timestamp()),
            },
            customer_ref: Some("cus_1".to_string()),
        }
    }

    fn applied(t: Transition) -> AppliedChange {
        match t {
            Transition::Apply(change) => change,
            other => panic!("expected Apply, got {:?}", other),
        }
    }

    /// Apply a transition to a tenant the way the lifecycle would.
    fn step(tenant: &mut Tenant, event: &BillingEvent, at: DateTime<Utc>) -> Transition {
        let t = transition(tenant, event, at, &rules());
        if let Transition::Apply(ref change) = t {
            tenant.billing = change.billing.clone();
            if let Some(ref customer_ref) = change.customer_ref {
                tenant.external_customer_ref = Some(customer_ref.clone());
            }
        }
        t
    }

    #[test]
    fn test_checkout_upgrades_trial() {
        let period_end = now() + Duration::days(30);
        let change = applied(transition(
            &trial_tenant(),
            &checkout(("TEAM", "MONTHLY"), ("TEAM", "MONTHLY"), Some(period_end)),
            now(),
            &rules(),
        ));

        assert_eq!(change.billing.plan, PlanCode::Team);
        assert_eq!(change.billing.plan_status, PlanStatus::Paid);
        assert_eq!(change.billing.plan_billing_cycle, Some(BillingCycle::Monthly));
        assert_eq!(change.billing.paid_at, Some(now()));
        assert_eq!(change.billing.paid_until, Some(period_end));
        assert_eq!(change.billing.features, FeatureFlags::for_plan(PlanCode::Team));
        assert_eq!(change.customer_ref.as_deref(), Some("cus_1"));
        assert!(change.billing.validate(now()).is_ok());
    }

    #[test]
    fn test_checkout_accepts_case_and_interval_aliases() {
        let change = applied(transition(
            &trial_tenant(),
            &checkout(("solo", "annual"), ("SOLO", "yearly"), None),
            now(),
            &rules(),
        ));
        assert_eq!(change.billing.plan, PlanCode::Solo);
        assert_eq!(change.billing.plan_billing_cycle, Some(BillingCycle::Annual));
        // No period end from the provider: one cycle from now.
        assert_eq!(
            change.billing.paid_until,
            Some(Utc.with_ymd_and_hms(2027, 3, 10, 9, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_checkout_mismatch_is_rejected() {
        let tenant = trial_tenant();
        let t = transition(
            &tenant,
            &checkout(("ENTERPRISE", "MONTHLY"), ("STARTER", "MONTHLY"), Some(now() + Duration::days(30))),
            now(),
            &rules(),
        );
        match t {
            Transition::Rejected(violation) => {
                assert_eq!(violation.kind(), "checkout_price_mismatch");
                assert!(violation.to_string().contains("ENTERPRISE/MONTHLY"));
            }
            other => panic!("expected Rejected, got {:?}", other),
        }
    }

    #[test]
    fn test_checkout_missing_price_metadata_is_rejected() {
        let event = BillingEvent::CheckoutCompleted {
            claimed_plan: Some("TEAM".to_string()),
            claimed_cycle: Some("MONTHLY".to_string()),
            purchase: CheckoutPurchase {
                session_id: "cs_1".to_string(),
                ..CheckoutPurchase::default()
            },
            customer_ref: None,
        };
        assert!(matches!(
            transition(&trial_tenant(), &event, now(), &rules()),
            Transition::Rejected(IntegrityViolation::CheckoutPriceMismatch { .. })
        ));
    }

    #[test]
    fn test_checkout_redelivery_is_noop() {
        let mut tenant = trial_tenant();
        let event = checkout(("TEAM", "MONTHLY"), ("TEAM", "MONTHLY"), Some(now() + Duration::days(30)));

        assert!(matches!(step(&mut tenant, &event, now()), Transition::Apply(_)));
        let after_first = tenant.clone();
        assert!(matches!(
            step(&mut tenant, &event, now() + Duration::minutes(5)),
            Transition::NoChange(_)
        ));
        assert_eq!(tenant, after_first);
    }

    #[test]
    fn test_subscription_active_updates_plan_and_period() {
        let mut tenant = paid_tenant(PlanCode::Solo);
        tenant.billing.plan_status = PlanStatus::Suspended;
        tenant.billing.suspension_reason = Some(REASON_PAYMENT_FAILED.to_string());
        let period_end = now() + Duration::days(365);

        let change = applied(transition(
            &tenant,
            &BillingEvent::SubscriptionChanged {
                status: SubscriptionStatus::Active,
                plan: Some(PlanCode::Enterprise),
                cycle: Some(BillingCycle::Annual),
                current_period_end: Some(period_end),
                customer_ref: None,
            },
            now(),
            &rules(),
        ));
        assert_eq!(change.billing.plan_status, PlanStatus::Paid);
        assert_eq!(change.billing.plan, PlanCode::Enterprise);
        assert_eq!(change.billing.paid_until, Some(period_end));
        assert!(change.billing.suspension_reason.is_none());
        assert!(change.billing.features.route_optimisation);
    }

    #[test]
    fn test_stale_subscription_update_is_noop() {
        let tenant = trial_tenant();
        let t = transition(
            &tenant,
            &BillingEvent::SubscriptionChanged {
                status: SubscriptionStatus::Active,
                plan: Some(PlanCode::Team),
                cycle: Some(BillingCycle::Monthly),
                current_period_end: Some(now() - Duration::days(1)),
                customer_ref: None,
            },
            now(),
            &rules(),
        );
        assert!(matches!(t, Transition::NoChange(_)));
    }

    #[test]
    fn test_past_due_suspends_without_grace() {
        let change = applied(transition(
            &paid_tenant(PlanCode::Team),
            &BillingEvent::SubscriptionChanged {
                status: SubscriptionStatus::PastDue,
                plan: None,
                cycle: None,
                current_period_end: None,
                customer_ref: None,
            },
            now(),
            &rules(),
        ));
        assert_eq!(change.billing.plan_status, PlanStatus::Suspended);
        assert_eq!(change.billing.suspension_reason.as_deref(), Some(REASON_PAYMENT_FAILED));
        assert_eq!(change.billing.plan, PlanCode::Team);
    }

    #[test]
    fn test_grace_wins_over_past_due() {
        let mut tenant = paid_tenant(PlanCode::Team);
        step(
            &mut tenant,
            &BillingEvent::PaymentFailed {
                invoice_id: "in_1".to_string(),
                attempt: 1,
            },
            now(),
        );
        let past_due = BillingEvent::SubscriptionChanged {
            status: SubscriptionStatus::PastDue,
            plan: None,
            cycle: None,
            current_period_end: None,
            customer_ref: None,
        };

        assert_eq!(
            transition(&tenant, &past_due, now() + Duration::days(1), &rules()),
            Transition::NoChange("grace period still running")
        );
        let change = applied(transition(&tenant, &past_due, now() + Duration::days(4), &rules()));
        assert_eq!(change.billing.plan_status, PlanStatus::Suspended);
    }

    #[test]
    fn test_other_subscription_status_is_ignored() {
        let t = transition(
            &paid_tenant(PlanCode::Solo),
            &BillingEvent::SubscriptionChanged {
                status: SubscriptionStatus::from("incomplete"),
                plan: None,
                cycle: None,
                current_period_end: None,
                customer_ref: None,
            },
            now(),
            &rules(),
        );
        assert!(matches!(t, Transition::NoChange(_)));
    }

    #[test]
    fn test_deletion_downgrades_and_suspends() {
        let mut tenant = paid_tenant(PlanCode::Team);
        let change = applied(step(&mut tenant, &BillingEvent::SubscriptionDeleted, now()));

        assert_eq!(change.billing.plan, PlanCode::Starter);
        assert_eq!(change.billing.plan_status, PlanStatus::Suspended);
        assert_eq!(
            change.billing.suspension_reason.as_deref(),
            Some(REASON_SUBSCRIPTION_CANCELLED)
        );
        assert_eq!(change.billing.features, FeatureFlags::for_plan(PlanCode::Starter));

        assert!(matches!(
            step(&mut tenant, &BillingEvent::SubscriptionDeleted, now()),
            Transition::NoChange(_)
        ));
    }

    #[test]
    fn test_payment_failure_starts_grace() {
        let mut tenant = paid_tenant(PlanCode::Solo);
        tenant.billing.payment_failure_count = 2;
        tenant.billing.grace_period_end = Some(now() + Duration::hours(1));

        let change = applied(transition(
            &tenant,
            &BillingEvent::PaymentFailed {
                invoice_id: "in_9".to_string(),
                attempt: 3,
            },
            now(),
            &rules(),
        ));
        assert_eq!(change.billing.payment_failure_count, 3);
        assert_eq!(change.billing.grace_period_end, Some(now() + Duration::days(3)));
        assert_eq!(change.billing.last_payment_failure_at, Some(now()));
        assert_eq!(change.billing.plan_status, PlanStatus::Paid);
        assert_eq!(
            change.billing.suspension_reason.as_deref(),
            Some("Payment failed; service continues until 2026-03-13 09:30 UTC")
        );
    }

    #[test]
    fn test_payment_failure_redelivery_counts_once() {
        let mut tenant = paid_tenant(PlanCode::Solo);
        let event = BillingEvent::PaymentFailed {
            invoice_id: "in_1".to_string(),
            attempt: 1,
        };
        step(&mut tenant, &event, now());
        assert!(matches!(
            step(&mut tenant, &event, now() + Duration::hours(2)),
            Transition::NoChange(_)
        ));
        assert_eq!(tenant.billing.payment_failure_count, 1);

        // The provider's next attempt on the same invoice counts again.
        step(
            &mut tenant,
            &BillingEvent::PaymentFailed {
                invoice_id: "in_1".to_string(),
                attempt: 2,
            },
            now() + Duration::days(1),
        );
        assert_eq!(tenant.billing.payment_failure_count, 2);
    }

    #[test]
    fn test_invoice_paid_clears_failures() {
        let mut tenant = paid_tenant(PlanCode::Solo);
        for attempt in 1..=4 {
            step(
                &mut tenant,
                &BillingEvent::PaymentFailed {
                    invoice_id: "in_1".to_string(),
                    attempt,
                },
                now(),
            );
        }
        assert_eq!(tenant.billing.payment_failure_count, 4);

        let period_end = now() + Duration::days(31);
        let change = applied(step(
            &mut tenant,
            &BillingEvent::InvoicePaid {
                period_end: Some(period_end),
            },
            now(),
        ));
        assert_eq!(change.billing.payment_failure_count, 0);
        assert!(change.billing.grace_period_end.is_none());
        assert!(change.billing.suspension_reason.is_none());
        assert_eq!(change.billing.paid_until, Some(period_end));
        assert_eq!(change.billing.paid_at, Some(now()));

        assert!(matches!(
            step(
                &mut tenant,
                &BillingEvent::InvoicePaid {
                    period_end: Some(period_end)
                },
                now()
            ),
            Transition::NoChange(_)
        ));
    }

    #[test]
    fn test_invoice_paid_never_shortens_paid_window() {
        let tenant = paid_tenant(PlanCode::Solo);
        let existing = tenant.billing.paid_until;
        let mut suspended = tenant.clone();
        suspended.billing.suspension_reason = Some("x".to_string());

        let change = applied(transition(
            &suspended,
            &BillingEvent::InvoicePaid {
                period_end: Some(now() + Duration::days(2)),
            },
            now(),
            &rules(),
        ));
        assert_eq!(change.billing.paid_until, existing);
    }

    #[test]
    fn test_late_payment_after_lapsed_window_restores_service() {
        // Renewal failed two hours after the paid window closed.
        let mut tenant = paid_tenant(PlanCode::Team);
        tenant.billing.paid_until = Some(now() - Duration::hours(2));
        step(
            &mut tenant,
            &BillingEvent::PaymentFailed {
                invoice_id: "in_2".to_string(),
                attempt: 1,
            },
            now(),
        );
        assert_eq!(tenant.billing.payment_failure_count, 1);
        assert!(tenant.billing.grace_period_end.is_some());

        for period_end in [None, Some(now() - Duration::hours(1))] {
            let mut paying = tenant.clone();
            let change = applied(step(&mut paying, &BillingEvent::InvoicePaid { period_end }, now()));
            assert_eq!(change.billing.plan_status, PlanStatus::Paid);
            assert_eq!(change.billing.paid_until, Some(now() + Months::new(1)));
            assert_eq!(change.billing.payment_failure_count, 0);
            assert!(change.billing.grace_period_end.is_none());
            assert!(change.billing.suspension_reason.is_none());
            assert!(change.billing.validate(now()).is_ok());

            // The grace sweep has nothing left to suspend.
            assert!(matches!(
                transition(&paying, &BillingEvent::GraceExpired, now() + Duration::days(4), &rules()),
                Transition::NoChange(_)
            ));
            // Redelivery changes nothing.
            assert!(matches!(
                step(&mut paying, &BillingEvent::InvoicePaid { period_end }, now() + Duration::hours(1)),
                Transition::NoChange(_)
            ));
        }
    }

    #[test]
    fn test_invoice_without_future_period_uses_tenant_cycle() {
        let mut tenant = paid_tenant(PlanCode::Solo);
        tenant.billing.plan_billing_cycle = Some(BillingCycle::Annual);
        tenant.billing.plan_status = PlanStatus::Suspended;
        tenant.billing.suspension_reason = Some(REASON_PAYMENT_FAILED.to_string());
        tenant.billing.paid_until = Some(now() - Duration::days(5));

        let change = applied(transition(
            &tenant,
            &BillingEvent::InvoicePaid { period_end: None },
            now(),
            &rules(),
        ));
        assert_eq!(change.billing.plan_status, PlanStatus::Paid);
        assert_eq!(change.billing.paid_until, Some(now() + Months::new(12)));
    }

    #[test]
    fn test_payment_failure_while_suspended_keeps_suspension() {
        let mut tenant = paid_tenant(PlanCode::Team);
        tenant.billing.plan_status = PlanStatus::Suspended;
        tenant.billing.suspension_reason = Some(REASON_SUBSCRIPTION_CANCELLED.to_string());

        let change = applied(transition(
            &tenant,
            &BillingEvent::PaymentFailed {
                invoice_id: "in_5".to_string(),
                attempt: 1,
            },
            now(),
            &rules(),
        ));
        assert_eq!(change.billing.plan_status, PlanStatus::Suspended);
        assert_eq!(
            change.billing.suspension_reason.as_deref(),
            Some(REASON_SUBSCRIPTION_CANCELLED)
        );
        assert!(change.billing.grace_period_end.is_none());
        assert_eq!(change.billing.payment_failure_count, 1);
        assert_eq!(change.billing.last_payment_failure_ref.as_deref(), Some("in_5#1"));
    }

    #[test]
    fn test_grace_expiry() {
        let mut tenant = paid_tenant(PlanCode::Team);
        step(
            &mut tenant,
            &BillingEvent::PaymentFailed {
                invoice_id: "in_1".to_string(),
                attempt: 1,
            },
            now(),
        );

        assert!(matches!(
            transition(&tenant, &BillingEvent::GraceExpired, now() + Duration::days(2), &rules()),
            Transition::NoChange(_)
        ));

        let later = now() + Duration::days(3);
        let change = applied(transition(&tenant, &BillingEvent::GraceExpired, later, &rules()));
        assert_eq!(change.billing.plan_status, PlanStatus::Suspended);
        assert_eq!(change.billing.suspension_reason.as_deref(), Some(REASON_PAYMENT_FAILED));
        assert!(change.billing.grace_period_end.is_none());
        assert_eq!(change.billing.payment_failure_count, 1);
        assert!(change.billing.validate(later).is_ok());
    }

    #[test]
    fn test_paid_results_always_have_future_paid_until() {
        let events = [
            checkout(("TEAM", "MONTHLY"), ("TEAM", "MONTHLY"), Some(now() + Duration::days(30))),
            BillingEvent::InvoicePaid {
                period_end: Some(now() + Duration::days(30)),
            },
            BillingEvent::SubscriptionChanged {
                status: SubscriptionStatus::Active,
                plan: Some(PlanCode::Solo),
                cycle: Some(BillingCycle::Monthly),
                current_period_end: Some(now() + Duration::days(30)),
                customer_ref: None,
            },
        ];
        for event in &events {
            if let Transition::Apply(change) = transition(&trial_tenant(), event, now(), &rules()) {
                assert!(change.billing.validate(now()).is_ok(), "{}", event.name());
            }
        }
    }
}
