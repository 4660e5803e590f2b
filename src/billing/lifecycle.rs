//! Applying state machine transitions to stored tenants.
//!
//! Each application is a read, a pure [`transition`], and one conditional
//! write guarded by the tenant's version. A lost race re-reads and
//! recomputes; the billing columns are never merged field by field.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::audit::{AuditCategory, AuditLogEntry, AuditSeverity, OperationAuditor};
use super::error::BillingError;
use super::notify::{NotificationSink, PaymentFailureWarning};
use super::plans::FeatureFlags;
use super::state_machine::{BillingEvent, IntegrityViolation, LifecycleRules, Transition, transition};
use super::storage::{Tenant, TenantPatch, TenantStore};
use crate::error::PawbillError;
use crate::utils::Clock;

/// Attempts at the conditional write before giving up.
const MAX_WRITE_ATTEMPTS: u32 = 3;

/// Result of applying an event to a tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleOutcome {
    /// The tenant as written.
    Applied(Tenant),
    NoChange(&'static str),
    Rejected(IntegrityViolation),
}

/// A failed charge attempt on one of the tenant's subscription invoices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedPayment {
    pub invoice_id: String,
    pub attempt: u32,
    pub amount: i64,
    pub currency: String,
}

/// Tenants touched by a grace sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraceSweep {
    pub suspended: Vec<String>,
    pub failed: Vec<String>,
}

fn store_error(operation: &'static str) -> impl FnOnce(PawbillError) -> BillingError {
    move |e| {
        tracing::error!(
            target: "pawbill::billing::lifecycle",
            operation,
            error = %e,
            "Tenant store operation failed"
        );
        BillingError::Store {
            operation: operation.to_string(),
            message: e.to_string(),
        }
    }
}

/// Owns every write to a tenant's billing columns.
pub struct SubscriptionLifecycle<S: TenantStore + ?Sized> {
    store: Arc<S>,
    auditor: OperationAuditor,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    rules: LifecycleRules,
}

impl<S: TenantStore + ?Sized> Clone for SubscriptionLifecycle<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            auditor: self.auditor.clone(),
            notifier: Arc::clone(&self.notifier),
            clock: Arc::clone(&self.clock),
            rules: self.rules,
        }
    }
}

impl<S: TenantStore + ?Sized> SubscriptionLifecycle<S> {
    pub fn new(
        store: Arc<S>,
        auditor: OperationAuditor,
        notifier: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            auditor,
            notifier,
            clock,
            rules: LifecycleRules::default(),
        }
    }

    #[must_use]
    pub fn with_rules(mut self, rules: LifecycleRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn rules(&self) -> &LifecycleRules {
        &self.rules
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Apply `event` to the tenant.
    ///
    /// Store failures come back as [`BillingError::Store`] with nothing
    /// written. Repeated version conflicts give
    /// [`BillingError::ConcurrentModification`].
    pub async fn apply(&self, tenant_id: &str, event: &BillingEvent) -> Result<LifecycleOutcome, BillingError> {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let tenant = self
                .store
                .get_tenant(tenant_id)
                .await
                .map_err(store_error("get_tenant"))?
                .ok_or_else(|| BillingError::TenantNotFound {
                    tenant_id: tenant_id.to_string(),
                })?;
            let now = self.clock.now();

            let change = match transition(&tenant, event, now, &self.rules) {
                Transition::NoChange(reason) => {
                    tracing::debug!(
                        target: "pawbill::billing::lifecycle",
                        tenant_id,
                        event = event.name(),
                        reason,
                        "No state change"
                    );
                    return Ok(LifecycleOutcome::NoChange(reason));
                }
                Transition::Rejected(violation) => {
                    self.record_violation(&tenant.id, event, &violation).await;
                    return Ok(LifecycleOutcome::Rejected(violation));
                }
                Transition::Apply(change) => change,
            };

            change
                .billing
                .validate(now)
                .map_err(|message| BillingError::Internal {
                    message: format!("{} produced an invalid state: {}", event.name(), message),
                })?;

            let mut patch = TenantPatch::billing(change.billing);
            if let Some(customer_ref) = change.customer_ref {
                patch = patch.customer_ref(customer_ref);
            }

            let written = self
                .store
                .compare_and_update_tenant(tenant_id, tenant.version, patch.clone())
                .await
                .map_err(store_error("compare_and_update_tenant"))?;

            if written {
                let before = tenant.clone();
                let mut after = tenant;
                patch.apply_to(&mut after);
                self.record_change(&before, &after, event).await;
                return Ok(LifecycleOutcome::Applied(after));
            }

            tracing::debug!(
                target: "pawbill::billing::lifecycle",
                tenant_id,
                attempt,
                "Tenant changed during transition, retrying"
            );
        }

        tracing::warn!(
            target: "pawbill::billing::lifecycle",
            tenant_id,
            event = event.name(),
            "Gave up after repeated concurrent modifications"
        );
        Err(BillingError::ConcurrentModification {
            tenant_id: tenant_id.to_string(),
        })
    }

    /// Apply a payment failure and, if it changed anything, warn the tenant.
    ///
    /// The warning is best-effort and never fails the transition.
    pub async fn record_payment_failure(
        &self,
        tenant_id: &str,
        payment: &FailedPayment,
    ) -> Result<LifecycleOutcome, BillingError> {
        let event = BillingEvent::PaymentFailed {
            invoice_id: payment.invoice_id.clone(),
            attempt: payment.attempt,
        };
        let outcome = self.apply(tenant_id, &event).await?;
        if let LifecycleOutcome::Applied(ref tenant) = outcome {
            self.warn_tenant(tenant, payment).await;
        }
        Ok(outcome)
    }

    async fn warn_tenant(&self, tenant: &Tenant, payment: &FailedPayment) {
        // Suspended tenants get no grace window and so no warning.
        let Some(grace_period_end) = tenant.billing.grace_period_end else {
            return;
        };
        let Some(to) = &tenant.billing_email else {
            tracing::warn!(
                target: "pawbill::billing::lifecycle",
                tenant_id = %tenant.id,
                "No billing email on file, payment failure warning not sent"
            );
            return;
        };

        let warning = PaymentFailureWarning {
            to: to.clone(),
            tenant_name: tenant.name.clone(),
            grace_period_end,
            amount: payment.amount,
            currency: payment.currency.clone(),
        };
        if let Err(e) = self.notifier.send_payment_failure_warning(&warning).await {
            tracing::warn!(
                target: "pawbill::billing::lifecycle",
                tenant_id = %tenant.id,
                error = %e,
                "Failed to send payment failure warning"
            );
        }
    }

    /// Suspend every tenant whose grace period has run out.
    ///
    /// One tenant failing does not stop the sweep.
    pub async fn expire_grace_periods(&self) -> Result<GraceSweep, BillingError> {
        let now = self.clock.now();
        let tenants = self
            .store
            .list_tenants()
            .await
            .map_err(store_error("list_tenants"))?;

        let mut sweep = GraceSweep::default();
        for tenant in tenants
            .into_iter()
            .filter(|t| t.billing.grace_period_end.is_some_and(|end| end <= now))
        {
            match self.apply(&tenant.id, &BillingEvent::GraceExpired).await {
                Ok(LifecycleOutcome::Applied(_)) => sweep.suspended.push(tenant.id),
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(
                        target: "pawbill::billing::lifecycle",
                        tenant_id = %tenant.id,
                        error = %e,
                        "Grace expiry failed"
                    );
                    sweep.failed.push(tenant.id);
                }
            }
        }

        if !sweep.suspended.is_empty() {
            tracing::info!(
                target: "pawbill::billing::lifecycle",
                suspended = sweep.suspended.len(),
                "Grace periods expired"
            );
        }
        Ok(sweep)
    }

    /// Rewrite a tenant's feature flags from its plan if they drifted.
    ///
    /// Returns whether anything was written.
    pub async fn resync_feature_flags(&self, tenant_id: &str) -> Result<bool, BillingError> {
        let tenant = self
            .store
            .get_tenant(tenant_id)
            .await
            .map_err(store_error("get_tenant"))?
            .ok_or_else(|| BillingError::TenantNotFound {
                tenant_id: tenant_id.to_string(),
            })?;

        let expected = FeatureFlags::for_plan(tenant.billing.plan);
        if tenant.billing.features == expected {
            return Ok(false);
        }
        self.store
            .update_feature_flags(tenant_id, expected)
            .await
            .map_err(store_error("update_feature_flags"))?;
        self.auditor
            .record(
                AuditLogEntry::new(
                    AuditCategory::Subscription,
                    AuditSeverity::Warning,
                    "Feature flags resynced from plan",
                )
                .tenant(tenant_id)
                .meta("plan", tenant.billing.plan),
            )
            .await;
        Ok(true)
    }

    async fn record_change(&self, before: &Tenant, after: &Tenant, event: &BillingEvent) {
        let (from, to) = (&before.billing, &after.billing);
        tracing::info!(
            target: "pawbill::billing::lifecycle",
            tenant_id = %after.id,
            event = event.name(),
            from_status = %from.plan_status,
            to_status = %to.plan_status,
            plan = %to.plan,
            "Billing state changed"
        );

        let mut entry = AuditLogEntry::new(
            AuditCategory::Subscription,
            AuditSeverity::Info,
            format!("Billing state changed by {}", event.name()),
        )
        .tenant(&after.id)
        .meta("event", event.name())
        .meta("from_status", from.plan_status)
        .meta("to_status", to.plan_status)
        .meta("from_plan", from.plan)
        .meta("to_plan", to.plan);
        if let Some(until) = to.paid_until {
            entry = entry.meta("paid_until", until.to_rfc3339());
        }
        if let Some(grace) = to.grace_period_end {
            entry = entry
                .meta("grace_period_end", grace.to_rfc3339())
                .meta("payment_failure_count", to.payment_failure_count);
        }
        self.auditor.record(entry).await;
    }

    async fn record_violation(&self, tenant_id: &str, event: &BillingEvent, violation: &IntegrityViolation) {
        tracing::error!(
            target: "pawbill::billing::lifecycle",
            tenant_id,
            event = event.name(),
            violation = %violation,
            "Integrity violation, event not applied"
        );
        self.auditor
            .record(
                AuditLogEntry::new(AuditCategory::Security, AuditSeverity::High, violation.to_string())
                    .tenant(tenant_id)
                    .meta("violation", violation.kind())
                    .meta("event", event.name()),
            )
            .await;
    }
}
