//! Entitlement checks.
//!
//! The gate answers "may this tenant do X?" from the plan catalog, the
//! tenant's billing state and live usage counts. It only decides; logging a
//! decision for analytics is up to the caller (see
//! [`EntitlementDecision::audit_entry`]).

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::audit::{AuditCategory, AuditLogEntry, AuditSeverity};
use super::plans::{Feature, LimitCheckResult, PlanCode};
use super::storage::{BillingState, PlanStatus, Tenant, TenantStore};
use crate::error::Result;
use crate::utils::Clock;

/// Whether, and why, a tenant may use the product right now.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AccessStatus {
    Trial { ends_at: DateTime<Utc> },
    Paid { until: DateTime<Utc> },
    /// Paid tenant whose last payment failed; service continues until `until`.
    Grace { until: DateTime<Utc> },
    Suspended { reason: String },
}

impl AccessStatus {
    /// Derive access from billing state. Each branch reads a single driver
    /// field: the trial end, the grace end, the paid window, or the
    /// suspension reason.
    #[must_use]
    pub fn of(billing: &BillingState, now: DateTime<Utc>) -> Self {
        match billing.plan_status {
            PlanStatus::Trial => match billing.trial_ends_at {
                Some(ends_at) if ends_at > now => Self::Trial { ends_at },
                _ => Self::Suspended {
                    reason: "Trial expired".to_string(),
                },
            },
            PlanStatus::Paid => {
                if let Some(until) = billing.grace_period_end {
                    if until > now {
                        return Self::Grace { until };
                    }
                    return Self::Suspended {
                        reason: "Payment failed".to_string(),
                    };
                }
                match billing.paid_until {
                    Some(until) if until > now => Self::Paid { until },
                    _ => Self::Suspended {
                        reason: "Subscription expired".to_string(),
                    },
                }
            }
            PlanStatus::Suspended => Self::Suspended {
                reason: billing
                    .suspension_reason
                    .clone()
                    .unwrap_or_else(|| "Account suspended".to_string()),
            },
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Suspended { .. })
    }
}

/// Why an action was denied.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum DenialReason {
    Suspended { reason: String },
    SeatLimitReached,
    ClientLimitReached,
    FeatureNotIncluded { feature: String },
    UnknownFeature { feature: String },
}

impl DenialReason {
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Suspended { reason } => format!("Account suspended: {}", reason),
            Self::SeatLimitReached => "Your plan's staff seat limit has been reached".to_string(),
            Self::ClientLimitReached => "Your plan's client limit has been reached".to_string(),
            Self::FeatureNotIncluded { feature } => {
                format!("'{}' is not included in your plan", feature)
            }
            Self::UnknownFeature { feature } => format!("Unknown feature '{}'", feature),
        }
    }
}

/// Outcome of an entitlement check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenialReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<u32>,
    /// Suspended tenants keep access to billing and account settings.
    pub allow_admin_access: bool,
}

impl EntitlementDecision {
    #[must_use]
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            limit: None,
            current: None,
            allow_admin_access: true,
        }
    }

    #[must_use]
    pub fn deny(reason: DenialReason) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            limit: None,
            current: None,
            allow_admin_access: true,
        }
    }

    #[must_use]
    fn with_usage(mut self, limit: Option<u32>, current: u32) -> Self {
        self.limit = limit;
        self.current = Some(current);
        self
    }

    /// Audit entry a caller can record for upsell analytics.
    #[must_use]
    pub fn audit_entry(&self, tenant_id: &str, action: &str) -> AuditLogEntry {
        let message = if self.allowed {
            format!("Entitlement granted: {}", action)
        } else {
            format!("Entitlement denied: {}", action)
        };
        let mut entry = AuditLogEntry::new(AuditCategory::Entitlement, AuditSeverity::Low, message)
            .tenant(tenant_id)
            .meta("action", action)
            .meta("allowed", self.allowed);
        if let Some(ref reason) = self.reason {
            entry = entry.meta("reason", reason.message());
        }
        if let Some(limit) = self.limit {
            entry = entry.meta("limit", limit);
        }
        if let Some(current) = self.current {
            entry = entry.meta("current", current);
        }
        entry
    }
}

/// A capped resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitedResource {
    Staff,
    Clients,
}

/// One cap the tenant's current usage would break.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LimitViolation {
    pub resource: LimitedResource,
    pub current: u32,
    pub limit: u32,
}

/// Result of a downgrade check. Lists every violation, not just the first.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DowngradeCheck {
    pub allowed: bool,
    pub target: PlanCode,
    pub violations: Vec<LimitViolation>,
}

// ============================================================================
// Pure decisions
// ============================================================================

fn access_denial(tenant: &Tenant, now: DateTime<Utc>) -> Option<EntitlementDecision> {
    match AccessStatus::of(&tenant.billing, now) {
        AccessStatus::Suspended { reason } => {
            Some(EntitlementDecision::deny(DenialReason::Suspended { reason }))
        }
        _ => None,
    }
}

fn capacity_decision(
    tenant: &Tenant,
    now: DateTime<Utc>,
    limit: Option<u32>,
    current: u32,
    at_limit: DenialReason,
) -> EntitlementDecision {
    if let Some(denied) = access_denial(tenant, now) {
        return denied.with_usage(limit, current);
    }
    match LimitCheckResult::check(limit, current) {
        LimitCheckResult::Unlimited => EntitlementDecision::allow().with_usage(None, current),
        LimitCheckResult::WithinLimit { current, max } => {
            EntitlementDecision::allow().with_usage(Some(max), current)
        }
        LimitCheckResult::AtLimit { current, max } => {
            EntitlementDecision::deny(at_limit).with_usage(Some(max), current)
        }
    }
}

/// Decide whether one more staff seat fits.
#[must_use]
pub fn decide_add_seat(tenant: &Tenant, seats: u32, now: DateTime<Utc>) -> EntitlementDecision {
    let limit = tenant.billing.plan.plan().max_seats;
    capacity_decision(tenant, now, limit, seats, DenialReason::SeatLimitReached)
}

/// Decide whether one more client record fits.
#[must_use]
pub fn decide_add_client(tenant: &Tenant, clients: u32, now: DateTime<Utc>) -> EntitlementDecision {
    let limit = tenant.billing.plan.plan().max_clients;
    capacity_decision(tenant, now, limit, clients, DenialReason::ClientLimitReached)
}

/// Decide feature access from the tenant's mirrored flags.
#[must_use]
pub fn decide_use_feature(tenant: &Tenant, feature_name: &str, now: DateTime<Utc>) -> EntitlementDecision {
    if let Some(denied) = access_denial(tenant, now) {
        return denied;
    }
    let Ok(feature) = Feature::from_str(feature_name) else {
        return EntitlementDecision::deny(DenialReason::UnknownFeature {
            feature: feature_name.to_string(),
        });
    };
    if tenant.billing.features.is_enabled(feature) {
        EntitlementDecision::allow()
    } else {
        EntitlementDecision::deny(DenialReason::FeatureNotIncluded {
            feature: feature.as_str().to_string(),
        })
    }
}

/// Collect every cap of `target` that current usage exceeds.
#[must_use]
pub fn decide_downgrade(seats: u32, clients: u32, target: PlanCode) -> DowngradeCheck {
    let plan = target.plan();
    let violations: Vec<LimitViolation> = [
        (LimitedResource::Staff, seats, plan.max_seats),
        (LimitedResource::Clients, clients, plan.max_clients),
    ]
    .into_iter()
    .filter_map(|(resource, current, limit)| match limit {
        Some(limit) if current > limit => Some(LimitViolation {
            resource,
            current,
            limit,
        }),
        _ => None,
    })
    .collect();

    DowngradeCheck {
        allowed: violations.is_empty(),
        target,
        violations,
    }
}

// ============================================================================
// Gate
// ============================================================================

/// Entitlement checks backed by live usage counts.
pub struct EntitlementGate<S: TenantStore + ?Sized> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S: TenantStore + ?Sized> Clone for EntitlementGate<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S: TenantStore + ?Sized> EntitlementGate<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Current access status for a tenant.
    #[must_use]
    pub fn access_status(&self, tenant: &Tenant) -> AccessStatus {
        AccessStatus::of(&tenant.billing, self.clock.now())
    }

    pub async fn can_add_seat(&self, tenant: &Tenant) -> Result<EntitlementDecision> {
        let seats = self.store.count_active_seats(&tenant.id).await?;
        Ok(decide_add_seat(tenant, seats, self.clock.now()))
    }

    pub async fn can_add_client(&self, tenant: &Tenant) -> Result<EntitlementDecision> {
        let clients = self.store.count_clients(&tenant.id).await?;
        Ok(decide_add_client(tenant, clients, self.clock.now()))
    }

    #[must_use]
    pub fn can_use_feature(&self, tenant: &Tenant, feature_name: &str) -> EntitlementDecision {
        decide_use_feature(tenant, feature_name, self.clock.now())
    }

    pub async fn can_downgrade(&self, tenant: &Tenant, target: PlanCode) -> Result<DowngradeCheck> {
        let seats = self.store.count_active_seats(&tenant.id).await?;
        let clients = self.store.count_clients(&tenant.id).await?;
        Ok(decide_downgrade(seats, clients, target))
    }
}
