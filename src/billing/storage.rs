//! Tenant storage abstraction.
//!
//! The relational store lives outside this crate; [`TenantStore`] is the
//! slice of it the billing engine needs. All billing columns of a tenant are
//! written together through [`TenantPatch`] so a transition is never half
//! applied.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::plans::{BillingCycle, FeatureFlags, PlanCode};
use crate::error::{PawbillError, Result};

/// Billing status of a tenant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanStatus {
    Trial,
    Paid,
    Suspended,
}

impl PlanStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trial => "TRIAL",
            Self::Paid => "PAID",
            Self::Suspended => "SUSPENDED",
        }
    }
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The billing columns of a tenant record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingState {
    pub plan: PlanCode,
    pub plan_status: PlanStatus,
    pub plan_billing_cycle: Option<BillingCycle>,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub paid_until: Option<DateTime<Utc>>,
    pub grace_period_end: Option<DateTime<Utc>>,
    pub payment_failure_count: u32,
    pub last_payment_failure_at: Option<DateTime<Utc>>,
    /// `"{invoice}#{attempt}"` of the failure last applied.
    pub last_payment_failure_ref: Option<String>,
    pub suspension_reason: Option<String>,
    pub features: FeatureFlags,
}

impl BillingState {
    /// A fresh tenant trialling `plan` until `trial_ends_at`.
    pub fn trial(plan: PlanCode, trial_ends_at: DateTime<Utc>) -> Self {
        Self {
            plan,
            plan_status: PlanStatus::Trial,
            plan_billing_cycle: None,
            trial_ends_at: Some(trial_ends_at),
            paid_at: None,
            paid_until: None,
            grace_period_end: None,
            payment_failure_count: 0,
            last_payment_failure_at: None,
            last_payment_failure_ref: None,
            suspension_reason: None,
            features: FeatureFlags::for_plan(plan),
        }
    }

    /// Change plan. Feature flags follow the plan, always.
    pub fn set_plan(&mut self, plan: PlanCode) {
        self.plan = plan;
        self.features = FeatureFlags::for_plan(plan);
    }

    /// Drop every payment-failure marker.
    pub fn clear_payment_failures(&mut self) {
        self.grace_period_end = None;
        self.payment_failure_count = 0;
        self.last_payment_failure_at = None;
        self.last_payment_failure_ref = None;
    }

    #[must_use]
    pub fn in_grace(&self, now: DateTime<Utc>) -> bool {
        self.grace_period_end.is_some_and(|end| end > now)
    }

    /// Check the record-level invariants as of `now`.
    ///
    /// A running grace period carries a paid tenant past `paid_until`.
    pub fn validate(&self, now: DateTime<Utc>) -> std::result::Result<(), String> {
        if self.plan_status == PlanStatus::Paid {
            match self.paid_until {
                Some(until) if until > now || self.in_grace(now) => {}
                Some(until) => return Err(format!("PAID with paid_until {} not in the future", until)),
                None => return Err("PAID without paid_until".to_string()),
            }
        }
        if self.grace_period_end.is_some() && self.payment_failure_count == 0 {
            return Err("grace period without a recorded payment failure".to_string());
        }
        if self.features != FeatureFlags::for_plan(self.plan) {
            return Err(format!("feature flags do not match plan {}", self.plan));
        }
        Ok(())
    }
}

/// A tenant (business) account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub billing_email: Option<String>,
    pub billing: BillingState,
    pub external_customer_ref: Option<String>,
    pub external_connected_account_ref: Option<String>,
    /// Bumped on every write. Used for optimistic concurrency.
    pub version: u64,
}

impl Tenant {
    pub fn new_trial(
        id: impl Into<String>,
        name: impl Into<String>,
        plan: PlanCode,
        trial_ends_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            billing_email: None,
            billing: BillingState::trial(plan, trial_ends_at),
            external_customer_ref: None,
            external_connected_account_ref: None,
            version: 0,
        }
    }

    #[must_use]
    pub fn with_billing_email(mut self, email: impl Into<String>) -> Self {
        self.billing_email = Some(email.into());
        self
    }
}

/// Columns to overwrite on a tenant. `None` leaves a column untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TenantPatch {
    pub billing: Option<BillingState>,
    pub external_customer_ref: Option<String>,
    pub external_connected_account_ref: Option<String>,
}

impl TenantPatch {
    #[must_use]
    pub fn billing(state: BillingState) -> Self {
        Self {
            billing: Some(state),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn customer_ref(mut self, customer_ref: impl Into<String>) -> Self {
        self.external_customer_ref = Some(customer_ref.into());
        self
    }

    #[must_use]
    pub fn connected_account_ref(mut self, account_ref: impl Into<String>) -> Self {
        self.external_connected_account_ref = Some(account_ref.into());
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.billing.is_none()
            && self.external_customer_ref.is_none()
            && self.external_connected_account_ref.is_none()
    }

    /// Apply to a tenant and bump its version.
    pub fn apply_to(self, tenant: &mut Tenant) {
        if let Some(billing) = self.billing {
            tenant.billing = billing;
        }
        if let Some(customer_ref) = self.external_customer_ref {
            tenant.external_customer_ref = Some(customer_ref);
        }
        if let Some(account_ref) = self.external_connected_account_ref {
            tenant.external_connected_account_ref = Some(account_ref);
        }
        tenant.version += 1;
    }
}

/// A CRM invoice a tenant raised against one of its own clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    pub id: String,
    pub tenant_id: String,
    /// Minor currency units.
    pub amount: i64,
    pub currency: String,
    pub paid_at: Option<DateTime<Utc>>,
    pub paid_via: Option<String>,
}

impl Invoice {
    #[must_use]
    pub fn is_paid(&self) -> bool {
        self.paid_at.is_some()
    }
}

/// Storage operations the billing engine needs.
#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn get_tenant(&self, tenant_id: &str) -> Result<Option<Tenant>>;

    /// Unconditional atomic write. Returns the updated tenant.
    async fn update_tenant(&self, tenant_id: &str, patch: TenantPatch) -> Result<Tenant>;

    /// Atomic write only if the stored version still equals `expected_version`.
    ///
    /// Returns `false` when another writer got there first.
    async fn compare_and_update_tenant(
        &self,
        tenant_id: &str,
        expected_version: u64,
        patch: TenantPatch,
    ) -> Result<bool>;

    async fn update_feature_flags(&self, tenant_id: &str, flags: FeatureFlags) -> Result<()>;

    async fn list_tenants(&self) -> Result<Vec<Tenant>>;

    /// Find the tenant owning a provider customer.
    async fn find_tenant_by_customer_ref(&self, customer_ref: &str) -> Result<Option<Tenant>> {
        Ok(self
            .list_tenants()
            .await?
            .into_iter()
            .find(|t| t.external_customer_ref.as_deref() == Some(customer_ref)))
    }

    /// Active staff and admin seats.
    async fn count_active_seats(&self, tenant_id: &str) -> Result<u32>;

    async fn count_clients(&self, tenant_id: &str) -> Result<u32>;

    async fn get_invoice(&self, invoice_id: &str) -> Result<Option<Invoice>>;

    /// Mark an invoice paid. Returns `false` if it already was.
    async fn mark_invoice_paid(&self, invoice_id: &str, via: &str) -> Result<bool>;
}

// ============================================================================
// In-memory implementation
// ============================================================================

/// In-memory tenant store for development and tests.
///
/// Cheap to clone; clones share data.
#[derive(Default, Clone)]
pub struct InMemoryTenantStore {
    inner: Arc<InMemoryTenantStoreInner>,
}

#[derive(Default)]
struct InMemoryTenantStoreInner {
    tenants: RwLock<HashMap<String, Tenant>>,
    invoices: RwLock<HashMap<String, Invoice>>,
    seats: RwLock<HashMap<String, u32>>,
    clients: RwLock<HashMap<String, u32>>,
    fail_writes: AtomicBool,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl InMemoryTenantStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_tenant(&self, tenant: Tenant) {
        write(&self.inner.tenants).insert(tenant.id.clone(), tenant);
    }

    pub fn insert_invoice(&self, invoice: Invoice) {
        write(&self.inner.invoices).insert(invoice.id.clone(), invoice);
    }

    pub fn set_seat_count(&self, tenant_id: &str, seats: u32) {
        write(&self.inner.seats).insert(tenant_id.to_string(), seats);
    }

    pub fn set_client_count(&self, tenant_id: &str, clients: u32) {
        write(&self.inner.clients).insert(tenant_id.to_string(), clients);
    }

    /// Make every write fail, to simulate the database going away.
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Synchronous snapshot of a tenant.
    pub fn tenant(&self, tenant_id: &str) -> Option<Tenant> {
        read(&self.inner.tenants).get(tenant_id).cloned()
    }

    fn check_writable(&self, operation: &str) -> Result<()> {
        if self.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(PawbillError::service_unavailable(format!(
                "tenant store unavailable during {}",
                operation
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl TenantStore for InMemoryTenantStore {
    async fn get_tenant(&self, tenant_id: &str) -> Result<Option<Tenant>> {
        Ok(self.tenant(tenant_id))
    }

    async fn update_tenant(&self, tenant_id: &str, patch: TenantPatch) -> Result<Tenant> {
        self.check_writable("update_tenant")?;
        let mut tenants = write(&self.inner.tenants);
        let tenant = tenants
            .get_mut(tenant_id)
            .ok_or_else(|| PawbillError::not_found(format!("tenant {}", tenant_id)))?;
        patch.apply_to(tenant);
        Ok(tenant.clone())
    }

    async fn compare_and_update_tenant(
        &self,
        tenant_id: &str,
        expected_version: u64,
        patch: TenantPatch,
    ) -> Result<bool> {
        self.check_writable("compare_and_update_tenant")?;
        let mut tenants = write(&self.inner.tenants);
        let tenant = tenants
            .get_mut(tenant_id)
            .ok_or_else(|| PawbillError::not_found(format!("tenant {}", tenant_id)))?;
        if tenant.version != expected_version {
            return Ok(false);
        }
        patch.apply_to(tenant);
        Ok(true)
    }

    async fn update_feature_flags(&self, tenant_id: &str, flags: FeatureFlags) -> Result<()> {
        self.check_writable("update_feature_flags")?;
        let mut tenants = write(&self.inner.tenants);
        let tenant = tenants
            .get_mut(tenant_id)
            .ok_or_else(|| PawbillError::not_found(format!("tenant {}", tenant_id)))?;
        tenant.billing.features = flags;
        tenant.version += 1;
        Ok(())
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>> {
        let mut tenants: Vec<Tenant> = read(&self.inner.tenants).values().cloned().collect();
        tenants.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tenants)
    }

    async fn count_active_seats(&self, tenant_id: &str) -> Result<u32> {
        Ok(read(&self.inner.seats).get(tenant_id).copied().unwrap_or(1))
    }

    async fn count_clients(&self, tenant_id: &str) -> Result<u32> {
        Ok(read(&self.inner.clients).get(tenant_id).copied().unwrap_or(0))
    }

    async fn get_invoice(&self, invoice_id: &str) -> Result<Option<Invoice>> {
        Ok(read(&self.inner.invoices).get(invoice_id).cloned())
    }

    async fn mark_invoice_paid(&self, invoice_id: &str, via: &str) -> Result<bool> {
        self.check_writable("mark_invoice_paid")?;
        let mut invoices = write(&self.inner.invoices);
        let invoice = invoices
            .get_mut(invoice_id)
            .ok_or_else(|| PawbillError::not_found(format!("invoice {}", invoice_id)))?;
        if invoice.is_paid() {
            return Ok(false);
        }
        invoice.paid_at = Some(Utc::now());
        invoice.paid_via = Some(via.to_string());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn tenant(id: &str) -> Tenant {
        Tenant::new_trial(id, "Muddy Paws", PlanCode::Solo, Utc::now() + Duration::days(14))
    }

    #[test]
    fn test_trial_state_mirrors_plan_flags() {
        let t = tenant("biz_1");
        assert_eq!(t.billing.plan_status, PlanStatus::Trial);
        assert_eq!(t.billing.features, FeatureFlags::for_plan(PlanCode::Solo));
        assert!(t.billing.validate(Utc::now()).is_ok());
    }

    #[test]
    fn test_validate_catches_broken_invariants() {
        let now = Utc::now();
        let mut state = BillingState::trial(PlanCode::Team, now);

        state.plan_status = PlanStatus::Paid;
        assert!(state.validate(now).is_err());
        state.paid_until = Some(now - Duration::days(1));
        assert!(state.validate(now).is_err());
        state.paid_until = Some(now + Duration::days(30));
        assert!(state.validate(now).is_ok());

        state.grace_period_end = Some(now + Duration::days(3));
        assert!(state.validate(now).is_err());
        state.payment_failure_count = 1;
        assert!(state.validate(now).is_ok());

        // Grace carries a lapsed paid window.
        state.paid_until = Some(now - Duration::hours(1));
        assert!(state.validate(now).is_ok());
        state.grace_period_end = Some(now - Duration::minutes(1));
        assert!(state.validate(now).is_err());
        state.grace_period_end = Some(now + Duration::days(3));

        state.features.route_optimisation = true;
        assert!(state.validate(now).is_err());
    }

    #[tokio::test]
    async fn test_compare_and_update_detects_conflict() {
        let store = InMemoryTenantStore::new();
        store.insert_tenant(tenant("biz_1"));

        let mut state = store.tenant("biz_1").unwrap().billing;
        state.set_plan(PlanCode::Team);

        assert!(store
            .compare_and_update_tenant("biz_1", 0, TenantPatch::billing(state.clone()))
            .await
            .unwrap());
        // Version moved to 1, so a writer holding version 0 loses.
        assert!(!store
            .compare_and_update_tenant("biz_1", 0, TenantPatch::billing(state))
            .await
            .unwrap());

        let stored = store.get_tenant("biz_1").await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.billing.plan, PlanCode::Team);
        assert!(stored.billing.features.automations);
    }

    #[tokio::test]
    async fn test_patch_leaves_untouched_columns() {
        let store = InMemoryTenantStore::new();
        store.insert_tenant(tenant("biz_1"));

        let updated = store
            .update_tenant("biz_1", TenantPatch::default().customer_ref("cus_1"))
            .await
            .unwrap();
        assert_eq!(updated.external_customer_ref.as_deref(), Some("cus_1"));
        assert_eq!(updated.billing.plan, PlanCode::Solo);
        assert!(updated.external_connected_account_ref.is_none());
    }

    #[tokio::test]
    async fn test_find_by_customer_ref() {
        let store = InMemoryTenantStore::new();
        let mut t = tenant("biz_1");
        t.external_customer_ref = Some("cus_abc".to_string());
        store.insert_tenant(t);
        store.insert_tenant(tenant("biz_2"));

        let found = store.find_tenant_by_customer_ref("cus_abc").await.unwrap();
        assert_eq!(found.map(|t| t.id), Some("biz_1".to_string()));
        assert!(store.find_tenant_by_customer_ref("cus_zzz").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_invoice_paid_once() {
        let store = InMemoryTenantStore::new();
        store.insert_invoice(Invoice {
            id: "inv_1".to_string(),
            tenant_id: "biz_1".to_string(),
            amount: 4500,
            currency: "gbp".to_string(),
            paid_at: None,
            paid_via: None,
        });

        assert!(store.mark_invoice_paid("inv_1", "stripe_connect").await.unwrap());
        assert!(!store.mark_invoice_paid("inv_1", "stripe_connect").await.unwrap());

        let invoice = store.get_invoice("inv_1").await.unwrap().unwrap();
        assert!(invoice.is_paid());
        assert_eq!(invoice.paid_via.as_deref(), Some("stripe_connect"));
    }

    #[tokio::test]
    async fn test_failed_writes_surface_as_errors() {
        let store = InMemoryTenantStore::new();
        store.insert_tenant(tenant("biz_1"));
        store.set_fail_writes(true);

        let err = store
            .update_tenant("biz_1", TenantPatch::default().customer_ref("cus_1"))
            .await
            .unwrap_err();
        assert!(matches!(err, PawbillError::ServiceUnavailable(_)));
        assert!(store.tenant("biz_1").unwrap().external_customer_ref.is_none());
    }
}
