use std::sync::Arc;
use std::time::Duration;

use crate::billing::audit::{AuditSink, OperationAuditor, TracingAuditSink};
use crate::billing::checkout::BillingService;
use crate::billing::credentials::{CredentialSource, EnvCredentialSource, StaticCredentialSource};
use crate::billing::entitlements::EntitlementGate;
use crate::billing::lifecycle::SubscriptionLifecycle;
use crate::billing::notify::{NoOpNotificationSink, NotificationSink};
use crate::billing::provider::PaymentProvider;
use crate::billing::retry::RetryPolicy;
use crate::billing::storage::TenantStore;
use crate::billing::webhook::{SignatureVerifier, WebhookReconciler};
use crate::config::Config;
use crate::error::{PawbillError, Result};
use crate::utils::{Clock, SystemClock};

/// Process-wide billing handle
///
/// Built once at startup, before the webhook router is served. Cloning is
/// cheap; every clone shares the same engine.
#[derive(Clone)]
pub struct BillingContext {
    inner: Arc<BillingContextInner>,
}

struct BillingContextInner {
    reconciler: WebhookReconciler<dyn TenantStore>,
    billing: BillingService<dyn TenantStore>,
    entitlements: EntitlementGate<dyn TenantStore>,
    auditor: OperationAuditor,
    webhook_max_body_bytes: usize,
}

impl BillingContext {
    /// Builder pattern for constructing BillingContext
    pub fn builder(config: Config) -> BillingContextBuilder {
        BillingContextBuilder::new(config)
    }

    pub fn reconciler(&self) -> &WebhookReconciler<dyn TenantStore> {
        &self.inner.reconciler
    }

    pub fn lifecycle(&self) -> &SubscriptionLifecycle<dyn TenantStore> {
        self.inner.reconciler.lifecycle()
    }

    pub fn billing(&self) -> &BillingService<dyn TenantStore> {
        &self.inner.billing
    }

    pub fn entitlements(&self) -> &EntitlementGate<dyn TenantStore> {
        &self.inner.entitlements
    }

    pub fn auditor(&self) -> &OperationAuditor {
        &self.inner.auditor
    }

    pub fn webhook_max_body_bytes(&self) -> usize {
        self.inner.webhook_max_body_bytes
    }

    /// Suspend tenants whose grace period ran out, every `every`.
    ///
    /// The task runs until the returned handle is aborted or the runtime
    /// shuts down.
    pub fn spawn_grace_sweeper(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let ctx = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match ctx.lifecycle().expire_grace_periods().await {
                    Ok(sweep) if !sweep.failed.is_empty() => {
                        tracing::warn!(
                            target: "pawbill::app",
                            failed = sweep.failed.len(),
                            "Grace sweep left tenants unsuspended"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(target: "pawbill::app", error = %e, "Grace sweep failed");
                    }
                }
            }
        })
    }
}

/// Builder for BillingContext with fluent API
#[must_use = "builder does nothing until you call build()"]
pub struct BillingContextBuilder {
    config: Config,
    store: Option<Arc<dyn TenantStore>>,
    provider: Option<Arc<dyn PaymentProvider>>,
    credentials: Option<Arc<dyn CredentialSource>>,
    audit_sink: Arc<dyn AuditSink>,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
}

impl BillingContextBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store: None,
            provider: None,
            credentials: None,
            audit_sink: Arc::new(TracingAuditSink),
            notifier: Arc::new(NoOpNotificationSink),
            clock: Arc::new(SystemClock),
        }
    }

    /// Set the tenant store
    pub fn with_store(mut self, store: Arc<dyn TenantStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the payment provider client
    pub fn with_provider(mut self, provider: Arc<dyn PaymentProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Set the credential source
    ///
    /// Defaults to the configured secret key, or the environment when none
    /// is configured.
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialSource>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = sink;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// # Errors
    ///
    /// Fails when the store or provider is missing, or when no webhook
    /// secret is configured.
    pub fn build(self) -> Result<BillingContext> {
        let store = self
            .store
            .ok_or_else(|| PawbillError::internal("Tenant store not configured"))?;
        let provider = self
            .provider
            .ok_or_else(|| PawbillError::internal("Payment provider not configured"))?;
        let billing_config = &self.config.billing;
        let secret = billing_config
            .webhook_secret
            .clone()
            .ok_or_else(|| PawbillError::internal("Webhook secret not configured"))?;

        let credentials: Arc<dyn CredentialSource> = match (self.credentials, &billing_config.stripe_secret_key) {
            (Some(credentials), _) => credentials,
            (None, Some(key)) => Arc::new(StaticCredentialSource::new(key.clone())?),
            (None, None) => Arc::new(EnvCredentialSource::new(chrono::Duration::minutes(5))),
        };

        let auditor = OperationAuditor::new(self.audit_sink);
        let retry = || RetryPolicy::new(self.config.retry.options(), auditor.clone());

        let lifecycle = SubscriptionLifecycle::new(
            Arc::clone(&store),
            auditor.clone(),
            self.notifier,
            Arc::clone(&self.clock),
        )
        .with_rules(billing_config.lifecycle_rules());

        let verifier = SignatureVerifier::new(secret, Arc::clone(&self.clock))
            .with_tolerance(billing_config.webhook_tolerance());

        let reconciler = WebhookReconciler::new(
            verifier,
            lifecycle,
            Arc::clone(&provider),
            Arc::clone(&credentials),
            retry(),
            auditor.clone(),
        );

        let billing = BillingService::new(
            Arc::clone(&store),
            provider,
            credentials,
            retry(),
            billing_config.price_book(),
        )
        .with_redirect_policy(billing_config.redirect_policy());

        let entitlements = EntitlementGate::new(store, self.clock);

        tracing::info!(
            target: "pawbill::app",
            grace_period_days = billing_config.grace_period_days,
            prices = billing_config.prices.len(),
            "Billing context ready"
        );

        Ok(BillingContext {
            inner: Arc::new(BillingContextInner {
                reconciler,
                billing,
                entitlements,
                auditor,
                webhook_max_body_bytes: billing_config.webhook_max_body_bytes,
            }),
        })
    }
}
