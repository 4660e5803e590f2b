use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;

use crate::billing::checkout::{PriceBook, PriceEntry, RedirectPolicy};
use crate::billing::credentials::validate_api_key;
use crate::billing::plans::{BillingCycle, PlanCode};
use crate::billing::retry::RetryOptions;
use crate::billing::state_machine::LifecycleRules;
use crate::error::PawbillError;
use crate::utils::{get_env_with_prefix, parse_env_with_prefix};

/// Main configuration for the billing engine
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub billing: BillingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Provider secrets, webhook handling and lifecycle tunables.
#[derive(Clone, Deserialize)]
pub struct BillingConfig {
    /// Endpoint secret used to verify webhook signatures.
    #[serde(skip)]
    pub webhook_secret: Option<SecretString>,
    /// Provider API key.
    #[serde(skip)]
    pub stripe_secret_key: Option<SecretString>,
    #[serde(default = "default_webhook_tolerance_secs")]
    pub webhook_tolerance_secs: u64,
    /// Largest webhook body accepted, in bytes
    #[serde(default = "default_webhook_max_body_bytes")]
    pub webhook_max_body_bytes: usize,
    #[serde(default = "default_grace_period_days")]
    pub grace_period_days: u32,
    /// Hosts checkout and portal may redirect to. Empty allows any HTTPS host.
    #[serde(default)]
    pub allowed_redirect_domains: Vec<String>,
    #[serde(default)]
    pub prices: Vec<PriceEntry>,
    /// Sender address for tenant-facing billing emails.
    #[serde(default = "default_notification_from")]
    pub notification_from: String,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            webhook_secret: None,
            stripe_secret_key: None,
            webhook_tolerance_secs: default_webhook_tolerance_secs(),
            webhook_max_body_bytes: default_webhook_max_body_bytes(),
            grace_period_days: default_grace_period_days(),
            allowed_redirect_domains: Vec::new(),
            prices: Vec::new(),
            notification_from: default_notification_from(),
        }
    }
}

// Secrets are never printed, only whether they are set.
impl std::fmt::Debug for BillingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BillingConfig")
            .field("webhook_secret_set", &self.webhook_secret.is_some())
            .field("stripe_secret_key_set", &self.stripe_secret_key.is_some())
            .field("webhook_tolerance_secs", &self.webhook_tolerance_secs)
            .field("webhook_max_body_bytes", &self.webhook_max_body_bytes)
            .field("grace_period_days", &self.grace_period_days)
            .field("allowed_redirect_domains", &self.allowed_redirect_domains)
            .field("prices", &self.prices.len())
            .field("notification_from", &self.notification_from)
            .finish()
    }
}

fn default_webhook_tolerance_secs() -> u64 {
    300
}

fn default_webhook_max_body_bytes() -> usize {
    512 * 1024
}

fn default_grace_period_days() -> u32 {
    3
}

fn default_notification_from() -> String {
    "billing@pawbill.app".to_string()
}

impl BillingConfig {
    pub fn webhook_tolerance(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.webhook_tolerance_secs as i64)
    }

    pub fn lifecycle_rules(&self) -> LifecycleRules {
        LifecycleRules {
            grace_period: chrono::Duration::days(i64::from(self.grace_period_days)),
        }
    }

    pub fn price_book(&self) -> PriceBook {
        PriceBook::from_entries(self.prices.iter().cloned())
    }

    pub fn redirect_policy(&self) -> RedirectPolicy {
        RedirectPolicy::new(self.allowed_redirect_domains.iter().cloned())
    }
}

/// Retry tuning for outbound provider calls, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    #[serde(default = "default_total_timeout_ms")]
    pub total_timeout_ms: u64,
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            total_timeout_ms: default_total_timeout_ms(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    4
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_attempt_timeout_ms() -> u64 {
    10_000
}

fn default_total_timeout_ms() -> u64 {
    30_000
}

fn default_jitter_ms() -> u64 {
    1_000
}

impl RetryConfig {
    pub fn options(&self) -> RetryOptions {
        RetryOptions::new()
            .max_attempts(self.max_attempts)
            .base_delay(Duration::from_millis(self.base_delay_ms))
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .attempt_timeout(Duration::from_millis(self.attempt_timeout_ms))
            .total_timeout(Duration::from_millis(self.total_timeout_ms))
            .jitter(Duration::from_millis(self.jitter_ms))
    }
}

/// Builder for Config with environment variable support
#[must_use = "builder does nothing until you call build()"]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn with_json_logging(mut self, enabled: bool) -> Self {
        self.config.logging.json = enabled;
        self
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.billing.webhook_secret = Some(SecretString::from(secret.into()));
        self
    }

    pub fn with_stripe_secret_key(mut self, key: impl Into<String>) -> Self {
        self.config.billing.stripe_secret_key = Some(SecretString::from(key.into()));
        self
    }

    pub fn with_webhook_tolerance_secs(mut self, secs: u64) -> Self {
        self.config.billing.webhook_tolerance_secs = secs;
        self
    }

    pub fn with_grace_period_days(mut self, days: u32) -> Self {
        self.config.billing.grace_period_days = days;
        self
    }

    pub fn with_allowed_redirect_domains<I, D>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<String>,
    {
        self.config.billing.allowed_redirect_domains = domains.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_price(mut self, plan: PlanCode, cycle: BillingCycle, price_id: impl Into<String>) -> Self {
        self.config.billing.prices.retain(|p| !(p.plan == plan && p.cycle == cycle));
        self.config.billing.prices.push(PriceEntry {
            plan,
            cycle,
            price_id: price_id.into(),
        });
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    /// Load configuration from environment variables with PAWBILL_ prefix
    ///
    /// Prices are read from `PRICE_{PLAN}_{CYCLE}`, e.g. `PAWBILL_PRICE_TEAM_MONTHLY`.
    pub fn from_env(mut self) -> Self {
        if let Some(level) = get_env_with_prefix("LOG_LEVEL") {
            self.config.logging.level = level;
        }
        if let Some(json) = parse_env_with_prefix("LOG_JSON") {
            self.config.logging.json = json;
        }

        let billing = &mut self.config.billing;
        if let Some(secret) = get_env_with_prefix("WEBHOOK_SECRET") {
            billing.webhook_secret = Some(SecretString::from(secret));
        }
        if let Some(key) = get_env_with_prefix("STRIPE_SECRET_KEY") {
            billing.stripe_secret_key = Some(SecretString::from(key));
        }
        if let Some(secs) = parse_env_with_prefix("WEBHOOK_TOLERANCE_SECS") {
            billing.webhook_tolerance_secs = secs;
        }
        if let Some(bytes) = parse_env_with_prefix("WEBHOOK_MAX_BODY_BYTES") {
            billing.webhook_max_body_bytes = bytes;
        }
        if let Some(days) = parse_env_with_prefix("GRACE_PERIOD_DAYS") {
            billing.grace_period_days = days;
        }
        if let Some(domains) = get_env_with_prefix("ALLOWED_REDIRECT_DOMAINS") {
            billing.allowed_redirect_domains = domains
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(from) = get_env_with_prefix("NOTIFICATION_FROM") {
            billing.notification_from = from;
        }

        for plan in PlanCode::ALL {
            for cycle in [BillingCycle::Monthly, BillingCycle::Annual] {
                let key = format!("PRICE_{}_{}", plan.as_str(), cycle.as_str()).to_uppercase();
                if let Some(price_id) = get_env_with_prefix(&key) {
                    self = self.with_price(plan, cycle, price_id);
                }
            }
        }

        let retry = &mut self.config.retry;
        if let Some(v) = parse_env_with_prefix("RETRY_MAX_ATTEMPTS") {
            retry.max_attempts = v;
        }
        if let Some(v) = parse_env_with_prefix("RETRY_BASE_DELAY_MS") {
            retry.base_delay_ms = v;
        }
        if let Some(v) = parse_env_with_prefix("RETRY_MAX_DELAY_MS") {
            retry.max_delay_ms = v;
        }
        if let Some(v) = parse_env_with_prefix("RETRY_ATTEMPT_TIMEOUT_MS") {
            retry.attempt_timeout_ms = v;
        }
        if let Some(v) = parse_env_with_prefix("RETRY_TOTAL_TIMEOUT_MS") {
            retry.total_timeout_ms = v;
        }
        if let Some(v) = parse_env_with_prefix("RETRY_JITTER_MS") {
            retry.jitter_ms = v;
        }

        self
    }

    /// Build the configuration, validating all settings
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration is invalid:
    /// - Missing or empty webhook secret
    /// - Malformed provider API key
    /// - Invalid log level
    /// - Zero tolerances, limits or timeouts
    pub fn build(self) -> crate::error::Result<Config> {
        let config = self.config;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.to_lowercase().as_str()) {
            return Err(PawbillError::bad_request(format!(
                "Invalid log level: {}. Must be one of: {}",
                config.logging.level,
                valid_log_levels.join(", ")
            )));
        }

        match config.billing.webhook_secret {
            Some(ref secret) if !secret.expose_secret().trim().is_empty() => {}
            _ => return Err(PawbillError::bad_request("Webhook secret must be set")),
        }

        if let Some(ref key) = config.billing.stripe_secret_key {
            validate_api_key(key.expose_secret()).map_err(|e| PawbillError::bad_request(e.to_string()))?;
        }

        if config.billing.webhook_tolerance_secs == 0 {
            return Err(PawbillError::bad_request(
                "Webhook tolerance must be greater than 0",
            ));
        }

        if config.billing.webhook_max_body_bytes == 0 {
            return Err(PawbillError::bad_request(
                "Maximum webhook body size must be greater than 0",
            ));
        }

        if config.billing.grace_period_days == 0 {
            return Err(PawbillError::bad_request(
                "Grace period must be at least one day",
            ));
        }

        let retry = &config.retry;
        if retry.max_attempts == 0 {
            return Err(PawbillError::bad_request(
                "Retry max_attempts must be greater than 0",
            ));
        }
        if retry.base_delay_ms > retry.max_delay_ms {
            return Err(PawbillError::bad_request(format!(
                "Retry base delay ({} ms) exceeds max delay ({} ms)",
                retry.base_delay_ms, retry.max_delay_ms
            )));
        }
        if retry.attempt_timeout_ms == 0 || retry.total_timeout_ms == 0 {
            return Err(PawbillError::bad_request(
                "Retry timeouts must be greater than 0",
            ));
        }

        Ok(config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_requires_webhook_secret() {
        let err = ConfigBuilder::new().build().unwrap_err();
        assert!(err.to_string().contains("Webhook secret"));

        let config = ConfigBuilder::new().with_webhook_secret("whsec_test").build().unwrap();
        assert_eq!(config.billing.grace_period_days, 3);
        assert_eq!(config.billing.webhook_tolerance_secs, 300);
    }

    #[test]
    fn test_build_rejects_bad_values() {
        let base = || ConfigBuilder::new().with_webhook_secret("whsec_test");

        assert!(base().with_log_level("loud").build().is_err());
        assert!(base().with_stripe_secret_key("pk_test_not_a_secret_key").build().is_err());
        assert!(base().with_grace_period_days(0).build().is_err());
        assert!(base().with_webhook_tolerance_secs(0).build().is_err());
        assert!(base()
            .with_retry(RetryConfig {
                base_delay_ms: 5_000,
                max_delay_ms: 100,
                ..RetryConfig::default()
            })
            .build()
            .is_err());
    }

    #[test]
    fn test_with_price_replaces_existing_entry() {
        let config = ConfigBuilder::new()
            .with_webhook_secret("whsec_test")
            .with_price(PlanCode::Team, BillingCycle::Monthly, "price_old")
            .with_price(PlanCode::Team, BillingCycle::Monthly, "price_new")
            .build()
            .unwrap();
        let book = config.billing.price_book();
        assert_eq!(book.len(), 1);
        assert_eq!(book.price_id(PlanCode::Team, BillingCycle::Monthly).unwrap(), "price_new");
    }

    #[test]
    fn test_from_env() {
        unsafe {
            std::env::set_var("PAWBILL_WEBHOOK_SECRET", "whsec_from_env");
            std::env::set_var("PAWBILL_GRACE_PERIOD_DAYS", "5");
            std::env::set_var("PAWBILL_ALLOWED_REDIRECT_DOMAINS", "pawbill.app, pawbill.dev ,");
            std::env::set_var("PAWBILL_PRICE_SOLO_ANNUAL", "price_solo_year");
            std::env::set_var("PAWBILL_RETRY_MAX_ATTEMPTS", "2");
        }

        let config = ConfigBuilder::new().from_env().build().unwrap();

        unsafe {
            std::env::remove_var("PAWBILL_WEBHOOK_SECRET");
            std::env::remove_var("PAWBILL_GRACE_PERIOD_DAYS");
            std::env::remove_var("PAWBILL_ALLOWED_REDIRECT_DOMAINS");
            std::env::remove_var("PAWBILL_PRICE_SOLO_ANNUAL");
            std::env::remove_var("PAWBILL_RETRY_MAX_ATTEMPTS");
        }

        assert_eq!(config.billing.grace_period_days, 5);
        assert_eq!(config.billing.lifecycle_rules().grace_period, chrono::Duration::days(5));
        assert_eq!(
            config.billing.allowed_redirect_domains,
            vec!["pawbill.app".to_string(), "pawbill.dev".to_string()]
        );
        assert_eq!(
            config
                .billing
                .price_book()
                .price_id(PlanCode::Solo, BillingCycle::Annual)
                .unwrap(),
            "price_solo_year"
        );
        assert_eq!(config.retry.options().max_attempts, 2);
    }

    #[test]
    fn test_debug_hides_secrets() {
        let config = ConfigBuilder::new()
            .with_webhook_secret("whsec_super_secret")
            .build()
            .unwrap();
        let printed = format!("{:?}", config);
        assert!(!printed.contains("whsec_super_secret"));
        assert!(printed.contains("webhook_secret_set: true"));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: Config = serde_json::from_str(
            r#"{ "billing": { "prices": [ { "plan": "TEAM", "cycle": "ANNUAL", "price_id": "price_t_a" } ] } }"#,
        )
        .unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.retry, RetryConfig::default());
        assert_eq!(config.billing.price_book().len(), 1);
    }
}
