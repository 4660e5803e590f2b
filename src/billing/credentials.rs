//! Provider credentials.
//!
//! Credentials are short-lived values handed to each provider call rather
//! than state hidden inside a client. A [`CredentialSource`] hands out
//! possibly-cached [`ProviderCredentials`] for routine calls and
//! [`FreshCredentials`] for calls that must never run on a cached key.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};

use crate::error::{PawbillError, Result};
use crate::utils::get_env_with_prefix;

// ============================================================================
// API Key Validation
// ============================================================================

/// Error returned when API key validation fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidApiKeyError {
    pub reason: String,
}

impl std::fmt::Display for InvalidApiKeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invalid provider API key: {}", self.reason)
    }
}

impl std::error::Error for InvalidApiKeyError {}

impl From<InvalidApiKeyError> for PawbillError {
    fn from(err: InvalidApiKeyError) -> Self {
        PawbillError::Internal(err.to_string())
    }
}

/// Accepts secret (`sk_`) and restricted (`rk_`) keys in test or live mode.
pub fn validate_api_key(key: &str) -> std::result::Result<(), InvalidApiKeyError> {
    const MIN_KEY_LENGTH: usize = 20;

    if key.is_empty() {
        return Err(InvalidApiKeyError {
            reason: "API key cannot be empty".to_string(),
        });
    }

    if key.len() < MIN_KEY_LENGTH {
        return Err(InvalidApiKeyError {
            reason: format!("API key too short (minimum {} characters)", MIN_KEY_LENGTH),
        });
    }

    let valid_prefixes = ["sk_test_", "sk_live_", "rk_test_", "rk_live_"];
    if !valid_prefixes.iter().any(|prefix| key.starts_with(prefix)) {
        return Err(InvalidApiKeyError {
            reason: "API key must start with sk_test_, sk_live_, rk_test_, or rk_live_".to_string(),
        });
    }

    Ok(())
}

// ============================================================================
// Credential values
// ============================================================================

/// A provider API key plus when it was fetched.
#[derive(Clone)]
pub struct ProviderCredentials {
    secret_key: SecretString,
    fetched_at: DateTime<Utc>,
    serial: u64,
}

impl ProviderCredentials {
    /// Validates the key format before wrapping it.
    pub fn new(secret_key: impl Into<String>, serial: u64) -> std::result::Result<Self, InvalidApiKeyError> {
        let secret_key: String = secret_key.into();
        validate_api_key(&secret_key)?;
        Ok(Self {
            secret_key: SecretString::from(secret_key),
            fetched_at: Utc::now(),
            serial,
        })
    }

    #[must_use]
    pub fn secret_key(&self) -> &SecretString {
        &self.secret_key
    }

    #[must_use]
    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    /// Monotonic fetch number assigned by the source.
    #[must_use]
    pub fn serial(&self) -> u64 {
        self.serial
    }

    #[must_use]
    pub fn is_test_mode(&self) -> bool {
        let key = self.secret_key.expose_secret();
        key.starts_with("sk_test_") || key.starts_with("rk_test_")
    }
}

impl std::fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderCredentials")
            .field("fetched_at", &self.fetched_at)
            .field("serial", &self.serial)
            .field("is_test_mode", &self.is_test_mode())
            .finish_non_exhaustive()
    }
}

/// Credentials fetched for this call only, bypassing any cache.
///
/// Only a [`CredentialSource`] produces these.
#[derive(Debug, Clone)]
pub struct FreshCredentials(ProviderCredentials);

impl FreshCredentials {
    pub(crate) fn from_fetch(credentials: ProviderCredentials) -> Self {
        Self(credentials)
    }

    #[must_use]
    pub fn credentials(&self) -> &ProviderCredentials {
        &self.0
    }

    #[must_use]
    pub fn serial(&self) -> u64 {
        self.0.serial
    }
}

impl std::ops::Deref for FreshCredentials {
    type Target = ProviderCredentials;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// ============================================================================
// Sources
// ============================================================================

/// Where provider credentials come from.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Credentials for routine calls. May be served from a short-lived cache.
    async fn credentials(&self) -> Result<ProviderCredentials>;

    /// Credentials fetched now, never from a cache.
    async fn fresh_credentials(&self) -> Result<FreshCredentials>;
}

/// A fixed key, typically from configuration.
pub struct StaticCredentialSource {
    secret_key: SecretString,
    serial: AtomicU64,
}

impl StaticCredentialSource {
    pub fn new(secret_key: SecretString) -> std::result::Result<Self, InvalidApiKeyError> {
        validate_api_key(secret_key.expose_secret())?;
        Ok(Self {
            secret_key,
            serial: AtomicU64::new(0),
        })
    }

    fn issue(&self) -> Result<ProviderCredentials> {
        let serial = self.serial.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ProviderCredentials::new(self.secret_key.expose_secret(), serial)?)
    }
}

#[async_trait]
impl CredentialSource for StaticCredentialSource {
    async fn credentials(&self) -> Result<ProviderCredentials> {
        self.issue()
    }

    async fn fresh_credentials(&self) -> Result<FreshCredentials> {
        Ok(FreshCredentials::from_fetch(self.issue()?))
    }
}

impl std::fmt::Debug for StaticCredentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentialSource").finish_non_exhaustive()
    }
}

/// Reads `STRIPE_SECRET_KEY` (or `PAWBILL_STRIPE_SECRET_KEY`) from the
/// environment, caching it for `ttl`. Rotated keys are picked up once the
/// cache expires, or immediately by any fresh fetch.
pub struct EnvCredentialSource {
    ttl: Duration,
    cached: Mutex<Option<ProviderCredentials>>,
    serial: AtomicU64,
}

impl EnvCredentialSource {
    pub const KEY: &'static str = "STRIPE_SECRET_KEY";

    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cached: Mutex::new(None),
            serial: AtomicU64::new(0),
        }
    }

    fn load(&self) -> Result<ProviderCredentials> {
        let key = get_env_with_prefix(Self::KEY)
            .ok_or_else(|| PawbillError::internal("STRIPE_SECRET_KEY is not set"))?;
        let serial = self.serial.fetch_add(1, Ordering::SeqCst) + 1;
        let credentials = ProviderCredentials::new(key, serial)?;

        *self.cached.lock().unwrap_or_else(|e| e.into_inner()) = Some(credentials.clone());
        Ok(credentials)
    }
}

#[async_trait]
impl CredentialSource for EnvCredentialSource {
    async fn credentials(&self) -> Result<ProviderCredentials> {
        let cached = self
            .cached
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        match cached {
            Some(credentials) if Utc::now() - credentials.fetched_at() < self.ttl => Ok(credentials),
            _ => self.load(),
        }
    }

    async fn fresh_credentials(&self) -> Result<FreshCredentials> {
        Ok(FreshCredentials::from_fetch(self.load()?))
    }
}
