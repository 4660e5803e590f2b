//! Retry policy for outbound provider calls.
//!
//! Wraps one provider operation with bounded, strictly sequential retries,
//! exponential backoff with jitter, a per-attempt timeout and an overall
//! deadline. Retry decisions use the [`ProviderErrorKind`] assigned at the
//! provider boundary.
//!
//! [`ProviderErrorKind`]: super::provider::ProviderErrorKind

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use super::audit::{AuditCategory, AuditLogEntry, AuditSeverity, OperationAuditor};
use super::provider::{META_TENANT_ID, ProviderError};

// ============================================================================
// Configuration
// ============================================================================

/// Retry tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOptions {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound for a single attempt.
    pub attempt_timeout: Duration,
    /// Hard upper bound for the whole call, retries and waits included.
    pub total_timeout: Duration,
    /// Random extra wait added to each backoff, drawn from `0..jitter`.
    pub jitter: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            attempt_timeout: Duration::from_secs(10),
            total_timeout: Duration::from_secs(30),
            jitter: Duration::from_secs(1),
        }
    }
}

impl RetryOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    #[must_use]
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    #[must_use]
    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    #[must_use]
    pub fn total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout = timeout;
        self
    }

    #[must_use]
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Wait before retry number `retry` (0 for the first retry):
    /// `min(base * 2^retry + rand(0..jitter), max)`.
    #[must_use]
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let exponential = base_ms.saturating_mul(2_u64.saturating_pow(retry));

        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms > 0 {
            fastrand::u64(0..jitter_ms)
        } else {
            0
        };

        let max_ms = self.max_delay.as_millis() as u64;
        Duration::from_millis(exponential.saturating_add(jitter).min(max_ms))
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Runs provider operations under a [`RetryOptions`] and audits the outcome.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    options: RetryOptions,
    auditor: OperationAuditor,
}

impl RetryPolicy {
    pub fn new(options: RetryOptions, auditor: OperationAuditor) -> Self {
        Self { options, auditor }
    }

    #[must_use]
    pub fn options(&self) -> &RetryOptions {
        &self.options
    }

    /// Execute with this policy's default options.
    pub async fn execute<T, F, Fut>(
        &self,
        name: &str,
        metadata: &BTreeMap<String, String>,
        operation: F,
    ) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        self.execute_with(&self.options, name, metadata, operation)
            .await
    }

    /// Execute with explicit options.
    ///
    /// Returns the first success, or the last error unchanged once the error
    /// is fatal, the attempts are used up, or the next attempt could not start
    /// before the overall deadline.
    pub async fn execute_with<T, F, Fut>(
        &self,
        options: &RetryOptions,
        name: &str,
        metadata: &BTreeMap<String, String>,
        mut operation: F,
    ) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let started = Instant::now();
        let deadline = started + options.total_timeout;
        let max_attempts = options.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let budget = options.attempt_timeout.min(remaining);

            let outcome = match tokio::time::timeout(budget, operation()).await {
                Ok(result) => result,
                Err(_elapsed) => Err(ProviderError::timeout(name, budget)),
            };
            attempt += 1;

            let error = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(
                            target: "pawbill::billing::retry",
                            operation = name,
                            attempts = attempt,
                            "Provider call succeeded after retrying"
                        );
                        let entry = self
                            .entry(AuditSeverity::Info, name, metadata, "Provider call succeeded after retry")
                            .meta("attempts", attempt)
                            .meta("elapsed_ms", started.elapsed().as_millis());
                        self.auditor
                            .record_within(entry, deadline.saturating_duration_since(Instant::now()))
                            .await;
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let delay = options.backoff_delay(attempt - 1);
            let exhausted = attempt >= max_attempts;
            let out_of_time = Instant::now() + delay >= deadline;
            let will_retry = error.is_retryable() && !exhausted && !out_of_time;

            let severity = if will_retry {
                AuditSeverity::Warning
            } else {
                AuditSeverity::High
            };
            let mut entry = self
                .entry(severity, name, metadata, "Provider call failed")
                .meta("attempt", attempt)
                .meta("error_kind", error.kind)
                .meta("retryable", error.is_retryable())
                .meta("will_retry", will_retry);
            if let Some(status) = error.http_status {
                entry = entry.meta("http_status", status);
            }
            self.auditor
                .record_within(entry, deadline.saturating_duration_since(Instant::now()))
                .await;

            if !will_retry {
                tracing::warn!(
                    target: "pawbill::billing::retry",
                    operation = name,
                    attempt,
                    kind = %error.kind,
                    exhausted,
                    out_of_time,
                    error = %error,
                    "Provider call failed, giving up"
                );
                return Err(error);
            }

            tracing::warn!(
                target: "pawbill::billing::retry",
                operation = name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                kind = %error.kind,
                error = %error,
                "Retrying provider call after transient error"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn entry(
        &self,
        severity: AuditSeverity,
        name: &str,
        metadata: &BTreeMap<String, String>,
        message: &str,
    ) -> AuditLogEntry {
        AuditLogEntry::new(AuditCategory::Provider, severity, message)
            .maybe_tenant(metadata.get(META_TENANT_ID).map(String::as_str))
            .with_metadata(metadata)
            .meta("operation", name)
    }
}
