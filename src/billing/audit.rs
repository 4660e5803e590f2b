//! Audit logging for billing operations.
//!
//! Every provider call outcome and every inbound event ends up as an
//! [`AuditLogEntry`]. Writing an entry never fails the operation being
//! audited: [`OperationAuditor`] bounds the write and swallows sink errors
//! after logging them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;

/// What area of billing an entry belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    /// Outbound provider calls.
    Provider,
    /// Inbound webhook deliveries.
    Webhook,
    /// Tenant billing state transitions.
    Subscription,
    /// Feature and limit decisions recorded by callers.
    Entitlement,
    /// Integrity violations and signature failures.
    Security,
}

impl AuditCategory {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provider => "provider",
            Self::Webhook => "webhook",
            Self::Subscription => "subscription",
            Self::Entitlement => "entitlement",
            Self::Security => "security",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Low,
    Info,
    Warning,
    High,
    Critical,
}

impl AuditSeverity {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// One append-only audit record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AuditLogEntry {
    /// `None` for events that are not tied to a tenant.
    pub tenant_id: Option<String>,
    pub category: AuditCategory,
    pub severity: AuditSeverity,
    pub message: String,
    pub metadata: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditLogEntry {
    pub fn new(category: AuditCategory, severity: AuditSeverity, message: impl Into<String>) -> Self {
        Self {
            tenant_id: None,
            category,
            severity,
            message: message.into(),
            metadata: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    #[must_use]
    pub fn maybe_tenant(mut self, tenant_id: Option<&str>) -> Self {
        self.tenant_id = tenant_id.map(str::to_string);
        self
    }

    #[must_use]
    pub fn meta(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: &BTreeMap<String, String>) -> Self {
        self.metadata
            .extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }
}

impl fmt::Display for AuditLogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.severity.as_str(),
            self.category.as_str(),
            self.message
        )?;
        if let Some(ref tenant_id) = self.tenant_id {
            write!(f, " (tenant {})", tenant_id)?;
        }
        Ok(())
    }
}

/// Durable destination for audit entries.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append_log(&self, entry: AuditLogEntry) -> Result<()>;
}

/// Discards every entry.
#[derive(Debug, Clone, Default)]
pub struct NoOpAuditSink;

#[async_trait]
impl AuditSink for NoOpAuditSink {
    async fn append_log(&self, _entry: AuditLogEntry) -> Result<()> {
        Ok(())
    }
}

/// Writes entries as tracing events on target `pawbill::audit`.
#[derive(Debug, Clone, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn append_log(&self, entry: AuditLogEntry) -> Result<()> {
        let metadata = serde_json::to_string(&entry.metadata).unwrap_or_default();
        let tenant_id = entry.tenant_id.as_deref().unwrap_or("-");

        match entry.severity {
            AuditSeverity::Low => tracing::debug!(
                target: "pawbill::audit",
                category = entry.category.as_str(),
                tenant_id,
                metadata = %metadata,
                "{}", entry.message
            ),
            AuditSeverity::Info => tracing::info!(
                target: "pawbill::audit",
                category = entry.category.as_str(),
                tenant_id,
                metadata = %metadata,
                "{}", entry.message
            ),
            AuditSeverity::Warning => tracing::warn!(
                target: "pawbill::audit",
                category = entry.category.as_str(),
                tenant_id,
                metadata = %metadata,
                "{}", entry.message
            ),
            AuditSeverity::High | AuditSeverity::Critical => tracing::error!(
                target: "pawbill::audit",
                category = entry.category.as_str(),
                severity = entry.severity.as_str(),
                tenant_id,
                metadata = %metadata,
                "{}", entry.message
            ),
        }
        Ok(())
    }
}

/// Keeps entries in memory. Useful in development and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditSink {
    entries: Arc<tokio::sync::Mutex<Vec<AuditLogEntry>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<AuditLogEntry> {
        self.entries.lock().await.clone()
    }

    pub async fn entries_in(&self, category: AuditCategory) -> Vec<AuditLogEntry> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|e| e.category == category)
            .cloned()
            .collect()
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append_log(&self, entry: AuditLogEntry) -> Result<()> {
        self.entries.lock().await.push(entry);
        Ok(())
    }
}

/// Front door to the audit sink used by the rest of the engine.
#[derive(Clone)]
pub struct OperationAuditor {
    sink: Arc<dyn AuditSink>,
    write_timeout: Duration,
}

impl OperationAuditor {
    pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self {
            sink,
            write_timeout: Self::DEFAULT_WRITE_TIMEOUT,
        }
    }

    /// Auditor that only writes to the tracing log.
    pub fn tracing() -> Self {
        Self::new(Arc::new(TracingAuditSink))
    }

    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Append an entry. Never fails; sink problems are logged and dropped.
    pub async fn record(&self, entry: AuditLogEntry) {
        self.record_within(entry, self.write_timeout).await;
    }

    /// Like [`record`](Self::record), waiting at most `budget` (capped by
    /// the configured write timeout).
    pub async fn record_within(&self, entry: AuditLogEntry, budget: Duration) {
        let summary = entry.to_string();
        let budget = budget.min(self.write_timeout);
        match tokio::time::timeout(budget, self.sink.append_log(entry)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(
                    target: "pawbill::billing::audit",
                    error = %e,
                    entry = %summary,
                    "Failed to write audit entry"
                );
            }
            Err(_) => {
                tracing::warn!(
                    target: "pawbill::billing::audit",
                    timeout_ms = budget.as_millis() as u64,
                    entry = %summary,
                    "Audit sink timed out"
                );
            }
        }
    }
}

impl fmt::Debug for OperationAuditor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationAuditor")
            .field("write_timeout", &self.write_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PawbillError;

    struct FailingSink;

    #[async_trait]
    impl AuditSink for FailingSink {
        async fn append_log(&self, _entry: AuditLogEntry) -> Result<()> {
            Err(PawbillError::service_unavailable("audit table locked"))
        }
    }

    struct StuckSink;

    #[async_trait]
    impl AuditSink for StuckSink {
        async fn append_log(&self, _entry: AuditLogEntry) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[test]
    fn test_entry_display() {
        let entry = AuditLogEntry::new(AuditCategory::Security, AuditSeverity::High, "Checkout price mismatch")
            .tenant("biz_1")
            .meta("session_id", "cs_1");
        assert_eq!(
            entry.to_string(),
            "[high] security: Checkout price mismatch (tenant biz_1)"
        );
        assert_eq!(entry.metadata.get("session_id").map(String::as_str), Some("cs_1"));
    }

    #[tokio::test]
    async fn test_memory_sink_records() {
        let sink = MemoryAuditSink::new();
        let auditor = OperationAuditor::new(Arc::new(sink.clone()));

        auditor
            .record(AuditLogEntry::new(AuditCategory::Webhook, AuditSeverity::Info, "one"))
            .await;
        auditor
            .record(AuditLogEntry::new(AuditCategory::Provider, AuditSeverity::Warning, "two"))
            .await;

        assert_eq!(sink.entries().await.len(), 2);
        assert_eq!(sink.entries_in(AuditCategory::Provider).await[0].message, "two");
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_propagate() {
        let auditor = OperationAuditor::new(Arc::new(FailingSink));
        auditor
            .record(AuditLogEntry::new(AuditCategory::Webhook, AuditSeverity::Info, "ignored"))
            .await;
    }

    #[tokio::test]
    async fn test_stuck_sink_is_bounded() {
        let auditor =
            OperationAuditor::new(Arc::new(StuckSink)).with_write_timeout(Duration::from_millis(20));
        let started = std::time::Instant::now();
        auditor
            .record(AuditLogEntry::new(AuditCategory::Webhook, AuditSeverity::Info, "stuck"))
            .await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_tracing_sink_accepts_all_severities() {
        let sink = TracingAuditSink;
        for severity in [
            AuditSeverity::Low,
            AuditSeverity::Info,
            AuditSeverity::Warning,
            AuditSeverity::High,
            AuditSeverity::Critical,
        ] {
            sink.append_log(AuditLogEntry::new(AuditCategory::Subscription, severity, "x"))
                .await
                .unwrap();
        }
    }
}
