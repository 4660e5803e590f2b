//! Tenant-facing billing notifications.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::email::{Email, Mailer};
use crate::error::Result;

/// Warning sent once per applied payment failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentFailureWarning {
    pub to: String,
    pub tenant_name: String,
    pub grace_period_end: DateTime<Utc>,
    /// Minor currency units.
    pub amount: i64,
    pub currency: String,
}

impl PaymentFailureWarning {
    /// `"29.00 GBP"` style amount.
    #[must_use]
    pub fn formatted_amount(&self) -> String {
        let sign = if self.amount < 0 { "-" } else { "" };
        let abs = self.amount.unsigned_abs();
        format!("{}{}.{:02} {}", sign, abs / 100, abs % 100, self.currency.to_uppercase())
    }
}

/// Outbound notification channel.
///
/// Callers treat delivery as best-effort: an error is logged and dropped.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send_payment_failure_warning(&self, warning: &PaymentFailureWarning) -> Result<()>;
}

/// Drops every notification.
#[derive(Debug, Clone, Default)]
pub struct NoOpNotificationSink;

#[async_trait]
impl NotificationSink for NoOpNotificationSink {
    async fn send_payment_failure_warning(&self, _warning: &PaymentFailureWarning) -> Result<()> {
        Ok(())
    }
}

/// Renders notifications as emails.
pub struct MailerNotificationSink<M: Mailer> {
    mailer: Arc<M>,
    from: String,
}

impl<M: Mailer> MailerNotificationSink<M> {
    pub fn new(mailer: Arc<M>, from: impl Into<String>) -> Self {
        Self {
            mailer,
            from: from.into(),
        }
    }

    fn render(&self, warning: &PaymentFailureWarning) -> Email {
        let deadline = warning.grace_period_end.format("%-d %B %Y, %H:%M UTC");
        let text = format!(
            "Hi {name},\n\n\
             We couldn't take your payment of {amount}. Your account stays fully \
             active until {deadline} while we retry.\n\n\
             Please update your payment details before then to avoid interruption.\n",
            name = warning.tenant_name,
            amount = warning.formatted_amount(),
            deadline = deadline,
        );
        Email::new(&self.from, &warning.to, "Action needed: your payment failed").text(text)
    }
}

#[async_trait]
impl<M: Mailer> NotificationSink for MailerNotificationSink<M> {
    async fn send_payment_failure_warning(&self, warning: &PaymentFailureWarning) -> Result<()> {
        self.mailer.send(&self.render(warning)).await
    }
}

/// Keeps notifications in memory. Useful in development and tests.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotificationSink {
    sent: Arc<tokio::sync::Mutex<Vec<PaymentFailureWarning>>>,
}

impl RecordingNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<PaymentFailureWarning> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotificationSink {
    async fn send_payment_failure_warning(&self, warning: &PaymentFailureWarning) -> Result<()> {
        self.sent.lock().await.push(warning.clone());
        Ok(())
    }
}
