//! Console mailer for development.
//!
//! Writes emails to the log instead of sending them. Bodies are redacted
//! unless full output is switched on, since logs are often shipped off-host.

use async_trait::async_trait;

use super::{Email, Mailer};
use crate::error::Result;

/// A mailer that logs emails instead of sending them.
#[derive(Debug, Clone)]
pub struct ConsoleMailer {
    prefix: String,
    show_full_content: bool,
}

impl ConsoleMailer {
    pub fn new() -> Self {
        Self {
            prefix: "[EMAIL]".to_string(),
            show_full_content: false,
        }
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            show_full_content: false,
        }
    }

    /// Log bodies in full. Development only.
    #[must_use]
    pub fn with_full_output(mut self, enabled: bool) -> Self {
        if enabled {
            tracing::warn!(
                target: "pawbill::email",
                "ConsoleMailer full output enabled, email bodies will appear in logs"
            );
        }
        self.show_full_content = enabled;
        self
    }

    fn body(&self, body: &Option<String>) -> Option<String> {
        body.as_ref().map(|b| {
            if self.show_full_content {
                b.clone()
            } else {
                format!("{} bytes [REDACTED]", b.len())
            }
        })
    }
}

impl Default for ConsoleMailer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Mailer for ConsoleMailer {
    async fn send(&self, email: &Email) -> Result<()> {
        email.validate()?;

        tracing::info!(
            target: "pawbill::email",
            prefix = %self.prefix,
            from = %email.from,
            recipients = email.to.len(),
            reply_to = email.reply_to.is_some(),
            subject = %email.subject,
            text = self.body(&email.text).as_deref().unwrap_or("-"),
            html = self.body(&email.html).as_deref().unwrap_or("-"),
            "Email"
        );
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        true
    }
}
