//! Outbound email.
//!
//! Billing warnings are rendered into an [`Email`] and handed to whatever
//! [`Mailer`] the application wires in. [`ConsoleMailer`] is the development
//! backend.

mod console;

pub use console::ConsoleMailer;

use async_trait::async_trait;

use crate::error::{PawbillError, Result};

/// An email message to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    /// Plain text body (optional if html is provided)
    pub text: Option<String>,
    /// HTML body (optional if text is provided)
    pub html: Option<String>,
    pub reply_to: Option<String>,
}

impl Email {
    pub fn new(from: impl Into<String>, to: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: vec![to.into()],
            subject: subject.into(),
            text: None,
            html: None,
            reply_to: None,
        }
    }

    #[must_use]
    pub fn text(mut self, body: impl Into<String>) -> Self {
        self.text = Some(body.into());
        self
    }

    #[must_use]
    pub fn html(mut self, body: impl Into<String>) -> Self {
        self.html = Some(body.into());
        self
    }

    #[must_use]
    pub fn reply_to(mut self, address: impl Into<String>) -> Self {
        self.reply_to = Some(address.into());
        self
    }

    /// Check the email has a sender, a recipient, a subject and a body.
    pub fn validate(&self) -> Result<()> {
        if self.from.is_empty() {
            return Err(PawbillError::bad_request("Email 'from' is required"));
        }
        if self.to.is_empty() || self.to.iter().any(String::is_empty) {
            return Err(PawbillError::bad_request("Email 'to' is required"));
        }
        if self.subject.is_empty() {
            return Err(PawbillError::bad_request("Email 'subject' is required"));
        }
        if self.text.is_none() && self.html.is_none() {
            return Err(PawbillError::bad_request(
                "Email must have either 'text' or 'html' body",
            ));
        }
        Ok(())
    }
}

/// Email sending backend.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &Email) -> Result<()>;

    /// Whether the backend is reachable.
    fn is_healthy(&self) -> bool;
}
