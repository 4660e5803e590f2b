//! Billing-specific error types.
//!
//! Granular errors for billing operations. They convert into `PawbillError`
//! for HTTP responses while keeping enough structure for callers that need
//! to branch on the failure.

use std::fmt;

use super::plans::{BillingCycle, PlanCode};

/// Billing-specific errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingError {
    // Lookup errors
    /// The tenant does not exist.
    TenantNotFound { tenant_id: String },
    /// The CRM invoice does not exist.
    InvoiceNotFound { invoice_id: String },
    /// A provider event could not be tied to any tenant.
    TenantNotResolved { event_id: String, event_type: String },
    /// The plan code is not part of the catalog.
    PlanNotFound { plan_code: String },
    /// No provider price is configured for the plan and cycle.
    PriceNotConfigured { plan: PlanCode, cycle: BillingCycle },

    // Customer errors
    /// The tenant has no provider customer yet.
    NoCustomer { tenant_id: String },

    // Concurrency
    /// The tenant record kept changing under us, retry the operation.
    ConcurrentModification { tenant_id: String },

    // Checkout errors
    /// Invalid redirect URL provided.
    InvalidRedirectUrl { url: String, reason: String },
    /// Redirect URL domain not in allowed list.
    RedirectDomainNotAllowed { domain: String },

    // Webhook errors
    /// Webhook signature is invalid.
    InvalidWebhookSignature,
    /// Webhook timestamp is outside the tolerance window.
    WebhookTimestampExpired { age_seconds: i64 },
    /// Webhook event data is malformed.
    InvalidWebhookPayload { message: String },

    // Downstream errors
    /// The tenant store rejected or failed a read or write.
    Store { operation: String, message: String },
    /// An unexpected internal error occurred.
    Internal { message: String },
}

impl fmt::Display for BillingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TenantNotFound { tenant_id } => {
                write!(f, "Tenant not found: {}", tenant_id)
            }
            Self::InvoiceNotFound { invoice_id } => {
                write!(f, "Invoice not found: {}", invoice_id)
            }
            Self::TenantNotResolved { event_id, event_type } => {
                write!(f, "No tenant matches event {} ({})", event_id, event_type)
            }
            Self::PlanNotFound { plan_code } => {
                write!(f, "Plan not found: {}", plan_code)
            }
            Self::PriceNotConfigured { plan, cycle } => {
                write!(f, "No price configured for {} ({})", plan, cycle)
            }
            Self::NoCustomer { tenant_id } => {
                write!(f, "No payment customer found for '{}'", tenant_id)
            }
            Self::ConcurrentModification { tenant_id } => {
                write!(f, "Concurrent modification detected for '{}', please retry", tenant_id)
            }
            Self::InvalidRedirectUrl { url, reason } => {
                write!(f, "Invalid redirect URL '{}': {}", url, reason)
            }
            Self::RedirectDomainNotAllowed { domain } => {
                write!(f, "Redirect domain '{}' is not allowed", domain)
            }
            Self::InvalidWebhookSignature => {
                write!(f, "Invalid webhook signature")
            }
            Self::WebhookTimestampExpired { age_seconds } => {
                write!(f, "Webhook timestamp expired ({} seconds old)", age_seconds)
            }
            Self::InvalidWebhookPayload { message } => {
                write!(f, "Invalid webhook payload: {}", message)
            }
            Self::Store { operation, message } => {
                write!(f, "Tenant store failure during {}: {}", operation, message)
            }
            Self::Internal { message } => {
                write!(f, "Internal billing error: {}", message)
            }
        }
    }
}

impl std::error::Error for BillingError {}

impl BillingError {
    /// Caller supplied something wrong.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::TenantNotFound { .. }
                | Self::InvoiceNotFound { .. }
                | Self::PlanNotFound { .. }
                | Self::NoCustomer { .. }
                | Self::InvalidRedirectUrl { .. }
                | Self::RedirectDomainNotAllowed { .. }
                | Self::InvalidWebhookSignature
                | Self::WebhookTimestampExpired { .. }
                | Self::InvalidWebhookPayload { .. }
        )
    }

    /// Something on our side failed.
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }

    /// Redelivering the same webhook (or repeating the call) may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentModification { .. } | Self::Store { .. } | Self::TenantNotResolved { .. }
        )
    }
}

impl From<BillingError> for crate::error::PawbillError {
    fn from(err: BillingError) -> Self {
        use crate::error::PawbillError;

        match &err {
            BillingError::TenantNotFound { .. }
            | BillingError::InvoiceNotFound { .. }
            | BillingError::TenantNotResolved { .. }
            | BillingError::PlanNotFound { .. }
            | BillingError::NoCustomer { .. } => PawbillError::NotFound(err.to_string()),

            BillingError::InvalidRedirectUrl { .. }
            | BillingError::RedirectDomainNotAllowed { .. }
            | BillingError::InvalidWebhookSignature
            | BillingError::WebhookTimestampExpired { .. }
            | BillingError::InvalidWebhookPayload { .. } => PawbillError::BadRequest(err.to_string()),

            BillingError::ConcurrentModification { .. } => PawbillError::Conflict(err.to_string()),

            BillingError::Store { .. } => PawbillError::ServiceUnavailable(err.to_string()),

            BillingError::PriceNotConfigured { .. } | BillingError::Internal { .. } => {
                PawbillError::Internal(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PawbillError;

    #[test]
    fn test_error_display() {
        let err = BillingError::TenantNotFound {
            tenant_id: "biz_1".to_string(),
        };
        assert_eq!(err.to_string(), "Tenant not found: biz_1");

        let err = BillingError::PriceNotConfigured {
            plan: PlanCode::Team,
            cycle: BillingCycle::Annual,
        };
        assert_eq!(err.to_string(), "No price configured for TEAM (ANNUAL)");

        let err = BillingError::WebhookTimestampExpired { age_seconds: 900 };
        assert_eq!(err.to_string(), "Webhook timestamp expired (900 seconds old)");
    }

    #[test]
    fn test_error_classification() {
        assert!(BillingError::InvalidWebhookSignature.is_client_error());
        assert!(!BillingError::InvalidWebhookSignature.is_retryable());

        let conflict = BillingError::ConcurrentModification {
            tenant_id: "biz_1".to_string(),
        };
        assert!(conflict.is_server_error());
        assert!(conflict.is_retryable());

        let store = BillingError::Store {
            operation: "update_tenant".to_string(),
            message: "connection refused".to_string(),
        };
        assert!(store.is_retryable());
    }

    #[test]
    fn test_convert_to_pawbill_error() {
        let err: PawbillError = BillingError::InvalidWebhookSignature.into();
        assert!(matches!(err, PawbillError::BadRequest(_)));

        let err: PawbillError = BillingError::Store {
            operation: "update_tenant".to_string(),
            message: "timeout".to_string(),
        }
        .into();
        assert!(matches!(err, PawbillError::ServiceUnavailable(_)));

        let err: PawbillError = BillingError::ConcurrentModification {
            tenant_id: "biz_1".to_string(),
        }
        .into();
        assert!(matches!(err, PawbillError::Conflict(_)));
    }
}
