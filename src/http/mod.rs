//! HTTP adapter.
//!
//! Exposes the webhook endpoint and the RouteModule trait for mounting
//! further billing routes.

pub mod response;
pub mod routes;
pub mod webhook;

use axum::Router;
use axum::extract::DefaultBodyLimit;

use crate::app::BillingContext;

pub use response::{ApiResponse, WebhookAck};
pub use routes::RouteModule;
pub use webhook::{SIGNATURE_HEADER, WebhookRoutes};

/// Router serving `POST /webhooks/stripe`, ready to merge into an app.
pub fn webhook_router(ctx: BillingContext) -> Router {
    let limit = ctx.webhook_max_body_bytes();
    WebhookRoutes
        .register(Router::new())
        .layer(DefaultBodyLimit::max(limit))
        .with_state(ctx)
}
