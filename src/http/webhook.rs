//! Provider webhook endpoint.

use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::HeaderMap,
    routing::post,
};

use super::response::{ApiResponse, WebhookAck};
use super::routes::RouteModule;
use crate::app::BillingContext;
use crate::error::Result;

pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// `POST /webhooks/stripe`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebhookRoutes;

impl RouteModule for WebhookRoutes {
    fn routes(&self) -> Router<BillingContext> {
        Router::new().route("/stripe", post(receive_stripe_webhook))
    }

    fn prefix(&self) -> Option<&str> {
        Some("/webhooks")
    }
}

/// The body is taken as raw bytes: the signature covers the exact payload.
async fn receive_stripe_webhook(
    State(ctx): State<BillingContext>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<ApiResponse<WebhookAck>> {
    let delivery_id = uuid::Uuid::new_v4().to_string();
    // A missing header fails verification like any other bad signature.
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let outcome = ctx
        .reconciler()
        .reconcile(&body, signature, &delivery_id)
        .await?;

    Ok(ApiResponse::success(WebhookAck {
        received: true,
        outcome: outcome.as_str(),
        delivery_id,
    }))
}
