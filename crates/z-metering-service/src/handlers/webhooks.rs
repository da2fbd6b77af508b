//! Payment gateway webhook handler.
//!
//! The gateway adapter normalizes provider payloads into [`GatewayEvent`] and
//! delivers them here with the service API key. Signature verification is the
//! adapter's job.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use z_metering_core::{GatewayEvent, MeteringError};
use z_metering_engine::EventOutcome;

use crate::auth::ServiceAuth;
use crate::error::ApiError;
use crate::state::AppState;

/// Webhook response.
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    /// Whether the event was accepted.
    pub received: bool,
    /// What happened: `applied`, `duplicate` or `out_of_order`.
    pub outcome: &'static str,
}

/// Apply a gateway event to the subscription ledger.
///
/// Redeliveries and stale events are acknowledged with 200 so the gateway
/// stops retrying them.
pub async fn gateway_webhook(
    State(state): State<Arc<AppState>>,
    auth: ServiceAuth,
    Json(event): Json<GatewayEvent>,
) -> Result<Json<WebhookResponse>, ApiError> {
    let outcome = match state.engine.apply_subscription_event(&event) {
        Ok(EventOutcome::Applied { .. }) => "applied",
        Ok(EventOutcome::Duplicate) => "duplicate",
        Err(MeteringError::SubscriptionEventOutOfOrder { current_start, .. }) => {
            tracing::warn!(
                service = %auth.service_name,
                event_id = %event.event_id,
                current_start = %current_start,
                "Acknowledging out-of-order gateway event"
            );
            "out_of_order"
        }
        Err(e) => return Err(e.into()),
    };

    Ok(Json(WebhookResponse {
        received: true,
        outcome,
    }))
}
