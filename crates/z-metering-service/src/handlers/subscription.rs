//! Subscription handlers.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use z_metering_core::{Plan, PlanId, Subscription};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

/// Get the caller's subscription.
pub async fn get_subscription(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<Subscription>, ApiError> {
    let subscription = state
        .engine
        .get_subscription(&auth.actor(), &auth.user_id)?;
    Ok(Json(subscription))
}

/// Get the plan currently granting the caller credits.
pub async fn get_active_plan(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<Plan>, ApiError> {
    let plan = state.engine.get_active_plan(&auth.actor(), &auth.user_id)?;
    Ok(Json(plan))
}

/// Cancel request.
#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    /// Keep the subscription until the period ends (default: true).
    #[serde(default = "default_at_period_end")]
    pub at_period_end: bool,
}

fn default_at_period_end() -> bool {
    true
}

/// Cancel the caller's subscription.
pub async fn cancel_subscription(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<CancelRequest>,
) -> Result<Json<Subscription>, ApiError> {
    let subscription =
        state
            .engine
            .cancel_subscription(&auth.actor(), &auth.user_id, body.at_period_end)?;

    tracing::info!(
        user_id = %auth.user_id,
        at_period_end = %body.at_period_end,
        status = subscription.status.as_str(),
        "Subscription cancellation requested"
    );

    Ok(Json(subscription))
}

/// Plan change request.
#[derive(Debug, Deserialize)]
pub struct ChangePlanRequest {
    /// Target plan.
    pub plan_id: PlanId,
}

/// Switch the caller to another plan from the next credit account on.
pub async fn change_plan(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<ChangePlanRequest>,
) -> Result<Json<Subscription>, ApiError> {
    let subscription = state
        .engine
        .change_plan(&auth.actor(), &auth.user_id, &body.plan_id)?;
    Ok(Json(subscription))
}
