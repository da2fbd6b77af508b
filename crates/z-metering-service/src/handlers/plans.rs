//! Plan catalog handlers.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use z_metering_core::Plan;

use crate::state::AppState;

/// Catalog listing.
#[derive(Debug, Serialize)]
pub struct PlansResponse {
    /// Plans open to new subscriptions.
    pub plans: Vec<Plan>,
}

/// List the plans users can subscribe to.
pub async fn list_plans(State(state): State<Arc<AppState>>) -> Json<PlansResponse> {
    let plans = state
        .engine
        .catalog()
        .iter()
        .filter(|plan| plan.active)
        .cloned()
        .collect();

    Json(PlansResponse { plans })
}
