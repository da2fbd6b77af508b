//! Usage history handlers.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use z_metering_core::UsageRecord;
use z_metering_engine::Reconciliation;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

/// Largest page `list_usage` will return.
const MAX_USAGE_PAGE: usize = 200;

/// Usage list query parameters.
#[derive(Debug, Deserialize)]
pub struct ListUsageQuery {
    /// Maximum number of records to return (default: 50).
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Offset for pagination (default: 0).
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    50
}

/// Usage list response.
#[derive(Debug, Serialize)]
pub struct UsageListResponse {
    /// Records, newest first.
    pub records: Vec<UsageRecord>,
    /// Number of records returned.
    pub count: usize,
}

/// List the caller's usage records.
pub async fn list_usage(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Query(query): Query<ListUsageQuery>,
) -> Result<Json<UsageListResponse>, ApiError> {
    let limit = query.limit.min(MAX_USAGE_PAGE);
    let records = state
        .engine
        .list_usage(&auth.actor(), &auth.user_id, limit, query.offset)?;

    Ok(Json(UsageListResponse {
        count: records.len(),
        records,
    }))
}

/// Compare the caller's current account against the usage log.
pub async fn reconcile(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<Reconciliation>, ApiError> {
    let report = state.engine.reconcile(&auth.actor(), &auth.user_id)?;
    if report.drift != 0 {
        tracing::warn!(
            user_id = %auth.user_id,
            drift = report.drift,
            "Usage log drifts from credit account"
        );
    }
    Ok(Json(report))
}
