//! Credit balance handlers.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use z_metering_core::{Balance, UNLIMITED_SENTINEL};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

/// Balance response. Unlimited plans report `-1` for `total` and `remaining`.
#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    /// Allotment plus rollover for the period.
    pub total: i64,
    /// Credits consumed in the period.
    pub consumed: u64,
    /// Credits left in the period.
    pub remaining: i64,
    /// Credits carried over from the previous period.
    pub rollover_in: u64,
    /// Period start.
    pub period_start: DateTime<Utc>,
    /// Period end (exclusive).
    pub period_end: DateTime<Utc>,
    /// Whether the plan is unlimited.
    pub unlimited: bool,
}

impl From<Balance> for BalanceResponse {
    fn from(balance: Balance) -> Self {
        Self {
            total: wire_credits(balance.total),
            consumed: balance.consumed,
            remaining: wire_credits(balance.remaining),
            rollover_in: balance.rollover_in,
            period_start: balance.period_start,
            period_end: balance.period_end,
            unlimited: balance.is_unlimited(),
        }
    }
}

/// Credits as sent to clients: `-1` stands for unlimited.
pub(crate) fn wire_credits(credits: Option<u64>) -> i64 {
    credits.map_or(UNLIMITED_SENTINEL, |c| i64::try_from(c).unwrap_or(i64::MAX))
}

/// Get the caller's balance for the current billing period.
pub async fn get_balance(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<BalanceResponse>, ApiError> {
    let balance = state.engine.get_balance(&auth.actor(), &auth.user_id)?;
    Ok(Json(balance.into()))
}
