//! Reservation handlers.
//!
//! Feature call sites reserve credits before running paid work and settle the
//! reservation afterwards. All routes here require service authentication.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use z_metering_core::{Agent, ReservationId, ReservationState, UserId};
use z_metering_engine::{Finalization, ReservationRequest};

use crate::auth::ServiceAuth;
use crate::error::ApiError;
use crate::handlers::credits::wire_credits;
use crate::state::AppState;

/// Reserve request.
#[derive(Debug, Deserialize)]
pub struct ReserveRequest {
    /// User to debit.
    pub user_id: String,
    /// Agent performing the action.
    pub agent: Agent,
    /// Action name.
    pub action: String,
    /// Explicit cost; looked up in the action cost table when omitted.
    #[serde(default)]
    pub cost: Option<u64>,
    /// Caller context stored with the reservation.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Reserve response.
#[derive(Debug, Serialize)]
pub struct ReserveResponse {
    /// Reservation to commit or release.
    pub reservation_id: String,
    /// Credits held.
    pub amount: u64,
    /// Credits left after the hold (`-1` when unlimited).
    pub remaining: i64,
    /// Whether the plan is unlimited and no account was debited.
    pub unmetered: bool,
}

/// Finalize response.
#[derive(Debug, Serialize)]
pub struct FinalizeResponse {
    /// The reservation.
    pub reservation_id: String,
    /// Its state after the call.
    pub state: ReservationState,
    /// Whether this call performed the transition.
    pub finalized: bool,
}

impl From<Finalization> for FinalizeResponse {
    fn from(outcome: Finalization) -> Self {
        let reservation = outcome.reservation();
        Self {
            reservation_id: reservation.id.to_string(),
            state: reservation.state,
            finalized: outcome.is_finalized(),
        }
    }
}

/// Reserve credits for an action.
pub async fn reserve(
    State(state): State<Arc<AppState>>,
    auth: ServiceAuth,
    Json(body): Json<ReserveRequest>,
) -> Result<Json<ReserveResponse>, ApiError> {
    let user_id = body
        .user_id
        .parse::<UserId>()
        .map_err(|_| ApiError::BadRequest("Invalid user ID".into()))?;

    let actor = auth.actor();
    let reserved = match body.cost {
        Some(cost) => state.engine.reserve(
            &actor,
            ReservationRequest {
                user_id,
                cost,
                agent: body.agent,
                action: body.action,
                metadata: body.metadata,
            },
        )?,
        None => state.engine.reserve_action(
            &actor,
            user_id,
            body.agent,
            &body.action,
            body.metadata,
        )?,
    };

    tracing::debug!(
        service = %auth.service_name,
        reservation_id = %reserved.reservation.id,
        "Reservation created"
    );

    Ok(Json(ReserveResponse {
        reservation_id: reserved.reservation.id.to_string(),
        amount: reserved.reservation.amount,
        remaining: wire_credits(reserved.remaining),
        unmetered: reserved.reservation.unmetered,
    }))
}

/// Commit a reservation. Repeated commits answer `finalized: false`.
pub async fn commit(
    State(state): State<Arc<AppState>>,
    auth: ServiceAuth,
    Path(id): Path<String>,
) -> Result<Json<FinalizeResponse>, ApiError> {
    let reservation_id = parse_reservation_id(&id)?;
    let outcome = state.engine.commit(&auth.actor(), &reservation_id)?;
    Ok(Json(outcome.into()))
}

/// Release a reservation, returning its credits. Repeated releases answer `finalized: false`.
pub async fn release(
    State(state): State<Arc<AppState>>,
    auth: ServiceAuth,
    Path(id): Path<String>,
) -> Result<Json<FinalizeResponse>, ApiError> {
    let reservation_id = parse_reservation_id(&id)?;
    let outcome = state.engine.release(&auth.actor(), &reservation_id)?;
    Ok(Json(outcome.into()))
}

fn parse_reservation_id(id: &str) -> Result<ReservationId, ApiError> {
    id.parse()
        .map_err(|_| ApiError::BadRequest("Invalid reservation ID".into()))
}
