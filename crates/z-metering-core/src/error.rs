//! Error types for z-metering.

use chrono::{DateTime, Utc};

use crate::ids::IdError;
use crate::{ReservationState, SubscriptionStatus};

/// Result type for z-metering operations.
pub type Result<T> = std::result::Result<T, MeteringError>;

/// Errors that can occur in z-metering operations.
///
/// Credit-gating failures (`InsufficientCredits`, `NoActiveSubscription`) are
/// recoverable: callers should present an upgrade path rather than retry.
#[derive(Debug, thiserror::Error)]
pub enum MeteringError {
    /// The account cannot cover the requested cost.
    #[error("insufficient credits: remaining={remaining}, required={required}")]
    InsufficientCredits {
        /// Credits left in the current period.
        remaining: u64,
        /// Credits requested.
        required: u64,
    },

    /// The user has no subscription in a status that permits metering.
    #[error("no active subscription for user {user_id}")]
    NoActiveSubscription {
        /// The user that was refused.
        user_id: String,
    },

    /// The reservation was already committed or released.
    #[error("reservation {reservation_id} already finalized as {state:?}")]
    AlreadyFinalized {
        /// The reservation.
        reservation_id: String,
        /// Its terminal state.
        state: ReservationState,
    },

    /// Concurrent lazy creation of a credit account could not be resolved.
    #[error("credit account creation conflict for user {user_id}")]
    AccountCreationConflict {
        /// The user whose account was being created.
        user_id: String,
    },

    /// A gateway event refers to a period older than the stored one.
    #[error("gateway event {event_id} is older than the current period starting {current_start}")]
    SubscriptionEventOutOfOrder {
        /// The ignored event.
        event_id: String,
        /// Start of the stored current period.
        current_start: DateTime<Utc>,
    },

    /// The lifecycle state machine forbids this move.
    #[error("invalid subscription transition from {from:?} to {to:?}")]
    InvalidTransition {
        /// Current status.
        from: SubscriptionStatus,
        /// Requested status.
        to: SubscriptionStatus,
    },

    /// The caller may not act on this user's data.
    #[error("forbidden: caller may not access user {user_id}")]
    Forbidden {
        /// The user whose data was requested.
        user_id: String,
    },

    /// No subscription exists for the user.
    #[error("subscription not found for user {user_id}")]
    SubscriptionNotFound {
        /// The user.
        user_id: String,
    },

    /// No reservation with this identifier exists.
    #[error("reservation not found: {reservation_id}")]
    ReservationNotFound {
        /// The reservation.
        reservation_id: String,
    },

    /// No plan with this identifier exists.
    #[error("plan not found: {0}")]
    PlanNotFound(String),

    /// A plan definition is malformed.
    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    /// A cost is zero, missing or otherwise unusable.
    #[error("invalid cost: {0}")]
    InvalidCost(String),

    /// A billing period is empty or inverted.
    #[error("invalid billing period: {start} .. {end}")]
    InvalidPeriod {
        /// Start.
        start: DateTime<Utc>,
        /// End.
        end: DateTime<Utc>,
    },

    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),
}

impl MeteringError {
    /// Whether this is a credit-gating denial the caller should turn into a paywall.
    #[must_use]
    pub const fn is_denial(&self) -> bool {
        matches!(
            self,
            Self::InsufficientCredits { .. } | Self::NoActiveSubscription { .. }
        )
    }

    /// Short machine-readable reason, used in usage records and API bodies.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InsufficientCredits { .. } => "insufficient_credits",
            Self::NoActiveSubscription { .. } => "no_active_subscription",
            Self::AlreadyFinalized { .. } => "already_finalized",
            Self::AccountCreationConflict { .. } => "account_creation_conflict",
            Self::SubscriptionEventOutOfOrder { .. } => "subscription_event_out_of_order",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Forbidden { .. } => "forbidden",
            Self::SubscriptionNotFound { .. } => "subscription_not_found",
            Self::ReservationNotFound { .. } => "reservation_not_found",
            Self::PlanNotFound(_) => "plan_not_found",
            Self::InvalidPlan(_) => "invalid_plan",
            Self::InvalidCost(_) => "invalid_cost",
            Self::InvalidPeriod { .. } => "invalid_period",
            Self::InvalidId(_) => "invalid_id",
            Self::Storage(_) => "storage_error",
        }
    }
}
