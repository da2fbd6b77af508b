//! Subscriptions and their lifecycle state machine.
//!
//! ```text
//! trialing ──► active ──► past_due ──► expired
//!    │           │  ▲          │
//!    │           │  └──────────┘ (payment recovered / renewed)
//!    └───────────┴──► cancelled
//! ```
//!
//! `expired` and `cancelled` are terminal for metering purposes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MeteringError, Result};
use crate::{PlanId, UserId};

/// A half-open billing interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingPeriod {
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Exclusive end.
    pub end: DateTime<Utc>,
}

impl BillingPeriod {
    /// Create a period, rejecting empty or inverted intervals.
    ///
    /// # Errors
    ///
    /// Returns `MeteringError::InvalidPeriod` unless `end > start`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if end <= start {
            return Err(MeteringError::InvalidPeriod { start, end });
        }
        Ok(Self { start, end })
    }

    /// Whether `at` falls inside the period.
    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    /// Whether `at` is at or past the exclusive end.
    #[must_use]
    pub fn has_ended(&self, at: DateTime<Utc>) -> bool {
        at >= self.end
    }
}

/// Lifecycle status of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// In a trial window.
    Trialing,
    /// Paid and current.
    Active,
    /// Latest payment failed; awaiting recovery.
    PastDue,
    /// Cancelled by the user or gateway.
    Cancelled,
    /// Lapsed after an unrecovered payment failure.
    Expired,
}

impl SubscriptionStatus {
    /// Terminal statuses deny all reservations.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Expired)
    }

    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Trialing => "trialing",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    /// Whether the state machine permits moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Trialing, Self::Active | Self::PastDue | Self::Cancelled)
                | (Self::Active, Self::Active | Self::PastDue | Self::Cancelled)
                | (Self::PastDue, Self::Active | Self::Expired | Self::Cancelled)
        )
    }
}

/// The single subscription record owned by a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    /// Owning user (primary key).
    pub user_id: UserId,

    /// Referenced plan.
    pub plan_id: PlanId,

    /// Lifecycle status.
    pub status: SubscriptionStatus,

    /// Current billing period.
    pub current_period: BillingPeriod,

    /// Cancel when the current period ends instead of renewing.
    pub cancel_at_period_end: bool,

    /// Trial window, if the subscription started with one.
    pub trial: Option<BillingPeriod>,

    /// Subscription identifier at the payment gateway.
    pub gateway_subscription_id: String,

    /// When the record was created.
    pub created_at: DateTime<Utc>,

    /// When the record was last mutated.
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Create a subscription from a gateway creation event.
    ///
    /// A trial window makes the subscription start in `trialing`.
    #[must_use]
    pub fn new(
        user_id: UserId,
        plan_id: PlanId,
        current_period: BillingPeriod,
        trial: Option<BillingPeriod>,
        gateway_subscription_id: String,
        now: DateTime<Utc>,
    ) -> Self {
        let status = if trial.is_some() {
            SubscriptionStatus::Trialing
        } else {
            SubscriptionStatus::Active
        };
        Self {
            user_id,
            plan_id,
            status,
            current_period,
            cancel_at_period_end: false,
            trial,
            gateway_subscription_id,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, enforcing the lifecycle state machine.
    ///
    /// # Errors
    ///
    /// Returns `MeteringError::InvalidTransition` for a disallowed move.
    pub fn transition(&mut self, next: SubscriptionStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(MeteringError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Whether the subscription may reserve credits.
    #[must_use]
    pub fn permits_metering(&self, allow_past_due: bool) -> bool {
        match self.status {
            SubscriptionStatus::Active | SubscriptionStatus::Trialing => true,
            SubscriptionStatus::PastDue => allow_past_due,
            SubscriptionStatus::Cancelled | SubscriptionStatus::Expired => false,
        }
    }

    /// Whether a scheduled cancellation has come due at `now`.
    #[must_use]
    pub fn cancellation_due(&self, now: DateTime<Utc>) -> bool {
        self.cancel_at_period_end
            && matches!(
                self.status,
                SubscriptionStatus::Active | SubscriptionStatus::Trialing
            )
            && self.current_period.has_ended(now)
    }
}
