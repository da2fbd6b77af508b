//! Payment gateway events.
//!
//! Gateway webhooks are normalized into [`GatewayEvent`] before they reach
//! the engine. The `event_id` is the idempotency key: a redelivered event is
//! acknowledged but never applied twice.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BillingPeriod, PlanId, UserId};

/// A subscription lifecycle notification from the payment gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayEvent {
    /// Gateway-assigned event identifier.
    pub event_id: String,

    /// User the subscription belongs to.
    pub user_id: UserId,

    /// Gateway subscription identifier.
    pub gateway_subscription_id: String,

    /// What happened.
    #[serde(flatten)]
    pub kind: GatewayEventKind,

    /// When the gateway emitted the event.
    pub occurred_at: DateTime<Utc>,
}

impl GatewayEvent {
    /// The billing period carried by the event, if any.
    #[must_use]
    pub const fn period(&self) -> Option<&BillingPeriod> {
        match &self.kind {
            GatewayEventKind::Created { period, .. } | GatewayEventKind::Renewed { period } => {
                Some(period)
            }
            _ => None,
        }
    }
}

/// Event payloads, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEventKind {
    /// First successful payment or trial start.
    Created {
        /// Subscribed plan.
        plan_id: PlanId,
        /// First billing period.
        period: BillingPeriod,
        /// Trial window, if any.
        #[serde(default)]
        trial: Option<BillingPeriod>,
    },

    /// A period was paid for; the subscription moves to `period`.
    Renewed {
        /// New billing period.
        period: BillingPeriod,
    },

    /// A renewal payment failed.
    PaymentFailed,

    /// A past-due invoice was eventually paid.
    PaymentRecovered,

    /// The subscription was cancelled.
    Cancelled {
        /// Keep metering until the current period ends.
        #[serde(default)]
        at_period_end: bool,
    },

    /// Dunning gave up.
    Expired,

    /// The plan was switched at the gateway.
    PlanChanged {
        /// New plan.
        plan_id: PlanId,
    },
}

impl GatewayEventKind {
    /// Stable lowercase name for logging.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::Renewed { .. } => "renewed",
            Self::PaymentFailed => "payment_failed",
            Self::PaymentRecovered => "payment_recovered",
            Self::Cancelled { .. } => "cancelled",
            Self::Expired => "expired",
            Self::PlanChanged { .. } => "plan_changed",
        }
    }
}
