//! Core types and utilities for z-metering.
//!
//! This crate provides the foundational types of the credit metering engine:
//!
//! - **Identifiers**: `UserId`, `ReservationId`, `UsageRecordId`
//! - **Plans**: `Plan`, `PlanCatalog`, `CreditAllotment`
//! - **Subscriptions**: `Subscription`, `SubscriptionStatus`, `BillingPeriod`
//! - **Credits**: `CreditAccount`, `Reservation`, `Balance`
//! - **Usage**: `UsageRecord`, `UsageOutcome`, `Agent`
//! - **Gateway events**: `GatewayEvent`, `GatewayEventKind`
//! - **Costs**: `ActionCosts`
//!
//! # Credits
//!
//! Credits are whole units stored as `u64`. A plan grants a fixed number per
//! billing period (or `-1` on the wire for unlimited), and a share of unused
//! credits may roll into the next period.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod costs;
pub mod credits;
pub mod error;
pub mod events;
pub mod ids;
pub mod plan;
pub mod subscription;
pub mod usage;

pub use costs::{ActionCosts, AgentCosts};
pub use credits::{Balance, CreditAccount, Reservation, ReservationState};
pub use error::{MeteringError, Result};
pub use events::{GatewayEvent, GatewayEventKind};
pub use ids::{IdError, ReservationId, UsageRecordId, UserId};
pub use plan::{
    CreditAllotment, Plan, PlanCatalog, PlanId, PLUS_PLAN_CREDITS, PRO_PLAN_CREDITS,
    UNLIMITED_SENTINEL,
};
pub use subscription::{BillingPeriod, Subscription, SubscriptionStatus};
pub use usage::{Agent, UsageOutcome, UsageRecord};
