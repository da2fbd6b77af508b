//! Credit metering engine for z-metering.
//!
//! This crate gates paid features on a per-user, per-period credit balance:
//!
//! - **Reservations**: [`MeteringEngine::reserve`] debits atomically before the
//!   work runs; [`MeteringEngine::commit`] or [`MeteringEngine::release`]
//!   settles it afterwards.
//! - **Period roller**: the first request in a new billing period opens the
//!   period's credit account, carrying capped rollover from the previous one.
//! - **Subscription ledger**: payment gateway events, applied exactly once
//!   per event ID.
//! - **Usage recorder**: append-only usage log mirrored to an observability sink.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use z_metering_engine::{Actor, MeteringEngine};
//! use z_metering_core::{MeteringError, UserId};
//! use z_metering_store::MemoryStore;
//!
//! let engine = MeteringEngine::builder(Arc::new(MemoryStore::new())).build();
//! let user = UserId::generate();
//!
//! // Nobody subscribed yet.
//! let err = engine.get_balance(&Actor::User(user), &user).unwrap_err();
//! assert!(matches!(err, MeteringError::NoActiveSubscription { .. }));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod actor;
pub mod clock;
pub mod config;
pub mod engine;
pub mod ledger;
pub mod recorder;
pub mod roller;

#[cfg(test)]
mod testing;

pub use actor::Actor;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use engine::{
    Finalization, MeteringEngine, MeteringEngineBuilder, Reconciliation, ReservationRequest,
    Reserved, SweepReport,
};
pub use ledger::{EventOutcome, SubscriptionLedger};
pub use recorder::{TracingSink, UsageRecorder, UsageSink};
pub use roller::PeriodRoller;
