//! Credit accounts and reservations.
//!
//! A credit account exists per user per billing period. Reservations debit
//! it pessimistically: `consumed` grows at reserve time and shrinks again only
//! when a reservation is released.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Agent, BillingPeriod, ReservationId, UserId};

/// Credits for one user in one billing period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditAccount {
    /// Owning user.
    pub user_id: UserId,

    /// Billing period; `(user_id, period.start)` is the account key.
    pub period: BillingPeriod,

    /// Allotment plus rollover.
    pub total: u64,

    /// Credits debited so far, including pending reservations.
    pub consumed: u64,

    /// Credits carried over from the preceding period.
    pub rollover_in: u64,

    /// When the account was created.
    pub created_at: DateTime<Utc>,

    /// When `consumed` last changed.
    pub updated_at: DateTime<Utc>,
}

impl CreditAccount {
    /// Open a fresh account for `period`.
    #[must_use]
    pub fn open(
        user_id: UserId,
        period: BillingPeriod,
        allotment: u64,
        rollover_in: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id,
            period,
            total: allotment.saturating_add(rollover_in),
            consumed: 0,
            rollover_in,
            created_at: now,
            updated_at: now,
        }
    }

    /// Credits still available. Never negative.
    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.consumed)
    }

    /// Check-and-debit. Leaves the account untouched when `cost` exceeds
    /// the remaining balance.
    ///
    /// Returns the remaining balance that was insufficient on failure.
    ///
    /// # Errors
    ///
    /// Returns `Err(remaining)` if `cost > remaining`.
    pub fn try_debit(&mut self, cost: u64, now: DateTime<Utc>) -> Result<(), u64> {
        let remaining = self.remaining();
        if cost > remaining {
            return Err(remaining);
        }
        self.consumed += cost;
        self.updated_at = now;
        Ok(())
    }

    /// Reverse a previous debit.
    pub fn credit_back(&mut self, amount: u64, now: DateTime<Utc>) {
        self.consumed = self.consumed.saturating_sub(amount);
        self.updated_at = now;
    }
}

/// Lifecycle state of a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    /// Debit applied, awaiting commit or release.
    Pending,
    /// Debit finalized.
    Committed,
    /// Debit reversed.
    Released,
}

impl ReservationState {
    /// Whether the reservation has reached a terminal state.
    #[must_use]
    pub const fn is_final(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A provisional, already-applied debit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    /// Reservation token handed to the caller.
    pub id: ReservationId,

    /// User whose account was debited.
    pub user_id: UserId,

    /// Start of the debited account's period (the account key).
    pub period_start: DateTime<Utc>,

    /// Credits debited.
    pub amount: u64,

    /// Unlimited plans skip the account entirely.
    pub unmetered: bool,

    /// Agent that requested the reservation.
    pub agent: Agent,

    /// Action within the agent (e.g. `send_message`).
    pub action: String,

    /// Free-form context copied onto the terminal usage record.
    pub metadata: serde_json::Value,

    /// Current state.
    pub state: ReservationState,

    /// When the reservation was taken.
    pub created_at: DateTime<Utc>,

    /// When it was committed or released.
    pub finalized_at: Option<DateTime<Utc>>,
}

impl Reservation {
    /// Mark the reservation final if it is still pending.
    ///
    /// Returns `false` if it was already final, leaving it unchanged.
    pub fn finalize(&mut self, state: ReservationState, now: DateTime<Utc>) -> bool {
        if self.state.is_final() {
            return false;
        }
        self.state = state;
        self.finalized_at = Some(now);
        true
    }
}

/// Read-only balance view for UI display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    /// Allotment plus rollover; `None` when unlimited.
    pub total: Option<u64>,
    /// Credits consumed in the period.
    pub consumed: u64,
    /// Credits left; `None` when unlimited.
    pub remaining: Option<u64>,
    /// Rollover carried into the period.
    pub rollover_in: u64,
    /// Period start.
    pub period_start: DateTime<Utc>,
    /// Period end (exclusive).
    pub period_end: DateTime<Utc>,
}

impl Balance {
    /// Balance of a metered account.
    #[must_use]
    pub fn of(account: &CreditAccount) -> Self {
        Self {
            total: Some(account.total),
            consumed: account.consumed,
            remaining: Some(account.remaining()),
            rollover_in: account.rollover_in,
            period_start: account.period.start,
            period_end: account.period.end,
        }
    }

    /// Balance of an unlimited subscription.
    #[must_use]
    pub fn unlimited(period: BillingPeriod) -> Self {
        Self {
            total: None,
            consumed: 0,
            remaining: None,
            rollover_in: 0,
            period_start: period.start,
            period_end: period.end,
        }
    }

    /// Whether metering is bypassed.
    #[must_use]
    pub const fn is_unlimited(&self) -> bool {
        self.total.is_none()
    }
}
