//! The metering engine.
//!
//! Public entry point for feature call sites, the payment gateway and the UI.
//! A reservation flows through:
//!
//! 1. authorize the caller against the target user
//! 2. resolve the subscription (settling a due cancellation)
//! 3. resolve the current credit account (rolling the period if needed)
//! 4. check-and-debit atomically in the store
//!
//! Denials and terminal outcomes are appended to the usage log after the
//! debit is settled; a failing log never fails the reservation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use z_metering_core::{
    ActionCosts, Agent, Balance, CreditAccount, GatewayEvent, MeteringError, Plan, PlanCatalog,
    PlanId, Reservation, ReservationId, ReservationState, Result, Subscription, UsageOutcome,
    UsageRecord, UserId,
};
use z_metering_store::{Finalized, Store};

use crate::actor::Actor;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::ledger::{EventOutcome, SubscriptionLedger};
use crate::recorder::{TracingSink, UsageRecorder, UsageSink};
use crate::roller::PeriodRoller;

/// A request to reserve credits before doing paid work.
#[derive(Debug, Clone)]
pub struct ReservationRequest {
    /// User whose credits are debited.
    pub user_id: UserId,
    /// Credits to debit. Must be positive.
    pub cost: u64,
    /// Agent doing the work.
    pub agent: Agent,
    /// Action within the agent.
    pub action: String,
    /// Context copied onto the usage record.
    pub metadata: serde_json::Value,
}

/// A granted reservation.
#[derive(Debug, Clone, Serialize)]
pub struct Reserved {
    /// The stored reservation.
    pub reservation: Reservation,
    /// Credits left after the debit; `None` on unlimited plans.
    pub remaining: Option<u64>,
}

/// Outcome of a commit or release.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reservation", rename_all = "snake_case")]
pub enum Finalization {
    /// This call moved the reservation out of `pending`.
    Finalized(Reservation),
    /// The reservation was already committed or released; nothing changed.
    AlreadyFinalized(Reservation),
}

impl Finalization {
    /// The reservation after the call.
    #[must_use]
    pub const fn reservation(&self) -> &Reservation {
        match self {
            Self::Finalized(r) | Self::AlreadyFinalized(r) => r,
        }
    }

    /// Whether this call performed the transition.
    #[must_use]
    pub const fn is_finalized(&self) -> bool {
        matches!(self, Self::Finalized(_))
    }
}

/// Drift audit of the current credit account against the usage log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    /// Start of the audited period.
    pub period_start: DateTime<Utc>,
    /// `consumed` as stored on the account.
    pub consumed: u64,
    /// Sum of committed usage records for the period.
    pub committed_sum: u64,
    /// Sum of still-pending reservations for the period.
    pub pending_sum: u64,
    /// `consumed - (committed_sum + pending_sum)`; zero when consistent.
    pub drift: i64,
}

/// Result of a stale-reservation sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Reservations this sweep released.
    pub released: usize,
    /// Credits returned to accounts still able to spend or roll them over.
    pub credits_returned: u64,
    /// Credits returned to a period whose rollover was already taken; they
    /// are not spendable and do not carry forward.
    pub credits_stranded: u64,
    /// Reservations that could not be released (logged).
    pub failed: usize,
}

/// Builder for [`MeteringEngine`].
pub struct MeteringEngineBuilder {
    store: Arc<dyn Store>,
    catalog: Arc<PlanCatalog>,
    costs: Arc<ActionCosts>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn UsageSink>,
    config: EngineConfig,
}

impl MeteringEngineBuilder {
    /// Use `catalog` instead of the built-in plans.
    #[must_use]
    pub fn catalog(mut self, catalog: PlanCatalog) -> Self {
        self.catalog = Arc::new(catalog);
        self
    }

    /// Use `costs` instead of the built-in action cost table.
    #[must_use]
    pub fn costs(mut self, costs: ActionCosts) -> Self {
        self.costs = Arc::new(costs);
        self
    }

    /// Read time from `clock`.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Mirror usage records to `sink`.
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn UsageSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Override engine tunables.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Assemble the engine.
    #[must_use]
    pub fn build(self) -> MeteringEngine {
        MeteringEngine {
            ledger: SubscriptionLedger::new(self.store.clone(), self.catalog.clone()),
            roller: PeriodRoller::new(self.store.clone()),
            recorder: UsageRecorder::new(self.store.clone(), self.sink),
            store: self.store,
            catalog: self.catalog,
            costs: self.costs,
            clock: self.clock,
            config: self.config,
        }
    }
}

/// Orchestrates subscriptions, credit accounts, reservations and usage.
pub struct MeteringEngine {
    store: Arc<dyn Store>,
    catalog: Arc<PlanCatalog>,
    costs: Arc<ActionCosts>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    ledger: SubscriptionLedger,
    roller: PeriodRoller,
    recorder: UsageRecorder,
}

/// What a metered-or-not subscription resolves to for the current period.
enum Metering {
    Metered(CreditAccount),
    Unmetered,
}

impl MeteringEngine {
    /// Start building an engine over `store` with default plans, costs,
    /// system clock and tracing sink.
    #[must_use]
    pub fn builder(store: Arc<dyn Store>) -> MeteringEngineBuilder {
        MeteringEngineBuilder {
            store,
            catalog: Arc::new(PlanCatalog::default()),
            costs: Arc::new(ActionCosts::default()),
            clock: Arc::new(SystemClock),
            sink: Arc::new(TracingSink),
            config: EngineConfig::default(),
        }
    }

    /// The plan catalog.
    #[must_use]
    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    /// The engine configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Current time according to the engine's clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // =========================================================================
    // Reservation protocol
    // =========================================================================

    /// Atomically check-and-debit `request.cost` credits.
    ///
    /// Every denial is written to the usage log before it is returned.
    ///
    /// # Errors
    ///
    /// - `MeteringError::Forbidden` if `actor` may not act for the user.
    /// - `MeteringError::InvalidCost` if the cost is zero.
    /// - `MeteringError::NoActiveSubscription` if no subscription permits metering.
    /// - `MeteringError::InsufficientCredits` if the balance cannot cover the cost.
    pub fn reserve(&self, actor: &Actor, request: ReservationRequest) -> Result<Reserved> {
        actor.authorize(&request.user_id)?;
        if request.cost == 0 {
            return Err(MeteringError::InvalidCost(format!(
                "cost for {}/{} must be positive",
                request.agent, request.action
            )));
        }

        let now = self.clock.now();
        match self.try_reserve(&request, now) {
            Err(e) if e.is_denial() => {
                tracing::warn!(
                    user_id = %request.user_id,
                    agent = %request.agent,
                    action = %request.action,
                    cost = request.cost,
                    reason = e.code(),
                    "Reservation denied"
                );
                let record = UsageRecord::denied(
                    request.user_id,
                    request.agent,
                    request.action,
                    request.cost,
                    e.code().to_string(),
                    request.metadata,
                    now,
                );
                self.recorder.record(&record);
                Err(e)
            }
            other => other,
        }
    }

    fn try_reserve(&self, request: &ReservationRequest, now: DateTime<Utc>) -> Result<Reserved> {
        let subscription = self.metered_subscription(&request.user_id, now)?;
        let plan = self.catalog.get(&subscription.plan_id)?;

        let mut reservation = Reservation {
            id: ReservationId::generate(),
            user_id: request.user_id,
            period_start: subscription.current_period.start,
            amount: request.cost,
            unmetered: false,
            agent: request.agent.clone(),
            action: request.action.clone(),
            metadata: request.metadata.clone(),
            state: ReservationState::Pending,
            created_at: now,
            finalized_at: None,
        };

        match self.metering(&subscription, plan, now)? {
            Metering::Unmetered => {
                reservation.unmetered = true;
                self.store.put_reservation(&reservation)?;
                tracing::info!(
                    reservation_id = %reservation.id,
                    user_id = %reservation.user_id,
                    agent = %reservation.agent,
                    action = %reservation.action,
                    "Unmetered reservation granted"
                );
                Ok(Reserved {
                    reservation,
                    remaining: None,
                })
            }
            Metering::Metered(account) => {
                reservation.period_start = account.period.start;
                let debited = self.store.reserve_credits(&reservation)?;
                tracing::info!(
                    reservation_id = %reservation.id,
                    user_id = %reservation.user_id,
                    agent = %reservation.agent,
                    action = %reservation.action,
                    amount = reservation.amount,
                    remaining = debited.remaining(),
                    "Credits reserved"
                );
                Ok(Reserved {
                    reservation,
                    remaining: Some(debited.remaining()),
                })
            }
        }
    }

    /// Reserve the configured cost of `agent`/`action`.
    ///
    /// # Errors
    ///
    /// Returns `MeteringError::InvalidCost` for unpriced actions, otherwise as
    /// [`MeteringEngine::reserve`].
    pub fn reserve_action(
        &self,
        actor: &Actor,
        user_id: UserId,
        agent: Agent,
        action: &str,
        metadata: serde_json::Value,
    ) -> Result<Reserved> {
        let cost = self.costs.cost_of(&agent, action)?;
        self.reserve(
            actor,
            ReservationRequest {
                user_id,
                cost,
                agent,
                action: action.to_string(),
                metadata,
            },
        )
    }

    /// Finalize a reservation's debit.
    ///
    /// Committing an already-final reservation returns
    /// [`Finalization::AlreadyFinalized`] and changes nothing.
    ///
    /// # Errors
    ///
    /// - `MeteringError::ReservationNotFound` for unknown IDs.
    /// - `MeteringError::Forbidden` if `actor` may not act for its user.
    pub fn commit(&self, actor: &Actor, reservation_id: &ReservationId) -> Result<Finalization> {
        self.authorize_reservation(actor, reservation_id)?;
        let now = self.clock.now();
        let finalized = self.store.commit_reservation(reservation_id, now)?;
        Ok(self.conclude(finalized, UsageOutcome::Committed, None, now))
    }

    /// Reverse a reservation's debit.
    ///
    /// Releasing an already-final reservation returns
    /// [`Finalization::AlreadyFinalized`] and returns no credits.
    ///
    /// # Errors
    ///
    /// - `MeteringError::ReservationNotFound` for unknown IDs.
    /// - `MeteringError::Forbidden` if `actor` may not act for its user.
    pub fn release(&self, actor: &Actor, reservation_id: &ReservationId) -> Result<Finalization> {
        self.authorize_reservation(actor, reservation_id)?;
        let now = self.clock.now();
        let finalized = self.store.release_reservation(reservation_id, now)?;
        Ok(self.conclude(finalized, UsageOutcome::Released, None, now))
    }

    fn authorize_reservation(&self, actor: &Actor, reservation_id: &ReservationId) -> Result<()> {
        let reservation = self.store.get_reservation(reservation_id)?.ok_or_else(|| {
            MeteringError::ReservationNotFound {
                reservation_id: reservation_id.to_string(),
            }
        })?;
        actor.authorize(&reservation.user_id)
    }

    fn conclude(
        &self,
        finalized: Finalized,
        outcome: UsageOutcome,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Finalization {
        let reservation = finalized.reservation;
        if !finalized.transitioned {
            tracing::debug!(
                reservation_id = %reservation.id,
                state = ?reservation.state,
                requested = outcome.as_str(),
                "Reservation already finalized"
            );
            return Finalization::AlreadyFinalized(reservation);
        }

        let mut record = UsageRecord::finalized(&reservation, outcome, now);
        if let Some(reason) = reason {
            record = record.with_metadata_entry("reason", serde_json::json!(reason));
        }
        self.recorder.record(&record);

        tracing::info!(
            reservation_id = %reservation.id,
            user_id = %reservation.user_id,
            amount = reservation.amount,
            outcome = outcome.as_str(),
            "Reservation finalized"
        );
        Finalization::Finalized(reservation)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Balance of the user's current period, opening the account if needed.
    ///
    /// # Errors
    ///
    /// - `MeteringError::Forbidden` if `actor` may not act for the user.
    /// - `MeteringError::NoActiveSubscription` if no subscription permits metering.
    pub fn get_balance(&self, actor: &Actor, user_id: &UserId) -> Result<Balance> {
        actor.authorize(user_id)?;
        let now = self.clock.now();
        let subscription = self.metered_subscription(user_id, now)?;
        let plan = self.catalog.get(&subscription.plan_id)?;

        Ok(match self.metering(&subscription, plan, now)? {
            Metering::Metered(account) => Balance::of(&account),
            Metering::Unmetered => Balance::unlimited(subscription.current_period),
        })
    }

    /// The plan of a subscription that currently permits metering.
    ///
    /// # Errors
    ///
    /// - `MeteringError::Forbidden` if `actor` may not act for the user.
    /// - `MeteringError::NoActiveSubscription` if no subscription permits metering.
    pub fn get_active_plan(&self, actor: &Actor, user_id: &UserId) -> Result<Plan> {
        actor.authorize(user_id)?;
        let subscription = self.metered_subscription(user_id, self.clock.now())?;
        self.catalog.get(&subscription.plan_id).cloned()
    }

    /// The user's subscription in whatever status it is in.
    ///
    /// # Errors
    ///
    /// - `MeteringError::Forbidden` if `actor` may not act for the user.
    /// - `MeteringError::SubscriptionNotFound` if the user never subscribed.
    pub fn get_subscription(&self, actor: &Actor, user_id: &UserId) -> Result<Subscription> {
        actor.authorize(user_id)?;
        self.ledger
            .settle(user_id, self.clock.now())?
            .ok_or_else(|| MeteringError::SubscriptionNotFound {
                user_id: user_id.to_string(),
            })
    }

    /// Usage records of a user, newest first.
    ///
    /// # Errors
    ///
    /// Returns `MeteringError::Forbidden` if `actor` may not act for the user.
    pub fn list_usage(
        &self,
        actor: &Actor,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<UsageRecord>> {
        actor.authorize(user_id)?;
        Ok(self.store.list_usage_by_user(user_id, limit, offset)?)
    }

    /// Compare the current account's `consumed` with the usage log.
    ///
    /// # Errors
    ///
    /// - `MeteringError::Forbidden` if `actor` may not act for the user.
    /// - `MeteringError::NoActiveSubscription` if no subscription permits metering.
    pub fn reconcile(&self, actor: &Actor, user_id: &UserId) -> Result<Reconciliation> {
        actor.authorize(user_id)?;
        let now = self.clock.now();
        let subscription = self.metered_subscription(user_id, now)?;
        let plan = self.catalog.get(&subscription.plan_id)?;

        let (period_start, consumed) = match self.metering(&subscription, plan, now)? {
            Metering::Metered(account) => (account.period.start, account.consumed),
            Metering::Unmetered => (subscription.current_period.start, 0),
        };

        let committed_sum = self
            .store
            .list_usage_by_user(user_id, usize::MAX, 0)?
            .iter()
            .filter(|r| r.outcome == UsageOutcome::Committed && r.period_start == Some(period_start))
            .map(|r| r.amount)
            .sum::<u64>();

        let pending_sum = self
            .store
            .list_reservations_by_user(user_id)?
            .iter()
            .filter(|r| {
                r.state == ReservationState::Pending && !r.unmetered && r.period_start == period_start
            })
            .map(|r| r.amount)
            .sum::<u64>();

        let drift = signed(consumed) - signed(committed_sum) - signed(pending_sum);
        if drift != 0 {
            tracing::warn!(
                user_id = %user_id,
                period_start = %period_start,
                consumed,
                committed_sum,
                pending_sum,
                drift,
                "Credit account drifted from usage log"
            );
        }

        Ok(Reconciliation {
            period_start,
            consumed,
            committed_sum,
            pending_sum,
            drift,
        })
    }

    // =========================================================================
    // Subscription lifecycle
    // =========================================================================

    /// Apply a payment gateway event. Redelivered event IDs are no-ops.
    ///
    /// # Errors
    ///
    /// See [`SubscriptionLedger::apply_event`].
    pub fn apply_subscription_event(&self, event: &GatewayEvent) -> Result<EventOutcome> {
        self.ledger.apply_event(event, self.clock.now())
    }

    /// Cancel immediately or at the end of the current period.
    ///
    /// # Errors
    ///
    /// - `MeteringError::Forbidden` if `actor` may not act for the user.
    /// - See [`SubscriptionLedger::cancel`].
    pub fn cancel_subscription(
        &self,
        actor: &Actor,
        user_id: &UserId,
        at_period_end: bool,
    ) -> Result<Subscription> {
        actor.authorize(user_id)?;
        self.ledger.cancel(user_id, at_period_end, self.clock.now())
    }

    /// Switch plans; the current account keeps its totals.
    ///
    /// # Errors
    ///
    /// - `MeteringError::Forbidden` if `actor` may not act for the user.
    /// - See [`SubscriptionLedger::change_plan`].
    pub fn change_plan(
        &self,
        actor: &Actor,
        user_id: &UserId,
        plan_id: &PlanId,
    ) -> Result<Subscription> {
        actor.authorize(user_id)?;
        self.ledger.change_plan(user_id, plan_id, self.clock.now())
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Release every pending reservation older than the configured grace period.
    ///
    /// Failures on individual reservations are logged and counted; the sweep
    /// carries on with the rest.
    ///
    /// # Errors
    ///
    /// Returns an error only if pending reservations cannot be listed.
    pub fn sweep_stale_reservations(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let cutoff = now - self.config.reservation_grace;
        let stale = self.store.list_pending_reservations(cutoff)?;
        let mut report = SweepReport::default();

        for reservation in stale {
            let rolled_over = !reservation.unmetered && self.successor_opened(&reservation);
            match self.store.release_reservation(&reservation.id, now) {
                Ok(finalized) => {
                    if let Finalization::Finalized(r) =
                        self.conclude(finalized, UsageOutcome::Released, Some("stale_sweep"), now)
                    {
                        report.released += 1;
                        if rolled_over {
                            tracing::warn!(
                                reservation_id = %r.id,
                                user_id = %r.user_id,
                                period_start = %r.period_start,
                                amount = r.amount,
                                "Released reservation into a rolled-over period; credits do not carry forward"
                            );
                            report.credits_stranded += r.amount;
                        } else if !r.unmetered {
                            report.credits_returned += r.amount;
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(
                        reservation_id = %reservation.id,
                        error = %e,
                        "Failed to release stale reservation"
                    );
                    report.failed += 1;
                }
            }
        }

        if report.released > 0 || report.failed > 0 {
            tracing::info!(
                released = report.released,
                credits_returned = report.credits_returned,
                credits_stranded = report.credits_stranded,
                failed = report.failed,
                "Stale reservation sweep finished"
            );
        }
        Ok(report)
    }

    /// Whether the account after `reservation`'s period is already open, so its
    /// rollover was computed without this reservation's credits.
    fn successor_opened(&self, reservation: &Reservation) -> bool {
        let lookup = self
            .store
            .get_account(&reservation.user_id, reservation.period_start)
            .and_then(|account| match account {
                Some(account) => self
                    .store
                    .get_account(&reservation.user_id, account.period.end)
                    .map(|next| next.is_some()),
                None => Ok(false),
            });
        lookup.unwrap_or_else(|e| {
            tracing::warn!(
                reservation_id = %reservation.id,
                error = %e,
                "Could not check rollover state of stale reservation"
            );
            false
        })
    }

    // =========================================================================
    // Resolution helpers
    // =========================================================================

    /// The user's subscription if it currently permits metering.
    fn metered_subscription(&self, user_id: &UserId, now: DateTime<Utc>) -> Result<Subscription> {
        self.ledger
            .settle(user_id, now)?
            .filter(|s| s.permits_metering(self.config.allow_past_due))
            .ok_or_else(|| MeteringError::NoActiveSubscription {
                user_id: user_id.to_string(),
            })
    }

    /// Resolve how the current period is metered.
    ///
    /// An account that already exists for the period wins over the plan, so a
    /// mid-period switch to unlimited takes effect at the next period.
    fn metering(
        &self,
        subscription: &Subscription,
        plan: &Plan,
        now: DateTime<Utc>,
    ) -> Result<Metering> {
        if plan.monthly_credits.is_unlimited() {
            let existing = self
                .store
                .get_account(&subscription.user_id, subscription.current_period.start)?;
            return Ok(existing.map_or(Metering::Unmetered, Metering::Metered));
        }
        self.roller
            .current_account(subscription, plan, now)
            .map(Metering::Metered)
    }
}

#[allow(clippy::cast_possible_wrap)]
const fn signed(value: u64) -> i64 {
    value as i64
}
