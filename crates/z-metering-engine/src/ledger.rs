//! Subscription ledger.
//!
//! Owns every mutation of subscription records: gateway events, explicit
//! cancellation and plan changes, and the one time-driven transition
//! (`cancel_at_period_end` coming due). Subscription writes are rare, so they
//! are serialized behind a single lock.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use z_metering_core::{
    BillingPeriod, GatewayEvent, GatewayEventKind, MeteringError, PlanCatalog, PlanId, Result,
    Subscription, SubscriptionStatus, UserId,
};
use z_metering_store::Store;

/// Result of applying a gateway event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EventOutcome {
    /// The event changed the subscription.
    Applied {
        /// Subscription after the event.
        subscription: Subscription,
    },

    /// The event ID was seen before; nothing changed.
    Duplicate,
}

/// Serialized writer of subscription records.
pub struct SubscriptionLedger {
    store: Arc<dyn Store>,
    catalog: Arc<PlanCatalog>,
    write_lock: Mutex<()>,
}

impl SubscriptionLedger {
    /// Create a ledger over `store`, resolving plans from `catalog`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, catalog: Arc<PlanCatalog>) -> Self {
        Self {
            store,
            catalog,
            write_lock: Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Load a subscription, first applying a scheduled cancellation that has come due.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn settle(&self, user_id: &UserId, now: DateTime<Utc>) -> Result<Option<Subscription>> {
        let Some(subscription) = self.store.get_subscription(user_id)? else {
            return Ok(None);
        };
        if !subscription.cancellation_due(now) {
            return Ok(Some(subscription));
        }

        let _guard = self.lock();
        let Some(mut subscription) = self.store.get_subscription(user_id)? else {
            return Ok(None);
        };
        self.settle_due(&mut subscription, now)?;
        Ok(Some(subscription))
    }

    /// Persist a scheduled cancellation that has come due. Caller holds the write lock.
    fn settle_due(&self, subscription: &mut Subscription, now: DateTime<Utc>) -> Result<()> {
        if !subscription.cancellation_due(now) {
            return Ok(());
        }
        subscription.transition(SubscriptionStatus::Cancelled, now)?;
        self.store.put_subscription(subscription)?;
        tracing::info!(
            user_id = %subscription.user_id,
            period_end = %subscription.current_period.end,
            "Subscription cancelled at period end"
        );
        Ok(())
    }

    /// Apply a gateway event exactly once per `event_id`.
    ///
    /// # Errors
    ///
    /// - `MeteringError::SubscriptionEventOutOfOrder` if the event's period starts
    ///   before the stored one. The event is recorded as seen and otherwise ignored.
    /// - `MeteringError::InvalidTransition` if the lifecycle forbids the change.
    /// - `MeteringError::SubscriptionNotFound` for lifecycle events on an unknown user.
    /// - `MeteringError::PlanNotFound` / `InvalidPeriod` for malformed payloads.
    pub fn apply_event(&self, event: &GatewayEvent, now: DateTime<Utc>) -> Result<EventOutcome> {
        let _guard = self.lock();

        if self.store.has_gateway_event(&event.event_id)? {
            tracing::debug!(event_id = %event.event_id, "Duplicate gateway event ignored");
            return Ok(EventOutcome::Duplicate);
        }

        if let Some(period) = event.period() {
            BillingPeriod::new(period.start, period.end)?;
        }

        let mut current = self.store.get_subscription(&event.user_id)?;

        if let (Some(period), Some(existing)) = (event.period(), current.as_ref()) {
            if period.start < existing.current_period.start {
                tracing::warn!(
                    event_id = %event.event_id,
                    user_id = %event.user_id,
                    event_type = event.kind.as_str(),
                    event_period_start = %period.start,
                    current_start = %existing.current_period.start,
                    "Out-of-order gateway event ignored"
                );
                self.store.mark_gateway_event(&event.event_id, now)?;
                return Err(MeteringError::SubscriptionEventOutOfOrder {
                    event_id: event.event_id.clone(),
                    current_start: existing.current_period.start,
                });
            }
        }

        // Every event sees the same state the read paths would.
        if let Some(existing) = current.as_mut() {
            self.settle_due(existing, now)?;
        }

        let subscription = self.next_state(event, current, now)?;
        self.store.put_subscription(&subscription)?;
        self.store.mark_gateway_event(&event.event_id, now)?;

        tracing::info!(
            event_id = %event.event_id,
            user_id = %event.user_id,
            event_type = event.kind.as_str(),
            status = subscription.status.as_str(),
            plan_id = %subscription.plan_id,
            "Applied gateway event"
        );

        Ok(EventOutcome::Applied { subscription })
    }

    fn next_state(
        &self,
        event: &GatewayEvent,
        current: Option<Subscription>,
        now: DateTime<Utc>,
    ) -> Result<Subscription> {
        if let GatewayEventKind::Created {
            plan_id,
            period,
            trial,
        } = &event.kind
        {
            if let Some(trial) = trial {
                BillingPeriod::new(trial.start, trial.end)?;
            }
            if let Some(existing) = current.as_ref().filter(|s| !s.status.is_terminal()) {
                return Err(MeteringError::InvalidTransition {
                    from: existing.status,
                    to: if trial.is_some() {
                        SubscriptionStatus::Trialing
                    } else {
                        SubscriptionStatus::Active
                    },
                });
            }
            self.catalog.get_active(plan_id)?;
            return Ok(Subscription::new(
                event.user_id,
                plan_id.clone(),
                *period,
                *trial,
                event.gateway_subscription_id.clone(),
                now,
            ));
        }

        let mut subscription = current.ok_or_else(|| MeteringError::SubscriptionNotFound {
            user_id: event.user_id.to_string(),
        })?;

        match &event.kind {
            GatewayEventKind::Created { .. } => {}
            GatewayEventKind::Renewed { period } => {
                subscription.transition(SubscriptionStatus::Active, now)?;
                subscription.current_period = *period;
                subscription.cancel_at_period_end = false;
            }
            GatewayEventKind::PaymentFailed => {
                move_to(&mut subscription, SubscriptionStatus::PastDue, now)?;
            }
            GatewayEventKind::PaymentRecovered => {
                move_to(&mut subscription, SubscriptionStatus::Active, now)?;
            }
            GatewayEventKind::Cancelled { at_period_end } => {
                cancel(&mut subscription, *at_period_end, now)?;
            }
            GatewayEventKind::Expired => {
                move_to(&mut subscription, SubscriptionStatus::Expired, now)?;
            }
            GatewayEventKind::PlanChanged { plan_id } => {
                self.switch_plan(&mut subscription, plan_id, now)?;
            }
        }

        subscription.gateway_subscription_id = event.gateway_subscription_id.clone();
        Ok(subscription)
    }

    /// Cancel a subscription now, or schedule it for the end of the current period.
    ///
    /// # Errors
    ///
    /// - `MeteringError::SubscriptionNotFound` if the user has no subscription.
    /// - `MeteringError::InvalidTransition` if it is already terminal.
    pub fn cancel(
        &self,
        user_id: &UserId,
        at_period_end: bool,
        now: DateTime<Utc>,
    ) -> Result<Subscription> {
        let _guard = self.lock();
        let mut subscription = self.require(user_id, now)?;
        cancel(&mut subscription, at_period_end, now)?;
        self.store.put_subscription(&subscription)?;

        tracing::info!(
            user_id = %user_id,
            at_period_end,
            status = subscription.status.as_str(),
            "Subscription cancellation requested"
        );
        Ok(subscription)
    }

    /// Point a subscription at another plan.
    ///
    /// The current credit account keeps its totals; the new plan applies to
    /// the next account opened.
    ///
    /// # Errors
    ///
    /// - `MeteringError::SubscriptionNotFound` if the user has no subscription.
    /// - `MeteringError::PlanNotFound` for unknown or retired plans.
    /// - `MeteringError::InvalidTransition` if the subscription is terminal.
    pub fn change_plan(
        &self,
        user_id: &UserId,
        plan_id: &PlanId,
        now: DateTime<Utc>,
    ) -> Result<Subscription> {
        let _guard = self.lock();
        let mut subscription = self.require(user_id, now)?;
        self.switch_plan(&mut subscription, plan_id, now)?;
        self.store.put_subscription(&subscription)?;
        Ok(subscription)
    }

    fn switch_plan(
        &self,
        subscription: &mut Subscription,
        plan_id: &PlanId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if subscription.status.is_terminal() {
            return Err(MeteringError::InvalidTransition {
                from: subscription.status,
                to: subscription.status,
            });
        }
        self.catalog.get_active(plan_id)?;

        tracing::info!(
            user_id = %subscription.user_id,
            from = %subscription.plan_id,
            to = %plan_id,
            "Plan changed"
        );
        subscription.plan_id = plan_id.clone();
        subscription.updated_at = now;
        Ok(())
    }

    fn require(&self, user_id: &UserId, now: DateTime<Utc>) -> Result<Subscription> {
        let mut subscription =
            self.store
                .get_subscription(user_id)?
                .ok_or_else(|| MeteringError::SubscriptionNotFound {
                    user_id: user_id.to_string(),
                })?;
        self.settle_due(&mut subscription, now)?;
        Ok(subscription)
    }
}

/// Transition unless already in `status`.
fn move_to(
    subscription: &mut Subscription,
    status: SubscriptionStatus,
    now: DateTime<Utc>,
) -> Result<()> {
    if subscription.status == status {
        return Ok(());
    }
    subscription.transition(status, now)
}

fn cancel(subscription: &mut Subscription, at_period_end: bool, now: DateTime<Utc>) -> Result<()> {
    if !at_period_end {
        return move_to(subscription, SubscriptionStatus::Cancelled, now);
    }
    if subscription.status.is_terminal() {
        return Err(MeteringError::InvalidTransition {
            from: subscription.status,
            to: SubscriptionStatus::Cancelled,
        });
    }
    subscription.cancel_at_period_end = true;
    subscription.updated_at = now;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use z_metering_store::MemoryStore;

    fn jan() -> BillingPeriod {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        BillingPeriod::new(start, start + Duration::days(31)).unwrap()
    }

    fn feb() -> BillingPeriod {
        BillingPeriod::new(jan().end, jan().end + Duration::days(28)).unwrap()
    }

    fn ledger() -> SubscriptionLedger {
        SubscriptionLedger::new(Arc::new(MemoryStore::new()), Arc::new(PlanCatalog::default()))
    }

    fn event(id: &str, user_id: UserId, kind: GatewayEventKind) -> GatewayEvent {
        GatewayEvent {
            event_id: id.into(),
            user_id,
            gateway_subscription_id: "sub_gw_1".into(),
            kind,
            occurred_at: jan().start,
        }
    }

    fn created(id: &str, user_id: UserId) -> GatewayEvent {
        event(
            id,
            user_id,
            GatewayEventKind::Created {
                plan_id: "plus".into(),
                period: jan(),
                trial: None,
            },
        )
    }

    fn status_after(outcome: EventOutcome) -> SubscriptionStatus {
        match outcome {
            EventOutcome::Applied { subscription } => subscription.status,
            EventOutcome::Duplicate => panic!("expected applied"),
        }
    }

    #[test]
    fn duplicate_event_applies_once() {
        let ledger = ledger();
        let user_id = UserId::generate();
        ledger.apply_event(&created("evt_1", user_id), jan().start).unwrap();

        let failed = event("evt_2", user_id, GatewayEventKind::PaymentFailed);
        assert_eq!(
            status_after(ledger.apply_event(&failed, jan().start).unwrap()),
            SubscriptionStatus::PastDue
        );

        let recovered = event("evt_3", user_id, GatewayEventKind::PaymentRecovered);
        ledger.apply_event(&recovered, jan().start).unwrap();

        // Redelivery of the failure must not push the subscription back to past_due.
        assert_eq!(
            ledger.apply_event(&failed, jan().start).unwrap(),
            EventOutcome::Duplicate
        );
        let sub = ledger.settle(&user_id, jan().start).unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
    }

    #[test]
    fn renewal_moves_period_and_reactivates() {
        let ledger = ledger();
        let user_id = UserId::generate();
        ledger.apply_event(&created("evt_1", user_id), jan().start).unwrap();
        ledger
            .apply_event(&event("evt_2", user_id, GatewayEventKind::PaymentFailed), jan().end)
            .unwrap();

        let renewed = event("evt_3", user_id, GatewayEventKind::Renewed { period: feb() });
        let outcome = ledger.apply_event(&renewed, feb().start).unwrap();
        let EventOutcome::Applied { subscription } = outcome else {
            panic!("expected applied");
        };
        assert_eq!(subscription.status, SubscriptionStatus::Active);
        assert_eq!(subscription.current_period, feb());
    }

    #[test]
    fn out_of_order_period_is_ignored() {
        let ledger = ledger();
        let user_id = UserId::generate();
        ledger.apply_event(&created("evt_1", user_id), jan().start).unwrap();
        ledger
            .apply_event(
                &event("evt_2", user_id, GatewayEventKind::Renewed { period: feb() }),
                feb().start,
            )
            .unwrap();

        let stale = event("evt_0", user_id, GatewayEventKind::Renewed { period: jan() });
        let err = ledger.apply_event(&stale, feb().start).unwrap_err();
        assert!(matches!(err, MeteringError::SubscriptionEventOutOfOrder { .. }));

        let sub = ledger.settle(&user_id, feb().start).unwrap().unwrap();
        assert_eq!(sub.current_period, feb());
        assert_eq!(
            ledger.apply_event(&stale, feb().start).unwrap(),
            EventOutcome::Duplicate
        );
    }

    #[test]
    fn created_with_trial_starts_trialing() {
        let ledger = ledger();
        let user_id = UserId::generate();
        let trial = event(
            "evt_1",
            user_id,
            GatewayEventKind::Created {
                plan_id: "pro".into(),
                period: jan(),
                trial: Some(jan()),
            },
        );
        assert_eq!(
            status_after(ledger.apply_event(&trial, jan().start).unwrap()),
            SubscriptionStatus::Trialing
        );
    }

    #[test]
    fn created_rejects_unknown_plan_and_live_duplicate() {
        let ledger = ledger();
        let user_id = UserId::generate();
        let bogus = event(
            "evt_x",
            user_id,
            GatewayEventKind::Created {
                plan_id: "platinum".into(),
                period: jan(),
                trial: None,
            },
        );
        assert!(matches!(
            ledger.apply_event(&bogus, jan().start),
            Err(MeteringError::PlanNotFound(_))
        ));

        ledger.apply_event(&created("evt_1", user_id), jan().start).unwrap();
        assert!(matches!(
            ledger.apply_event(&created("evt_2", user_id), jan().start),
            Err(MeteringError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn expired_requires_past_due() {
        let ledger = ledger();
        let user_id = UserId::generate();
        ledger.apply_event(&created("evt_1", user_id), jan().start).unwrap();

        let expired = event("evt_2", user_id, GatewayEventKind::Expired);
        assert!(matches!(
            ledger.apply_event(&expired, jan().start),
            Err(MeteringError::InvalidTransition { .. })
        ));
        // A rejected event is not marked; it may be redelivered after the fix-up.
        ledger
            .apply_event(&event("evt_3", user_id, GatewayEventKind::PaymentFailed), jan().start)
            .unwrap();
        assert_eq!(
            status_after(ledger.apply_event(&expired, jan().start).unwrap()),
            SubscriptionStatus::Expired
        );
    }

    #[test]
    fn scheduled_cancellation_settles_at_boundary() {
        let ledger = ledger();
        let user_id = UserId::generate();
        ledger.apply_event(&created("evt_1", user_id), jan().start).unwrap();

        let sub = ledger.cancel(&user_id, true, jan().start).unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert!(sub.cancel_at_period_end);

        let before = ledger.settle(&user_id, jan().end - Duration::seconds(1)).unwrap().unwrap();
        assert_eq!(before.status, SubscriptionStatus::Active);

        let after = ledger.settle(&user_id, jan().end).unwrap().unwrap();
        assert_eq!(after.status, SubscriptionStatus::Cancelled);
    }

    #[test]
    fn late_renewal_cannot_revive_a_lapsed_cancellation() {
        // One ledger had the boundary observed by a read, the other did not.
        for read_first in [true, false] {
            let ledger = ledger();
            let user_id = UserId::generate();
            ledger.apply_event(&created("evt_1", user_id), jan().start).unwrap();
            ledger.cancel(&user_id, true, jan().start).unwrap();

            let now = feb().start + Duration::hours(1);
            if read_first {
                ledger.settle(&user_id, now).unwrap();
            }

            let renewed = event("evt_2", user_id, GatewayEventKind::Renewed { period: feb() });
            assert!(
                matches!(
                    ledger.apply_event(&renewed, now),
                    Err(MeteringError::InvalidTransition {
                        from: SubscriptionStatus::Cancelled,
                        to: SubscriptionStatus::Active,
                    })
                ),
                "read_first = {read_first}"
            );
            let sub = ledger.settle(&user_id, now).unwrap().unwrap();
            assert_eq!(sub.status, SubscriptionStatus::Cancelled);
            assert_eq!(sub.current_period, jan());
        }
    }

    #[test]
    fn plan_change_after_lapsed_cancellation_is_rejected() {
        let ledger = ledger();
        let user_id = UserId::generate();
        ledger.apply_event(&created("evt_1", user_id), jan().start).unwrap();
        ledger.cancel(&user_id, true, jan().start).unwrap();

        assert!(matches!(
            ledger.change_plan(&user_id, &"pro".into(), feb().start),
            Err(MeteringError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn plan_change_validates_plan() {
        let ledger = ledger();
        let user_id = UserId::generate();
        ledger.apply_event(&created("evt_1", user_id), jan().start).unwrap();

        let sub = ledger.change_plan(&user_id, &"pro".into(), jan().start).unwrap();
        assert_eq!(sub.plan_id, PlanId::from("pro"));
        assert!(matches!(
            ledger.change_plan(&user_id, &"nope".into(), jan().start),
            Err(MeteringError::PlanNotFound(_))
        ));
    }
}
