//! Period roller.
//!
//! Credit accounts are created lazily: the first request that needs the
//! account for a subscription's current period opens it, seeded with the
//! plan's allotment plus rollover from the account that ended exactly where
//! the new period starts.
//!
//! Rollover is `min(prior.remaining, floor(prior.total * fraction))`.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use z_metering_core::{CreditAccount, MeteringError, Plan, Result, Subscription};
use z_metering_store::{Store, StoreError};

/// Creates the credit account for a subscription's current period.
#[derive(Clone)]
pub struct PeriodRoller {
    store: Arc<dyn Store>,
}

impl PeriodRoller {
    /// Create a roller over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Return the account for `subscription`'s current period, opening it if absent.
    ///
    /// Safe under concurrent first requests: all callers converge on the one
    /// stored account.
    ///
    /// # Errors
    ///
    /// - `MeteringError::InvalidPlan` if `plan` is unlimited (unlimited plans have no account).
    /// - `MeteringError::AccountCreationConflict` if creation conflicted twice.
    /// - `MeteringError::Storage` on store failures.
    pub fn current_account(
        &self,
        subscription: &Subscription,
        plan: &Plan,
        now: DateTime<Utc>,
    ) -> Result<CreditAccount> {
        let period = subscription.current_period;
        if let Some(account) = self.store.get_account(&subscription.user_id, period.start)? {
            return Ok(account);
        }

        let allotment = plan.monthly_credits.credits().ok_or_else(|| {
            MeteringError::InvalidPlan(format!("plan {} is unlimited and has no account", plan.id))
        })?;
        let rollover_in = self.rollover_into(subscription, plan)?;
        let fresh = CreditAccount::open(subscription.user_id, period, allotment, rollover_in, now);

        let insert = match self.store.insert_account_if_absent(&fresh) {
            Err(StoreError::Conflict(reason)) => {
                tracing::debug!(
                    user_id = %subscription.user_id,
                    reason = %reason,
                    "Account creation conflicted; retrying once"
                );
                self.store
                    .insert_account_if_absent(&fresh)
                    .map_err(|e| match e {
                        StoreError::Conflict(_) => MeteringError::AccountCreationConflict {
                            user_id: subscription.user_id.to_string(),
                        },
                        other => other.into(),
                    })?
            }
            other => other?,
        };

        if insert.created {
            tracing::info!(
                user_id = %subscription.user_id,
                plan_id = %plan.id,
                period_start = %period.start,
                period_end = %period.end,
                total = insert.account.total,
                rollover_in = insert.account.rollover_in,
                "Opened credit account"
            );
        }

        Ok(insert.account)
    }

    /// Compute rollover from the account immediately preceding the current period.
    fn rollover_into(&self, subscription: &Subscription, plan: &Plan) -> Result<u64> {
        let period = subscription.current_period;
        let prior = self
            .store
            .latest_account_before(&subscription.user_id, period.start)?;

        Ok(prior
            .filter(|prior| prior.period.end == period.start)
            .map_or(0, |prior| rollover_amount(&prior, plan)))
    }
}

/// Credits carried out of `prior` under `plan`'s rollover rule.
#[must_use]
pub fn rollover_amount(prior: &CreditAccount, plan: &Plan) -> u64 {
    prior.remaining().min(plan.rollover_cap(prior.total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use z_metering_core::{
        Agent, BillingPeriod, PlanCatalog, PlanId, Reservation, ReservationId, ReservationState,
        UserId,
    };
    use z_metering_store::MemoryStore;

    use crate::testing::FaultyStore;

    fn jan() -> BillingPeriod {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        BillingPeriod::new(start, start + Duration::days(31)).unwrap()
    }

    fn feb() -> BillingPeriod {
        let start = jan().end;
        BillingPeriod::new(start, start + Duration::days(28)).unwrap()
    }

    fn plan(id: &str) -> Plan {
        PlanCatalog::default().get(&PlanId::from(id)).unwrap().clone()
    }

    fn subscription(user_id: UserId, plan_id: &str, period: BillingPeriod) -> Subscription {
        Subscription::new(user_id, plan_id.into(), period, None, "sub_1".into(), period.start)
    }

    #[test]
    fn rollover_is_capped_by_fraction() {
        let mut prior = CreditAccount::open(UserId::generate(), jan(), 8000, 0, jan().start);
        prior.consumed = 7000;
        assert_eq!(rollover_amount(&prior, &plan("plus")), 1000);

        prior.consumed = 1000;
        assert_eq!(rollover_amount(&prior, &plan("plus")), 4000);

        assert_eq!(rollover_amount(&prior, &plan("free")), 0);
    }

    #[test]
    fn plus_scenario_rolls_remaining_into_next_period() {
        let store = Arc::new(MemoryStore::new());
        let roller = PeriodRoller::new(store.clone());
        let user_id = UserId::generate();
        let plus = plan("plus");

        let first = roller
            .current_account(&subscription(user_id, "plus", jan()), &plus, jan().start)
            .unwrap();
        assert_eq!(first.total, 8000);

        let r = Reservation {
            id: ReservationId::generate(),
            user_id,
            period_start: jan().start,
            amount: 7500,
            unmetered: false,
            agent: Agent::Chat,
            action: "send_message".into(),
            metadata: serde_json::Value::Null,
            state: ReservationState::Pending,
            created_at: jan().start,
            finalized_at: None,
        };
        store.reserve_credits(&r).unwrap();
        store.commit_reservation(&r.id, jan().start).unwrap();

        let next = roller
            .current_account(&subscription(user_id, "plus", feb()), &plus, feb().start)
            .unwrap();
        assert_eq!(next.rollover_in, 500);
        assert_eq!(next.total, 8500);
        assert_eq!(next.consumed, 0);
    }

    #[test]
    fn gap_between_periods_carries_nothing() {
        let store = Arc::new(MemoryStore::new());
        let roller = PeriodRoller::new(store);
        let user_id = UserId::generate();
        let plus = plan("plus");

        roller
            .current_account(&subscription(user_id, "plus", jan()), &plus, jan().start)
            .unwrap();

        let later_start = feb().end;
        let march = BillingPeriod::new(later_start, later_start + Duration::days(31)).unwrap();
        let account = roller
            .current_account(&subscription(user_id, "plus", march), &plus, march.start)
            .unwrap();
        assert_eq!(account.rollover_in, 0);
        assert_eq!(account.total, 8000);
    }

    #[test]
    fn concurrent_rolls_create_one_account() {
        let store = Arc::new(MemoryStore::new());
        let roller = PeriodRoller::new(store.clone());
        let user_id = UserId::generate();
        let plus = plan("plus");
        let sub = subscription(user_id, "plus", jan());
        let opened = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..32 {
                s.spawn(|| {
                    let account = roller.current_account(&sub, &plus, jan().start).unwrap();
                    assert_eq!(account.total, 8000);
                    opened.fetch_add(1, Ordering::SeqCst);
                });
            }
        });

        assert_eq!(opened.load(Ordering::SeqCst), 32);
        assert_eq!(store.list_accounts(&user_id).unwrap().len(), 1);
    }

    #[test]
    fn single_insert_conflict_is_retried() {
        let store = Arc::new(FaultyStore::account_conflicts(1));
        let roller = PeriodRoller::new(store.clone());
        let user_id = UserId::generate();

        let account = roller
            .current_account(&subscription(user_id, "plus", jan()), &plan("plus"), jan().start)
            .unwrap();
        assert_eq!(account.total, 8000);
        assert_eq!(store.conflicts_left(), 0);
        assert_eq!(store.list_accounts(&user_id).unwrap().len(), 1);
    }

    #[test]
    fn repeated_insert_conflict_surfaces() {
        let store = Arc::new(FaultyStore::account_conflicts(2));
        let roller = PeriodRoller::new(store.clone());
        let user_id = UserId::generate();

        let err = roller
            .current_account(&subscription(user_id, "plus", jan()), &plan("plus"), jan().start)
            .unwrap_err();
        assert!(matches!(err, MeteringError::AccountCreationConflict { .. }));
        assert!(store.list_accounts(&user_id).unwrap().is_empty());

        // The next request opens the account normally.
        let account = roller
            .current_account(&subscription(user_id, "plus", jan()), &plan("plus"), jan().start)
            .unwrap();
        assert_eq!(account.total, 8000);
    }

    #[test]
    fn unlimited_plan_has_no_account() {
        let roller = PeriodRoller::new(Arc::new(MemoryStore::new()));
        let sub = subscription(UserId::generate(), "unlimited", jan());
        let err = roller
            .current_account(&sub, &plan("unlimited"), jan().start)
            .unwrap_err();
        assert!(matches!(err, MeteringError::InvalidPlan(_)));
    }
}
