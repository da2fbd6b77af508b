//! In-memory storage implementation.
//!
//! Every map is a `DashMap`, so operations on one user only contend with
//! other operations on the same shard. A user's credit accounts live behind a
//! single map entry, which makes the entry guard the per-account critical
//! section for check-and-debit.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use z_metering_core::{
    CreditAccount, Reservation, ReservationId, ReservationState, Subscription, UsageRecord, UserId,
};

use crate::error::{Result, StoreError};
use crate::{AccountInsert, Finalized, Store};

/// In-memory storage backed by sharded concurrent maps.
#[derive(Debug, Default)]
pub struct MemoryStore {
    subscriptions: DashMap<UserId, Subscription>,
    gateway_events: DashMap<String, DateTime<Utc>>,
    accounts: DashMap<UserId, BTreeMap<DateTime<Utc>, CreditAccount>>,
    reservations: DashMap<ReservationId, Reservation>,
    usage: DashMap<UserId, Vec<UsageRecord>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn finalize(
        &self,
        reservation_id: &ReservationId,
        state: ReservationState,
        at: DateTime<Utc>,
    ) -> Result<Finalized> {
        let mut entry = self
            .reservations
            .get_mut(reservation_id)
            .ok_or_else(|| StoreError::not_found("reservation", reservation_id))?;
        let transitioned = entry.finalize(state, at);
        Ok(Finalized {
            reservation: entry.clone(),
            transitioned,
        })
    }
}

impl Store for MemoryStore {
    // =========================================================================
    // Subscription Operations
    // =========================================================================

    fn put_subscription(&self, subscription: &Subscription) -> Result<()> {
        self.subscriptions
            .insert(subscription.user_id, subscription.clone());
        Ok(())
    }

    fn get_subscription(&self, user_id: &UserId) -> Result<Option<Subscription>> {
        Ok(self.subscriptions.get(user_id).map(|s| s.clone()))
    }

    // =========================================================================
    // Gateway Event Operations
    // =========================================================================

    fn has_gateway_event(&self, event_id: &str) -> Result<bool> {
        Ok(self.gateway_events.contains_key(event_id))
    }

    fn mark_gateway_event(&self, event_id: &str, applied_at: DateTime<Utc>) -> Result<bool> {
        match self.gateway_events.entry(event_id.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(applied_at);
                Ok(true)
            }
        }
    }

    // =========================================================================
    // Credit Account Operations
    // =========================================================================

    fn get_account(
        &self,
        user_id: &UserId,
        period_start: DateTime<Utc>,
    ) -> Result<Option<CreditAccount>> {
        Ok(self
            .accounts
            .get(user_id)
            .and_then(|periods| periods.get(&period_start).cloned()))
    }

    fn latest_account_before(
        &self,
        user_id: &UserId,
        before: DateTime<Utc>,
    ) -> Result<Option<CreditAccount>> {
        Ok(self.accounts.get(user_id).and_then(|periods| {
            periods
                .range(..before)
                .next_back()
                .map(|(_, account)| account.clone())
        }))
    }

    fn list_accounts(&self, user_id: &UserId) -> Result<Vec<CreditAccount>> {
        Ok(self
            .accounts
            .get(user_id)
            .map(|periods| periods.values().cloned().collect())
            .unwrap_or_default())
    }

    fn insert_account_if_absent(&self, account: &CreditAccount) -> Result<AccountInsert> {
        let mut periods = self.accounts.entry(account.user_id).or_default();
        if let Some(existing) = periods.get(&account.period.start) {
            return Ok(AccountInsert {
                account: existing.clone(),
                created: false,
            });
        }
        periods.insert(account.period.start, account.clone());
        Ok(AccountInsert {
            account: account.clone(),
            created: true,
        })
    }

    // =========================================================================
    // Reservation Operations
    // =========================================================================

    fn put_reservation(&self, reservation: &Reservation) -> Result<()> {
        self.reservations
            .insert(reservation.id, reservation.clone());
        Ok(())
    }

    fn get_reservation(&self, reservation_id: &ReservationId) -> Result<Option<Reservation>> {
        Ok(self.reservations.get(reservation_id).map(|r| r.clone()))
    }

    fn list_reservations_by_user(&self, user_id: &UserId) -> Result<Vec<Reservation>> {
        let mut found: Vec<Reservation> = self
            .reservations
            .iter()
            .filter(|r| r.user_id == *user_id)
            .map(|r| r.clone())
            .collect();
        found.sort_by_key(|r| r.id.to_bytes());
        Ok(found)
    }

    fn list_pending_reservations(&self, created_before: DateTime<Utc>) -> Result<Vec<Reservation>> {
        let mut found: Vec<Reservation> = self
            .reservations
            .iter()
            .filter(|r| r.state == ReservationState::Pending && r.created_at < created_before)
            .map(|r| r.clone())
            .collect();
        found.sort_by_key(|r| (r.created_at, r.id.to_bytes()));
        Ok(found)
    }

    // =========================================================================
    // Compound Operations
    // =========================================================================

    fn reserve_credits(&self, reservation: &Reservation) -> Result<CreditAccount> {
        let debited = {
            let mut periods = self
                .accounts
                .get_mut(&reservation.user_id)
                .ok_or_else(|| StoreError::not_found("credit account", reservation.user_id))?;
            let account = periods
                .get_mut(&reservation.period_start)
                .ok_or_else(|| StoreError::not_found("credit account", reservation.user_id))?;

            account
                .try_debit(reservation.amount, reservation.created_at)
                .map_err(|remaining| StoreError::InsufficientCredits {
                    remaining,
                    required: reservation.amount,
                })?;
            account.clone()
        };

        self.reservations
            .insert(reservation.id, reservation.clone());
        Ok(debited)
    }

    fn commit_reservation(
        &self,
        reservation_id: &ReservationId,
        at: DateTime<Utc>,
    ) -> Result<Finalized> {
        self.finalize(reservation_id, ReservationState::Committed, at)
    }

    fn release_reservation(
        &self,
        reservation_id: &ReservationId,
        at: DateTime<Utc>,
    ) -> Result<Finalized> {
        let finalized = self.finalize(reservation_id, ReservationState::Released, at)?;
        let reservation = &finalized.reservation;

        if finalized.transitioned && !reservation.unmetered {
            if let Some(mut periods) = self.accounts.get_mut(&reservation.user_id) {
                if let Some(account) = periods.get_mut(&reservation.period_start) {
                    account.credit_back(reservation.amount, at);
                }
            }
        }

        Ok(finalized)
    }

    // =========================================================================
    // Usage Record Operations
    // =========================================================================

    fn append_usage(&self, record: &UsageRecord) -> Result<()> {
        self.usage
            .entry(record.user_id)
            .or_default()
            .push(record.clone());
        Ok(())
    }

    fn list_usage_by_user(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<UsageRecord>> {
        let Some(records) = self.usage.get(user_id) else {
            return Ok(Vec::new());
        };

        let mut sorted: Vec<&UsageRecord> = records.iter().collect();
        sorted.sort_by_key(|r| std::cmp::Reverse(r.id.to_bytes()));

        Ok(sorted
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use z_metering_core::{Agent, BillingPeriod, UsageOutcome};

    fn period() -> BillingPeriod {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        BillingPeriod::new(start, start + Duration::days(31)).unwrap()
    }

    fn open_account(store: &MemoryStore, user_id: UserId, total: u64) -> CreditAccount {
        let p = period();
        let account = CreditAccount::open(user_id, p, total, 0, p.start);
        store.insert_account_if_absent(&account).unwrap().account
    }

    fn reservation(user_id: UserId, period_start: DateTime<Utc>, amount: u64) -> Reservation {
        Reservation {
            id: ReservationId::generate(),
            user_id,
            period_start,
            amount,
            unmetered: false,
            agent: Agent::Chat,
            action: "send_message".into(),
            metadata: serde_json::Value::Null,
            state: ReservationState::Pending,
            created_at: period_start + Duration::hours(1),
            finalized_at: None,
        }
    }

    #[test]
    fn concurrent_reserves_never_overspend() {
        let store = MemoryStore::new();
        let user_id = UserId::generate();
        let account = open_account(&store, user_id, 550);
        let successes = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..100 {
                s.spawn(|| {
                    let r = reservation(user_id, account.period.start, 10);
                    if store.reserve_credits(&r).is_ok() {
                        successes.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(successes.load(Ordering::SeqCst), 55);
        let after = store.get_account(&user_id, account.period.start).unwrap().unwrap();
        assert_eq!(after.consumed, 550);
        assert_eq!(store.list_reservations_by_user(&user_id).unwrap().len(), 55);
    }

    #[test]
    fn insufficient_credits_writes_nothing() {
        let store = MemoryStore::new();
        let user_id = UserId::generate();
        let account = open_account(&store, user_id, 5);

        let r = reservation(user_id, account.period.start, 100);
        let err = store.reserve_credits(&r).unwrap_err();
        assert!(matches!(
            err,
            StoreError::InsufficientCredits {
                remaining: 5,
                required: 100
            }
        ));
        assert!(store.get_reservation(&r.id).unwrap().is_none());
    }

    #[test]
    fn racing_inserts_converge_on_one_account() {
        let store = MemoryStore::new();
        let user_id = UserId::generate();
        let p = period();
        let created = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for i in 0..16u64 {
                let store = &store;
                let created = &created;
                s.spawn(move || {
                    let account = CreditAccount::open(user_id, p, 500 + i, 0, p.start);
                    let outcome = store.insert_account_if_absent(&account).unwrap();
                    if outcome.created {
                        created.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(store.list_accounts(&user_id).unwrap().len(), 1);
    }

    #[test]
    fn release_credits_back_once() {
        let store = MemoryStore::new();
        let user_id = UserId::generate();
        let account = open_account(&store, user_id, 100);
        let r = reservation(user_id, account.period.start, 40);
        store.reserve_credits(&r).unwrap();

        let first = store.release_reservation(&r.id, r.created_at).unwrap();
        let second = store.release_reservation(&r.id, r.created_at).unwrap();
        assert!(first.transitioned);
        assert!(!second.transitioned);

        let after = store.get_account(&user_id, account.period.start).unwrap().unwrap();
        assert_eq!(after.consumed, 0);
    }

    #[test]
    fn commit_after_release_is_noop() {
        let store = MemoryStore::new();
        let user_id = UserId::generate();
        let account = open_account(&store, user_id, 100);
        let r = reservation(user_id, account.period.start, 40);
        store.reserve_credits(&r).unwrap();

        store.release_reservation(&r.id, r.created_at).unwrap();
        let commit = store.commit_reservation(&r.id, r.created_at).unwrap();
        assert!(!commit.transitioned);
        assert_eq!(commit.reservation.state, ReservationState::Released);
    }

    #[test]
    fn latest_account_before_picks_previous_period() {
        let store = MemoryStore::new();
        let user_id = UserId::generate();
        let jan = period();
        let feb = BillingPeriod::new(jan.end, jan.end + Duration::days(28)).unwrap();

        store
            .insert_account_if_absent(&CreditAccount::open(user_id, jan, 100, 0, jan.start))
            .unwrap();
        store
            .insert_account_if_absent(&CreditAccount::open(user_id, feb, 200, 0, feb.start))
            .unwrap();

        let prior = store.latest_account_before(&user_id, feb.start).unwrap().unwrap();
        assert_eq!(prior.period, jan);
        assert!(store.latest_account_before(&user_id, jan.start).unwrap().is_none());
    }

    #[test]
    fn gateway_event_marked_once() {
        let store = MemoryStore::new();
        assert!(store.mark_gateway_event("evt_1", Utc::now()).unwrap());
        assert!(!store.mark_gateway_event("evt_1", Utc::now()).unwrap());
        assert!(store.has_gateway_event("evt_1").unwrap());
    }

    #[test]
    fn usage_listing_is_newest_first() {
        let store = MemoryStore::new();
        let user_id = UserId::generate();
        let account = open_account(&store, user_id, 100);

        let r1 = reservation(user_id, account.period.start, 1);
        store
            .append_usage(&UsageRecord::finalized(&r1, UsageOutcome::Committed, r1.created_at))
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let r2 = reservation(user_id, account.period.start, 2);
        store
            .append_usage(&UsageRecord::finalized(&r2, UsageOutcome::Released, r2.created_at))
            .unwrap();

        let all = store.list_usage_by_user(&user_id, 10, 0).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].amount, 2);

        let page2 = store.list_usage_by_user(&user_id, 1, 1).unwrap();
        assert_eq!(page2[0].amount, 1);
    }
}
