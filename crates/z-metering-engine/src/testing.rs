//! Shared test doubles.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use z_metering_core::{CreditAccount, Reservation, ReservationId, Subscription, UsageRecord, UserId};
use z_metering_store::{AccountInsert, Finalized, MemoryStore, Store, StoreError};

use crate::recorder::UsageSink;

#[derive(Default)]
pub struct CapturingSink {
    pub published: Mutex<Vec<UsageRecord>>,
    pub failures: Mutex<Vec<String>>,
}

impl UsageSink for CapturingSink {
    fn publish(&self, record: &UsageRecord) {
        self.published.lock().unwrap().push(record.clone());
    }

    fn report_failure(&self, _record: &UsageRecord, error: &str) {
        self.failures.lock().unwrap().push(error.to_string());
    }
}

/// In-memory store with injectable failures.
#[derive(Default)]
pub struct FaultyStore {
    inner: MemoryStore,
    usage_log_offline: bool,
    account_conflicts: AtomicUsize,
}

impl FaultyStore {
    /// Every `append_usage` fails.
    pub fn usage_log_offline() -> Self {
        Self {
            usage_log_offline: true,
            ..Self::default()
        }
    }

    /// The next `n` account inserts fail with `StoreError::Conflict`.
    pub fn account_conflicts(n: usize) -> Self {
        Self {
            account_conflicts: AtomicUsize::new(n),
            ..Self::default()
        }
    }

    /// Injected conflicts not yet returned.
    pub fn conflicts_left(&self) -> usize {
        self.account_conflicts.load(Ordering::SeqCst)
    }
}

impl Store for FaultyStore {
    fn put_subscription(&self, s: &Subscription) -> z_metering_store::Result<()> {
        self.inner.put_subscription(s)
    }
    fn get_subscription(&self, u: &UserId) -> z_metering_store::Result<Option<Subscription>> {
        self.inner.get_subscription(u)
    }
    fn has_gateway_event(&self, e: &str) -> z_metering_store::Result<bool> {
        self.inner.has_gateway_event(e)
    }
    fn mark_gateway_event(&self, e: &str, at: DateTime<Utc>) -> z_metering_store::Result<bool> {
        self.inner.mark_gateway_event(e, at)
    }
    fn get_account(
        &self,
        u: &UserId,
        start: DateTime<Utc>,
    ) -> z_metering_store::Result<Option<CreditAccount>> {
        self.inner.get_account(u, start)
    }
    fn latest_account_before(
        &self,
        u: &UserId,
        before: DateTime<Utc>,
    ) -> z_metering_store::Result<Option<CreditAccount>> {
        self.inner.latest_account_before(u, before)
    }
    fn list_accounts(&self, u: &UserId) -> z_metering_store::Result<Vec<CreditAccount>> {
        self.inner.list_accounts(u)
    }
    fn insert_account_if_absent(
        &self,
        a: &CreditAccount,
    ) -> z_metering_store::Result<AccountInsert> {
        let pending = self
            .account_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if pending.is_ok() {
            return Err(StoreError::Conflict("account insert contended".into()));
        }
        self.inner.insert_account_if_absent(a)
    }
    fn put_reservation(&self, r: &Reservation) -> z_metering_store::Result<()> {
        self.inner.put_reservation(r)
    }
    fn get_reservation(&self, id: &ReservationId) -> z_metering_store::Result<Option<Reservation>> {
        self.inner.get_reservation(id)
    }
    fn list_reservations_by_user(&self, u: &UserId) -> z_metering_store::Result<Vec<Reservation>> {
        self.inner.list_reservations_by_user(u)
    }
    fn list_pending_reservations(
        &self,
        before: DateTime<Utc>,
    ) -> z_metering_store::Result<Vec<Reservation>> {
        self.inner.list_pending_reservations(before)
    }
    fn reserve_credits(&self, r: &Reservation) -> z_metering_store::Result<CreditAccount> {
        self.inner.reserve_credits(r)
    }
    fn commit_reservation(
        &self,
        id: &ReservationId,
        at: DateTime<Utc>,
    ) -> z_metering_store::Result<Finalized> {
        self.inner.commit_reservation(id, at)
    }
    fn release_reservation(
        &self,
        id: &ReservationId,
        at: DateTime<Utc>,
    ) -> z_metering_store::Result<Finalized> {
        self.inner.release_reservation(id, at)
    }
    fn append_usage(&self, record: &UsageRecord) -> z_metering_store::Result<()> {
        if self.usage_log_offline {
            return Err(StoreError::Database("usage log offline".into()));
        }
        self.inner.append_usage(record)
    }
    fn list_usage_by_user(
        &self,
        u: &UserId,
        limit: usize,
        offset: usize,
    ) -> z_metering_store::Result<Vec<UsageRecord>> {
        self.inner.list_usage_by_user(u, limit, offset)
    }
}
