//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store` trait.
//!
//! `RocksDB` has no multi-key compare-and-swap, so read-modify-write cycles on
//! one user's records are serialized through a fixed set of striped locks.
//! Each cycle ends with a single `WriteBatch`.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};

use z_metering_core::{
    CreditAccount, Reservation, ReservationId, ReservationState, Subscription, UsageRecord,
    UsageRecordId, UserId,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::{AccountInsert, Finalized, Store};

const LOCK_STRIPES: usize = 64;

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    user_locks: Vec<Mutex<()>>,
    events_lock: Mutex<()>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path.as_ref(), cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        tracing::debug!(path = %path.as_ref().display(), "Opened RocksDB store");

        Ok(Self {
            db: Arc::new(db),
            user_locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            events_lock: Mutex::new(()),
        })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Lock the stripe owning `user_id`.
    fn lock_user(&self, user_id: &UserId) -> MutexGuard<'_, ()> {
        let stripe = user_id
            .as_bytes()
            .iter()
            .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(usize::from(*b)))
            % LOCK_STRIPES;
        self.user_locks[stripe]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn get_value<T: serde::de::DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        self.db
            .get_cf(&cf, key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn put_value<T: serde::Serialize>(&self, cf_name: &str, key: &[u8], value: &T) -> Result<()> {
        let cf = self.cf(cf_name)?;
        let value = Self::serialize(value)?;
        self.db
            .put_cf(&cf, key, value)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Collect the keys of a column family starting with `prefix`, in key order.
    fn prefix_keys(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        let cf = self.cf(cf_name)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));

        let mut found = Vec::new();
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            found.push(key.to_vec());
        }
        Ok(found)
    }

    fn finalize(
        &self,
        reservation_id: &ReservationId,
        state: ReservationState,
        at: DateTime<Utc>,
    ) -> Result<Finalized> {
        let key = keys::reservation_key(reservation_id);
        let user_id = self
            .get_value::<Reservation>(cf::RESERVATIONS, &key)?
            .ok_or_else(|| StoreError::not_found("reservation", reservation_id))?
            .user_id;

        let _guard = self.lock_user(&user_id);

        // Re-read under the lock; a concurrent finalize may have won.
        let mut reservation: Reservation = self
            .get_value(cf::RESERVATIONS, &key)?
            .ok_or_else(|| StoreError::not_found("reservation", reservation_id))?;
        if !reservation.finalize(state, at) {
            return Ok(Finalized {
                reservation,
                transitioned: false,
            });
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(&self.cf(cf::RESERVATIONS)?, &key, Self::serialize(&reservation)?);

        if state == ReservationState::Released && !reservation.unmetered {
            let account_key = keys::account_key(&reservation.user_id, reservation.period_start);
            if let Some(mut account) =
                self.get_value::<CreditAccount>(cf::CREDIT_ACCOUNTS, &account_key)?
            {
                account.credit_back(reservation.amount, at);
                batch.put_cf(
                    &self.cf(cf::CREDIT_ACCOUNTS)?,
                    &account_key,
                    Self::serialize(&account)?,
                );
            }
        }

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Finalized {
            reservation,
            transitioned: true,
        })
    }
}

impl Store for RocksStore {
    // =========================================================================
    // Subscription Operations
    // =========================================================================

    fn put_subscription(&self, subscription: &Subscription) -> Result<()> {
        self.put_value(
            cf::SUBSCRIPTIONS,
            &keys::subscription_key(&subscription.user_id),
            subscription,
        )
    }

    fn get_subscription(&self, user_id: &UserId) -> Result<Option<Subscription>> {
        self.get_value(cf::SUBSCRIPTIONS, &keys::subscription_key(user_id))
    }

    // =========================================================================
    // Gateway Event Operations
    // =========================================================================

    fn has_gateway_event(&self, event_id: &str) -> Result<bool> {
        let cf = self.cf(cf::GATEWAY_EVENTS)?;
        let exists = self
            .db
            .get_cf(&cf, keys::gateway_event_key(event_id))
            .map_err(|e| StoreError::Database(e.to_string()))?
            .is_some();
        Ok(exists)
    }

    fn mark_gateway_event(&self, event_id: &str, applied_at: DateTime<Utc>) -> Result<bool> {
        let _guard = self.events_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.has_gateway_event(event_id)? {
            return Ok(false);
        }
        self.put_value(
            cf::GATEWAY_EVENTS,
            &keys::gateway_event_key(event_id),
            &applied_at,
        )?;
        Ok(true)
    }

    // =========================================================================
    // Credit Account Operations
    // =========================================================================

    fn get_account(
        &self,
        user_id: &UserId,
        period_start: DateTime<Utc>,
    ) -> Result<Option<CreditAccount>> {
        self.get_value(cf::CREDIT_ACCOUNTS, &keys::account_key(user_id, period_start))
    }

    fn latest_account_before(
        &self,
        user_id: &UserId,
        before: DateTime<Utc>,
    ) -> Result<Option<CreditAccount>> {
        let cf = self.cf(cf::CREDIT_ACCOUNTS)?;
        let prefix = keys::user_prefix(user_id);
        let upper = keys::account_key(user_id, before);

        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&upper, Direction::Reverse));
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            if *key == *upper {
                continue;
            }
            return Self::deserialize(&value).map(Some);
        }
        Ok(None)
    }

    fn list_accounts(&self, user_id: &UserId) -> Result<Vec<CreditAccount>> {
        let cf = self.cf(cf::CREDIT_ACCOUNTS)?;
        let prefix = keys::user_prefix(user_id);
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));

        let mut accounts = Vec::new();
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            accounts.push(Self::deserialize(&value)?);
        }
        Ok(accounts)
    }

    fn insert_account_if_absent(&self, account: &CreditAccount) -> Result<AccountInsert> {
        let _guard = self.lock_user(&account.user_id);

        if let Some(existing) = self.get_account(&account.user_id, account.period.start)? {
            return Ok(AccountInsert {
                account: existing,
                created: false,
            });
        }

        self.put_value(
            cf::CREDIT_ACCOUNTS,
            &keys::account_key(&account.user_id, account.period.start),
            account,
        )?;
        Ok(AccountInsert {
            account: account.clone(),
            created: true,
        })
    }

    // =========================================================================
    // Reservation Operations
    // =========================================================================

    fn put_reservation(&self, reservation: &Reservation) -> Result<()> {
        let cf_res = self.cf(cf::RESERVATIONS)?;
        let cf_by_user = self.cf(cf::RESERVATIONS_BY_USER)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(
            &cf_res,
            keys::reservation_key(&reservation.id),
            Self::serialize(reservation)?,
        );
        batch.put_cf(
            &cf_by_user,
            keys::user_reservation_key(&reservation.user_id, &reservation.id),
            [],
        );

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn get_reservation(&self, reservation_id: &ReservationId) -> Result<Option<Reservation>> {
        self.get_value(cf::RESERVATIONS, &keys::reservation_key(reservation_id))
    }

    fn list_reservations_by_user(&self, user_id: &UserId) -> Result<Vec<Reservation>> {
        let mut reservations = Vec::new();
        for key in self.prefix_keys(cf::RESERVATIONS_BY_USER, &keys::user_prefix(user_id))? {
            let Some(bytes) = keys::trailing_ulid_bytes(&key) else {
                continue;
            };
            if let Some(r) = self.get_reservation(&ReservationId::from_bytes(bytes))? {
                reservations.push(r);
            }
        }
        Ok(reservations)
    }

    fn list_pending_reservations(&self, created_before: DateTime<Utc>) -> Result<Vec<Reservation>> {
        let cf = self.cf(cf::RESERVATIONS)?;
        let mut pending = Vec::new();

        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            let reservation: Reservation = Self::deserialize(&value)?;
            if reservation.state == ReservationState::Pending
                && reservation.created_at < created_before
            {
                pending.push(reservation);
            }
        }

        pending.sort_by_key(|r| (r.created_at, r.id.to_bytes()));
        Ok(pending)
    }

    // =========================================================================
    // Compound Operations
    // =========================================================================

    fn reserve_credits(&self, reservation: &Reservation) -> Result<CreditAccount> {
        let _guard = self.lock_user(&reservation.user_id);

        let account_key = keys::account_key(&reservation.user_id, reservation.period_start);
        let mut account: CreditAccount = self
            .get_value(cf::CREDIT_ACCOUNTS, &account_key)?
            .ok_or_else(|| StoreError::not_found("credit account", reservation.user_id))?;

        account
            .try_debit(reservation.amount, reservation.created_at)
            .map_err(|remaining| StoreError::InsufficientCredits {
                remaining,
                required: reservation.amount,
            })?;

        let mut batch = WriteBatch::default();
        batch.put_cf(
            &self.cf(cf::CREDIT_ACCOUNTS)?,
            &account_key,
            Self::serialize(&account)?,
        );
        batch.put_cf(
            &self.cf(cf::RESERVATIONS)?,
            keys::reservation_key(&reservation.id),
            Self::serialize(reservation)?,
        );
        batch.put_cf(
            &self.cf(cf::RESERVATIONS_BY_USER)?,
            keys::user_reservation_key(&reservation.user_id, &reservation.id),
            [],
        );

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(account)
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
        self.finalize(reservation_id, ReservationState::Released, at)
    }

    // =========================================================================
    // Usage Record Operations
    // =========================================================================

    fn append_usage(&self, record: &UsageRecord) -> Result<()> {
        let cf_usage = self.cf(cf::USAGE_RECORDS)?;
        let cf_by_user = self.cf(cf::USAGE_BY_USER)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(
            &cf_usage,
            keys::usage_record_key(&record.id),
            Self::serialize(record)?,
        );
        batch.put_cf(&cf_by_user, keys::user_usage_key(&record.user_id, &record.id), []);

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn list_usage_by_user(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<UsageRecord>> {
        let mut index = self.prefix_keys(cf::USAGE_BY_USER, &keys::user_prefix(user_id))?;

        // ULIDs are time-ordered; newest last in key order.
        index.reverse();

        let mut records = Vec::new();
        for key in index.into_iter().skip(offset).take(limit) {
            let Some(bytes) = keys::trailing_ulid_bytes(&key) else {
                continue;
            };
            let record_key = keys::usage_record_key(&UsageRecordId::from_bytes(bytes));
            if let Some(record) = self.get_value(cf::USAGE_RECORDS, &record_key)? {
                records.push(record);
            }
        }
        Ok(records)
    }
}
