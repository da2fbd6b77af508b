//! Storage layer for z-metering.
//!
//! This crate provides persistent storage for subscriptions, credit accounts,
//! reservations, usage records and processed gateway events.
//!
//! # Backends
//!
//! - [`MemoryStore`]: sharded in-memory maps, the default and the test backend.
//! - `RocksStore` (feature `rocksdb-backend`): `RocksDB` with one column family
//!   per record kind and CBOR-encoded values.
//!
//! # Atomicity
//!
//! The check-and-debit of a credit account and the state transition of a
//! reservation are compound operations on the [`Store`] trait. Backends must
//! serialize them per account so that concurrent debits can never push
//! `consumed` past `total`.
//!
//! # Example
//!
//! ```
//! use z_metering_store::{MemoryStore, Store};
//! use z_metering_core::UserId;
//!
//! let store = MemoryStore::new();
//! assert!(store.get_subscription(&UserId::generate()).unwrap().is_none());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
#[cfg(feature = "rocksdb-backend")]
pub mod keys;
pub mod memory;
#[cfg(feature = "rocksdb-backend")]
pub mod rocks;
#[cfg(feature = "rocksdb-backend")]
pub mod schema;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
#[cfg(feature = "rocksdb-backend")]
pub use rocks::RocksStore;

use chrono::{DateTime, Utc};
use z_metering_core::{CreditAccount, Reservation, ReservationId, Subscription, UsageRecord, UserId};

/// Outcome of an insert-if-absent on a credit account.
#[derive(Debug, Clone)]
pub struct AccountInsert {
    /// The account now stored for the key.
    pub account: CreditAccount,
    /// Whether this call created it.
    pub created: bool,
}

/// Outcome of a commit or release.
#[derive(Debug, Clone)]
pub struct Finalized {
    /// The reservation after the call.
    pub reservation: Reservation,
    /// Whether this call moved it out of `pending`.
    pub transitioned: bool,
}

/// The storage trait defining all database operations.
///
/// This trait abstracts the storage layer, allowing for different implementations
/// (e.g., `RocksDB`, in-memory for testing).
pub trait Store: Send + Sync {
    // =========================================================================
    // Subscription Operations
    // =========================================================================

    /// Insert or replace the subscription of `subscription.user_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_subscription(&self, subscription: &Subscription) -> Result<()>;

    /// Get the subscription of a user.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_subscription(&self, user_id: &UserId) -> Result<Option<Subscription>>;

    // =========================================================================
    // Gateway Event Operations (for idempotency)
    // =========================================================================

    /// Check if a gateway event has already been applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn has_gateway_event(&self, event_id: &str) -> Result<bool>;

    /// Mark a gateway event as applied. Returns `false` if it already was.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn mark_gateway_event(&self, event_id: &str, applied_at: DateTime<Utc>) -> Result<bool>;

    // =========================================================================
    // Credit Account Operations
    // =========================================================================

    /// Get the account of a user for the period starting at `period_start`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_account(
        &self,
        user_id: &UserId,
        period_start: DateTime<Utc>,
    ) -> Result<Option<CreditAccount>>;

    /// Get the most recent account whose period starts before `before`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn latest_account_before(
        &self,
        user_id: &UserId,
        before: DateTime<Utc>,
    ) -> Result<Option<CreditAccount>>;

    /// List every account of a user, oldest period first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_accounts(&self, user_id: &UserId) -> Result<Vec<CreditAccount>>;

    /// Insert `account` unless one already exists for its `(user, period start)`.
    ///
    /// Concurrent callers racing on the same key all observe the single
    /// stored account; exactly one of them sees `created == true`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Conflict` if the race could not be resolved. The
    /// bundled backends serialize inserts per user and never do; backends
    /// shared between processes may, and callers retry once.
    fn insert_account_if_absent(&self, account: &CreditAccount) -> Result<AccountInsert>;

    // =========================================================================
    // Reservation Operations
    // =========================================================================

    /// Store a reservation without touching any account (unmetered plans).
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_reservation(&self, reservation: &Reservation) -> Result<()>;

    /// Get a reservation by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_reservation(&self, reservation_id: &ReservationId) -> Result<Option<Reservation>>;

    /// List a user's reservations, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_reservations_by_user(&self, user_id: &UserId) -> Result<Vec<Reservation>>;

    /// List pending reservations created before `created_before`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_pending_reservations(&self, created_before: DateTime<Utc>) -> Result<Vec<Reservation>>;

    // =========================================================================
    // Compound Operations
    // =========================================================================

    /// Debit the reservation's account and store the reservation atomically.
    ///
    /// Returns the account after the debit.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the account doesn't exist.
    /// - `StoreError::InsufficientCredits` if the remaining balance is too low;
    ///   nothing is written in that case.
    fn reserve_credits(&self, reservation: &Reservation) -> Result<CreditAccount>;

    /// Move a pending reservation to `committed`.
    ///
    /// A reservation that is already final is returned unchanged with
    /// `transitioned == false`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the reservation doesn't exist.
    fn commit_reservation(
        &self,
        reservation_id: &ReservationId,
        at: DateTime<Utc>,
    ) -> Result<Finalized>;

    /// Move a pending reservation to `released` and credit its amount back.
    ///
    /// A reservation that is already final is returned unchanged with
    /// `transitioned == false` and no credit is returned.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the reservation doesn't exist.
    fn release_reservation(
        &self,
        reservation_id: &ReservationId,
        at: DateTime<Utc>,
    ) -> Result<Finalized>;

    // =========================================================================
    // Usage Record Operations
    // =========================================================================

    /// Append a usage record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn append_usage(&self, record: &UsageRecord) -> Result<()>;

    /// List usage records for a user, ordered by time (newest first).
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_usage_by_user(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<UsageRecord>>;
}
