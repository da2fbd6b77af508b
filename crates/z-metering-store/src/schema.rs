//! Database schema definitions and column families.
//!
//! This module defines the column families used in `RocksDB` storage.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Subscriptions, keyed by `user_id`.
    pub const SUBSCRIPTIONS: &str = "subscriptions";

    /// Applied gateway event IDs, keyed by `event_id`. Value is the apply time.
    pub const GATEWAY_EVENTS: &str = "gateway_events";

    /// Credit accounts, keyed by `user_id || period_start`.
    pub const CREDIT_ACCOUNTS: &str = "credit_accounts";

    /// Reservations, keyed by `reservation_id` (ULID).
    pub const RESERVATIONS: &str = "reservations";

    /// Index: reservations by user, keyed by `user_id || reservation_id`.
    /// Value is empty (index only).
    pub const RESERVATIONS_BY_USER: &str = "reservations_by_user";

    /// Usage records, keyed by `record_id` (ULID).
    pub const USAGE_RECORDS: &str = "usage_records";

    /// Index: usage records by user, keyed by `user_id || record_id`.
    /// Value is empty (index only).
    pub const USAGE_BY_USER: &str = "usage_by_user";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::SUBSCRIPTIONS,
        cf::GATEWAY_EVENTS,
        cf::CREDIT_ACCOUNTS,
        cf::RESERVATIONS,
        cf::RESERVATIONS_BY_USER,
        cf::USAGE_RECORDS,
        cf::USAGE_BY_USER,
    ]
}
