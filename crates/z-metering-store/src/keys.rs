//! Key encoding utilities for `RocksDB`.
//!
//! This module provides functions for encoding and decoding keys used in column families.

use chrono::{DateTime, Utc};
use z_metering_core::{ReservationId, UsageRecordId, UserId};

/// Flip the sign bit so that signed millisecond timestamps sort bytewise.
const SIGN_FLIP: u64 = 1 << 63;

/// Create a subscription key from a user ID.
#[must_use]
pub fn subscription_key(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// Create a gateway event key from an event ID.
#[must_use]
pub fn gateway_event_key(event_id: &str) -> Vec<u8> {
    event_id.as_bytes().to_vec()
}

/// Create a credit account key.
///
/// Format: `user_id (16 bytes) || period_start millis (8 bytes, big-endian, sign-flipped)`
///
/// Accounts of one user therefore sort by period start.
#[must_use]
#[allow(clippy::cast_sign_loss)]
pub fn account_key(user_id: &UserId, period_start: DateTime<Utc>) -> Vec<u8> {
    let millis = (period_start.timestamp_millis() as u64) ^ SIGN_FLIP;
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(user_id.as_bytes());
    key.extend_from_slice(&millis.to_be_bytes());
    key
}

/// Create a prefix for iterating all entries of a user in a per-user column family.
#[must_use]
pub fn user_prefix(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// Create a reservation key from a reservation ID.
#[must_use]
pub fn reservation_key(reservation_id: &ReservationId) -> Vec<u8> {
    reservation_id.to_bytes().to_vec()
}

/// Create a user-reservation index key.
///
/// Format: `user_id (16 bytes) || reservation_id (16 bytes)`
#[must_use]
pub fn user_reservation_key(user_id: &UserId, reservation_id: &ReservationId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(user_id.as_bytes());
    key.extend_from_slice(&reservation_id.to_bytes());
    key
}

/// Create a usage record key from a record ID.
#[must_use]
pub fn usage_record_key(record_id: &UsageRecordId) -> Vec<u8> {
    record_id.to_bytes().to_vec()
}

/// Create a user-usage index key.
///
/// Format: `user_id (16 bytes) || record_id (16 bytes)`
///
/// Since ULIDs are time-ordered, records for a user will be sorted by time.
#[must_use]
pub fn user_usage_key(user_id: &UserId, record_id: &UsageRecordId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(user_id.as_bytes());
    key.extend_from_slice(&record_id.to_bytes());
    key
}

/// Extract the trailing 16-byte ULID from a `user_id || ulid` index key.
///
/// Returns `None` if the key is shorter than 32 bytes.
#[must_use]
pub fn trailing_ulid_bytes(key: &[u8]) -> Option<[u8; 16]> {
    key.get(16..32)?.try_into().ok()
}
