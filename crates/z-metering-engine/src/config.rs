//! Engine configuration.

use chrono::Duration;

/// Default age after which a pending reservation counts as stranded.
pub const DEFAULT_RESERVATION_GRACE_SECS: i64 = 15 * 60;

/// Tunables of the metering engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Pending reservations older than this are released by the sweep.
    pub reservation_grace: Duration,

    /// Whether `past_due` subscriptions may keep reserving credits while the
    /// gateway retries payment.
    pub allow_past_due: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reservation_grace: Duration::seconds(DEFAULT_RESERVATION_GRACE_SECS),
            allow_past_due: true,
        }
    }
}
