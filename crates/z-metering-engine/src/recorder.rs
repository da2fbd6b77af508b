//! Usage recorder.
//!
//! Appends usage records to the store and mirrors them to an observability
//! sink. Recording never fails the caller: by the time a record is written the
//! debit it describes is already settled in the credit account.

use std::sync::Arc;

use z_metering_core::UsageRecord;
use z_metering_store::Store;

/// Best-effort receiver of usage records and recorder failures.
///
/// Implementations must not block; the engine calls them on the request path.
pub trait UsageSink: Send + Sync {
    /// A record was durably appended.
    fn publish(&self, record: &UsageRecord);

    /// A record could not be appended to the store.
    fn report_failure(&self, record: &UsageRecord, error: &str);
}

/// Sink that only emits `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl UsageSink for TracingSink {
    fn publish(&self, record: &UsageRecord) {
        tracing::debug!(
            record_id = %record.id,
            user_id = %record.user_id,
            agent = %record.agent,
            action = %record.action,
            amount = record.amount,
            outcome = record.outcome.as_str(),
            "Usage recorded"
        );
    }

    fn report_failure(&self, record: &UsageRecord, error: &str) {
        tracing::error!(
            record_id = %record.id,
            user_id = %record.user_id,
            outcome = record.outcome.as_str(),
            error = %error,
            "Failed to append usage record"
        );
    }
}

/// Append-only writer for the usage log.
#[derive(Clone)]
pub struct UsageRecorder {
    store: Arc<dyn Store>,
    sink: Arc<dyn UsageSink>,
}

impl UsageRecorder {
    /// Create a recorder writing to `store` and mirroring to `sink`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, sink: Arc<dyn UsageSink>) -> Self {
        Self { store, sink }
    }

    /// Append `record`. Store failures go to the sink and are swallowed.
    pub fn record(&self, record: &UsageRecord) {
        match self.store.append_usage(record) {
            Ok(()) => self.sink.publish(record),
            Err(e) => {
                tracing::warn!(
                    record_id = %record.id,
                    user_id = %record.user_id,
                    error = %e,
                    "Usage record write failed; debit unaffected"
                );
                self.sink.report_failure(record, &e.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Utc;
    use z_metering_core::{Agent, UserId};
    use z_metering_store::MemoryStore;

    use crate::testing::{CapturingSink, FaultyStore};

    fn sample_record() -> UsageRecord {
        UsageRecord::denied(
            UserId::generate(),
            Agent::Chat,
            "send_message".into(),
            1,
            "insufficient_credits".into(),
            serde_json::Value::Null,
            Utc::now(),
        )
    }

    #[test]
    fn successful_append_is_published() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(CapturingSink::default());
        let recorder = UsageRecorder::new(store.clone(), sink.clone());

        let record = sample_record();
        recorder.record(&record);

        assert_eq!(sink.published.lock().unwrap().len(), 1);
        assert_eq!(store.list_usage_by_user(&record.user_id, 10, 0).unwrap().len(), 1);
    }

    #[test]
    fn failed_append_is_reported_not_raised() {
        let sink = Arc::new(CapturingSink::default());
        let recorder = UsageRecorder::new(Arc::new(FaultyStore::usage_log_offline()), sink.clone());

        recorder.record(&sample_record());

        assert!(sink.published.lock().unwrap().is_empty());
        let failures = sink.failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("usage log offline"));
    }
}
