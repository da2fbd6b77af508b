//! Observability forwarder.
//!
//! [`HttpSink`] mirrors usage records to an HTTP collector. The engine hands
//! records over on the request path, so publishing only enqueues onto a
//! bounded channel; a background task drains it and POSTs each entry with
//! retries. When the channel is full the record is dropped with a warning.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use z_metering_core::UsageRecord;
use z_metering_engine::UsageSink;

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of delivery attempts per record.
const FORWARD_MAX_RETRIES: u32 = 3;

/// Initial backoff duration for retries (doubles with each attempt).
const FORWARD_INITIAL_BACKOFF_MS: u64 = 100;

/// Maximum backoff duration for retries.
const FORWARD_MAX_BACKOFF_MS: u64 = 5000;

/// Default number of records buffered before new ones are dropped.
pub const DEFAULT_SINK_CAPACITY: usize = 1024;

/// Error delivering one entry to the collector.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Collector answered with a non-success status.
    #[error("collector returned {0}")]
    Status(StatusCode),
}

impl ForwardError {
    /// Whether another attempt may succeed.
    fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Status(status) => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
        }
    }
}

/// One entry on the wire.
#[derive(Debug, Clone, Serialize)]
struct Envelope {
    record: UsageRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    append_error: Option<String>,
}

/// Usage sink that forwards records to an HTTP collector.
#[derive(Debug, Clone)]
pub struct HttpSink {
    tx: mpsc::Sender<Envelope>,
}

impl HttpSink {
    /// Start the forwarding task and return the sink feeding it.
    ///
    /// Must be called from within a Tokio runtime. The task exits once every
    /// `HttpSink` clone has been dropped and the queue is drained.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn spawn(
        url: impl Into<String>,
        api_key: Option<String>,
        capacity: usize,
    ) -> Result<(Self, JoinHandle<()>), reqwest::Error> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let forwarder = Forwarder {
            client,
            url: url.into(),
            api_key,
        };

        let handle = tokio::spawn(forwarder.run(rx));
        Ok((Self { tx }, handle))
    }

    fn enqueue(&self, envelope: Envelope) {
        match self.tx.try_send(envelope) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                tracing::warn!(
                    record_id = %dropped.record.id,
                    user_id = %dropped.record.user_id,
                    "Observability queue full, dropping usage record"
                );
            }
            Err(mpsc::error::TrySendError::Closed(dropped)) => {
                tracing::warn!(
                    record_id = %dropped.record.id,
                    "Observability forwarder stopped, dropping usage record"
                );
            }
        }
    }
}

impl UsageSink for HttpSink {
    fn publish(&self, record: &UsageRecord) {
        self.enqueue(Envelope {
            record: record.clone(),
            append_error: None,
        });
    }

    fn report_failure(&self, record: &UsageRecord, error: &str) {
        tracing::error!(
            record_id = %record.id,
            user_id = %record.user_id,
            error = %error,
            "Usage record not persisted; forwarding for audit"
        );
        self.enqueue(Envelope {
            record: record.clone(),
            append_error: Some(error.to_string()),
        });
    }
}

struct Forwarder {
    client: Client,
    url: String,
    api_key: Option<String>,
}

impl Forwarder {
    async fn run(self, mut rx: mpsc::Receiver<Envelope>) {
        tracing::info!(url = %self.url, "Observability forwarder started");

        while let Some(envelope) = rx.recv().await {
            if let Err(e) = self.forward_with_retry(&envelope).await {
                tracing::error!(
                    record_id = %envelope.record.id,
                    error = %e,
                    "Failed to forward usage record after all retries"
                );
            }
        }

        tracing::info!("Observability forwarder stopped");
    }

    async fn forward_with_retry(&self, envelope: &Envelope) -> Result<(), ForwardError> {
        let mut attempt = 0;
        let mut backoff_ms = FORWARD_INITIAL_BACKOFF_MS;

        loop {
            match self.forward(envelope).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempt += 1;

                    if attempt >= FORWARD_MAX_RETRIES || !e.is_retryable() {
                        return Err(e);
                    }

                    tracing::debug!(
                        record_id = %envelope.record.id,
                        attempt = %attempt,
                        backoff_ms = %backoff_ms,
                        error = %e,
                        "Forwarding failed, retrying"
                    );

                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;

                    backoff_ms = (backoff_ms * 2).min(FORWARD_MAX_BACKOFF_MS);
                }
            }
        }
    }

    async fn forward(&self, envelope: &Envelope) -> Result<(), ForwardError> {
        let mut request = self.client.post(&self.url).json(envelope);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request.send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ForwardError::Status(response.status()))
        }
    }
}
