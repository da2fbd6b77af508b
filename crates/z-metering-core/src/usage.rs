//! Usage record types for z-metering.
//!
//! Usage records are the append-only audit trail of every reservation
//! attempt's outcome. They are never mutated after being written.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Reservation, ReservationId, UsageRecordId, UserId};

/// A client agent that consumes credits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Agent {
    /// Conversational assistant.
    Chat,

    /// Code generation.
    CodeGeneration,

    /// Deep research.
    Research,

    /// Campaign tools.
    Campaign,

    /// Browser automation.
    BrowserAutomation,

    /// Any other agent.
    Custom(String),
}

impl Agent {
    /// Get the agent name as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Chat => "chat",
            Self::CodeGeneration => "code_generation",
            Self::Research => "research",
            Self::Campaign => "campaign",
            Self::BrowserAutomation => "browser_automation",
            Self::Custom(name) => name,
        }
    }
}

impl From<String> for Agent {
    fn from(value: String) -> Self {
        match value.as_str() {
            "chat" => Self::Chat,
            "code_generation" => Self::CodeGeneration,
            "research" => Self::Research,
            "campaign" => Self::Campaign,
            "browser_automation" => Self::BrowserAutomation,
            _ => Self::Custom(value),
        }
    }
}

impl From<&str> for Agent {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<Agent> for String {
    fn from(agent: Agent) -> Self {
        agent.as_str().to_string()
    }
}

impl std::fmt::Display for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageOutcome {
    /// The gated action completed and the debit stands.
    Committed,
    /// The debit was reversed.
    Released,
    /// The reservation was refused.
    Denied,
}

impl UsageOutcome {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Committed => "committed",
            Self::Released => "released",
            Self::Denied => "denied",
        }
    }
}

/// One entry of the usage log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Record ID (ULID, time-ordered).
    pub id: UsageRecordId,

    /// The user whose credits were involved.
    pub user_id: UserId,

    /// Agent that made the request.
    pub agent: Agent,

    /// Action within the agent.
    pub action: String,

    /// Credits involved. Zero only for unmetered reservations.
    pub amount: u64,

    /// What happened.
    pub outcome: UsageOutcome,

    /// Reservation this record terminates, if one was issued.
    pub reservation_id: Option<ReservationId>,

    /// Start of the debited account's period; `None` when nothing was debited.
    pub period_start: Option<DateTime<Utc>>,

    /// Why the attempt was denied, when it was.
    pub denial_reason: Option<String>,

    /// Free-form context (`session_id`, `request_id`, ...).
    pub metadata: serde_json::Value,

    /// When the outcome was recorded.
    pub timestamp: DateTime<Utc>,
}

impl UsageRecord {
    /// Terminal record for a reservation that was committed or released.
    #[must_use]
    pub fn finalized(reservation: &Reservation, outcome: UsageOutcome, now: DateTime<Utc>) -> Self {
        Self {
            id: UsageRecordId::generate(),
            user_id: reservation.user_id,
            agent: reservation.agent.clone(),
            action: reservation.action.clone(),
            amount: reservation.amount,
            outcome,
            reservation_id: Some(reservation.id),
            period_start: (!reservation.unmetered).then_some(reservation.period_start),
            denial_reason: None,
            metadata: reservation.metadata.clone(),
            timestamp: now,
        }
    }

    /// Record for a refused reservation attempt.
    #[must_use]
    pub fn denied(
        user_id: UserId,
        agent: Agent,
        action: String,
        amount: u64,
        reason: String,
        metadata: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: UsageRecordId::generate(),
            user_id,
            agent,
            action,
            amount,
            outcome: UsageOutcome::Denied,
            reservation_id: None,
            period_start: None,
            denial_reason: Some(reason),
            metadata,
            timestamp: now,
        }
    }

    /// Add a key to the metadata object, converting `null` metadata to an object.
    #[must_use]
    pub fn with_metadata_entry(mut self, key: &str, value: serde_json::Value) -> Self {
        if !self.metadata.is_object() {
            self.metadata = serde_json::Value::Object(serde_json::Map::new());
        }
        if let Some(map) = self.metadata.as_object_mut() {
            map.insert(key.to_string(), value);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_wire_names() {
        assert_eq!(Agent::CodeGeneration.as_str(), "code_generation");
        assert_eq!(Agent::from("browser_automation"), Agent::BrowserAutomation);
        assert_eq!(
            Agent::from("slides"),
            Agent::Custom("slides".to_string())
        );

        let json = serde_json::to_string(&Agent::Research).unwrap();
        assert_eq!(json, "\"research\"");
        let parsed: Agent = serde_json::from_str("\"campaign\"").unwrap();
        assert_eq!(parsed, Agent::Campaign);
    }

    #[test]
    fn denied_record_carries_reason() {
        let record = UsageRecord::denied(
            UserId::generate(),
            Agent::Chat,
            "send_message".into(),
            10,
            "insufficient credits".into(),
            serde_json::Value::Null,
            Utc::now(),
        );
        assert_eq!(record.outcome, UsageOutcome::Denied);
        assert!(record.reservation_id.is_none());
        assert_eq!(record.denial_reason.as_deref(), Some("insufficient credits"));
    }

    #[test]
    fn metadata_entry_upgrades_null() {
        let record = UsageRecord::denied(
            UserId::generate(),
            Agent::Chat,
            "send_message".into(),
            1,
            "no subscription".into(),
            serde_json::Value::Null,
            Utc::now(),
        )
        .with_metadata_entry("reason", serde_json::json!("stale_sweep"));
        assert_eq!(record.metadata["reason"], "stale_sweep");
    }
}
