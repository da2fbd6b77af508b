//! Per-action credit costs.
//!
//! Feature call sites reserve by `(agent, action)`; the table turns that into
//! a fixed credit cost. Agents may carry a default cost for actions that are
//! not listed individually.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{MeteringError, Result};
use crate::Agent;

/// Costs for a single agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentCosts {
    /// Cost of actions without an explicit entry.
    #[serde(default)]
    pub default: Option<u64>,

    /// Explicit per-action costs.
    #[serde(default)]
    pub actions: HashMap<String, u64>,
}

/// Credit cost table keyed by agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionCosts {
    agents: HashMap<Agent, AgentCosts>,
}

impl ActionCosts {
    /// Build a table from per-agent entries.
    ///
    /// # Errors
    ///
    /// Returns `MeteringError::InvalidCost` if any configured cost is zero.
    pub fn new(agents: HashMap<Agent, AgentCosts>) -> Result<Self> {
        for (agent, costs) in &agents {
            let zero_action = costs.actions.iter().find(|(_, cost)| **cost == 0);
            if costs.default == Some(0) || zero_action.is_some() {
                return Err(MeteringError::InvalidCost(format!(
                    "zero cost configured for agent {agent}"
                )));
            }
        }
        Ok(Self { agents })
    }

    /// Parse a cost table from JSON of the form
    /// `{"chat": {"default": 1, "actions": {"send_message": 2}}}`.
    ///
    /// # Errors
    ///
    /// Returns `MeteringError::InvalidCost` if the JSON is malformed or a cost is zero.
    pub fn from_json(json: &str) -> Result<Self> {
        let agents: HashMap<Agent, AgentCosts> =
            serde_json::from_str(json).map_err(|e| MeteringError::InvalidCost(e.to_string()))?;
        Self::new(agents)
    }

    /// Look up the cost of `action` performed by `agent`.
    ///
    /// # Errors
    ///
    /// Returns `MeteringError::InvalidCost` if neither the action nor the
    /// agent default is configured.
    pub fn cost_of(&self, agent: &Agent, action: &str) -> Result<u64> {
        let costs = self
            .agents
            .get(agent)
            .ok_or_else(|| MeteringError::InvalidCost(format!("no costs for agent {agent}")))?;

        costs
            .actions
            .get(action)
            .copied()
            .or(costs.default)
            .ok_or_else(|| {
                MeteringError::InvalidCost(format!("no cost for {agent}/{action}"))
            })
    }
}

impl Default for ActionCosts {
    fn default() -> Self {
        let entry = |default: u64, actions: &[(&str, u64)]| AgentCosts {
            default: Some(default),
            actions: actions
                .iter()
                .map(|(name, cost)| ((*name).to_string(), *cost))
                .collect(),
        };

        let agents = HashMap::from([
            (Agent::Chat, entry(1, &[("send_message", 1), ("generate_image", 20)])),
            (
                Agent::CodeGeneration,
                entry(5, &[("generate", 10), ("refactor", 15)]),
            ),
            (Agent::Research, entry(25, &[("deep_research", 100)])),
            (Agent::Campaign, entry(10, &[("create_campaign", 50)])),
            (
                Agent::BrowserAutomation,
                entry(20, &[("session_minute", 5), ("screenshot", 2)]),
            ),
        ]);

        Self { agents }
    }
}
