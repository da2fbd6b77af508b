//! Subscription plans and the plan catalog.
//!
//! Plans are read-mostly: the catalog is loaded at startup and resolved by
//! identifier on every period roll and every `get_active_plan` call.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{MeteringError, Result};

/// Wire sentinel for an unlimited allotment.
pub const UNLIMITED_SENTINEL: i64 = -1;

/// Monthly credit allotment of the `plus` plan.
pub const PLUS_PLAN_CREDITS: u64 = 8000;

/// Monthly credit allotment of the `pro` plan.
pub const PRO_PLAN_CREDITS: u64 = 20_000;

/// A plan identifier such as `"plus"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(String);

impl PlanId {
    /// Create a plan identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlanId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Credits granted per billing period.
///
/// Serialized as a plain integer where `-1` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum CreditAllotment {
    /// A fixed number of credits per period.
    Limited(u64),
    /// Metering is bypassed entirely.
    Unlimited,
}

impl CreditAllotment {
    /// Whether this allotment bypasses metering.
    #[must_use]
    pub const fn is_unlimited(&self) -> bool {
        matches!(self, Self::Unlimited)
    }

    /// The credit count, or `None` for unlimited.
    #[must_use]
    pub const fn credits(&self) -> Option<u64> {
        match self {
            Self::Limited(credits) => Some(*credits),
            Self::Unlimited => None,
        }
    }
}

impl TryFrom<i64> for CreditAllotment {
    type Error = MeteringError;

    fn try_from(value: i64) -> Result<Self> {
        match value {
            UNLIMITED_SENTINEL => Ok(Self::Unlimited),
            v => u64::try_from(v).map(Self::Limited).map_err(|_| {
                MeteringError::InvalidPlan(format!("monthly credits must be >= -1, got {v}"))
            }),
        }
    }
}

impl From<CreditAllotment> for i64 {
    fn from(value: CreditAllotment) -> Self {
        match value {
            CreditAllotment::Limited(credits) => i64::try_from(credits).unwrap_or(i64::MAX),
            CreditAllotment::Unlimited => UNLIMITED_SENTINEL,
        }
    }
}

/// A subscription plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Plan identifier.
    pub id: PlanId,

    /// Display name.
    pub name: String,

    /// Monthly price in cents.
    pub price_cents: i64,

    /// Credits granted each billing period.
    pub monthly_credits: CreditAllotment,

    /// Fraction of the prior period's total that may roll over, in `0.0..=1.0`.
    #[serde(default)]
    pub rollover_fraction: Option<f64>,

    /// Enabled feature flags, kept sorted.
    #[serde(default)]
    pub features: BTreeSet<String>,

    /// Whether new subscriptions may reference this plan.
    #[serde(default = "default_active")]
    pub active: bool,
}

const fn default_active() -> bool {
    true
}

impl Plan {
    /// Check whether a feature flag is enabled on this plan.
    #[must_use]
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }

    /// Upper bound on rollover carried out of an account with `prior_total` credits.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn rollover_cap(&self, prior_total: u64) -> u64 {
        match self.rollover_fraction {
            Some(fraction) if fraction > 0.0 => (prior_total as f64 * fraction).floor() as u64,
            _ => 0,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.id.as_str().is_empty() {
            return Err(MeteringError::InvalidPlan("plan id must not be empty".into()));
        }
        if let Some(fraction) = self.rollover_fraction {
            if !(0.0..=1.0).contains(&fraction) {
                return Err(MeteringError::InvalidPlan(format!(
                    "rollover fraction for {} must be within 0..=1, got {fraction}",
                    self.id
                )));
            }
        }
        Ok(())
    }
}

/// Registry of plans keyed by identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "Vec<Plan>", into = "Vec<Plan>")]
pub struct PlanCatalog {
    plans: BTreeMap<PlanId, Plan>,
}

impl PlanCatalog {
    /// Build a catalog, validating every plan.
    ///
    /// # Errors
    ///
    /// Returns `MeteringError::InvalidPlan` if a plan is malformed or an
    /// identifier appears twice.
    pub fn new(plans: impl IntoIterator<Item = Plan>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for plan in plans {
            plan.validate()?;
            let id = plan.id.clone();
            if map.insert(id.clone(), plan).is_some() {
                return Err(MeteringError::InvalidPlan(format!("duplicate plan id {id}")));
            }
        }
        Ok(Self { plans: map })
    }

    /// Parse a catalog from a JSON array of plans.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or a plan fails validation.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| MeteringError::InvalidPlan(e.to_string()))
    }

    /// Resolve a plan by identifier.
    ///
    /// # Errors
    ///
    /// Returns `MeteringError::PlanNotFound` if no plan has this identifier.
    pub fn get(&self, id: &PlanId) -> Result<&Plan> {
        self.plans
            .get(id)
            .ok_or_else(|| MeteringError::PlanNotFound(id.to_string()))
    }

    /// Resolve a plan that new subscriptions may reference.
    ///
    /// # Errors
    ///
    /// Returns `MeteringError::PlanNotFound` for unknown or retired plans.
    pub fn get_active(&self, id: &PlanId) -> Result<&Plan> {
        self.get(id)
            .and_then(|plan| {
                if plan.active {
                    Ok(plan)
                } else {
                    Err(MeteringError::PlanNotFound(id.to_string()))
                }
            })
    }

    /// Iterate plans in identifier order.
    pub fn iter(&self) -> impl Iterator<Item = &Plan> {
        self.plans.values()
    }

    /// Number of plans in the catalog.
    #[must_use]
    pub fn len(&self) -> usize {
        self.plans.len()
    }

    /// Whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}

impl TryFrom<Vec<Plan>> for PlanCatalog {
    type Error = MeteringError;

    fn try_from(plans: Vec<Plan>) -> Result<Self> {
        Self::new(plans)
    }
}

impl From<PlanCatalog> for Vec<Plan> {
    fn from(catalog: PlanCatalog) -> Self {
        catalog.plans.into_values().collect()
    }
}

fn features(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|s| (*s).to_string()).collect()
}

impl Default for PlanCatalog {
    fn default() -> Self {
        let plans = vec![
            Plan {
                id: "free".into(),
                name: "Free".into(),
                price_cents: 0,
                monthly_credits: CreditAllotment::Limited(500),
                rollover_fraction: None,
                features: features(&["chat"]),
                active: true,
            },
            Plan {
                id: "plus".into(),
                name: "Plus".into(),
                price_cents: 2000,
                monthly_credits: CreditAllotment::Limited(PLUS_PLAN_CREDITS),
                rollover_fraction: Some(0.5),
                features: features(&["chat", "code_generation", "research"]),
                active: true,
            },
            Plan {
                id: "pro".into(),
                name: "Pro".into(),
                price_cents: 5000,
                monthly_credits: CreditAllotment::Limited(PRO_PLAN_CREDITS),
                rollover_fraction: Some(0.25),
                features: features(&[
                    "browser_automation",
                    "campaigns",
                    "chat",
                    "code_generation",
                    "research",
                ]),
                active: true,
            },
            Plan {
                id: "unlimited".into(),
                name: "Unlimited".into(),
                price_cents: 20_000,
                monthly_credits: CreditAllotment::Unlimited,
                rollover_fraction: None,
                features: features(&[
                    "browser_automation",
                    "campaigns",
                    "chat",
                    "code_generation",
                    "research",
                ]),
                active: true,
            },
        ];
        Self {
            plans: plans.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allotment_sentinel_roundtrip() {
        let unlimited: CreditAllotment = serde_json::from_str("-1").unwrap();
        assert!(unlimited.is_unlimited());
        assert_eq!(serde_json::to_string(&unlimited).unwrap(), "-1");

        let limited: CreditAllotment = serde_json::from_str("8000").unwrap();
        assert_eq!(limited.credits(), Some(8000));

        assert!(serde_json::from_str::<CreditAllotment>("-2").is_err());
    }

    #[test]
    fn rollover_cap_uses_fraction() {
        let catalog = PlanCatalog::default();
        let plus = catalog.get(&"plus".into()).unwrap();
        assert_eq!(plus.rollover_cap(8000), 4000);

        let free = catalog.get(&"free".into()).unwrap();
        assert_eq!(free.rollover_cap(500), 0);
    }

    #[test]
    fn catalog_rejects_duplicates_and_bad_fractions() {
        let plan = PlanCatalog::default().get(&"plus".into()).unwrap().clone();
        assert!(PlanCatalog::new(vec![plan.clone(), plan.clone()]).is_err());

        let mut bad = plan;
        bad.rollover_fraction = Some(1.5);
        assert!(matches!(
            PlanCatalog::new(vec![bad]),
            Err(MeteringError::InvalidPlan(_))
        ));
    }

    #[test]
    fn catalog_from_json() {
        let json = r#"[
            {"id": "team", "name": "Team", "price_cents": 9900, "monthly_credits": 50000,
             "rollover_fraction": 0.1, "features": ["research", "chat"]},
            {"id": "legacy", "name": "Legacy", "price_cents": 0, "monthly_credits": -1, "active": false}
        ]"#;
        let catalog = PlanCatalog::from_json(json).unwrap();
        assert_eq!(catalog.len(), 2);

        let team = catalog.get(&"team".into()).unwrap();
        assert!(team.has_feature("research"));
        assert_eq!(
            team.features.iter().collect::<Vec<_>>(),
            vec!["chat", "research"]
        );

        assert!(catalog.get(&"legacy".into()).is_ok());
        assert!(matches!(
            catalog.get_active(&"legacy".into()),
            Err(MeteringError::PlanNotFound(_))
        ));
    }
}
