//! Subscription plan vocabulary
//!
//! Plan keys are the internal identifiers customers subscribe under. The
//! mapping from plan key to Stripe price id lives in configuration; this
//! module only knows the vocabulary and display names.

use serde::{Deserialize, Serialize};

/// Subscription plans offered by Shiftwise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanKey {
    /// Single location, up to 15 staff
    Starter,
    /// Multi-location teams
    Team,
    /// Unlimited locations, priority support
    Business,
}

impl PlanKey {
    /// Stable lowercase identifier used in metadata and idempotency keys
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanKey::Starter => "starter",
            PlanKey::Team => "team",
            PlanKey::Business => "business",
        }
    }

    /// Human-readable plan name shown in billing UIs and stored on records
    pub fn display_name(&self) -> &'static str {
        match self {
            PlanKey::Starter => "Starter",
            PlanKey::Team => "Team",
            PlanKey::Business => "Business",
        }
    }

    /// Parse a plan key from its lowercase identifier
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "starter" => Some(PlanKey::Starter),
            "team" => Some(PlanKey::Team),
            "business" => Some(PlanKey::Business),
            _ => None,
        }
    }
}

impl std::fmt::Display for PlanKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PlanKey {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PlanKey::parse(s).ok_or(())
    }
}
