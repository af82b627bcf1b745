//! Stripe client configuration

use stripe::Client;

use shiftwise_shared::PlanKey;

use crate::error::{BillingError, BillingResult};

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
    /// Price IDs for each subscription plan
    pub price_ids: PriceIds,
    /// Base URL for success/cancel redirects
    pub app_base_url: String,
}

/// Stripe price IDs for the subscription plans (monthly)
#[derive(Debug, Clone)]
pub struct PriceIds {
    pub starter: String,
    pub team: String,
    pub business: String,
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: std::env::var("STRIPE_SECRET_KEY")
                .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET")
                .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?,
            price_ids: PriceIds {
                starter: std::env::var("STRIPE_PRICE_STARTER")
                    .map_err(|_| BillingError::Config("STRIPE_PRICE_STARTER not set".to_string()))?,
                team: std::env::var("STRIPE_PRICE_TEAM")
                    .map_err(|_| BillingError::Config("STRIPE_PRICE_TEAM not set".to_string()))?,
                business: std::env::var("STRIPE_PRICE_BUSINESS")
                    .map_err(|_| BillingError::Config("STRIPE_PRICE_BUSINESS not set".to_string()))?,
            },
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
        })
    }

    /// Get the price ID for a plan
    pub fn price_id_for_plan(&self, plan: PlanKey) -> &str {
        match plan {
            PlanKey::Starter => &self.price_ids.starter,
            PlanKey::Team => &self.price_ids.team,
            PlanKey::Business => &self.price_ids.business,
        }
    }

    /// Get the plan for a price ID (reverse lookup)
    pub fn plan_for_price_id(&self, price_id: &str) -> Option<PlanKey> {
        if price_id == self.price_ids.starter {
            Some(PlanKey::Starter)
        } else if price_id == self.price_ids.team {
            Some(PlanKey::Team)
        } else if price_id == self.price_ids.business {
            Some(PlanKey::Business)
        } else {
            None
        }
    }
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self { client, config }
    }

    /// Create a new Stripe client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config))
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> StripeConfig {
        StripeConfig {
            secret_key: "sk_test_123".to_string(),
            webhook_secret: "whsec_test".to_string(),
            price_ids: PriceIds {
                starter: "price_starter_123".to_string(),
                team: "price_team_456".to_string(),
                business: "price_business_789".to_string(),
            },
            app_base_url: "http://localhost:3000".to_string(),
        }
    }

    #[test]
    fn test_price_lookup_round_trip() {
        let config = test_config();
        for plan in [PlanKey::Starter, PlanKey::Team, PlanKey::Business] {
            let price_id = config.price_id_for_plan(plan);
            assert_eq!(config.plan_for_price_id(price_id), Some(plan));
        }
    }

    #[test]
    fn test_unknown_price_id_has_no_plan() {
        let config = test_config();
        assert_eq!(config.plan_for_price_id("price_legacy_000"), None);
        assert_eq!(config.plan_for_price_id(""), None);
    }
}
