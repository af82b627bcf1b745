//! Reconciliation engine
//!
//! Single write path from a subscription snapshot to the entitlement store.
//! Checkout completion, lifecycle webhooks, and manual session verification
//! all converge here, so racing deliveries differ only in who writes last.

use serde::Serialize;
use stripe::Expandable;
use uuid::Uuid;

use crate::checkout::CheckoutService;
use crate::client::{StripeClient, StripeConfig};
use crate::customer::account_id_from_metadata;
use crate::error::{BillingError, BillingResult};
use crate::snapshot::SubscriptionSnapshot;
use crate::store::{EntitlementRecord, EntitlementStore, EntitlementUpsert};

/// Shown when a subscription's price id is not in our plan table.
/// Unrecognized plans sync normally; they just display as unknown.
const UNKNOWN_PLAN_NAME: &str = "Unknown Plan";

/// Resolve the display name for a price id via the config's reverse lookup
pub(crate) fn plan_name_for_price(config: &StripeConfig, price_id: Option<&str>) -> String {
    price_id
        .and_then(|id| config.plan_for_price_id(id))
        .map(|plan| plan.display_name().to_string())
        .unwrap_or_else(|| UNKNOWN_PLAN_NAME.to_string())
}

/// What the manual verification path saw in the checkout session
#[derive(Debug, Clone, Serialize)]
pub struct SessionVerification {
    pub mode: String,
    pub payment_status: String,
    pub subscription_id: Option<String>,
    pub customer_id: Option<String>,
    pub email: Option<String>,
    /// Account resolved from customer metadata or the client reference id
    pub account_id: Option<Uuid>,
    /// True when the session was paid and its subscription was synced
    pub reconciled: bool,
}

/// Reconciliation engine
#[derive(Clone)]
pub struct ReconciliationEngine {
    stripe: StripeClient,
    store: EntitlementStore,
    checkout: CheckoutService,
}

impl ReconciliationEngine {
    pub fn new(stripe: StripeClient, store: EntitlementStore) -> Self {
        let checkout = CheckoutService::new(stripe.clone());
        Self {
            stripe,
            store,
            checkout,
        }
    }

    pub fn store(&self) -> &EntitlementStore {
        &self.store
    }

    /// Sync one subscription snapshot into the entitlement store.
    ///
    /// Everything is re-derived from the snapshot; caller-supplied status or
    /// plan is never trusted. Plan resolution cannot fail: a price id outside
    /// the plan table stores verbatim with the unknown-plan display name.
    pub async fn reconcile(
        &self,
        account_id: Uuid,
        snapshot: &SubscriptionSnapshot,
    ) -> BillingResult<EntitlementRecord> {
        let plan_name = plan_name_for_price(self.stripe.config(), snapshot.price_id.as_deref());

        let upsert = EntitlementUpsert {
            account_id,
            stripe_customer_id: snapshot.customer_id.clone(),
            stripe_subscription_id: snapshot.subscription_id.clone(),
            status: snapshot.status,
            plan_id: snapshot.price_id.clone(),
            plan_name,
            current_period_start: snapshot.current_period_start,
            current_period_end: snapshot.current_period_end,
            trial_start: snapshot.trial_start,
            trial_end: snapshot.trial_end,
            cancel_at_period_end: snapshot.cancel_at_period_end,
        };

        self.store.upsert(&upsert).await
    }

    /// Manual session verification: the client-triggered counterpart of the
    /// completed-session webhook, safe to race with it.
    ///
    /// Syncs only when the session is paid and both subscription and customer
    /// are present; otherwise reports what it saw without writing.
    pub async fn verify_session(&self, session_id: &str) -> BillingResult<SessionVerification> {
        let session = self.checkout.get_session(session_id).await?;

        let payment_status = format!("{:?}", session.payment_status).to_lowercase();
        let mode = format!("{:?}", session.mode).to_lowercase();

        let subscription = match session.subscription.as_ref() {
            Some(Expandable::Object(sub)) => Some(sub.as_ref()),
            _ => None,
        };
        let customer = match session.customer.as_ref() {
            Some(Expandable::Object(cus)) => Some(cus.as_ref()),
            _ => None,
        };

        let mut verification = SessionVerification {
            mode,
            payment_status,
            subscription_id: subscription.map(|s| s.id.to_string()),
            customer_id: customer.map(|c| c.id.to_string()),
            email: customer.and_then(|c| c.email.clone()),
            account_id: None,
            reconciled: false,
        };

        let paid = session.payment_status == stripe::CheckoutSessionPaymentStatus::Paid;

        let (subscription, customer) = match (paid, subscription, customer) {
            (true, Some(sub), Some(cus)) => (sub, cus),
            _ => {
                tracing::info!(
                    session_id = %session.id,
                    payment_status = %verification.payment_status,
                    "Session not ready to sync, skipping reconciliation"
                );
                return Ok(verification);
            }
        };

        let account_id = account_id_from_metadata(customer.metadata.as_ref())
            .or_else(|| {
                session
                    .client_reference_id
                    .as_deref()
                    .and_then(|id| Uuid::parse_str(id).ok())
            })
            .ok_or_else(|| {
                BillingError::NotFound(format!(
                    "No account resolvable for session {}",
                    session.id
                ))
            })?;

        let snapshot = SubscriptionSnapshot::from_subscription(subscription);
        self.reconcile(account_id, &snapshot).await?;
        verification.account_id = Some(account_id);
        verification.reconciled = true;

        tracing::info!(
            account_id = %account_id,
            session_id = %session.id,
            subscription_id = %snapshot.subscription_id,
            "Verified checkout session and synced entitlement"
        );

        Ok(verification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::PriceIds;

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
    fn test_plan_name_resolution() {
        let config = test_config();
        assert_eq!(plan_name_for_price(&config, Some("price_team_456")), "Team");
        assert_eq!(
            plan_name_for_price(&config, Some("price_starter_123")),
            "Starter"
        );
    }

    #[test]
    fn test_unknown_price_gets_sentinel_name() {
        let config = test_config();
        assert_eq!(
            plan_name_for_price(&config, Some("price_legacy_000")),
            "Unknown Plan"
        );
        assert_eq!(plan_name_for_price(&config, None), "Unknown Plan");
    }
}
