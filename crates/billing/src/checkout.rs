//! Stripe Checkout sessions

use stripe::{
    CheckoutSession, CheckoutSessionId, CheckoutSessionMode, CreateCheckoutSession,
    CreateCheckoutSessionLineItems, CreateCheckoutSessionSubscriptionData, RequestStrategy,
};
use uuid::Uuid;

use shiftwise_shared::PlanKey;

use crate::client::StripeClient;
use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};

/// Longest trial we offer on any plan, in days
pub const MAX_TRIAL_DAYS: u32 = 30;

/// Clamp a requested trial length into the allowed range. Out-of-range
/// requests are adjusted silently rather than rejected.
pub(crate) fn clamp_trial_days(requested: u32) -> u32 {
    requested.min(MAX_TRIAL_DAYS)
}

/// Idempotency key for checkout-session creation. Stable across retries of
/// the same request, so a double-submitted form yields one Stripe session.
pub(crate) fn checkout_idempotency_key(account_id: Uuid, plan: PlanKey, trial_days: u32) -> String {
    format!("checkout:{}:{}:{}", account_id, plan.as_str(), trial_days)
}

/// Checkout service for creating Stripe checkout sessions
#[derive(Clone)]
pub struct CheckoutService {
    stripe: StripeClient,
    customers: CustomerService,
}

impl CheckoutService {
    pub fn new(stripe: StripeClient) -> Self {
        let customers = CustomerService::new(stripe.clone());
        Self { stripe, customers }
    }

    /// Start a subscription checkout and return the hosted redirect URL.
    ///
    /// The account id rides along in three places: customer metadata, session
    /// metadata, and `client_reference_id`. The completed-session webhook
    /// resolves the account from customer metadata first and falls back to
    /// the reference id.
    pub async fn start_checkout(
        &self,
        account_id: Uuid,
        account_email: &str,
        plan: PlanKey,
        trial_days: u32,
    ) -> BillingResult<String> {
        if account_email.trim().is_empty() {
            return Err(BillingError::InvalidInput(
                "account email is required".to_string(),
            ));
        }

        let trial_days = clamp_trial_days(trial_days);

        let customer = self.customers.find_or_create(account_id, account_email).await?;

        let price_id = self.stripe.config().price_id_for_plan(plan).to_string();

        let base_url = &self.stripe.config().app_base_url;
        let success_url = format!(
            "{}/billing/success?session_id={{CHECKOUT_SESSION_ID}}",
            base_url
        );
        let cancel_url = format!("{}/billing/cancel", base_url);

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("account_id".to_string(), account_id.to_string());
        metadata.insert("plan_key".to_string(), plan.as_str().to_string());

        let account_reference = account_id.to_string();

        let subscription_data = if trial_days > 0 {
            Some(CreateCheckoutSessionSubscriptionData {
                trial_period_days: Some(trial_days),
                ..Default::default()
            })
        } else {
            None
        };

        let params = CreateCheckoutSession {
            customer: Some(customer.id.clone()),
            mode: Some(CheckoutSessionMode::Subscription),
            line_items: Some(vec![CreateCheckoutSessionLineItems {
                price: Some(price_id),
                quantity: Some(1),
                ..Default::default()
            }]),
            success_url: Some(&success_url),
            cancel_url: Some(&cancel_url),
            metadata: Some(metadata),
            client_reference_id: Some(&account_reference),
            subscription_data,
            allow_promotion_codes: Some(true),
            ..Default::default()
        };

        // Idempotent create: retries of the same (account, plan, trial) tuple
        // return the session Stripe already made
        let idempotency_key = checkout_idempotency_key(account_id, plan, trial_days);
        let client = self
            .stripe
            .inner()
            .clone()
            .with_strategy(RequestStrategy::Idempotent(idempotency_key));

        let session = CheckoutSession::create(&client, params).await?;

        tracing::info!(
            account_id = %account_id,
            session_id = %session.id,
            plan = %plan,
            trial_days = trial_days,
            "Created checkout session"
        );

        session
            .url
            .ok_or_else(|| BillingError::StripeApi("No checkout URL returned".to_string()))
    }

    /// Retrieve a checkout session with its subscription and customer expanded
    pub async fn get_session(&self, session_id: &str) -> BillingResult<CheckoutSession> {
        let session_id = session_id
            .parse::<CheckoutSessionId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid session ID: {}", e)))?;

        let session = CheckoutSession::retrieve(
            self.stripe.inner(),
            &session_id,
            &["subscription", "customer"],
        )
        .await?;

        Ok(session)
    }
}
