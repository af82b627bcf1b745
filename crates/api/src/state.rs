//! Shared application state

use sqlx::PgPool;
use std::sync::Arc;

use shiftwise_billing::{
    CheckoutService, EntitlementStore, ReconciliationEngine, StripeClient, WebhookHandler,
};

use crate::config::Config;

/// Application state shared across all request handlers
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub checkout: Arc<CheckoutService>,
    pub reconciler: Arc<ReconciliationEngine>,
    pub webhooks: Arc<WebhookHandler>,
    pub store: Arc<EntitlementStore>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config, stripe: StripeClient) -> Self {
        let store = EntitlementStore::new(pool.clone());
        let checkout = CheckoutService::new(stripe.clone());
        let reconciler = ReconciliationEngine::new(stripe.clone(), store.clone());
        let webhooks = WebhookHandler::new(stripe, pool.clone(), reconciler.clone());

        Self {
            pool,
            config: Arc::new(config),
            checkout: Arc::new(checkout),
            reconciler: Arc::new(reconciler),
            webhooks: Arc::new(webhooks),
            store: Arc::new(store),
        }
    }
}
