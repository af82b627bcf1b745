//! API routes

pub mod billing;
pub mod health;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Billing routes. The webhook is public and relies on signature
    // verification instead of auth; the rest are called by the app backend.
    let billing_routes = Router::new()
        .route("/billing/checkout", post(billing::create_checkout))
        .route("/billing/webhook", post(billing::webhook))
        .route("/billing/session", get(billing::get_session))
        .route("/billing/entitlement", get(billing::get_entitlement));

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", billing_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        // Stripe event payloads are small; anything near this limit is noise
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .with_state(state)
}
