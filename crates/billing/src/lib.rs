//! Shiftwise Billing
//!
//! Keeps entitlement records consistent with Stripe across three racing
//! write paths: checkout completion webhooks, subscription lifecycle
//! webhooks, and client-triggered session verification. All three converge
//! on a single idempotent upsert keyed by subscription id.

pub mod checkout;
pub mod client;
pub mod customer;
pub mod error;
pub mod events;
pub mod reconcile;
pub mod snapshot;
pub mod store;
pub mod webhooks;

pub use checkout::CheckoutService;
pub use client::{StripeClient, StripeConfig};
pub use customer::CustomerService;
pub use error::{BillingError, BillingResult};
pub use events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
pub use reconcile::{ReconciliationEngine, SessionVerification};
pub use snapshot::{SubscriptionSnapshot, SubscriptionStatus};
pub use store::{EntitlementRecord, EntitlementStore, EntitlementUpsert};
pub use webhooks::{EventClaims, WebhookHandler};
