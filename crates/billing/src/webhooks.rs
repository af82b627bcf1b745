//! Stripe webhook handling
//!
//! Verifies signatures over the raw request body, claims each event id
//! atomically so redelivered events are acknowledged without reprocessing,
//! and dispatches subscription lifecycle events into the reconciliation
//! engine.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use stripe::{Customer, Event, EventObject, EventType, Expandable, Invoice, Subscription, Webhook};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::customer::account_id_from_metadata;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::reconcile::ReconciliationEngine;
use crate::snapshot::SubscriptionSnapshot;

type HmacSha256 = Hmac<Sha256>;

/// How far a webhook timestamp may drift from our clock, in seconds
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Verify a Stripe signature header against the raw payload.
///
/// The header has the form `t=<unix-seconds>,v1=<hex hmac>`. The signed
/// payload is `"{t}.{raw body}"`, so the body must be the exact bytes Stripe
/// sent, before any JSON parsing.
fn verify_signature(
    payload: &str,
    signature_header: &str,
    secret: &str,
    now: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<String> = None;

    for part in signature_header.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0] {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1].to_string()),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or(BillingError::WebhookSignatureInvalid)?;
    let v1_signature = v1_signature.ok_or(BillingError::WebhookSignatureInvalid)?;

    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let secret_key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let signed_payload = format!("{}.{}", timestamp, payload);

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed != v1_signature {
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

/// Atomic per-event-id processing claims.
///
/// Backed by the `stripe_webhook_events` table: the unique constraint on
/// the event id makes concurrent deliveries race on one insert, and the
/// conflict predicate decides which existing rows may be taken over.
#[derive(Clone)]
pub struct EventClaims {
    pool: PgPool,
}

impl EventClaims {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Claim an event id for exclusive processing. Returns false when the
    /// event was already processed or is held by another worker.
    ///
    /// Rows whose previous attempt ended in `error` are re-claimable:
    /// the failed attempt returned non-2xx, so the provider redelivers,
    /// and that redelivery must actually reprocess. Rows stuck in
    /// `processing` past the timeout are also re-claimable so a crashed
    /// worker cannot wedge an event id.
    pub async fn claim(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
    ) -> BillingResult<bool> {
        const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = NULL
            WHERE stripe_webhook_events.processing_result = 'error'
               OR (stripe_webhook_events.processing_result = 'processing'
                   AND stripe_webhook_events.processing_started_at
                       < NOW() - ($4 || ' minutes')::INTERVAL)
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(event_timestamp)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }

    /// Record the outcome of a claimed event
    pub async fn complete(
        &self,
        event_id: &str,
        processing_result: &str,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(processing_result)
        .bind(error_message)
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Webhook handler for Stripe events
#[derive(Clone)]
pub struct WebhookHandler {
    stripe: StripeClient,
    claims: EventClaims,
    reconciler: ReconciliationEngine,
    event_logger: BillingEventLogger,
}

impl WebhookHandler {
    pub fn new(stripe: StripeClient, pool: PgPool, reconciler: ReconciliationEngine) -> Self {
        let event_logger = BillingEventLogger::new(pool.clone());
        let claims = EventClaims::new(pool);
        Self {
            stripe,
            claims,
            reconciler,
            event_logger,
        }
    }

    /// Verify and parse a Stripe webhook event.
    ///
    /// Tries the stripe crate's verifier first, then falls back to manual
    /// HMAC verification. The fallback exists because `construct_event`
    /// rejects payloads from Stripe API versions newer than the crate knows,
    /// even when the signature is fine.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        let webhook_secret = &self.stripe.config().webhook_secret;

        match Webhook::construct_event(payload, signature, webhook_secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::debug!(
                    stripe_error = %e,
                    "Standard webhook parsing failed, trying manual verification"
                );
            }
        }

        let now = OffsetDateTime::now_utc().unix_timestamp();
        verify_signature(payload, signature, webhook_secret, now)?;

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookSignatureInvalid
        })?;

        tracing::debug!(
            event_type = %event.type_,
            event_id = %event.id,
            "Manual webhook verification succeeded"
        );

        Ok(event)
    }

    /// Handle a verified Stripe event.
    ///
    /// Claims the event id atomically before processing. Two concurrent
    /// deliveries of the same event cannot both pass; the loser acknowledges
    /// without reprocessing. A failed attempt records `error` and returns the
    /// failure (so the provider redelivers), and that redelivery re-claims
    /// the row and processes again.
    pub async fn handle_event(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let event_type_str = event.type_.to_string();

        let event_timestamp = OffsetDateTime::from_unix_timestamp(event.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        if !self
            .claims
            .claim(&event_id, &event_type_str, event_timestamp)
            .await?
        {
            tracing::info!(
                event_id = %event_id,
                event_type = %event_type_str,
                "Duplicate webhook delivery, acknowledging without reprocessing"
            );
            return Ok(());
        }

        tracing::info!(
            event_type = %event.type_,
            event_id = %event.id,
            "Processing Stripe webhook event"
        );

        let result = self.process_event(&event).await;

        let (processing_result, error_message) = match &result {
            Ok(()) => ("success", None),
            Err(e) => ("error", Some(e.to_string())),
        };

        if let Err(e) = self
            .claims
            .complete(&event_id, processing_result, error_message.as_deref())
            .await
        {
            tracing::error!(
                event_id = %event_id,
                error = %e,
                "Failed to record webhook processing result"
            );
        }

        result
    }

    async fn process_event(&self, event: &Event) -> BillingResult<()> {
        match event.type_ {
            EventType::CheckoutSessionCompleted => {
                let session = match &event.data.object {
                    EventObject::CheckoutSession(session) => session,
                    _ => {
                        return Err(BillingError::Internal(
                            "Expected checkout session in event".to_string(),
                        ))
                    }
                };
                self.handle_checkout_completed(session.id.as_str(), &event.id)
                    .await
            }
            EventType::CustomerSubscriptionCreated => {
                let subscription = extract_subscription(event)?;
                self.handle_subscription_synced(
                    subscription,
                    &event.id,
                    BillingEventType::SubscriptionCreated,
                )
                .await
            }
            EventType::CustomerSubscriptionUpdated => {
                let subscription = extract_subscription(event)?;
                self.handle_subscription_synced(
                    subscription,
                    &event.id,
                    BillingEventType::SubscriptionUpdated,
                )
                .await
            }
            EventType::CustomerSubscriptionDeleted => {
                let subscription = extract_subscription(event)?;
                self.handle_subscription_deleted(subscription, &event.id).await
            }
            EventType::InvoicePaymentFailed => {
                let invoice = extract_invoice(event)?;
                self.handle_payment_failed(invoice, &event.id).await
            }
            _ => {
                tracing::debug!(
                    event_type = %event.type_,
                    event_id = %event.id,
                    "Ignoring unhandled webhook event type"
                );
                Ok(())
            }
        }
    }

    /// checkout.session.completed
    ///
    /// The event payload's session is not expanded, so the session is
    /// re-fetched with subscription and customer expanded and pushed through
    /// the same path as manual verification. A session with no resolvable
    /// account is logged and acknowledged; failing it would only make Stripe
    /// redeliver an event we can never process.
    async fn handle_checkout_completed(
        &self,
        session_id: &str,
        event_id: &stripe::EventId,
    ) -> BillingResult<()> {
        let verification = match self.reconciler.verify_session(session_id).await {
            Ok(v) => v,
            Err(BillingError::NotFound(reason)) => {
                tracing::warn!(
                    session_id = %session_id,
                    reason = %reason,
                    "Completed session has no resolvable account, acknowledging"
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if let Some(account_id) = verification.account_id {
            self.event_logger
                .log_event(
                    BillingEventBuilder::new(account_id, BillingEventType::CheckoutCompleted)
                        .stripe_event(event_id.as_str())
                        .stripe_subscription(verification.subscription_id.clone().unwrap_or_default())
                        .stripe_customer(verification.customer_id.clone().unwrap_or_default())
                        .actor_type(ActorType::Stripe)
                        .data(serde_json::json!({ "session_id": session_id })),
                )
                .await?;
        }

        Ok(())
    }

    /// customer.subscription.created / customer.subscription.updated
    async fn handle_subscription_synced(
        &self,
        subscription: &Subscription,
        event_id: &stripe::EventId,
        event_type: BillingEventType,
    ) -> BillingResult<()> {
        let account_id = match self.resolve_account(subscription).await? {
            Some(id) => id,
            None => {
                tracing::warn!(
                    subscription_id = %subscription.id,
                    "Subscription has no resolvable account, acknowledging"
                );
                return Ok(());
            }
        };

        let snapshot = SubscriptionSnapshot::from_subscription(subscription);
        let record = self.reconciler.reconcile(account_id, &snapshot).await?;

        self.event_logger
            .log_event(
                BillingEventBuilder::new(account_id, event_type)
                    .stripe_event(event_id.as_str())
                    .stripe_subscription(record.stripe_subscription_id.clone())
                    .stripe_customer(record.stripe_customer_id.clone())
                    .actor_type(ActorType::Stripe)
                    .data(serde_json::json!({
                        "status": record.status,
                        "plan": record.plan_name,
                        "cancel_at_period_end": record.cancel_at_period_end,
                    })),
            )
            .await?;

        Ok(())
    }

    /// customer.subscription.deleted
    ///
    /// Keyed on subscription id alone; no account resolution needed.
    async fn handle_subscription_deleted(
        &self,
        subscription: &Subscription,
        event_id: &stripe::EventId,
    ) -> BillingResult<()> {
        let subscription_id = subscription.id.to_string();
        let store = self.reconciler.store();

        let existing = store.find_by_subscription(&subscription_id).await?;
        store.mark_canceled(&subscription_id).await?;

        if let Some(record) = existing {
            self.event_logger
                .log_event(
                    BillingEventBuilder::new(record.account_id, BillingEventType::SubscriptionCanceled)
                        .stripe_event(event_id.as_str())
                        .stripe_subscription(subscription_id)
                        .stripe_customer(record.stripe_customer_id)
                        .actor_type(ActorType::Stripe),
                )
                .await?;
        }

        Ok(())
    }

    /// invoice.payment_failed
    async fn handle_payment_failed(
        &self,
        invoice: &Invoice,
        event_id: &stripe::EventId,
    ) -> BillingResult<()> {
        let subscription_id = match invoice.subscription.as_ref() {
            Some(Expandable::Id(id)) => id.to_string(),
            Some(Expandable::Object(sub)) => sub.id.to_string(),
            None => {
                // One-off invoice, nothing to mark
                tracing::debug!(
                    invoice_id = %invoice.id,
                    "Payment failure on invoice without subscription, ignoring"
                );
                return Ok(());
            }
        };

        let store = self.reconciler.store();
        let existing = store.find_by_subscription(&subscription_id).await?;
        store.mark_past_due(&subscription_id).await?;

        if let Some(record) = existing {
            self.event_logger
                .log_event(
                    BillingEventBuilder::new(record.account_id, BillingEventType::PaymentFailed)
                        .stripe_event(event_id.as_str())
                        .stripe_subscription(subscription_id)
                        .stripe_customer(record.stripe_customer_id)
                        .actor_type(ActorType::Stripe)
                        .data(serde_json::json!({ "invoice_id": invoice.id.to_string() })),
                )
                .await?;
        }

        Ok(())
    }

    /// Resolve the owning account for a subscription: its own metadata first,
    /// then the customer's metadata fetched from Stripe.
    async fn resolve_account(&self, subscription: &Subscription) -> BillingResult<Option<Uuid>> {
        if let Some(account_id) = account_id_from_metadata(Some(&subscription.metadata)) {
            return Ok(Some(account_id));
        }

        let customer_id = subscription.customer.id();
        let customer = Customer::retrieve(self.stripe.inner(), &customer_id, &[]).await?;

        Ok(account_id_from_metadata(customer.metadata.as_ref()))
    }
}

fn extract_subscription(event: &Event) -> BillingResult<&Subscription> {
    match &event.data.object {
        EventObject::Subscription(subscription) => Ok(subscription),
        _ => Err(BillingError::Internal(
            "Expected subscription in event".to_string(),
        )),
    }
}

fn extract_invoice(event: &Event) -> BillingResult<&Invoice> {
    match &event.data.object {
        EventObject::Invoice(invoice) => Ok(invoice),
        _ => Err(BillingError::Internal(
            "Expected invoice in event".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";

    fn sign(payload: &str, timestamp: i64) -> String {
        let signed_payload = format!("{}.{}", timestamp, payload);
        let mut mac = HmacSha256::new_from_slice(b"test_secret").unwrap();
        mac.update(signed_payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn test_valid_signature_accepted() {
        let payload = r#"{"id":"evt_123","type":"invoice.payment_failed"}"#;
        let timestamp = 1_700_000_000;
        let header = format!("t={},v1={}", timestamp, sign(payload, timestamp));

        assert!(verify_signature(payload, &header, SECRET, timestamp).is_ok());
    }

    #[test]
    fn test_signature_over_modified_payload_rejected() {
        let payload = r#"{"id":"evt_123"}"#;
        let timestamp = 1_700_000_000;
        let header = format!("t={},v1={}", timestamp, sign(payload, timestamp));

        let tampered = r#"{"id":"evt_456"}"#;
        let result = verify_signature(tampered, &header, SECRET, timestamp);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let payload = r#"{"id":"evt_123"}"#;
        let timestamp = 1_700_000_000;
        let header = format!("t={},v1={}", timestamp, sign(payload, timestamp));

        // 301 seconds later is past the tolerance window
        let result = verify_signature(payload, &header, SECRET, timestamp + 301);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));

        // 299 seconds later is still inside it
        assert!(verify_signature(payload, &header, SECRET, timestamp + 299).is_ok());
    }

    #[test]
    fn test_future_timestamp_rejected() {
        let payload = r#"{"id":"evt_123"}"#;
        let timestamp = 1_700_000_000;
        let header = format!("t={},v1={}", timestamp, sign(payload, timestamp));

        let result = verify_signature(payload, &header, SECRET, timestamp - 301);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn test_malformed_header_rejected() {
        let payload = r#"{"id":"evt_123"}"#;
        for header in ["", "t=abc,v1=def", "v1=deadbeef", "t=1700000000"] {
            let result = verify_signature(payload, header, SECRET, 1_700_000_000);
            assert!(
                matches!(result, Err(BillingError::WebhookSignatureInvalid)),
                "header {header:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let payload = r#"{"id":"evt_123"}"#;
        let timestamp = 1_700_000_000;
        let header = format!("t={},v1={}", timestamp, sign(payload, timestamp));

        let result = verify_signature(payload, &header, "whsec_other_secret", timestamp);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }
}
