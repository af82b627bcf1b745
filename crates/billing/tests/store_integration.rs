//! Database-backed tests for the entitlement store and webhook event claims.
//!
//! These require a Postgres instance; run with:
//!   DATABASE_URL=postgres://... cargo test -p shiftwise-billing -- --ignored

#![allow(clippy::unwrap_used, clippy::expect_used)]

use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use shiftwise_billing::{
    EntitlementStore, EntitlementUpsert, EventClaims, SubscriptionStatus,
};

async fn test_pool() -> PgPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
    let pool = shiftwise_shared::create_pool(&url)
        .await
        .expect("Failed to create pool");
    shiftwise_shared::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");
    pool
}

fn upsert_for(account_id: Uuid, subscription_id: &str, status: SubscriptionStatus) -> EntitlementUpsert {
    let now = OffsetDateTime::now_utc();
    EntitlementUpsert {
        account_id,
        stripe_customer_id: format!("cus_{}", Uuid::new_v4().simple()),
        stripe_subscription_id: subscription_id.to_string(),
        status,
        plan_id: Some("price_team_456".to_string()),
        plan_name: "Team".to_string(),
        current_period_start: now - Duration::days(1),
        current_period_end: now + Duration::days(29),
        trial_start: None,
        trial_end: None,
        cancel_at_period_end: false,
    }
}

async fn row_count(pool: &PgPool, subscription_id: &str) -> i64 {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM entitlements WHERE stripe_subscription_id = $1")
            .bind(subscription_id)
            .fetch_one(pool)
            .await
            .unwrap();
    count
}

#[tokio::test]
#[ignore] // Requires database
async fn test_repeated_upsert_keeps_one_row() {
    let pool = test_pool().await;
    let store = EntitlementStore::new(pool.clone());

    let account_id = Uuid::new_v4();
    let subscription_id = format!("sub_{}", Uuid::new_v4().simple());

    store
        .upsert(&upsert_for(account_id, &subscription_id, SubscriptionStatus::Trialing))
        .await
        .unwrap();
    let updated = store
        .upsert(&upsert_for(account_id, &subscription_id, SubscriptionStatus::Active))
        .await
        .unwrap();

    assert_eq!(row_count(&pool, &subscription_id).await, 1);
    assert_eq!(updated.status, "active");
}

#[tokio::test]
#[ignore] // Requires database
async fn test_account_id_immutable_on_conflict() {
    let pool = test_pool().await;
    let store = EntitlementStore::new(pool.clone());

    let original_owner = Uuid::new_v4();
    let other_account = Uuid::new_v4();
    let subscription_id = format!("sub_{}", Uuid::new_v4().simple());

    store
        .upsert(&upsert_for(original_owner, &subscription_id, SubscriptionStatus::Active))
        .await
        .unwrap();

    // A racing write carrying a different account must not re-home the row
    let record = store
        .upsert(&upsert_for(other_account, &subscription_id, SubscriptionStatus::Active))
        .await
        .unwrap();

    assert_eq!(record.account_id, original_owner);
    assert_eq!(row_count(&pool, &subscription_id).await, 1);
}

#[tokio::test]
#[ignore] // Requires database
async fn test_mark_canceled_unknown_subscription_is_noop() {
    let pool = test_pool().await;
    let store = EntitlementStore::new(pool.clone());

    let subscription_id = format!("sub_{}", Uuid::new_v4().simple());
    store.mark_canceled(&subscription_id).await.unwrap();

    // No row was created by the no-op
    assert_eq!(row_count(&pool, &subscription_id).await, 0);
}

#[tokio::test]
#[ignore] // Requires database
async fn test_mark_past_due_unknown_subscription_is_noop() {
    let pool = test_pool().await;
    let store = EntitlementStore::new(pool.clone());

    let subscription_id = format!("sub_{}", Uuid::new_v4().simple());
    store.mark_past_due(&subscription_id).await.unwrap();

    assert_eq!(row_count(&pool, &subscription_id).await, 0);
}

#[tokio::test]
#[ignore] // Requires database
async fn test_cancellation_revokes_paid_access() {
    let pool = test_pool().await;
    let store = EntitlementStore::new(pool.clone());

    let account_id = Uuid::new_v4();
    let subscription_id = format!("sub_{}", Uuid::new_v4().simple());

    store
        .upsert(&upsert_for(account_id, &subscription_id, SubscriptionStatus::Active))
        .await
        .unwrap();
    assert!(store.has_paid_access(account_id).await.unwrap());

    store.mark_canceled(&subscription_id).await.unwrap();
    assert!(!store.has_paid_access(account_id).await.unwrap());

    // Canceled records are retained, not deleted
    assert_eq!(row_count(&pool, &subscription_id).await, 1);
}

#[tokio::test]
#[ignore] // Requires database
async fn test_failed_event_is_reclaimable_on_redelivery() {
    let pool = test_pool().await;
    let claims = EventClaims::new(pool);

    let event_id = format!("evt_{}", Uuid::new_v4().simple());
    let now = OffsetDateTime::now_utc();

    // First delivery claims the event, processing fails
    assert!(claims
        .claim(&event_id, "customer.subscription.updated", now)
        .await
        .unwrap());
    claims
        .complete(&event_id, "error", Some("database unavailable"))
        .await
        .unwrap();

    // The provider redelivers after our non-2xx; the retry must reprocess
    assert!(claims
        .claim(&event_id, "customer.subscription.updated", now)
        .await
        .unwrap());
    claims.complete(&event_id, "success", None).await.unwrap();

    // Once processed successfully, further deliveries are duplicates
    assert!(!claims
        .claim(&event_id, "customer.subscription.updated", now)
        .await
        .unwrap());
}

#[tokio::test]
#[ignore] // Requires database
async fn test_concurrent_delivery_is_not_reclaimable() {
    let pool = test_pool().await;
    let claims = EventClaims::new(pool);

    let event_id = format!("evt_{}", Uuid::new_v4().simple());
    let now = OffsetDateTime::now_utc();

    // First delivery holds the claim and has not finished
    assert!(claims
        .claim(&event_id, "invoice.payment_failed", now)
        .await
        .unwrap());

    // A concurrent delivery must not steal a live claim
    assert!(!claims
        .claim(&event_id, "invoice.payment_failed", now)
        .await
        .unwrap());
}
