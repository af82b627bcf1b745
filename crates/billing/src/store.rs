//! Entitlement record persistence
//!
//! One row per Stripe subscription id. The upsert's ON CONFLICT clause is the
//! concurrency boundary: checkout completion, lifecycle webhooks, and manual
//! session verification all funnel through it, and the last writer wins.
//! Records are never hard-deleted; `canceled` is terminal and retained.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::snapshot::SubscriptionStatus;

/// A stored entitlement record, mirroring one Stripe subscription
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EntitlementRecord {
    pub id: Uuid,
    pub account_id: Uuid,
    pub stripe_customer_id: String,
    pub stripe_subscription_id: String,
    pub status: String,
    pub plan_id: Option<String>,
    pub plan_name: String,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub trial_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl EntitlementRecord {
    /// Whether this record grants paid access at `now`.
    ///
    /// Entitled statuses are trialing and active. A subscription set to cancel
    /// at period end keeps access until the period actually ends.
    pub fn grants_access(&self, now: OffsetDateTime) -> bool {
        let entitled_status = matches!(self.status.as_str(), "trialing" | "active");
        if !entitled_status {
            return false;
        }
        if self.cancel_at_period_end {
            now < self.current_period_end
        } else {
            true
        }
    }
}

/// Fields written by a reconciliation pass
#[derive(Debug, Clone)]
pub struct EntitlementUpsert {
    pub account_id: Uuid,
    pub stripe_customer_id: String,
    pub stripe_subscription_id: String,
    pub status: SubscriptionStatus,
    pub plan_id: Option<String>,
    pub plan_name: String,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub trial_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
}

/// Store for entitlement records
#[derive(Clone)]
pub struct EntitlementStore {
    pool: PgPool,
}

impl EntitlementStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert or update the record for a subscription.
    ///
    /// `account_id` is immutable: on conflict the existing owner is kept, so a
    /// racing write can never re-home a subscription to another account.
    pub async fn upsert(&self, record: &EntitlementUpsert) -> BillingResult<EntitlementRecord> {
        let saved: EntitlementRecord = sqlx::query_as(
            r#"
            INSERT INTO entitlements (
                account_id,
                stripe_customer_id,
                stripe_subscription_id,
                status,
                plan_id,
                plan_name,
                current_period_start,
                current_period_end,
                trial_start,
                trial_end,
                cancel_at_period_end
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (stripe_subscription_id) DO UPDATE SET
                stripe_customer_id = EXCLUDED.stripe_customer_id,
                status = EXCLUDED.status,
                plan_id = EXCLUDED.plan_id,
                plan_name = EXCLUDED.plan_name,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                trial_start = EXCLUDED.trial_start,
                trial_end = EXCLUDED.trial_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(record.account_id)
        .bind(&record.stripe_customer_id)
        .bind(&record.stripe_subscription_id)
        .bind(record.status.as_str())
        .bind(&record.plan_id)
        .bind(&record.plan_name)
        .bind(record.current_period_start)
        .bind(record.current_period_end)
        .bind(record.trial_start)
        .bind(record.trial_end)
        .bind(record.cancel_at_period_end)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            account_id = %saved.account_id,
            subscription_id = %saved.stripe_subscription_id,
            status = %saved.status,
            plan = %saved.plan_name,
            "Upserted entitlement record"
        );

        Ok(saved)
    }

    /// Mark a subscription canceled. Clears cancel_at_period_end since the
    /// cancellation has now happened. Skips quietly when the row is absent
    /// (deletion webhook may arrive before we ever stored the subscription).
    pub async fn mark_canceled(&self, subscription_id: &str) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE entitlements
            SET status = 'canceled', cancel_at_period_end = FALSE, updated_at = NOW()
            WHERE stripe_subscription_id = $1
            "#,
        )
        .bind(subscription_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::warn!(
                subscription_id = %subscription_id,
                "Cancellation for unknown subscription, skipping"
            );
        } else {
            tracing::info!(
                subscription_id = %subscription_id,
                "Marked entitlement canceled"
            );
        }

        Ok(())
    }

    /// Mark a subscription past_due after a failed payment. Only the status
    /// changes; period bounds stay as last synced. Absent rows are skipped.
    pub async fn mark_past_due(&self, subscription_id: &str) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE entitlements
            SET status = 'past_due', updated_at = NOW()
            WHERE stripe_subscription_id = $1
            "#,
        )
        .bind(subscription_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::warn!(
                subscription_id = %subscription_id,
                "Payment failure for unknown subscription, skipping"
            );
        } else {
            tracing::info!(
                subscription_id = %subscription_id,
                "Marked entitlement past_due"
            );
        }

        Ok(())
    }

    /// Look up the record for a Stripe subscription id
    pub async fn find_by_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<EntitlementRecord>> {
        let record: Option<EntitlementRecord> = sqlx::query_as(
            "SELECT * FROM entitlements WHERE stripe_subscription_id = $1",
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// All records for an account, newest first
    pub async fn list_for_account(
        &self,
        account_id: Uuid,
    ) -> BillingResult<Vec<EntitlementRecord>> {
        let records: Vec<EntitlementRecord> = sqlx::query_as(
            "SELECT * FROM entitlements WHERE account_id = $1 ORDER BY created_at DESC",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Whether the account currently has paid access.
    ///
    /// Computed from the records at call time, never stored, so a stale
    /// status cannot grant access past its period end.
    pub async fn has_paid_access(&self, account_id: Uuid) -> BillingResult<bool> {
        let records = self.list_for_account(account_id).await?;
        let now = OffsetDateTime::now_utc();
        Ok(records.iter().any(|r| r.grants_access(now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn record(status: &str, cancel_at_period_end: bool, period_end: OffsetDateTime) -> EntitlementRecord {
        let now = OffsetDateTime::now_utc();
        EntitlementRecord {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            stripe_customer_id: "cus_test".to_string(),
            stripe_subscription_id: "sub_test".to_string(),
            status: status.to_string(),
            plan_id: Some("price_team_456".to_string()),
            plan_name: "Team".to_string(),
            current_period_start: now - Duration::days(10),
            current_period_end: period_end,
            trial_start: None,
            trial_end: None,
            cancel_at_period_end,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_active_grants_access() {
        let now = OffsetDateTime::now_utc();
        let r = record("active", false, now + Duration::days(20));
        assert!(r.grants_access(now));
    }

    #[test]
    fn test_trialing_grants_access() {
        let now = OffsetDateTime::now_utc();
        let r = record("trialing", false, now + Duration::days(20));
        assert!(r.grants_access(now));
    }

    #[test]
    fn test_past_due_denies_access() {
        let now = OffsetDateTime::now_utc();
        let r = record("past_due", false, now + Duration::days(20));
        assert!(!r.grants_access(now));
    }

    #[test]
    fn test_canceled_denies_access() {
        let now = OffsetDateTime::now_utc();
        let r = record("canceled", false, now + Duration::days(20));
        assert!(!r.grants_access(now));
    }

    #[test]
    fn test_pending_cancellation_keeps_access_until_period_end() {
        let now = OffsetDateTime::now_utc();
        let r = record("active", true, now + Duration::days(5));
        assert!(r.grants_access(now));
    }

    #[test]
    fn test_pending_cancellation_loses_access_after_period_end() {
        let now = OffsetDateTime::now_utc();
        let r = record("active", true, now - Duration::hours(1));
        assert!(!r.grants_access(now));
    }

    #[test]
    fn test_unpaid_and_incomplete_deny_access() {
        let now = OffsetDateTime::now_utc();
        for status in ["unpaid", "incomplete", "incomplete_expired", "paused"] {
            let r = record(status, false, now + Duration::days(20));
            assert!(!r.grants_access(now), "{status} should not grant access");
        }
    }
}
